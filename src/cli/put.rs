//! Put command implementation.

use crate::context::CoreContext;
use crate::store::LocalBlobStore;
use crate::transfer::Uploader;
use crate::Result;
use clap::Args;
use std::path::PathBuf;

/// Arguments for the put command
#[derive(Args)]
pub struct PutArgs {
    /// File to upload, or a file list with --list
    pub path: PathBuf,

    /// Treat PATH as a list of paths, one per line
    #[arg(short, long)]
    pub list: bool,
}

/// Run the put command
pub fn run(args: PutArgs, ctx: &CoreContext) -> Result<()> {
    let config = ctx.config();
    let store = LocalBlobStore::new(&config.storage.root);
    let uploader = Uploader::new(
        &store,
        &config.storage.machine_name,
        config.backup.hash_algorithm,
    );

    if !args.list {
        let object = uploader.put_file(&args.path)?;
        println!(
            "Uploaded {} as {} ({} bytes)",
            object.source.display(),
            object.key,
            object.bytes
        );
        return Ok(());
    }

    let report = uploader.put_list(&args.path)?;
    for object in &report.uploaded {
        println!("  {} -> {}", object.source.display(), object.key);
    }
    println!(
        "Uploaded {} files ({} bytes), {} missing",
        report.uploaded.len(),
        report.total_bytes(),
        report.skipped.len()
    );

    Ok(())
}
