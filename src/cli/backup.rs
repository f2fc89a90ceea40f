//! Backup command implementation.

use crate::backup::BackupOrchestrator;
use crate::config::Schedule;
use crate::context::CoreContext;
use crate::store::LocalBlobStore;
use crate::Result;
use clap::Args;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Which file list to back up
    #[arg(value_enum)]
    pub schedule: Schedule,

    /// Archive symlink targets instead of the links (zip always does)
    #[arg(short = 'L', long)]
    pub follow_symlinks: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the backup command
pub fn run(args: BackupArgs, ctx: &CoreContext) -> Result<()> {
    let store = LocalBlobStore::new(&ctx.config().storage.root);
    let report = BackupOrchestrator::new(ctx, &store).run(args.schedule, args.follow_symlinks)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Backup completed successfully!");
    println!("  Run ID: {}", report.run_id);
    println!("  Archive: {}", report.archive_name);
    println!("  Object: {}", report.object_key);
    println!("  Manifest: {}", report.manifest_key);
    println!("  Encrypted: {}", report.encrypted);
    println!(
        "  Entries: {} archived, {} skipped",
        report.entries_added, report.entries_skipped
    );
    if report.local_copy_deleted {
        println!("  Local copy deleted");
    }

    Ok(())
}
