//! Verify command implementation.

use crate::context::CoreContext;
use crate::manifest::HashManifest;
use crate::{Error, Result};
use clap::Args;
use std::path::PathBuf;

/// Arguments for the verify command
#[derive(Args)]
pub struct VerifyArgs {
    /// Hash manifest to check
    pub manifest: PathBuf,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the verify command
pub fn run(args: VerifyArgs, ctx: &CoreContext) -> Result<()> {
    let manifest = HashManifest::open(&args.manifest, ctx.config().backup.hash_algorithm);
    let report = manifest.verify()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Manifest: {} ({})",
            args.manifest.display(),
            manifest.algorithm()
        );
        println!("  Verified: {}", report.verified.len());
        for path in &report.mismatched {
            println!("  Changed: {}", path.display());
        }
        for path in &report.missing {
            println!("  Missing: {}", path.display());
        }
    }

    if !report.is_clean() {
        return Err(Error::VerificationFailed {
            mismatched: report.mismatched.len(),
            missing: report.missing.len(),
        });
    }
    Ok(())
}
