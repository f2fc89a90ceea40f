//! Decrypt command implementation.

use crate::cipher::decrypt_file;
use crate::context::CoreContext;
use crate::{Error, Result};
use clap::Args;
use std::path::PathBuf;

/// Arguments for the decrypt command
#[derive(Args)]
pub struct DecryptArgs {
    /// Encrypted archive
    pub input: PathBuf,

    /// Where to write the plaintext
    pub output: PathBuf,
}

/// Run the decrypt command
pub fn run(args: DecryptArgs, ctx: &CoreContext) -> Result<()> {
    let key = ctx.require_key()?;

    if !decrypt_file(key, &args.input, &args.output, ctx.config().backup.chunk_size) {
        return Err(Error::DecryptionFailed { path: args.input });
    }

    println!("Decrypted {} to {}", args.input.display(), args.output.display());
    Ok(())
}
