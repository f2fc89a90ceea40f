//! Command-line interface for bakvault.
//!
//! Every command reads the same TOML configuration file; `backup` is what a
//! scheduler (cron, systemd timer) invokes.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod backup;
pub mod decrypt;
pub mod put;
pub mod verify;

/// bakvault - scheduled archive, encrypt and upload
#[derive(Parser)]
#[command(name = "bakvault")]
#[command(about = "Archive configured file lists, encrypt them and upload them to an object store")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "bakvault.toml")]
    pub config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a scheduled backup
    Backup(backup::BackupArgs),
    /// Upload a file, or every path in a file list
    Put(put::PutArgs),
    /// Decrypt an encrypted archive
    Decrypt(decrypt::DecryptArgs),
    /// Check files against a hash manifest
    Verify(verify::VerifyArgs),
}
