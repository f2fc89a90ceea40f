//! # bakvault
//!
//! Scheduled backups of configured file lists into single archives.
//!
//! ## Features
//!
//! - **Archives**: tar, tar.gz, tar.bz2 or zip, verified after writing
//! - **Hash manifests**: append-only `<path>\t<digest>` ledger per archive
//! - **Encryption**: chunked AES-256-CBC with a size header and random IV
//! - **Upload**: archive and manifest handed to a pluggable blob store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bakvault::{initialize, BackupOrchestrator, Config, LocalBlobStore, Schedule};
//!
//! # fn main() -> bakvault::Result<()> {
//! let ctx = initialize(Config::load("bakvault.toml")?)?;
//! let store = LocalBlobStore::new(&ctx.config().storage.root);
//!
//! let report = BackupOrchestrator::new(&ctx, &store).run(Schedule::Daily, false)?;
//! println!("Uploaded {}", report.object_key);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backup;
pub mod cipher;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod logging;
pub mod manifest;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use archive::{ArchiveBuilder, ArchiveObserver, ContainerKind, TracingObserver};
pub use backup::{BackupOrchestrator, BackupReport, Stage};
pub use cipher::{decrypt_file, encrypt_file, BackupKey};
pub use config::{Config, Schedule};
pub use context::{initialize, CoreContext};
pub use error::{Error, Result};
pub use hash::{ContentHash, HashAlgorithm};
pub use manifest::HashManifest;
pub use store::{BlobStore, LocalBlobStore, ObjectMetadata};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
