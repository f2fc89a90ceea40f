//! Append-only hash manifests recording what went into each archive
//!
//! A manifest lives at `<hash dir>/<archive base name>.hash` and holds one
//! `"<path>\t<hex digest>\n"` line per archived file, in the order the files
//! were archived. It is only ever appended to.

use crate::hash::{hash_file, ContentHash, HashAlgorithm};
use crate::{Error, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File extension of manifest files and of their uploaded objects
pub const MANIFEST_EXTENSION: &str = "hash";

/// One manifest line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashRecord {
    pub path: PathBuf,
    pub hash: ContentHash,
    pub algorithm: HashAlgorithm,
}

impl HashRecord {
    fn to_line(&self) -> String {
        format!("{}\t{}\n", self.path.display(), self.hash)
    }

    fn parse_line(line: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let (path, hash) = line.rsplit_once('\t').ok_or_else(|| Error::InvalidManifest {
            reason: format!("missing tab separator in line '{}'", line),
        })?;

        Ok(Self {
            path: PathBuf::from(path),
            hash: ContentHash::parse(hash, algorithm)?,
            algorithm,
        })
    }
}

/// Outcome of re-hashing every file a manifest names
#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub verified: Vec<PathBuf>,
    pub mismatched: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Handle on a single manifest file
#[derive(Debug, Clone)]
pub struct HashManifest {
    path: PathBuf,
    algorithm: HashAlgorithm,
}

impl HashManifest {
    /// Manifest for the archive called `archive_name`, kept in `hash_dir`
    pub fn for_archive<P: AsRef<Path>>(
        hash_dir: P,
        archive_name: &str,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self::open(manifest_path(hash_dir, archive_name), algorithm)
    }

    /// Manifest at an explicit path
    pub fn open<P: AsRef<Path>>(path: P, algorithm: HashAlgorithm) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            algorithm,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash `file_path` and append its record
    ///
    /// The file is hashed before the manifest is opened, so a read error
    /// leaves the manifest untouched.
    pub fn record_hash<P: AsRef<Path>>(&self, file_path: P) -> Result<HashRecord> {
        let file_path = file_path.as_ref();
        let record = HashRecord {
            path: file_path.to_path_buf(),
            hash: hash_file(file_path, self.algorithm)?,
            algorithm: self.algorithm,
        };

        let mut manifest = self.open_for_append()?;
        manifest.write_all(record.to_line().as_bytes())?;
        debug!("Recorded {} for {}", record.hash, file_path.display());

        Ok(record)
    }

    /// Append a record for every regular file under `dir`
    pub fn record_hashes_for_tree<P: AsRef<Path>>(
        &self,
        dir: P,
        follow_links: bool,
    ) -> Result<Vec<HashRecord>> {
        let mut records = Vec::new();
        for file_path in regular_files(dir.as_ref(), follow_links) {
            records.push(self.record_hash(file_path?)?);
        }
        Ok(records)
    }

    /// Read back every record, in the order they were written
    pub fn records(&self) -> Result<Vec<HashRecord>> {
        let file = File::open(&self.path).map_err(|source| Error::ReadFailed {
            path: self.path.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            records.push(HashRecord::parse_line(&line, self.algorithm)?);
        }
        Ok(records)
    }

    /// Re-hash every recorded file and compare with the manifest
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        for record in self.records()? {
            if !record.path.exists() {
                warn!("{} listed in manifest no longer exists", record.path.display());
                report.missing.push(record.path);
                continue;
            }

            let current = hash_file(&record.path, self.algorithm)?;
            if current == record.hash {
                report.verified.push(record.path);
            } else {
                warn!(
                    "Hash mismatch for {}: recorded {}, found {}",
                    record.path.display(),
                    record.hash,
                    current
                );
                report.mismatched.push(record.path);
            }
        }

        Ok(report)
    }

    fn open_for_append(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?)
    }
}

/// `<hash dir>/<basename(archive_name)>.hash`
pub fn manifest_path<P: AsRef<Path>>(hash_dir: P, archive_name: &str) -> PathBuf {
    let base = Path::new(archive_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| archive_name.to_string());

    hash_dir
        .as_ref()
        .join(format!("{}.{}", base, MANIFEST_EXTENSION))
}

/// Lazily walk `dir`, yielding regular files in a stable order
pub fn regular_files(dir: &Path, follow_links: bool) -> impl Iterator<Item = Result<PathBuf>> {
    WalkDir::new(dir)
        .follow_links(follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
            Ok(_) => None,
            Err(e) => Some(Err(Error::from(e))),
        })
}
