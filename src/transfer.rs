//! Ad-hoc uploads of single files or whole file lists
//!
//! Objects land under `<machine>/<YYYYMMDD>/`. A single file keeps only its
//! base name; files from a list keep their full path (minus the root) so
//! they can be put back where they came from.

use crate::backup::read_file_list;
use crate::hash::{hash_file, ContentHash, HashAlgorithm};
use crate::manifest::regular_files;
use crate::store::{dated_key, BlobStore, ObjectMetadata, META_HASH};
use crate::{Error, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{error, info, span, Level};

/// One object written by the uploader
#[derive(Debug, Clone, Serialize)]
pub struct UploadedObject {
    pub source: PathBuf,
    pub key: String,
    pub bytes: u64,
    pub hash: ContentHash,
}

#[derive(Debug, Default, Serialize)]
pub struct TransferReport {
    pub uploaded: Vec<UploadedObject>,
    /// Listed paths that did not exist
    pub skipped: Vec<PathBuf>,
}

impl TransferReport {
    pub fn total_bytes(&self) -> u64 {
        self.uploaded.iter().map(|object| object.bytes).sum()
    }
}

pub struct Uploader<'a> {
    store: &'a dyn BlobStore,
    machine: String,
    algorithm: HashAlgorithm,
    date: NaiveDate,
}

impl<'a> Uploader<'a> {
    pub fn new(store: &'a dyn BlobStore, machine: &str, algorithm: HashAlgorithm) -> Self {
        Self {
            store,
            machine: machine.to_string(),
            algorithm,
            date: Utc::now().date_naive(),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }

    /// Upload one file as `<machine>/<YYYYMMDD>/<file name>`
    pub fn put_file<P: AsRef<Path>>(&self, path: P) -> Result<UploadedObject> {
        let path = path.as_ref();
        let name = path.file_name().ok_or_else(|| Error::Store {
            key: path.display().to_string(),
            reason: "path has no file name".to_string(),
        })?;

        self.upload(path, dated_key(&self.machine, self.date, name))
    }

    /// Upload every path named in the list file at `list_path`
    ///
    /// Missing entries are logged and skipped. Directories are uploaded
    /// file by file.
    pub fn put_list<P: AsRef<Path>>(&self, list_path: P) -> Result<TransferReport> {
        let entries = read_file_list(list_path.as_ref())?;
        self.put_paths(&entries)
    }

    pub fn put_paths<S: AsRef<str>>(&self, entries: &[S]) -> Result<TransferReport> {
        let span = span!(Level::INFO, "put_list", machine = %self.machine);
        let _enter = span.enter();

        let mut report = TransferReport::default();
        for entry in entries {
            let path = PathBuf::from(entry.as_ref().trim());
            if path.as_os_str().is_empty() {
                continue;
            }

            if !path.exists() {
                error!("{} does not exist.", path.display());
                report.skipped.push(path);
                continue;
            }

            if path.is_dir() {
                for file in regular_files(&path, true) {
                    let file = file?;
                    let key = dated_key(&self.machine, self.date, &file);
                    report.uploaded.push(self.upload(&file, key)?);
                }
            } else {
                let key = dated_key(&self.machine, self.date, &path);
                report.uploaded.push(self.upload(&path, key)?);
            }
        }

        info!(
            "Uploaded {} objects ({} bytes), skipped {}",
            report.uploaded.len(),
            report.total_bytes(),
            report.skipped.len()
        );
        Ok(report)
    }

    fn upload(&self, path: &Path, key: String) -> Result<UploadedObject> {
        let hash = hash_file(path, self.algorithm)?;
        let metadata = ObjectMetadata::new().with(META_HASH, hash.as_str());

        let file = File::open(path).map_err(|source| Error::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let bytes = self.store.put(&key, &mut BufReader::new(file), &metadata)?;
        info!("Uploaded {} to {}", path.display(), key);

        Ok(UploadedObject {
            source: path.to_path_buf(),
            key,
            bytes,
            hash,
        })
    }
}
