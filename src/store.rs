//! Object store seam and the key scheme used for uploads
//!
//! Keys look like `<machine>/<schedule>/<YYYYMMDD><ext>` for archives and
//! `<machine>/<YYYYMMDD>/<path>` for individually uploaded files.

use crate::config::Schedule;
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Metadata field holding the uploaded artifact's hash
pub const META_HASH: &str = "hash";
/// Metadata field saying whether the artifact is encrypted (`True`/`False`)
pub const META_ENCRYPTED: &str = "enc";

/// Suffix of the sidecar file `LocalBlobStore` keeps metadata in
const META_SUFFIX: &str = ".meta.json";

/// String metadata attached to an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata(BTreeMap<String, String>);

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Rendering of the `enc` metadata flag
pub fn encrypted_flag(encrypted: bool) -> &'static str {
    if encrypted {
        "True"
    } else {
        "False"
    }
}

/// Destination for finished artifacts
pub trait BlobStore {
    /// Store everything `body` yields under `key`, returning the byte count
    fn put(&self, key: &str, body: &mut dyn Read, metadata: &ObjectMetadata) -> Result<u64>;
}

/// `<machine>/<schedule>/<YYYYMMDD><suffix>`
pub fn archive_key(machine: &str, schedule: Schedule, date: NaiveDate, suffix: &str) -> String {
    format!("{}/{}/{}{}", machine, schedule, date.format("%Y%m%d"), suffix)
}

/// `<machine>/<YYYYMMDD>/<relative path>`
pub fn dated_key<P: AsRef<Path>>(machine: &str, date: NaiveDate, path: P) -> String {
    let relative: Vec<String> = path
        .as_ref()
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    format!("{}/{}/{}", machine, date.format("%Y%m%d"), relative.join("/"))
}

/// Object store backed by a local directory
///
/// Each object lands at `<root>/<key>` with its metadata next to it in
/// `<root>/<key>.meta.json`. Objects are written to a temporary file and
/// renamed into place, so a reader never sees a partial object.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Filesystem location of `key`
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !valid {
            return Err(Error::Store {
                key: key.to_string(),
                reason: "keys must be non-empty relative paths without '..'".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }

    /// Metadata stored alongside `key`
    pub fn metadata(&self, key: &str) -> Result<ObjectMetadata> {
        let path = sidecar_path(&self.object_path(key)?);
        let content = fs::read_to_string(&path).map_err(|source| Error::ReadFailed { path, source })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_atomically(&self, target: &Path, body: &mut dyn Read) -> io::Result<u64> {
        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let staged = NamedTempFile::new_in(parent)?;
        let written = {
            let mut writer = BufWriter::new(staged.as_file());
            let written = io::copy(body, &mut writer)?;
            writer.flush()?;
            written
        };
        staged.as_file().sync_all()?;
        staged.persist(target).map_err(|e| e.error)?;
        Ok(written)
    }
}

fn sidecar_path(object: &Path) -> PathBuf {
    let mut name = object.as_os_str().to_os_string();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

impl BlobStore for LocalBlobStore {
    fn put(&self, key: &str, body: &mut dyn Read, metadata: &ObjectMetadata) -> Result<u64> {
        let target = self.object_path(key)?;
        let store_error = |e: io::Error| Error::Store {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let written = self.write_atomically(&target, body).map_err(store_error)?;

        let sidecar = serde_json::to_vec_pretty(metadata)?;
        self.write_atomically(&sidecar_path(&target), &mut sidecar.as_slice())
            .map_err(store_error)?;

        debug!("Stored {} ({} bytes) at {}", key, written, target.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()
    }

    #[test]
    fn test_archive_key_scheme() {
        assert_eq!(
            archive_key("host", Schedule::Weekly, date(), ".tar.gz"),
            "host/weekly/20231231.tar.gz"
        );
        assert_eq!(
            archive_key("host", Schedule::Daily, date(), ".hash"),
            "host/daily/20231231.hash"
        );
    }

    #[test]
    fn test_dated_key_strips_root() {
        assert_eq!(
            dated_key("host", date(), "/etc/hosts"),
            "host/20231231/etc/hosts"
        );
        assert_eq!(dated_key("host", date(), "notes.txt"), "host/20231231/notes.txt");
    }

    #[test]
    fn test_local_store_writes_object_and_metadata() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = LocalBlobStore::new(temp_dir.path());
        let metadata = ObjectMetadata::new()
            .with(META_HASH, "abc123")
            .with(META_ENCRYPTED, encrypted_flag(false));

        let written = store.put("host/daily/20231231.tar", &mut &b"archive"[..], &metadata)?;
        assert_eq!(written, 7);

        let object = temp_dir.path().join("host/daily/20231231.tar");
        assert_eq!(fs::read(&object)?, b"archive");

        let stored = store.metadata("host/daily/20231231.tar")?;
        assert_eq!(stored, metadata);
        assert_eq!(stored.get(META_ENCRYPTED), Some("False"));
        Ok(())
    }

    #[test]
    fn test_local_store_overwrites() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = LocalBlobStore::new(temp_dir.path());
        let metadata = ObjectMetadata::new();

        store.put("k", &mut &b"first"[..], &metadata)?;
        store.put("k", &mut &b"second"[..], &metadata)?;
        assert_eq!(fs::read(temp_dir.path().join("k"))?, b"second");
        Ok(())
    }

    #[test]
    fn test_local_store_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path());

        for key in ["", "../outside", "/absolute", "a/../../b"] {
            let result = store.put(key, &mut &b"x"[..], &ObjectMetadata::new());
            assert!(matches!(result, Err(Error::Store { .. })), "{}", key);
        }
    }
}
