//! Backup orchestration
//!
//! A run moves through `CollectFiles -> BuildArchive -> [EncryptArchive] ->
//! Upload -> [DeleteLocalCopy] -> Done`. Any error ends the run and comes
//! back as [`Error::Pipeline`] naming the stage that failed.

use crate::archive::{ArchiveBuilder, ArchiveObserver, BuiltArchive, ContainerKind, TracingObserver};
use crate::cipher::{encrypt_file, BackupKey};
use crate::config::Schedule;
use crate::context::CoreContext;
use crate::hash::{hash_file, ContentHash};
use crate::manifest::MANIFEST_EXTENSION;
use crate::store::{archive_key, encrypted_flag, BlobStore, ObjectMetadata, META_ENCRYPTED, META_HASH};
use crate::{Error, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};
use uuid::Uuid;

/// Steps of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CollectFiles,
    BuildArchive,
    EncryptArchive,
    Upload,
    DeleteLocalCopy,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CollectFiles => "collect files",
            Stage::BuildArchive => "build archive",
            Stage::EncryptArchive => "encrypt archive",
            Stage::Upload => "upload",
            Stage::DeleteLocalCopy => "delete local copy",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub run_id: Uuid,
    pub schedule: Schedule,
    pub date: NaiveDate,
    pub archive_name: String,
    pub object_key: String,
    pub manifest_key: String,
    pub encrypted: bool,
    /// Hash of the uploaded artifact (the ciphertext when encrypting)
    pub artifact_hash: ContentHash,
    pub entries_added: usize,
    pub entries_skipped: usize,
    pub local_copy_deleted: bool,
}

/// Read a file list: one path per line, blank lines dropped
pub fn read_file_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| Error::FileList {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub struct BackupOrchestrator<'a> {
    ctx: &'a CoreContext,
    store: &'a dyn BlobStore,
    date: NaiveDate,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(ctx: &'a CoreContext, store: &'a dyn BlobStore) -> Self {
        Self {
            ctx,
            store,
            date: Utc::now().date_naive(),
        }
    }

    /// Use `date` instead of today's UTC date for naming
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }

    pub fn run(&self, schedule: Schedule, follow_symlinks: bool) -> Result<BackupReport> {
        self.run_observed(schedule, follow_symlinks, &mut TracingObserver)
    }

    pub fn run_observed(
        &self,
        schedule: Schedule,
        follow_symlinks: bool,
        observer: &mut dyn ArchiveObserver,
    ) -> Result<BackupReport> {
        let run_id = Uuid::new_v4();
        let span = span!(Level::INFO, "backup_run", schedule = %schedule, run = %run_id);
        let _enter = span.enter();

        let config = self.ctx.config();
        info!("Starting {} backup for {}", schedule, config.storage.machine_name);

        debug!("Stage: {}", Stage::CollectFiles);
        let files =
            read_file_list(config.file_list_for(schedule)).map_err(|e| e.at(Stage::CollectFiles))?;

        debug!("Stage: {}", Stage::BuildArchive);
        let archive = self
            .build_archive(&files, follow_symlinks, observer)
            .map_err(|e| e.at(Stage::BuildArchive))?;

        let artifact = if self.ctx.encrypts() {
            debug!("Stage: {}", Stage::EncryptArchive);
            self.ctx
                .require_key()
                .and_then(|key| self.encrypt_archive(key, &archive.path))
                .map_err(|e| e.at(Stage::EncryptArchive))?
        } else {
            archive.path.clone()
        };

        debug!("Stage: {}", Stage::Upload);
        let uploaded = self
            .upload(schedule, &archive, &artifact)
            .map_err(|e| e.at(Stage::Upload))?;

        let local_copy_deleted = if config.backup.delete_archive {
            debug!("Stage: {}", Stage::DeleteLocalCopy);
            self.delete_local_copy().map_err(|e| e.at(Stage::DeleteLocalCopy))?;
            true
        } else {
            false
        };

        info!(
            "Backup {} finished: {} entries archived, {} skipped",
            archive.name,
            archive.added.len(),
            archive.skipped.len()
        );
        debug!("Stage: {}", Stage::Done);

        Ok(BackupReport {
            run_id,
            schedule,
            date: self.date,
            archive_name: archive.name,
            object_key: uploaded.object_key,
            manifest_key: uploaded.manifest_key,
            encrypted: self.ctx.encrypts(),
            artifact_hash: uploaded.artifact_hash,
            entries_added: archive.added.len(),
            entries_skipped: archive.skipped.len(),
            local_copy_deleted,
        })
    }

    fn build_archive(
        &self,
        files: &[String],
        follow_symlinks: bool,
        observer: &mut dyn ArchiveObserver,
    ) -> Result<BuiltArchive> {
        let config = self.ctx.config();
        ArchiveBuilder::new(
            &config.directory.destination,
            &config.directory.hash_file_path,
            ContainerKind::from_compression(config.backup.compression),
            self.date,
        )
        .with_hash_algorithm(config.backup.hash_algorithm)
        .with_follow_symlinks(follow_symlinks)
        .build(files, observer)
    }

    /// Encrypt the archive and drop the plaintext copy
    fn encrypt_archive(&self, key: &BackupKey, archive: &Path) -> Result<PathBuf> {
        let encrypted = encrypt_file(key, archive, self.ctx.config().backup.chunk_size)?;
        fs::remove_file(archive)?;
        info!("Encrypted {} to {}", archive.display(), encrypted.display());
        Ok(encrypted)
    }

    fn upload(&self, schedule: Schedule, archive: &BuiltArchive, artifact: &Path) -> Result<Uploaded> {
        let config = self.ctx.config();
        let machine = &config.storage.machine_name;
        let algorithm = config.backup.hash_algorithm;

        let object_key = archive_key(machine, schedule, self.date, archive.kind.extension());
        let artifact_hash = hash_file(artifact, algorithm)?;
        let metadata = ObjectMetadata::new()
            .with(META_HASH, artifact_hash.as_str())
            .with(META_ENCRYPTED, encrypted_flag(self.ctx.encrypts()));

        let file = File::open(artifact).map_err(|source| Error::ReadFailed {
            path: artifact.to_path_buf(),
            source,
        })?;
        let bytes = self.store.put(&object_key, &mut BufReader::new(file), &metadata)?;
        info!("Uploaded {} ({} bytes) as {}", artifact.display(), bytes, object_key);

        let manifest_key = archive_key(
            machine,
            schedule,
            self.date,
            &format!(".{}", MANIFEST_EXTENSION),
        );
        let manifest_path = archive.manifest.path();
        let (mut body, manifest_hash) = if manifest_path.exists() {
            let hash = hash_file(manifest_path, algorithm)?;
            let file = File::open(manifest_path).map_err(|source| Error::ReadFailed {
                path: manifest_path.to_path_buf(),
                source,
            })?;
            (Box::new(BufReader::new(file)) as Box<dyn Read>, hash)
        } else {
            warn!("No entries were archived, uploading an empty manifest");
            let hash = algorithm.hash_reader(&mut io::empty())?;
            (Box::new(io::empty()) as Box<dyn Read>, hash)
        };

        let manifest_metadata = ObjectMetadata::new()
            .with(META_HASH, manifest_hash.as_str())
            .with(META_ENCRYPTED, encrypted_flag(false));
        self.store.put(&manifest_key, &mut body, &manifest_metadata)?;
        info!("Uploaded manifest {} as {}", manifest_path.display(), manifest_key);

        Ok(Uploaded {
            object_key,
            manifest_key,
            artifact_hash,
        })
    }

    /// Remove the whole destination directory
    fn delete_local_copy(&self) -> Result<()> {
        let destination = &self.ctx.config().directory.destination;
        warn!("Deleting local destination {}", destination.display());
        fs::remove_dir_all(destination)?;
        Ok(())
    }
}

struct Uploaded {
    object_key: String,
    manifest_key: String,
    artifact_hash: ContentHash,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::list_entries;
    use crate::cipher::try_decrypt_file;
    use crate::config::CompressionMethod;
    use crate::context::{initialize, tests::config_in};
    use crate::hash::HashAlgorithm;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<BTreeMap<String, (Vec<u8>, ObjectMetadata)>>,
    }

    impl MemoryStore {
        fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        fn get(&self, key: &str) -> (Vec<u8>, ObjectMetadata) {
            self.objects.lock().unwrap()[key].clone()
        }
    }

    impl BlobStore for MemoryStore {
        fn put(&self, key: &str, body: &mut dyn Read, metadata: &ObjectMetadata) -> Result<u64> {
            let mut bytes = Vec::new();
            body.read_to_end(&mut bytes)?;
            let len = bytes.len() as u64;
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (bytes, metadata.clone()));
            Ok(len)
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    /// Write a daily list naming two files and one missing path
    fn fixture(temp_dir: &TempDir) -> Result<Vec<PathBuf>> {
        let data = temp_dir.path().join("data");
        fs::create_dir_all(&data)?;
        let a = data.join("a.txt");
        let b = data.join("b.txt");
        fs::write(&a, b"alpha contents")?;
        fs::write(&b, vec![7u8; 5000])?;

        let lists = temp_dir.path().join("lists");
        fs::create_dir_all(&lists)?;
        fs::write(
            lists.join("daily.list"),
            format!(
                "{}\n\n{}\n{}\n",
                a.display(),
                data.join("gone.txt").display(),
                b.display()
            ),
        )?;
        Ok(vec![a, b])
    }

    #[test]
    fn test_read_file_list_trims() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let list = temp_dir.path().join("l");
        fs::write(&list, "  /a  \n\n\t\n/b\n")?;
        assert_eq!(read_file_list(&list)?, vec!["/a".to_string(), "/b".to_string()]);
        Ok(())
    }

    #[test]
    fn test_plain_run_uploads_archive_and_manifest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let files = fixture(&temp_dir)?;
        let mut config = config_in(temp_dir.path());
        config.backup.compression = CompressionMethod::Gz;
        let ctx = initialize(config)?;
        let store = MemoryStore::default();

        let report = BackupOrchestrator::new(&ctx, &store)
            .with_date(date())
            .run(Schedule::Daily, false)?;

        assert_eq!(report.archive_name, "bak20240517.tar.gz");
        assert_eq!(report.object_key, "testhost/daily/20240517.tar.gz");
        assert_eq!(report.manifest_key, "testhost/daily/20240517.hash");
        assert_eq!(report.entries_added, 2);
        assert_eq!(report.entries_skipped, 1);
        assert!(!report.encrypted);
        assert!(!report.local_copy_deleted);
        assert_eq!(
            store.keys(),
            vec![report.manifest_key.clone(), report.object_key.clone()]
        );

        let archive_path = temp_dir.path().join("dest/bak20240517.tar.gz");
        let (body, metadata) = store.get(&report.object_key);
        assert_eq!(body, fs::read(&archive_path)?);
        assert_eq!(metadata.get(META_ENCRYPTED), Some("False"));
        assert_eq!(
            metadata.get(META_HASH),
            Some(hash_file(&archive_path, HashAlgorithm::Md5)?.as_str())
        );

        let (manifest, _) = store.get(&report.manifest_key);
        let manifest = String::from_utf8(manifest).unwrap();
        let recorded: Vec<&str> = manifest
            .lines()
            .map(|line| line.split('\t').next().unwrap())
            .collect();
        let expected: Vec<String> = files.iter().map(|f| f.display().to_string()).collect();
        assert_eq!(recorded, expected);
        Ok(())
    }

    #[test]
    fn test_encrypted_run_uploads_only_ciphertext() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fixture(&temp_dir)?;
        let mut config = config_in(temp_dir.path());
        config.backup.use_encryption = true;
        config.backup.encryption_password = Some("hunter2".to_string());
        config.backup.chunk_size = 100;
        let ctx = initialize(config)?;
        let store = MemoryStore::default();

        let report = BackupOrchestrator::new(&ctx, &store)
            .with_date(date())
            .run(Schedule::Daily, false)?;

        assert!(report.encrypted);
        assert_eq!(report.object_key, "testhost/daily/20240517.tar");

        let dest = temp_dir.path().join("dest");
        assert!(!dest.join("bak20240517.tar").exists());
        assert!(dest.join("bak20240517.tar.enc").exists());

        let (body, metadata) = store.get(&report.object_key);
        assert_eq!(metadata.get(META_ENCRYPTED), Some("True"));

        let uploaded = temp_dir.path().join("uploaded.enc");
        fs::write(&uploaded, &body)?;
        let restored = temp_dir.path().join("restored.tar");
        try_decrypt_file(ctx.require_key()?, &uploaded, &restored, 64)?;
        assert_eq!(list_entries(&restored, ContainerKind::Tar)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_password_alone_does_not_encrypt() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fixture(&temp_dir)?;
        let mut config = config_in(temp_dir.path());
        config.backup.encryption_password = Some("hunter2".to_string());
        let ctx = initialize(config)?;
        let store = MemoryStore::default();

        let report = BackupOrchestrator::new(&ctx, &store)
            .with_date(date())
            .run(Schedule::Daily, false)?;

        assert!(!report.encrypted);
        let (_, metadata) = store.get(&report.object_key);
        assert_eq!(metadata.get(META_ENCRYPTED), Some("False"));
        assert!(temp_dir.path().join("dest/bak20240517.tar").exists());
        assert!(!temp_dir.path().join("dest/bak20240517.tar.enc").exists());
        Ok(())
    }

    #[test]
    fn test_delete_archive_removes_destination() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fixture(&temp_dir)?;
        let mut config = config_in(temp_dir.path());
        config.backup.delete_archive = true;
        let ctx = initialize(config)?;
        let store = MemoryStore::default();

        let report = BackupOrchestrator::new(&ctx, &store)
            .with_date(date())
            .run(Schedule::Daily, false)?;

        assert!(report.local_copy_deleted);
        assert!(!temp_dir.path().join("dest").exists());
        assert_eq!(store.keys().len(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_file_list_fails_in_collect_stage() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let ctx = initialize(config_in(temp_dir.path()))?;
        let store = MemoryStore::default();

        let err = BackupOrchestrator::new(&ctx, &store)
            .run(Schedule::Weekly, false)
            .unwrap_err();

        assert_eq!(err.stage(), Some(Stage::CollectFiles));
        assert!(matches!(err.root(), Error::FileList { .. }));
        assert!(store.keys().is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_run_uploads_empty_manifest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let lists = temp_dir.path().join("lists");
        fs::create_dir_all(&lists)?;
        fs::write(lists.join("monthly.list"), "/does/not/exist\n")?;
        let ctx = initialize(config_in(temp_dir.path()))?;
        let store = MemoryStore::default();

        let report = BackupOrchestrator::new(&ctx, &store)
            .with_date(date())
            .run(Schedule::Monthly, false)?;

        assert_eq!(report.entries_added, 0);
        assert_eq!(report.entries_skipped, 1);
        let (manifest, _) = store.get("testhost/monthly/20240517.hash");
        assert!(manifest.is_empty());
        Ok(())
    }
}
