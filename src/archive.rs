//! Archive creation for a list of files, with per-entry hash recording
//!
//! Archives are named `bak<YYYYMMDD><ext>` and written into the destination
//! directory. Every entry that makes it into the container gets a line in
//! the archive's hash manifest. Paths that do not exist are skipped and
//! reported to the [`ArchiveObserver`]; they never abort the build.

use crate::config::CompressionMethod;
use crate::hash::HashAlgorithm;
use crate::manifest::{regular_files, HashManifest};
use crate::{Error, Result};
use bzip2::write::BzEncoder;
use chrono::NaiveDate;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, span, warn, Level};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod as ZipCompression, ZipArchive, ZipWriter};

/// Comment stored in zip archives
pub const ZIP_COMMENT: &str = "Created by bakvault";

/// Container format, including any tar compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerKind {
    Tar,
    TarGz,
    TarBz2,
    Zip,
}

impl ContainerKind {
    pub fn from_compression(method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => ContainerKind::Tar,
            CompressionMethod::Gz => ContainerKind::TarGz,
            CompressionMethod::Bz2 => ContainerKind::TarBz2,
            CompressionMethod::Zip => ContainerKind::Zip,
        }
    }

    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::Tar => ".tar",
            ContainerKind::TarGz => ".tar.gz",
            ContainerKind::TarBz2 => ".tar.bz2",
            ContainerKind::Zip => ".zip",
        }
    }

    /// Zip always stores link targets; tar honours the caller's choice
    pub fn dereferences(&self, follow_symlinks: bool) -> bool {
        matches!(self, ContainerKind::Zip) || follow_symlinks
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension().trim_start_matches('.'))
    }
}

/// `bak<YYYYMMDD><ext>`
pub fn archive_file_name(date: NaiveDate, kind: ContainerKind) -> String {
    format!("bak{}{}", date.format("%Y%m%d"), kind.extension())
}

/// Name a path is stored under inside a container
///
/// Containers hold relative names, so root, prefix, `.` and `..` components
/// are dropped: `/home/me/notes.txt` becomes `home/me/notes.txt`.
pub fn entry_name<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref()
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Receives per-entry outcomes while an archive is built
pub trait ArchiveObserver {
    /// Called after an entry was added and its hash recorded
    fn on_entry_added(&mut self, path: &Path);

    /// Called when a listed path does not exist
    fn on_entry_missing(&mut self, path: &Path);

    /// Called when a listed path has no usable entry name or repeats one
    fn on_entry_rejected(&mut self, path: &Path, reason: &str);
}

/// Observer that reports through `tracing`
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ArchiveObserver for TracingObserver {
    fn on_entry_added(&mut self, path: &Path) {
        debug!("Added {}.", path.display());
    }

    fn on_entry_missing(&mut self, path: &Path) {
        error!("{} does not exist.", path.display());
    }

    fn on_entry_rejected(&mut self, path: &Path, reason: &str) {
        error!("Skipping {}: {}", path.display(), reason);
    }
}

/// A finished, verified archive
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub path: PathBuf,
    pub name: String,
    pub kind: ContainerKind,
    pub manifest: HashManifest,
    /// Listed paths that were archived, in list order
    pub added: Vec<PathBuf>,
    /// Listed paths that were skipped
    pub skipped: Vec<PathBuf>,
}

/// Builds one archive from a file list
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    destination: PathBuf,
    hash_dir: PathBuf,
    kind: ContainerKind,
    algorithm: HashAlgorithm,
    follow_symlinks: bool,
    date: NaiveDate,
}

struct PendingEntry {
    source: PathBuf,
    name: PathBuf,
    is_dir: bool,
}

impl ArchiveBuilder {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        destination: P,
        hash_dir: Q,
        kind: ContainerKind,
        date: NaiveDate,
    ) -> Self {
        Self {
            destination: destination.as_ref().to_path_buf(),
            hash_dir: hash_dir.as_ref().to_path_buf(),
            kind,
            algorithm: HashAlgorithm::default(),
            follow_symlinks: false,
            date,
        }
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }

    pub fn file_name(&self) -> String {
        archive_file_name(self.date, self.kind)
    }

    /// Archive every existing path in `files` and verify the result
    pub fn build<S: AsRef<str>>(
        &self,
        files: &[S],
        observer: &mut dyn ArchiveObserver,
    ) -> Result<BuiltArchive> {
        let name = self.file_name();
        let span = span!(Level::INFO, "build_archive", archive = %name);
        let _enter = span.enter();

        fs::create_dir_all(&self.destination).map_err(|source| Error::DestinationDir {
            path: self.destination.clone(),
            source,
        })?;

        let archive_path = self.destination.join(&name);
        let manifest = HashManifest::for_archive(&self.hash_dir, &name, self.algorithm);
        let dereference = self.kind.dereferences(self.follow_symlinks);

        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for raw in files {
            let trimmed = raw.as_ref().trim();
            if trimmed.is_empty() {
                continue;
            }

            let source = PathBuf::from(trimmed);
            if !source.exists() {
                observer.on_entry_missing(&source);
                skipped.push(source);
                continue;
            }

            let stored_as = entry_name(&source);
            if stored_as.as_os_str().is_empty() {
                observer.on_entry_rejected(&source, "path has no archivable name");
                skipped.push(source);
                continue;
            }
            if pending.iter().any(|p: &PendingEntry| p.name == stored_as) {
                observer.on_entry_rejected(&source, "already listed");
                skipped.push(source);
                continue;
            }

            let is_dir = if dereference {
                source.is_dir()
            } else {
                fs::symlink_metadata(&source)?.is_dir()
            };
            pending.push(PendingEntry {
                source,
                name: stored_as,
                is_dir,
            });
        }

        info!(
            "Creating {} with {} entries ({} skipped)",
            archive_path.display(),
            pending.len(),
            skipped.len()
        );

        let mut added = Vec::new();
        let expected = match self.kind {
            ContainerKind::Zip => {
                self.write_zip(
                    &archive_path,
                    &pending,
                    &manifest,
                    observer,
                    &mut added,
                    &mut skipped,
                )?
            }
            _ => self.write_tar(&archive_path, &pending, &manifest, observer, &mut added)?,
        };

        verify_archive(&archive_path, self.kind, &expected)?;
        info!("Verified {} ({} entries)", archive_path.display(), expected.len());

        Ok(BuiltArchive {
            path: archive_path,
            name,
            kind: self.kind,
            manifest,
            added,
            skipped,
        })
    }

    fn write_tar(
        &self,
        archive_path: &Path,
        entries: &[PendingEntry],
        manifest: &HashManifest,
        observer: &mut dyn ArchiveObserver,
        added: &mut Vec<PathBuf>,
    ) -> Result<HashSet<PathBuf>> {
        let write_error = |source| Error::ArchiveWrite {
            path: archive_path.to_path_buf(),
            source,
        };

        let sink = TarSink::create(archive_path, self.kind).map_err(write_error)?;
        let mut builder = tar::Builder::new(sink);
        builder.follow_symlinks(self.follow_symlinks);

        let mut expected = HashSet::new();
        for entry in entries {
            if entry.is_dir {
                builder
                    .append_dir_all(&entry.name, &entry.source)
                    .map_err(write_error)?;
                manifest.record_hashes_for_tree(&entry.source, self.follow_symlinks)?;
            } else {
                builder
                    .append_path_with_name(&entry.source, &entry.name)
                    .map_err(write_error)?;
                if entry.source.is_dir() {
                    // stored as a link to a directory; hash what it points at
                    manifest.record_hashes_for_tree(&entry.source, true)?;
                } else {
                    manifest.record_hash(&entry.source)?;
                }
            }

            expected.insert(entry.name.clone());
            added.push(entry.source.clone());
            observer.on_entry_added(&entry.source);
        }

        let sink = builder.into_inner().map_err(write_error)?;
        sink.finish().map_err(write_error)?;

        Ok(expected)
    }

    fn write_zip(
        &self,
        archive_path: &Path,
        entries: &[PendingEntry],
        manifest: &HashManifest,
        observer: &mut dyn ArchiveObserver,
        added: &mut Vec<PathBuf>,
        skipped: &mut Vec<PathBuf>,
    ) -> Result<HashSet<PathBuf>> {
        let file = File::create(archive_path).map_err(|source| Error::ArchiveWrite {
            path: archive_path.to_path_buf(),
            source,
        })?;

        let mut zip = ZipWriter::new(BufWriter::new(file));
        zip.set_comment(ZIP_COMMENT);
        let options = SimpleFileOptions::default()
            .compression_method(ZipCompression::Deflated)
            .large_file(true);

        let mut expected = HashSet::new();
        for entry in entries {
            let files: Vec<PathBuf> = if entry.is_dir {
                regular_files(&entry.source, true).collect::<Result<_>>()?
            } else {
                vec![entry.source.clone()]
            };

            let mut wrote_any = false;
            for file_path in &files {
                let name = entry_name(file_path);
                if expected.contains(&name) {
                    // covered by an earlier entry; zip names must be unique
                    debug!("{} is already in the archive", file_path.display());
                    continue;
                }
                wrote_any = true;
                zip.start_file(zip_name(&name), options)?;
                let mut source = File::open(file_path).map_err(|source| Error::ReadFailed {
                    path: file_path.clone(),
                    source,
                })?;
                io::copy(&mut source, &mut zip)?;
                manifest.record_hash(file_path)?;
                expected.insert(name);
            }

            if !wrote_any && !files.is_empty() {
                observer.on_entry_rejected(&entry.source, "already in the archive");
                skipped.push(entry.source.clone());
                continue;
            }
            added.push(entry.source.clone());
            observer.on_entry_added(&entry.source);
        }

        zip.finish()?.flush()?;
        Ok(expected)
    }
}

fn zip_name(name: &Path) -> String {
    // Zip names always use forward slashes.
    name.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Output side of a tar archive, with its optional compressor
enum TarSink {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
    Bz2(BzEncoder<BufWriter<File>>),
}

impl TarSink {
    fn create(path: &Path, kind: ContainerKind) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(match kind {
            ContainerKind::TarGz => TarSink::Gz(GzEncoder::new(file, flate2::Compression::default())),
            ContainerKind::TarBz2 => TarSink::Bz2(BzEncoder::new(file, bzip2::Compression::default())),
            _ => TarSink::Plain(file),
        })
    }

    fn finish(self) -> io::Result<()> {
        let mut file = match self {
            TarSink::Plain(file) => file,
            TarSink::Gz(encoder) => encoder.finish()?,
            TarSink::Bz2(encoder) => encoder.finish()?,
        };
        file.flush()
    }
}

impl Write for TarSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarSink::Plain(w) => w.write(buf),
            TarSink::Gz(w) => w.write(buf),
            TarSink::Bz2(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarSink::Plain(w) => w.flush(),
            TarSink::Gz(w) => w.flush(),
            TarSink::Bz2(w) => w.flush(),
        }
    }
}

fn tar_reader(path: &Path, kind: ContainerKind) -> io::Result<Box<dyn Read>> {
    let file = BufReader::new(File::open(path)?);
    Ok(match kind {
        ContainerKind::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
        ContainerKind::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
        _ => Box::new(file),
    })
}

/// Names of every entry in an archive, reading each entry to the end
///
/// Reading zip entries fully makes the zip reader check their CRC-32.
pub fn list_entries<P: AsRef<Path>>(path: P, kind: ContainerKind) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let corrupt = |reason: String| Error::ArchiveCorrupt {
        reason: format!("{}: {}", path.display(), reason),
    };

    let mut names = Vec::new();
    match kind {
        ContainerKind::Zip => {
            let file = File::open(path)?;
            let mut archive =
                ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;
            for index in 0..archive.len() {
                let mut entry = archive.by_index(index).map_err(|e| corrupt(e.to_string()))?;
                io::copy(&mut entry, &mut io::sink()).map_err(|e| corrupt(e.to_string()))?;
                names.push(PathBuf::from(entry.name()));
            }
        }
        _ => {
            let mut archive = tar::Archive::new(tar_reader(path, kind)?);
            let entries = archive.entries().map_err(|e| corrupt(e.to_string()))?;
            for entry in entries {
                let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
                let name = entry.path().map_err(|e| corrupt(e.to_string()))?.into_owned();
                io::copy(&mut entry, &mut io::sink()).map_err(|e| corrupt(e.to_string()))?;
                names.push(name);
            }
        }
    }

    Ok(names)
}

/// Reopen a finished archive and check every expected entry is readable
pub fn verify_archive<P: AsRef<Path>>(
    path: P,
    kind: ContainerKind,
    expected: &HashSet<PathBuf>,
) -> Result<()> {
    let path = path.as_ref();
    let present: HashSet<PathBuf> = list_entries(path, kind)?.into_iter().collect();

    let mut missing: Vec<&PathBuf> = expected.difference(&present).collect();
    if missing.is_empty() {
        return Ok(());
    }

    missing.sort();
    warn!("{} is missing {} entries", path.display(), missing.len());
    Err(Error::ArchiveCorrupt {
        reason: format!(
            "{} is missing entries: {}",
            path.display(),
            missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}
