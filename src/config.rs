//! Configuration loaded once at startup and passed down by reference

use crate::hash::HashAlgorithm;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default size of each read/encrypt/write cycle (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Which configured file list drives a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Daily => write!(f, "daily"),
            Schedule::Weekly => write!(f, "weekly"),
            Schedule::Monthly => write!(f, "monthly"),
        }
    }
}

/// `compression` setting; `zip` selects the zip container instead of tar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    Gz,
    Bz2,
    Zip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub backup: BackupSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// First component of every object key
    pub machine_name: String,
    /// Root directory of the local object store
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub base_directory: PathBuf,
    pub daily_list: PathBuf,
    pub weekly_list: PathBuf,
    pub monthly_list: PathBuf,
    /// Where archives are built. Deleted wholesale when `delete_archive` is set.
    pub destination: PathBuf,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    pub hash_file_path: PathBuf,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub compression: CompressionMethod,
    pub use_encryption: bool,
    pub encryption_password: Option<String>,
    /// Digest used to turn the password into the cipher key
    pub password_hash: HashAlgorithm,
    /// Digest recorded in manifests and object metadata
    pub hash_algorithm: HashAlgorithm,
    pub chunk_size: usize,
    /// Remove the whole destination directory after a successful upload
    pub delete_archive: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::None,
            use_encryption: false,
            encryption_password: None,
            password_hash: HashAlgorithm::Sha256,
            hash_algorithm: HashAlgorithm::Md5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            delete_archive: false,
        }
    }
}

impl fmt::Debug for BackupSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupSettings")
            .field("compression", &self.compression)
            .field("use_encryption", &self.use_encryption)
            .field(
                "encryption_password",
                &self.encryption_password.as_ref().map(|_| "<redacted>"),
            )
            .field("password_hash", &self.password_hash)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("chunk_size", &self.chunk_size)
            .field("delete_archive", &self.delete_archive)
            .finish()
    }
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| Error::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.machine_name.trim().is_empty() {
            return Err(Error::Configuration {
                reason: "storage.machine_name must not be empty".to_string(),
            });
        }

        if self.backup.chunk_size == 0 {
            return Err(Error::Configuration {
                reason: "backup.chunk_size must be greater than zero".to_string(),
            });
        }

        if self.backup.use_encryption
            && self
                .backup
                .encryption_password
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(Error::Configuration {
                reason: "backup.use_encryption is set but no encryption_password is configured"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Path of the file list read for `schedule`
    pub fn file_list_for(&self, schedule: Schedule) -> PathBuf {
        let list = match schedule {
            Schedule::Daily => &self.directory.daily_list,
            Schedule::Weekly => &self.directory.weekly_list,
            Schedule::Monthly => &self.directory.monthly_list,
        };
        self.directory.base_directory.join(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
machine_name = "workstation"
root = "/srv/objects"

[directory]
base_directory = "/etc/bakvault"
daily_list = "daily.list"
weekly_list = "weekly.list"
monthly_list = "/abs/monthly.list"
destination = "/var/tmp/bakvault"
hash_file_path = "/var/lib/bakvault/hashes"

[backup]
compression = "bz2"
use_encryption = true
encryption_password = "correct horse"
hash_algorithm = "SHA256"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.storage.machine_name, "workstation");
        assert_eq!(config.backup.compression, CompressionMethod::Bz2);
        assert_eq!(config.backup.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.backup.password_hash, HashAlgorithm::Sha256);
        assert_eq!(config.backup.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!config.backup.delete_archive);
        assert!(config.directory.log_path.is_none());
    }

    #[test]
    fn test_file_list_for_schedule() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.file_list_for(Schedule::Daily),
            PathBuf::from("/etc/bakvault/daily.list")
        );
        assert_eq!(
            config.file_list_for(Schedule::Monthly),
            PathBuf::from("/abs/monthly.list")
        );
    }

    #[test]
    fn test_backup_section_defaults() {
        let without_backup = SAMPLE.split("[backup]").next().unwrap();
        let config = Config::from_toml_str(without_backup).unwrap();
        assert_eq!(config.backup.compression, CompressionMethod::None);
        assert!(!config.backup.use_encryption);
        assert_eq!(config.backup.hash_algorithm, HashAlgorithm::Md5);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();

        config.backup.chunk_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        config.backup.chunk_size = 16;
        config.backup.encryption_password = None;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));

        config.backup.use_encryption = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("correct horse"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_schedule_display() {
        assert_eq!(Schedule::Weekly.to_string(), "weekly");
    }
}
