//! Process-wide state built once at startup

use crate::cipher::BackupKey;
use crate::config::Config;
use crate::{Error, Result};
use tracing::debug;

/// Validated configuration plus the derived backup key
///
/// Built by [`initialize`] and handed by reference to everything that needs
/// configuration or key material.
#[derive(Debug)]
pub struct CoreContext {
    config: Config,
    key: Option<BackupKey>,
}

/// Validate `config` and derive the backup key from any configured password
///
/// The key is derived even with `use_encryption` off, so artifacts written
/// while encryption was on can still be decrypted.
pub fn initialize(config: Config) -> Result<CoreContext> {
    config.validate()?;

    let key = match config.backup.encryption_password.as_deref() {
        Some(password) if !password.is_empty() => {
            debug!("Deriving backup key with {}", config.backup.password_hash);
            Some(BackupKey::derive(password, config.backup.password_hash)?)
        }
        _ => None,
    };

    Ok(CoreContext { config, key })
}

impl CoreContext {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Key for operations that cannot run without one
    pub fn require_key(&self) -> Result<&BackupKey> {
        self.key.as_ref().ok_or_else(|| Error::Configuration {
            reason: "no encryption password is configured".to_string(),
        })
    }

    /// Whether backups are encrypted before upload
    pub fn encrypts(&self) -> bool {
        self.config.backup.use_encryption
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use std::path::Path;

    /// Configuration rooted in `dir` with every path inside it
    pub(crate) fn config_in(dir: &Path) -> Config {
        let toml = format!(
            r#"
[storage]
machine_name = "testhost"
root = "{root}/store"

[directory]
base_directory = "{root}/lists"
daily_list = "daily.list"
weekly_list = "weekly.list"
monthly_list = "monthly.list"
destination = "{root}/dest"
hash_file_path = "{root}/hashes"
"#,
            root = dir.display()
        );
        Config::from_toml_str(&toml).unwrap()
    }

    #[test]
    fn test_plain_context_has_no_key() {
        let config = config_in(Path::new("/tmp/bakvault-test"));
        let ctx = initialize(config).unwrap();
        assert!(!ctx.encrypts());
        assert!(matches!(ctx.require_key(), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_key_derived_from_password() {
        let mut config = config_in(Path::new("/tmp/bakvault-test"));
        config.backup.use_encryption = true;
        config.backup.encryption_password = Some("secret".to_string());

        let ctx = initialize(config).unwrap();
        let expected = BackupKey::derive("secret", HashAlgorithm::Sha256).unwrap();
        assert_eq!(ctx.require_key().unwrap().as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_key_available_with_encryption_off() {
        let mut config = config_in(Path::new("/tmp/bakvault-test"));
        config.backup.use_encryption = false;
        config.backup.encryption_password = Some("secret".to_string());

        let ctx = initialize(config).unwrap();
        assert!(!ctx.encrypts());
        let expected = BackupKey::derive("secret", HashAlgorithm::Sha256).unwrap();
        assert_eq!(ctx.require_key().unwrap().as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_short_password_digest_rejected() {
        let mut config = config_in(Path::new("/tmp/bakvault-test"));
        config.backup.use_encryption = true;
        config.backup.encryption_password = Some("secret".to_string());
        config.backup.password_hash = HashAlgorithm::Md5;

        assert!(matches!(initialize(config), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config_in(Path::new("/tmp/bakvault-test"));
        config.backup.chunk_size = 0;
        assert!(initialize(config).is_err());
    }
}
