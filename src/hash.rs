//! Content hashing for archived files and uploaded artifacts

use crate::{Error, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

/// Digest algorithms supported for manifests and object metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
    Sha512,
    Blake3,
}

impl HashAlgorithm {
    /// Length of the raw digest in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha256 | HashAlgorithm::Blake3 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Digest an in-memory buffer
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5 => Md5::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
            HashAlgorithm::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }

    /// Digest everything a reader yields, streaming
    pub fn hash_reader<R: Read>(&self, reader: &mut R) -> io::Result<ContentHash> {
        let hex = match self {
            HashAlgorithm::Md5 => streaming_hex(Md5::new(), reader)?,
            HashAlgorithm::Sha256 => streaming_hex(Sha256::new(), reader)?,
            HashAlgorithm::Sha512 => streaming_hex(Sha512::new(), reader)?,
            HashAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                io::copy(reader, &mut hasher)?;
                hasher.finalize().to_hex().to_string()
            }
        };
        Ok(ContentHash(hex))
    }
}

fn streaming_hex<D, R>(mut hasher: D, reader: &mut R) -> io::Result<String>
where
    D: Digest + Write,
    R: Read,
{
    io::copy(reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
            HashAlgorithm::Blake3 => "BLAKE3",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Ok(HashAlgorithm::Md5),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            "BLAKE3" => Ok(HashAlgorithm::Blake3),
            _ => Err(Error::UnsupportedHashAlgorithm {
                name: s.to_string(),
            }),
        }
    }
}

/// Lowercase hex digest of some content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a hex digest, normalising to lowercase
    pub fn parse(s: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let expected = algorithm.digest_len() * 2;
        if s.len() != expected || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidManifest {
                reason: format!("'{}' is not a {} hex digest", s, algorithm),
            });
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a file's bytes as they are on disk right now
pub fn hash_file<P: AsRef<Path>>(file_path: P, algorithm: HashAlgorithm) -> Result<ContentHash> {
    let file_path = file_path.as_ref();
    let read_failed = |source| Error::ReadFailed {
        path: file_path.to_path_buf(),
        source,
    };

    let mut file = File::open(file_path).map_err(read_failed)?;
    algorithm.hash_reader(&mut file).map_err(read_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digests() {
        let mut data: &[u8] = b"hello world";
        assert_eq!(
            HashAlgorithm::Md5.hash_reader(&mut data).unwrap().as_str(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );

        let mut data: &[u8] = b"hello world";
        assert_eq!(
            HashAlgorithm::Sha256.hash_reader(&mut data).unwrap().as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let mut data: &[u8] = b"hello world";
        assert_eq!(
            HashAlgorithm::Blake3.hash_reader(&mut data).unwrap().as_str(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_streaming_matches_in_memory() {
        let data = vec![7u8; 300_000];
        for algorithm in [
            HashAlgorithm::Md5,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha512,
            HashAlgorithm::Blake3,
        ] {
            let streamed = algorithm.hash_reader(&mut data.as_slice()).unwrap();
            assert_eq!(streamed.as_str(), hex::encode(algorithm.digest(&data)));
            assert_eq!(streamed.as_str().len(), algorithm.digest_len() * 2);
        }
    }

    #[test]
    fn test_hash_file_missing() {
        let temp_dir = TempDir::new().unwrap();
        let result = hash_file(temp_dir.path().join("absent"), HashAlgorithm::Md5);
        assert!(matches!(result, Err(Error::ReadFailed { .. })));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("sha512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert_eq!("MD5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert!(matches!(
            "SHA1".parse::<HashAlgorithm>(),
            Err(Error::UnsupportedHashAlgorithm { .. })
        ));
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Md5);
    }

    #[test]
    fn test_content_hash_parse() {
        let hash = ContentHash::parse("5EB63BBBE01EEED093CB22BB8F5ACDC3", HashAlgorithm::Md5).unwrap();
        assert_eq!(hash.as_str(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert!(ContentHash::parse("abc", HashAlgorithm::Md5).is_err());
    }
}
