//! Chunked AES-256-CBC encryption of finished archives
//!
//! Encrypted file layout:
//! ```text
//! [8 bytes: original length, u64 little-endian]
//! [16 bytes: random IV]
//! [ciphertext: original length rounded up to a multiple of 16]
//! ```
//!
//! One CBC state runs over the whole file. Chunks only bound how much is
//! read and written per cycle. The last block is padded with spaces, which
//! are removed on decrypt by truncating to the recorded length.

use crate::hash::HashAlgorithm;
use crate::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;
/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;
/// Length of the original-size header
pub const HEADER_LEN: usize = 8;
/// Length of the IV stored after the size header
pub const IV_LEN: usize = 16;
/// Extension appended to encrypted artifacts
pub const ENCRYPTED_EXTENSION: &str = "enc";

const PAD_BYTE: u8 = b' ';

/// Symmetric key shared by every encryption in a process
pub struct BackupKey([u8; KEY_LEN]);

impl BackupKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a key as the leading bytes of `algorithm(password)`
    pub fn derive(password: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let mut digest = algorithm.digest(password.as_bytes());
        if digest.len() < KEY_LEN {
            digest.zeroize();
            return Err(Error::Configuration {
                reason: format!(
                    "{} digests are too short for a {}-bit key",
                    algorithm,
                    KEY_LEN * 8
                ),
            });
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest[..KEY_LEN]);
        digest.zeroize();
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupKey(<redacted>)")
    }
}

/// Header found at the start of every encrypted file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedHeader {
    pub original_len: u64,
    pub iv: [u8; IV_LEN],
}

impl EncryptedHeader {
    pub const LEN: usize = HEADER_LEN + IV_LEN;

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.original_len.to_le_bytes())?;
        writer.write_all(&self.iv)
    }

    /// Read the size header and IV
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; Self::LEN];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::InvalidEncryptedFile {
                reason: format!("file is shorter than the {}-byte header", Self::LEN),
            },
            _ => Error::Io(e),
        })?;

        let mut len = [0u8; HEADER_LEN];
        len.copy_from_slice(&raw[..HEADER_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&raw[HEADER_LEN..]);

        let original_len = u64::from_le_bytes(len);
        if original_len > u64::MAX - (BLOCK_SIZE as u64 - 1) {
            return Err(Error::InvalidEncryptedFile {
                reason: format!(
                    "recorded length {} cannot be padded to a whole block",
                    original_len
                ),
            });
        }

        Ok(Self { original_len, iv })
    }

    /// Length of the ciphertext that must follow this header
    pub fn ciphertext_len(&self) -> u64 {
        padded_len(self.original_len)
    }
}

/// Smallest multiple of the block size that holds `len` bytes
pub fn padded_len(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64
}

/// Conventional name of the encrypted copy: `<input>.enc`
pub fn encrypted_path<P: AsRef<Path>>(input: P) -> PathBuf {
    let mut name = input.as_ref().as_os_str().to_os_string();
    name.push(".");
    name.push(ENCRYPTED_EXTENSION);
    PathBuf::from(name)
}

/// Encrypt `input` to `<input>.enc`, returning the new path
///
/// The source file is left in place.
pub fn encrypt_file<P: AsRef<Path>>(key: &BackupKey, input: P, chunk_size: usize) -> Result<PathBuf> {
    let input = input.as_ref();
    let output = encrypted_path(input);
    encrypt_file_to(key, input, &output, chunk_size)?;
    Ok(output)
}

/// Encrypt `input` into `output`
pub fn encrypt_file_to<P: AsRef<Path>, Q: AsRef<Path>>(
    key: &BackupKey,
    input: P,
    output: Q,
    chunk_size: usize,
) -> Result<()> {
    let input = input.as_ref();
    let output = output.as_ref();
    check_chunk_size(chunk_size)?;

    let source = File::open(input).map_err(|source| Error::ReadFailed {
        path: input.to_path_buf(),
        source,
    })?;
    let original_len = source.metadata()?.len();

    let written = write_encrypted(key, source, output, original_len, chunk_size);
    let checked = written.and_then(|consumed| {
        if consumed == original_len {
            Ok(())
        } else {
            Err(Error::SourceChanged {
                path: input.to_path_buf(),
            })
        }
    });
    if let Err(e) = checked {
        if output.exists() {
            let _ = fs::remove_file(output);
        }
        return Err(e);
    }

    info!(
        "Encrypted {} ({} bytes) to {}",
        input.display(),
        original_len,
        output.display()
    );
    Ok(())
}

fn write_encrypted(
    key: &BackupKey,
    source: File,
    output: &Path,
    original_len: u64,
    chunk_size: usize,
) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(output)?);
    let consumed = encrypt_stream(key, source, &mut writer, original_len, chunk_size)?;
    writer.flush()?;
    Ok(consumed)
}

/// Encrypt everything `reader` yields, writing header then ciphertext
///
/// `original_len` goes into the header; the number of bytes actually read
/// is returned so callers can detect a source that changed size.
pub fn encrypt_stream<R: Read, W: Write>(
    key: &BackupKey,
    mut reader: R,
    writer: &mut W,
    original_len: u64,
    chunk_size: usize,
) -> Result<u64> {
    check_chunk_size(chunk_size)?;

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    EncryptedHeader { original_len, iv }.write_to(writer)?;

    let mut encryptor = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv).map_err(|e| {
        Error::Cipher {
            reason: e.to_string(),
        }
    })?;

    // Room for one chunk plus a partial block carried over from the last.
    let mut buffer = vec![0u8; chunk_size + BLOCK_SIZE];
    let mut carried = 0usize;
    let mut consumed = 0u64;

    loop {
        let read = read_full(&mut reader, &mut buffer[carried..carried + chunk_size])?;
        consumed += read as u64;
        let filled = carried + read;

        if read == 0 {
            if filled > 0 {
                let padded = padded_len(filled as u64) as usize;
                buffer[filled..padded].fill(PAD_BYTE);
                encrypt_blocks(&mut encryptor, &mut buffer[..padded]);
                writer.write_all(&buffer[..padded])?;
            }
            break;
        }

        let whole = filled - filled % BLOCK_SIZE;
        encrypt_blocks(&mut encryptor, &mut buffer[..whole]);
        writer.write_all(&buffer[..whole])?;

        buffer.copy_within(whole..filled, 0);
        carried = filled - whole;
    }

    Ok(consumed)
}

/// Decrypt `input` into `output`, reporting success as a flag
///
/// Any I/O or format problem yields `false`; the partial output is removed.
pub fn decrypt_file<P: AsRef<Path>, Q: AsRef<Path>>(
    key: &BackupKey,
    input: P,
    output: Q,
    chunk_size: usize,
) -> bool {
    let input = input.as_ref();
    let output = output.as_ref();

    match try_decrypt_file(key, input, output, chunk_size) {
        Ok(len) => {
            debug!("Decrypted {} ({} bytes)", input.display(), len);
            true
        }
        Err(e) => {
            warn!("Could not decrypt {}: {}", input.display(), e);
            if output.exists() {
                let _ = fs::remove_file(output);
            }
            false
        }
    }
}

/// Decrypt `input` into `output`, returning the plaintext length
pub fn try_decrypt_file<P: AsRef<Path>, Q: AsRef<Path>>(
    key: &BackupKey,
    input: P,
    output: Q,
    chunk_size: usize,
) -> Result<u64> {
    let input = input.as_ref();
    let source = File::open(input).map_err(|source| Error::ReadFailed {
        path: input.to_path_buf(),
        source,
    })?;

    let mut target = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output.as_ref())?;

    let header = {
        let mut writer = BufWriter::new(&mut target);
        let header = decrypt_stream(key, BufReader::new(source), &mut writer, chunk_size)?;
        writer.flush()?;
        header
    };

    target.set_len(header.original_len)?;
    Ok(header.original_len)
}

/// Decrypt a header-prefixed stream, writing every decrypted block
///
/// The output still carries the final block's padding; callers trim it to
/// `original_len` from the returned header.
pub fn decrypt_stream<R: Read, W: Write>(
    key: &BackupKey,
    mut reader: R,
    writer: &mut W,
    chunk_size: usize,
) -> Result<EncryptedHeader> {
    check_chunk_size(chunk_size)?;

    let header = EncryptedHeader::read_from(&mut reader)?;
    let mut decryptor = Aes256CbcDec::new_from_slices(key.as_bytes(), &header.iv).map_err(|e| {
        Error::Cipher {
            reason: e.to_string(),
        }
    })?;

    let read_size = padded_len(chunk_size as u64) as usize;
    let mut buffer = vec![0u8; read_size];
    let mut ciphertext_len = 0u64;

    loop {
        let read = read_full(&mut reader, &mut buffer)?;
        if read == 0 {
            break;
        }
        if read % BLOCK_SIZE != 0 {
            return Err(Error::InvalidEncryptedFile {
                reason: "ciphertext is not a whole number of blocks".to_string(),
            });
        }

        ciphertext_len += read as u64;
        decrypt_blocks(&mut decryptor, &mut buffer[..read]);
        writer.write_all(&buffer[..read])?;
    }

    if ciphertext_len != header.ciphertext_len() {
        return Err(Error::InvalidEncryptedFile {
            reason: format!(
                "header records {} bytes but {} bytes of ciphertext follow",
                header.original_len, ciphertext_len
            ),
        });
    }

    Ok(header)
}

fn encrypt_blocks(encryptor: &mut Aes256CbcEnc, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(decryptor: &mut Aes256CbcDec, data: &mut [u8]) {
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Fill `buf` unless the reader runs dry first
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::Configuration {
            reason: "chunk size must be greater than zero".to_string(),
        });
    }
    Ok(())
}
