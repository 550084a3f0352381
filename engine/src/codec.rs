//! Per-file encryption codec.
//!
//! Each file is encrypted independently in fixed-size chunks:
//!
//! ```text
//! header: magic "EIB1" | version u8 | nonce_prefix [u8; 8] | plaintext_len u64 LE
//! body:   AES-256-GCM(key, nonce_prefix || chunk_index u32 BE, chunk) per chunk
//! ```
//!
//! A fresh random nonce prefix per file means identical plaintexts never
//! share ciphertext; the chunk counter inside the nonce pins chunk order and
//! the header's plaintext length pins the chunk count, so reordering and
//! truncation both fail the tag check. Files of any size stream through in
//! 64 KiB chunks. Output is written to a temp file beside the target and
//! promoted by rename only after the last chunk, so a wrong key or a
//! corrupted ciphertext never leaves partial plaintext (or ciphertext)
//! behind.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::error::EngineError;
use crate::fs_ops::{self, FingerprintHasher};
use crate::keys::{self, Key};
use crate::model::FingerprintAlgorithm;

const MAGIC: &[u8; 4] = b"EIB1";
const VERSION: u8 = 1;
const NONCE_PREFIX_LEN: usize = 8;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 1 + NONCE_PREFIX_LEN + 8;

/// Plaintext bytes per encrypted chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

// The chunk counter occupies 32 bits of the nonce; more chunks than that
// would repeat a nonce under the same prefix.
const MAX_CHUNKS: u64 = u32::MAX as u64;

/// What the backup engine records after encrypting one file.
#[derive(Debug)]
pub struct EncryptOutcome {
    /// Plaintext bytes processed
    pub bytes: u64,

    /// Hex-encoded nonce prefix stored in the file's header
    pub nonce: String,

    /// Content fingerprint, computed in the same read pass
    pub fingerprint: String,
}

fn cipher_for(key: &Key) -> Result<Aes256Gcm, EngineError> {
    Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| EngineError::Crypto {
        message: format!("cipher init: {}", e),
    })
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], index: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Number of chunks for a given plaintext length. Empty files still carry
/// one authenticated (empty) chunk so a wrong key is always detectable.
fn chunk_count(len: u64) -> u64 {
    if len == 0 {
        1
    } else {
        len.div_ceil(CHUNK_SIZE as u64)
    }
}

/// Read until `buf` is full or EOF; returns bytes read.
fn fill_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Encrypt `src` into `dst`, atomically, fingerprinting the plaintext in the
/// same pass.
pub fn encrypt_file(
    src: &Path,
    dst: &Path,
    key: &Key,
    algorithm: FingerprintAlgorithm,
) -> Result<EncryptOutcome, EngineError> {
    let mut reader = fs::File::open(src).map_err(|e| EngineError::io(src, e))?;
    let len = reader
        .metadata()
        .map_err(|e| EngineError::io(src, e))?
        .len();

    let chunks = chunk_count(len);
    if chunks > MAX_CHUNKS {
        return Err(EngineError::Crypto {
            message: format!("file too large for the chunked format: {} bytes", len),
        });
    }

    let cipher = cipher_for(key)?;
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    rand::rngs::OsRng.fill_bytes(&mut prefix);

    fs_ops::ensure_parent_dir_exists(dst)?;
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| EngineError::io(dir, e))?;

    tmp.write_all(MAGIC).map_err(|e| EngineError::io(dst, e))?;
    tmp.write_all(&[VERSION]).map_err(|e| EngineError::io(dst, e))?;
    tmp.write_all(&prefix).map_err(|e| EngineError::io(dst, e))?;
    tmp.write_all(&len.to_le_bytes())
        .map_err(|e| EngineError::io(dst, e))?;

    let mut hasher = FingerprintHasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    for index in 0..chunks {
        let want = (len - index as u64 * CHUNK_SIZE as u64).min(CHUNK_SIZE as u64) as usize;
        let n = fill_chunk(&mut reader, &mut buf[..want]).map_err(|e| EngineError::io(src, e))?;
        if n != want {
            // Source shrank between metadata read and now.
            return Err(EngineError::io(
                src,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "file changed during read"),
            ));
        }
        hasher.update(&buf[..n]);
        let nonce = chunk_nonce(&prefix, index as u32);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), &buf[..n])
            .map_err(|e| EngineError::Crypto {
                message: format!("encrypt: {}", e),
            })?;
        tmp.write_all(&sealed).map_err(|e| EngineError::io(dst, e))?;
        total += n as u64;
    }

    tmp.as_file().sync_all().map_err(|e| EngineError::io(dst, e))?;
    tmp.persist(dst).map_err(|e| EngineError::io(dst, e.error))?;

    Ok(EncryptOutcome {
        bytes: total,
        nonce: keys::encode_hex(&prefix),
        fingerprint: hasher.finalize(),
    })
}

/// Decrypt `src` into `dst`.
///
/// Every chunk's tag is verified before its plaintext is written, and the
/// output only reaches `dst` via an atomic rename after the final chunk
/// passes, so a failure can never partially restore a file.
///
/// # Errors
/// `EngineError::Integrity` on a bad magic, truncated body, trailing
/// garbage, or tag failure (wrong key or tampering).
pub fn decrypt_file(src: &Path, dst: &Path, key: &Key) -> Result<u64, EngineError> {
    let mut reader = fs::File::open(src).map_err(|e| EngineError::io(src, e))?;

    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|_| EngineError::Integrity {
            path: src.to_path_buf(),
        })?;
    if &header[..4] != MAGIC {
        return Err(EngineError::Integrity {
            path: src.to_path_buf(),
        });
    }
    if header[4] != VERSION {
        return Err(EngineError::Crypto {
            message: format!("unsupported ciphertext version {}", header[4]),
        });
    }
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix.copy_from_slice(&header[5..5 + NONCE_PREFIX_LEN]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[5 + NONCE_PREFIX_LEN..]);
    let len = u64::from_le_bytes(len_bytes);

    let chunks = chunk_count(len);
    if chunks > MAX_CHUNKS {
        return Err(EngineError::Crypto {
            message: format!("ciphertext header claims an impossible length: {} bytes", len),
        });
    }

    let cipher = cipher_for(key)?;

    fs_ops::ensure_parent_dir_exists(dst)?;
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| EngineError::io(dir, e))?;

    let mut buf = vec![0u8; CHUNK_SIZE + TAG_LEN];
    let mut total: u64 = 0;
    for index in 0..chunks {
        let plain = (len - index as u64 * CHUNK_SIZE as u64).min(CHUNK_SIZE as u64) as usize;
        let sealed = &mut buf[..plain + TAG_LEN];
        reader.read_exact(sealed).map_err(|_| EngineError::Integrity {
            path: src.to_path_buf(),
        })?;
        let nonce = chunk_nonce(&prefix, index as u32);
        let opened = cipher
            .decrypt(Nonce::from_slice(&nonce), &*sealed)
            .map_err(|_| EngineError::Integrity {
                path: src.to_path_buf(),
            })?;
        tmp.write_all(&opened).map_err(|e| EngineError::io(dst, e))?;
        total += opened.len() as u64;
    }

    // Anything after the last chunk means the file was tampered with.
    let mut trailing = [0u8; 1];
    match reader.read(&mut trailing) {
        Ok(0) => {}
        Ok(_) => {
            return Err(EngineError::Integrity {
                path: src.to_path_buf(),
            })
        }
        Err(e) => return Err(EngineError::io(src, e)),
    }

    tmp.as_file().sync_all().map_err(|e| EngineError::io(dst, e))?;
    tmp.persist(dst).map_err(|e| EngineError::io(dst, e.error))?;
    Ok(total)
}

/// Read just the nonce prefix out of a ciphertext header.
pub fn read_nonce(path: &Path) -> Result<String, EngineError> {
    let mut reader = fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut header = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header)
        .map_err(|_| EngineError::Integrity {
            path: path.to_path_buf(),
        })?;
    if &header[..4] != MAGIC {
        return Err(EngineError::Integrity {
            path: path.to_path_buf(),
        });
    }
    Ok(keys::encode_hex(&header[5..5 + NONCE_PREFIX_LEN]))
}
