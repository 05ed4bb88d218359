//! Package files are `IV (16 bytes) || AES-CTR ciphertext`. The cipher is
//! unauthenticated; callers must verify the package digest first.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use tracing::debug;

use crate::error::UpdateError;

pub const IV_LEN: usize = 16;
const BUFFER_SIZE: usize = 32 * 1024;

enum PackageCipher {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl PackageCipher {
    fn new(key: &[u8], iv: &[u8; IV_LEN]) -> Result<Self, UpdateError> {
        let invalid = |_| UpdateError::Config(format!("invalid key length {}", key.len()));
        Ok(match key.len() {
            16 => Self::Aes128(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            24 => Self::Aes192(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            32 => Self::Aes256(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?),
            n => {
                return Err(UpdateError::Config(format!(
                    "invalid key length {n}: must be 16, 24 or 32 bytes"
                )))
            }
        })
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.apply_keystream(buf),
            Self::Aes192(c) => c.apply_keystream(buf),
            Self::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// `{path}.tmp` next to `path`.
fn temp_path(path: &Path) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(".tmp");
    PathBuf::from(s)
}

/// Write through `{dst}.tmp` and rename over `dst` only on success.
/// The temp file is removed on failure.
fn write_atomically<F>(dst: &Path, write: F) -> Result<(), UpdateError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), UpdateError>,
{
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(dst);
    let result = (|| -> Result<(), UpdateError> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        write(&mut out)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&tmp, dst)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn stream<R: Read, W: Write>(
    cipher: &mut PackageCipher,
    input: &mut R,
    output: &mut W,
) -> Result<u64, UpdateError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        cipher.apply(&mut buf[..n]);
        output.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Decrypts (and, for publishers, encrypts) package files with a program's
/// base64 AES key.
#[derive(Clone)]
pub struct PackageDecryptor {
    key: Vec<u8>,
}

impl PackageDecryptor {
    /// Fails with [`UpdateError::Config`] unless the key decodes to 16, 24 or 32 bytes.
    pub fn new(base64_key: &str) -> Result<Self, UpdateError> {
        let key = B64
            .decode(base64_key.trim())
            .map_err(|_| UpdateError::Config("encryption key is not valid base64".into()))?;
        match key.len() {
            16 | 24 | 32 => Ok(Self { key }),
            n => Err(UpdateError::Config(format!(
                "invalid key length {n}: must be 16, 24 or 32 bytes"
            ))),
        }
    }

    /// Decrypt `src` into `dst`. `src` and `dst` may be the same path.
    pub fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<(), UpdateError> {
        let mut input = File::open(src)?;
        let mut iv = [0u8; IV_LEN];
        input.read_exact(&mut iv).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                UpdateError::Decryption("package is shorter than its IV".into())
            }
            _ => UpdateError::File(e),
        })?;
        let mut cipher = PackageCipher::new(&self.key, &iv)?;

        write_atomically(dst, |out| {
            let bytes = stream(&mut cipher, &mut input, out)?;
            debug!(bytes, dst = %dst.display(), "decrypted package");
            Ok(())
        })
    }

    /// Encrypt `src` into `dst` under a fresh random IV.
    pub fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<(), UpdateError> {
        let mut input = File::open(src)?;
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut cipher = PackageCipher::new(&self.key, &iv)?;

        write_atomically(dst, |out| {
            out.write_all(&iv)?;
            stream(&mut cipher, &mut input, out)?;
            Ok(())
        })
    }
}

/// Decrypt a package file with a base64 key.
pub fn decrypt_package(src: &Path, dst: &Path, base64_key: &str) -> Result<(), UpdateError> {
    PackageDecryptor::new(base64_key)?.decrypt_file(src, dst)
}

/// Encrypt a package file with a base64 key, producing the IV-prefixed format.
pub fn encrypt_package(src: &Path, dst: &Path, base64_key: &str) -> Result<(), UpdateError> {
    PackageDecryptor::new(base64_key)?.encrypt_file(src, dst)
}
