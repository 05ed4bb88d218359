use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroizing, ZeroizeOnDrop};

/// The only algorithm the envelope codec speaks.
pub const ALGORITHM: &str = "AES-256-GCM";

/// Prefix of the HKDF salt; the program ID is appended to it.
const SALT_NAMESPACE: &str = "shipyard-envelope-salt-";

const NONCE_LEN: usize = 12;

/// 32-byte AES key derived for a single program.
#[derive(ZeroizeOnDrop)]
pub struct ProgramKey([u8; 32]);

impl ProgramKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Wire form of an encrypted request or response body.
/// `ciphertext` carries the GCM tag appended to the encrypted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted: bool,
    pub algorithm: String,
    pub iv: String,
    pub ciphertext: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unsupported envelope algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
    /// Tag mismatch, wrong program or wrong master secret. Deliberately opaque.
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
}

/// Per-program envelope encryption keyed off one server master secret.
///
/// Keys are derived on demand with HKDF-SHA256; nothing per-program is
/// persisted for this path.
#[derive(Clone)]
pub struct CryptoEnvelope {
    master: Arc<Zeroizing<Vec<u8>>>,
}

impl CryptoEnvelope {
    pub fn new(master_secret: &str) -> Self {
        Self {
            master: Arc::new(Zeroizing::new(master_secret.as_bytes().to_vec())),
        }
    }

    /// Derive the 256-bit key for `program_id`. Deterministic for a given master secret.
    pub fn derive_key(&self, program_id: &str) -> ProgramKey {
        let salt = format!("{SALT_NAMESPACE}{program_id}");
        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), self.master.as_slice());
        let mut key = [0u8; 32];
        hk.expand(&[], &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        ProgramKey(key)
    }

    /// Encrypt `plaintext` for `program_id` under a fresh random nonce.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        program_id: &str,
    ) -> Result<EncryptedEnvelope, EnvelopeError> {
        let key = self.derive_key(program_id);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EnvelopeError::Encryption)?;

        Ok(EncryptedEnvelope {
            encrypted: true,
            algorithm: ALGORITHM.to_owned(),
            iv: B64.encode(nonce_bytes),
            ciphertext: B64.encode(ciphertext),
        })
    }

    /// Decrypt an envelope addressed to `program_id`.
    pub fn decrypt(
        &self,
        envelope: &EncryptedEnvelope,
        program_id: &str,
    ) -> Result<Vec<u8>, EnvelopeError> {
        if !envelope.encrypted {
            return Err(EnvelopeError::Malformed("encrypted flag is not set"));
        }
        if envelope.algorithm != ALGORITHM {
            return Err(EnvelopeError::UnsupportedAlgorithm(
                envelope.algorithm.clone(),
            ));
        }

        let iv = B64
            .decode(&envelope.iv)
            .map_err(|_| EnvelopeError::Malformed("iv is not valid base64"))?;
        if iv.len() != NONCE_LEN {
            return Err(EnvelopeError::Malformed("iv must be 12 bytes"));
        }
        let ciphertext = B64
            .decode(&envelope.ciphertext)
            .map_err(|_| EnvelopeError::Malformed("ciphertext is not valid base64"))?;

        let key = self.derive_key(program_id);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| EnvelopeError::Decryption)
    }
}
