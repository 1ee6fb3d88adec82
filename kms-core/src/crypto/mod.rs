pub mod dek_cache;
pub mod envelope;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Plaintext data-encryption key; wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; DEK_LEN]);

impl Dek {
    /// Fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; DEK_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; DEK_LEN]) -> Self {
        Self(bytes)
    }

    /// Accepts only exactly [`DEK_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DEK_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; DEK_LEN] {
        &self.0
    }

    pub(crate) fn zeroed() -> Self {
        Self([0u8; DEK_LEN])
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek(<redacted>)")
    }
}

/// AEAD failure; deliberately carries no detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeadError;

/// AES-256-GCM seal; output is `nonce || ciphertext || tag`.
pub fn seal(dek: &Dek, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|_| AeadError)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]; fails if the data, nonce or `aad` were altered.
pub fn open(dek: &Dek, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, AeadError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(AeadError);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(dek.as_bytes()).map_err(|_| AeadError)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_with_matching_aad() {
        let dek = Dek::generate();
        let sealed = seal(&dek, b"default/mysecret", b"payload").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + b"payload".len() + TAG_LEN);
        assert_eq!(open(&dek, b"default/mysecret", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn wrong_aad_or_key_fails() {
        let dek = Dek::generate();
        let sealed = seal(&dek, b"a", b"payload").unwrap();
        assert_eq!(open(&dek, b"b", &sealed), Err(AeadError));
        assert_eq!(open(&Dek::generate(), b"a", &sealed), Err(AeadError));
        assert_eq!(open(&dek, b"a", &sealed[..10]), Err(AeadError));
    }

    #[test]
    fn nonces_differ_between_seals() {
        let dek = Dek::generate();
        let a = seal(&dek, b"", b"same").unwrap();
        let b = seal(&dek, b"", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn dek_length_is_enforced() {
        assert!(Dek::from_slice(&[0u8; 31]).is_none());
        assert!(Dek::from_slice(&[0u8; DEK_LEN]).is_some());
        assert_eq!(format!("{:?}", Dek::generate()), "Dek(<redacted>)");
    }
}
