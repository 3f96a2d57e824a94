//! AES-256-GCM authenticated encryption.
//!
//! Sealed output is `nonce (12 bytes) || ciphertext || tag (16 bytes)`. Every
//! call binds associated data, so a sealed blob moved to another position or
//! context fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::random::generate_nonce;

/// Size of an AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Bytes `seal` adds to its input.
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Encrypts `plaintext` under `key`, authenticating `aad` alongside.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverses [`seal`]. Fails unless `key` and `aad` are the ones sealed with.
pub fn open(
    key: &[u8; KEY_SIZE],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < OVERHEAD {
        return Err(CryptoError::DecryptionFailed("ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed("authentication failed".to_string()))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::random::generate_key;

    #[test]
    fn test_sealed_layout() {
        let key = generate_key();
        let sealed = seal(&key, b"rows", b"chunk 0").unwrap();
        assert_eq!(sealed.len(), b"rows".len() + OVERHEAD);
        assert_eq!(&*open(&key, &sealed, b"chunk 0").unwrap(), b"rows");
    }

    #[test]
    fn test_nonces_differ() {
        let key = generate_key();
        let first = seal(&key, b"same", b"").unwrap();
        let second = seal(&key, b"same", b"").unwrap();
        assert_ne!(first[..NONCE_SIZE], second[..NONCE_SIZE]);
    }

    #[test]
    fn test_wrong_key_or_context_fails() {
        let key = generate_key();
        let sealed = seal(&key, b"secret", b"chunk 1").unwrap();

        assert!(matches!(
            open(&generate_key(), &sealed, b"chunk 1"),
            Err(CryptoError::DecryptionFailed(_))
        ));
        assert!(open(&key, &sealed, b"chunk 2").is_err());
    }

    #[test]
    fn test_tampering_detected() {
        let key = generate_key();
        let mut sealed = seal(&key, b"secret", b"").unwrap();
        sealed[NONCE_SIZE] ^= 0xff;
        assert!(open(&key, &sealed, b"").is_err());
        assert!(open(&key, &sealed[..OVERHEAD - 1], b"").is_err());
    }
}
