//! Key wrapping to the holder of a certificate.
//!
//! A random data key is wrapped for a P-256 recipient with ephemeral-static
//! ECDH. The shared secret goes through HKDF-SHA256 (salt: the ephemeral
//! public key) to an AES-256-GCM key that seals the data key, with the
//! recipient's public key as associated data.

use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::{self, KEY_SIZE};
use crate::csr::RequestPublicKey;
use crate::error::CryptoError;
use crate::keys::{KeyAlgorithm, PrivateKey};

const WRAP_INFO: &[u8] = b"caucase key wrap v1";

/// A data key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Uncompressed SEC1 point of the sender's ephemeral key.
    pub ephemeral_public_key: Vec<u8>,
    /// The data key sealed under the derived wrapping key.
    pub ciphertext: Vec<u8>,
}

/// Wraps `data_key` so only the holder of `recipient`'s private key can recover it.
pub fn wrap_key(
    recipient: &RequestPublicKey,
    data_key: &[u8; KEY_SIZE],
) -> Result<WrappedKey, CryptoError> {
    let recipient_point = p256_point(recipient)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public_key = ephemeral
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    let shared = ephemeral.diffie_hellman(&recipient_point);

    let wrapping_key = derive_wrapping_key(
        shared.raw_secret_bytes().as_slice(),
        &ephemeral_public_key,
    )?;
    let ciphertext = aead::seal(&wrapping_key, data_key, recipient.raw())?;

    Ok(WrappedKey {
        ephemeral_public_key,
        ciphertext,
    })
}

/// Recovers a data key wrapped for `key`'s public half.
pub fn unwrap_key(
    key: &PrivateKey,
    wrapped: &WrappedKey,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let secret = p256::SecretKey::from_pkcs8_der(&key.pkcs8_der())
        .map_err(|e| CryptoError::UnsupportedAlgorithm(format!("key wrap needs P-256: {e}")))?;
    let ephemeral = p256::PublicKey::from_sec1_bytes(&wrapped.ephemeral_public_key)
        .map_err(|_| CryptoError::DecryptionFailed("bad ephemeral key".to_string()))?;

    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
    let wrapping_key = derive_wrapping_key(
        shared.raw_secret_bytes().as_slice(),
        &wrapped.ephemeral_public_key,
    )?;

    let recipient = secret.public_key().to_encoded_point(false);
    let opened = aead::open(&wrapping_key, &wrapped.ciphertext, recipient.as_bytes())?;
    if opened.len() != KEY_SIZE {
        return Err(CryptoError::DecryptionFailed("wrapped key has wrong size".to_string()));
    }

    let mut data_key = Zeroizing::new([0u8; KEY_SIZE]);
    data_key.copy_from_slice(&opened);
    Ok(data_key)
}

/// Whether keys of this family can receive wrapped keys.
pub fn can_receive(recipient: &RequestPublicKey) -> bool {
    recipient.key_algorithm() == KeyAlgorithm::EcdsaP256
}

fn p256_point(recipient: &RequestPublicKey) -> Result<p256::PublicKey, CryptoError> {
    if !can_receive(recipient) {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "cannot wrap keys for {:?}",
            recipient.key_algorithm()
        )));
    }
    p256::PublicKey::from_sec1_bytes(recipient.raw())
        .map_err(|_| CryptoError::InvalidKey("bad P-256 point".to_string()))
}

fn derive_wrapping_key(
    shared_secret: &[u8],
    ephemeral_public_key: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral_public_key), shared_secret);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(WRAP_INFO, &mut *key)
        .map_err(|_| CryptoError::KeyGenerationFailed("HKDF expansion failed".to_string()))?;
    Ok(key)
}
