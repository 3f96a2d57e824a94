//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Input is not the expected PEM block.
    #[error("invalid pem: {0}")]
    InvalidPem(String),

    /// Malformed or self-inconsistent signing request.
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    /// Malformed certificate.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Key type the authority does not handle.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Building or signing a certificate, request or CRL failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// Sealing data or wrapping a key failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext did not authenticate under the given key.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Signature verification failed.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
