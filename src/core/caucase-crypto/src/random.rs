//! Cryptographically secure random generation.
//!
//! Uses the operating system's CSPRNG for all random number generation.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::{KEY_SIZE, NONCE_SIZE};

/// Length of generated certificate serials.
pub const SERIAL_LEN: usize = 16;

/// Generates cryptographically secure random bytes.
pub fn generate_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generates a random AES-256 key, cleared from memory on drop.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut *key);
    key
}

/// Generates a random GCM nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Generates a certificate serial.
///
/// The high bit is cleared so the DER INTEGER stays positive without a
/// padding byte, and the first byte is never zero so the encoding is minimal.
pub fn generate_serial() -> Vec<u8> {
    let mut serial = generate_bytes(SERIAL_LEN);
    serial[0] &= 0x7f;
    if serial[0] == 0 {
        serial[0] = 0x01;
    }
    serial
}

/// Renders a serial as lowercase hex without leading zero bytes.
pub fn serial_hex(bytes: &[u8]) -> String {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let trimmed = &bytes[first..];
    if trimmed.is_empty() {
        return "00".to_string();
    }
    hex::encode(trimmed)
}
