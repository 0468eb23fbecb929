//! WireGuard key material
//!
//! Keys are Curve25519 (X25519) scalars and points, carried around in the
//! base64 text encoding that `wg` and `wg-quick` use.

use crate::{Error, Result, ValidationError};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of a raw key in bytes
pub const KEY_LEN: usize = 32;

/// WireGuard key pair
#[derive(Clone)]
pub struct WgKeyPair {
    pub private_key: String, // Base64
    pub public_key: String,  // Base64
}

impl WgKeyPair {
    /// Generate a new random key pair from the OS entropy source
    pub fn generate() -> Result<Self> {
        let mut private_key_bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut private_key_bytes)
            .map_err(|e| Error::Entropy(e.to_string()))?;

        clamp(&mut private_key_bytes);

        Ok(Self {
            private_key: STANDARD.encode(private_key_bytes),
            public_key: STANDARD.encode(derive_public(private_key_bytes)),
        })
    }
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Decode a base64 key, checking it is exactly 32 bytes
pub fn decode_key(field: &'static str, encoded: &str) -> std::result::Result<[u8; KEY_LEN], ValidationError> {
    if encoded.is_empty() {
        return Err(ValidationError::new(field, "key is missing"));
    }
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ValidationError::new(field, format!("key is not valid base64: {}", e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ValidationError::new(
            field,
            format!("key must be {} bytes, got {}", KEY_LEN, bytes.len()),
        )
    })
}

/// Derive the encoded public key for an encoded private key
pub fn public_key_for(private_key: &str) -> std::result::Result<String, ValidationError> {
    let bytes = decode_key("private_key", private_key)?;
    Ok(STANDARD.encode(derive_public(bytes)))
}

/// Check that both keys are well-formed and belong together
pub fn check_pair(private_key: &str, public_key: &str) -> std::result::Result<(), ValidationError> {
    decode_key("public_key", public_key)?;
    if public_key_for(private_key)? != public_key {
        return Err(ValidationError::new(
            "public_key",
            "public key does not match private key",
        ));
    }
    Ok(())
}

// Same clamping `wg genkey` applies
fn clamp(bytes: &mut [u8; KEY_LEN]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

fn derive_public(private_key: [u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(private_key);
    *PublicKey::from(&secret).as_bytes()
}
