//! WireGuard key generation
//!
//! Produces x25519 keypairs in the encoding the `wg` tooling expects:
//! 32-byte clamped private scalar and the matching Curve25519 public key,
//! both base64.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard key pair, base64-encoded
#[derive(Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a fresh WireGuard keypair.
///
/// Every call consumes fresh system randomness; callers cannot supply their
/// own. An entropy-source failure is fatal to the enclosing request.
pub fn generate_keypair() -> Result<WgKeyPair> {
    let mut private_key_bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut private_key_bytes)
        .map_err(|e| Error::Generation(format!("system randomness unavailable: {}", e)))?;

    // Curve25519 scalar clamping, as the wg tools do
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    Ok(WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

/// Validate that a string is a plausible WireGuard public key
/// (base64 of exactly 32 bytes).
pub fn validate_public_key(key: &str) -> Result<()> {
    let bytes = STANDARD
        .decode(key)
        .map_err(|_| Error::Validation(format!("public key is not valid base64: {}", key)))?;
    if bytes.len() != 32 {
        return Err(Error::Validation(format!(
            "public key must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}
