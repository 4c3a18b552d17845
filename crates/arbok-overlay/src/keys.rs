//! WireGuard key factory
//!
//! Native X25519 key generation, no external binary required. Keys travel
//! as base64 everywhere outside the data plane.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::{rngs::OsRng, RngCore};

use crate::error::{OverlayError, Result};

/// Generate a WireGuard keypair. Returns `(private_b64, public_b64)`.
///
/// The private key is clamped per the curve25519 convention before the
/// public key is derived from it.
pub fn generate_keypair() -> (String, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    clamp(&mut bytes);

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);

    (STANDARD.encode(secret.to_bytes()), STANDARD.encode(public.as_bytes()))
}

/// Derive the base64 public key for a base64 private key.
///
/// Does not re-clamp: clamping is the generator's contract.
pub fn derive_public(private_b64: &str) -> Result<String> {
    let bytes = decode_key(private_b64)?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Decode a base64 key and validate its length.
pub fn decode_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| OverlayError::InvalidKey(e.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        OverlayError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
    })
}

fn clamp(key: &mut [u8; 32]) {
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
}
