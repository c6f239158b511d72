//! Key derivation functions
//!
//! `hkdf_expand`: HKDF-SHA256, used for every derived key in the crate.
//!
//! `combine_seeds` / `derive_symmetric_key`: the last two steps of the
//!   establishment protocol: both KEM-derived keys are folded into one seed,
//!   which is then expanded into the relay channel key.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{aead::SymmetricKey, error::CryptoError};

const CHANNEL_SALT: &[u8] = b"ib-bridge-channel-v1";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Fold the app-side and browser-side KEM keys into a single 32-byte seed.
///
/// The order of the arguments is fixed by role, not by who computes it, so
/// both parties obtain the same seed.
pub fn combine_seeds(app_key: &[u8; 32], browser_key: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(app_key);
    ikm.extend_from_slice(browser_key);
    let mut seed = [0u8; 32];
    let res = hkdf_expand(&ikm, Some(CHANNEL_SALT), b"seed-combination", &mut seed);
    ikm.zeroize();
    res.map(|_| seed)
}

/// Derive the AEAD key used for every relay frame from a combined seed.
pub fn derive_symmetric_key(seed: &[u8; 32]) -> Result<SymmetricKey, CryptoError> {
    let mut key = [0u8; 32];
    hkdf_expand(seed, Some(CHANNEL_SALT), b"relay-aead-key", &mut key)?;
    Ok(SymmetricKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_combination_is_order_sensitive() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(combine_seeds(&a, &b).unwrap(), combine_seeds(&a, &b).unwrap());
        assert_ne!(combine_seeds(&a, &b).unwrap(), combine_seeds(&b, &a).unwrap());
    }
}
