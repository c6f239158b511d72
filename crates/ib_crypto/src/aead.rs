//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (24 bytes) | ciphertext + tag ]
//!
//! The expansion is a pure function of the plaintext length, which is what
//! the chunk codec relies on to convert between plaintext and ciphertext sizes.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    XChaCha20Poly1305,
};
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
/// Bytes added to every plaintext by [`encrypt`].
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// 32-byte symmetric key for the relay channel and attachment chunks. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32-byte symmetric key".into()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Ciphertext length produced for a plaintext of `plaintext_len` bytes.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + OVERHEAD
}

/// Plaintext length recovered from a ciphertext of `ciphertext_len` bytes,
/// or `None` if the ciphertext cannot even hold the nonce and tag.
pub const fn plaintext_len(ciphertext_len: usize) -> Option<usize> {
    ciphertext_len.checked_sub(OVERHEAD)
}

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad`: additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(
    key: &SymmetricKey,
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < OVERHEAD {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = chacha20poly1305::XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, chacha20poly1305::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_matches_overhead() {
        let key = SymmetricKey::from_bytes([7u8; 32]);
        let ct = encrypt(&key, b"hello", b"aad").unwrap();
        assert_eq!(ct.len(), ciphertext_len(5));
        assert_eq!(plaintext_len(ct.len()), Some(5));
        assert_eq!(&decrypt(&key, &ct, b"aad").unwrap()[..], b"hello");
    }

    #[test]
    fn wrong_aad_is_rejected() {
        let key = SymmetricKey::from_bytes([7u8; 32]);
        let ct = encrypt(&key, b"hello", b"chunk-0").unwrap();
        assert!(matches!(
            decrypt(&key, &ct, b"chunk-1"),
            Err(CryptoError::AeadDecrypt)
        ));
    }

    #[test]
    fn short_input_is_rejected() {
        let key = SymmetricKey::from_bytes([1u8; 32]);
        assert!(decrypt(&key, &[0u8; OVERHEAD - 1], b"").is_err());
        assert_eq!(plaintext_len(OVERHEAD - 1), None);
    }
}
