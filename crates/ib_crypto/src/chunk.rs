//! Chunk codec: conversion between plaintext byte ranges and the
//! fixed-length ciphertext chunks attachments travel in.
//!
//! An attachment of `E` ciphertext bytes with chunk length `C` is cut into
//! `floor((E - 1) / C)` full chunks followed by one final chunk of
//! `E - full * C` bytes (between 1 and `C`). Each chunk is sealed on its own
//! with [`crate::aead`], so its plaintext is `ciphertext - OVERHEAD` bytes.

use crate::{
    aead::{self, SymmetricKey, OVERHEAD},
    error::{ChunkLengthError, CryptoError},
};
use zeroize::Zeroizing;

const CHUNK_AAD_PREFIX: &[u8] = b"ib-chunk-v1";

fn chunk_plaintext(len: u64) -> Result<u64, ChunkLengthError> {
    len.checked_sub(OVERHEAD as u64)
        .ok_or(ChunkLengthError::ChunkShorterThanOverhead {
            len,
            overhead: OVERHEAD as u64,
        })
}

/// Plaintext bytes carried by `ciphertext_total` bytes of chunked ciphertext.
///
/// A total of zero maps to zero explicitly; it is the one case where the
/// "full chunk" count `(total - 1) / chunk` would underflow.
pub fn plaintext_length(ciphertext_total: u64, chunk_len: u64) -> Result<u64, ChunkLengthError> {
    if chunk_len == 0 {
        return Err(ChunkLengthError::ZeroChunkLength);
    }
    if ciphertext_total == 0 {
        return Ok(0);
    }
    let full_chunks = (ciphertext_total - 1) / chunk_len;
    let last_chunk = ciphertext_total - full_chunks * chunk_len;
    let full_plaintext = if full_chunks == 0 {
        0
    } else {
        full_chunks * chunk_plaintext(chunk_len)?
    };
    Ok(full_plaintext + chunk_plaintext(last_chunk)?)
}

/// Ciphertext bytes needed to carry `plaintext_total` bytes in chunks of
/// `chunk_len` ciphertext bytes. Inverse of [`plaintext_length`].
pub fn ciphertext_length(plaintext_total: u64, chunk_len: u64) -> Result<u64, ChunkLengthError> {
    let per_chunk = plaintext_chunk_len(chunk_len)?;
    let full_chunks = plaintext_total / per_chunk;
    let rest = plaintext_total % per_chunk;
    let mut total = full_chunks * chunk_len;
    if rest > 0 || plaintext_total == 0 {
        total += rest + OVERHEAD as u64;
    }
    Ok(total)
}

/// Plaintext bytes a sender puts in each chunk of `chunk_len` ciphertext bytes.
pub fn plaintext_chunk_len(chunk_len: u64) -> Result<u64, ChunkLengthError> {
    if chunk_len == 0 {
        return Err(ChunkLengthError::ZeroChunkLength);
    }
    match chunk_plaintext(chunk_len)? {
        0 => Err(ChunkLengthError::ChunkShorterThanOverhead {
            len: chunk_len,
            overhead: OVERHEAD as u64,
        }),
        n => Ok(n),
    }
}

/// Number of chunks covered by `received` bytes out of `expected`.
///
/// Once everything arrived the short final chunk counts as a chunk of its
/// own; before that only whole chunks are counted. This is what tells
/// "exactly N full chunks" apart from "N full chunks, short one pending".
pub fn received_chunk_count(
    received: u64,
    expected: u64,
    chunk_len: u64,
) -> Result<u64, ChunkLengthError> {
    if chunk_len == 0 {
        return Err(ChunkLengthError::ZeroChunkLength);
    }
    if received > expected {
        return Err(ChunkLengthError::ReceivedExceedsExpected { received, expected });
    }
    if received == expected {
        if received == 0 {
            return Ok(0);
        }
        return Ok(1 + (received - 1) / chunk_len);
    }
    Ok(received / chunk_len)
}

/// Total number of chunks an attachment of `expected` bytes is cut into.
pub fn total_chunk_count(expected: u64, chunk_len: u64) -> Result<u64, ChunkLengthError> {
    received_chunk_count(expected, expected, chunk_len)
}

fn chunk_aad(index: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CHUNK_AAD_PREFIX.len() + 8);
    aad.extend_from_slice(CHUNK_AAD_PREFIX);
    aad.extend_from_slice(&index.to_le_bytes());
    aad
}

/// Seal one chunk; the index is authenticated so chunks cannot be reordered.
pub fn encrypt_chunk(key: &SymmetricKey, index: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    aead::encrypt(key, plaintext, &chunk_aad(index))
}

pub fn decrypt_chunk(
    key: &SymmetricKey,
    index: u64,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    aead::decrypt(key, ciphertext, &chunk_aad(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_distinguishes_complete_from_partial() {
        assert_eq!(received_chunk_count(900, 1000, 300), Ok(3));
        assert_eq!(received_chunk_count(1000, 1000, 300), Ok(4));
        assert_eq!(received_chunk_count(900, 900, 300), Ok(3));
        assert_eq!(received_chunk_count(0, 1000, 300), Ok(0));
        assert_eq!(received_chunk_count(0, 0, 300), Ok(0));
    }

    #[test]
    fn chunk_count_sequence_for_short_tail() {
        let counts: Vec<u64> = [4u64, 8, 10]
            .iter()
            .map(|r| received_chunk_count(*r, 10, 4).unwrap())
            .collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert_eq!(total_chunk_count(10, 4), Ok(3));
    }

    #[test]
    fn chunk_count_rejects_bad_input() {
        assert_eq!(
            received_chunk_count(11, 10, 4),
            Err(ChunkLengthError::ReceivedExceedsExpected { received: 11, expected: 10 })
        );
        assert_eq!(received_chunk_count(1, 10, 0), Err(ChunkLengthError::ZeroChunkLength));
    }

    #[test]
    fn plaintext_length_handles_exact_multiples_and_tails() {
        let c = 100u64;
        let per = c - OVERHEAD as u64;
        assert_eq!(plaintext_length(0, c), Ok(0));
        assert_eq!(plaintext_length(c, c), Ok(per));
        assert_eq!(plaintext_length(3 * c, c), Ok(3 * per));
        assert_eq!(plaintext_length(2 * c + 50, c), Ok(2 * per + 10));
        assert_eq!(plaintext_length(OVERHEAD as u64, c), Ok(0));
    }

    #[test]
    fn plaintext_length_rejects_tail_shorter_than_overhead() {
        assert!(matches!(
            plaintext_length(100 + 5, 100),
            Err(ChunkLengthError::ChunkShorterThanOverhead { len: 5, .. })
        ));
        assert_eq!(plaintext_length(10, 0), Err(ChunkLengthError::ZeroChunkLength));
    }

    #[test]
    fn ciphertext_length_inverts_plaintext_length() {
        for pt in [0u64, 1, 59, 60, 61, 600, 1234] {
            let ct = ciphertext_length(pt, 100).unwrap();
            assert_eq!(plaintext_length(ct, 100), Ok(pt), "plaintext {pt}");
        }
    }

    #[test]
    fn chunks_seal_with_their_index() {
        let key = SymmetricKey::from_bytes([9u8; 32]);
        let ct = encrypt_chunk(&key, 3, b"chunk body").unwrap();
        assert_eq!(&decrypt_chunk(&key, 3, &ct).unwrap()[..], b"chunk body");
        assert!(decrypt_chunk(&key, 4, &ct).is_err());
    }
}
