use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch, possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Public key decoding failed: expected {expected} bytes, got {actual}")]
    PublicKeyDecoding { expected: usize, actual: usize },

    #[error("Key encapsulation failed: {0}")]
    Encapsulation(String),

    #[error("Key decapsulation failed: {0}")]
    Decapsulation(String),

    #[error("Commitment does not open to the revealed value")]
    CommitmentMismatch,

    #[error("Establishment step {attempted} is not valid after {current}")]
    OutOfOrderStep {
        attempted: &'static str,
        current: &'static str,
    },

    #[error("Establishment session already failed; start a new one")]
    SessionPoisoned,

    #[error("Derived key missing: {0}")]
    MissingDerivedKey(&'static str),
}

/// Guarded chunk arithmetic failures.
///
/// These are caller contract violations (a corrupt length pairing), surfaced
/// as a typed result instead of a panic or a silent wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkLengthError {
    #[error("Chunk length must be non-zero")]
    ZeroChunkLength,

    #[error("Ciphertext chunk of {len} bytes is shorter than the AEAD overhead ({overhead})")]
    ChunkShorterThanOverhead { len: u64, overhead: u64 },

    #[error("Received length {received} exceeds expected length {expected}")]
    ReceivedExceedsExpected { received: u64, expected: u64 },
}
