//! ib_crypto — Inbox Bridge cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Length arithmetic is guarded and returns typed errors, never panics.
//!
//! # Module layout
//! - `aead`          — XChaCha20-Poly1305 encrypt/decrypt helpers + expansion law
//! - `chunk`         — chunk codec: plaintext/ciphertext lengths, chunk counts, per-chunk sealing
//! - `establishment` — KEM + commitment handshake with SAS for the web client bridge
//! - `kdf`           — HKDF key derivation, seed combination
//! - `hash`          — BLAKE3 utilities (attachment directories, content hashes)
//! - `error`         — unified error types

pub mod aead;
pub mod chunk;
pub mod error;
pub mod establishment;
pub mod hash;
pub mod kdf;

pub use aead::SymmetricKey;
pub use error::{ChunkLengthError, CryptoError};
