//! ib_proto — Wire types and serialisation for the Inbox Bridge relay
//!
//! All on-wire types are MessagePack-encoded. The outer [`Envelope`] is what
//! the relay server routes; relay frames travel sealed inside it.
//!
//! # Modules
//! - `envelope`  — Outer envelope (registration, handshake, sealed relay payload)
//! - `handshake` — Establishment protocol messages and their encoded steps
//! - `message`   — Relay frame sum type (inside the sealed payload)
//! - `codec`     — Encoding, decoding, sealing and opening of frames

pub mod codec;
pub mod envelope;
pub mod handshake;
pub mod message;

pub use codec::CodecError;
pub use envelope::Envelope;
pub use handshake::HandshakeMessage;
pub use message::{DiscussionSummary, ErrorCode, PingPong, UploadNotice, WebFrame, WebMessage, WebSettings};
