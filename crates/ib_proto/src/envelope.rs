//! Outer envelope exchanged with the relay server.
//!
//! The server is a DUMB RELAY: it routes by connection identifier and sees:
//!   - registration / correspondent bookkeeping frames
//!   - handshake frames (`Connection`), which carry no secret
//!   - `Relay` payloads: a [`crate::WebFrame`] sealed with the session key
//!
//! The server CANNOT see any relay frame content.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// App → server: claim an identifier on this socket.
    RegisterConnection { identifier: String },
    /// Server → app: the identifier is bound to this socket.
    ConnectionRegistered { identifier: String },
    /// App → server: pair with the web client's identifier.
    RegisterCorresponding { correspondent: String },
    /// Server → app: both ends are paired and frames will be forwarded.
    CorrespondingRegistered,
    /// Server → app: the web client (re)registered on its side.
    NewCorrespondingRegistered,
    /// Server → app: the web client's socket went away.
    CorrespondingDisconnected,
    /// Handshake frame; the payload is an encoded `HandshakeMessage`.
    Connection {
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Sealed relay frame.
    Relay {
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },
    /// Either side: orderly shutdown.
    ByeBye,
    /// Server → app: the server refused a request.
    ServerError { code: u32 },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::RegisterConnection { .. } => "register_connection",
            Envelope::ConnectionRegistered { .. } => "connection_registered",
            Envelope::RegisterCorresponding { .. } => "register_corresponding",
            Envelope::CorrespondingRegistered => "corresponding_registered",
            Envelope::NewCorrespondingRegistered => "new_corresponding_registered",
            Envelope::CorrespondingDisconnected => "corresponding_disconnected",
            Envelope::Connection { .. } => "connection",
            Envelope::Relay { .. } => "relay",
            Envelope::ByeBye => "bye_bye",
            Envelope::ServerError { .. } => "server_error",
        }
    }
}
