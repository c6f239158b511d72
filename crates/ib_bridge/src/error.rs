use ib_crypto::CryptoError;
use ib_proto::CodecError;
use thiserror::Error;

use crate::state::ConnectionState;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Envelope {kind} not expected in state {state:?}")]
    UnexpectedEnvelope {
        kind: &'static str,
        state: ConnectionState,
    },

    #[error("No session key; handshake not completed")]
    NoSessionKey,

    #[error("Relay server error code {0}")]
    Server(u32),

    #[error("Upload notice rejected: {0}")]
    UploadNotice(&'static str),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bridge task is gone")]
    Stopped,
}
