//! ib_bridge — Relay connection between the app and its web client
//!
//! The app and the browser never talk directly: both register with a relay
//! server, run a three-message establishment handshake through it, confirm
//! a short authentication string out of band, and from then on exchange
//! sealed [`ib_proto::WebFrame`]s.
//!
//! # Modules
//! - `state`      — Connection state machine and the timer work of each transition
//! - `manager`    — Connection actor owning state, key, transport and timers
//! - `dispatcher` — Inbound relay frame handling and message de-duplication
//! - `upload`     — Reassembly of files uploaded by the web client
//! - `download`   — Streaming local attachments with cooperative backpressure
//! - `transport`  — Relay links (TCP framing, in-process links)
//! - `timers`     — Cancellable timers posting into the actor queue
//! - `backend`    — What the bridge needs from the application
//! - `config`     — Tunables with file and environment sources

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod manager;
pub mod state;
pub mod timers;
pub mod transport;
pub mod upload;

pub use backend::BridgeBackend;
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use manager::{spawn, BridgeHandle, BridgeStatus, PairingInfo};
pub use state::ConnectionState;
pub use transport::{MemoryConnector, MemoryPeer, TcpConnector, TransportConnector};
pub use upload::FinishedUpload;
