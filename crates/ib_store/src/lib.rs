//! ib_store — Inbox message and attachment storage
//!
//! # Model
//! - `inbox_message`: one row per (owned identity, message uid), holding
//!   the encrypted envelope until it is unwrapped, then payload and sender.
//! - `inbox_attachment`: download bookkeeping per attachment. The bytes
//!   live in a file under the attachment directory, one directory per
//!   message (see [`files`]).
//! - `pending_server_delete`: messages the server may drop.
//!
//! # Notifications
//! Every mutation runs in a [`UnitOfWork`] and queues what it changed.
//! Listeners registered with [`Store::subscribe`] see those changes only
//! after the commit succeeded, once per change kind and record.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on open.

pub mod attachment;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod message;
pub mod models;
pub mod notify;
pub mod replay;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use db::{Store, UnitOfWork};
pub use error::StoreError;
pub use message::{clear_pending_server_delete, pending_server_deletes};
pub use models::{
    AttachmentKey, AttachmentRecord, MessageKey, MessageRecord, NewAttachment, NewMessage,
    PriorityCategory,
};
pub use notify::{InboxListener, PendingNotification};
