//! Commit-scoped notifications.
//!
//! Store mutations queue a [`PendingNotification`] on their
//! [`crate::UnitOfWork`]. The queue is handed to the [`NotificationBus`]
//! only after the database commit succeeded; a rollback (or dropping the
//! unit of work) discards it. Within one unit of work a notification of
//! the same kind for the same record replaces the earlier one, so each
//! category is delivered at most once per record per commit.

use std::{mem, sync::Arc};

use parking_lot::RwLock;
use tracing::trace;

use crate::models::{
    AttachmentKey, AttachmentRecord, MessageKey, MessageRecord, PriorityCategory,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PendingNotification {
    ChunkReceived {
        key: AttachmentKey,
        progress: f32,
    },
    LastChunkReceived {
        key: AttachmentKey,
    },
    DownloadRequested {
        key: AttachmentKey,
        category: PriorityCategory,
        priority: i64,
    },
    MessageDownloaded {
        message: MessageRecord,
    },
    MessageDecrypted {
        message: MessageRecord,
        attachments: Vec<AttachmentRecord>,
    },
    ExtendedPayloadAvailable {
        key: MessageKey,
    },
    ExtendedPayloadDownloaded {
        key: MessageKey,
        payload: Vec<u8>,
    },
    PendingServerDelete {
        key: MessageKey,
    },
    MarkListedOnServer {
        key: MessageKey,
    },
}

#[derive(PartialEq)]
enum Subject<'a> {
    Attachment(&'a AttachmentKey),
    Message(MessageKey),
}

impl PendingNotification {
    fn subject(&self) -> Subject<'_> {
        match self {
            PendingNotification::ChunkReceived { key, .. }
            | PendingNotification::LastChunkReceived { key }
            | PendingNotification::DownloadRequested { key, .. } => Subject::Attachment(key),
            PendingNotification::MessageDownloaded { message }
            | PendingNotification::MessageDecrypted { message, .. } => {
                Subject::Message(message.key())
            }
            PendingNotification::ExtendedPayloadAvailable { key }
            | PendingNotification::ExtendedPayloadDownloaded { key, .. }
            | PendingNotification::PendingServerDelete { key }
            | PendingNotification::MarkListedOnServer { key } => Subject::Message(key.clone()),
        }
    }

    fn same_slot(&self, other: &PendingNotification) -> bool {
        mem::discriminant(self) == mem::discriminant(other) && self.subject() == other.subject()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingNotification::ChunkReceived { .. } => "chunk_received",
            PendingNotification::LastChunkReceived { .. } => "last_chunk_received",
            PendingNotification::DownloadRequested { .. } => "download_requested",
            PendingNotification::MessageDownloaded { .. } => "message_downloaded",
            PendingNotification::MessageDecrypted { .. } => "message_decrypted",
            PendingNotification::ExtendedPayloadAvailable { .. } => "extended_payload_available",
            PendingNotification::ExtendedPayloadDownloaded { .. } => "extended_payload_downloaded",
            PendingNotification::PendingServerDelete { .. } => "pending_server_delete",
            PendingNotification::MarkListedOnServer { .. } => "mark_listed_on_server",
        }
    }
}

/// Ordered queue with per-(kind, record) coalescing.
#[derive(Debug, Default)]
pub(crate) struct NotificationQueue {
    entries: Vec<PendingNotification>,
}

impl NotificationQueue {
    pub(crate) fn push(&mut self, notification: PendingNotification) {
        match self.entries.iter_mut().find(|n| n.same_slot(&notification)) {
            Some(slot) => *slot = notification,
            None => self.entries.push(notification),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn into_vec(self) -> Vec<PendingNotification> {
        self.entries
    }
}

/// Receiver of committed inbox changes. Every method defaults to a no-op so
/// a listener only implements what it cares about.
pub trait InboxListener: Send + Sync {
    fn attachment_progress(&self, _key: &AttachmentKey, _progress: f32) {}
    fn attachment_downloaded(&self, _key: &AttachmentKey) {}
    fn attachment_download_requested(
        &self,
        _key: &AttachmentKey,
        _category: PriorityCategory,
        _priority: i64,
    ) {
    }
    fn message_downloaded(&self, _message: &MessageRecord) {}
    fn message_decrypted(&self, _message: &MessageRecord, _attachments: &[AttachmentRecord]) {}
    fn extended_payload_available(&self, _key: &MessageKey) {}
    fn extended_payload_downloaded(&self, _key: &MessageKey, _payload: &[u8]) {}
    fn pending_server_delete(&self, _key: &MessageKey) {}
    fn mark_listed_on_server(&self, _key: &MessageKey) {}
}

#[derive(Clone, Default)]
pub struct NotificationBus {
    listeners: Arc<RwLock<Vec<Arc<dyn InboxListener>>>>,
}

impl NotificationBus {
    pub fn subscribe(&self, listener: Arc<dyn InboxListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn dispatch(&self, notifications: Vec<PendingNotification>) {
        if notifications.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for notification in &notifications {
            trace!(kind = notification.kind(), "dispatching committed change");
            for listener in &listeners {
                deliver(listener.as_ref(), notification);
            }
        }
    }
}

fn deliver(listener: &dyn InboxListener, notification: &PendingNotification) {
    match notification {
        PendingNotification::ChunkReceived { key, progress } => {
            listener.attachment_progress(key, *progress)
        }
        PendingNotification::LastChunkReceived { key } => listener.attachment_downloaded(key),
        PendingNotification::DownloadRequested {
            key,
            category,
            priority,
        } => listener.attachment_download_requested(key, *category, *priority),
        PendingNotification::MessageDownloaded { message } => listener.message_downloaded(message),
        PendingNotification::MessageDecrypted {
            message,
            attachments,
        } => listener.message_decrypted(message, attachments),
        PendingNotification::ExtendedPayloadAvailable { key } => {
            listener.extended_payload_available(key)
        }
        PendingNotification::ExtendedPayloadDownloaded { key, payload } => {
            listener.extended_payload_downloaded(key, payload)
        }
        PendingNotification::PendingServerDelete { key } => listener.pending_server_delete(key),
        PendingNotification::MarkListedOnServer { key } => listener.mark_listed_on_server(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_same_record_coalesces_to_latest() {
        let key = AttachmentKey::new(vec![1], vec![2], 0);
        let mut queue = NotificationQueue::default();
        queue.push(PendingNotification::ChunkReceived {
            key: key.clone(),
            progress: 0.4,
        });
        queue.push(PendingNotification::ChunkReceived {
            key: key.clone(),
            progress: 0.8,
        });
        queue.push(PendingNotification::LastChunkReceived { key: key.clone() });
        queue.push(PendingNotification::ChunkReceived {
            key: AttachmentKey::new(vec![1], vec![2], 1),
            progress: 0.1,
        });

        let entries = queue.into_vec();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            PendingNotification::ChunkReceived { key, progress: 0.8 }
        );
    }
}
