//! Database row models mapped to and from SQL rows.
//!
//! Identifiers are opaque byte strings. All timestamps are milliseconds
//! since the Unix epoch, taken from the store's [`crate::Clock`].

use std::fmt;

use ib_crypto::{chunk, ChunkLengthError};

/// (owned identity, message uid)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub owner: Vec<u8>,
    pub uid: Vec<u8>,
}

impl MessageKey {
    pub fn new(owner: impl Into<Vec<u8>>, uid: impl Into<Vec<u8>>) -> Self {
        Self {
            owner: owner.into(),
            uid: uid.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", short_hex(&self.owner), short_hex(&self.uid))
    }
}

/// (owned identity, message uid, attachment number)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentKey {
    pub owner: Vec<u8>,
    pub message_uid: Vec<u8>,
    pub index: i64,
}

impl AttachmentKey {
    pub fn new(owner: impl Into<Vec<u8>>, message_uid: impl Into<Vec<u8>>, index: i64) -> Self {
        Self {
            owner: owner.into(),
            message_uid: message_uid.into(),
            index,
        }
    }

    pub fn message(&self) -> MessageKey {
        MessageKey::new(self.owner.clone(), self.message_uid.clone())
    }
}

impl fmt::Display for AttachmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{}",
            short_hex(&self.owner),
            short_hex(&self.message_uid),
            self.index
        )
    }
}

fn short_hex(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(6)];
    hex::encode(shown)
}

/// How a requested download is ordered against the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityCategory {
    /// Least remaining bytes first.
    Weight,
    /// Oldest request first.
    Timestamp,
    Other,
}

impl PriorityCategory {
    pub fn as_i64(self) -> i64 {
        match self {
            PriorityCategory::Weight => 0,
            PriorityCategory::Timestamp => 1,
            PriorityCategory::Other => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => PriorityCategory::Weight,
            1 => PriorityCategory::Timestamp,
            _ => PriorityCategory::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AttachmentRecord {
    pub owned_identity: Vec<u8>,
    pub message_uid: Vec<u8>,
    pub attachment_number: i64,
    /// Total ciphertext bytes the server will deliver.
    pub expected_length: i64,
    /// Ciphertext bytes per chunk (the last one may be shorter).
    pub chunk_length: i64,
    /// Immutable once set.
    pub key: Option<Vec<u8>>,
    pub metadata: Option<Vec<u8>>,
    pub received_length: i64,
    /// Bytes written to the backing file so far.
    pub plaintext_file_length: i64,
    pub priority_category: Option<i64>,
    pub download_requested: bool,
    pub request_timestamp: Option<i64>,
    pub marked_for_deletion: bool,
    /// JSON array of chunk download URLs, in chunk order.
    pub source_urls: String,
}

impl AttachmentRecord {
    pub fn key(&self) -> AttachmentKey {
        AttachmentKey::new(
            self.owned_identity.clone(),
            self.message_uid.clone(),
            self.attachment_number,
        )
    }

    pub fn source_urls(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.source_urls)
    }

    pub fn category(&self) -> Option<PriorityCategory> {
        self.priority_category.map(PriorityCategory::from_i64)
    }

    /// Ascending queue key: lower runs first.
    pub fn priority(&self) -> i64 {
        match self.category() {
            Some(PriorityCategory::Weight) => self.expected_length - self.received_length,
            Some(PriorityCategory::Timestamp) => -self.request_timestamp.unwrap_or(0),
            _ => 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_length == self.expected_length
    }

    /// Download progress in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        if self.expected_length <= 0 {
            return 0.0;
        }
        self.received_length as f32 / self.expected_length as f32
    }

    pub fn received_chunk_count(&self) -> Result<u64, ChunkLengthError> {
        chunk::received_chunk_count(
            self.received_length as u64,
            self.expected_length as u64,
            self.chunk_length as u64,
        )
    }

    /// Plaintext size of the finished file.
    pub fn plaintext_expected_length(&self) -> Result<u64, ChunkLengthError> {
        chunk::plaintext_length(self.expected_length as u64, self.chunk_length as u64)
    }

    /// Plaintext covered by what was received so far, derived from the
    /// ciphertext length rather than stored.
    pub fn plaintext_received_length(&self) -> Result<u64, ChunkLengthError> {
        chunk::plaintext_length(self.received_length as u64, self.chunk_length as u64)
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MessageRecord {
    pub owned_identity: Vec<u8>,
    pub uid: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub encrypted_content: Vec<u8>,
    pub has_extended_content: bool,
    pub server_timestamp: i64,
    pub download_timestamp: i64,
    pub local_download_timestamp: i64,
    /// Sender not resolvable yet; kept out of the decrypted queue.
    pub on_hold: bool,
    pub marked_for_deletion: bool,
    pub payload: Option<Vec<u8>>,
    pub from_identity: Option<Vec<u8>>,
    pub from_device_uid: Option<Vec<u8>>,
    pub extended_payload_key: Option<Vec<u8>>,
    pub extended_payload: Option<Vec<u8>>,
}

impl MessageRecord {
    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.owned_identity.clone(), self.uid.clone())
    }

    /// Payload and sender are both known. Never reverts.
    pub fn is_processed(&self) -> bool {
        self.payload.is_some() && self.from_identity.is_some()
    }
}

/// Everything the network layer knows about a freshly listed message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub key: MessageKey,
    pub encrypted_content: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub server_timestamp: i64,
    pub download_timestamp: i64,
    pub local_download_timestamp: i64,
    pub has_extended_content: bool,
}

/// Server-side metadata of one attachment, as listed with its message.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub key: AttachmentKey,
    pub expected_length: i64,
    pub chunk_length: i64,
    pub source_urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expected: i64, received: i64) -> AttachmentRecord {
        AttachmentRecord {
            owned_identity: vec![1],
            message_uid: vec![2],
            attachment_number: 0,
            expected_length: expected,
            chunk_length: 300,
            key: None,
            metadata: None,
            received_length: received,
            plaintext_file_length: 0,
            priority_category: None,
            download_requested: false,
            request_timestamp: None,
            marked_for_deletion: false,
            source_urls: "[]".into(),
        }
    }

    #[test]
    fn received_chunk_count_tracks_completion() {
        assert_eq!(record(1000, 900).received_chunk_count(), Ok(3));
        assert_eq!(record(1000, 1000).received_chunk_count(), Ok(4));
    }

    #[test]
    fn priority_per_category() {
        let mut att = record(1000, 400);
        assert_eq!(att.priority(), 0);

        att.priority_category = Some(PriorityCategory::Weight.as_i64());
        assert_eq!(att.priority(), 600);

        att.priority_category = Some(PriorityCategory::Timestamp.as_i64());
        att.request_timestamp = Some(1_700_000_000_000);
        assert_eq!(att.priority(), -1_700_000_000_000);

        att.priority_category = Some(PriorityCategory::Other.as_i64());
        assert_eq!(att.priority(), 0);
    }

    #[test]
    fn key_display_is_short_hex() {
        let key = AttachmentKey::new(vec![0xab; 32], vec![0xcd, 0xef], 3);
        assert_eq!(key.to_string(), "abababababab/cdef#3");
    }
}
