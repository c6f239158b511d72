//! BLAKE3-based hash utilities
//!
//! - Per-message attachment directory names
//! - Content-addressing for uploaded attachments
//! - Commitment digests for the establishment protocol

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Directory name holding every attachment file of one message.
///
/// Deterministic in (owner identity, message uid); the length prefix keeps
/// `("ab", "c")` and `("a", "bc")` apart.
pub fn message_directory(owner: &[u8], message_uid: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"ib-inbox-dir-v1\x00");
    hasher.update(&(owner.len() as u64).to_le_bytes());
    hasher.update(owner);
    hasher.update(message_uid);
    hex::encode(hasher.finalize().as_bytes())
}

/// Content hash for an attachment (used as dedup key / integrity check).
pub fn attachment_hash(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_directory_is_deterministic_and_unambiguous() {
        assert_eq!(message_directory(b"ab", b"c"), message_directory(b"ab", b"c"));
        assert_ne!(message_directory(b"ab", b"c"), message_directory(b"a", b"bc"));
        assert_eq!(message_directory(b"x", b"y").len(), 64);
    }
}
