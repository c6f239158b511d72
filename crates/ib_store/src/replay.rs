//! Anti-replay memory of recently deleted messages.
//!
//! The server may list a message again shortly after we deleted it locally
//! (its own deletion is asynchronous). Keys stay here for the retention
//! window so the re-listing is not processed twice. In-memory only.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::models::MessageKey;

pub struct RecentlyDeleted {
    retention_millis: i64,
    entries: Mutex<HashMap<MessageKey, i64>>,
}

impl RecentlyDeleted {
    pub fn new(retention_millis: i64) -> Self {
        Self {
            retention_millis,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, key: &MessageKey, now: i64) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|deleted_at| now - deleted_at < self.retention_millis)
    }

    pub fn record(&self, key: MessageKey, now: i64) {
        self.entries.lock().insert(key, now);
    }

    /// Drop entries older than the retention window; returns how many went.
    pub fn purge_expired(&self, now: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, deleted_at| now - *deleted_at < self.retention_millis);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(uid: u8) -> MessageKey {
        MessageKey::new(vec![1], vec![uid])
    }

    #[test]
    fn entries_expire_after_retention() {
        let set = RecentlyDeleted::new(600_000);
        set.record(key(1), 1_000);
        assert!(set.contains(&key(1), 1_000 + 599_999));
        assert!(!set.contains(&key(1), 1_000 + 600_000));
        assert!(!set.contains(&key(2), 1_000));
    }

    #[test]
    fn purge_keeps_fresh_entries() {
        let set = RecentlyDeleted::new(100);
        set.record(key(1), 0);
        set.record(key(2), 80);
        assert_eq!(set.purge_expired(150), 1);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&key(2), 150));
    }
}
