//! Attachment store operations.
//!
//! Mutations run inside a [`UnitOfWork`] and update both the row and the
//! in-memory record. After a rollback the record is stale; reload it with
//! [`AttachmentRecord::find`].

use std::path::PathBuf;

use sqlx::{Executor, Sqlite};
use tracing::{debug, info};

use crate::{
    db::UnitOfWork,
    error::StoreError,
    files::AttachmentFiles,
    models::{AttachmentKey, AttachmentRecord, MessageKey, NewAttachment, PriorityCategory},
    notify::PendingNotification,
};

impl AttachmentRecord {
    /// Insert a fresh attachment: nothing received, no key yet. The parent
    /// message must already exist.
    pub async fn create(uow: &mut UnitOfWork, new: NewAttachment) -> Result<Self, StoreError> {
        if new.key.owner.is_empty() {
            return Err(StoreError::InvalidArgument("attachment owner identity is empty"));
        }
        if new.key.message_uid.is_empty() {
            return Err(StoreError::InvalidArgument("attachment message uid is empty"));
        }
        if new.key.index < 0 {
            return Err(StoreError::InvalidArgument("attachment number is negative"));
        }
        if new.expected_length <= 0 {
            return Err(StoreError::InvalidArgument("expected length must be positive"));
        }
        if new.chunk_length <= 0 {
            return Err(StoreError::InvalidArgument("chunk length must be positive"));
        }

        let record = AttachmentRecord {
            owned_identity: new.key.owner,
            message_uid: new.key.message_uid,
            attachment_number: new.key.index,
            expected_length: new.expected_length,
            chunk_length: new.chunk_length,
            key: None,
            metadata: None,
            received_length: 0,
            plaintext_file_length: 0,
            priority_category: None,
            download_requested: false,
            request_timestamp: None,
            marked_for_deletion: false,
            source_urls: serde_json::to_string(&new.source_urls)?,
        };

        sqlx::query(
            "INSERT INTO inbox_attachment
                (owned_identity, message_uid, attachment_number, expected_length,
                 chunk_length, source_urls)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.owned_identity)
        .bind(&record.message_uid)
        .bind(record.attachment_number)
        .bind(record.expected_length)
        .bind(record.chunk_length)
        .bind(&record.source_urls)
        .execute(uow.conn())
        .await?;

        debug!(attachment = %record.key(), expected = record.expected_length, "attachment created");
        Ok(record)
    }

    pub async fn find<'e, E>(executor: E, key: &AttachmentKey) -> Result<Option<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, AttachmentRecord>(
            "SELECT * FROM inbox_attachment
             WHERE owned_identity = ? AND message_uid = ? AND attachment_number = ?",
        )
        .bind(&key.owner)
        .bind(&key.message_uid)
        .bind(key.index)
        .fetch_optional(executor)
        .await?;
        Ok(row)
    }

    pub async fn attachments_of<'e, E>(executor: E, message: &MessageKey) -> Result<Vec<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, AttachmentRecord>(
            "SELECT * FROM inbox_attachment
             WHERE owned_identity = ? AND message_uid = ?
             ORDER BY attachment_number ASC",
        )
        .bind(&message.owner)
        .bind(&message.uid)
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    /// Incomplete downloads the user asked for, lowest priority value first.
    pub async fn download_requested<'e, E>(executor: E) -> Result<Vec<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut rows = sqlx::query_as::<_, AttachmentRecord>(
            "SELECT * FROM inbox_attachment
             WHERE download_requested = 1
               AND marked_for_deletion = 0
               AND received_length < expected_length",
        )
        .fetch_all(executor)
        .await?;
        rows.sort_by_key(|a| a.priority());
        Ok(rows)
    }

    /// Set the decryption key and metadata. Both are write-once.
    pub async fn set_key_and_metadata(
        &mut self,
        uow: &mut UnitOfWork,
        key: &[u8],
        metadata: &[u8],
    ) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("attachment key is empty"));
        }
        if metadata.is_empty() {
            return Err(StoreError::InvalidArgument("attachment metadata is empty"));
        }
        let already_set = || StoreError::AlreadySet {
            what: "key and metadata",
            record: self.key().to_string(),
        };
        if self.key.is_some() || self.metadata.is_some() {
            return Err(already_set());
        }

        let result = sqlx::query(
            "UPDATE inbox_attachment SET key = ?, metadata = ?
             WHERE owned_identity = ? AND message_uid = ? AND attachment_number = ?
               AND key IS NULL AND metadata IS NULL",
        )
        .bind(key)
        .bind(metadata)
        .bind(&self.owned_identity)
        .bind(&self.message_uid)
        .bind(self.attachment_number)
        .execute(uow.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(already_set());
        }

        self.key = Some(key.to_vec());
        self.metadata = Some(metadata.to_vec());
        Ok(())
    }

    /// Append `bytes` to the file at the current file length and account
    /// `encrypted_length` ciphertext bytes as received.
    pub async fn append_chunk(
        &mut self,
        uow: &mut UnitOfWork,
        bytes: &[u8],
        encrypted_length: i64,
    ) -> Result<(), StoreError> {
        if encrypted_length <= 0 {
            return Err(StoreError::InvalidArgument("encrypted chunk length must be positive"));
        }
        let received = self.received_length + encrypted_length;
        if received > self.expected_length {
            return Err(StoreError::Overflow {
                record: self.key().to_string(),
                len: encrypted_length,
                received: self.received_length,
                expected: self.expected_length,
            });
        }

        let key = self.key();
        uow.store()
            .files()
            .write_at(&key, self.plaintext_file_length as u64, bytes)
            .await?;
        let file_length = self.plaintext_file_length + bytes.len() as i64;

        sqlx::query(
            "UPDATE inbox_attachment SET received_length = ?, plaintext_file_length = ?
             WHERE owned_identity = ? AND message_uid = ? AND attachment_number = ?",
        )
        .bind(received)
        .bind(file_length)
        .bind(&self.owned_identity)
        .bind(&self.message_uid)
        .bind(self.attachment_number)
        .execute(uow.conn())
        .await?;

        self.received_length = received;
        self.plaintext_file_length = file_length;

        uow.notify(PendingNotification::ChunkReceived {
            key: key.clone(),
            progress: self.progress(),
        });
        if self.is_complete() {
            info!(attachment = %key, bytes = file_length, "attachment fully received");
            uow.notify(PendingNotification::LastChunkReceived { key });
        }
        Ok(())
    }

    pub async fn request_download(
        &mut self,
        uow: &mut UnitOfWork,
        category: PriorityCategory,
    ) -> Result<(), StoreError> {
        let now = uow.store().now();
        sqlx::query(
            "UPDATE inbox_attachment
             SET download_requested = 1, priority_category = ?, request_timestamp = ?
             WHERE owned_identity = ? AND message_uid = ? AND attachment_number = ?",
        )
        .bind(category.as_i64())
        .bind(now)
        .bind(&self.owned_identity)
        .bind(&self.message_uid)
        .bind(self.attachment_number)
        .execute(uow.conn())
        .await?;

        self.download_requested = true;
        self.priority_category = Some(category.as_i64());
        self.request_timestamp = Some(now);

        uow.notify(PendingNotification::DownloadRequested {
            key: self.key(),
            category,
            priority: self.priority(),
        });
        Ok(())
    }

    /// Clears the request flag only. The running transfer notices the pause
    /// and reports it itself.
    pub async fn pause_download(&mut self, uow: &mut UnitOfWork) -> Result<(), StoreError> {
        self.set_flag(uow, "download_requested", false).await?;
        self.download_requested = false;
        Ok(())
    }

    pub async fn mark_for_deletion(&mut self, uow: &mut UnitOfWork) -> Result<(), StoreError> {
        self.set_flag(uow, "marked_for_deletion", true).await?;
        self.marked_for_deletion = true;
        Ok(())
    }

    async fn set_flag(
        &self,
        uow: &mut UnitOfWork,
        column: &'static str,
        value: bool,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE inbox_attachment SET {column} = ?
             WHERE owned_identity = ? AND message_uid = ? AND attachment_number = ?"
        );
        sqlx::query(&sql)
            .bind(value)
            .bind(&self.owned_identity)
            .bind(&self.message_uid)
            .bind(self.attachment_number)
            .execute(uow.conn())
            .await?;
        Ok(())
    }

    pub fn file_path(&self, files: &AttachmentFiles) -> PathBuf {
        files.attachment_path(&self.key())
    }

    /// Idempotent; see [`AttachmentFiles::delete`].
    pub async fn delete_file(&self, files: &AttachmentFiles) -> Result<(), StoreError> {
        files.delete(&self.key()).await?;
        Ok(())
    }

    pub(crate) async fn delete_row(&self, uow: &mut UnitOfWork) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM inbox_attachment
             WHERE owned_identity = ? AND message_uid = ? AND attachment_number = ?",
        )
        .bind(&self.owned_identity)
        .bind(&self.message_uid)
        .bind(self.attachment_number)
        .execute(uow.conn())
        .await?;
        Ok(())
    }
}
