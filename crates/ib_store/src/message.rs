//! Message store operations and the scheduler-facing queries.

use sqlx::{Executor, Sqlite};
use tracing::{debug, info, warn};

use crate::{
    db::UnitOfWork,
    error::StoreError,
    models::{AttachmentRecord, MessageKey, MessageRecord, NewMessage},
    notify::PendingNotification,
};

impl MessageRecord {
    /// Store a message listed by the server.
    ///
    /// Returns `Ok(None)` when the uid was deleted within the anti-replay
    /// window: nothing is inserted and the server is told (through the
    /// pending-server-delete queue) that it can drop its copy.
    pub async fn create(uow: &mut UnitOfWork, new: NewMessage) -> Result<Option<Self>, StoreError> {
        if new.key.owner.is_empty() {
            return Err(StoreError::InvalidArgument("message owner identity is empty"));
        }
        if new.key.uid.is_empty() {
            return Err(StoreError::InvalidArgument("message uid is empty"));
        }

        let now = uow.store().now();
        if uow.store().recently_deleted().contains(&new.key, now) {
            warn!(message = %new.key, "server listed a recently deleted message; not recreating");
            queue_server_delete(uow, &new.key, now).await?;
            return Ok(None);
        }

        if Self::find(uow.conn(), &new.key).await?.is_some() {
            return Err(StoreError::AlreadyExists(new.key.to_string()));
        }

        let record = MessageRecord {
            owned_identity: new.key.owner,
            uid: new.key.uid,
            wrapped_key: new.wrapped_key,
            encrypted_content: new.encrypted_content,
            has_extended_content: new.has_extended_content,
            server_timestamp: new.server_timestamp,
            download_timestamp: new.download_timestamp,
            local_download_timestamp: new.local_download_timestamp,
            on_hold: false,
            marked_for_deletion: false,
            payload: None,
            from_identity: None,
            from_device_uid: None,
            extended_payload_key: None,
            extended_payload: None,
        };

        sqlx::query(
            "INSERT INTO inbox_message
                (owned_identity, uid, wrapped_key, encrypted_content, has_extended_content,
                 server_timestamp, download_timestamp, local_download_timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.owned_identity)
        .bind(&record.uid)
        .bind(&record.wrapped_key)
        .bind(&record.encrypted_content)
        .bind(record.has_extended_content)
        .bind(record.server_timestamp)
        .bind(record.download_timestamp)
        .bind(record.local_download_timestamp)
        .execute(uow.conn())
        .await?;

        debug!(message = %record.key(), "message stored");
        uow.notify(PendingNotification::MessageDownloaded {
            message: record.clone(),
        });
        Ok(Some(record))
    }

    pub async fn find<'e, E>(executor: E, key: &MessageKey) -> Result<Option<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM inbox_message WHERE owned_identity = ? AND uid = ?",
        )
        .bind(&key.owner)
        .bind(&key.uid)
        .fetch_optional(executor)
        .await?;
        Ok(row)
    }

    /// Record the unwrapped payload and sender. Allowed once.
    pub async fn set_payload_and_sender(
        &mut self,
        uow: &mut UnitOfWork,
        payload: &[u8],
        from_identity: &[u8],
        from_device_uid: &[u8],
        extended_payload_key: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        if self.is_processed() {
            return Err(StoreError::AlreadyProcessed(self.key().to_string()));
        }
        if payload.is_empty() || from_identity.is_empty() {
            return Err(StoreError::InvalidArgument("payload and sender are required"));
        }

        let result = sqlx::query(
            "UPDATE inbox_message
             SET payload = ?, from_identity = ?, from_device_uid = ?, extended_payload_key = ?
             WHERE owned_identity = ? AND uid = ?
               AND (payload IS NULL OR from_identity IS NULL)",
        )
        .bind(payload)
        .bind(from_identity)
        .bind(from_device_uid)
        .bind(extended_payload_key)
        .bind(&self.owned_identity)
        .bind(&self.uid)
        .execute(uow.conn())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyProcessed(self.key().to_string()));
        }

        self.payload = Some(payload.to_vec());
        self.from_identity = Some(from_identity.to_vec());
        self.from_device_uid = Some(from_device_uid.to_vec());
        self.extended_payload_key = extended_payload_key.map(<[u8]>::to_vec);

        let key = self.key();
        let attachments = AttachmentRecord::attachments_of(uow.conn(), &key).await?;
        uow.notify(PendingNotification::MessageDecrypted {
            message: self.clone(),
            attachments,
        });
        if self.extended_payload_key.is_some() {
            uow.notify(PendingNotification::ExtendedPayloadAvailable { key: key.clone() });
        }
        // Also for attachment-less messages: server-side list cleanup must not
        // wait on the application processing the payload.
        uow.notify(PendingNotification::MarkListedOnServer { key });
        Ok(())
    }

    pub async fn set_extended_payload(
        &mut self,
        uow: &mut UnitOfWork,
        extended_payload: &[u8],
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE inbox_message SET extended_payload = ? WHERE owned_identity = ? AND uid = ?")
            .bind(extended_payload)
            .bind(&self.owned_identity)
            .bind(&self.uid)
            .execute(uow.conn())
            .await?;
        self.extended_payload = Some(extended_payload.to_vec());
        uow.notify(PendingNotification::ExtendedPayloadDownloaded {
            key: self.key(),
            payload: extended_payload.to_vec(),
        });
        Ok(())
    }

    pub async fn set_on_hold(&mut self, uow: &mut UnitOfWork, on_hold: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE inbox_message SET on_hold = ? WHERE owned_identity = ? AND uid = ?")
            .bind(on_hold)
            .bind(&self.owned_identity)
            .bind(&self.uid)
            .execute(uow.conn())
            .await?;
        self.on_hold = on_hold;
        Ok(())
    }

    pub async fn mark_for_deletion(&mut self, uow: &mut UnitOfWork) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE inbox_message SET marked_for_deletion = 1 WHERE owned_identity = ? AND uid = ?",
        )
        .bind(&self.owned_identity)
        .bind(&self.uid)
        .execute(uow.conn())
        .await?;
        self.marked_for_deletion = true;
        Ok(())
    }

    /// Marked for deletion, and so is every attachment.
    pub async fn can_be_deleted(&self, uow: &mut UnitOfWork) -> Result<bool, StoreError> {
        if !self.marked_for_deletion {
            return Ok(false);
        }
        let attachments = AttachmentRecord::attachments_of(uow.conn(), &self.key()).await?;
        Ok(attachments.iter().all(|a| a.marked_for_deletion))
    }

    /// Cascade delete: attachment files, attachment rows, then the message
    /// row. A file that cannot be removed aborts the whole delete; the caller
    /// rolls the unit of work back and no row goes away.
    pub async fn delete(self, uow: &mut UnitOfWork) -> Result<(), StoreError> {
        let key = self.key();
        if !self.can_be_deleted(uow).await? {
            return Err(StoreError::DeletePrecondition(key.to_string()));
        }

        let attachments = AttachmentRecord::attachments_of(uow.conn(), &key).await?;
        for attachment in &attachments {
            let files = uow.store().files().clone();
            attachment.delete_file(&files).await?;
            attachment.delete_row(uow).await?;
        }

        sqlx::query("DELETE FROM inbox_message WHERE owned_identity = ? AND uid = ?")
            .bind(&key.owner)
            .bind(&key.uid)
            .execute(uow.conn())
            .await?;

        let now = uow.store().now();
        queue_server_delete(uow, &key, now).await?;
        uow.deleted(key.clone(), now);

        info!(message = %key, attachments = attachments.len(), "message deleted");
        Ok(())
    }

    /// Not yet unwrapped, oldest server timestamp first.
    pub async fn unprocessed<'e, E>(executor: E) -> Result<Vec<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM inbox_message
             WHERE payload IS NULL AND from_identity IS NULL AND marked_for_deletion = 0
             ORDER BY server_timestamp ASC",
        )
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    /// Unwrapped and ready for the application, oldest first.
    pub async fn decrypted<'e, E>(executor: E) -> Result<Vec<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM inbox_message
             WHERE payload IS NOT NULL AND from_identity IS NOT NULL
               AND marked_for_deletion = 0 AND on_hold = 0
             ORDER BY server_timestamp ASC",
        )
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    pub async fn to_delete<'e, E>(executor: E) -> Result<Vec<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM inbox_message WHERE marked_for_deletion = 1 ORDER BY server_timestamp ASC",
        )
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }

    pub async fn awaiting_extended_payload<'e, E>(executor: E) -> Result<Vec<Self>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM inbox_message
             WHERE extended_payload_key IS NOT NULL AND extended_payload IS NULL
             ORDER BY server_timestamp ASC",
        )
        .fetch_all(executor)
        .await?;
        Ok(rows)
    }
}

/// Ask the server to drop its copy of `key`, once the unit of work commits.
async fn queue_server_delete(uow: &mut UnitOfWork, key: &MessageKey, now: i64) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO pending_server_delete (owned_identity, uid, created_at)
         VALUES (?, ?, ?)",
    )
    .bind(&key.owner)
    .bind(&key.uid)
    .bind(now)
    .execute(uow.conn())
    .await?;
    uow.notify(PendingNotification::PendingServerDelete { key: key.clone() });
    Ok(())
}

/// Messages the server may drop, oldest first.
pub async fn pending_server_deletes<'e, E>(executor: E) -> Result<Vec<MessageKey>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
        "SELECT owned_identity, uid FROM pending_server_delete ORDER BY created_at ASC",
    )
    .fetch_all(executor)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(owner, uid)| MessageKey::new(owner, uid))
        .collect())
}

/// The server confirmed its deletion.
pub async fn clear_pending_server_delete(
    uow: &mut UnitOfWork,
    key: &MessageKey,
) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM pending_server_delete WHERE owned_identity = ? AND uid = ?")
        .bind(&key.owner)
        .bind(&key.uid)
        .execute(uow.conn())
        .await?;
    Ok(result.rows_affected() > 0)
}
