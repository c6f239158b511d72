//! Database abstraction over SQLite via sqlx.

use std::sync::Arc;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use tracing::{debug, info};

use crate::{
    clock::Clock,
    config::StoreConfig,
    error::StoreError,
    files::AttachmentFiles,
    models::MessageKey,
    notify::{InboxListener, NotificationBus, NotificationQueue, PendingNotification},
    replay::RecentlyDeleted,
};

/// Central store handle.  Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    files: AttachmentFiles,
    recently_deleted: Arc<RecentlyDeleted>,
    clock: Arc<dyn Clock>,
    bus: NotificationBus,
}

impl Store {
    /// Open (or create) the SQLite database and run pending migrations.
    ///
    /// WAL and foreign keys are set on the connection, not in a migration:
    /// SQLite refuses to change `journal_mode` inside the transaction sqlx
    /// wraps each migration in.
    pub async fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(dir) = config.database_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!(db = %config.database_path.display(), "inbox store opened");

        Ok(Self {
            pool,
            files: AttachmentFiles::new(&config.attachments_dir),
            recently_deleted: Arc::new(RecentlyDeleted::new(config.deleted_retention_ms)),
            clock,
            bus: NotificationBus::default(),
        })
    }

    pub async fn begin(&self) -> Result<UnitOfWork, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(UnitOfWork {
            tx,
            queue: NotificationQueue::default(),
            deleted: Vec::new(),
            store: self.clone(),
        })
    }

    pub fn subscribe(&self, listener: Arc<dyn InboxListener>) {
        self.bus.subscribe(listener);
    }

    pub fn files(&self) -> &AttachmentFiles {
        &self.files
    }

    pub fn recently_deleted(&self) -> &RecentlyDeleted {
        &self.recently_deleted
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }
}

/// One database transaction plus the notifications its mutations queued.
///
/// Listeners run after [`UnitOfWork::commit`] succeeded, never otherwise.
/// Deleted message keys reach the anti-replay set under the same rule.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    queue: NotificationQueue,
    deleted: Vec<(MessageKey, i64)>,
    store: Store,
}

impl UnitOfWork {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn notify(&mut self, notification: PendingNotification) {
        self.queue.push(notification);
    }

    pub(crate) fn deleted(&mut self, key: MessageKey, at: i64) {
        self.deleted.push((key, at));
    }

    pub fn pending_notifications(&self) -> usize {
        self.queue.len()
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        let UnitOfWork {
            tx,
            queue,
            deleted,
            store,
        } = self;
        tx.commit().await?;

        if !deleted.is_empty() {
            let purged = store.recently_deleted.purge_expired(store.now());
            if purged > 0 {
                debug!(purged, "expired anti-replay entries dropped");
            }
            for (key, at) in deleted {
                store.recently_deleted.record(key, at);
            }
        }
        store.bus.dispatch(queue.into_vec());
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        let dropped = self.queue.len();
        let kept = self.deleted.len();
        self.tx.rollback().await?;
        if dropped > 0 || kept > 0 {
            debug!(dropped, kept, "rolled back; discarded queued notifications and deletions");
        }
        Ok(())
    }
}
