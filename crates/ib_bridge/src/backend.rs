//! What the bridge needs from the application: discussions, messages,
//! drafts, settings and attachment files.
//!
//! Lookups return `Ok(None)` for an unknown id; the dispatcher turns that
//! into a typed error frame. `Err` is reserved for failures of the backend
//! itself.

use std::path::PathBuf;

use async_trait::async_trait;
use ib_proto::{DiscussionSummary, UploadNotice, WebMessage, WebSettings};

use crate::{error::BridgeError, upload::FinishedUpload};

#[async_trait]
pub trait BridgeBackend: Send + Sync {
    async fn discussions(&self) -> Result<Vec<DiscussionSummary>, BridgeError>;

    /// Up to `count` messages older than `before` (newest first).
    async fn messages(
        &self,
        discussion_id: i64,
        before: Option<i64>,
        count: u32,
    ) -> Result<Option<Vec<WebMessage>>, BridgeError>;

    /// `false` for an unknown discussion.
    async fn mark_discussion_read(&self, discussion_id: i64) -> Result<bool, BridgeError>;

    async fn post_message(
        &self,
        discussion_id: i64,
        body: &str,
        reply_to: Option<i64>,
    ) -> Result<Option<WebMessage>, BridgeError>;

    /// Returns the discussion the deleted message belonged to.
    async fn delete_message(&self, message_id: i64) -> Result<Option<i64>, BridgeError>;

    async fn draft(&self, discussion_id: i64) -> Result<Option<String>, BridgeError>;
    async fn save_draft(&self, discussion_id: i64, body: &str) -> Result<(), BridgeError>;
    async fn delete_draft(&self, discussion_id: i64) -> Result<(), BridgeError>;

    async fn settings(&self) -> Result<WebSettings, BridgeError>;
    async fn update_settings(&self, settings: WebSettings) -> Result<(), BridgeError>;

    async fn thumbnail(&self, attachment_id: i64) -> Result<Option<Vec<u8>>, BridgeError>;

    /// Local file of a fully downloaded attachment.
    async fn attachment_file(&self, attachment_id: i64) -> Result<Option<PathBuf>, BridgeError>;

    /// Whether content with this hash is already fully stored locally.
    async fn has_content(&self, content_hash: &str) -> Result<bool, BridgeError>;

    /// Takes ownership of a verified upload file.
    async fn upload_completed(&self, upload: FinishedUpload) -> Result<(), BridgeError>;

    /// An upload was satisfied from existing content; no file was written.
    async fn upload_reused(&self, notice: UploadNotice) -> Result<(), BridgeError>;
}
