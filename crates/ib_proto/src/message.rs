//! Relay frame types (inside the encrypted `Envelope::Relay` payload).
//!
//! Every frame kind is one variant of [`WebFrame`]; handlers match on it
//! exhaustively, so adding a kind forces every dispatcher to decide about it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPong {
    pub ping: bool,
    pub pong: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionSummary {
    pub discussion_id: i64,
    pub title: String,
    pub unread_count: u32,
    /// Milliseconds since epoch of the last message.
    pub last_activity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebMessage {
    pub message_id: i64,
    pub discussion_id: i64,
    pub outgoing: bool,
    pub sender_name: Option<String>,
    pub body: Option<String>,
    pub timestamp: i64,
    pub attachment_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSettings {
    pub language: String,
    pub theme: String,
    pub send_on_enter: bool,
}

/// Announcement of a file the web client is about to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadNotice {
    /// Client-local identifier, unique per upload attempt.
    pub local_id: String,
    pub discussion_id: i64,
    /// BLAKE3 hex digest of the whole file.
    pub content_hash: String,
    pub size: u64,
    pub chunk_count: u32,
    pub mime_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownDiscussion,
    UnknownAttachment,
    UploadRejected,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WebFrame {
    // ── Either direction ──────────────────────────────────────────────────
    Ping(PingPong),

    // ── Web client → app ──────────────────────────────────────────────────
    RequestDiscussions,
    RequestMessages {
        discussion_id: i64,
        before: Option<i64>,
        count: u32,
    },
    RequestMarkDiscussionRead {
        discussion_id: i64,
    },
    NewMessage {
        local_id: String,
        discussion_id: i64,
        body: String,
        reply_to: Option<i64>,
    },
    RequestDeleteMessage {
        message_id: i64,
    },
    RequestDraft {
        discussion_id: i64,
    },
    SaveDraft {
        discussion_id: i64,
        body: String,
    },
    DeleteDraft {
        discussion_id: i64,
    },
    RequestSettings,
    UpdateSettings(WebSettings),
    RequestThumbnail {
        attachment_id: i64,
    },
    RequestDownloadAttachment {
        attachment_id: i64,
    },
    UploadAttachmentNotice(UploadNotice),
    UploadAttachmentChunk {
        local_id: String,
        chunk_index: u32,
        offset: u64,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },
    UploadAttachmentDone {
        local_id: String,
    },
    Bye,

    // ── App → web client: responses ───────────────────────────────────────
    DiscussionList {
        discussions: Vec<DiscussionSummary>,
    },
    MessageList {
        discussion_id: i64,
        messages: Vec<WebMessage>,
    },
    DraftContent {
        discussion_id: i64,
        body: Option<String>,
    },
    SettingsContent(WebSettings),
    ThumbnailContent {
        attachment_id: i64,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    DownloadAttachmentChunk {
        attachment_id: i64,
        chunk_index: u32,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },
    DownloadAttachmentDone {
        attachment_id: i64,
        success: bool,
    },
    UploadNoticeResponse {
        local_id: String,
        /// `false` when the content already exists locally and no chunk is needed.
        send_chunks: bool,
    },
    UploadResult {
        local_id: String,
        success: bool,
    },

    // ── App → web client: notifications ───────────────────────────────────
    NotifyNewMessage(WebMessage),
    NotifyMessageUpdated(WebMessage),
    NotifyMessageDeleted {
        discussion_id: i64,
        message_id: i64,
    },
    NotifyDiscussionUpdated(DiscussionSummary),
    NotifyDiscussionDeleted {
        discussion_id: i64,
    },
    NotifyAttachmentAvailable {
        message_id: i64,
        attachment_id: i64,
    },
    NotifyError {
        code: ErrorCode,
    },
}

impl WebFrame {
    /// Stable name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WebFrame::Ping(_) => "ping",
            WebFrame::RequestDiscussions => "request_discussions",
            WebFrame::RequestMessages { .. } => "request_messages",
            WebFrame::RequestMarkDiscussionRead { .. } => "request_mark_discussion_read",
            WebFrame::NewMessage { .. } => "new_message",
            WebFrame::RequestDeleteMessage { .. } => "request_delete_message",
            WebFrame::RequestDraft { .. } => "request_draft",
            WebFrame::SaveDraft { .. } => "save_draft",
            WebFrame::DeleteDraft { .. } => "delete_draft",
            WebFrame::RequestSettings => "request_settings",
            WebFrame::UpdateSettings(_) => "update_settings",
            WebFrame::RequestThumbnail { .. } => "request_thumbnail",
            WebFrame::RequestDownloadAttachment { .. } => "request_download_attachment",
            WebFrame::UploadAttachmentNotice(_) => "upload_attachment_notice",
            WebFrame::UploadAttachmentChunk { .. } => "upload_attachment_chunk",
            WebFrame::UploadAttachmentDone { .. } => "upload_attachment_done",
            WebFrame::Bye => "bye",
            WebFrame::DiscussionList { .. } => "discussion_list",
            WebFrame::MessageList { .. } => "message_list",
            WebFrame::DraftContent { .. } => "draft_content",
            WebFrame::SettingsContent(_) => "settings_content",
            WebFrame::ThumbnailContent { .. } => "thumbnail_content",
            WebFrame::DownloadAttachmentChunk { .. } => "download_attachment_chunk",
            WebFrame::DownloadAttachmentDone { .. } => "download_attachment_done",
            WebFrame::UploadNoticeResponse { .. } => "upload_notice_response",
            WebFrame::UploadResult { .. } => "upload_result",
            WebFrame::NotifyNewMessage(_) => "notify_new_message",
            WebFrame::NotifyMessageUpdated(_) => "notify_message_updated",
            WebFrame::NotifyMessageDeleted { .. } => "notify_message_deleted",
            WebFrame::NotifyDiscussionUpdated(_) => "notify_discussion_updated",
            WebFrame::NotifyDiscussionDeleted { .. } => "notify_discussion_deleted",
            WebFrame::NotifyAttachmentAvailable { .. } => "notify_attachment_available",
            WebFrame::NotifyError { .. } => "notify_error",
        }
    }
}
