//! Relay frame dispatch.
//!
//! Opens sealed frames and maps each inbound kind to one handler. Handlers
//! never touch the connection; they return [`Action`]s that the connection
//! actor performs in order.

use std::{
    collections::{HashSet, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use ib_crypto::SymmetricKey;
use ib_proto::{codec, ErrorCode, PingPong, UploadNotice, WebFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    backend::BridgeBackend,
    error::BridgeError,
    upload::{ChunkOutcome, DoneOutcome, Finalized, UploadTracker},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(WebFrame),
    /// Stream the file to the client on its own task.
    StreamAttachment { attachment_id: i64, path: PathBuf },
    /// Chunks of `local_id` are still missing after its "done".
    ArmUploadTimeout { local_id: String },
    Bye,
}

/// Client-local ids of created messages, oldest evicted first.
#[derive(Debug)]
pub struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Records `id`; `false` if it was already there.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.set.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct Dispatcher {
    backend: Arc<dyn BridgeBackend>,
    seen: SeenIds,
    uploads: UploadTracker,
    upload_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn BridgeBackend>,
        uploads: UploadTracker,
        dedup_capacity: usize,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            seen: SeenIds::new(dedup_capacity),
            uploads,
            upload_timeout,
        }
    }

    /// Open a sealed relay payload and dispatch it. A frame that fails
    /// authentication or decoding is dropped.
    pub async fn handle_sealed(
        &mut self,
        key: &SymmetricKey,
        ciphertext: &[u8],
    ) -> Result<Vec<Action>, BridgeError> {
        match codec::open_frame(key, ciphertext) {
            Ok(frame) => self.handle(frame).await,
            Err(err) => {
                warn!(error = %err, len = ciphertext.len(), "dropping unreadable relay frame");
                Ok(Vec::new())
            }
        }
    }

    pub async fn handle(&mut self, frame: WebFrame) -> Result<Vec<Action>, BridgeError> {
        let kind = frame.kind();
        debug!(kind, "relay frame");
        match self.route(frame).await {
            Err(BridgeError::Backend(reason)) => {
                warn!(kind, %reason, "backend failed");
                Ok(vec![error_reply(ErrorCode::Internal)])
            }
            other => other,
        }
    }

    async fn route(&mut self, frame: WebFrame) -> Result<Vec<Action>, BridgeError> {
        let backend = self.backend.clone();
        let actions = match frame {
            WebFrame::Ping(PingPong { ping: true, .. }) => vec![Action::Reply(WebFrame::Ping(PingPong {
                ping: false,
                pong: true,
            }))],
            WebFrame::Ping(PingPong { pong: true, .. }) => {
                debug!("pong received");
                Vec::new()
            }
            WebFrame::Ping(_) => {
                warn!("ping frame with neither flag set");
                Vec::new()
            }

            WebFrame::RequestDiscussions => {
                let discussions = backend.discussions().await?;
                vec![Action::Reply(WebFrame::DiscussionList { discussions })]
            }
            WebFrame::RequestMessages {
                discussion_id,
                before,
                count,
            } => match backend.messages(discussion_id, before, count).await? {
                Some(messages) => vec![Action::Reply(WebFrame::MessageList {
                    discussion_id,
                    messages,
                })],
                None => vec![error_reply(ErrorCode::UnknownDiscussion)],
            },
            WebFrame::RequestMarkDiscussionRead { discussion_id } => {
                if backend.mark_discussion_read(discussion_id).await? {
                    Vec::new()
                } else {
                    vec![error_reply(ErrorCode::UnknownDiscussion)]
                }
            }
            WebFrame::NewMessage {
                local_id,
                discussion_id,
                body,
                reply_to,
            } => {
                if self.seen.contains(&local_id) {
                    debug!(%local_id, "duplicate message creation ignored");
                    return Ok(Vec::new());
                }
                // Remembered only once posted; a failed post may come again.
                match backend.post_message(discussion_id, &body, reply_to).await? {
                    Some(message) => {
                        self.seen.insert(&local_id);
                        vec![Action::Reply(WebFrame::NotifyNewMessage(message))]
                    }
                    None => vec![error_reply(ErrorCode::UnknownDiscussion)],
                }
            }
            WebFrame::RequestDeleteMessage { message_id } => {
                match backend.delete_message(message_id).await? {
                    Some(discussion_id) => vec![Action::Reply(WebFrame::NotifyMessageDeleted {
                        discussion_id,
                        message_id,
                    })],
                    None => Vec::new(),
                }
            }
            WebFrame::RequestDraft { discussion_id } => {
                let body = backend.draft(discussion_id).await?;
                vec![Action::Reply(WebFrame::DraftContent { discussion_id, body })]
            }
            WebFrame::SaveDraft { discussion_id, body } => {
                backend.save_draft(discussion_id, &body).await?;
                Vec::new()
            }
            WebFrame::DeleteDraft { discussion_id } => {
                backend.delete_draft(discussion_id).await?;
                Vec::new()
            }
            WebFrame::RequestSettings => {
                vec![Action::Reply(WebFrame::SettingsContent(backend.settings().await?))]
            }
            WebFrame::UpdateSettings(settings) => {
                backend.update_settings(settings).await?;
                Vec::new()
            }
            WebFrame::RequestThumbnail { attachment_id } => match backend.thumbnail(attachment_id).await? {
                Some(bytes) => vec![Action::Reply(WebFrame::ThumbnailContent { attachment_id, bytes })],
                None => vec![error_reply(ErrorCode::UnknownAttachment)],
            },
            WebFrame::RequestDownloadAttachment { attachment_id } => {
                match backend.attachment_file(attachment_id).await? {
                    Some(path) => vec![Action::StreamAttachment { attachment_id, path }],
                    None => vec![error_reply(ErrorCode::UnknownAttachment)],
                }
            }

            WebFrame::UploadAttachmentNotice(notice) => self.upload_notice(notice).await?,
            WebFrame::UploadAttachmentChunk {
                local_id,
                chunk_index,
                offset,
                chunk,
            } => match self.uploads.chunk(&local_id, chunk_index, offset, &chunk).await {
                Ok(ChunkOutcome::Ignored) => {
                    debug!(%local_id, chunk_index, "chunk ignored");
                    Vec::new()
                }
                Ok(ChunkOutcome::Stored { .. }) => Vec::new(),
                Ok(ChunkOutcome::Finalized(finalized)) => self.finish_upload(finalized).await,
                Err(err) => self.abandon_upload(&local_id, err).await,
            },
            WebFrame::UploadAttachmentDone { local_id } => match self.uploads.done(&local_id).await {
                Ok(DoneOutcome::Unknown) => {
                    debug!(%local_id, "done for unknown upload");
                    Vec::new()
                }
                Ok(DoneOutcome::AwaitingChunks { .. }) => vec![Action::ArmUploadTimeout { local_id }],
                Ok(DoneOutcome::Finalized(finalized)) => self.finish_upload(finalized).await,
                Err(err) => self.abandon_upload(&local_id, err).await,
            },

            WebFrame::Bye => {
                info!("web client said bye");
                vec![Action::Bye]
            }

            outbound @ (WebFrame::DiscussionList { .. }
            | WebFrame::MessageList { .. }
            | WebFrame::DraftContent { .. }
            | WebFrame::SettingsContent(_)
            | WebFrame::ThumbnailContent { .. }
            | WebFrame::DownloadAttachmentChunk { .. }
            | WebFrame::DownloadAttachmentDone { .. }
            | WebFrame::UploadNoticeResponse { .. }
            | WebFrame::UploadResult { .. }
            | WebFrame::NotifyNewMessage(_)
            | WebFrame::NotifyMessageUpdated(_)
            | WebFrame::NotifyMessageDeleted { .. }
            | WebFrame::NotifyDiscussionUpdated(_)
            | WebFrame::NotifyDiscussionDeleted { .. }
            | WebFrame::NotifyAttachmentAvailable { .. }
            | WebFrame::NotifyError { .. }) => {
                warn!(kind = outbound.kind(), "outbound-only frame received; dropped");
                Vec::new()
            }
        };
        Ok(actions)
    }

    async fn upload_notice(&mut self, notice: UploadNotice) -> Result<Vec<Action>, BridgeError> {
        let local_id = notice.local_id.clone();
        if self.uploads.discard(&local_id).await {
            info!(%local_id, "upload restarted by client");
            return Ok(vec![upload_result(local_id, false)]);
        }

        if self.backend.has_content(&notice.content_hash).await? {
            debug!(%local_id, "content already present; skipping transfer");
            self.backend.upload_reused(notice).await?;
            return Ok(vec![
                Action::Reply(WebFrame::UploadNoticeResponse {
                    local_id: local_id.clone(),
                    send_chunks: false,
                }),
                upload_result(local_id, true),
            ]);
        }

        if let Err(err) = self.uploads.start(notice).await {
            warn!(%local_id, error = %err, "cannot start upload");
            return Ok(vec![
                error_reply(ErrorCode::UploadRejected),
                upload_result(local_id, false),
            ]);
        }
        Ok(vec![Action::Reply(WebFrame::UploadNoticeResponse {
            local_id,
            send_chunks: true,
        })])
    }

    async fn finish_upload(&mut self, finalized: Finalized) -> Vec<Action> {
        match finalized {
            Finalized::Success(upload) => {
                let local_id = upload.notice.local_id.clone();
                let path = upload.path.clone();
                match self.backend.upload_completed(upload).await {
                    Ok(()) => vec![upload_result(local_id, true)],
                    Err(err) => {
                        warn!(%local_id, error = %err, "backend refused finished upload");
                        if let Err(err) = tokio::fs::remove_file(&path).await {
                            debug!(path = %path.display(), error = %err, "upload file already gone");
                        }
                        vec![upload_result(local_id, false)]
                    }
                }
            }
            Finalized::Failure { local_id, reason } => {
                info!(%local_id, reason, "upload failed");
                vec![upload_result(local_id, false)]
            }
        }
    }

    async fn abandon_upload(&mut self, local_id: &str, err: BridgeError) -> Vec<Action> {
        warn!(%local_id, error = %err, "upload write failed");
        self.uploads.discard(local_id).await;
        vec![upload_result(local_id.to_string(), false)]
    }

    /// Arm the completion timeout of an upload waiting for chunks.
    pub fn arm_upload_timeout<E, F>(&mut self, local_id: &str, tx: mpsc::Sender<E>, event: F)
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E + Send + 'static,
    {
        self.uploads.arm_timeout(local_id, self.upload_timeout, tx, event);
    }

    pub async fn upload_timed_out(&mut self, local_id: &str, attempt: u64) -> Vec<Action> {
        match self.uploads.timeout(local_id, attempt).await {
            Some(finalized) => self.finish_upload(finalized).await,
            None => Vec::new(),
        }
    }

    pub fn seen_ids(&self) -> &SeenIds {
        &self.seen
    }
}

fn error_reply(code: ErrorCode) -> Action {
    Action::Reply(WebFrame::NotifyError { code })
}

fn upload_result(local_id: String, success: bool) -> Action {
    Action::Reply(WebFrame::UploadResult { local_id, success })
}
