//! Files uploaded by the web client, rebuilt from chunks that may arrive
//! out of order.
//!
//! An upload finishes when no chunk is outstanding, whether or not the peer
//! already said "done". After "done" with chunks still missing, a timeout
//! is armed; if it fires first the upload fails and the partial file goes.

use std::{
    collections::{BTreeSet, HashMap},
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use ib_crypto::hash;
use ib_proto::UploadNotice;
use tokio::{
    fs::{self, File},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::BridgeError, timers::TimerSlot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedUpload {
    pub notice: UploadNotice,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Success(FinishedUpload),
    Failure { local_id: String, reason: &'static str },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Unknown upload or an index already written.
    Ignored,
    Stored { outstanding: usize },
    Finalized(Finalized),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DoneOutcome {
    Unknown,
    /// Chunks still missing; arm the completion timeout for this attempt.
    AwaitingChunks { attempt: u64 },
    Finalized(Finalized),
}

struct InFlightUpload {
    notice: UploadNotice,
    path: PathBuf,
    file: File,
    outstanding: BTreeSet<u32>,
    done_signaled: bool,
    attempt: u64,
    timer: TimerSlot,
}

pub struct UploadTracker {
    dir: PathBuf,
    uploads: HashMap<String, InFlightUpload>,
    next_attempt: u64,
}

impl UploadTracker {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            uploads: HashMap::new(),
            next_attempt: 0,
        }
    }

    pub fn is_tracked(&self, local_id: &str) -> bool {
        self.uploads.contains_key(local_id)
    }

    pub fn outstanding(&self, local_id: &str) -> Option<usize> {
        self.uploads.get(local_id).map(|u| u.outstanding.len())
    }

    /// Drop the tracking of `local_id` and its partial file.
    pub async fn discard(&mut self, local_id: &str) -> bool {
        match self.uploads.remove(local_id) {
            Some(upload) => {
                remove_partial(&upload.path).await;
                true
            }
            None => false,
        }
    }

    /// Start tracking a fresh upload with every chunk outstanding.
    pub async fn start(&mut self, notice: UploadNotice) -> Result<(), BridgeError> {
        check_notice(&notice)?;
        fs::create_dir_all(&self.dir).await?;
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        let path = self.dir.join(format!("{}.part", Uuid::new_v4()));
        let file = File::create(&path).await?;
        file.set_len(notice.size).await?;

        debug!(local_id = %notice.local_id, chunks = notice.chunk_count, size = notice.size, "upload started");
        self.uploads.insert(
            notice.local_id.clone(),
            InFlightUpload {
                outstanding: (0..notice.chunk_count).collect(),
                notice,
                path,
                file,
                done_signaled: false,
                attempt,
                timer: TimerSlot::default(),
            },
        );
        Ok(())
    }

    /// Write one chunk at its offset. Repeated indices are not rewritten.
    pub async fn chunk(
        &mut self,
        local_id: &str,
        index: u32,
        offset: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, BridgeError> {
        let Some(upload) = self.uploads.get_mut(local_id) else {
            return Ok(ChunkOutcome::Ignored);
        };
        if !upload.outstanding.contains(&index) {
            if index >= upload.notice.chunk_count {
                warn!(%local_id, index, count = upload.notice.chunk_count, "chunk index out of range");
            }
            return Ok(ChunkOutcome::Ignored);
        }
        let past_end = offset
            .checked_add(bytes.len() as u64)
            .map_or(true, |end| end > upload.notice.size);
        if past_end {
            warn!(%local_id, index, offset, len = bytes.len(), "chunk past announced size");
            return Ok(ChunkOutcome::Ignored);
        }

        upload.file.seek(SeekFrom::Start(offset)).await?;
        upload.file.write_all(bytes).await?;
        upload.outstanding.remove(&index);

        if upload.outstanding.is_empty() {
            let finalized = self.finalize(local_id).await?;
            return Ok(ChunkOutcome::Finalized(finalized));
        }
        Ok(ChunkOutcome::Stored {
            outstanding: upload.outstanding.len(),
        })
    }

    pub async fn done(&mut self, local_id: &str) -> Result<DoneOutcome, BridgeError> {
        let Some(upload) = self.uploads.get_mut(local_id) else {
            return Ok(DoneOutcome::Unknown);
        };
        if upload.outstanding.is_empty() {
            let finalized = self.finalize(local_id).await?;
            return Ok(DoneOutcome::Finalized(finalized));
        }
        upload.done_signaled = true;
        debug!(%local_id, outstanding = upload.outstanding.len(), "done signaled, chunks in flight");
        Ok(DoneOutcome::AwaitingChunks {
            attempt: upload.attempt,
        })
    }

    /// Arm (or re-arm) the completion timeout of `local_id`.
    pub fn arm_timeout<E, F>(&mut self, local_id: &str, delay: Duration, tx: mpsc::Sender<E>, event: F)
    where
        E: Send + 'static,
        F: FnOnce(u64) -> E + Send + 'static,
    {
        if let Some(upload) = self.uploads.get_mut(local_id) {
            let attempt = upload.attempt;
            upload.timer.arm_once(delay, tx, move |_| event(attempt));
        }
    }

    /// The completion timeout of `attempt` fired. Fails the upload if that
    /// attempt is still the tracked one.
    pub async fn timeout(&mut self, local_id: &str, attempt: u64) -> Option<Finalized> {
        let upload = self.uploads.get(local_id)?;
        if upload.attempt != attempt || !upload.done_signaled {
            return None;
        }
        warn!(%local_id, outstanding = upload.outstanding.len(), "upload timed out");
        self.discard(local_id).await;
        Some(Finalized::Failure {
            local_id: local_id.to_string(),
            reason: "timed out waiting for chunks",
        })
    }

    async fn finalize(&mut self, local_id: &str) -> Result<Finalized, BridgeError> {
        let Some(mut upload) = self.uploads.remove(local_id) else {
            return Ok(Finalized::Failure {
                local_id: local_id.to_string(),
                reason: "not tracked",
            });
        };
        upload.timer.cancel();
        upload.file.flush().await?;
        upload.file.sync_all().await?;
        drop(upload.file);

        let bytes = fs::read(&upload.path).await?;
        if !upload.notice.content_hash.is_empty()
            && !hash::attachment_hash(&bytes).eq_ignore_ascii_case(&upload.notice.content_hash)
        {
            warn!(%local_id, "uploaded content does not match announced hash");
            remove_partial(&upload.path).await;
            return Ok(Finalized::Failure {
                local_id: local_id.to_string(),
                reason: "content hash mismatch",
            });
        }

        info!(%local_id, size = bytes.len(), "upload complete");
        Ok(Finalized::Success(FinishedUpload {
            notice: upload.notice,
            path: upload.path,
        }))
    }
}

/// Every chunk carries at least one byte, and a non-empty file at least one chunk.
fn check_notice(notice: &UploadNotice) -> Result<(), BridgeError> {
    if notice.chunk_count == 0 && notice.size > 0 {
        return Err(BridgeError::UploadNotice("no chunks for a non-empty file"));
    }
    if u64::from(notice.chunk_count) > notice.size.max(1) {
        return Err(BridgeError::UploadNotice("more chunks than bytes"));
    }
    Ok(())
}

async fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "could not remove partial upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(local_id: &str, content: &[u8], chunk_count: u32) -> UploadNotice {
        UploadNotice {
            local_id: local_id.into(),
            discussion_id: 1,
            content_hash: hash::attachment_hash(content),
            size: content.len() as u64,
            chunk_count,
            mime_type: "text/plain".into(),
            file_name: "a.txt".into(),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_rebuild_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u1", b"abcdefgh", 3)).await.unwrap();

        assert_eq!(
            tracker.chunk("u1", 2, 6, b"gh").await.unwrap(),
            ChunkOutcome::Stored { outstanding: 2 }
        );
        assert_eq!(
            tracker.chunk("u1", 0, 0, b"abc").await.unwrap(),
            ChunkOutcome::Stored { outstanding: 1 }
        );
        let ChunkOutcome::Finalized(Finalized::Success(done)) =
            tracker.chunk("u1", 1, 3, b"def").await.unwrap()
        else {
            panic!("expected success");
        };
        assert_eq!(std::fs::read(&done.path).unwrap(), b"abcdefgh");
        assert!(!tracker.is_tracked("u1"));
    }

    #[tokio::test]
    async fn repeated_chunk_is_ignored_and_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u2", b"abcdef", 2)).await.unwrap();

        tracker.chunk("u2", 0, 0, b"abc").await.unwrap();
        assert_eq!(tracker.outstanding("u2"), Some(1));
        assert_eq!(
            tracker.chunk("u2", 0, 0, b"XYZ").await.unwrap(),
            ChunkOutcome::Ignored
        );
        assert_eq!(tracker.outstanding("u2"), Some(1));

        let ChunkOutcome::Finalized(Finalized::Success(done)) =
            tracker.chunk("u2", 1, 3, b"def").await.unwrap()
        else {
            panic!("expected success");
        };
        assert_eq!(std::fs::read(&done.path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn done_before_last_chunk_then_chunk_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u3", b"abcd", 2)).await.unwrap();
        tracker.chunk("u3", 0, 0, b"ab").await.unwrap();

        let DoneOutcome::AwaitingChunks { attempt } = tracker.done("u3").await.unwrap() else {
            panic!("expected to wait");
        };
        assert!(matches!(
            tracker.chunk("u3", 1, 2, b"cd").await.unwrap(),
            ChunkOutcome::Finalized(Finalized::Success(_))
        ));
        // The late timeout finds nothing to fail.
        assert_eq!(tracker.timeout("u3", attempt).await, None);
    }

    #[tokio::test]
    async fn timeout_fails_and_discards_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u4", b"abcd", 2)).await.unwrap();
        tracker.chunk("u4", 0, 0, b"ab").await.unwrap();
        let DoneOutcome::AwaitingChunks { attempt } = tracker.done("u4").await.unwrap() else {
            panic!("expected to wait");
        };

        let failed = tracker.timeout("u4", attempt).await;
        assert!(matches!(failed, Some(Finalized::Failure { .. })));
        assert!(!tracker.is_tracked("u4"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert_eq!(
            tracker.chunk("u4", 1, 2, b"cd").await.unwrap(),
            ChunkOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn stale_attempt_timeout_is_ignored_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u5", b"abcd", 2)).await.unwrap();
        let DoneOutcome::AwaitingChunks { attempt } = tracker.done("u5").await.unwrap() else {
            panic!("expected to wait");
        };
        assert!(tracker.discard("u5").await);
        tracker.start(notice("u5", b"abcd", 2)).await.unwrap();
        assert_eq!(tracker.timeout("u5", attempt).await, None);
        assert!(tracker.is_tracked("u5"));
    }

    #[tokio::test]
    async fn chunk_with_overflowing_offset_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u7", b"ab", 1)).await.unwrap();

        assert_eq!(
            tracker.chunk("u7", 0, u64::MAX, b"x").await.unwrap(),
            ChunkOutcome::Ignored
        );
        assert_eq!(
            tracker.chunk("u7", 0, 1, b"xy").await.unwrap(),
            ChunkOutcome::Ignored
        );
        assert_eq!(tracker.outstanding("u7"), Some(1));
        assert!(matches!(
            tracker.chunk("u7", 0, 0, b"ab").await.unwrap(),
            ChunkOutcome::Finalized(Finalized::Success(_))
        ));
    }

    #[tokio::test]
    async fn notice_with_impossible_chunk_count_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());

        let err = tracker.start(notice("u8", b"abcd", 0)).await.unwrap_err();
        assert!(matches!(err, BridgeError::UploadNotice(_)));
        let err = tracker.start(notice("u8", b"abcd", 5)).await.unwrap_err();
        assert!(matches!(err, BridgeError::UploadNotice(_)));
        let err = tracker.start(notice("u8", b"", u32::MAX)).await.unwrap_err();
        assert!(matches!(err, BridgeError::UploadNotice(_)));

        assert!(!tracker.is_tracked("u8"));
        assert_eq!(std::fs::read_dir(tmp.path()).map(|d| d.count()).unwrap_or(0), 0);

        tracker.start(notice("u8", b"abcd", 4)).await.unwrap();
        assert_eq!(tracker.outstanding("u8"), Some(4));
    }

    #[tokio::test]
    async fn hash_mismatch_fails_the_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tracker = UploadTracker::new(tmp.path().to_path_buf());
        tracker.start(notice("u6", b"abcd", 1)).await.unwrap();
        assert_eq!(
            tracker.chunk("u6", 0, 0, b"abcX").await.unwrap(),
            ChunkOutcome::Finalized(Finalized::Failure {
                local_id: "u6".into(),
                reason: "content hash mismatch",
            })
        );
    }
}
