//! Streaming a local attachment to the web client.
//!
//! Chunks go out one at a time. Before each one the outlet is checked: a
//! connection that left `Listening` aborts the transfer, a deep send queue
//! makes it wait and retry the same chunk. The (index, offset) cursor is
//! the only progress state, so a wait resumes exactly where it stopped.

use std::{io::SeekFrom, path::Path, time::Duration};

use async_trait::async_trait;
use ib_proto::WebFrame;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    time,
};
use tracing::{debug, info, warn};

use crate::{config::BridgeConfig, error::BridgeError};

#[async_trait]
pub trait ChunkOutlet: Send + Sync {
    /// Frames queued and not yet on the wire.
    fn backlog(&self) -> usize;
    fn is_listening(&self) -> bool;
    async fn send(&self, frame: WebFrame) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadCursor {
    pub chunk_index: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { chunks: u32, bytes: u64 },
    /// Read failure; the peer got a failed "done".
    Failed { at: DownloadCursor },
    /// The connection went away; nothing more was sent.
    Aborted { at: DownloadCursor },
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub chunk_size: usize,
    pub backlog_threshold: usize,
    pub backpressure_delay: Duration,
}

impl From<&BridgeConfig> for DownloadSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            chunk_size: config.download_chunk_size,
            backlog_threshold: config.backlog_threshold,
            backpressure_delay: config.backpressure_delay(),
        }
    }
}

pub async fn stream_attachment(
    outlet: &dyn ChunkOutlet,
    attachment_id: i64,
    path: &Path,
    settings: &DownloadSettings,
) -> DownloadOutcome {
    let mut cursor = DownloadCursor::default();

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(attachment_id, path = %path.display(), error = %err, "cannot open attachment");
            return fail(outlet, attachment_id, cursor).await;
        }
    };
    let mut buffer = vec![0u8; settings.chunk_size.max(1)];

    loop {
        if !outlet.is_listening() {
            info!(attachment_id, chunk = cursor.chunk_index, "connection left listening; download aborted");
            return DownloadOutcome::Aborted { at: cursor };
        }
        let backlog = outlet.backlog();
        if backlog > settings.backlog_threshold {
            debug!(attachment_id, backlog, chunk = cursor.chunk_index, "send queue full; backing off");
            time::sleep(settings.backpressure_delay).await;
            continue;
        }

        let read = match read_at(&mut file, cursor.offset, &mut buffer).await {
            Ok(read) => read,
            Err(err) => {
                warn!(attachment_id, offset = cursor.offset, error = %err, "attachment read failed");
                return fail(outlet, attachment_id, cursor).await;
            }
        };

        if read == 0 {
            let done = WebFrame::DownloadAttachmentDone {
                attachment_id,
                success: true,
            };
            if outlet.send(done).await.is_err() {
                return DownloadOutcome::Aborted { at: cursor };
            }
            debug!(attachment_id, chunks = cursor.chunk_index, bytes = cursor.offset, "download complete");
            return DownloadOutcome::Completed {
                chunks: cursor.chunk_index,
                bytes: cursor.offset,
            };
        }

        let frame = WebFrame::DownloadAttachmentChunk {
            attachment_id,
            chunk_index: cursor.chunk_index,
            chunk: buffer[..read].to_vec(),
        };
        if let Err(err) = outlet.send(frame).await {
            warn!(attachment_id, error = %err, "download send failed");
            return DownloadOutcome::Aborted { at: cursor };
        }
        cursor.chunk_index += 1;
        cursor.offset += read as u64;
    }
}

async fn fail(outlet: &dyn ChunkOutlet, attachment_id: i64, at: DownloadCursor) -> DownloadOutcome {
    let done = WebFrame::DownloadAttachmentDone {
        attachment_id,
        success: false,
    };
    if let Err(err) = outlet.send(done).await {
        debug!(attachment_id, error = %err, "could not report failed download");
    }
    DownloadOutcome::Failed { at }
}

/// Fill `buffer` from `offset`, stopping early only at end of file.
async fn read_at(file: &mut File, offset: u64, buffer: &mut [u8]) -> std::io::Result<usize> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct ScriptedOutlet {
        backlog: Mutex<VecDeque<usize>>,
        listening_for: Mutex<Option<usize>>,
        sent: Mutex<Vec<WebFrame>>,
        backlog_checks: Mutex<usize>,
    }

    #[async_trait]
    impl ChunkOutlet for ScriptedOutlet {
        fn backlog(&self) -> usize {
            *self.backlog_checks.lock() += 1;
            self.backlog.lock().pop_front().unwrap_or(0)
        }

        fn is_listening(&self) -> bool {
            match self.listening_for.lock().as_mut() {
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
                None => true,
            }
        }

        async fn send(&self, frame: WebFrame) -> Result<(), BridgeError> {
            self.sent.lock().push(frame);
            Ok(())
        }
    }

    impl ScriptedOutlet {
        fn chunks(&self) -> Vec<(u32, Vec<u8>)> {
            self.sent
                .lock()
                .iter()
                .filter_map(|f| match f {
                    WebFrame::DownloadAttachmentChunk {
                        chunk_index, chunk, ..
                    } => Some((*chunk_index, chunk.clone())),
                    _ => None,
                })
                .collect()
        }

        fn last(&self) -> Option<WebFrame> {
            self.sent.lock().last().cloned()
        }
    }

    fn settings() -> DownloadSettings {
        DownloadSettings {
            chunk_size: 7,
            backlog_threshold: 2,
            backpressure_delay: Duration::from_millis(1),
        }
    }

    fn sample_file(dir: &Path) -> (std::path::PathBuf, Vec<u8>) {
        let content: Vec<u8> = (0..100u8).collect();
        let path = dir.join("attachment.bin");
        std::fs::write(&path, &content).unwrap();
        (path, content)
    }

    #[tokio::test]
    async fn throttled_transfer_matches_unthrottled() {
        let tmp = tempfile::tempdir().unwrap();
        let (path, content) = sample_file(tmp.path());

        let free = ScriptedOutlet::default();
        let outcome = stream_attachment(&free, 5, &path, &settings()).await;
        assert_eq!(outcome, DownloadOutcome::Completed { chunks: 15, bytes: 100 });

        // Saturated before the first chunk and twice in the middle.
        let throttled = ScriptedOutlet::default();
        *throttled.backlog.lock() = VecDeque::from(vec![5, 5, 0, 0, 0, 9, 3, 0]);
        let outcome = stream_attachment(&throttled, 5, &path, &settings()).await;
        assert_eq!(outcome, DownloadOutcome::Completed { chunks: 15, bytes: 100 });
        assert!(*throttled.backlog_checks.lock() > *free.backlog_checks.lock());

        assert_eq!(throttled.chunks(), free.chunks());
        let rebuilt: Vec<u8> = throttled.chunks().into_iter().flat_map(|(_, c)| c).collect();
        assert_eq!(rebuilt, content);
        let indices: Vec<u32> = throttled.chunks().iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, (0..15).collect::<Vec<_>>());
        assert_eq!(
            throttled.last(),
            Some(WebFrame::DownloadAttachmentDone {
                attachment_id: 5,
                success: true
            })
        );
    }

    #[tokio::test]
    async fn leaving_listening_aborts_without_done() {
        let tmp = tempfile::tempdir().unwrap();
        let (path, _) = sample_file(tmp.path());

        let outlet = ScriptedOutlet::default();
        *outlet.listening_for.lock() = Some(3);
        let outcome = stream_attachment(&outlet, 1, &path, &settings()).await;
        assert_eq!(
            outcome,
            DownloadOutcome::Aborted {
                at: DownloadCursor {
                    chunk_index: 3,
                    offset: 21
                }
            }
        );
        assert_eq!(outlet.chunks().len(), 3);
        assert!(!outlet
            .sent
            .lock()
            .iter()
            .any(|f| matches!(f, WebFrame::DownloadAttachmentDone { .. })));
    }

    #[tokio::test]
    async fn missing_file_reports_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let outlet = ScriptedOutlet::default();
        let outcome = stream_attachment(&outlet, 2, &tmp.path().join("gone"), &settings()).await;
        assert!(matches!(outcome, DownloadOutcome::Failed { .. }));
        assert_eq!(
            outlet.last(),
            Some(WebFrame::DownloadAttachmentDone {
                attachment_id: 2,
                success: false
            })
        );
    }
}
