//! On-disk attachment files.
//!
//! Layout: `<root>/<message_directory(owner, uid)>/<attachment number>`.

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use ib_crypto::hash;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

use crate::models::{AttachmentKey, MessageKey};

#[derive(Debug, Clone)]
pub struct AttachmentFiles {
    root: PathBuf,
}

impl AttachmentFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn message_dir(&self, key: &MessageKey) -> PathBuf {
        self.root.join(hash::message_directory(&key.owner, &key.uid))
    }

    pub fn attachment_path(&self, key: &AttachmentKey) -> PathBuf {
        self.message_dir(&key.message()).join(key.index.to_string())
    }

    /// Write `bytes` at `offset`, creating the directory and file on first
    /// use. Anything past the written range is cut off, so bytes left by an
    /// append whose row update was rolled back never survive the next one.
    pub async fn write_at(&self, key: &AttachmentKey, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let path = self.attachment_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.set_len(offset + bytes.len() as u64).await?;
        file.flush().await?;
        Ok(())
    }

    /// Remove the attachment file, then its message directory if nothing
    /// else is left in it. Absent file or directory is not an error.
    pub async fn delete(&self, key: &AttachmentKey) -> io::Result<()> {
        let dir = self.message_dir(&key.message());
        if !fs::try_exists(&dir).await? {
            return Ok(());
        }
        match fs::remove_file(self.attachment_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let mut entries = fs::read_dir(&dir).await?;
        if entries.next_entry().await?.is_none() {
            match fs::remove_dir(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            debug!(dir = %dir.display(), "removed empty message directory");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_creates_directory_and_delete_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let files = AttachmentFiles::new(tmp.path());
        let key = AttachmentKey::new(vec![1], vec![2], 0);

        files.write_at(&key, 0, b"abcd").await.unwrap();
        files.write_at(&key, 4, b"ef").await.unwrap();
        assert_eq!(std::fs::read(files.attachment_path(&key)).unwrap(), b"abcdef");

        files.delete(&key).await.unwrap();
        assert!(!files.message_dir(&key.message()).exists());
        // Second delete is a no-op.
        files.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn rewrite_at_offset_truncates_stale_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let files = AttachmentFiles::new(tmp.path());
        let key = AttachmentKey::new(vec![1], vec![2], 0);

        files.write_at(&key, 0, b"abcdef").await.unwrap();
        files.write_at(&key, 2, b"X").await.unwrap();
        assert_eq!(std::fs::read(files.attachment_path(&key)).unwrap(), b"abX");
    }

    #[tokio::test]
    async fn sibling_attachment_keeps_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let files = AttachmentFiles::new(tmp.path());
        let first = AttachmentKey::new(vec![1], vec![2], 0);
        let second = AttachmentKey::new(vec![1], vec![2], 1);

        files.write_at(&first, 0, b"a").await.unwrap();
        files.write_at(&second, 0, b"b").await.unwrap();
        files.delete(&first).await.unwrap();
        assert!(files.attachment_path(&second).exists());
    }
}
