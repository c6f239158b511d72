use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ib_store::{
    pending_server_deletes, AttachmentRecord, MessageKey, MessageRecord, Store, StoreConfig,
    SystemClock,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod paths;

#[derive(Parser, Debug)]
#[command(name = "ib-inbox", version, about = "Inspect and maintain the inbox store", long_about = None)]
struct Cli {
    /// Directory holding inbox.db and attachments/
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Message counts and pending server deletions
    Status,

    /// Download progress of every attachment of one message
    Attachments {
        /// Owned identity, hex
        owner: String,
        /// Message uid, hex
        uid: String,
    },

    /// Delete every message whose attachments are all marked for deletion
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let dir = match cli.data_dir {
        Some(dir) => dir,
        None => paths::data_dir()?,
    };
    let store = Store::open(&StoreConfig::in_dir(&dir), Arc::new(SystemClock))
        .await
        .with_context(|| format!("opening inbox store in {}", dir.display()))?;

    match cli.command {
        Commands::Status => status_command(&store).await,
        Commands::Attachments { owner, uid } => attachments_command(&store, &owner, &uid).await,
        Commands::Purge => purge_command(&store).await,
    }
}

async fn status_command(store: &Store) -> Result<()> {
    let unprocessed = MessageRecord::unprocessed(&store.pool).await?;
    let decrypted = MessageRecord::decrypted(&store.pool).await?;
    let to_delete = MessageRecord::to_delete(&store.pool).await?;
    let awaiting = MessageRecord::awaiting_extended_payload(&store.pool).await?;
    let pending = pending_server_deletes(&store.pool).await?;
    let downloading = AttachmentRecord::download_requested(&store.pool).await?;

    println!("unprocessed messages:        {}", unprocessed.len());
    println!("decrypted messages:          {}", decrypted.len());
    println!("awaiting extended payload:   {}", awaiting.len());
    println!("marked for deletion:         {}", to_delete.len());
    println!("attachments downloading:     {}", downloading.len());
    println!("pending server deletions:    {}", pending.len());
    for key in &pending {
        println!("  {}  {}", hex::encode(&key.owner), hex::encode(&key.uid));
    }
    Ok(())
}

async fn attachments_command(store: &Store, owner: &str, uid: &str) -> Result<()> {
    let owner = hex::decode(owner).map_err(|e| anyhow!("owner is not hex: {e}"))?;
    let uid = hex::decode(uid).map_err(|e| anyhow!("uid is not hex: {e}"))?;
    let key = MessageKey::new(owner, uid);

    if MessageRecord::find(&store.pool, &key).await?.is_none() {
        return Err(anyhow!("no message {key}"));
    }
    let attachments = AttachmentRecord::attachments_of(&store.pool, &key).await?;
    if attachments.is_empty() {
        println!("message {key} has no attachments");
        return Ok(());
    }

    for attachment in &attachments {
        let chunks = attachment
            .received_chunk_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| "?".into());
        let state = if attachment.marked_for_deletion {
            "deleting"
        } else if attachment.is_complete() {
            "complete"
        } else if attachment.download_requested {
            "downloading"
        } else {
            "paused"
        };
        println!(
            "#{:<3} {:>6.1}%  {}/{} bytes  {} chunks  {}  {}",
            attachment.attachment_number,
            attachment.progress() * 100.0,
            attachment.received_length,
            attachment.expected_length,
            chunks,
            state,
            attachment.file_path(store.files()).display(),
        );
    }
    Ok(())
}

async fn purge_command(store: &Store) -> Result<()> {
    let candidates = MessageRecord::to_delete(&store.pool).await?;
    let mut deleted = 0usize;
    let mut kept = 0usize;

    for message in candidates {
        let key = message.key();
        let mut uow = store.begin().await?;
        if !message.can_be_deleted(&mut uow).await? {
            uow.rollback().await?;
            kept += 1;
            continue;
        }
        match message.delete(&mut uow).await {
            Ok(()) => {
                uow.commit().await?;
                deleted += 1;
            }
            Err(err) => {
                warn!(message = %key, error = %err, "delete failed; rolled back");
                uow.rollback().await?;
                kept += 1;
            }
        }
    }

    info!(deleted, kept, "purge finished");
    println!("deleted {deleted} message(s), kept {kept}");
    Ok(())
}
