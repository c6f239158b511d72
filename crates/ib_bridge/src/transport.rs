//! Links to the relay server.
//!
//! A [`Connection`] is a send half ([`RelayTransport`]) plus a stream of
//! inbound envelopes; the stream ending means the link is gone. Sends are
//! queued, and the queue depth is what downloads read as backlog.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use ib_proto::{codec, Envelope};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Largest envelope accepted from the wire.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const INBOUND_QUEUE: usize = 256;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError>;
    /// Envelopes accepted by `send` and not yet written out.
    fn backlog(&self) -> usize;
    fn close(&self);
}

pub struct Connection {
    pub transport: Arc<dyn RelayTransport>,
    pub inbound: mpsc::Receiver<Envelope>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Connection, BridgeError>;
}

/// Send half backed by an unbounded queue with a depth counter.
pub struct QueuedTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    backlog: Arc<AtomicUsize>,
}

/// Consumer end of a [`QueuedTransport`].
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Envelope>,
    backlog: Arc<AtomicUsize>,
}

pub fn queued() -> (QueuedTransport, OutboundQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        QueuedTransport {
            outbound: Mutex::new(Some(tx)),
            backlog: backlog.clone(),
        },
        OutboundQueue { rx, backlog },
    )
}

#[async_trait]
impl RelayTransport for QueuedTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(BridgeError::TransportClosed)?;
        self.backlog.fetch_add(1, Ordering::SeqCst);
        tx.send(envelope).map_err(|_| {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            BridgeError::TransportClosed
        })
    }

    fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.outbound.lock().take();
    }
}

impl OutboundQueue {
    pub async fn next(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await?;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        Some(envelope)
    }

    pub fn try_next(&mut self) -> Option<Envelope> {
        let envelope = self.rx.try_recv().ok()?;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
        Some(envelope)
    }
}

// ── In-process link ─────────────────────────────────────────────────────────

/// The relay-server side of an in-process link.
pub struct MemoryPeer {
    /// What the bridge sent.
    pub outbound: OutboundQueue,
    /// Deliver envelopes to the bridge; dropping it closes the link.
    pub inbound: mpsc::Sender<Envelope>,
}

pub fn memory_link() -> (Connection, MemoryPeer) {
    let (transport, outbound) = queued();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    (
        Connection {
            transport: Arc::new(transport),
            inbound: inbound_rx,
        },
        MemoryPeer {
            outbound,
            inbound: inbound_tx,
        },
    )
}

/// Hands the server side of every new link to whoever holds the receiver.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, BridgeError> {
        let (connection, peer) = memory_link();
        self.peers
            .send(peer)
            .map_err(|_| BridgeError::Transport("no relay listening".into()))?;
        Ok(connection)
    }
}

// ── Byte streams ────────────────────────────────────────────────────────────

/// Run length-prefixed (u32 BE) MessagePack envelopes over a byte stream.
pub fn framed<S>(stream: S) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (transport, mut outbound) = queued();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

    tokio::spawn(async move {
        while let Some(envelope) = outbound.next().await {
            if let Err(err) = write_frame(&mut writer, &envelope).await {
                warn!(error = %err, "relay write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(bytes)) => match codec::decode_envelope(&bytes) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping undecodable envelope"),
                },
                Ok(None) => {
                    debug!("relay closed the stream");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "relay read failed");
                    break;
                }
            }
        }
    });

    Connection {
        transport: Arc::new(transport),
        inbound: inbound_rx,
    }
}

async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec::encode_envelope(envelope)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| BridgeError::Transport(format!("envelope of {} bytes too large", bytes.len())))?;
    writer.write_u32(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream between frames.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(BridgeError::Transport(format!("frame of {len} bytes exceeds limit")));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(Some(bytes))
}

pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self) -> Result<Connection, BridgeError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "relay connected");
        Ok(framed(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backlog_counts_unconsumed_envelopes() {
        let (transport, mut queue) = queued();
        transport.send(Envelope::ByeBye).await.unwrap();
        transport.send(Envelope::CorrespondingRegistered).await.unwrap();
        assert_eq!(transport.backlog(), 2);
        assert_eq!(queue.next().await, Some(Envelope::ByeBye));
        assert_eq!(transport.backlog(), 1);
        transport.close();
        assert!(matches!(
            transport.send(Envelope::ByeBye).await,
            Err(BridgeError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn framed_streams_carry_envelopes_both_ways() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = framed(a);
        let mut right = framed(b);

        left.transport
            .send(Envelope::RegisterConnection {
                identifier: "app-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            right.inbound.recv().await,
            Some(Envelope::RegisterConnection {
                identifier: "app-1".into()
            })
        );

        right
            .transport
            .send(Envelope::Relay {
                ciphertext: vec![9; 100],
            })
            .await
            .unwrap();
        assert_eq!(
            left.inbound.recv().await,
            Some(Envelope::Relay {
                ciphertext: vec![9; 100]
            })
        );

        right.transport.close();
        assert_eq!(left.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut right = framed(b);
        a.write_u32(MAX_FRAME_LEN + 1).await.unwrap();
        assert_eq!(right.inbound.recv().await, None);
    }
}
