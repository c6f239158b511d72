//! The connection actor.
//!
//! One task per web-client pairing owns the state machine, the session
//! key, the transport and every timer. Transport readers, timers, the
//! handle and upload timeouts only post [`Event`]s into its queue, so all
//! transitions and sends for a connection happen in one order. An error
//! escaping a handler moves the machine to `Error`.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use ib_crypto::{establishment::AppEstablishment, SymmetricKey};
use ib_proto::{codec, handshake, Envelope, PingPong, WebFrame};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::BridgeBackend,
    config::BridgeConfig,
    dispatcher::{Action, Dispatcher},
    download::{self, ChunkOutlet, DownloadOutcome, DownloadSettings},
    error::BridgeError,
    state::{ConnectionState, StateMachine, TimerEffect},
    timers::TimerSlot,
    transport::{Connection, RelayTransport, TransportConnector},
    upload::UploadTracker,
};

const EVENT_QUEUE: usize = 256;

/// Out-of-band pairing data scanned from the web client.
#[derive(Debug, Clone)]
pub struct PairingInfo {
    pub connection_identifier: String,
    pub correspondent_identifier: String,
    pub browser_public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    /// Set once the third handshake message went out.
    pub sas_code: Option<String>,
    /// The last code entered by the user did not match.
    pub sas_rejected: bool,
    pub protocol_done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Protocol,
    Reconnection,
    KeepAlive,
    ProactiveReconnect,
}

#[derive(Debug)]
enum Event {
    Inbound { link: u64, envelope: Envelope },
    LinkClosed { link: u64 },
    Timer { kind: TimerKind, generation: u64 },
    ValidateSas(String),
    Outbound(WebFrame),
    UploadTimeout { local_id: String, attempt: u64 },
    Stop,
}

pub struct BridgeHandle {
    tx: mpsc::Sender<Event>,
    status: watch::Receiver<BridgeStatus>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Submit the code the user read off the web client. The outcome shows
    /// up in [`BridgeStatus`].
    pub async fn validate_sas(&self, code: &str) -> Result<(), BridgeError> {
        self.post(Event::ValidateSas(code.trim().to_string())).await
    }

    /// Push a frame to the web client (notifications). Dropped unless
    /// the connection is listening.
    pub async fn send_frame(&self, frame: WebFrame) -> Result<(), BridgeError> {
        self.post(Event::Outbound(frame)).await
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.post(Event::Stop).await
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `accept`.
    pub async fn wait_for<F>(&self, accept: F) -> Result<BridgeStatus, BridgeError>
    where
        F: FnMut(&BridgeStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let status = rx.wait_for(accept).await.map_err(|_| BridgeError::Stopped)?;
        Ok(status.clone())
    }

    pub async fn join(self) -> Result<(), BridgeError> {
        self.task.await.map_err(|_| BridgeError::Stopped)
    }

    async fn post(&self, event: Event) -> Result<(), BridgeError> {
        self.tx.send(event).await.map_err(|_| BridgeError::Stopped)
    }
}

/// Start the connection task for one pairing.
pub fn spawn(
    config: BridgeConfig,
    pairing: PairingInfo,
    connector: Arc<dyn TransportConnector>,
    backend: Arc<dyn BridgeBackend>,
) -> BridgeHandle {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let (status_tx, status_rx) = watch::channel(BridgeStatus {
        state: ConnectionState::Starting,
        sas_code: None,
        sas_rejected: false,
        protocol_done: false,
    });

    let dispatcher = Dispatcher::new(
        backend,
        UploadTracker::new(config.upload_dir()),
        config.dedup_capacity,
        config.upload_completion_timeout(),
    );
    let actor = BridgeActor {
        machine: StateMachine::new(config.anti_flap_window()),
        config,
        pairing,
        connector,
        dispatcher,
        establishment: None,
        session_key: None,
        sas_code: None,
        sas_rejected: false,
        transport: None,
        link: 0,
        reader: None,
        timers: Timers::default(),
        tx: tx.clone(),
        status: status_tx,
    };
    let task = tokio::spawn(actor.run(rx));

    BridgeHandle {
        tx,
        status: status_rx,
        task,
    }
}

#[derive(Default)]
struct Timers {
    protocol: TimerSlot,
    reconnection: TimerSlot,
    keepalive: TimerSlot,
    proactive: TimerSlot,
}

impl Timers {
    fn slot(&self, kind: TimerKind) -> &TimerSlot {
        match kind {
            TimerKind::Protocol => &self.protocol,
            TimerKind::Reconnection => &self.reconnection,
            TimerKind::KeepAlive => &self.keepalive,
            TimerKind::ProactiveReconnect => &self.proactive,
        }
    }

    fn cancel_all(&mut self) {
        self.protocol.cancel();
        self.reconnection.cancel();
        self.keepalive.cancel();
        self.proactive.cancel();
    }
}

struct BridgeActor {
    config: BridgeConfig,
    pairing: PairingInfo,
    connector: Arc<dyn TransportConnector>,
    machine: StateMachine,
    dispatcher: Dispatcher,
    /// Present between the first handshake message and SAS validation.
    establishment: Option<AppEstablishment>,
    /// Kept across silent reconnections.
    session_key: Option<SymmetricKey>,
    sas_code: Option<String>,
    sas_rejected: bool,
    transport: Option<Arc<dyn RelayTransport>>,
    /// Bumped for every new transport; events of older links are stale.
    link: u64,
    reader: Option<JoinHandle<()>>,
    timers: Timers,
    tx: mpsc::Sender<Event>,
    status: watch::Sender<BridgeStatus>,
}

impl BridgeActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        info!(connection = %self.pairing.connection_identifier, "bridge starting");
        if self.enter(ConnectionState::ReadyForConnection) == ConnectionState::ReadyForConnection {
            if let Err(err) = self.connect().await {
                error!(error = %err, "initial connection failed");
                self.enter(ConnectionState::Error);
            }
        }

        while !self.machine.state().is_terminal() {
            let Some(event) = rx.recv().await else { break };
            if let Err(err) = self.handle(event).await {
                self.on_failure(err).await;
            }
        }

        self.teardown();
        info!(state = ?self.machine.state(), "bridge stopped");
    }

    async fn on_failure(&mut self, err: BridgeError) {
        let state = self.machine.state();
        let link_lost = matches!(err, BridgeError::TransportClosed)
            && matches!(
                state,
                ConnectionState::Listening | ConnectionState::WaitingForReconnection
            );
        if link_lost {
            warn!(?state, "send on a closed link; reconnecting");
            match self.reconnect().await {
                Ok(()) => return,
                Err(err) => error!(error = %err, "reconnection failed"),
            }
        } else {
            error!(?state, error = %err, "connection task failed");
        }
        self.enter(ConnectionState::Error);
    }

    async fn handle(&mut self, event: Event) -> Result<(), BridgeError> {
        match event {
            Event::Inbound { link, envelope } if link == self.link => self.on_envelope(envelope).await,
            Event::LinkClosed { link } if link == self.link => self.on_link_closed().await,
            Event::Inbound { .. } | Event::LinkClosed { .. } => {
                debug!("event from a replaced link dropped");
                Ok(())
            }
            Event::Timer { kind, generation } => {
                if !self.timers.slot(kind).is_current(generation) {
                    debug!(?kind, "stale timer event dropped");
                    return Ok(());
                }
                self.on_timer(kind).await
            }
            Event::ValidateSas(code) => self.on_validate_sas(&code),
            Event::Outbound(frame) => {
                if self.machine.state() == ConnectionState::Listening {
                    self.send_frame(&frame).await
                } else {
                    debug!(kind = frame.kind(), state = ?self.machine.state(), "not listening; frame dropped");
                    Ok(())
                }
            }
            Event::UploadTimeout { local_id, attempt } => {
                let actions = self.dispatcher.upload_timed_out(&local_id, attempt).await;
                self.perform(actions).await
            }
            Event::Stop => {
                info!("stop requested");
                self.finish().await;
                Ok(())
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<(), BridgeError> {
        let state = self.machine.state();
        match envelope {
            Envelope::ConnectionRegistered { identifier } => {
                if identifier != self.pairing.connection_identifier {
                    return Err(BridgeError::Transport(format!(
                        "relay registered identifier {identifier}"
                    )));
                }
                if self.enter(ConnectionState::RegisteredConnection) == ConnectionState::RegisteredConnection {
                    self.send_envelope(Envelope::RegisterCorresponding {
                        correspondent: self.pairing.correspondent_identifier.clone(),
                    })
                    .await?;
                }
                Ok(())
            }
            Envelope::CorrespondingRegistered => {
                if self.enter(ConnectionState::RegisteredCorresponding)
                    != ConnectionState::RegisteredCorresponding
                {
                    return Ok(());
                }
                if self.machine.protocol_done() {
                    info!("handshake already done; resuming");
                    self.enter(ConnectionState::Listening);
                    Ok(())
                } else {
                    self.start_handshake().await
                }
            }
            Envelope::Connection { payload } => self.on_handshake_reply(&payload).await,
            Envelope::Relay { ciphertext } => {
                if state != ConnectionState::Listening {
                    warn!(?state, "relay frame outside listening dropped");
                    return Ok(());
                }
                let key = self.session_key.clone().ok_or(BridgeError::NoSessionKey)?;
                let actions = self.dispatcher.handle_sealed(&key, &ciphertext).await?;
                self.perform(actions).await
            }
            Envelope::NewCorrespondingRegistered => {
                if state == ConnectionState::WaitingForReconnection {
                    info!("web client reconnected");
                    self.enter(ConnectionState::Listening);
                } else {
                    debug!(?state, "unexpected web client registration noted");
                    self.machine.note_unexpected_peer_registration(Instant::now());
                }
                Ok(())
            }
            Envelope::CorrespondingDisconnected => self.on_peer_disconnected(),
            Envelope::ByeBye => {
                info!("relay said bye");
                self.finish().await;
                Ok(())
            }
            Envelope::ServerError { code } => Err(BridgeError::Server(code)),
            other @ (Envelope::RegisterConnection { .. } | Envelope::RegisterCorresponding { .. }) => {
                Err(BridgeError::UnexpectedEnvelope {
                    kind: other.kind(),
                    state,
                })
            }
        }
    }

    async fn start_handshake(&mut self) -> Result<(), BridgeError> {
        let mut session = AppEstablishment::new();
        let first = handshake::prepare_first_message(
            &mut session,
            &self.pairing.browser_public_key,
            &self.pairing.connection_identifier,
        )?;
        self.establishment = Some(session);
        if self.enter(ConnectionState::Protocol1Sent) == ConnectionState::Protocol1Sent {
            self.send_envelope(Envelope::Connection { payload: first }).await?;
        }
        Ok(())
    }

    async fn on_handshake_reply(&mut self, payload: &[u8]) -> Result<(), BridgeError> {
        if self.enter(ConnectionState::Protocol2Received) != ConnectionState::Protocol2Received {
            return Ok(());
        }
        let session = self.establishment.as_mut().ok_or(BridgeError::NoSessionKey)?;
        handshake::handle_second_message(session, payload)?;
        let third = handshake::prepare_third_message(session)?;
        let sas = session.compute_sas_code()?;

        if self.enter(ConnectionState::Protocol3Sent) != ConnectionState::Protocol3Sent {
            return Ok(());
        }
        self.send_envelope(Envelope::Connection { payload: third }).await?;

        self.sas_code = Some(sas);
        self.sas_rejected = false;
        self.enter(ConnectionState::WaitingForSasValidation);
        info!("handshake complete; waiting for SAS confirmation");
        Ok(())
    }

    fn on_validate_sas(&mut self, code: &str) -> Result<(), BridgeError> {
        let state = self.machine.state();
        if state != ConnectionState::WaitingForSasValidation {
            warn!(?state, "SAS submitted outside validation");
            return Ok(());
        }
        if self.sas_code.as_deref() != Some(code) {
            warn!("SAS mismatch");
            self.sas_rejected = true;
            self.publish();
            return Ok(());
        }

        let session = self.establishment.take().ok_or(BridgeError::NoSessionKey)?;
        self.session_key = Some(session.derive_shared_key()?);
        self.sas_rejected = false;
        info!("SAS confirmed");
        self.enter(ConnectionState::Listening);
        Ok(())
    }

    fn on_peer_disconnected(&mut self) -> Result<(), BridgeError> {
        let state = self.machine.state();
        match state {
            ConnectionState::Listening => {
                if self.machine.suppress_disconnect(Instant::now()) {
                    info!("stale disconnect after re-registration ignored");
                    return Ok(());
                }
                if self.enter(ConnectionState::WaitingForReconnection)
                    == ConnectionState::WaitingForReconnection
                {
                    let delay = self.config.reconnection_timeout();
                    self.timers
                        .reconnection
                        .arm_once(delay, self.tx.clone(), |generation| Event::Timer {
                            kind: TimerKind::Reconnection,
                            generation,
                        });
                }
                Ok(())
            }
            ConnectionState::WaitingForReconnection | ConnectionState::Reconnecting => {
                debug!(?state, "web client disconnect repeated");
                Ok(())
            }
            _ => {
                warn!(?state, "web client left during setup");
                self.enter(ConnectionState::Error);
                Ok(())
            }
        }
    }

    async fn on_link_closed(&mut self) -> Result<(), BridgeError> {
        let state = self.machine.state();
        match state {
            ConnectionState::Listening | ConnectionState::WaitingForReconnection => {
                info!(?state, "relay link lost; reconnecting");
                self.reconnect().await
            }
            _ => {
                warn!(?state, "relay link lost");
                self.enter(ConnectionState::Error);
                Ok(())
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) -> Result<(), BridgeError> {
        let state = self.machine.state();
        match kind {
            TimerKind::Protocol => {
                if self.machine.protocol_timeout_is_fatal() {
                    warn!(?state, "protocol timeout");
                    self.enter(ConnectionState::Error);
                } else {
                    debug!(?state, "benign protocol timeout");
                }
            }
            TimerKind::Reconnection => {
                if state == ConnectionState::WaitingForReconnection {
                    warn!("web client did not come back");
                    self.enter(ConnectionState::Error);
                }
            }
            TimerKind::KeepAlive => {
                if state == ConnectionState::Listening {
                    self.send_frame(&WebFrame::Ping(PingPong {
                        ping: true,
                        pong: false,
                    }))
                    .await?;
                }
            }
            TimerKind::ProactiveReconnect => {
                if state == ConnectionState::Listening {
                    info!("proactive reconnection");
                    self.reconnect().await?;
                }
            }
        }
        Ok(())
    }

    async fn perform(&mut self, actions: Vec<Action>) -> Result<(), BridgeError> {
        for action in actions {
            match action {
                Action::Reply(frame) => self.send_frame(&frame).await?,
                Action::StreamAttachment { attachment_id, path } => self.start_download(attachment_id, path)?,
                Action::ArmUploadTimeout { local_id } => {
                    let id = local_id.clone();
                    self.dispatcher
                        .arm_upload_timeout(&local_id, self.tx.clone(), move |attempt| {
                            Event::UploadTimeout {
                                local_id: id,
                                attempt,
                            }
                        });
                }
                Action::Bye => {
                    self.finish().await;
                    break;
                }
            }
        }
        Ok(())
    }

    fn start_download(&self, attachment_id: i64, path: PathBuf) -> Result<(), BridgeError> {
        let outlet = LiveOutlet {
            transport: self.transport.clone().ok_or(BridgeError::TransportClosed)?,
            key: self.session_key.clone().ok_or(BridgeError::NoSessionKey)?,
            status: self.status.subscribe(),
        };
        let settings = DownloadSettings::from(&self.config);
        tokio::spawn(async move {
            let outcome = download::stream_attachment(&outlet, attachment_id, &path, &settings).await;
            match outcome {
                DownloadOutcome::Completed { chunks, bytes } => {
                    debug!(attachment_id, chunks, bytes, "download finished")
                }
                DownloadOutcome::Failed { at } => warn!(attachment_id, ?at, "download failed"),
                DownloadOutcome::Aborted { at } => info!(attachment_id, ?at, "download aborted"),
            }
        });
        Ok(())
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// Request `requested` and apply its timer effects. Returns the state
    /// actually entered.
    fn enter(&mut self, requested: ConnectionState) -> ConnectionState {
        let Some(transition) = self.machine.transition(requested) else {
            return self.machine.state();
        };
        for effect in &transition.effects {
            self.apply(*effect);
        }
        if transition.to == ConnectionState::Listening {
            info!("listening");
        }
        self.publish();
        transition.to
    }

    fn apply(&mut self, effect: TimerEffect) {
        match effect {
            TimerEffect::CancelProtocolTimeout => self.timers.protocol.cancel(),
            TimerEffect::ArmProtocolTimeout => {
                self.timers
                    .protocol
                    .arm_once(self.config.protocol_timeout(), self.tx.clone(), |generation| {
                        Event::Timer {
                            kind: TimerKind::Protocol,
                            generation,
                        }
                    });
            }
            TimerEffect::StartKeepAlive => {
                let period = self.config.keepalive_interval();
                self.timers
                    .keepalive
                    .arm_repeating(move || period, self.tx.clone(), |generation| Event::Timer {
                        kind: TimerKind::KeepAlive,
                        generation,
                    });
            }
            TimerEffect::StartProactiveReconnect => {
                let config = self.config.clone();
                self.timers.proactive.arm_repeating(
                    move || config.proactive_reconnect_delay(),
                    self.tx.clone(),
                    |generation| Event::Timer {
                        kind: TimerKind::ProactiveReconnect,
                        generation,
                    },
                );
            }
            TimerEffect::CancelReconnectionTimeout => self.timers.reconnection.cancel(),
            TimerEffect::CancelAll => self.timers.cancel_all(),
        }
    }

    fn publish(&self) {
        self.status.send_replace(BridgeStatus {
            state: self.machine.state(),
            sas_code: self.sas_code.clone(),
            sas_rejected: self.sas_rejected,
            protocol_done: self.machine.protocol_done(),
        });
    }

    // ── Links ───────────────────────────────────────────────────────────────

    async fn connect(&mut self) -> Result<(), BridgeError> {
        let Connection { transport, inbound } = self.connector.connect().await?;
        self.link += 1;
        self.reader = Some(tokio::spawn(forward_inbound(self.link, inbound, self.tx.clone())));
        self.transport = Some(transport);

        if self.enter(ConnectionState::Connected) == ConnectionState::Connected {
            self.send_envelope(Envelope::RegisterConnection {
                identifier: self.pairing.connection_identifier.clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), BridgeError> {
        if self.enter(ConnectionState::Reconnecting) != ConnectionState::Reconnecting {
            return Ok(());
        }
        self.drop_link();
        self.connect().await
    }

    fn drop_link(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.link += 1;
    }

    async fn finish(&mut self) {
        if self.enter(ConnectionState::Finishing) != ConnectionState::Finishing {
            return;
        }
        if let Err(err) = self.send_envelope(Envelope::ByeBye).await {
            debug!(error = %err, "bye not delivered");
        }
    }

    fn teardown(&mut self) {
        self.timers.cancel_all();
        self.drop_link();
        self.establishment = None;
        self.publish();
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), BridgeError> {
        let transport = self.transport.as_ref().ok_or(BridgeError::TransportClosed)?;
        transport.send(envelope).await
    }

    async fn send_frame(&self, frame: &WebFrame) -> Result<(), BridgeError> {
        let key = self.session_key.as_ref().ok_or(BridgeError::NoSessionKey)?;
        let envelope = codec::seal_frame(key, frame)?;
        self.send_envelope(envelope).await
    }
}

async fn forward_inbound(link: u64, mut inbound: mpsc::Receiver<Envelope>, tx: mpsc::Sender<Event>) {
    while let Some(envelope) = inbound.recv().await {
        if tx.send(Event::Inbound { link, envelope }).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Event::LinkClosed { link }).await;
}

/// Download sink bound to the link that was current when it started.
struct LiveOutlet {
    transport: Arc<dyn RelayTransport>,
    key: SymmetricKey,
    status: watch::Receiver<BridgeStatus>,
}

#[async_trait]
impl ChunkOutlet for LiveOutlet {
    fn backlog(&self) -> usize {
        self.transport.backlog()
    }

    fn is_listening(&self) -> bool {
        self.status.borrow().state == ConnectionState::Listening
    }

    async fn send(&self, frame: WebFrame) -> Result<(), BridgeError> {
        let envelope = codec::seal_frame(&self.key, &frame)?;
        self.transport.send(envelope).await
    }
}
