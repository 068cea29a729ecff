//! Media channel coordinator.
//!
//! A [`MediaChannel`] drives one logical media session: client offer,
//! endpoint race and handshake, peer creation on the initial offer,
//! renegotiation, and a single teardown path. All state lives in one actor
//! task, fed through channels by the signaling session, the peer session
//! and the connect timer.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Sleep};

use crate::config::ChannelConfig;
use crate::error::{CloseEvent, DisconnectReason, EngineError, ErrorReason};
use crate::media::{self, FatalKind, MediaEngine, PeerEvent, PeerNetworkConfig, PeerSession};
use crate::signaling::message::{
    self, InboundMessage, NotificationMessage, OfferMessage, PushMessage, SwitchedMessage,
};
use crate::signaling::{SignalingEvent, SignalingSession};
use crate::transport::Connector;

/// Grace period before the websocket is closed after a `switched` that
/// lets the client drop it. Messages already queued on it can still go out.
const WEBSOCKET_CLOSE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Racing,
    AwaitingOffer,
    Negotiating,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Racing => "racing",
            SessionState::AwaitingOffer => "awaiting-offer",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connection counts carried by `connection.created` / `connection.destroyed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendeesCount {
    pub sendrecv: u32,
    pub sendonly: u32,
    pub recvonly: u32,
}

impl AttendeesCount {
    pub fn total(&self) -> u32 {
        self.sendrecv + self.sendonly + self.recvonly
    }

    fn from_notification(n: &NotificationMessage) -> Option<Self> {
        if !matches!(
            n.event_type.as_str(),
            "connection.created" | "connection.destroyed"
        ) {
            return None;
        }
        Some(Self {
            sendrecv: n.channel_sendrecv_connections.unwrap_or(0),
            sendonly: n.channel_sendonly_connections.unwrap_or(0),
            recvonly: n.channel_recvonly_connections.unwrap_or(0),
        })
    }
}

/// Everything the channel reports to the application.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Media connectivity confirmed. Sent at most once.
    Connected,
    /// Terminal. Sent at most once, and never after a redirect that was
    /// not followed.
    Closed {
        reason: DisconnectReason,
        close: Option<CloseEvent>,
    },
    Error {
        reason: ErrorReason,
        message: String,
    },
    Warning {
        reason: ErrorReason,
    },
    Offer(OfferMessage),
    Switched(SwitchedMessage),
    Notification(NotificationMessage),
    AttendeesCount(AttendeesCount),
    Push(PushMessage),
    RemoteStreamAdded(String),
    RemoteStreamRemoved(String),
    /// The server redirected and `follow_redirect` is off. The channel is
    /// closed; reconnecting is up to the application.
    Redirected {
        location: String,
    },
}

#[derive(Debug, Default)]
struct ChannelInfo {
    connection_id: Option<String>,
    contact_endpoint: Option<String>,
    connected_endpoint: Option<String>,
}

enum Command {
    Connect,
    Disconnect,
}

/// Handle to a media channel. Dropping it disconnects the channel.
pub struct MediaChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    info: Arc<Mutex<ChannelInfo>>,
}

impl MediaChannel {
    /// Create the channel and spawn its actor. Nothing happens on the
    /// network until [`MediaChannel::connect`].
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        engine: Arc<dyn MediaEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionState::Idle);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let info = Arc::new(Mutex::new(ChannelInfo::default()));

        let coordinator = Coordinator {
            label: format!("[channel:{}]", config.role),
            config,
            connector,
            engine,
            commands: command_rx,
            events,
            state: state_tx,
            info: Arc::clone(&info),
            signaling: None,
            signaling_rx: None,
            peer: None,
            peer_tx,
            peer_rx,
            timer: None,
            websocket_close: None,
            in_flight: None,
            pending_offers: VecDeque::new(),
            client_offer: None,
            connected_notified: false,
            peer_failed: false,
            switched: false,
            ignore_disconnect_websocket: false,
            closing: false,
        };
        tokio::spawn(coordinator.run());

        (
            Self {
                commands,
                state,
                info,
            },
            event_rx,
        )
    }

    /// Start the session. Ignored unless the channel is idle.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Tear the session down. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the channel reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while *state.borrow_and_update() != SessionState::Closed {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Server-assigned id of this client's own stream.
    pub fn connection_id(&self) -> Option<String> {
        self.info.lock().connection_id.clone()
    }

    /// First endpoint that ever opened.
    pub fn contact_endpoint(&self) -> Option<String> {
        self.info.lock().contact_endpoint.clone()
    }

    /// Endpoint that delivered the initial offer.
    pub fn connected_endpoint(&self) -> Option<String> {
        self.info.lock().connected_endpoint.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferKind {
    Initial,
    Update,
    ReOffer,
}

enum EngineOutcome {
    ClientOffer(Result<String, EngineError>),
    Answer {
        kind: OfferKind,
        result: Result<String, EngineError>,
    },
}

struct Coordinator {
    label: String,
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    engine: Arc<dyn MediaEngine>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: watch::Sender<SessionState>,
    info: Arc<Mutex<ChannelInfo>>,
    signaling: Option<SignalingSession>,
    signaling_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    peer: Option<Box<dyn PeerSession>>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    timer: Option<Pin<Box<Sleep>>>,
    websocket_close: Option<Pin<Box<Sleep>>>,
    /// At most one engine operation runs at a time.
    in_flight: Option<BoxFuture<'static, EngineOutcome>>,
    pending_offers: VecDeque<(OfferKind, String)>,
    client_offer: Option<String>,
    connected_notified: bool,
    peer_failed: bool,
    /// Signaling moved to the peer's data channels.
    switched: bool,
    ignore_disconnect_websocket: bool,
    closing: bool,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn poll_opt(task: &mut Option<BoxFuture<'static, EngineOutcome>>) -> EngineOutcome {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

impl Coordinator {
    async fn run(mut self) {
        while !self.closing {
            // Biased so that two events ready at the same instant are
            // always handled in the same order.
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => self.connect(),
                    Some(Command::Disconnect) | None => {
                        self.teardown(DisconnectReason::ClientRequested, None)
                    }
                },
                event = recv_opt(&mut self.signaling_rx) => match event {
                    Some(event) => self.on_signaling(event),
                    None => self.signaling_rx = None,
                },
                Some(event) = self.peer_rx.recv() => self.on_peer(event),
                _ = sleep_opt(&mut self.timer) => self.on_timeout(),
                _ = sleep_opt(&mut self.websocket_close) => self.close_websocket(),
                outcome = poll_opt(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_engine(outcome);
                }
            }
        }
        tracing::debug!("{} actor finished", self.label);
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            tracing::info!("{} {} -> {}", self.label, prev, state);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn connect(&mut self) {
        if self.current_state() != SessionState::Idle {
            tracing::debug!("{} connect ignored in state {}", self.label, self.current_state());
            return;
        }
        media::ensure_initialized(self.engine.as_ref());
        self.set_state(SessionState::Racing);
        self.timer = Some(Box::pin(time::sleep(self.config.timeout())));

        let offer = self.engine.create_local_offer(&self.config.capabilities());
        self.in_flight = Some(async move { EngineOutcome::ClientOffer(offer.await) }.boxed());
    }

    fn start_signaling(&mut self, endpoints: &[String], redirect: bool) {
        let mut request = self.config.connect_request(self.client_offer.clone());
        request.redirect = redirect;
        let (session, events) = SignalingSession::new(request);
        session.connect(self.connector.as_ref(), endpoints);
        self.signaling = Some(session);
        self.signaling_rx = Some(events);
    }

    fn on_engine(&mut self, outcome: EngineOutcome) {
        match outcome {
            EngineOutcome::ClientOffer(result) => {
                match result {
                    Ok(sdp) => self.client_offer = Some(sdp),
                    Err(e) => {
                        tracing::warn!("{} {}; connecting without client offer", self.label, e)
                    }
                }
                let endpoints = self.config.endpoints.clone();
                self.start_signaling(&endpoints, false);
            }
            EngineOutcome::Answer { kind, result } => self.on_answer(kind, result),
        }
    }

    fn on_answer(&mut self, kind: OfferKind, result: Result<String, EngineError>) {
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!("{} negotiation failed: {}", self.label, e);
                self.emit(ChannelEvent::Error {
                    reason: ErrorReason::SignalingFailure,
                    message: e.to_string(),
                });
                self.teardown(DisconnectReason::SignalingFailure, None);
                return;
            }
        };
        if self.switched {
            let encoded = match kind {
                OfferKind::Initial => message::encode_answer(&sdp),
                OfferKind::Update => message::encode_update_answer(&sdp),
                OfferKind::ReOffer => message::encode_re_answer(&sdp),
            };
            self.send_over_data_channel(encoded);
        } else if let Some(signaling) = &self.signaling {
            match kind {
                OfferKind::Initial => signaling.send_answer(&sdp),
                OfferKind::Update => signaling.send_update_answer(&sdp),
                OfferKind::ReOffer => signaling.send_re_answer(&sdp),
            };
        }
        if kind != OfferKind::Initial && self.connected_notified {
            self.set_state(SessionState::Connected);
        }
        self.start_next_negotiation();
    }

    fn enqueue_offer(&mut self, kind: OfferKind, sdp: String) {
        if self.peer.is_none() {
            tracing::warn!("{} {:?} offer before peer exists, ignored", self.label, kind);
            return;
        }
        self.pending_offers.push_back((kind, sdp));
        self.start_next_negotiation();
    }

    fn start_next_negotiation(&mut self) {
        if self.in_flight.is_some() || self.closing {
            return;
        }
        let Some(peer) = &self.peer else {
            return;
        };
        let Some((kind, sdp)) = self.pending_offers.pop_front() else {
            return;
        };
        tracing::debug!("{} negotiating {:?} offer: {}", self.label, kind, sdp);
        let answer = peer.ingest_offer_and_answer(sdp);
        self.in_flight = Some(
            async move {
                EngineOutcome::Answer {
                    kind,
                    result: answer.await,
                }
            }
            .boxed(),
        );
        self.set_state(SessionState::Negotiating);
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected { endpoint } => {
                self.info.lock().contact_endpoint.get_or_insert(endpoint);
                if self.current_state() == SessionState::Racing {
                    self.set_state(SessionState::AwaitingOffer);
                }
            }
            SignalingEvent::InitialOffer(offer) => self.on_initial_offer(offer),
            SignalingEvent::UpdateOffer(sdp) => self.enqueue_offer(OfferKind::Update, sdp),
            SignalingEvent::ReOffer(sdp) => self.enqueue_offer(OfferKind::ReOffer, sdp),
            SignalingEvent::Switched(switched) => self.on_switched(switched),
            SignalingEvent::Notification(notification) => self.on_notification(notification),
            SignalingEvent::Push(push) => self.emit(ChannelEvent::Push(push)),
            SignalingEvent::StatsRequested(reply) => match &self.peer {
                Some(peer) => {
                    let stats = peer.stats();
                    tokio::spawn(async move {
                        let _ = reply.send(stats.await);
                    });
                }
                None => {
                    let _ = reply.send(None);
                }
            },
            SignalingEvent::Redirect { location } => self.on_redirect(location),
            SignalingEvent::Error { reason, message } => {
                if self.ignores_websocket_loss() {
                    tracing::debug!("{} websocket error ignored: {}", self.label, message);
                    return;
                }
                self.emit(ChannelEvent::Error { reason, message })
            }
            SignalingEvent::Disconnected { reason, close } => {
                if self.ignores_websocket_loss() {
                    tracing::info!(
                        "{} websocket gone ({}), signaling stays on data channel",
                        self.label,
                        reason
                    );
                    self.websocket_close = None;
                    self.signaling = None;
                    return;
                }
                self.teardown(reason, close)
            }
        }
    }

    fn ignores_websocket_loss(&self) -> bool {
        self.switched && self.ignore_disconnect_websocket
    }

    fn on_notification(&mut self, notification: NotificationMessage) {
        if let Some(count) = AttendeesCount::from_notification(&notification) {
            self.emit(ChannelEvent::AttendeesCount(count));
        }
        self.emit(ChannelEvent::Notification(notification));
    }

    fn on_switched(&mut self, switched: SwitchedMessage) {
        self.switched = true;
        self.ignore_disconnect_websocket = switched.ignore_disconnect_websocket.unwrap_or(false);
        tracing::info!(
            "{} switched to data channel signaling (ignore_disconnect_websocket={})",
            self.label,
            self.ignore_disconnect_websocket
        );
        if self.ignore_disconnect_websocket {
            self.websocket_close = Some(Box::pin(time::sleep(WEBSOCKET_CLOSE_DELAY)));
        }
        self.emit(ChannelEvent::Switched(switched));
    }

    /// The websocket is no longer needed. Dropping the session closes it
    /// without a terminal event.
    fn close_websocket(&mut self) {
        self.websocket_close = None;
        if self.signaling.take().is_some() {
            tracing::info!("{} closing websocket after switch", self.label);
        }
        self.signaling_rx = None;
    }

    fn send_over_data_channel(&self, encoded: serde_json::Result<String>) -> bool {
        let Some(peer) = &self.peer else {
            return false;
        };
        match encoded {
            Ok(text) => {
                tracing::debug!("{} data channel send: {}", self.label, text);
                peer.send_signaling(text)
            }
            Err(e) => {
                tracing::warn!("{} failed to encode message, not sent: {}", self.label, e);
                false
            }
        }
    }

    /// Signaling that arrives on the peer's data channel after a switch.
    fn on_data_channel_message(&mut self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(InboundMessage::ReOffer(re_offer)) => {
                self.enqueue_offer(OfferKind::ReOffer, re_offer.sdp)
            }
            Ok(InboundMessage::Update(update)) => self.enqueue_offer(OfferKind::Update, update.sdp),
            Ok(InboundMessage::Notify(notification)) => self.on_notification(notification),
            Ok(InboundMessage::Push(push)) => self.emit(ChannelEvent::Push(push)),
            Ok(other) => {
                tracing::debug!("{} data channel message ignored: {:?}", self.label, other)
            }
            Err(e) => tracing::warn!("{} bad data channel message: {}", self.label, e),
        }
    }

    fn on_initial_offer(&mut self, offer: OfferMessage) {
        if self.peer.is_some() || self.current_state() != SessionState::AwaitingOffer {
            tracing::warn!(
                "{} unexpected initial offer in state {}, ignored",
                self.label,
                self.current_state()
            );
            return;
        }

        {
            let mut info = self.info.lock();
            info.connection_id = offer.connection_id.clone();
            info.connected_endpoint = self
                .signaling
                .as_ref()
                .and_then(|s| s.connected_endpoint());
        }

        let network = PeerNetworkConfig::from_offer(offer.config.as_ref());
        let peer = self.engine.create_peer(
            &self.config.capabilities(),
            network,
            self.peer_tx.clone(),
        );
        match peer {
            Ok(peer) => self.peer = Some(peer),
            Err(e) => {
                tracing::warn!("{} {}", self.label, e);
                self.emit(ChannelEvent::Error {
                    reason: ErrorReason::SignalingFailure,
                    message: e.to_string(),
                });
                self.teardown(DisconnectReason::SignalingFailure, None);
                return;
            }
        }

        let sdp = offer.sdp.clone();
        self.emit(ChannelEvent::Offer(offer));
        self.enqueue_offer(OfferKind::Initial, sdp);
    }

    fn on_redirect(&mut self, location: String) {
        if self.config.follow_redirect && self.peer.is_none() {
            tracing::info!("{} following redirect to {}", self.label, location);
            // The old session has already closed itself without reporting.
            self.signaling = None;
            self.signaling_rx = None;
            self.set_state(SessionState::Racing);
            self.start_signaling(&[location], true);
            return;
        }
        self.emit(ChannelEvent::Redirected { location });
        self.shutdown(DisconnectReason::Redirected, None, false);
    }

    fn on_peer(&mut self, event: PeerEvent) {
        if self.closing {
            return;
        }
        match event {
            PeerEvent::Connected => {
                self.timer = None;
                if self.connected_notified {
                    return;
                }
                self.connected_notified = true;
                self.set_state(SessionState::Connected);
                self.emit(ChannelEvent::Connected);
            }
            PeerEvent::Disconnected => {
                tracing::warn!("{} media connectivity lost", self.label);
                self.emit(ChannelEvent::Warning {
                    reason: ErrorReason::IceDisconnected,
                });
            }
            PeerEvent::Failed(kind) => {
                self.peer_failed = true;
                let (error, reason) = match kind {
                    FatalKind::IceFailed => (ErrorReason::IceFailure, DisconnectReason::IceFailure),
                    FatalKind::ClosedByServer => (
                        ErrorReason::IceClosedByServer,
                        DisconnectReason::IceClosedByServer,
                    ),
                };
                self.emit(ChannelEvent::Error {
                    reason: error,
                    message: format!("peer session failed: {}", reason),
                });
                self.teardown(reason, None);
            }
            PeerEvent::RemoteStreamAdded(id) => {
                if self.is_own_stream(&id) {
                    tracing::debug!("{} own stream {} echoed back, ignored", self.label, id);
                    return;
                }
                self.emit(ChannelEvent::RemoteStreamAdded(id));
            }
            PeerEvent::RemoteStreamRemoved(id) => {
                if self.is_own_stream(&id) {
                    return;
                }
                self.emit(ChannelEvent::RemoteStreamRemoved(id));
            }
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(signaling) = &self.signaling {
                    signaling.send_candidate(&candidate);
                }
            }
            PeerEvent::SignalingMessage(text) => self.on_data_channel_message(&text),
        }
    }

    fn is_own_stream(&self, id: &str) -> bool {
        self.info.lock().connection_id.as_deref() == Some(id)
    }

    fn on_timeout(&mut self) {
        self.timer = None;
        tracing::warn!("{} timed out in state {}", self.label, self.current_state());
        self.emit(ChannelEvent::Error {
            reason: ErrorReason::Timeout,
            message: format!(
                "media connectivity not confirmed within {}s",
                self.config.timeout_secs
            ),
        });
        self.teardown(DisconnectReason::Timeout, None);
    }

    fn teardown(&mut self, reason: DisconnectReason, close: Option<CloseEvent>) {
        self.shutdown(reason, close, true);
    }

    /// The one teardown path. Later calls are no-ops.
    fn shutdown(&mut self, reason: DisconnectReason, close: Option<CloseEvent>, notify: bool) {
        if self.closing {
            tracing::debug!("{} teardown({}) ignored, already closing", self.label, reason);
            return;
        }
        self.closing = true;
        tracing::info!("{} disconnect: {}", self.label, reason);
        self.set_state(SessionState::Closing);

        self.timer = None;
        self.websocket_close = None;
        self.in_flight = None;
        self.pending_offers.clear();

        let signaling = self.signaling.take();
        self.send_disconnect_if_needed(reason, signaling.as_ref());
        if let Some(signaling) = signaling {
            signaling.disconnect(reason);
        }
        self.signaling_rx = None;

        if let Some(peer) = self.peer.take() {
            peer.dispose();
        }

        if notify {
            let close = close.or_else(|| {
                (reason == DisconnectReason::ClientRequested).then(CloseEvent::client_disconnect)
            });
            self.emit(ChannelEvent::Closed { reason, close });
        }
        self.set_state(SessionState::Closed);
    }

    /// Best-effort `disconnect` to the server, over whichever path still
    /// carries signaling.
    fn send_disconnect_if_needed(
        &self,
        reason: DisconnectReason,
        signaling: Option<&SignalingSession>,
    ) {
        if self.peer_failed {
            return;
        }
        match reason {
            DisconnectReason::ClientRequested => {
                if self.switched {
                    self.send_over_data_channel(message::encode_disconnect(reason));
                } else if let Some(signaling) = signaling {
                    signaling.send_disconnect(reason);
                }
            }
            DisconnectReason::WebSocketClosed | DisconnectReason::WebSocketError => {
                if self.switched && !self.ignore_disconnect_websocket {
                    self.send_over_data_channel(message::encode_disconnect(reason));
                }
            }
            _ => {}
        }
    }
}
