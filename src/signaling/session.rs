//! Signaling session over one adopted connection.
//!
//! The session runs the endpoint race, sends the single `connect` message
//! on the winner, and turns inbound frames into [`SignalingEvent`]s for its
//! owner. Every send checks the closing flag, and teardown happens exactly
//! once no matter how many failure signals race to trigger it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};

use super::message::{
    self, ConnectRequest, InboundMessage, NotificationMessage, OfferMessage, PushMessage,
    SwitchedMessage,
};
use super::racer::{CandidateRegistry, ConnectionEvent, TransportRacer};
use crate::error::{CloseEvent, DisconnectReason, ErrorReason};
use crate::transport::{Connection, Connector};

/// Events delivered to the owner of a [`SignalingSession`].
#[derive(Debug)]
pub enum SignalingEvent {
    /// A candidate was adopted and the `connect` message was sent on it.
    Connected { endpoint: String },
    InitialOffer(OfferMessage),
    Switched(SwitchedMessage),
    UpdateOffer(String),
    ReOffer(String),
    Notification(NotificationMessage),
    Push(PushMessage),
    /// The server pinged with a stats request. Reply with a snapshot (or
    /// `None`); the pong goes out once the reply arrives.
    StatsRequested(oneshot::Sender<Option<Value>>),
    Redirect { location: String },
    Error { reason: ErrorReason, message: String },
    /// Terminal. Never sent after a redirect.
    Disconnected {
        reason: DisconnectReason,
        close: Option<CloseEvent>,
    },
}

struct Shared {
    label: String,
    request: ConnectRequest,
    conn: Mutex<Option<Box<dyn Connection>>>,
    registry: Mutex<Option<Arc<CandidateRegistry>>>,
    connected_endpoint: Mutex<Option<String>>,
    close_event: Mutex<Option<CloseEvent>>,
    sink: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    started: AtomicBool,
    connect_sent: AtomicBool,
    closing: AtomicBool,
    redirected: AtomicBool,
    shutdown: Notify,
}

pub struct SignalingSession {
    shared: Arc<Shared>,
}

impl SignalingSession {
    pub fn new(request: ConnectRequest) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (sink, events) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            label: format!("[signaling:{}]", request.role),
            request,
            conn: Mutex::new(None),
            registry: Mutex::new(None),
            connected_endpoint: Mutex::new(None),
            close_event: Mutex::new(None),
            sink: Mutex::new(Some(sink)),
            started: AtomicBool::new(false),
            connect_sent: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            redirected: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        (Self { shared }, events)
    }

    /// Race `endpoints` and start the handshake on the winner. Only the
    /// first call has any effect.
    pub fn connect(&self, connector: &dyn Connector, endpoints: &[String]) {
        let shared = &self.shared;
        if shared.is_closing() {
            tracing::debug!("{} connect after close ignored", shared.label);
            return;
        }
        if shared.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("{} connect called twice", shared.label);
            return;
        }

        tracing::info!("{} racing {} endpoint(s)", shared.label, endpoints.len());
        let race = TransportRacer::start(connector, endpoints);
        *shared.registry.lock() = Some(race.registry());

        // disconnect() may have run between the checks above and storing
        // the registry; make sure the race does not outlive it.
        if shared.is_closing() {
            race.cancel();
            return;
        }
        tokio::spawn(receive_loop(Arc::clone(shared), race));
    }

    pub fn send_answer(&self, sdp: &str) -> bool {
        self.shared.send_text(message::encode_answer(sdp))
    }

    pub fn send_update_answer(&self, sdp: &str) -> bool {
        self.shared.send_text(message::encode_update_answer(sdp))
    }

    pub fn send_re_answer(&self, sdp: &str) -> bool {
        self.shared.send_text(message::encode_re_answer(sdp))
    }

    pub fn send_candidate(&self, candidate: &str) -> bool {
        self.shared.send_text(message::encode_candidate(candidate))
    }

    /// Best-effort `disconnect` message. Does not close anything.
    pub fn send_disconnect(&self, reason: DisconnectReason) -> bool {
        self.shared.send_text(message::encode_disconnect(reason))
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        self.shared.disconnect(reason);
    }

    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    pub fn was_redirected(&self) -> bool {
        self.shared.redirected.load(Ordering::Acquire)
    }

    /// Endpoint of the adopted connection, once there is one.
    pub fn connected_endpoint(&self) -> Option<String> {
        self.shared.connected_endpoint.lock().clone()
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl Shared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn emit(&self, event: SignalingEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn send_text(&self, encoded: serde_json::Result<String>) -> bool {
        let text = match encoded {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("{} failed to encode message, not sent: {}", self.label, e);
                return false;
            }
        };
        if self.is_closing() {
            tracing::debug!("{} send suppressed, session closing", self.label);
            return false;
        }
        let conn = self.conn.lock();
        if self.is_closing() {
            return false;
        }
        match conn.as_ref() {
            Some(conn) => {
                tracing::debug!("{} send: {}", self.label, text);
                conn.send(text)
            }
            None => {
                tracing::debug!("{} send before adoption dropped", self.label);
                false
            }
        }
    }

    fn on_open(&self, conn: Box<dyn Connection>) {
        let endpoint = conn.endpoint().to_string();
        {
            let mut slot = self.conn.lock();
            if self.is_closing() {
                conn.close(CloseEvent::NORMAL);
                return;
            }
            *slot = Some(conn);
        }
        *self.connected_endpoint.lock() = Some(endpoint.clone());
        tracing::info!("{} connected to {}", self.label, endpoint);

        self.send_connect();
        self.emit(SignalingEvent::Connected { endpoint });
    }

    fn send_connect(&self) {
        if self.connect_sent.swap(true, Ordering::AcqRel) {
            tracing::debug!("{} connect already sent", self.label);
            return;
        }
        self.send_text(message::encode_connect(&self.request));
    }

    fn on_message(self: &Arc<Self>, text: &str) {
        let msg = match InboundMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("{} {}", self.label, e);
                self.emit(SignalingEvent::Error {
                    reason: ErrorReason::SignalingFailure,
                    message: e.to_string(),
                });
                self.disconnect(DisconnectReason::SignalingFailure);
                return;
            }
        };

        match msg {
            InboundMessage::Offer(offer) => self.emit(SignalingEvent::InitialOffer(offer)),
            InboundMessage::Switched(switched) => self.emit(SignalingEvent::Switched(switched)),
            InboundMessage::Update(update) => self.emit(SignalingEvent::UpdateOffer(update.sdp)),
            InboundMessage::ReOffer(re_offer) => {
                self.emit(SignalingEvent::ReOffer(re_offer.sdp))
            }
            InboundMessage::Notify(notification) => {
                self.emit(SignalingEvent::Notification(notification))
            }
            InboundMessage::Push(push) => self.emit(SignalingEvent::Push(push)),
            InboundMessage::Ping(ping) => self.on_ping(ping.wants_stats()),
            InboundMessage::Redirect(redirect) => self.on_redirect(redirect.location),
            InboundMessage::Unknown(kind) => {
                tracing::debug!("{} unknown message type ignored: {}", self.label, kind);
            }
        }
    }

    fn on_ping(self: &Arc<Self>, wants_stats: bool) {
        if !wants_stats {
            self.send_text(message::encode_pong(None));
            return;
        }
        let (reply, stats) = oneshot::channel();
        self.emit(SignalingEvent::StatsRequested(reply));
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let stats = stats.await.ok().flatten();
            shared.send_text(message::encode_pong(stats.as_ref()));
        });
    }

    fn on_redirect(&self, location: String) {
        tracing::info!("{} redirected to {}", self.label, location);
        self.redirected.store(true, Ordering::Release);
        self.emit(SignalingEvent::Redirect { location });
        self.disconnect(DisconnectReason::Redirected);
    }

    /// The server started the closing handshake; answer with its code.
    fn on_closing(&self, code: u16, reason: &str) {
        tracing::info!("{} closing: code={} reason={:?}", self.label, code, reason);
        if let Some(conn) = self.conn.lock().as_ref() {
            conn.close(code);
        }
    }

    fn on_closed(&self, code: u16, reason: String) {
        tracing::info!("{} closed: code={} reason={:?}", self.label, code, reason);
        let close = CloseEvent { code, reason };
        if !close.is_normal() {
            self.emit(SignalingEvent::Error {
                reason: ErrorReason::SignalingFailure,
                message: format!("websocket closed with code {}", close.code),
            });
        }
        *self.close_event.lock() = Some(close);
        self.disconnect(DisconnectReason::WebSocketClosed);
    }

    fn on_failure(&self, cause: &str) {
        tracing::warn!("{} transport failure: {}", self.label, cause);
        self.emit(SignalingEvent::Error {
            reason: ErrorReason::SignalingFailure,
            message: cause.to_string(),
        });
        self.disconnect(DisconnectReason::WebSocketError);
    }

    /// Stop the race, close the adopted connection, and report once.
    /// Returns false if teardown had already begun.
    fn shut(&self) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(registry) = self.registry.lock().take() {
            registry.cancel();
        }
        if let Some(conn) = self.conn.lock().take() {
            conn.close(CloseEvent::NORMAL);
        }
        self.shutdown.notify_one();
        true
    }

    fn disconnect(&self, reason: DisconnectReason) {
        if !self.shut() {
            tracing::debug!("{} disconnect({}) ignored, already closing", self.label, reason);
            return;
        }
        tracing::info!("{} disconnect: {}", self.label, reason);

        let sink = self.sink.lock().take();
        if self.redirected.load(Ordering::Acquire) {
            tracing::debug!("{} disconnect notification suppressed after redirect", self.label);
            return;
        }
        let close = match reason {
            DisconnectReason::ClientRequested => Some(CloseEvent::client_disconnect()),
            _ => self.close_event.lock().clone(),
        };
        if let Some(sink) = sink {
            let _ = sink.send(SignalingEvent::Disconnected { reason, close });
        }
    }

    /// Silent teardown for a session dropped without `disconnect`.
    fn release(&self) {
        if self.shut() {
            self.sink.lock().take();
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut race: TransportRacer) {
    loop {
        let event = tokio::select! {
            _ = shared.shutdown.notified() => break,
            event = race.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if shared.is_closing() {
            break;
        }

        match event {
            ConnectionEvent::Opened(conn) => shared.on_open(conn),
            ConnectionEvent::Message(text) => {
                tracing::debug!("{} recv: {}", shared.label, text);
                shared.on_message(&text);
            }
            ConnectionEvent::Closing { code, reason } => shared.on_closing(code, &reason),
            ConnectionEvent::Closed { code, reason } => shared.on_closed(code, reason),
            ConnectionEvent::Failed(cause) => shared.on_failure(&cause),
            ConnectionEvent::AllFailed => shared.on_failure("all signaling endpoints failed"),
        }
    }
    race.cancel();
    tracing::debug!("{} receive loop finished", shared.label);
}
