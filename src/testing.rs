//! In-memory transport and media engine used by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::media::{MediaCapabilities, MediaEngine, PeerEvent, PeerNetworkConfig, PeerSession};
use crate::transport::{CandidateId, Connection, Connector, TransportEvent};

/// What a connection handle was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(u16),
    Cancel,
}

/// Connector whose connections are driven by the test through [`MockLink`].
#[derive(Clone)]
pub struct MockConnector {
    links: mpsc::UnboundedSender<MockLink>,
    cancelled: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        (
            Self {
                links,
                cancelled: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        id: CandidateId,
        endpoint: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Connection> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let _ = self.links.send(MockLink {
            id,
            endpoint: endpoint.to_string(),
            events,
            outbound: outbound_rx,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(MockConnection {
            id,
            endpoint: endpoint.to_string(),
            outbound,
            cancelled,
            cancel_count: Arc::clone(&self.cancelled),
        })
    }
}

struct MockConnection {
    id: CandidateId,
    endpoint: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancelled: Arc<AtomicBool>,
    cancel_count: Arc<AtomicUsize>,
}

impl Connection for MockConnection {
    fn id(&self) -> CandidateId {
        self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send(&self, text: String) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    fn close(&self, code: u16) {
        let _ = self.outbound.send(Outbound::Close(code));
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.cancel_count.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.outbound.send(Outbound::Cancel);
    }
}

/// Test side of one mock connection.
pub struct MockLink {
    pub id: CandidateId,
    pub endpoint: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    cancelled: Arc<AtomicBool>,
}

impl MockLink {
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Opened { id: self.id });
    }

    pub fn fail(&self, cause: &str) {
        let _ = self.events.send(TransportEvent::Failed {
            id: self.id,
            cause: cause.to_string(),
        });
    }

    pub fn message(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message {
            id: self.id,
            text: text.to_string(),
        });
    }

    pub fn closing(&self, code: u16, reason: &str) {
        let _ = self.events.send(TransportEvent::Closing {
            id: self.id,
            code,
            reason: reason.to_string(),
        });
    }

    pub fn closed(&self, code: u16, reason: &str) {
        let _ = self.events.send(TransportEvent::Closed {
            id: self.id,
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn next_outbound(&mut self) -> Outbound {
        tokio::time::timeout(Duration::from_secs(3600), self.outbound.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("connection handle dropped")
    }

    /// Next outbound text frame parsed as JSON.
    pub async fn next_json(&mut self) -> Value {
        match self.next_outbound().await {
            Outbound::Text(text) => serde_json::from_str(&text).expect("outbound frame is JSON"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    /// Everything queued so far, without waiting.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            out.push(item);
        }
        out
    }
}

/// Scripted media engine. Every peer it creates is handed to the test
/// through the receiver returned by [`MockEngine::new`].
pub struct MockEngine {
    offer: Mutex<Result<String, EngineError>>,
    answer_error: Mutex<Option<EngineError>>,
    answer_delay: Mutex<Option<Duration>>,
    initialized: AtomicUsize,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockEngine {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                offer: Mutex::new(Ok("client-offer-sdp".to_string())),
                answer_error: Mutex::new(None),
                answer_delay: Mutex::new(None),
                initialized: AtomicUsize::new(0),
                peers,
            }),
            rx,
        )
    }

    pub fn fail_local_offer(&self) {
        *self.offer.lock() = Err(EngineError::OfferFailed("no encoder".to_string()));
    }

    pub fn fail_answers(&self) {
        *self.answer_error.lock() = Some(EngineError::AnswerFailed("bad sdp".to_string()));
    }

    pub fn delay_answers(&self, delay: Duration) {
        *self.answer_delay.lock() = Some(delay);
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl MediaEngine for MockEngine {
    fn initialize(&self) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn create_local_offer(
        &self,
        _capabilities: &MediaCapabilities,
    ) -> BoxFuture<'static, Result<String, EngineError>> {
        let offer = self.offer.lock().clone();
        async move { offer }.boxed()
    }

    fn create_peer(
        &self,
        _capabilities: &MediaCapabilities,
        network: PeerNetworkConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerSession>, EngineError> {
        let disposed = Arc::new(AtomicUsize::new(0));
        let ingested = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let _ = self.peers.send(MockPeer {
            events,
            network,
            disposed: Arc::clone(&disposed),
            ingested: Arc::clone(&ingested),
            sent: Arc::clone(&sent),
        });
        Ok(Box::new(MockPeerSession {
            disposed,
            ingested,
            sent,
            answer_error: self.answer_error.lock().clone(),
            answer_delay: *self.answer_delay.lock(),
        }))
    }
}

struct MockPeerSession {
    disposed: Arc<AtomicUsize>,
    ingested: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
    answer_error: Option<EngineError>,
    answer_delay: Option<Duration>,
}

impl PeerSession for MockPeerSession {
    fn ingest_offer_and_answer(
        &self,
        sdp: String,
    ) -> BoxFuture<'static, Result<String, EngineError>> {
        let n = {
            let mut ingested = self.ingested.lock();
            ingested.push(sdp.clone());
            ingested.len()
        };
        let error = self.answer_error.clone();
        let delay = self.answer_delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match error {
                Some(e) => Err(e),
                None => Ok(format!("answer-{}-for-{}", n, sdp)),
            }
        }
        .boxed()
    }

    fn stats(&self) -> BoxFuture<'static, Option<Value>> {
        async { Some(serde_json::json!([{"type": "transport", "id": "T01"}])) }.boxed()
    }

    fn send_signaling(&self, text: String) -> bool {
        self.sent.lock().push(text);
        true
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test side of one peer session.
pub struct MockPeer {
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub network: PeerNetworkConfig,
    disposed: Arc<AtomicUsize>,
    ingested: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockPeer {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn ingested(&self) -> Vec<String> {
        self.ingested.lock().clone()
    }

    /// Data channel signaling messages, parsed.
    pub fn sent_signaling(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).expect("data channel message is JSON"))
            .collect()
    }
}
