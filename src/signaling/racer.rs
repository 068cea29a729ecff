//! Endpoint racing.
//!
//! Every endpoint is opened at once. The first candidate to open is
//! adopted through a single compare-and-set on the registry; every other
//! candidate is cancelled in the same step, and any event a loser reports
//! afterwards is dropped because its id no longer matches the winner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{CandidateId, Connection, Connector, TransportEvent};

const UNCLAIMED: u64 = 0;
/// Claim value once the race was called off without a winner.
const CANCELLED: u64 = u64::MAX;

/// Candidate handles of one race plus the single claim slot.
pub struct CandidateRegistry {
    claimed: AtomicU64,
    next_id: AtomicU64,
    handles: Mutex<HashMap<CandidateId, Box<dyn Connection>>>,
}

impl Default for CandidateRegistry {
    fn default() -> Self {
        Self {
            claimed: AtomicU64::new(UNCLAIMED),
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }
}

impl CandidateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> CandidateId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a pending candidate. A candidate registered after the race was
    /// decided is cancelled right away.
    pub fn insert(&self, conn: Box<dyn Connection>) {
        let mut handles = self.handles.lock();
        if self.claimed.load(Ordering::Acquire) != UNCLAIMED {
            drop(handles);
            conn.cancel();
            return;
        }
        handles.insert(conn.id(), conn);
    }

    /// Try to adopt `id`. Succeeds for exactly one caller per registry; the
    /// winner's handle is returned and every other candidate is cancelled
    /// before this returns. Ids that are no longer pending never claim.
    pub fn claim(&self, id: CandidateId) -> Option<Box<dyn Connection>> {
        let mut handles = self.handles.lock();
        if !handles.contains_key(&id) {
            return None;
        }
        if self
            .claimed
            .compare_exchange(UNCLAIMED, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let winner = handles.remove(&id);
        for (_, loser) in handles.drain() {
            tracing::debug!("Cancelling losing candidate {} ({})", loser.id(), loser.endpoint());
            loser.cancel();
        }
        winner
    }

    /// Forget a candidate that failed before opening. Returns true if it
    /// was still pending.
    pub fn remove(&self, id: CandidateId) -> bool {
        self.handles.lock().remove(&id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn adopted(&self) -> Option<CandidateId> {
        match self.claimed.load(Ordering::Acquire) {
            UNCLAIMED | CANCELLED => None,
            id => Some(id),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.claimed.load(Ordering::Acquire) == CANCELLED
    }

    /// Call off the race. Pending candidates are cancelled and no later
    /// claim can succeed. Has no effect on an already adopted connection.
    pub fn cancel(&self) {
        let _ = self.claimed.compare_exchange(
            UNCLAIMED,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let drained: Vec<_> = self.handles.lock().drain().collect();
        for (_, conn) in drained {
            conn.cancel();
        }
    }
}

/// What the race reports to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The adopted connection. Reported once.
    Opened(Box<dyn Connection>),
    Message(String),
    Closing { code: u16, reason: String },
    Closed { code: u16, reason: String },
    Failed(String),
    /// Every candidate failed before any opened.
    AllFailed,
}

pub struct TransportRacer {
    registry: Arc<CandidateRegistry>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    finished: bool,
}

impl TransportRacer {
    /// Open every endpoint concurrently, in list order.
    pub fn start(connector: &dyn Connector, endpoints: &[String]) -> Self {
        let registry = Arc::new(CandidateRegistry::new());
        let (tx, events) = mpsc::unbounded_channel();
        for endpoint in endpoints {
            let id = registry.allocate_id();
            tracing::debug!("Racing candidate {} at {}", id, endpoint);
            registry.insert(connector.open(id, endpoint, tx.clone()));
        }
        Self {
            registry,
            events,
            finished: false,
        }
    }

    /// Shared handle used to call the race off from another task.
    pub fn registry(&self) -> Arc<CandidateRegistry> {
        Arc::clone(&self.registry)
    }

    /// Next event of the race. `None` once the race is over: after the
    /// adopted connection closed or failed, after `AllFailed`, or after
    /// the race was cancelled.
    pub async fn next(&mut self) -> Option<ConnectionEvent> {
        loop {
            if self.finished || self.registry.is_cancelled() {
                return None;
            }
            let adopted = self.registry.adopted();
            if adopted.is_none() && self.registry.pending() == 0 {
                self.finished = true;
                return Some(ConnectionEvent::AllFailed);
            }

            let Some(event) = self.events.recv().await else {
                self.finished = true;
                return match adopted {
                    None if !self.registry.is_cancelled() => Some(ConnectionEvent::AllFailed),
                    None => None,
                    Some(_) => Some(ConnectionEvent::Failed("transport event stream ended".into())),
                };
            };

            match adopted {
                None => {
                    if let Some(ev) = self.before_adoption(event) {
                        return Some(ev);
                    }
                }
                Some(winner) => {
                    if event.id() != winner {
                        tracing::debug!("Suppressed event from candidate {}", event.id());
                        continue;
                    }
                    if let Some(ev) = self.after_adoption(event) {
                        return Some(ev);
                    }
                }
            }
        }
    }

    fn before_adoption(&mut self, event: TransportEvent) -> Option<ConnectionEvent> {
        match event {
            TransportEvent::Opened { id } => match self.registry.claim(id) {
                Some(conn) => {
                    tracing::info!("Adopted candidate {} ({})", id, conn.endpoint());
                    Some(ConnectionEvent::Opened(conn))
                }
                None => {
                    tracing::debug!("Candidate {} opened but was not adopted", id);
                    None
                }
            },
            TransportEvent::Failed { id, cause } => {
                if self.registry.remove(id) {
                    tracing::debug!("Candidate {} failed: {}", id, cause);
                }
                None
            }
            TransportEvent::Closed { id, code, .. } => {
                if self.registry.remove(id) {
                    tracing::debug!("Candidate {} closed before opening ({})", id, code);
                }
                None
            }
            TransportEvent::Message { id, .. } | TransportEvent::Closing { id, .. } => {
                tracing::debug!("Ignoring event from unadopted candidate {}", id);
                None
            }
        }
    }

    fn after_adoption(&mut self, event: TransportEvent) -> Option<ConnectionEvent> {
        match event {
            TransportEvent::Opened { .. } => None,
            TransportEvent::Message { text, .. } => Some(ConnectionEvent::Message(text)),
            TransportEvent::Closing { code, reason, .. } => {
                Some(ConnectionEvent::Closing { code, reason })
            }
            TransportEvent::Closed { code, reason, .. } => {
                self.finished = true;
                Some(ConnectionEvent::Closed { code, reason })
            }
            TransportEvent::Failed { cause, .. } => {
                self.finished = true;
                Some(ConnectionEvent::Failed(cause))
            }
        }
    }

    pub fn cancel(&self) {
        self.registry.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, Outbound};

    fn endpoints(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_endpoint_list_all_failed() {
        let (connector, _links) = MockConnector::new();
        let mut race = TransportRacer::start(&connector, &[]);
        assert!(matches!(race.next().await, Some(ConnectionEvent::AllFailed)));
        assert!(race.next().await.is_none());
    }

    #[tokio::test]
    async fn test_first_fails_second_opens() {
        let (connector, mut links) = MockConnector::new();
        let mut race = TransportRacer::start(&connector, &endpoints(&["wss://a", "wss://b"]));
        let a = links.recv().await.unwrap();
        let b = links.recv().await.unwrap();
        assert_eq!(a.endpoint, "wss://a");

        a.fail("refused");
        b.open();

        match race.next().await {
            Some(ConnectionEvent::Opened(conn)) => assert_eq!(conn.endpoint(), "wss://b"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn test_all_fail() {
        let (connector, mut links) = MockConnector::new();
        let mut race = TransportRacer::start(&connector, &endpoints(&["wss://a", "wss://b"]));
        let a = links.recv().await.unwrap();
        let b = links.recv().await.unwrap();
        b.fail("dns");
        a.fail("refused");
        assert!(matches!(race.next().await, Some(ConnectionEvent::AllFailed)));
    }

    #[tokio::test]
    async fn test_loser_cancelled_and_suppressed() {
        let (connector, mut links) = MockConnector::new();
        let mut race = TransportRacer::start(&connector, &endpoints(&["wss://a", "wss://b"]));
        let mut a = links.recv().await.unwrap();
        let b = links.recv().await.unwrap();

        // Both open nearly at once; b's event is queued first.
        b.open();
        a.open();

        let adopted = match race.next().await {
            Some(ConnectionEvent::Opened(conn)) => conn,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(adopted.endpoint(), "wss://b");
        assert!(a.is_cancelled());
        assert_eq!(a.next_outbound().await, Outbound::Cancel);

        a.message("from loser");
        b.message("from winner");
        match race.next().await {
            Some(ConnectionEvent::Message(text)) => assert_eq!(text, "from winner"),
            other => panic!("unexpected: {:?}", other),
        }

        b.closed(1000, "");
        assert!(matches!(
            race.next().await,
            Some(ConnectionEvent::Closed { code: 1000, .. })
        ));
        assert!(race.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_open() {
        let (connector, mut links) = MockConnector::new();
        let mut race = TransportRacer::start(&connector, &endpoints(&["wss://a", "wss://b"]));
        let a = links.recv().await.unwrap();
        let b = links.recv().await.unwrap();

        race.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());

        a.open();
        assert!(race.next().await.is_none());
    }

    #[test]
    fn test_concurrent_claim_single_winner() {
        let (connector, _links) = MockConnector::new();
        let registry = Arc::new(CandidateRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut ids = Vec::new();
        for i in 0..32 {
            let id = registry.allocate_id();
            registry.insert(connector.open(id, &format!("wss://{}", i), tx.clone()));
            ids.push(id);
        }

        let threads: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.claim(id).is_some())
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.pending(), 0);
        assert!(registry.adopted().is_some());
        assert_eq!(connector.cancelled_count(), 31);
    }

    #[test]
    fn test_insert_after_claim_is_cancelled() {
        let (connector, _links) = MockConnector::new();
        let registry = CandidateRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.allocate_id();
        registry.insert(connector.open(first, "wss://a", tx.clone()));
        assert!(registry.claim(first).is_some());

        let late = registry.allocate_id();
        registry.insert(connector.open(late, "wss://b", tx));
        assert_eq!(registry.pending(), 0);
        assert_eq!(connector.cancelled_count(), 1);
    }

    #[test]
    fn test_claim_of_removed_candidate_leaves_race_open() {
        let (connector, _links) = MockConnector::new();
        let registry = CandidateRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let failed = registry.allocate_id();
        registry.insert(connector.open(failed, "wss://a", tx.clone()));
        let other = registry.allocate_id();
        registry.insert(connector.open(other, "wss://b", tx));

        assert!(registry.remove(failed));
        assert!(registry.claim(failed).is_none());
        assert!(registry.claim(12345).is_none());
        assert_eq!(registry.adopted(), None);

        let conn = registry.claim(other).unwrap();
        assert_eq!(conn.endpoint(), "wss://b");
        assert_eq!(registry.adopted(), Some(other));
    }
}
