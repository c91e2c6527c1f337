//! HMR Coordinator (C10): owns the subscriber registry and the pending
//! update queue. Transport-agnostic — the dev dispatcher adapts
//! [`Subscriber`] sinks onto axum SSE responses.

use crate::data::{PendingModule, PendingUpdate, UpdateReason};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event broadcast to every subscriber. Carries no module payloads, only
/// enough to let the client decide whether to fetch `apply`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HmrEvent {
    Ready,
    Update { id: String, modules: Vec<ModuleSummary> },
    Error { id: Option<String>, message: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct ModuleSummary {
    pub url: String,
    pub reason: UpdateReason,
}

/// A write-only sink for one subscriber's event channel. Bounded so a
/// stalled client cannot cause unbounded buffering; per `spec.md` §9, a full
/// sink is dropped rather than blocking the broadcaster.
pub type Subscriber = mpsc::Sender<HmrEvent>;

pub struct HmrCoordinator {
    subscribers: DashMap<u64, Subscriber>,
    pending: DashMap<String, PendingUpdate>,
    next_subscriber_id: AtomicU64,
    next_update_id: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl HmrCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            pending: DashMap::new(),
            next_subscriber_id: AtomicU64::new(0),
            next_update_id: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Register a new sink, sending the initial `ready` event.
    pub fn subscribe(&self, buffer: usize) -> (u64, mpsc::Receiver<HmrEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let _ = tx.try_send(HmrEvent::Ready);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Queue a new update and broadcast its summary to every subscriber. A
    /// full or closed sink is dropped instead of blocking other subscribers.
    #[tracing::instrument(level = "debug", skip(self, modules))]
    pub fn queue_update(&self, modules: Vec<PendingModule>, created_at_ms: u64) -> String {
        let id = self.next_update_id.fetch_add(1, Ordering::Relaxed).to_string();

        let summary = HmrEvent::Update {
            id: id.clone(),
            modules: modules
                .iter()
                .map(|m| ModuleSummary {
                    url: m.url.clone(),
                    reason: m.reason,
                })
                .collect(),
        };

        self.pending.insert(
            id.clone(),
            PendingUpdate {
                id: id.clone(),
                modules,
                created_at_ms,
            },
        );

        self.broadcast(summary);
        id
    }

    pub fn broadcast_error(&self, id: Option<String>, message: String) {
        self.broadcast(HmrEvent::Error { id, message });
    }

    fn broadcast(&self, event: HmrEvent) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().try_send(event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }

    /// Exactly-once removal of a pending update.
    pub fn consume(&self, id: &str) -> Option<PendingUpdate> {
        self.pending.remove(id).map(|(_, v)| v)
    }

    /// End all sinks and clear pending updates; further operations are
    /// no-ops rather than errors, matching the coordinator's "fail fast"
    /// contract by simply having nothing left to do.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
        self.pending.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(url: &str, reason: UpdateReason) -> PendingModule {
        PendingModule {
            abs_path: url.into(),
            url: url.to_string(),
            content_hash: None,
            reason,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_ready_then_updates_in_order() {
        let coord = HmrCoordinator::new();
        let (_id, mut rx) = coord.subscribe(16);
        assert!(matches!(rx.recv().await.unwrap(), HmrEvent::Ready));

        coord.queue_update(vec![module("/a.ts", UpdateReason::Changed)], 1);
        coord.queue_update(vec![module("/b.ts", UpdateReason::Dependent)], 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (HmrEvent::Update { id: id1, .. }, HmrEvent::Update { id: id2, .. }) => {
                assert_eq!(id1, "0");
                assert_eq!(id2, "1");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn consume_is_exactly_once() {
        let coord = HmrCoordinator::new();
        let id = coord.queue_update(vec![module("/a.ts", UpdateReason::Changed)], 1);
        assert!(coord.consume(&id).is_some());
        assert!(coord.consume(&id).is_none());
    }

    #[test]
    fn unknown_update_id_returns_none() {
        let coord = HmrCoordinator::new();
        assert!(coord.consume("nonexistent").is_none());
    }

    #[test]
    fn deleted_module_carries_no_payload_marker() {
        let m = module("/gone.ts", UpdateReason::Deleted);
        assert_eq!(m.reason, UpdateReason::Deleted);
    }

    #[test]
    fn close_clears_subscribers_and_pending() {
        let coord = HmrCoordinator::new();
        let (_id, _rx) = coord.subscribe(4);
        coord.queue_update(vec![module("/a.ts", UpdateReason::Changed)], 1);
        coord.close();
        assert!(coord.is_closed());
        assert!(coord.consume("0").is_none());
    }
}
