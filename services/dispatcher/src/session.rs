//! Session manager and the subsystem event bus.
//!
//! Each connection owns exactly one session.  A session knows whether it has
//! registered, carries a small key-value store, and can publish outbound
//! frames onto its outgoing queue channel (where the egress pump picks them
//! up).  The subsystem bus is a side-band broadcast channel used for
//! dispatcher <-> listener control traffic: pings, ping responses, cleanup.

use hub_protocol::outgoing_channel;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::debug;

use crate::queue::{MessageQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
}

// ---------------------------------------------------------------------------
// Subsystem event bus
// ---------------------------------------------------------------------------

/// Control events exchanged between the dispatcher and platform listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SubsystemEvent {
    /// Liveness probe.  `platform` is the sender's platform; `None` when the
    /// dispatcher itself is broadcasting.
    Ping {
        platform: Option<String>,
        timestamp: i64,
        enc_key: String,
    },
    /// A listener answering a probe; `platform` identifies the responder.
    PingResponse { platform: String, timestamp: i64 },
    /// Sessions being torn down; listeners drop any per-session state.
    Cleanup { sids: Vec<u64> },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-connection state handle.
pub struct Session {
    id: u64,
    registered: AtomicBool,
    store: Mutex<HashMap<String, Value>>,
    queue: Arc<dyn MessageQueue>,
    outgoing: String,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Mark the session registered.  Registration is an opaque verb; no
    /// credential checking happens at this layer.
    pub fn register(&self) {
        self.registered.store(true, Ordering::Release);
    }

    /// Publish a frame onto this session's outgoing channel.  The egress
    /// pump delivers it to the client connection.
    pub async fn send<F: Serialize>(&self, frame: &F) -> Result<(), SessionError> {
        let payload = serde_json::to_string(frame)?;
        self.queue.push(&self.outgoing, payload).await?;
        Ok(())
    }

    pub async fn put(&self, key: &str, value: Value) {
        self.store.lock().await.insert(key.to_owned(), value);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.store.lock().await.get(key).cloned()
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// Owns the live sessions and the subsystem bus.
pub struct SessionManager {
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    subsystem: broadcast::Sender<SubsystemEvent>,
    queue: Arc<dyn MessageQueue>,
    sockethub_id: String,
}

impl SessionManager {
    pub fn new(sockethub_id: &str, queue: Arc<dyn MessageQueue>) -> Self {
        let (subsystem, _rx) = broadcast::channel(64);
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            subsystem,
            queue,
            sockethub_id: sockethub_id.to_owned(),
        }
    }

    /// Resolve the session for `id`, creating it on first request.
    pub async fn create(&self, id: u64) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(&id) {
            return session.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id)
            .or_insert_with(|| {
                Arc::new(Session {
                    id,
                    registered: AtomicBool::new(false),
                    store: Mutex::new(HashMap::new()),
                    queue: self.queue.clone(),
                    outgoing: outgoing_channel(&self.sockethub_id, id),
                })
            })
            .clone()
    }

    pub async fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn destroy(&self, id: u64) {
        if self.sessions.write().await.remove(&id).is_some() {
            debug!(session_id = id, "session destroyed");
        }
    }

    /// Broadcast a subsystem event.  Zero subscribers is not an error.
    pub fn subsystem_send(&self, event: SubsystemEvent) {
        let _ = self.subsystem.send(event);
    }

    pub fn subsystem_subscribe(&self) -> broadcast::Receiver<SubsystemEvent> {
        self.subsystem.subscribe()
    }

    /// Drop all sessions.  Subsystem receivers observe the bus closing when
    /// the manager itself is dropped.
    pub async fn shutdown(&self) {
        self.sessions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use serde_json::json;

    fn manager() -> SessionManager {
        SessionManager::new("hub-test", Arc::new(MemoryQueue::new()))
    }

    #[tokio::test]
    async fn create_is_idempotent_per_id() {
        let manager = manager();
        let first = manager.create(7).await;
        let second = manager.create(7).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.id(), 7);
    }

    #[tokio::test]
    async fn registration_flag_starts_false_and_sticks() {
        let manager = manager();
        let session = manager.create(1).await;
        assert!(!session.is_registered());
        session.register();
        assert!(session.is_registered());
    }

    #[tokio::test]
    async fn destroy_removes_the_session() {
        let manager = manager();
        manager.create(3).await;
        manager.destroy(3).await;
        assert!(manager.get(3).await.is_none());
    }

    #[tokio::test]
    async fn send_lands_on_the_outgoing_channel() {
        let queue = Arc::new(MemoryQueue::new());
        let manager = SessionManager::new("hub-test", queue.clone());
        let session = manager.create(9).await;

        session.send(&json!({"verb": "confirm"})).await.unwrap();

        let payload = queue
            .pop("sockethub:hub-test:dispatcher:outgoing:9")
            .await
            .unwrap();
        assert_eq!(payload, r#"{"verb":"confirm"}"#);
    }

    #[tokio::test]
    async fn key_value_store_round_trips() {
        let manager = manager();
        let session = manager.create(2).await;
        session.put("credentials", json!({"user": "alice"})).await;
        assert_eq!(
            session.get("credentials").await,
            Some(json!({"user": "alice"}))
        );
        assert_eq!(session.get("missing").await, None);
    }

    #[tokio::test]
    async fn subsystem_bus_delivers_to_subscribers() {
        let manager = manager();
        let mut rx = manager.subsystem_subscribe();
        manager.subsystem_send(SubsystemEvent::Cleanup { sids: vec![4] });
        assert_eq!(
            rx.recv().await.unwrap(),
            SubsystemEvent::Cleanup { sids: vec![4] }
        );
    }
}
