//! Shared queue interface.
//!
//! The dispatcher talks to the queue through [`MessageQueue`]: non-blocking
//! pushes onto listener channels, and one blocking pop per session on its
//! outgoing channel.  A pooled Redis-backed client is an external
//! collaborator behind the same trait; [`MemoryQueue`] is the in-process
//! implementation used by the standalone binary and the test suites.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend: {0}")]
    Backend(String),
}

/// Channel-keyed message queue.
///
/// `pop` suspends until a payload is available on the channel.  Payloads are
/// opaque strings; the queue never inspects them.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn push(&self, channel: &str, payload: String) -> Result<(), QueueError>;
    async fn pop(&self, channel: &str) -> Result<String, QueueError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct ChannelState {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

/// Per-channel FIFO queues held in process memory.
#[derive(Default)]
pub struct MemoryQueue {
    channels: Mutex<HashMap<String, Arc<ChannelState>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue::default()
    }

    async fn channel(&self, name: &str) -> Arc<ChannelState> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(ChannelState {
                    items: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn push(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        let state = self.channel(channel).await;
        state.items.lock().await.push_back(payload);
        state.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, channel: &str) -> Result<String, QueueError> {
        let state = self.channel(channel).await;
        loop {
            let notified = state.notify.notified();
            if let Some(item) = state.items.lock().await.pop_front() {
                return Ok(item);
            }
            notified.await;
        }
    }
}
