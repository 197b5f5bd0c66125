//! Dispatcher core: admission, teardown, readiness, shutdown.
//!
//! One `Dispatcher` per process.  Each admitted connection gets a fresh
//! session id, its own egress pump, and an ingress [`Connection`] starting
//! in the buffering phase.

use chrono::Utc;
use hub_protocol::{DISCONNECT_SENTINEL, outgoing_channel};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::DispatcherConfig;
use crate::egress::run_pump;
use crate::ingress::{ClientSink, Connection};
use crate::liveness::{self, LivenessError};
use crate::queue::MessageQueue;
use crate::registry::ProtocolRegistry;
use crate::session::{SessionManager, SubsystemEvent};

/// How long a closed connection's session lingers so in-flight responses
/// can drain.
pub(crate) const SESSION_DESTROY_GRACE: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    pub(crate) registry: Arc<ProtocolRegistry>,
    pub(crate) queue: Arc<dyn MessageQueue>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) sockethub_id: String,
    /// Allow-list of loaded platforms; `dispatcher` is implicitly allowed.
    pub(crate) loaded_platforms: Vec<String>,
    listener_interval: Duration,
    listener_scans: u32,
    enc_key: String,
    in_shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    counter: AtomicU64,
}

impl Dispatcher {
    /// Build the dispatcher and start its subsystem ping correlator.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &DispatcherConfig,
        registry: Arc<ProtocolRegistry>,
        queue: Arc<dyn MessageQueue>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionManager::new(&config.sockethub_id, queue.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        liveness::spawn_ping_listener(registry.clone(), sessions.subsystem_subscribe(), shutdown_rx);

        Arc::new(Dispatcher {
            registry,
            queue,
            sessions,
            sockethub_id: config.sockethub_id.clone(),
            loaded_platforms: config.platforms.clone(),
            listener_interval: Duration::from_millis(config.listener_interval_ms),
            listener_scans: config.listener_interval_count,
            enc_key: liveness::generate_enc_key(),
            in_shutdown: AtomicBool::new(false),
            shutdown_tx,
            counter: AtomicU64::new(0),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Ping every owned remote platform and wait for all of them to answer
    /// within the retry budget.  An `Err` is advisory: the dispatcher keeps
    /// running, and requests for silent platforms are rejected at ingress.
    pub async fn init(&self) -> Result<(), LivenessError> {
        liveness::wait_for_listeners(
            &self.registry,
            &self.sessions,
            &self.loaded_platforms,
            &self.enc_key,
            self.listener_interval,
            self.listener_scans,
            self.shutdown_tx.subscribe(),
        )
        .await
    }

    /// Admit a new client connection: allocate its session id, start its
    /// egress pump, and return the ingress handle (in the buffering phase —
    /// the caller resolves the session asynchronously).
    pub fn connect(self: &Arc<Self>, sink: ClientSink) -> Connection {
        let session_id = self.next_session_id();
        let channel = outgoing_channel(&self.sockethub_id, session_id);
        tokio::spawn(run_pump(self.queue.clone(), channel, sink.clone()));
        info!(session_id, "connection admitted");
        Connection::new(self.clone(), session_id, sink)
    }

    /// Tear down a closed connection: broadcast cleanup, unblock the egress
    /// pump with the disconnect sentinel, schedule the delayed destroy.
    pub(crate) async fn disconnect(&self, session_id: u64) {
        info!(session_id, "connection closed");
        self.sessions.subsystem_send(SubsystemEvent::Cleanup {
            sids: vec![session_id],
        });

        let channel = outgoing_channel(&self.sockethub_id, session_id);
        if let Err(e) = self
            .queue
            .push(&channel, DISCONNECT_SENTINEL.to_owned())
            .await
        {
            warn!(session_id, error = %e, "failed to push disconnect sentinel");
        }

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SESSION_DESTROY_GRACE).await;
            sessions.destroy(session_id).await;
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::Relaxed)
    }

    /// Flip the process-wide shutdown flag, abort outstanding liveness
    /// retries, and drop subsystem state.  Open connections are not
    /// force-closed; their next inbound frames are dropped by ingress.
    pub async fn shutdown(&self) {
        if self.in_shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("dispatcher shutting down");
        let _ = self.shutdown_tx.send(true);
        self.sessions.shutdown().await;
    }

    /// Millisecond wall clock in the high bits, rolling counter in the low
    /// 20, so connections admitted in the same millisecond stay distinct.
    fn next_session_id(&self) -> u64 {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let count = self.counter.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
        (millis << 20) | count
    }
}
