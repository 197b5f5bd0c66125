//! Platform liveness: pings, ping correlation, readiness.
//!
//! At init the dispatcher stamps `last_sent` for every remote platform it
//! owns and broadcasts a ping on the subsystem bus.  Listeners answer with
//! `ping` or `ping-response` events; both re-stamp `last_received` for the
//! responder's platform.  The readiness loop re-scans at a fixed interval
//! until every owned remote platform has answered, or the scan budget runs
//! out.  Readiness is advisory: a failed init leaves the dispatcher running,
//! and requests for a silent platform are rejected at ingress instead.

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{PingState, PlatformRecord, ProtocolRegistry};
use crate::session::{SessionManager, SubsystemEvent};

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("platform listeners unresponsive: {}", .0.join(", "))]
    Unresponsive(Vec<String>),
    #[error("shut down while waiting for platform listeners")]
    Shutdown,
}

/// Ephemeral correlation token carried in ping broadcasts.  Opaque and
/// non-secret; derived from the clock plus process-local randomness.
pub fn generate_enc_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("{:x}{suffix}", Utc::now().timestamp_millis())
}

/// Long-lived subsystem listener: correlates `ping` / `ping-response`
/// events back to registry ping state.  Runs until shutdown or bus close.
pub(crate) fn spawn_ping_listener(
    registry: Arc<ProtocolRegistry>,
    mut events: broadcast::Receiver<SubsystemEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(SubsystemEvent::Ping { platform: Some(platform), .. })
                    | Ok(SubsystemEvent::PingResponse { platform, .. }) => {
                        mark_received(&registry, &platform);
                    }
                    // Our own ping broadcasts (platform: None) and cleanup
                    // events are not liveness signals.
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subsystem bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

fn mark_received(registry: &ProtocolRegistry, platform: &str) {
    match registry.platform(platform).and_then(PlatformRecord::ping) {
        Some(ping) => ping.mark_received(Utc::now().timestamp_millis()),
        // Platforms hosted by other dispatcher instances also answer pings.
        None => debug!(platform = %platform, "ping from platform we do not own, ignored"),
    }
}

/// One liveness round: stamp + ping every owned remote platform, then scan
/// up to `max_scans` times at `interval` until none are pending.
pub(crate) async fn wait_for_listeners(
    registry: &ProtocolRegistry,
    sessions: &SessionManager,
    my_platforms: &[String],
    enc_key: &str,
    interval: Duration,
    max_scans: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), LivenessError> {
    let owned: Vec<&str> = registry.remote_platforms(my_platforms).collect();
    if owned.is_empty() {
        info!("no remote platforms to wait for");
        return Ok(());
    }

    stamp_and_ping(registry, sessions, &owned, enc_key);

    for scan in 1..=max_scans {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Err(LivenessError::Shutdown);
                }
            }
        }

        let pending = pending_platforms(registry, &owned);
        if pending.is_empty() {
            info!(scans = scan, "all platform listeners responded");
            return Ok(());
        }
        debug!(scan, pending = ?pending, "platform listeners still pending");

        if scan < max_scans {
            // Re-stamp only the pending platforms, so a platform that has
            // already answered cannot regress to pending mid-round.
            stamp_and_ping(registry, sessions, &pending, enc_key);
        }
    }

    let unresponsive: Vec<String> = pending_platforms(registry, &owned)
        .into_iter()
        .map(ToOwned::to_owned)
        .collect();
    warn!(
        platforms = ?unresponsive,
        "listeners unresponsive after retry budget; dispatcher may not function correctly"
    );
    Err(LivenessError::Unresponsive(unresponsive))
}

fn stamp_and_ping(
    registry: &ProtocolRegistry,
    sessions: &SessionManager,
    platforms: &[&str],
    enc_key: &str,
) {
    let now = Utc::now().timestamp_millis();
    for name in platforms {
        if let Some(ping) = registry.platform(name).and_then(PlatformRecord::ping) {
            ping.mark_sent(now);
        }
    }
    sessions.subsystem_send(SubsystemEvent::Ping {
        platform: None,
        timestamp: now,
        enc_key: enc_key.to_owned(),
    });
}

fn pending_platforms<'a>(registry: &ProtocolRegistry, owned: &[&'a str]) -> Vec<&'a str> {
    owned
        .iter()
        .copied()
        .filter(|name| {
            registry
                .platform(name)
                .and_then(PlatformRecord::ping)
                .is_some_and(PingState::is_pending)
        })
        .collect()
}
