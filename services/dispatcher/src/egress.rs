//! Per-session egress pump.
//!
//! One pump task per session.  It blocking-pops the session's outgoing
//! channel and forwards every payload verbatim to the client connection.
//! The disconnect sentinel is consumed silently and stops the pump without
//! reissuing the pop; a queue error terminates the pump (the connection is
//! considered lost) and it is not restarted.

use hub_protocol::DISCONNECT_SENTINEL;
use std::sync::Arc;
use tracing::{debug, error};

use crate::ingress::{ClientFrame, ClientSink};
use crate::queue::MessageQueue;

pub async fn run_pump(queue: Arc<dyn MessageQueue>, channel: String, sink: ClientSink) {
    loop {
        match queue.pop(&channel).await {
            Ok(payload) => {
                if payload == DISCONNECT_SENTINEL {
                    debug!(channel = %channel, "disconnect sentinel, egress pump stopping");
                    return;
                }
                if sink.send(ClientFrame::Text(payload)).is_err() {
                    debug!(channel = %channel, "client gone, egress pump stopping");
                    return;
                }
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "egress pop failed, pump terminating");
                return;
            }
        }
    }
}
