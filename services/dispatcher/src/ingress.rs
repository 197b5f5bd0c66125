//! Per-connection ingress pipeline.
//!
//! Each connection moves through an explicit phase machine:
//!
//! 1. `Buffering` — from admission until the session handle resolves, every
//!    inbound frame is appended to a pending buffer.  No validation, no
//!    response.
//! 2. `Active` — the buffer is drained in arrival order, then every frame
//!    runs parse → shape checks → schema validation → confirm → dispatch.
//! 3. `Closing` — teardown has started; late frames are dropped.
//!
//! The pipeline talks to the client through an unbounded sender of
//! [`ClientFrame`]s, so the transport (and the tests) stay decoupled from
//! the core.

use hub_protocol::{
    ConfirmFrame, DISPATCHER_PLATFORM, ErrorFrame, MessageFrame, REGISTER_VERB, SESSION_ID_KEY,
    into_batch, listener_channel, normalize_request, parse_error_frame, rid_of,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::dispatcher::Dispatcher;
use crate::registry::Dispatch;
use crate::session::Session;

/// A frame crossing the client connection, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Writer half of a client connection.
pub type ClientSink = mpsc::UnboundedSender<ClientFrame>;

/// Serialize a frame and hand it to the connection writer.  A closed sink
/// means the client is gone; nothing to do but drop the frame.
pub(crate) fn send_frame<F: Serialize>(sink: &ClientSink, frame: &F) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = sink.send(ClientFrame::Text(text));
        }
        Err(e) => error!(error = %e, "outbound frame failed to serialize"),
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// One-shot reply channel handed to local verb handlers.
///
/// Carries the request's identity so the response echoes `rid`, `platform`,
/// `verb`, and the normalized `target`.
pub struct Responder {
    rid: Value,
    platform: String,
    verb: String,
    target: Value,
    sink: ClientSink,
}

impl Responder {
    /// Emit a message frame with `object = data`.
    pub fn ok(self, data: Value) {
        let frame = MessageFrame::new(self.rid, &self.verb, &self.platform, data, self.target);
        send_frame(&self.sink, &frame);
    }

    /// Emit an error frame echoing the request identity.
    pub fn err(self, message: &str) {
        let frame =
            ErrorFrame::for_request(self.rid, &self.platform, &self.verb, message, self.target);
        send_frame(&self.sink, &frame);
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

enum Phase {
    Buffering { pending: Vec<ClientFrame> },
    Active { session: Arc<Session> },
    Closing,
}

/// Ingress state for one client connection.
///
/// All methods run on the connection's own task; the inbound event stream is
/// serialized by construction.
pub struct Connection {
    dispatcher: Arc<Dispatcher>,
    session_id: u64,
    phase: Phase,
    sink: ClientSink,
}

/// Identity fields extracted by the validation chain, echoed in every
/// subsequent frame for the request.
struct RequestIdentity {
    rid: Value,
    platform: String,
    verb: String,
}

impl Connection {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, session_id: u64, sink: ClientSink) -> Self {
        Connection {
            dispatcher,
            session_id,
            phase: Phase::Buffering {
                pending: Vec::new(),
            },
            sink,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Resolve this connection's session and drain the pending buffer in
    /// arrival order.  No-op once the connection has left the buffering
    /// phase.
    pub async fn resolve_session(&mut self) {
        if !matches!(self.phase, Phase::Buffering { .. }) {
            return;
        }
        let session = self.dispatcher.sessions.create(self.session_id).await;
        let previous = std::mem::replace(
            &mut self.phase,
            Phase::Active {
                session: session.clone(),
            },
        );
        if let Phase::Buffering { pending } = previous {
            if !pending.is_empty() {
                debug!(
                    session_id = self.session_id,
                    buffered = pending.len(),
                    "draining frames received before session resolution"
                );
            }
            for frame in pending {
                self.process_frame(&session, frame).await;
            }
        }
    }

    /// Handle one inbound frame according to the current phase.
    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        let session = match &mut self.phase {
            Phase::Buffering { pending } => {
                pending.push(frame);
                return;
            }
            Phase::Closing => {
                debug!(session_id = self.session_id, "frame after close dropped");
                return;
            }
            Phase::Active { session } => session.clone(),
        };
        self.process_frame(&session, frame).await;
    }

    /// Enter teardown: broadcast cleanup, stop the egress pump, schedule the
    /// delayed session destroy.  Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.phase, Phase::Closing) {
            return;
        }
        self.phase = Phase::Closing;
        self.dispatcher.disconnect(self.session_id).await;
    }

    async fn process_frame(&self, session: &Arc<Session>, frame: ClientFrame) {
        if self.dispatcher.is_shutting_down() {
            warn!(
                session_id = self.session_id,
                "dispatcher in shutdown, inbound frame dropped"
            );
            return;
        }
        match frame {
            // Placeholder contract: binary payloads are echoed unchanged.
            ClientFrame::Binary(bytes) => {
                let _ = self.sink.send(ClientFrame::Binary(bytes));
            }
            ClientFrame::Text(text) => {
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(session_id = self.session_id, error = %e, "invalid JSON received");
                        send_frame(&self.sink, &parse_error_frame());
                        return;
                    }
                };
                for request in into_batch(parsed) {
                    self.process_request(session, request).await;
                }
            }
        }
    }

    async fn process_request(&self, session: &Arc<Session>, mut request: Value) {
        let identity = match self.check_request(session, &request) {
            Ok(identity) => identity,
            Err(frame) => {
                send_frame(&self.sink, &frame);
                return;
            }
        };

        // The chain only passes JSON objects through.
        let Some(map) = request.as_object_mut() else {
            return;
        };
        normalize_request(map);
        let target = map
            .get("target")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));

        let registry = self.dispatcher.registry.clone();
        let Some(verb_def) = registry
            .platform(&identity.platform)
            .and_then(|record| record.verb(&identity.verb))
        else {
            return;
        };

        if let Err(message) = verb_def.validate(&request) {
            let frame = ErrorFrame::for_request(
                identity.rid,
                &identity.platform,
                &identity.verb,
                &format!("unable to validate json against schema: {message}"),
                target,
            );
            send_frame(&self.sink, &frame);
            return;
        }

        // Reserved-property check above guarantees the client did not supply
        // a sessionId of its own.
        if let Some(map) = request.as_object_mut() {
            map.insert(
                SESSION_ID_KEY.to_owned(),
                Value::String(self.session_id.to_string()),
            );
        }

        send_frame(&self.sink, &ConfirmFrame::new(identity.rid.clone()));

        match &verb_def.dispatch {
            Dispatch::Local(handler) => {
                let responder = Responder {
                    rid: identity.rid,
                    platform: identity.platform,
                    verb: identity.verb,
                    target,
                    sink: self.sink.clone(),
                };
                handler(request, session.clone(), responder);
            }
            Dispatch::QueueForward => {
                let channel =
                    listener_channel(&self.dispatcher.sockethub_id, &identity.platform);
                match serde_json::to_string(&request) {
                    Ok(payload) => {
                        // The client already holds its confirm; a failed push
                        // is logged and the request is considered dropped.
                        if let Err(e) = self.dispatcher.queue.push(&channel, payload).await {
                            error!(channel = %channel, error = %e, "listener push failed");
                        }
                    }
                    Err(e) => error!(error = %e, "request failed to serialize for listener"),
                }
            }
        }
    }

    /// The ordered validation chain.  The first failing check produces the
    /// error frame for this request and short-circuits the rest.
    fn check_request(
        &self,
        session: &Session,
        request: &Value,
    ) -> Result<RequestIdentity, ErrorFrame> {
        let Some(rid) = rid_of(request) else {
            return Err(ErrorFrame::pre_dispatch(
                Value::Null,
                None,
                "no rid (request ID) specified",
            ));
        };

        let Some(platform) = request.get("platform").and_then(Value::as_str) else {
            return Err(ErrorFrame::pre_dispatch(rid, None, "no platform specified"));
        };

        let Some(verb) = request.get("verb").and_then(Value::as_str) else {
            return Err(ErrorFrame::pre_dispatch(
                rid,
                Some(platform),
                "no verb (action) specified",
            ));
        };

        // A remote platform that has never answered a ping is treated the
        // same as a platform that does not exist.
        let unknown = |rid: Value| {
            ErrorFrame::pre_dispatch(
                rid,
                Some(platform),
                &format!("unknown platform received: {platform}"),
            )
        };
        let Some(record) = self.dispatcher.registry.platform(platform) else {
            return Err(unknown(rid));
        };
        if record.ping().is_some_and(|ping| !ping.has_responded()) {
            return Err(unknown(rid));
        }

        if platform != DISPATCHER_PLATFORM
            && !self
                .dispatcher
                .loaded_platforms
                .iter()
                .any(|loaded| loaded == platform)
        {
            return Err(ErrorFrame::pre_dispatch(
                rid,
                Some(platform),
                &format!("platform '{platform}' not loaded"),
            ));
        }

        if record.verb(verb).is_none() {
            return Err(ErrorFrame::pre_dispatch(
                rid,
                Some(platform),
                &format!("unknown verb received: {verb}"),
            ));
        }

        if request.get(SESSION_ID_KEY).is_some() {
            return Err(ErrorFrame::pre_dispatch(
                rid,
                Some(platform),
                "cannot use name sessionId, reserved property",
            ));
        }

        if !session.is_registered() && verb != REGISTER_VERB {
            return Err(ErrorFrame::pre_dispatch(
                rid,
                Some(platform),
                "session not registered, cannot process verb",
            ));
        }

        Ok(RequestIdentity {
            rid,
            platform: platform.to_owned(),
            verb: verb.to_owned(),
        })
    }
}
