//! Protocol registry: platforms, verbs, schemas, dispatch table.
//!
//! Built once at startup (the catalog loader feeds it), then shared behind
//! an `Arc` and never mutated again — except for the per-platform ping
//! timestamps, which the liveness subsystem writes while ingress reads.
//! Those are atomics; the comparison is advisory, so no further locking.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::ingress::Responder;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),
    #[error("invalid schema for {platform}/{verb}: {message}")]
    InvalidSchema {
        platform: String,
        verb: String,
        message: String,
    },
}

/// An in-process verb handler: `(request, session, responder)`.
///
/// Handlers run on the connection's task; anything slow should spawn.  The
/// responder may be used exactly once, immediately or later.
pub type LocalHandler = Arc<dyn Fn(Value, Arc<Session>, Responder) + Send + Sync>;

/// Where a validated request goes.
#[derive(Clone)]
pub enum Dispatch {
    /// Run the handler in-process.
    Local(LocalHandler),
    /// Serialize the request and push it to the platform's listener channel.
    QueueForward,
}

pub struct VerbDef {
    schema: jsonschema::Validator,
    pub dispatch: Dispatch,
}

impl std::fmt::Debug for VerbDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbDef").finish_non_exhaustive()
    }
}

impl VerbDef {
    /// Validate the full normalized request against this verb's schema.
    /// Returns the validator's message on failure.
    pub fn validate(&self, request: &Value) -> Result<(), String> {
        self.schema.validate(request).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Ping state
// ---------------------------------------------------------------------------

/// Liveness timestamps for one remote platform, in wall-clock milliseconds.
///
/// A platform is responsive iff `last_received >= last_sent` for the most
/// recent ping round; `last_received == 0` means it has never answered.
#[derive(Debug)]
pub struct PingState {
    last_sent: AtomicI64,
    last_received: AtomicI64,
}

impl PingState {
    fn new() -> Self {
        PingState {
            last_sent: AtomicI64::new(0),
            last_received: AtomicI64::new(0),
        }
    }

    pub fn mark_sent(&self, now: i64) {
        self.last_sent.store(now, Ordering::Relaxed);
    }

    pub fn mark_received(&self, now: i64) {
        self.last_received.store(now, Ordering::Relaxed);
    }

    pub fn has_responded(&self) -> bool {
        self.last_received.load(Ordering::Relaxed) > 0
    }

    pub fn is_pending(&self) -> bool {
        self.last_received.load(Ordering::Relaxed) < self.last_sent.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Platform record
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PlatformRecord {
    local: bool,
    verbs: HashMap<String, VerbDef>,
    /// Present for remote platforms only; local platforms are never pinged.
    ping: Option<PingState>,
}

impl PlatformRecord {
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn verb(&self, name: &str) -> Option<&VerbDef> {
        self.verbs.get(name)
    }

    pub fn ping(&self) -> Option<&PingState> {
        self.ping.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default, Debug)]
pub struct ProtocolRegistry {
    platforms: HashMap<String, PlatformRecord>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        ProtocolRegistry::default()
    }

    /// Add a platform whose verbs execute in-process.
    pub fn add_local_platform(&mut self, name: &str) {
        self.platforms.insert(
            name.to_owned(),
            PlatformRecord {
                local: true,
                verbs: HashMap::new(),
                ping: None,
            },
        );
    }

    /// Add a platform served by an out-of-process listener.
    pub fn add_remote_platform(&mut self, name: &str) {
        self.platforms.insert(
            name.to_owned(),
            PlatformRecord {
                local: false,
                verbs: HashMap::new(),
                ping: Some(PingState::new()),
            },
        );
    }

    /// Define a queue-forwarded verb under an existing platform.
    pub fn add_verb(&mut self, platform: &str, verb: &str, schema: &Value) -> Result<(), RegistryError> {
        self.insert_verb(platform, verb, schema, Dispatch::QueueForward)
    }

    /// Define a verb with an in-process handler.
    pub fn add_local_verb(
        &mut self,
        platform: &str,
        verb: &str,
        schema: &Value,
        handler: LocalHandler,
    ) -> Result<(), RegistryError> {
        self.insert_verb(platform, verb, schema, Dispatch::Local(handler))
    }

    fn insert_verb(
        &mut self,
        platform: &str,
        verb: &str,
        schema: &Value,
        dispatch: Dispatch,
    ) -> Result<(), RegistryError> {
        let compiled = jsonschema::validator_for(schema).map_err(|e| RegistryError::InvalidSchema {
            platform: platform.to_owned(),
            verb: verb.to_owned(),
            message: e.to_string(),
        })?;
        let record = self
            .platforms
            .get_mut(platform)
            .ok_or_else(|| RegistryError::UnknownPlatform(platform.to_owned()))?;
        record.verbs.insert(
            verb.to_owned(),
            VerbDef {
                schema: compiled,
                dispatch,
            },
        );
        Ok(())
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformRecord> {
        self.platforms.get(name)
    }

    /// Names of the remote platforms among `names` (unknown names skipped).
    pub fn remote_platforms<'a>(&'a self, names: &'a [String]) -> impl Iterator<Item = &'a str> {
        names.iter().map(String::as_str).filter(|name| {
            self.platforms
                .get(*name)
                .is_some_and(|record| !record.local)
        })
    }
}
