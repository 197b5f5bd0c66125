// hub-protocol: dispatcher wire frames, request normalization, queue keys.
//
// Client requests are schema-driven dynamic JSON, so the inbound side works
// on `serde_json::Value` rather than fixed structs.  Outbound frames have
// fixed shapes and serialize through the structs below.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Well-known names
// ---------------------------------------------------------------------------

/// The built-in local platform owning dispatcher-level verbs.
pub const DISPATCHER_PLATFORM: &str = "dispatcher";

/// Verb used for session registration; the only verb an unregistered
/// session may submit.
pub const REGISTER_VERB: &str = "register";

/// Verb carried by confirm frames and by pre-dispatch error frames.
pub const CONFIRM_VERB: &str = "confirm";

/// Reserved request property; injected by the dispatcher, never accepted
/// from the client.
pub const SESSION_ID_KEY: &str = "sessionId";

/// Exact payload that terminates an egress pump.  Compared byte-for-byte
/// before any JSON parsing.
pub const DISCONNECT_SENTINEL: &str =
    r#"{"platform":"dispatcher","verb":"disconnect","status":true}"#;

// ---------------------------------------------------------------------------
// Queue channel keys
// ---------------------------------------------------------------------------

/// Per-session outgoing channel, consumed by the session's egress pump.
pub fn outgoing_channel(sockethub_id: &str, session_id: u64) -> String {
    format!("sockethub:{sockethub_id}:dispatcher:outgoing:{session_id}")
}

/// Per-platform incoming channel, consumed by that platform's listener.
pub fn listener_channel(sockethub_id: &str, platform: &str) -> String {
    format!("sockethub:{sockethub_id}:listener:{platform}:incoming")
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

/// Acknowledges a request that passed validation, before any downstream
/// response for the same `rid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmFrame {
    /// Echoed verbatim from the request.
    pub rid: Value,
    pub verb: String,
    pub status: bool,
}

impl ConfirmFrame {
    pub fn new(rid: Value) -> Self {
        ConfirmFrame {
            rid,
            verb: CONFIRM_VERB.to_owned(),
            status: true,
        }
    }
}

/// A successful response from a local verb handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub rid: Value,
    pub verb: String,
    pub platform: String,
    pub status: bool,
    pub object: Value,
    /// The request's normalized target sequence (possibly empty).
    pub target: Value,
}

impl MessageFrame {
    pub fn new(rid: Value, verb: &str, platform: &str, object: Value, target: Value) -> Self {
        MessageFrame {
            rid,
            verb: verb.to_owned(),
            platform: platform.to_owned(),
            status: true,
            object,
            target,
        }
    }
}

/// A validation, parse, schema, or handler error reported to the client.
///
/// Identity fields are preserved as far as they were determined before the
/// failure; undetermined `rid`/`platform` serialize as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub rid: Value,
    pub platform: Option<String>,
    pub verb: String,
    pub status: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

impl ErrorFrame {
    /// An error frame for a request that failed one of the pre-dispatch
    /// checks.  These carry verb `confirm` (a failed confirm).
    pub fn pre_dispatch(rid: Value, platform: Option<&str>, message: &str) -> Self {
        ErrorFrame {
            rid,
            platform: platform.map(ToOwned::to_owned),
            verb: CONFIRM_VERB.to_owned(),
            status: false,
            message: message.to_owned(),
            object: None,
            target: None,
        }
    }

    /// An error frame for a fully-identified request (schema violation or a
    /// failed local handler), echoing the request's own verb and target.
    pub fn for_request(
        rid: Value,
        platform: &str,
        verb: &str,
        message: &str,
        target: Value,
    ) -> Self {
        ErrorFrame {
            rid,
            platform: Some(platform.to_owned()),
            verb: verb.to_owned(),
            status: false,
            message: message.to_owned(),
            object: None,
            target: Some(target),
        }
    }
}

/// The single error frame emitted when inbound text is not valid JSON.
/// All identity fields are undetermined.
pub fn parse_error_frame() -> ErrorFrame {
    ErrorFrame {
        rid: Value::Null,
        platform: None,
        verb: CONFIRM_VERB.to_owned(),
        status: false,
        message: "invalid JSON received".to_owned(),
        object: None,
        target: None,
    }
}

// ---------------------------------------------------------------------------
// Request normalization
// ---------------------------------------------------------------------------

/// Split a parsed inbound value into a batch of requests.
///
/// A top-level array whose first element is an object is treated as the
/// batch itself; anything else (including an empty array) is a singleton.
pub fn into_batch(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) if items.first().is_some_and(Value::is_object) => items,
        other => vec![other],
    }
}

/// The request's `rid`, when it is a string or number.  Anything else
/// (missing, bool, object, ...) is not a usable correlation token.
pub fn rid_of(request: &Value) -> Option<Value> {
    match request.get("rid") {
        Some(v @ (Value::String(_) | Value::Number(_))) => Some(v.clone()),
        _ => None,
    }
}

/// Normalize `target` to an ordered sequence and `object` to an empty map.
///
/// `target`: absent → `[]`, single object → `[object]`, array kept as-is.
/// `object`: absent → `{}`.
pub fn normalize_request(request: &mut Map<String, Value>) {
    let target = match request.remove("target") {
        None | Some(Value::Null) => json!([]),
        Some(v @ Value::Array(_)) => v,
        Some(single) => json!([single]),
    };
    request.insert("target".to_owned(), target);

    if !request.get("object").is_some_and(Value::is_object) {
        request.insert("object".to_owned(), json!({}));
    }
}
