//! Platform/verb catalog loading.
//!
//! The catalog is a JSON document mapping platform names to their verb
//! schemas:
//!
//! ```json
//! {
//!   "xmpp": {
//!     "verbs": {
//!       "send": { "schema": { "type": "object", "required": ["object"] } }
//!     }
//!   }
//! }
//! ```
//!
//! Catalog verbs are queue-forwarded; in-process handlers can only be
//! registered programmatically.  The built-in `dispatcher` platform with its
//! `register` verb is always installed on top of the loaded catalog.

use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use hub_protocol::{DISPATCHER_PLATFORM, REGISTER_VERB};

use crate::registry::{ProtocolRegistry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("reading catalog '{path}': {message}")]
    Io { path: String, message: String },
    #[error("parsing catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Deserialize)]
struct RawPlatform {
    #[serde(default)]
    local: bool,
    #[serde(default)]
    verbs: HashMap<String, RawVerb>,
}

#[derive(Debug, Deserialize)]
struct RawVerb {
    #[serde(default = "empty_schema")]
    schema: Value,
}

fn empty_schema() -> Value {
    json!({})
}

pub fn load_catalog(path: &Path) -> Result<ProtocolRegistry, CatalogError> {
    let text = std::fs::read_to_string(path).map_err(|e| CatalogError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_catalog(&text)
}

pub fn parse_catalog(text: &str) -> Result<ProtocolRegistry, CatalogError> {
    let raw: HashMap<String, RawPlatform> = serde_json::from_str(text)?;

    let mut registry = ProtocolRegistry::new();
    for (name, platform) in &raw {
        if platform.local {
            registry.add_local_platform(name);
        } else {
            registry.add_remote_platform(name);
        }
    }
    for (name, platform) in raw {
        for (verb, def) in platform.verbs {
            registry.add_verb(&name, &verb, &def.schema)?;
        }
    }

    install_builtin_verbs(&mut registry)?;
    Ok(registry)
}

/// Install the local `dispatcher` platform and its `register` verb.
///
/// Registration is an opaque verb at this layer: the handler marks the
/// session registered, stashes the registration object (credentials or
/// whatever the client sent) in session storage, and acknowledges.
pub fn install_builtin_verbs(registry: &mut ProtocolRegistry) -> Result<(), RegistryError> {
    registry.add_local_platform(DISPATCHER_PLATFORM);
    registry.add_local_verb(
        DISPATCHER_PLATFORM,
        REGISTER_VERB,
        &json!({"type": "object"}),
        Arc::new(|request, session, responder| {
            session.register();
            responder.ok(json!({}));
            tokio::spawn(async move {
                session
                    .put("credentials", request["object"].clone())
                    .await;
            });
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "xmpp": {
            "verbs": {
                "send": { "schema": { "type": "object", "required": ["object"] } },
                "join": { "schema": {} }
            }
        },
        "irc": { "verbs": { "send": {} } }
    }"#;

    #[test]
    fn catalog_platforms_default_to_remote_with_ping_state() {
        let registry = parse_catalog(CATALOG).unwrap();
        let xmpp = registry.platform("xmpp").unwrap();
        assert!(!xmpp.is_local());
        assert!(xmpp.ping().is_some());
        assert!(xmpp.verb("send").is_some());
        assert!(xmpp.verb("join").is_some());
        assert!(registry.platform("irc").unwrap().verb("send").is_some());
    }

    #[test]
    fn builtin_dispatcher_platform_is_always_present() {
        let registry = parse_catalog(CATALOG).unwrap();
        let dispatcher = registry.platform("dispatcher").unwrap();
        assert!(dispatcher.is_local());
        assert!(dispatcher.ping().is_none());
        assert!(dispatcher.verb("register").is_some());
    }

    #[test]
    fn verbs_without_schemas_accept_anything() {
        let registry = parse_catalog(CATALOG).unwrap();
        let send = registry.platform("irc").unwrap().verb("send").unwrap();
        assert!(send.validate(&json!({"rid": "1", "anything": [1, 2]})).is_ok());
    }

    #[test]
    fn malformed_catalog_is_a_parse_error() {
        assert!(matches!(
            parse_catalog("{not json"),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_catalog(Path::new("/nonexistent/catalog.json")).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
