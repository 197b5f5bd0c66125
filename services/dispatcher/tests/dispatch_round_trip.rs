//! Dispatch coverage: local handler round trips, queue-forwarded requests,
//! and the confirm-before-response ordering invariant.

use async_trait::async_trait;
use dispatcher::catalog::install_builtin_verbs;
use dispatcher::config::DispatcherConfig;
use dispatcher::queue::{MemoryQueue, MessageQueue, QueueError};
use dispatcher::registry::ProtocolRegistry;
use dispatcher::{ClientFrame, Connection, Dispatcher};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, timeout};

fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        sockethub_id: "hub-test".to_owned(),
        platforms: vec!["xmpp".to_owned()],
        listener_interval_ms: 100,
        listener_interval_count: 3,
        catalog_path: String::new(),
    }
}

/// Registry with the built-in dispatcher platform plus two extra local
/// verbs on it (`echo`, `fail`) and a remote `xmpp` platform marked live.
fn test_registry() -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    registry.add_remote_platform("xmpp");
    registry
        .add_verb("xmpp", "send", &json!({"type": "object"}))
        .unwrap();
    install_builtin_verbs(&mut registry).unwrap();
    registry
        .add_local_verb(
            "dispatcher",
            "echo",
            &json!({"type": "object"}),
            Arc::new(|request, _session, responder| {
                responder.ok(request["object"].clone());
            }),
        )
        .unwrap();
    registry
        .add_local_verb(
            "dispatcher",
            "fail",
            &json!({"type": "object"}),
            Arc::new(|_request, _session, responder| {
                responder.err("handler exploded");
            }),
        )
        .unwrap();
    registry.platform("xmpp").unwrap().ping().unwrap().mark_received(1);
    registry
}

async fn connect_registered(
    registry: ProtocolRegistry,
    queue: Arc<dyn MessageQueue>,
) -> (Connection, UnboundedReceiver<ClientFrame>) {
    let dispatcher = Dispatcher::new(&test_config(), Arc::new(registry), queue);
    let (sink, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut conn = dispatcher.connect(sink);
    conn.resolve_session().await;
    dispatcher
        .sessions()
        .get(conn.session_id())
        .await
        .unwrap()
        .register();
    (conn, rx)
}

async fn next_json(rx: &mut UnboundedReceiver<ClientFrame>) -> Value {
    match timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("expected an outbound frame")
        .expect("connection channel closed")
    {
        ClientFrame::Text(text) => serde_json::from_str(&text).unwrap(),
        ClientFrame::Binary(_) => panic!("unexpected binary frame"),
    }
}

async fn send_text(conn: &mut Connection, text: &str) {
    conn.handle_frame(ClientFrame::Text(text.to_owned())).await;
}

// ---------------------------------------------------------------------------
// Local handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn local_handler_round_trips_object_and_normalized_target() {
    let queue: Arc<dyn MessageQueue> = Arc::new(MemoryQueue::new());
    let (mut conn, mut rx) = connect_registered(test_registry(), queue).await;

    send_text(
        &mut conn,
        r#"{"rid":"e1","platform":"dispatcher","verb":"echo",
            "object":{"content":"hello"},"target":{"id":"peer"}}"#,
    )
    .await;

    let confirm = next_json(&mut rx).await;
    assert_eq!(confirm["rid"], json!("e1"));
    assert_eq!(confirm["verb"], json!("confirm"));
    assert_eq!(confirm["status"], json!(true));

    let response = next_json(&mut rx).await;
    assert_eq!(response["rid"], json!("e1"));
    assert_eq!(response["verb"], json!("echo"));
    assert_eq!(response["platform"], json!("dispatcher"));
    assert_eq!(response["status"], json!(true));
    assert_eq!(response["object"], json!({"content": "hello"}));
    // Single-object target was normalized to a sequence.
    assert_eq!(response["target"], json!([{"id": "peer"}]));
}

#[tokio::test]
async fn failing_handler_reports_an_error_frame_after_the_confirm() {
    let queue: Arc<dyn MessageQueue> = Arc::new(MemoryQueue::new());
    let (mut conn, mut rx) = connect_registered(test_registry(), queue).await;

    send_text(
        &mut conn,
        r#"{"rid":9,"platform":"dispatcher","verb":"fail","object":{}}"#,
    )
    .await;

    let confirm = next_json(&mut rx).await;
    assert_eq!(confirm["verb"], json!("confirm"));
    assert_eq!(confirm["status"], json!(true));

    let error = next_json(&mut rx).await;
    assert_eq!(error["rid"], json!(9));
    assert_eq!(error["platform"], json!("dispatcher"));
    assert_eq!(error["verb"], json!("fail"));
    assert_eq!(error["status"], json!(false));
    assert_eq!(error["message"], json!("handler exploded"));
}

#[tokio::test]
async fn identical_requests_produce_independent_confirm_response_pairs() {
    let queue: Arc<dyn MessageQueue> = Arc::new(MemoryQueue::new());
    let (mut conn, mut rx) = connect_registered(test_registry(), queue).await;

    let request = r#"{"rid":"same","platform":"dispatcher","verb":"echo","object":{"n":1}}"#;
    for _ in 0..3 {
        send_text(&mut conn, request).await;
    }

    // No request-level dedup: three confirms, three responses, interleaved
    // per request.
    for _ in 0..3 {
        let confirm = next_json(&mut rx).await;
        assert_eq!(confirm["verb"], json!("confirm"));
        let response = next_json(&mut rx).await;
        assert_eq!(response["object"], json!({"n": 1}));
    }
    assert!(rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Queue-forwarded verbs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_verb_is_confirmed_and_pushed_once_with_session_id_injected() {
    let queue = Arc::new(MemoryQueue::new());
    let (mut conn, mut rx) =
        connect_registered(test_registry(), queue.clone() as Arc<dyn MessageQueue>).await;

    send_text(
        &mut conn,
        r#"{"rid":"r5","platform":"xmpp","verb":"send","object":{"body":"hi"}}"#,
    )
    .await;

    let confirm = next_json(&mut rx).await;
    assert_eq!(confirm["rid"], json!("r5"));
    assert_eq!(confirm["verb"], json!("confirm"));
    assert_eq!(confirm["status"], json!(true));

    let payload = queue
        .pop("sockethub:hub-test:listener:xmpp:incoming")
        .await
        .unwrap();
    let forwarded: Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(forwarded["rid"], json!("r5"));
    assert_eq!(forwarded["verb"], json!("send"));
    assert_eq!(forwarded["object"], json!({"body": "hi"}));
    assert_eq!(forwarded["target"], json!([]));
    assert_eq!(
        forwarded["sessionId"],
        json!(conn.session_id().to_string()),
        "sessionId must be injected as a decimal string"
    );

    // Exactly one push for one request.
    assert!(
        timeout(
            Duration::from_millis(50),
            queue.pop("sockethub:hub-test:listener:xmpp:incoming")
        )
        .await
        .is_err()
    );
}

struct PushFailQueue;

#[async_trait]
impl MessageQueue for PushFailQueue {
    async fn push(&self, _channel: &str, _payload: String) -> Result<(), QueueError> {
        Err(QueueError::Backend("broken pipe".to_owned()))
    }
    async fn pop(&self, _channel: &str) -> Result<String, QueueError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn failed_listener_push_is_not_reported_to_the_client() {
    let (mut conn, mut rx) = connect_registered(test_registry(), Arc::new(PushFailQueue)).await;

    send_text(
        &mut conn,
        r#"{"rid":"r6","platform":"xmpp","verb":"send","object":{}}"#,
    )
    .await;

    // The confirm already went out; the dropped push is logged only.
    let confirm = next_json(&mut rx).await;
    assert_eq!(confirm["verb"], json!("confirm"));
    assert_eq!(confirm["status"], json!(true));
    assert!(rx.try_recv().is_err());
}
