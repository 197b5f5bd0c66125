//! Golden wire-shape tests: the frame layouts clients and listeners parse
//! are frozen, so each one is asserted against its literal JSON form.

use hub_protocol::{ConfirmFrame, ErrorFrame, MessageFrame, parse_error_frame};
use serde_json::{Value, json};

fn as_json<F: serde::Serialize>(frame: &F) -> Value {
    serde_json::to_value(frame).expect("frame should serialize")
}

#[test]
fn confirm_frame_wire_shape() {
    assert_eq!(
        as_json(&ConfirmFrame::new(json!("req-1"))),
        json!({"rid": "req-1", "verb": "confirm", "status": true})
    );
    // Numeric rids are echoed as numbers, not stringified.
    assert_eq!(
        as_json(&ConfirmFrame::new(json!(42)))["rid"],
        json!(42)
    );
}

#[test]
fn message_frame_wire_shape() {
    let frame = MessageFrame::new(
        json!("req-2"),
        "send",
        "xmpp",
        json!({"body": "hello"}),
        json!([{"id": "room@muc"}]),
    );
    assert_eq!(
        as_json(&frame),
        json!({
            "rid": "req-2",
            "verb": "send",
            "platform": "xmpp",
            "status": true,
            "object": {"body": "hello"},
            "target": [{"id": "room@muc"}]
        })
    );
}

#[test]
fn pre_dispatch_error_wire_shape() {
    let frame = ErrorFrame::pre_dispatch(json!("req-3"), Some("irc"), "unknown verb received: fly");
    assert_eq!(
        as_json(&frame),
        json!({
            "rid": "req-3",
            "platform": "irc",
            "verb": "confirm",
            "status": false,
            "message": "unknown verb received: fly"
        })
    );
}

#[test]
fn parse_error_wire_shape_has_null_identity() {
    assert_eq!(
        as_json(&parse_error_frame()),
        json!({
            "rid": null,
            "platform": null,
            "verb": "confirm",
            "status": false,
            "message": "invalid JSON received"
        })
    );
}

#[test]
fn request_error_wire_shape_echoes_identity_and_target() {
    let frame = ErrorFrame::for_request(
        json!(7),
        "xmpp",
        "send",
        "unable to validate json against schema: \"body\" is a required property",
        json!([]),
    );
    let value = as_json(&frame);
    assert_eq!(value["rid"], json!(7));
    assert_eq!(value["platform"], json!("xmpp"));
    assert_eq!(value["verb"], json!("send"));
    assert_eq!(value["status"], json!(false));
    assert_eq!(value["target"], json!([]));
}

#[test]
fn error_frames_parse_back_for_client_side_handling() {
    let text = serde_json::to_string(&parse_error_frame()).unwrap();
    let parsed: ErrorFrame = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed.rid, Value::Null);
    assert_eq!(parsed.platform, None);
    assert!(!parsed.status);
}
