//! Tests for progress event decoding.

use mirrord_driver::cli::{decode, Event, EventKind, ExecutionResult, ProtocolError, COMPLETION_MARKER};

#[test]
fn decode_new_task_with_null_fields() {
    let event = decode(
        r#"{"type":"NewTask","name":"mirrord preparing to launch","parent":null,"success":null,"message":null}"#,
    )
    .unwrap();

    assert_eq!(event.kind(), EventKind::NewTask);
    assert_eq!(event.name(), COMPLETION_MARKER);
    assert!(event.parent().is_none());
    assert!(event.success().is_none());
    assert!(event.message().is_none());
}

#[test]
fn decode_is_field_order_independent() {
    let a = decode(r#"{"type":"Warning","name":"n","message":"m"}"#).unwrap();
    let b = decode(r#"{"message":"m","name":"n","type":"Warning"}"#).unwrap();
    assert_eq!(a, b);
}

#[test]
fn decode_finished_task_keeps_success() {
    for success in [true, false] {
        let line = format!(r#"{{"type":"FinishedTask","name":"agent","success":{success}}}"#);
        let event = decode(&line).unwrap();
        assert_eq!(event.kind(), EventKind::FinishedTask);
        assert_eq!(event.success(), Some(success));
    }
}

#[test]
fn decode_finished_task_without_success_fails() {
    let err = decode(r#"{"type":"FinishedTask","name":"agent","message":"done"}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::Invalid(_)));

    let err = decode(r#"{"type":"FinishedTask","name":"agent","success":null}"#).unwrap_err();
    assert!(matches!(err, ProtocolError::Invalid(_)));
}

#[test]
fn decode_success_on_other_kinds_fails() {
    for kind in ["NewTask", "Warning"] {
        let line = format!(r#"{{"type":"{kind}","name":"n","success":true}}"#);
        assert!(matches!(decode(&line), Err(ProtocolError::Invalid(_))), "{kind}");
    }
}

#[test]
fn decode_malformed_keeps_input() {
    match decode("not json at all") {
        Err(ProtocolError::Malformed { input, .. }) => assert_eq!(input, "not json at all"),
        other => panic!("Expected Malformed, got {other:?}"),
    }
}

#[test]
fn decode_unknown_kind_fails() {
    assert!(decode(r#"{"type":"Progress","name":"n"}"#).is_err());
}

#[test]
fn status_text_appends_message() {
    let with_message = Event::NewTask {
        name: "starting agent".to_string(),
        parent: None,
        message: Some("pod/api".to_string()),
    };
    assert_eq!(with_message.status_text(), "starting agent: pod/api");

    let bare = Event::NewTask {
        name: "starting agent".to_string(),
        parent: None,
        message: None,
    };
    assert_eq!(bare.status_text(), "starting agent");
}

#[test]
fn payload_decodes_environment() {
    let result = ExecutionResult::from_payload(
        r#"{"environment":{"A":"1","LD_PRELOAD":"/tmp/libmirrord_layer.so"},"patched_path":"/tmp/sip/bin"}"#,
    )
    .unwrap();
    assert_eq!(result.environment()["A"], "1");
    assert_eq!(result.patched_path(), Some("/tmp/sip/bin"));
}

#[test]
fn payload_without_environment_is_malformed() {
    assert!(matches!(
        ExecutionResult::from_payload(r#"{"patched_path":null}"#),
        Err(ProtocolError::Malformed { .. })
    ));
}

#[test]
fn result_splits_into_parts() {
    let result = ExecutionResult::from_payload(r#"{"environment":{"A":"1"},"patched_path":null}"#)
        .unwrap()
        .with_env("A", "2")
        .with_env("B", "3");

    let (environment, patched_path) = result.into_parts();
    assert_eq!(environment["A"], "1");
    assert_eq!(environment["B"], "3");
    assert!(patched_path.is_none());
}
