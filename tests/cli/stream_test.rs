//! Tests for reading the progress stream.

use futures_util::StreamExt;
use mirrord_driver::cli::{read_events, EventKind, StreamError};

#[tokio::test]
async fn reads_events_in_order_and_skips_blank_lines() {
    let input = concat!(
        "{\"type\":\"NewTask\",\"name\":\"a\"}\n",
        "\n",
        "   \n",
        "{\"type\":\"Warning\",\"name\":\"b\",\"message\":\"careful\"}\n",
        "{\"type\":\"FinishedTask\",\"name\":\"a\",\"success\":true}",
    );

    let events: Vec<_> = read_events(input.as_bytes()).collect().await;
    let kinds: Vec<EventKind> = events
        .into_iter()
        .map(|e| e.unwrap().kind())
        .collect();
    assert_eq!(
        kinds,
        vec![EventKind::NewTask, EventKind::Warning, EventKind::FinishedTask]
    );
}

#[tokio::test]
async fn yields_error_for_bad_line_and_continues() {
    let input = "{\"type\":\"NewTask\",\"name\":\"a\"}\n{oops\n{\"type\":\"NewTask\",\"name\":\"b\"}\n";

    let events: Vec<_> = read_events(input.as_bytes()).collect().await;
    assert_eq!(events.len(), 3);
    assert!(events[0].is_ok());
    assert!(matches!(events[1], Err(StreamError::Protocol(_))));
    assert_eq!(events[2].as_ref().unwrap().name(), "b");
}

#[tokio::test]
async fn empty_input_ends_immediately() {
    let events: Vec<_> = read_events(&b""[..]).collect().await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn reassembles_lines_split_across_reads() {
    let mock = tokio_test::io::Builder::new()
        .read(b"{\"type\":\"NewTask\",")
        .read(b"\"name\":\"starting agent\"}\n{\"type\":\"Fini")
        .read(b"shedTask\",\"name\":\"starting agent\",\"success\":true}\n")
        .build();

    let events: Vec<_> = read_events(mock).collect().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].as_ref().unwrap().success(), Some(true));
}
