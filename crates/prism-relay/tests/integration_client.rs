//! End-to-end tests driving the relay through the client transport.

mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use common::fixtures::{FakeEditor, TestClient};
use common::{patient_heartbeat_config, TestRelay};
use prism_client::{CallOptions, ClientError, ClientOptions, RelayClient, RetryPolicy};
use prism_proto::ErrorCode;

fn fast_retry_client(relay: &TestRelay, budget: Duration) -> RelayClient {
    let options = ClientOptions {
        retry: RetryPolicy {
            initial: Duration::from_millis(25),
            max: Duration::from_millis(100),
            budget,
        },
        ..ClientOptions::default()
    };
    RelayClient::with_options("127.0.0.1", relay.addr.port(), options)
}

#[tokio::test]
async fn call_roundtrip_through_the_client() {
    let relay = TestRelay::start_fast().await;
    let (editor, _) = FakeEditor::register(relay.addr, "/p/A").await;
    let serve = editor.serve_echo();

    let client = RelayClient::new("127.0.0.1", relay.addr.port());
    let data = client
        .call("echo", json!({"v": 1}), CallOptions::default())
        .await
        .expect("call succeeds");

    assert_eq!(data.unwrap().get(), r#"{"v":1}"#);
    serve.abort();
}

#[tokio::test]
async fn call_targets_a_named_instance() {
    let relay = TestRelay::start_fast().await;
    let (editor_a, _) = FakeEditor::register(relay.addr, "/p/A").await;
    let (editor_b, _) = FakeEditor::register(relay.addr, "/p/B").await;
    let serve_a = editor_a.serve_echo();
    let mut editor_b = editor_b;

    let client = RelayClient::new("127.0.0.1", relay.addr.port());
    let options = CallOptions {
        instance_id: Some("/p/B".to_owned()),
        timeout_ms: Some(2_000),
    };
    let call = client.call("echo", json!({"to": "B"}), options);

    let (data, ()) = tokio::join!(call, async {
        let command = editor_b.next_command().await;
        assert_eq!(command.command, "echo");
        editor_b
            .reply_success(&command.id, json!({"to": "B"}))
            .await;
    });

    assert_eq!(data.expect("call succeeds").unwrap().get(), r#"{"to":"B"}"#);
    serve_a.abort();
}

#[tokio::test]
async fn retry_absorbs_a_reload_window() {
    let relay = TestRelay::start_fast().await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    editor.send_status("reloading").await;
    drop(editor);

    // The editor returns while the client is still inside its retry
    // budget; no INSTANCE_RELOADING surfaces to the caller.
    let addr = relay.addr;
    let comeback = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let (editor, _) = FakeEditor::register(addr, "/p/A").await;
        editor.serve_echo()
    });

    let client = fast_retry_client(&relay, Duration::from_secs(5));
    let data = client
        .call("echo", json!({"v": 7}), CallOptions::default())
        .await
        .expect("call succeeds after the reload");

    assert_eq!(data.unwrap().get(), r#"{"v":7}"#);
    comeback.await.expect("editor comeback").abort();
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_the_last_busy_error() {
    let relay = TestRelay::start(patient_heartbeat_config()).await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    // Occupy the instance with a command that never completes.
    let mut occupier = TestClient::connect(relay.addr).await;
    occupier
        .send_request("c1:slow", None, "bake", json!({}), Some(30_000))
        .await;
    let _held = editor.next_command().await;

    let client = fast_retry_client(&relay, Duration::from_millis(400));
    let started = Instant::now();
    let error = client
        .call("echo", json!({}), CallOptions::default())
        .await
        .expect_err("busy the whole budget");

    // Terminal outcome is the last transient error, reached at the
    // budget boundary rather than after a single attempt.
    match &error {
        ClientError::Relay { code, .. } => assert_eq!(*code, ErrorCode::InstanceBusy),
        other => panic!("expected relay busy error, got {other}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "budget ignored: {elapsed:?}");
}

#[tokio::test]
async fn non_transient_errors_surface_immediately() {
    let relay = TestRelay::start_fast().await;
    let (_editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    let client = fast_retry_client(&relay, Duration::from_secs(5));
    let started = Instant::now();
    let options = CallOptions {
        instance_id: Some("/p/missing".to_owned()),
        timeout_ms: None,
    };
    let error = client
        .call("echo", json!({}), options)
        .await
        .expect_err("unknown instance");

    assert_eq!(error.code(), Some(ErrorCode::InstanceNotFound));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "non-transient errors must not retry"
    );
}

#[tokio::test]
async fn timeout_then_retry_reaches_the_editor_again() {
    let relay = TestRelay::start(patient_heartbeat_config()).await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    // First attempt: the editor replies after the per-call deadline, so
    // the relay discards the late result and the client retries with the
    // same identifier; the second attempt is answered promptly.
    let editor_task = tokio::spawn(async move {
        let first = editor.next_command().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        editor.reply_success(&first.id, json!({"attempt": 1})).await;

        let second = editor.next_command().await;
        editor
            .reply_success(&second.id, json!({"attempt": 2}))
            .await;
    });

    let client = fast_retry_client(&relay, Duration::from_secs(10));
    let options = CallOptions {
        instance_id: None,
        timeout_ms: Some(250),
    };
    let data = client
        .call("bake", json!({}), options)
        .await
        .expect("retry succeeds");

    assert_eq!(data.unwrap().get(), r#"{"attempt":2}"#);
    editor_task.await.expect("editor script");
}

#[tokio::test]
async fn client_lists_instances_and_sets_the_default() {
    let relay = TestRelay::start_fast().await;
    let (editor_a, _) = FakeEditor::register(relay.addr, "/p/A").await;
    let (editor_b, _) = FakeEditor::register(relay.addr, "/p/B").await;
    let serve_a = editor_a.serve_echo();
    let serve_b = editor_b.serve_echo();

    let client = RelayClient::new("127.0.0.1", relay.addr.port());

    let instances = client.list_instances().await.expect("snapshot");
    assert_eq!(instances.len(), 2);
    assert!(instances[0].is_default);

    client.set_default("/p/B").await.expect("set default");
    let instances = client.list_instances().await.expect("snapshot");
    assert!(instances.iter().any(|i| i.id == "/p/B" && i.is_default));

    let error = client
        .set_default("/p/missing")
        .await
        .expect_err("unknown instance");
    assert_eq!(error.code(), Some(ErrorCode::InstanceNotFound));

    serve_a.abort();
    serve_b.abort();
}

#[tokio::test]
async fn connect_failure_is_immediate_and_not_retried() {
    // Nothing is listening on this port.
    let client = RelayClient::new("127.0.0.1", 1);
    let started = Instant::now();
    let error = client
        .call("echo", json!({}), CallOptions::default())
        .await
        .expect_err("no relay running");

    assert!(matches!(error, ClientError::Connect { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
}
