//! Integration tests for editor reload transitions and registration
//! displacement.

mod common;

use std::time::Duration;

use serde_json::json;

use common::fixtures::{error_code, FakeEditor, TestClient};
use common::{fast_config, queued_config, TestRelay};
use prism_proto::{ErrorCode, InstanceStatus};

#[tokio::test]
async fn in_flight_request_survives_a_reload() {
    let relay = TestRelay::start_fast().await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    let mut client = TestClient::connect(relay.addr).await;
    client
        .send_request("c1:r2", None, "scene.save", json!({"path": "A.unity"}), None)
        .await;
    let command = editor.next_command().await;
    assert_eq!(command.id, "c1:r2");

    // The editor announces a reload and drops its socket before replying.
    editor.send_status("reloading").await;
    drop(editor);

    // The client gets nothing yet: the request is held, not failed.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The editor comes back inside the grace window.
    let (mut editor, registered) = FakeEditor::register(relay.addr, "/p/A").await;
    assert!(registered.success);

    // The held command is re-forwarded on the new connection.
    let replayed = editor.next_command().await;
    assert_eq!(replayed.id, "c1:r2");
    assert_eq!(replayed.params.get(), r#"{"path":"A.unity"}"#);

    editor.reply_success("c1:r2", json!({"saved": true})).await;
    let response = client.recv_response().await;
    assert!(response.success);
    assert_eq!(response.data.unwrap().get(), r#"{"saved":true}"#);
}

#[tokio::test]
async fn dispatch_during_reload_is_rejected_as_retryable() {
    let relay = TestRelay::start_fast().await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    editor.send_status("reloading").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(relay.addr).await;
    let response = client
        .request("c1:r1", None, "echo", json!({}), None)
        .await;
    assert!(!response.success);
    assert_eq!(error_code(&response), Some(ErrorCode::InstanceReloading));

    // The snapshot shows the instance as reloading, not gone.
    let instances = client.list_instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Reloading);
}

#[tokio::test]
async fn grace_expiry_fails_held_work_with_instance_disconnected() {
    let relay = TestRelay::start_fast().await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    let mut client = TestClient::connect(relay.addr).await;
    client
        .send_request("c1:r1", None, "bake", json!({}), Some(5_000))
        .await;
    let _command = editor.next_command().await;

    editor.send_status("reloading").await;
    drop(editor);

    // The editor never returns; the 800 ms test grace expires.
    let response = client.recv_response().await;
    assert!(!response.success);
    assert_eq!(error_code(&response), Some(ErrorCode::InstanceDisconnected));

    // The instance is gone from the snapshot.
    let instances = client.list_instances().await;
    assert!(instances.is_empty());
}

#[tokio::test]
async fn held_command_with_passed_deadline_is_dropped_on_reconnect() {
    let relay = TestRelay::start_fast().await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    let mut client = TestClient::connect(relay.addr).await;
    client
        .send_request("c1:r1", None, "bake", json!({}), Some(200))
        .await;
    let _command = editor.next_command().await;

    editor.send_status("reloading").await;
    drop(editor);

    // The deadline passes while the editor is away; the client times out.
    let response = client.recv_response().await;
    assert_eq!(error_code(&response), Some(ErrorCode::Timeout));

    // Reconnection must not replay the dead command.
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;
    assert!(editor.try_next_command(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn queued_commands_survive_the_reload_window() {
    let relay = TestRelay::start(queued_config(10)).await;
    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    let mut running = TestClient::connect(relay.addr).await;
    running
        .send_request("c1:r1", None, "bake", json!({}), Some(5_000))
        .await;
    let in_flight = editor.next_command().await;

    let mut waiting = TestClient::connect(relay.addr).await;
    waiting
        .send_request("c2:r1", None, "echo", json!({"v": 2}), Some(5_000))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    editor.send_status("reloading").await;
    drop(editor);

    let (mut editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    // The in-flight command resumes first, then the queued one drains.
    let replayed = editor.next_command().await;
    assert_eq!(replayed.id, in_flight.id);
    editor.reply_success(&replayed.id, json!({"ok": 1})).await;
    assert!(running.recv_response().await.success);

    let drained = editor.next_command().await;
    assert_eq!(drained.id, "c2:r1");
    editor.reply_success("c2:r1", json!({"v": 2})).await;
    assert!(waiting.recv_response().await.success);
}

#[tokio::test]
async fn duplicate_registration_displaces_the_old_connection() {
    let relay = TestRelay::start_fast().await;
    let (mut old_editor, _) = FakeEditor::register(relay.addr, "/p/A").await;

    let mut client = TestClient::connect(relay.addr).await;
    client
        .send_request("c1:r1", None, "bake", json!({}), Some(5_000))
        .await;
    let _command = old_editor.next_command().await;

    // A second REGISTER with the same identifier takes over.
    let (editor, registered) = FakeEditor::register(relay.addr, "/p/A").await;
    assert!(registered.success);

    // The displaced in-flight request fails with INSTANCE_DISCONNECTED.
    let response = client.recv_response().await;
    assert_eq!(error_code(&response), Some(ErrorCode::InstanceDisconnected));

    // The new connection serves traffic with no lost frames.
    let serve = editor.serve_echo();
    let response = client
        .request("c1:r2", None, "echo", json!({"v": 9}), Some(2_000))
        .await;
    assert!(response.success);
    assert_eq!(response.data.unwrap().get(), r#"{"v":9}"#);

    // Exactly one instance remains registered.
    assert_eq!(client.list_instances().await.len(), 1);
    serve.abort();
}

#[tokio::test]
async fn reregistration_before_any_status_is_a_plain_displacement() {
    // An editor that crashes without sending STATUS reloading and comes
    // back must still end up registered and usable.
    let relay = TestRelay::start(fast_config()).await;
    let (editor, _) = FakeEditor::register(relay.addr, "/p/A").await;
    drop(editor);

    tokio::time::sleep(Duration::from_millis(100)).await;

    let (editor, registered) = FakeEditor::register(relay.addr, "/p/A").await;
    assert!(registered.success);
    let serve = editor.serve_echo();

    let mut client = TestClient::connect(relay.addr).await;
    let response = client
        .request("c1:r1", None, "echo", json!({}), Some(2_000))
        .await;
    assert!(response.success);
    serve.abort();
}
