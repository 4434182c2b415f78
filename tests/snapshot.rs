mod common;

use std::sync::Arc;

use httpmock::prelude::*;
use serde_json::json;

use common::{controller_with, ready_descriptor, test_config};
use plato_sandbox::controller::testing::{call_log, RecordingCleaner, RecordingPublisher};
use plato_sandbox::controller::{SandboxController, SnapshotOptions};
use plato_sandbox::error::AppError;
use plato_sandbox::progress::NullSink;
use plato_sandbox::session::SessionState;
use plato_sandbox::tunnel::testing::FakeTunnelOpener;

async fn heartbeat_mock(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(POST).path("/env/jg-42/heartbeat");
            then.status(204);
        })
        .await;
}

fn snapshot_controller(
    config: &plato_sandbox::Config,
    cleaner: RecordingCleaner,
    publisher: RecordingPublisher,
) -> SandboxController {
    controller_with(
        config,
        Arc::new(FakeTunnelOpener::new()),
        Arc::new(cleaner),
        Arc::new(publisher),
    )
}

#[tokio::test]
async fn snapshot_without_prior_push_omits_git_hash() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-42", "jg-42", "espocrm");
    heartbeat_mock(&server).await;

    let snapshot_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/public-build/vm/vm-42/snapshot")
                .json_body(json!({"service": "espocrm", "dataset": "base"}));
            then.status(200)
                .json_body(json!({"artifact_id": "a1", "status": "completed"}));
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let controller = snapshot_controller(
        &config,
        RecordingCleaner::ok(log.clone()),
        RecordingPublisher::new(log.clone(), "unused", "unused"),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");
    let response = controller
        .snapshot(&session, SnapshotOptions::default(), &NullSink)
        .await
        .expect("snapshot");

    assert_eq!(response.artifact_id, "a1");
    assert_eq!(snapshot_mock.hits_async().await, 1);
    assert_eq!(session.state().await, SessionState::Ready);
    // Cleanup ran, no merge happened.
    assert_eq!(*log.lock().expect("log"), vec!["clean:espocrm".to_string()]);
}

#[tokio::test]
async fn snapshot_after_push_merges_first_and_pins_the_hash() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-42", "jg-42", "espocrm");
    heartbeat_mock(&server).await;

    let snapshot_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/public-build/vm/vm-42/snapshot").json_body(
                json!({"service": "espocrm", "dataset": "base", "git_hash": "deadbeef"}),
            );
            then.status(200).json_body(json!({
                "artifact_id": "a1",
                "status": "completed",
                "git_hash": "deadbeef",
                "s3_uri": "s3://artifacts/a1",
            }));
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let controller = snapshot_controller(
        &config,
        RecordingCleaner::ok(log.clone()),
        RecordingPublisher::new(log.clone(), "workspace-1700", "deadbeef"),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");
    controller
        .push_to_hub(&session, std::path::Path::new("."), &NullSink)
        .await
        .expect("push");
    assert_eq!(
        session.last_pushed_branch().await.as_deref(),
        Some("workspace-1700")
    );

    let response = controller
        .snapshot(&session, SnapshotOptions::default(), &NullSink)
        .await
        .expect("snapshot");

    assert_eq!(response.git_hash.as_deref(), Some("deadbeef"));
    assert_eq!(snapshot_mock.hits_async().await, 1);
    // Cleanup happens before the merge, the merge before the snapshot RPC.
    assert_eq!(
        *log.lock().expect("log"),
        vec![
            "push:espocrm".to_string(),
            "clean:espocrm".to_string(),
            "merge:espocrm:workspace-1700".to_string(),
        ]
    );
    // The pending branch is consumed by the snapshot.
    assert_eq!(session.last_pushed_branch().await, None);
    assert_eq!(session.state().await, SessionState::Ready);
}

#[tokio::test]
async fn missing_db_config_aborts_before_any_snapshot_rpc() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-42", "jg-42", "unknown-stack");
    heartbeat_mock(&server).await;

    let snapshot_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/public-build/vm/vm-42/snapshot");
            then.status(200)
                .json_body(json!({"artifact_id": "a1", "status": "completed"}));
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let controller = snapshot_controller(
        &config,
        RecordingCleaner {
            log: log.clone(),
            needs_input: true,
            fail: None,
        },
        RecordingPublisher::new(log, "unused", "unused"),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");
    let err = controller
        .snapshot(&session, SnapshotOptions::default(), &NullSink)
        .await
        .expect_err("snapshot must ask for credentials");

    assert!(err.is_needs_input());
    assert_eq!(snapshot_mock.hits_async().await, 0);
    // The session stays usable so the caller can retry with credentials.
    assert_eq!(session.state().await, SessionState::Ready);
}

#[tokio::test]
async fn fatal_cleanup_failure_rolls_back_to_ready() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-42", "jg-42", "espocrm");
    heartbeat_mock(&server).await;

    let snapshot_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/public-build/vm/vm-42/snapshot");
            then.status(200)
                .json_body(json!({"artifact_id": "a1", "status": "completed"}));
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let controller = snapshot_controller(
        &config,
        RecordingCleaner {
            log: log.clone(),
            needs_input: false,
            fail: Some("env-state clear failed".to_string()),
        },
        RecordingPublisher::new(log, "unused", "unused"),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");
    let err = controller
        .snapshot(&session, SnapshotOptions::default(), &NullSink)
        .await
        .expect_err("snapshot must fail");

    assert!(matches!(err, AppError::Stream(_)));
    assert_eq!(snapshot_mock.hits_async().await, 0);
    assert_eq!(session.state().await, SessionState::Ready);
}
