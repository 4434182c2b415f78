mod common;

use std::sync::Arc;

use httpmock::prelude::*;

use common::{controller_with, free_port, ready_descriptor, test_config};
use plato_sandbox::controller::testing::{call_log, RecordingCleaner, RecordingPublisher};
use plato_sandbox::error::AppError;
use plato_sandbox::session::SessionState;
use plato_sandbox::tunnel::testing::FakeTunnelOpener;

#[tokio::test]
async fn tunnels_prefer_the_remote_port_and_close_with_the_session() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-42", "jg-42", "espocrm");

    server
        .mock_async(|when, then| {
            when.method(POST).path("/env/jg-42/heartbeat");
            then.status(204);
        })
        .await;
    let delete_mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/public-build/vm/vm-42");
            then.status(204);
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let tunnels = Arc::new(FakeTunnelOpener::new());
    let controller = controller_with(
        &config,
        tunnels.clone(),
        Arc::new(RecordingCleaner::ok(log.clone())),
        Arc::new(RecordingPublisher::new(log, "unused", "unused")),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");

    // A free remote port is mirrored locally.
    let first_port = free_port();
    let (local_a, remote_a) = controller
        .open_tunnel(&session, first_port)
        .await
        .expect("open first tunnel");
    assert_eq!(local_a, first_port);
    assert_eq!(remote_a, first_port);

    // A locally bound port falls back to an ephemeral one.
    let blocker = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind blocker");
    let taken = blocker.local_addr().expect("addr").port();
    let (local_b, remote_b) = controller
        .open_tunnel(&session, taken)
        .await
        .expect("open second tunnel");
    assert_eq!(remote_b, taken);
    assert_ne!(local_b, taken);

    assert_eq!(session.tunnel_ports().await.len(), 2);
    assert_eq!(tunnels.opened(), 2);

    let report = controller.close(&session).await;
    assert!(report.errors.is_empty(), "close errors: {:?}", report.errors);
    assert_eq!(session.state().await, SessionState::Closed);
    assert_eq!(tunnels.closed(), 2);
    assert!(session.tunnel_ports().await.is_empty());
    assert_eq!(delete_mock.hits_async().await, 1);
}

#[tokio::test]
async fn explicit_tunnel_close_releases_only_that_forward() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-43", "jg-43", "espocrm");

    server
        .mock_async(|when, then| {
            when.method(POST).path("/env/jg-43/heartbeat");
            then.status(204);
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let tunnels = Arc::new(FakeTunnelOpener::new());
    let controller = controller_with(
        &config,
        tunnels.clone(),
        Arc::new(RecordingCleaner::ok(log.clone())),
        Arc::new(RecordingPublisher::new(log, "unused", "unused")),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");
    let (local_a, _) = controller
        .open_tunnel(&session, free_port())
        .await
        .expect("open first");
    let (local_b, _) = controller
        .open_tunnel(&session, free_port())
        .await
        .expect("open second");

    controller
        .close_tunnel(&session, local_a)
        .await
        .expect("close first");
    assert_eq!(tunnels.closed(), 1);
    let remaining = session.tunnel_ports().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0, local_b);

    // Closing an unknown port is a caller error, not a panic.
    let err = controller
        .close_tunnel(&session, local_a)
        .await
        .expect_err("already closed");
    assert!(matches!(err, AppError::Config(_)));
}

#[tokio::test]
async fn crashed_helpers_cost_the_forward_not_the_session() {
    let server = MockServer::start_async().await;
    let home = tempfile::tempdir().expect("home");
    let workdir = tempfile::tempdir().expect("workdir");
    ready_descriptor(workdir.path(), "vm-44", "jg-44", "espocrm");

    server
        .mock_async(|when, then| {
            when.method(POST).path("/env/jg-44/heartbeat");
            then.status(204);
        })
        .await;

    let config = test_config(&server, home.path());
    let log = call_log();
    let tunnels = Arc::new(FakeTunnelOpener::new());
    let controller = controller_with(
        &config,
        tunnels.clone(),
        Arc::new(RecordingCleaner::ok(log.clone())),
        Arc::new(RecordingPublisher::new(log, "unused", "unused")),
    );

    let session = controller.attach(workdir.path()).await.expect("attach");
    let (local_a, _) = controller
        .open_tunnel(&session, free_port())
        .await
        .expect("open");
    controller
        .open_tunnel(&session, free_port())
        .await
        .expect("open");

    assert!(controller.reap_dead_tunnels(&session).await.is_empty());

    tunnels.mark_all_exited();
    let mut reaped = controller.reap_dead_tunnels(&session).await;
    reaped.sort_unstable();
    assert_eq!(reaped.len(), 2);
    assert!(reaped.contains(&local_a));

    // The session is untouched by the crashes.
    assert_eq!(session.state().await, SessionState::Ready);
    assert!(session.tunnel_ports().await.is_empty());
}
