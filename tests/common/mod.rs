#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use httpmock::MockServer;
use plato_sandbox::config::Config;
use plato_sandbox::controller::{
    AuditCleaner, SandboxController, SessionRegistry, WorkspacePublisher,
};
use plato_sandbox::http::ApiClient;
use plato_sandbox::session::SessionDescriptor;
use plato_sandbox::ssh_config::SshConfigStore;
use plato_sandbox::tunnel::TunnelOpener;

pub fn test_config(server: &MockServer, home: &Path) -> Config {
    Config {
        api_key: "test-key".to_string(),
        api_base_url: server.base_url(),
        hub_base_url: server.base_url(),
        proxy_addr: "proxy.test:9000".to_string(),
        heartbeat_interval: Duration::from_millis(100),
        home_dir: home.to_path_buf(),
        ssh_config_path: home.join("ssh_config"),
    }
}

/// Pre-seed the keypair so tests never shell out to ssh-keygen.
pub fn seed_keypair(home: &Path) {
    let dir = home.join("ssh");
    std::fs::create_dir_all(&dir).expect("create key dir");
    std::fs::write(dir.join("id_ed25519"), "private").expect("write private key");
    std::fs::write(dir.join("id_ed25519.pub"), "ssh-ed25519 AAAA plato-sandbox\n")
        .expect("write public key");
}

pub fn controller_with(
    config: &Config,
    tunnels: Arc<dyn TunnelOpener>,
    cleaner: Arc<dyn AuditCleaner>,
    publisher: Arc<dyn WorkspacePublisher>,
) -> SandboxController {
    let api = ApiClient::new(config);
    SandboxController::new(
        api,
        config.clone(),
        Arc::new(SessionRegistry::new()),
        Arc::new(SshConfigStore::new(config.ssh_config_path.clone())),
        tunnels,
        cleaner,
        publisher,
    )
}

/// Render events as the `data:` records of a `text/event-stream` body.
pub fn sse_body(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|event| format!("data: {event}\n\n"))
        .collect()
}

/// Descriptor for a ready sandbox, as a previous invocation would have
/// written it.
pub fn ready_descriptor(workdir: &Path, public_id: &str, job_group_id: &str, service: &str) {
    let descriptor = SessionDescriptor {
        public_id: public_id.to_string(),
        job_group_id: job_group_id.to_string(),
        url: format!("https://{public_id}.plato.test"),
        dataset: "base".to_string(),
        config_path: None,
        artifact_id: None,
        version: None,
        service: Some(service.to_string()),
        ssh_host: None,
        ssh_config_path: None,
        ssh_private_key_path: None,
    };
    descriptor.write(workdir).expect("write descriptor");
}

/// A local port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind probe");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}
