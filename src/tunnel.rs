use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::rpc::PublicId;

/// Name of the external CONNECT-forwarding helper expected on PATH.
pub const TUNNEL_HELPER: &str = "proxytunnel";

/// How long the helper needs to finish its CONNECT handshake before the
/// forward is usable.
const ESTABLISH_DELAY: Duration = Duration::from_millis(500);

const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A live TCP forward into a sandbox.
#[async_trait]
pub trait Tunnel: Send + Sync {
    fn local_port(&self) -> u16;
    fn remote_port(&self) -> u16;
    /// True once the underlying forwarder is known to have died.
    fn has_exited(&mut self) -> bool;
    async fn close(self: Box<Self>);
}

/// Opens tunnels for a sandbox. The one seam the controller needs around the
/// helper subprocess.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(&self, public_id: &PublicId, remote_port: u16) -> AppResult<Box<dyn Tunnel>>;
}

/// Supervised helper child forwarding `localhost:local_port` to
/// `localhost:remote_port` inside the sandbox.
pub struct TunnelHandle {
    local_port: u16,
    remote_port: u16,
    child: Child,
}

impl TunnelHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl Tunnel for TunnelHandle {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn remote_port(&self) -> u16 {
        self.remote_port
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn close(mut self: Box<Self>) {
        if let Some(pid) = self.child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(local_port = self.local_port, ?status, "tunnel helper exited");
            }
            _ => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                tracing::debug!(local_port = self.local_port, "tunnel helper force-killed");
            }
        }
    }
}

/// Prefer exposing the sandbox port on the same local port; fall back to any
/// free ephemeral port when it is taken. Collisions are never an error.
pub fn select_local_port(preferred: u16) -> AppResult<u16> {
    if std::net::TcpListener::bind(("127.0.0.1", preferred)).is_ok() {
        return Ok(preferred);
    }
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn helper_on_path() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(TUNNEL_HELPER))
        .find(|candidate| candidate.is_file())
}

/// Spawn the helper for one forward. Fatal for this operation when the helper
/// binary is missing; the session itself is unaffected.
pub async fn open_tunnel(
    config: &Config,
    public_id: &PublicId,
    remote_port: u16,
) -> AppResult<TunnelHandle> {
    let helper = helper_on_path().ok_or_else(|| {
        AppError::Config(format!(
            "`{TUNNEL_HELPER}` was not found on PATH; it is required for port forwarding"
        ))
    })?;
    let local_port = select_local_port(remote_port)?;
    let credential = format!("{public_id}@{remote_port}:{}", config.api_key);

    let mut child = Command::new(helper)
        .arg("-E")
        .arg("-p")
        .arg(&config.proxy_addr)
        .arg("-P")
        .arg(&credential)
        .arg("-d")
        .arg(format!("localhost:{remote_port}"))
        .arg("-a")
        .arg(local_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| AppError::ChildProcess {
            binary: TUNNEL_HELPER.to_string(),
            stderr: err.to_string(),
        })?;

    tokio::time::sleep(ESTABLISH_DELAY).await;
    if let Ok(Some(status)) = child.try_wait() {
        return Err(AppError::ChildProcess {
            binary: TUNNEL_HELPER.to_string(),
            stderr: format!("exited during startup: {status}"),
        });
    }

    tracing::info!(%public_id, local_port, remote_port, "tunnel established");
    Ok(TunnelHandle {
        local_port,
        remote_port,
        child,
    })
}

/// The ProxyCommand line for an SSH Host block routed through the same
/// CONNECT proxy, authenticated as the job group.
pub fn ssh_proxy_command(config: &Config, principal: &str, remote_port: u16) -> String {
    format!(
        "{TUNNEL_HELPER} -E -p {} -P {principal}@{remote_port}:{} -d localhost:{remote_port}",
        config.proxy_addr, config.api_key
    )
}

/// Run `f` against a short-lived tunnel, closing it on every exit path. The
/// helper child carries `kill_on_drop`, so cancellation and panics cannot
/// leak it either.
pub async fn with_tunnel<T, F, Fut>(
    config: &Config,
    public_id: &PublicId,
    remote_port: u16,
    f: F,
) -> AppResult<T>
where
    F: FnOnce(u16) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let handle = open_tunnel(config, public_id, remote_port).await?;
    let local_port = handle.local_port;
    let result = f(local_port).await;
    Box::new(handle).close().await;
    result
}

/// Real opener backed by the helper subprocess.
pub struct HelperTunnelOpener {
    config: Config,
}

impl HelperTunnelOpener {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TunnelOpener for HelperTunnelOpener {
    async fn open(&self, public_id: &PublicId, remote_port: u16) -> AppResult<Box<dyn Tunnel>> {
        let handle = open_tunnel(&self.config, public_id, remote_port).await?;
        Ok(Box::new(handle))
    }
}

pub mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{select_local_port, Tunnel, TunnelOpener};
    use crate::error::AppResult;
    use crate::rpc::PublicId;

    /// In-memory tunnel that only tracks its ports and close count.
    pub struct FakeTunnel {
        local_port: u16,
        remote_port: u16,
        closed: Arc<AtomicUsize>,
        exited: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        fn local_port(&self) -> u16 {
            self.local_port
        }

        fn remote_port(&self) -> u16 {
            self.remote_port
        }

        fn has_exited(&mut self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        async fn close(self: Box<Self>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Opener that allocates real local ports but spawns nothing.
    #[derive(Default)]
    pub struct FakeTunnelOpener {
        closed: Arc<AtomicUsize>,
        opened: AtomicUsize,
        exited: Arc<AtomicBool>,
    }

    impl FakeTunnelOpener {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        /// Simulate every spawned helper crashing.
        pub fn mark_all_exited(&self) {
            self.exited.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TunnelOpener for FakeTunnelOpener {
        async fn open(&self, _public_id: &PublicId, remote_port: u16) -> AppResult<Box<dyn Tunnel>> {
            let local_port = select_local_port(remote_port)?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeTunnel {
                local_port,
                remote_port,
                closed: self.closed.clone(),
                exited: self.exited.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_port_is_used_when_free() {
        // Grab an ephemeral port, free it, then ask for it by number.
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind probe");
        let port = probe.local_addr().expect("addr").port();
        drop(probe);

        assert_eq!(select_local_port(port).expect("select"), port);
    }

    #[test]
    fn bound_port_falls_back_to_ephemeral() {
        let blocker = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind blocker");
        let taken = blocker.local_addr().expect("addr").port();

        let chosen = select_local_port(taken).expect("select");
        assert_ne!(chosen, taken);
    }

    #[test]
    fn proxy_command_carries_principal_and_port() {
        let config = Config {
            api_key: "tok".to_string(),
            api_base_url: "https://api.test".to_string(),
            hub_base_url: "https://hub.test".to_string(),
            proxy_addr: "proxy.test:9000".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            home_dir: std::env::temp_dir(),
            ssh_config_path: std::env::temp_dir().join("config"),
        };
        assert_eq!(
            ssh_proxy_command(&config, "jg-42", 22),
            "proxytunnel -E -p proxy.test:9000 -P jg-42@22:tok -d localhost:22"
        );
    }
}
