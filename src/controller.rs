use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::Config;
use crate::db_cleanup::{self, CleanupReport};
use crate::db_presets::DbConfig;
use crate::error::{AppError, AppResult};
use crate::events;
use crate::git_workspace::{self, PushedWorkspace};
use crate::heartbeat::HeartbeatScheduler;
use crate::http::ApiClient;
use crate::progress::{ElapsedSink, ProgressSink};
use crate::rpc::{
    self, CreateSandboxRequest, JobGroupId, PublicId, SetupSandboxRequest, SnapshotRequest,
    SnapshotResponse, StartWorkerRequest,
};
use crate::session::{
    ArtifactRef, Session, SessionDescriptor, SessionOrigin, SessionState,
};
use crate::ssh_config::{HostBlock, SshConfigStore};
use crate::ssh_keys;
use crate::tunnel::{self, HelperTunnelOpener, TunnelOpener};

const PROVISION_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const SETUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const WORKER_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const ROOT_ACCESS_TIMEOUT_SECS: u64 = 300;
const SSH_PORT: u16 = 22;
const SSH_HOST_BASE: &str = "sandbox";
const DEFAULT_SSH_USER: &str = "plato";

/// Process-wide owner of every live session. The entry point holds this and
/// drives `SandboxController::shutdown` from its exit hook, so no sandbox or
/// tunnel outlives the process unnoticed.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// A `public_id` maps to exactly one session per process lifetime.
    pub fn register(&self, session: Arc<Session>) -> AppResult<()> {
        let key = session.public_id.0.clone();
        let entry = self.sessions.entry(key);
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AppError::Concurrency(format!(
                "a session for sandbox {} already exists",
                session.public_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, public_id: &PublicId) -> Option<Arc<Session>> {
        self.sessions.get(&public_id.0).map(|e| e.value().clone())
    }

    pub fn remove(&self, public_id: &PublicId) {
        self.sessions.remove(&public_id.0);
    }

    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Seam around the audit-cleanup worker so lifecycle tests can observe its
/// ordering without a live database.
#[async_trait]
pub trait AuditCleaner: Send + Sync {
    async fn clean_audit(
        &self,
        service: &str,
        public_id: &PublicId,
        job_group_id: &JobGroupId,
        db_config: Option<DbConfig>,
        sink: &dyn ProgressSink,
    ) -> AppResult<CleanupReport>;
}

pub struct DbAuditCleaner {
    api: ApiClient,
    config: Config,
}

#[async_trait]
impl AuditCleaner for DbAuditCleaner {
    async fn clean_audit(
        &self,
        service: &str,
        public_id: &PublicId,
        job_group_id: &JobGroupId,
        db_config: Option<DbConfig>,
        sink: &dyn ProgressSink,
    ) -> AppResult<CleanupReport> {
        db_cleanup::clean_audit(
            &self.api,
            &self.config,
            service,
            public_id,
            job_group_id,
            db_config,
            sink,
        )
        .await
    }
}

/// Seam around the git workspace worker.
#[async_trait]
pub trait WorkspacePublisher: Send + Sync {
    async fn push_workspace(&self, service: &str, source_dir: &Path)
        -> AppResult<PushedWorkspace>;
    async fn merge_to_main(&self, service: &str, branch: &str) -> AppResult<String>;
}

pub struct HubWorkspacePublisher {
    api: ApiClient,
}

#[async_trait]
impl WorkspacePublisher for HubWorkspacePublisher {
    async fn push_workspace(
        &self,
        service: &str,
        source_dir: &Path,
    ) -> AppResult<PushedWorkspace> {
        git_workspace::push_workspace(&self.api, service, source_dir).await
    }

    async fn merge_to_main(&self, service: &str, branch: &str) -> AppResult<String> {
        git_workspace::merge_to_main(&self.api, service, branch).await
    }
}

/// Intent to bring a sandbox up, blank or from an artifact.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub alias: String,
    pub dataset: String,
    pub dataset_config: serde_json::Value,
    pub config_path: Option<PathBuf>,
    pub service: Option<String>,
    pub artifact: Option<ArtifactRef>,
    pub sandbox_timeout: Option<u64>,
    /// Where the session descriptor lands once the session is ready.
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub service: Option<String>,
    pub dataset: Option<String>,
    pub db_config: Option<DbConfig>,
}

/// Diagnostics from a close. Closing never throws; whatever went wrong on
/// the way down is collected here.
#[derive(Debug, Default)]
pub struct CloseReport {
    pub errors: Vec<String>,
}

/// Drives the sandbox session state machine: provisioning over SSE,
/// heartbeats, tunnels, hub pushes, the cleanup→merge→snapshot pipeline and
/// teardown.
pub struct SandboxController {
    api: ApiClient,
    config: Config,
    registry: Arc<SessionRegistry>,
    ssh: Arc<SshConfigStore>,
    heartbeats: HeartbeatScheduler,
    tunnels: Arc<dyn TunnelOpener>,
    cleaner: Arc<dyn AuditCleaner>,
    publisher: Arc<dyn WorkspacePublisher>,
}

impl SandboxController {
    /// Production wiring: real tunnel helper, real databases, real git.
    pub fn from_config(config: Config) -> Self {
        let api = ApiClient::new(&config);
        let registry = Arc::new(SessionRegistry::new());
        let ssh = Arc::new(SshConfigStore::new(config.ssh_config_path.clone()));
        let tunnels: Arc<dyn TunnelOpener> = Arc::new(HelperTunnelOpener::new(config.clone()));
        let cleaner: Arc<dyn AuditCleaner> = Arc::new(DbAuditCleaner {
            api: api.clone(),
            config: config.clone(),
        });
        let publisher: Arc<dyn WorkspacePublisher> =
            Arc::new(HubWorkspacePublisher { api: api.clone() });
        Self::new(api, config, registry, ssh, tunnels, cleaner, publisher)
    }

    pub fn new(
        api: ApiClient,
        config: Config,
        registry: Arc<SessionRegistry>,
        ssh: Arc<SshConfigStore>,
        tunnels: Arc<dyn TunnelOpener>,
        cleaner: Arc<dyn AuditCleaner>,
        publisher: Arc<dyn WorkspacePublisher>,
    ) -> Self {
        let heartbeats = HeartbeatScheduler::new(api.clone(), config.heartbeat_interval);
        Self {
            api,
            config,
            registry,
            ssh,
            heartbeats,
            tunnels,
            cleaner,
            publisher,
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn heartbeat_running(&self, job_group_id: &JobGroupId) -> bool {
        self.heartbeats.is_running(job_group_id)
    }

    /// Create a sandbox and drive it to `Ready`. On failure the session ends
    /// `Failed` with its heartbeat stopped and SSH alias removed; the remote
    /// VM is left for the operator to inspect or delete.
    pub async fn create(
        &self,
        opts: CreateOptions,
        sink: &dyn ProgressSink,
    ) -> AppResult<Arc<Session>> {
        let stamped = ElapsedSink::new(sink);
        let origin = match &opts.artifact {
            Some(artifact) => SessionOrigin::FromArtifact(artifact.clone()),
            None => SessionOrigin::Blank,
        };

        stamped.progress("Requesting sandbox");
        let request = CreateSandboxRequest {
            dataset: opts.dataset.clone(),
            plato_dataset_config: opts.dataset_config.clone(),
            wait_time: PROVISION_TIMEOUT.as_secs(),
            alias: opts.alias.clone(),
            artifact_id: opts.artifact.as_ref().map(|a| a.artifact_id.clone()),
            service: opts.service.clone(),
            sandbox_timeout: opts.sandbox_timeout,
        };
        let created = rpc::create_sandbox(&self.api, &request).await?;
        tracing::info!(
            public_id = %created.job_public_id,
            job_group_id = %created.job_group_id,
            "sandbox requested"
        );

        let session = Arc::new(Session::new(
            created.job_public_id,
            created.job_group_id,
            origin,
            opts.alias.clone(),
            opts.dataset.clone(),
            opts.dataset_config.clone(),
            created.url,
            opts.service.clone(),
            opts.config_path.clone(),
        ));
        self.registry.register(session.clone())?;

        if let Err(err) =
            events::follow_operation(&self.api, &created.correlation_id, PROVISION_TIMEOUT, &stamped)
                .await
        {
            self.fail_session(&session, &err).await;
            return Err(err);
        }
        session.set_state(SessionState::Provisioned).await;
        self.heartbeats.start(session.job_group_id.clone());
        stamped.progress("Sandbox provisioned");

        if let Err(err) = self.configure(&session, &opts, &stamped).await {
            self.fail_session(&session, &err).await;
            return Err(err);
        }
        Ok(session)
    }

    /// SSH alias + key install, then (for blank sandboxes) the remote setup
    /// pass. Ends with the session `Ready` and its descriptor on disk.
    async fn configure(
        &self,
        session: &Arc<Session>,
        opts: &CreateOptions,
        sink: &dyn ProgressSink,
    ) -> AppResult<()> {
        let keypair = ssh_keys::ensure_keypair(&self.config.ssh_key_dir()).await?;
        let host = self.ssh.alloc_hostname(SSH_HOST_BASE)?;
        let block = HostBlock {
            name: host.clone(),
            port: SSH_PORT,
            user: DEFAULT_SSH_USER.to_string(),
            identity_file: Some(keypair.private_key_path.clone()),
            proxy_command: tunnel::ssh_proxy_command(
                &self.config,
                &session.job_group_id.0,
                SSH_PORT,
            ),
        };
        self.ssh.append_host(&block)?;
        {
            let mut inner = session.inner.lock().await;
            inner.ssh_host = Some(host.clone());
            inner.ssh_private_key_path = Some(keypair.private_key_path.clone());
            inner.ssh_public_key = Some(keypair.public_key.clone());
        }
        sink.progress(&format!("SSH alias `{host}` configured"));

        if matches!(session.origin, SessionOrigin::Blank) {
            session.set_state(SessionState::Configuring).await;
            sink.progress("Configuring sandbox");
            let setup = rpc::setup_sandbox(
                &self.api,
                &session.public_id,
                &SetupSandboxRequest {
                    dataset: session.dataset.clone(),
                    plato_dataset_config: session.dataset_config.clone(),
                    ssh_public_key: Some(keypair.public_key),
                },
            )
            .await?;
            events::follow_operation(&self.api, &setup.correlation_id, SETUP_TIMEOUT, sink).await?;
        }

        session.set_state(SessionState::Ready).await;
        let descriptor = session.descriptor(&self.config).await;
        descriptor.write(&opts.workdir)?;
        session.inner.lock().await.descriptor_dir = Some(opts.workdir.clone());
        sink.progress("Sandbox ready");
        Ok(())
    }

    async fn fail_session(&self, session: &Arc<Session>, err: &AppError) {
        tracing::error!(?err, public_id = %session.public_id, "session failed");
        self.heartbeats.stop(&session.job_group_id).await;
        let host = session.inner.lock().await.ssh_host.take();
        if let Some(host) = host {
            if let Err(remove_err) = self.ssh.remove_host(&host) {
                tracing::warn!(?remove_err, %host, "failed to remove ssh alias of failed session");
            }
        }
        // The VM itself is left running: a failed provisioning may still be
        // worth inspecting, and deletion is the operator's call.
        session.set_state(SessionState::Failed(err.to_string())).await;
    }

    /// Reattach to the sandbox recorded in `workdir`'s descriptor.
    pub async fn attach(&self, workdir: &Path) -> AppResult<Arc<Session>> {
        let descriptor = SessionDescriptor::load(workdir)?;
        let session = Arc::new(Session::from_descriptor(&descriptor, workdir));
        self.registry.register(session.clone())?;
        self.heartbeats.start(session.job_group_id.clone());
        tracing::info!(public_id = %session.public_id, "reattached to sandbox");
        Ok(session)
    }

    /// Forward a sandbox port to the local machine. Returns
    /// `(local_port, remote_port)`.
    pub async fn open_tunnel(
        &self,
        session: &Arc<Session>,
        remote_port: u16,
    ) -> AppResult<(u16, u16)> {
        {
            let inner = session.inner.lock().await;
            if inner.state != SessionState::Ready {
                return Err(AppError::Concurrency(format!(
                    "cannot open a tunnel while the session is {}",
                    inner.state.name()
                )));
            }
        }
        let handle = self.tunnels.open(&session.public_id, remote_port).await?;
        let ports = (handle.local_port(), handle.remote_port());

        let mut inner = session.inner.lock().await;
        if inner.state.is_terminal() {
            drop(inner);
            handle.close().await;
            return Err(AppError::Concurrency(
                "session closed while the tunnel was opening".to_string(),
            ));
        }
        inner.tunnels.push(handle);
        tracing::info!(
            public_id = %session.public_id,
            local_port = ports.0,
            remote_port = ports.1,
            "tunnel added to session"
        );
        Ok(ports)
    }

    /// Drop forwards whose helper has died. A crashed child costs the
    /// forward, never the session; the reaped ports are returned so callers
    /// can tell the user.
    pub async fn reap_dead_tunnels(&self, session: &Arc<Session>) -> Vec<u16> {
        let dead: Vec<_> = {
            let mut inner = session.inner.lock().await;
            let mut dead = Vec::new();
            let mut idx = 0;
            while idx < inner.tunnels.len() {
                if inner.tunnels[idx].has_exited() {
                    dead.push(inner.tunnels.remove(idx));
                } else {
                    idx += 1;
                }
            }
            dead
        };
        let mut ports = Vec::new();
        for handle in dead {
            let local_port = handle.local_port();
            tracing::warn!(
                public_id = %session.public_id,
                local_port,
                "tunnel helper exited; forward is gone"
            );
            handle.close().await;
            ports.push(local_port);
        }
        ports
    }

    pub async fn close_tunnel(&self, session: &Arc<Session>, local_port: u16) -> AppResult<()> {
        let handle = {
            let mut inner = session.inner.lock().await;
            let idx = inner
                .tunnels
                .iter()
                .position(|t| t.local_port() == local_port)
                .ok_or_else(|| {
                    AppError::Config(format!("no tunnel is listening on local port {local_port}"))
                })?;
            inner.tunnels.remove(idx)
        };
        handle.close().await;
        Ok(())
    }

    /// Mirror the working copy onto a fresh hub branch. Records the branch
    /// for the next snapshot.
    pub async fn push_to_hub(
        &self,
        session: &Arc<Session>,
        source_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> AppResult<PushedWorkspace> {
        let service = self.require_service(session, None)?;
        self.begin_busy(session, "push the workspace").await?;
        sink.progress(&format!("Pushing workspace to the {service} hub repository"));

        let result = self.publisher.push_workspace(&service, source_dir).await;
        match result {
            Ok(pushed) => {
                {
                    let mut inner = session.inner.lock().await;
                    inner.last_pushed_branch = Some(pushed.branch.clone());
                }
                self.end_busy(session).await;
                sink.progress(&format!("Pushed branch {}", pushed.branch));
                Ok(pushed)
            }
            Err(err) => {
                self.end_busy(session).await;
                Err(err)
            }
        }
    }

    /// Freeze the sandbox into a versioned artifact. Strict order: audit
    /// cleanup and env-state clear, then the pending branch merge (if any),
    /// then the snapshot RPC.
    pub async fn snapshot(
        &self,
        session: &Arc<Session>,
        opts: SnapshotOptions,
        sink: &dyn ProgressSink,
    ) -> AppResult<SnapshotResponse> {
        let service = self.require_service(session, opts.service.as_deref())?;
        let dataset = opts.dataset.unwrap_or_else(|| session.dataset.clone());

        self.begin_busy(session, "snapshot").await?;
        let result = self
            .run_snapshot(session, &service, &dataset, opts.db_config, sink)
            .await;
        self.end_busy(session).await;
        result
    }

    async fn run_snapshot(
        &self,
        session: &Arc<Session>,
        service: &str,
        dataset: &str,
        db_config: Option<DbConfig>,
        sink: &dyn ProgressSink,
    ) -> AppResult<SnapshotResponse> {
        let report = self
            .cleaner
            .clean_audit(
                service,
                &session.public_id,
                &session.job_group_id,
                db_config,
                sink,
            )
            .await?;
        if report.is_partial() {
            tracing::warn!(
                errors = ?report.errors,
                public_id = %session.public_id,
                "audit cleanup partially failed; continuing"
            );
        }

        let branch = session.last_pushed_branch().await;
        let git_hash = match branch {
            Some(branch) => {
                sink.progress(&format!("Merging {branch} into main"));
                Some(self.publisher.merge_to_main(service, &branch).await?)
            }
            None => None,
        };

        sink.progress("Creating snapshot artifact");
        let response = rpc::snapshot(
            &self.api,
            &session.public_id,
            &SnapshotRequest {
                service: service.to_string(),
                dataset: Some(dataset.to_string()),
                git_hash,
            },
        )
        .await?;

        session.inner.lock().await.last_pushed_branch = None;
        sink.progress(&format!("Snapshot artifact {} created", response.artifact_id));
        Ok(response)
    }

    /// Kick the in-VM worker and its listeners, following the operation to
    /// completion.
    pub async fn start_worker(
        &self,
        session: &Arc<Session>,
        sink: &dyn ProgressSink,
    ) -> AppResult<()> {
        let service = self.require_service(session, None)?;
        self.begin_busy(session, "start the worker").await?;

        let result = async {
            let started = rpc::start_worker(
                &self.api,
                &session.public_id,
                &StartWorkerRequest {
                    service,
                    dataset: session.dataset.clone(),
                    plato_dataset_config: session.dataset_config.clone(),
                    timeout: WORKER_TIMEOUT.as_secs(),
                },
            )
            .await?;
            events::follow_operation(&self.api, &started.correlation_id, WORKER_TIMEOUT, sink).await
        }
        .await;

        self.end_busy(session).await;
        result
    }

    /// Install the session key for root and point the SSH alias at the root
    /// user. Never done automatically.
    pub async fn enable_root_access(&self, session: &Arc<Session>) -> AppResult<()> {
        let (host, public_key) = {
            let inner = session.inner.lock().await;
            let host = inner.ssh_host.clone().ok_or_else(|| {
                AppError::Config("session has no SSH alias configured".to_string())
            })?;
            let public_key = inner.ssh_public_key.clone().ok_or_else(|| {
                AppError::Config("session has no SSH public key available".to_string())
            })?;
            (host, public_key)
        };
        rpc::setup_root_access(&self.api, &session.public_id, &public_key, ROOT_ACCESS_TIMEOUT_SECS)
            .await?;
        self.ssh.set_user(&host, "root")?;
        session.inner.lock().await.root_ssh_enabled = true;
        tracing::info!(public_id = %session.public_id, %host, "root ssh access enabled");
        Ok(())
    }

    /// Record an in-VM password in the SSH alias so interactive logins work.
    pub async fn enable_password(&self, session: &Arc<Session>, password: &str) -> AppResult<()> {
        let host = session.ssh_host().await.ok_or_else(|| {
            AppError::Config("session has no SSH alias configured".to_string())
        })?;
        self.ssh.enable_password(&host, password)
    }

    /// Tear the session down: heartbeat, tunnels, SSH alias, best-effort
    /// remote delete, descriptor. Always completes locally.
    pub async fn close(&self, session: &Arc<Session>) -> CloseReport {
        let mut report = CloseReport::default();
        {
            let mut inner = session.inner.lock().await;
            if inner.state == SessionState::Closed {
                return report;
            }
            inner.state = SessionState::Closing;
        }
        tracing::info!(public_id = %session.public_id, "closing session");

        self.heartbeats.stop(&session.job_group_id).await;

        let tunnels: Vec<_> = {
            let mut inner = session.inner.lock().await;
            inner.tunnels.drain(..).collect()
        };
        for handle in tunnels {
            let local_port = handle.local_port();
            handle.close().await;
            tracing::debug!(local_port, "tunnel released");
        }

        let (host, descriptor_dir) = {
            let mut inner = session.inner.lock().await;
            (inner.ssh_host.take(), inner.descriptor_dir.take())
        };
        if let Some(host) = host {
            if let Err(err) = self.ssh.remove_host(&host) {
                tracing::warn!(?err, %host, "failed to remove ssh alias");
                report.errors.push(format!("ssh alias {host}: {err}"));
            }
        }

        if let Err(err) = rpc::delete_sandbox(&self.api, &session.public_id).await {
            tracing::warn!(?err, public_id = %session.public_id, "remote delete failed; continuing local cleanup");
            report.errors.push(format!("remote delete: {err}"));
        }

        if let Some(dir) = descriptor_dir {
            if let Err(err) = SessionDescriptor::remove(&dir) {
                tracing::warn!(?err, "failed to remove session descriptor");
                report.errors.push(format!("descriptor: {err}"));
            }
        }

        session.set_state(SessionState::Closed).await;
        self.registry.remove(&session.public_id);
        report
    }

    /// Close every registered session. Wired to the process exit hook.
    pub async fn shutdown(&self) {
        for session in self.registry.all() {
            let report = self.close(&session).await;
            if !report.errors.is_empty() {
                tracing::warn!(
                    public_id = %session.public_id,
                    errors = ?report.errors,
                    "session closed with errors"
                );
            }
        }
    }

    fn require_service(
        &self,
        session: &Arc<Session>,
        override_service: Option<&str>,
    ) -> AppResult<String> {
        override_service
            .map(str::to_string)
            .or_else(|| session.service.clone())
            .ok_or_else(|| {
                AppError::NeedsInput(
                    "a service name is required; none is recorded for this session".to_string(),
                )
            })
    }

    /// Claim the session's single operation slot, Ready → Busy.
    async fn begin_busy(&self, session: &Arc<Session>, what: &str) -> AppResult<()> {
        let mut inner = session.inner.lock().await;
        if inner.operation_active || inner.state != SessionState::Ready {
            return Err(AppError::Concurrency(format!(
                "cannot {what} while the session is {}",
                inner.state.name()
            )));
        }
        inner.state = SessionState::Busy;
        inner.operation_active = true;
        Ok(())
    }

    async fn end_busy(&self, session: &Arc<Session>) {
        let mut inner = session.inner.lock().await;
        inner.operation_active = false;
        if inner.state == SessionState::Busy {
            inner.state = SessionState::Ready;
        }
    }
}

pub mod testing {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{AuditCleaner, WorkspacePublisher};
    use crate::db_cleanup::CleanupReport;
    use crate::db_presets::DbConfig;
    use crate::error::{AppError, AppResult};
    use crate::git_workspace::PushedWorkspace;
    use crate::progress::ProgressSink;
    use crate::rpc::{JobGroupId, PublicId};

    /// Shared, ordered record of worker invocations for ordering assertions.
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub fn call_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Cleaner fake: records the call, optionally failing instead.
    pub struct RecordingCleaner {
        pub log: CallLog,
        pub needs_input: bool,
        pub fail: Option<String>,
    }

    impl RecordingCleaner {
        pub fn ok(log: CallLog) -> Self {
            Self {
                log,
                needs_input: false,
                fail: None,
            }
        }
    }

    #[async_trait]
    impl AuditCleaner for RecordingCleaner {
        async fn clean_audit(
            &self,
            service: &str,
            _public_id: &PublicId,
            _job_group_id: &JobGroupId,
            _db_config: Option<DbConfig>,
            _sink: &dyn ProgressSink,
        ) -> AppResult<CleanupReport> {
            if self.needs_input {
                return Err(AppError::NeedsInput(format!(
                    "no database credentials known for service `{service}`"
                )));
            }
            if let Some(reason) = &self.fail {
                return Err(AppError::Stream(reason.clone()));
            }
            self.log.lock().expect("log lock").push(format!("clean:{service}"));
            Ok(CleanupReport {
                databases_cleared: 1,
                errors: Vec::new(),
            })
        }
    }

    /// Publisher fake: hands back configured branch/hash, records ordering,
    /// optionally dawdles so concurrency tests can overlap operations.
    pub struct RecordingPublisher {
        pub log: CallLog,
        pub branch: String,
        pub merge_hash: String,
        pub push_delay: Option<Duration>,
    }

    impl RecordingPublisher {
        pub fn new(log: CallLog, branch: &str, merge_hash: &str) -> Self {
            Self {
                log,
                branch: branch.to_string(),
                merge_hash: merge_hash.to_string(),
                push_delay: None,
            }
        }
    }

    #[async_trait]
    impl WorkspacePublisher for RecordingPublisher {
        async fn push_workspace(
            &self,
            service: &str,
            _source_dir: &Path,
        ) -> AppResult<PushedWorkspace> {
            if let Some(delay) = self.push_delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().expect("log lock").push(format!("push:{service}"));
            Ok(PushedWorkspace {
                branch: self.branch.clone(),
                clone_url: format!("https://hub.test/{service}.git"),
            })
        }

        async fn merge_to_main(&self, service: &str, branch: &str) -> AppResult<String> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("merge:{service}:{branch}"));
            Ok(self.merge_hash.clone())
        }
    }
}
