use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::rpc::{JobGroupId, PublicId};
use crate::tunnel::Tunnel;

/// Name of the on-disk session descriptor written into the working
/// directory, enabling later invocations to reattach.
pub const DESCRIPTOR_FILE: &str = ".plato-hub.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Provisioning,
    Provisioned,
    Configuring,
    Ready,
    Busy,
    Closing,
    Closed,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Provisioning => "provisioning",
            SessionState::Provisioned => "provisioned",
            SessionState::Configuring => "configuring",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed(_) => "failed",
        }
    }
}

/// Reference to an immutable snapshot artifact a session was created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub artifact_id: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOrigin {
    Blank,
    FromArtifact(ArtifactRef),
    AttachExisting,
}

/// One live sandbox. Owns its tunnels, its heartbeat registration and the
/// transient operation slot; nothing else may hold them.
pub struct Session {
    pub public_id: PublicId,
    pub job_group_id: JobGroupId,
    pub origin: SessionOrigin,
    pub alias: String,
    pub dataset: String,
    pub dataset_config: serde_json::Value,
    pub url: String,
    pub service: Option<String>,
    pub config_path: Option<PathBuf>,
    pub(crate) inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("public_id", &self.public_id)
            .field("job_group_id", &self.job_group_id)
            .field("origin", &self.origin)
            .field("alias", &self.alias)
            .field("dataset", &self.dataset)
            .field("url", &self.url)
            .field("service", &self.service)
            .field("config_path", &self.config_path)
            .finish()
    }
}

pub(crate) struct SessionInner {
    pub state: SessionState,
    pub tunnels: Vec<Box<dyn Tunnel>>,
    pub last_pushed_branch: Option<String>,
    /// Guards the single-operation invariant: one long-running operation at
    /// a time per session.
    pub operation_active: bool,
    pub ssh_host: Option<String>,
    pub ssh_private_key_path: Option<PathBuf>,
    pub ssh_public_key: Option<String>,
    pub root_ssh_enabled: bool,
    pub descriptor_dir: Option<PathBuf>,
}

impl SessionInner {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            tunnels: Vec::new(),
            last_pushed_branch: None,
            operation_active: false,
            ssh_host: None,
            ssh_private_key_path: None,
            ssh_public_key: None,
            root_ssh_enabled: false,
            descriptor_dir: None,
        }
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        public_id: PublicId,
        job_group_id: JobGroupId,
        origin: SessionOrigin,
        alias: String,
        dataset: String,
        dataset_config: serde_json::Value,
        url: String,
        service: Option<String>,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            public_id,
            job_group_id,
            origin,
            alias,
            dataset,
            dataset_config,
            url,
            service,
            config_path,
            inner: Mutex::new(SessionInner::new(SessionState::Provisioning)),
        }
    }

    /// Rebuild a session from a descriptor written by an earlier invocation.
    pub fn from_descriptor(descriptor: &SessionDescriptor, workdir: &Path) -> Self {
        let mut inner = SessionInner::new(SessionState::Ready);
        inner.ssh_host = descriptor.ssh_host.clone();
        inner.ssh_private_key_path = descriptor.ssh_private_key_path.clone().map(PathBuf::from);
        inner.descriptor_dir = Some(workdir.to_path_buf());
        let origin = match &descriptor.artifact_id {
            Some(artifact_id) => SessionOrigin::FromArtifact(ArtifactRef {
                artifact_id: artifact_id.clone(),
                version: descriptor.version.clone(),
            }),
            None => SessionOrigin::AttachExisting,
        };
        Self {
            public_id: PublicId(descriptor.public_id.clone()),
            job_group_id: JobGroupId(descriptor.job_group_id.clone()),
            origin,
            alias: descriptor.public_id.clone(),
            dataset: descriptor.dataset.clone(),
            dataset_config: serde_json::Value::Null,
            url: descriptor.url.clone(),
            service: descriptor.service.clone(),
            config_path: descriptor.config_path.clone().map(PathBuf::from),
            inner: Mutex::new(inner),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.lock().await;
        tracing::debug!(
            public_id = %self.public_id,
            from = inner.state.name(),
            to = state.name(),
            "session state transition"
        );
        inner.state = state;
    }

    pub async fn last_pushed_branch(&self) -> Option<String> {
        self.inner.lock().await.last_pushed_branch.clone()
    }

    pub async fn ssh_host(&self) -> Option<String> {
        self.inner.lock().await.ssh_host.clone()
    }

    pub async fn root_ssh_enabled(&self) -> bool {
        self.inner.lock().await.root_ssh_enabled
    }

    /// `(local_port, remote_port)` of every live forward.
    pub async fn tunnel_ports(&self) -> Vec<(u16, u16)> {
        self.inner
            .lock()
            .await
            .tunnels
            .iter()
            .map(|t| (t.local_port(), t.remote_port()))
            .collect()
    }

    pub(crate) async fn descriptor(&self, config: &Config) -> SessionDescriptor {
        let inner = self.inner.lock().await;
        let artifact = match &self.origin {
            SessionOrigin::FromArtifact(artifact) => Some(artifact.clone()),
            _ => None,
        };
        SessionDescriptor {
            public_id: self.public_id.0.clone(),
            job_group_id: self.job_group_id.0.clone(),
            url: self.url.clone(),
            dataset: self.dataset.clone(),
            config_path: self
                .config_path
                .as_ref()
                .map(|p| p.display().to_string()),
            artifact_id: artifact.as_ref().map(|a| a.artifact_id.clone()),
            version: artifact.and_then(|a| a.version),
            service: self.service.clone(),
            ssh_host: inner.ssh_host.clone(),
            ssh_config_path: Some(config.ssh_config_path.display().to_string()),
            ssh_private_key_path: inner
                .ssh_private_key_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

/// On-disk record of an active session. Written when the session first
/// reaches `Ready`, removed on close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub public_id: String,
    pub job_group_id: String,
    pub url: String,
    pub dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key_path: Option<String>,
}

impl SessionDescriptor {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(DESCRIPTOR_FILE)
    }

    pub fn load(dir: &Path) -> AppResult<Self> {
        let path = Self::path_in(dir);
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AppError::Config(format!("no session descriptor at {}", path.display()))
            } else {
                err.into()
            }
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write(&self, dir: &Path) -> AppResult<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path_in(dir), raw)?;
        Ok(())
    }

    /// Removing an already-absent descriptor is fine.
    pub fn remove(dir: &Path) -> AppResult<()> {
        match std::fs::remove_file(Self::path_in(dir)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
