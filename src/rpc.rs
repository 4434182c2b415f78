use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppResult;
use crate::http::{ApiClient, ApiTarget};

/// How long the best-effort terminate call may take before local cleanup
/// proceeds without it.
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifier of a sandbox VM. Distinct from [`JobGroupId`]; the two are
/// never interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicId(pub String);

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the job group behind a sandbox; addresses the heartbeat and
/// env-state endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGroupId(pub String);

impl fmt::Display for JobGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize)]
pub struct CreateSandboxRequest {
    pub dataset: String,
    pub plato_dataset_config: Value,
    pub wait_time: u64,
    pub alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxResponse {
    pub url: String,
    pub job_public_id: PublicId,
    pub job_group_id: JobGroupId,
    pub status: String,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
pub struct SetupSandboxRequest {
    pub dataset: String,
    pub plato_dataset_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CorrelatedResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartWorkerRequest {
    pub service: String,
    pub dataset: String,
    pub plato_dataset_config: Value,
    pub timeout: u64,
}

#[derive(Debug, Serialize)]
pub struct SnapshotRequest {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    pub artifact_id: String,
    pub status: String,
    #[serde(default)]
    pub git_hash: Option<String>,
    #[serde(default)]
    pub s3_uri: Option<String>,
}

pub async fn create_sandbox(
    api: &ApiClient,
    req: &CreateSandboxRequest,
) -> AppResult<CreateSandboxResponse> {
    let body = serde_json::to_value(req)?;
    api.request_json(
        ApiTarget::Api,
        Method::POST,
        "/public-build/vm/create",
        Some(&body),
    )
    .await
}

pub async fn setup_sandbox(
    api: &ApiClient,
    public_id: &PublicId,
    req: &SetupSandboxRequest,
) -> AppResult<CorrelatedResponse> {
    let body = serde_json::to_value(req)?;
    api.request_json(
        ApiTarget::Api,
        Method::POST,
        &format!("/public-build/vm/{public_id}/setup-sandbox"),
        Some(&body),
    )
    .await
}

pub async fn setup_root_access(
    api: &ApiClient,
    public_id: &PublicId,
    ssh_public_key: &str,
    timeout_secs: u64,
) -> AppResult<()> {
    let body = serde_json::json!({
        "ssh_public_key": ssh_public_key,
        "timeout": timeout_secs,
    });
    api.request_unit(
        ApiTarget::Api,
        Method::POST,
        &format!("/public-build/vm/{public_id}/setup-root-access"),
        Some(&body),
    )
    .await
}

pub async fn start_worker(
    api: &ApiClient,
    public_id: &PublicId,
    req: &StartWorkerRequest,
) -> AppResult<CorrelatedResponse> {
    let body = serde_json::to_value(req)?;
    api.request_json(
        ApiTarget::Api,
        Method::POST,
        &format!("/public-build/vm/{public_id}/start-worker"),
        Some(&body),
    )
    .await
}

/// Blocking snapshot RPC. The remote finishes the artifact before answering,
/// hence the explicit deadline rather than the client default.
pub async fn snapshot(
    api: &ApiClient,
    public_id: &PublicId,
    req: &SnapshotRequest,
) -> AppResult<SnapshotResponse> {
    let body = serde_json::to_value(req)?;
    let resp = api
        .send(
            ApiTarget::Api,
            Method::POST,
            &format!("/public-build/vm/{public_id}/snapshot"),
            Some(&body),
            Some(Duration::from_secs(30)),
        )
        .await?;
    Ok(resp.json().await?)
}

pub async fn delete_sandbox(api: &ApiClient, public_id: &PublicId) -> AppResult<()> {
    api.send(
        ApiTarget::Api,
        Method::DELETE,
        &format!("/public-build/vm/{public_id}"),
        None,
        Some(DELETE_TIMEOUT),
    )
    .await?;
    Ok(())
}

pub async fn heartbeat(api: &ApiClient, job_group_id: &JobGroupId) -> AppResult<()> {
    api.request_unit(
        ApiTarget::Api,
        Method::POST,
        &format!("/env/{job_group_id}/heartbeat"),
        None,
    )
    .await
}

/// Clears the remote's cached environment state. Mandatory before snapshots.
pub async fn clear_env_state(api: &ApiClient, job_group_id: &JobGroupId) -> AppResult<()> {
    api.request_unit(
        ApiTarget::Api,
        Method::GET,
        &format!("/env/{job_group_id}/state"),
        None,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_omits_absent_optionals() {
        let req = CreateSandboxRequest {
            dataset: "base".to_string(),
            plato_dataset_config: serde_json::json!({"cpus": 1}),
            wait_time: 1200,
            alias: "demo".to_string(),
            artifact_id: None,
            service: Some("espocrm".to_string()),
            sandbox_timeout: None,
        };
        let value = serde_json::to_value(&req).expect("serialize");
        assert!(value.get("artifact_id").is_none());
        assert!(value.get("sandbox_timeout").is_none());
        assert_eq!(value["service"], "espocrm");
    }

    #[test]
    fn snapshot_request_omits_missing_git_hash() {
        let req = SnapshotRequest {
            service: "espocrm".to_string(),
            dataset: Some("base".to_string()),
            git_hash: None,
        };
        let value = serde_json::to_value(&req).expect("serialize");
        assert!(value.get("git_hash").is_none());
    }

    #[test]
    fn create_response_requires_both_identifiers() {
        let missing_group = serde_json::json!({
            "url": "https://vm-42.plato.so",
            "job_public_id": "vm-42",
            "status": "pending",
            "correlation_id": "c1",
        });
        assert!(serde_json::from_value::<CreateSandboxResponse>(missing_group).is_err());
    }
}
