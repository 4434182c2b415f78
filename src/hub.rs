use reqwest::Method;
use serde::Deserialize;

use crate::error::AppResult;
use crate::http::{ApiClient, ApiTarget};

#[derive(Debug, Clone, Deserialize)]
pub struct Simulator {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub has_repo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorRepo {
    pub clone_url: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubCredentials {
    pub username: String,
    pub password: String,
    pub org: String,
}

pub async fn list_simulators(api: &ApiClient) -> AppResult<Vec<Simulator>> {
    api.request_json(ApiTarget::Hub, Method::GET, "/gitea/simulators", None)
        .await
}

/// Case-insensitive catalog lookup by service name.
pub async fn find_simulator(api: &ApiClient, service: &str) -> AppResult<Option<Simulator>> {
    let simulators = list_simulators(api).await?;
    Ok(simulators
        .into_iter()
        .find(|sim| sim.name.eq_ignore_ascii_case(service)))
}

pub async fn get_simulator_repo(api: &ApiClient, id: &str) -> AppResult<SimulatorRepo> {
    api.request_json(
        ApiTarget::Hub,
        Method::GET,
        &format!("/gitea/simulators/{id}/repo"),
        None,
    )
    .await
}

pub async fn create_simulator_repo(api: &ApiClient, id: &str) -> AppResult<SimulatorRepo> {
    api.request_json(
        ApiTarget::Hub,
        Method::POST,
        &format!("/gitea/simulators/{id}/repo"),
        None,
    )
    .await
}

pub async fn get_credentials(api: &ApiClient) -> AppResult<HubCredentials> {
    api.request_json(ApiTarget::Hub, Method::GET, "/gitea/credentials", None)
        .await
}
