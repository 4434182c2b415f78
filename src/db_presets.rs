use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Postgresql,
    Mysql,
}

/// Database credentials and targets for one catalogued service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub kind: DbKind,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub databases: Vec<String>,
}

fn preset(kind: DbKind, user: &str, password: &str, port: u16, databases: &[&str]) -> DbConfig {
    DbConfig {
        kind,
        user: user.to_string(),
        password: password.to_string(),
        port,
        databases: databases.iter().map(|d| d.to_string()).collect(),
    }
}

/// Built-in credentials for the stacks the catalog ships. The overlay file
/// takes precedence over every entry here.
static PRESETS: Lazy<HashMap<&'static str, DbConfig>> = Lazy::new(|| {
    HashMap::from([
        (
            "espocrm",
            preset(DbKind::Postgresql, "postgres", "postgres", 5432, &["postgres", "espocrm"]),
        ),
        (
            "mattermost",
            preset(DbKind::Postgresql, "mmuser", "mostest", 5432, &["mattermost"]),
        ),
        (
            "taiga",
            preset(DbKind::Postgresql, "taiga", "taiga", 5432, &["taiga"]),
        ),
        (
            "suitecrm",
            preset(DbKind::Mysql, "root", "root", 3306, &["suitecrm"]),
        ),
        (
            "roundcube",
            preset(DbKind::Mysql, "roundcube", "roundcube", 3306, &["roundcubemail"]),
        ),
        (
            "bookstack",
            preset(DbKind::Mysql, "bookstack", "secret", 3306, &["bookstack"]),
        ),
    ])
});

pub fn preset_for(service: &str) -> Option<DbConfig> {
    PRESETS.get(service.to_ascii_lowercase().as_str()).cloned()
}

/// Load the user's overlay document. A missing file is an empty overlay.
pub fn load_custom_configs(path: &Path) -> AppResult<HashMap<String, DbConfig>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err.into()),
    }
}

/// Resolve credentials for a service: overlay file beats preset beats
/// whatever the caller supplied. `None` means the caller must collect a
/// config before any cleanup can run.
pub fn resolve(
    overlay_path: &Path,
    service: &str,
    caller_provided: Option<DbConfig>,
) -> AppResult<Option<DbConfig>> {
    let overlays = load_custom_configs(overlay_path)?;
    if let Some(found) = overlays
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(service))
    {
        return Ok(Some(found.1.clone()));
    }
    if let Some(found) = preset_for(service) {
        return Ok(Some(found));
    }
    Ok(caller_provided)
}
