use std::time::Duration;

use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, MySqlConnection, PgConnection};

use crate::config::Config;
use crate::db_presets::{self, DbConfig, DbKind};
use crate::error::{AppError, AppResult};
use crate::http::ApiClient;
use crate::progress::ProgressSink;
use crate::rpc::{self, JobGroupId, PublicId};
use crate::tunnel;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

const PG_TRUNCATE_AUDIT: &str = "TRUNCATE TABLE public.audit_log RESTART IDENTITY CASCADE";
const MYSQL_DISABLE_FK: &str = "SET FOREIGN_KEY_CHECKS = 0";
const MYSQL_DELETE_AUDIT: &str = "DELETE FROM audit_log";
const MYSQL_RESTORE_FK: &str = "SET FOREIGN_KEY_CHECKS = 1";

/// Outcome of one audit cleanup pass. Zero cleared databases is not a
/// failure; the table may simply not exist on any of them.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub databases_cleared: usize,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Truncate the audit log of every database the service config names, over a
/// short-lived tunnel, then clear the remote env-state cache. Per-database
/// errors are tolerated; the cache clear is mandatory.
pub async fn clean_audit(
    api: &ApiClient,
    config: &Config,
    service: &str,
    public_id: &PublicId,
    job_group_id: &JobGroupId,
    db_config: Option<DbConfig>,
    sink: &dyn ProgressSink,
) -> AppResult<CleanupReport> {
    let db_config = db_presets::resolve(&config.custom_db_configs_path(), service, db_config)?
        .ok_or_else(|| {
            AppError::NeedsInput(format!(
                "no database credentials known for service `{service}`"
            ))
        })?;

    sink.progress(&format!(
        "Cleaning audit logs across {} database(s)",
        db_config.databases.len()
    ));

    let report = tunnel::with_tunnel(config, public_id, db_config.port, |local_port| {
        let db_config = db_config.clone();
        async move {
            let mut report = CleanupReport::default();
            for database in &db_config.databases {
                match clean_one(&db_config, local_port, database).await {
                    Ok(()) => report.databases_cleared += 1,
                    Err(err) => {
                        tracing::warn!(?err, %database, "audit cleanup failed; continuing");
                        report.errors.push(format!("{database}: {err}"));
                    }
                }
            }
            Ok(report)
        }
    })
    .await?;

    rpc::clear_env_state(api, job_group_id).await?;
    sink.progress(&format!(
        "Cleared audit logs in {} database(s)",
        report.databases_cleared
    ));
    Ok(report)
}

fn ping_timeout(database: &str) -> AppError {
    AppError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("ping of {database} timed out"),
    ))
}

async fn clean_one(db_config: &DbConfig, local_port: u16, database: &str) -> AppResult<()> {
    match db_config.kind {
        DbKind::Postgresql => {
            let options = PgConnectOptions::new()
                .host("127.0.0.1")
                .port(local_port)
                .username(&db_config.user)
                .password(&db_config.password)
                .database(database);
            let mut conn: PgConnection = options.connect().await?;
            tokio::time::timeout(PING_TIMEOUT, conn.ping())
                .await
                .map_err(|_| ping_timeout(database))??;
            sqlx::query(PG_TRUNCATE_AUDIT).execute(&mut conn).await?;
            conn.close().await?;
        }
        DbKind::Mysql => {
            let options = MySqlConnectOptions::new()
                .host("127.0.0.1")
                .port(local_port)
                .username(&db_config.user)
                .password(&db_config.password)
                .database(database);
            let mut conn: MySqlConnection = options.connect().await?;
            tokio::time::timeout(PING_TIMEOUT, conn.ping())
                .await
                .map_err(|_| ping_timeout(database))??;
            // The key checks must come back on even when the delete fails.
            sqlx::query(MYSQL_DISABLE_FK).execute(&mut conn).await?;
            let delete_result = sqlx::query(MYSQL_DELETE_AUDIT).execute(&mut conn).await;
            let restore_result = sqlx::query(MYSQL_RESTORE_FK).execute(&mut conn).await;
            conn.close().await?;
            delete_result?;
            restore_result?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_partial_only_with_errors() {
        let mut report = CleanupReport::default();
        assert!(!report.is_partial());
        report.databases_cleared = 2;
        assert!(!report.is_partial());
        report.errors.push("espocrm: relation missing".to_string());
        assert!(report.is_partial());
    }

    #[test]
    fn statements_match_engine_semantics() {
        assert!(PG_TRUNCATE_AUDIT.contains("RESTART IDENTITY CASCADE"));
        // MySQL deliberately deletes row-by-row under disabled key checks.
        assert!(MYSQL_DELETE_AUDIT.starts_with("DELETE FROM"));
        assert!(MYSQL_DISABLE_FK.ends_with("= 0"));
        assert!(MYSQL_RESTORE_FK.ends_with("= 1"));
    }
}
