use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use url::Url;

use crate::error::{AppError, AppResult};
use crate::http::ApiClient;
use crate::hub;
use crate::session::DESCRIPTOR_FILE;

const SYNC_COMMIT_MESSAGE: &str = "Sync from local workspace";

/// Result of pushing the local working copy to the hub.
#[derive(Debug, Clone)]
pub struct PushedWorkspace {
    pub branch: String,
    /// Clone URL with hub credentials embedded as userinfo.
    pub clone_url: String,
}

async fn run_git(dir: &Path, args: &[&str]) -> AppResult<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|err| AppError::ChildProcess {
            binary: "git".to_string(),
            stderr: err.to_string(),
        })?;
    if !output.status.success() {
        return Err(AppError::ChildProcess {
            binary: "git".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolve the hub repository for a service, creating it on first use, and
/// return its clone URL with credentials embedded.
async fn credentialed_repo_url(api: &ApiClient, service: &str) -> AppResult<String> {
    let simulator = hub::find_simulator(api, service).await?.ok_or_else(|| {
        AppError::Config(format!("service `{service}` is not in the simulator catalog"))
    })?;
    let repo = if simulator.has_repo {
        hub::get_simulator_repo(api, &simulator.id).await?
    } else {
        hub::create_simulator_repo(api, &simulator.id).await?
    };
    let credentials = hub::get_credentials(api).await?;

    let mut url = Url::parse(&repo.clone_url)
        .map_err(|err| AppError::Config(format!("bad clone url `{}`: {err}", repo.clone_url)))?;
    url.set_username(&credentials.username)
        .map_err(|_| AppError::Config("clone url cannot carry credentials".to_string()))?;
    url.set_password(Some(&credentials.password))
        .map_err(|_| AppError::Config("clone url cannot carry credentials".to_string()))?;
    Ok(url.to_string())
}

pub fn workspace_branch_name(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("workspace-{}", now.timestamp())
}

/// Relative paths of every regular file under `source`, minus `.git*` entries
/// and the session descriptor. Gitignore filtering happens separately.
pub fn collect_workspace_files(source: &Path) -> AppResult<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> AppResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".git") || name == DESCRIPTOR_FILE {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(source, source, &mut files)?;
    files.sort();
    Ok(files)
}

/// Ask the native git tool which of `files` the source tree ignores. Exit
/// code 1 means "none"; anything beyond that means git cannot answer (for
/// instance, the dir is not a repository) and nothing is treated as ignored.
pub async fn ignored_files(source: &Path, files: &[PathBuf]) -> AppResult<HashSet<PathBuf>> {
    if files.is_empty() {
        return Ok(HashSet::new());
    }
    let mut child = Command::new("git")
        .args(["check-ignore", "--stdin"])
        .current_dir(source)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|err| AppError::ChildProcess {
            binary: "git".to_string(),
            stderr: err.to_string(),
        })?;

    let mut input = String::new();
    for file in files {
        input.push_str(&file.to_string_lossy());
        input.push('\n');
    }
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;

    match output.status.code() {
        Some(0) | Some(1) => Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(PathBuf::from)
            .collect()),
        _ => {
            tracing::debug!(
                source = %source.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git check-ignore unavailable; mirroring everything"
            );
            Ok(HashSet::new())
        }
    }
}

async fn mirror_workspace(source: &Path, dest: &Path) -> AppResult<usize> {
    let candidates = collect_workspace_files(source)?;
    let ignored = ignored_files(source, &candidates).await?;
    let mut copied = 0usize;
    for rel in candidates {
        if ignored.contains(&rel) {
            continue;
        }
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source.join(&rel), &target)?;
        copied += 1;
    }
    Ok(copied)
}

async fn clone_scratch(url: &str) -> AppResult<(tempfile::TempDir, PathBuf)> {
    let scratch = tempfile::tempdir()?;
    run_git(scratch.path(), &["clone", url, "repo"]).await?;
    let clone_dir = scratch.path().join("repo");
    run_git(&clone_dir, &["config", "user.name", "plato-sandbox"]).await?;
    run_git(&clone_dir, &["config", "user.email", "sandbox@plato.so"]).await?;
    Ok((scratch, clone_dir))
}

/// Mirror the local working copy onto a fresh timestamped branch of the
/// service's hub repository and push it. Returns early without committing
/// when the mirror produces no changes.
pub async fn push_workspace(
    api: &ApiClient,
    service: &str,
    source_dir: &Path,
) -> AppResult<PushedWorkspace> {
    let clone_url = credentialed_repo_url(api, service).await?;
    push_workspace_to(&clone_url, source_dir).await
}

/// The push mechanics against an already-resolved clone URL.
pub async fn push_workspace_to(clone_url: &str, source_dir: &Path) -> AppResult<PushedWorkspace> {
    let (_scratch, clone_dir) = clone_scratch(clone_url).await?;

    let branch = workspace_branch_name(chrono::Utc::now());
    run_git(&clone_dir, &["checkout", "-b", &branch]).await?;

    let copied = mirror_workspace(source_dir, &clone_dir).await?;
    tracing::debug!(copied, %branch, "mirrored workspace into scratch clone");

    run_git(&clone_dir, &["add", "."]).await?;
    let status = run_git(&clone_dir, &["status", "--porcelain"]).await?;
    if status.is_empty() {
        tracing::info!(%branch, "workspace matches hub; nothing to push");
        return Ok(PushedWorkspace {
            branch,
            clone_url: clone_url.to_string(),
        });
    }

    run_git(&clone_dir, &["commit", "-m", SYNC_COMMIT_MESSAGE]).await?;
    run_git(&clone_dir, &["push", "-u", "origin", &branch]).await?;
    tracing::info!(%branch, "workspace pushed to hub");
    Ok(PushedWorkspace {
        branch,
        clone_url: clone_url.to_string(),
    })
}

/// Merge a previously pushed branch into `main` and return the merge commit
/// hash the snapshot should pin.
pub async fn merge_to_main(api: &ApiClient, service: &str, branch: &str) -> AppResult<String> {
    let clone_url = credentialed_repo_url(api, service).await?;
    merge_branch_to_main(&clone_url, branch).await
}

/// The merge mechanics against an already-resolved clone URL.
pub async fn merge_branch_to_main(clone_url: &str, branch: &str) -> AppResult<String> {
    let (_scratch, clone_dir) = clone_scratch(clone_url).await?;

    run_git(&clone_dir, &["checkout", "main"]).await?;
    let message = format!("Merge {branch} into main for snapshot");
    run_git(
        &clone_dir,
        &["merge", "--no-ff", "-m", &message, &format!("origin/{branch}")],
    )
    .await?;
    let commit = run_git(&clone_dir, &["rev-parse", "HEAD"]).await?;
    run_git(&clone_dir, &["push", "origin", "main"]).await?;
    tracing::info!(%branch, %commit, "merged workspace branch into main");
    Ok(commit)
}
