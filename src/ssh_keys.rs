use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::{AppError, AppResult};

const KEY_FILE: &str = "id_ed25519";

#[derive(Debug, Clone)]
pub struct SshKeypair {
    pub private_key_path: PathBuf,
    pub public_key: String,
}

/// Reuse the tool's keypair if one exists, otherwise generate it with the
/// platform `ssh-keygen`. The public key text is returned for upload.
pub async fn ensure_keypair(dir: &Path) -> AppResult<SshKeypair> {
    std::fs::create_dir_all(dir)?;
    let private_key_path = dir.join(KEY_FILE);
    let public_key_path = dir.join(format!("{KEY_FILE}.pub"));

    if !private_key_path.exists() {
        let output = Command::new("ssh-keygen")
            .args(["-t", "ed25519", "-N", "", "-q", "-C", "plato-sandbox", "-f"])
            .arg(&private_key_path)
            .output()
            .await
            .map_err(|err| AppError::ChildProcess {
                binary: "ssh-keygen".to_string(),
                stderr: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(AppError::ChildProcess {
                binary: "ssh-keygen".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!(path = %private_key_path.display(), "generated sandbox ssh keypair");
    }

    let public_key = std::fs::read_to_string(&public_key_path)?.trim().to_string();
    Ok(SshKeypair {
        private_key_path,
        public_key,
    })
}
