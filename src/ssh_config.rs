use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{AppError, AppResult};

/// A managed `Host` block for one sandbox.
#[derive(Debug, Clone)]
pub struct HostBlock {
    pub name: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub proxy_command: String,
}

impl HostBlock {
    fn render(&self) -> String {
        let mut block = String::new();
        block.push_str(&format!("Host {}\n", self.name));
        block.push_str("    HostName localhost\n");
        block.push_str(&format!("    Port {}\n", self.port));
        block.push_str(&format!("    User {}\n", self.user));
        if let Some(identity) = &self.identity_file {
            block.push_str(&format!("    IdentityFile {}\n", identity.display()));
            block.push_str("    IdentitiesOnly yes\n");
        }
        block.push_str("    StrictHostKeyChecking no\n");
        block.push_str("    UserKnownHostsFile /dev/null\n");
        block.push_str(&format!("    ProxyCommand {}\n", self.proxy_command));
        block
    }
}

/// Idempotent editor for the user's SSH client config. All operations rewrite
/// the file atomically (temp file + rename) and serialize through one
/// process-wide mutex; concurrent edits from other processes are not
/// defended against.
pub struct SshConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SshConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> AppResult<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_atomic(&self, contents: &str) -> AppResult<()> {
        let parent = self.path.parent().ok_or_else(|| {
            AppError::Config(format!("ssh config path has no parent: {}", self.path.display()))
        })?;
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|err| AppError::Io(err.error))?;
        Ok(())
    }

    /// First of `base`, `base-1`, `base-2`, … that is not already a Host
    /// alias in the file.
    pub fn alloc_hostname(&self, base: &str) -> AppResult<String> {
        let _guard = self.lock.lock().expect("ssh config lock");
        let aliases = host_aliases(&self.read()?);
        if !aliases.iter().any(|a| a == base) {
            return Ok(base.to_string());
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}-{n}");
            if !aliases.iter().any(|a| a == &candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    pub fn append_host(&self, block: &HostBlock) -> AppResult<()> {
        let _guard = self.lock.lock().expect("ssh config lock");
        let mut contents = self.read()?;
        if host_range(&contents, &block.name).is_some() {
            return Ok(());
        }
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&block.render());
        self.write_atomic(&contents)
    }

    /// Delete the named block and its indented options, up to the next
    /// top-level line or EOF. No-op when the block is absent.
    pub fn remove_host(&self, name: &str) -> AppResult<()> {
        let _guard = self.lock.lock().expect("ssh config lock");
        let contents = self.read()?;
        let Some((start, end)) = host_range(&contents, name) else {
            return Ok(());
        };
        let lines: Vec<&str> = contents.lines().collect();
        let kept: Vec<&str> = lines[..start]
            .iter()
            .chain(lines[end..].iter())
            .copied()
            .collect();
        let mut rebuilt = kept.join("\n");
        if !rebuilt.is_empty() {
            rebuilt.push('\n');
        }
        self.write_atomic(&rebuilt)
    }

    /// Replace the `User` line inside the named block.
    pub fn set_user(&self, name: &str, user: &str) -> AppResult<()> {
        self.edit_block(name, |block_lines| {
            let user_line = format!("    User {user}");
            if let Some(line) = block_lines
                .iter_mut()
                .find(|line| line.trim_start().starts_with("User "))
            {
                *line = user_line;
            } else {
                block_lines.insert(1, user_line);
            }
        })
    }

    /// Record the in-VM password as a comment under the Host line and stop
    /// forcing identity-only auth so password prompts can happen.
    pub fn enable_password(&self, name: &str, password: &str) -> AppResult<()> {
        self.edit_block(name, |block_lines| {
            let comment = format!("    # Password: {password}");
            if let Some(line) = block_lines
                .iter_mut()
                .find(|line| line.trim_start().starts_with("# Password:"))
            {
                *line = comment;
            } else {
                block_lines.insert(1, comment);
            }
            let identities_line = "    IdentitiesOnly no".to_string();
            if let Some(line) = block_lines
                .iter_mut()
                .find(|line| line.trim_start().starts_with("IdentitiesOnly "))
            {
                *line = identities_line;
            } else {
                block_lines.push(identities_line);
            }
        })
    }

    fn edit_block(
        &self,
        name: &str,
        edit: impl FnOnce(&mut Vec<String>),
    ) -> AppResult<()> {
        let _guard = self.lock.lock().expect("ssh config lock");
        let contents = self.read()?;
        let Some((start, end)) = host_range(&contents, name) else {
            return Err(AppError::Config(format!(
                "no Host block named {name} in {}",
                self.path.display()
            )));
        };
        let lines: Vec<&str> = contents.lines().collect();
        let mut block_lines: Vec<String> = lines[start..end].iter().map(|s| s.to_string()).collect();
        edit(&mut block_lines);

        let mut rebuilt: Vec<String> = lines[..start].iter().map(|s| s.to_string()).collect();
        rebuilt.extend(block_lines);
        rebuilt.extend(lines[end..].iter().map(|s| s.to_string()));
        let mut out = rebuilt.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        self.write_atomic(&out)
    }
}

/// All aliases named on `Host` lines, including multi-alias lines.
fn host_aliases(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| line.strip_prefix("Host "))
        .flat_map(|rest| rest.split_whitespace())
        .map(str::to_string)
        .collect()
}

/// Line range `[start, end)` of the named block, where `end` is the next
/// top-level line or EOF.
fn host_range(contents: &str, name: &str) -> Option<(usize, usize)> {
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.iter().position(|line| {
        line.strip_prefix("Host ")
            .map(|rest| rest.split_whitespace().any(|alias| alias == name))
            .unwrap_or(false)
    })?;
    let mut end = start + 1;
    while end < lines.len() {
        let line = lines[end];
        if !line.trim().is_empty() && !line.starts_with(' ') && !line.starts_with('\t') {
            break;
        }
        end += 1;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SshConfigStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SshConfigStore::new(dir.path().join("config"));
        (dir, store)
    }

    fn sample_block(name: &str) -> HostBlock {
        HostBlock {
            name: name.to_string(),
            port: 22,
            user: "plato".to_string(),
            identity_file: Some(PathBuf::from("/home/u/.plato/ssh/id_ed25519")),
            proxy_command: "proxytunnel -E -p proxy.test:9000 -P jg@22:tok -d localhost:22"
                .to_string(),
        }
    }

    #[test]
    fn append_then_remove_restores_file_bytes() {
        let (_dir, store) = store();
        let pre = "Host other\n    HostName example.com\n";
        store.write_atomic(pre).expect("seed");

        store.append_host(&sample_block("sandbox")).expect("append");
        let with_block = std::fs::read_to_string(store.path()).expect("read");
        assert!(with_block.contains("Host sandbox"));
        assert!(with_block.contains("ProxyCommand proxytunnel"));

        store.remove_host("sandbox").expect("remove");
        let post = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(post, pre);
    }

    #[test]
    fn append_is_idempotent() {
        let (_dir, store) = store();
        store.append_host(&sample_block("sandbox")).expect("append");
        store.append_host(&sample_block("sandbox")).expect("append again");
        let contents = std::fs::read_to_string(store.path()).expect("read");
        assert_eq!(contents.matches("Host sandbox").count(), 1);
    }

    #[test]
    fn alloc_hostname_skips_taken_aliases() {
        let (_dir, store) = store();
        assert_eq!(store.alloc_hostname("sandbox").expect("alloc"), "sandbox");

        store.append_host(&sample_block("sandbox")).expect("append");
        assert_eq!(store.alloc_hostname("sandbox").expect("alloc"), "sandbox-1");

        store.append_host(&sample_block("sandbox-1")).expect("append");
        assert_eq!(store.alloc_hostname("sandbox").expect("alloc"), "sandbox-2");
    }

    #[test]
    fn remove_keeps_following_blocks() {
        let (_dir, store) = store();
        store.append_host(&sample_block("a")).expect("append a");
        store.append_host(&sample_block("b")).expect("append b");
        store.remove_host("a").expect("remove a");

        let contents = std::fs::read_to_string(store.path()).expect("read");
        assert!(!contents.contains("Host a\n"));
        assert!(contents.contains("Host b\n"));
    }

    #[test]
    fn set_user_replaces_only_that_block() {
        let (_dir, store) = store();
        store.append_host(&sample_block("a")).expect("append a");
        store.append_host(&sample_block("b")).expect("append b");
        store.set_user("a", "root").expect("set user");

        let contents = std::fs::read_to_string(store.path()).expect("read");
        let a_range = host_range(&contents, "a").expect("a range");
        let b_range = host_range(&contents, "b").expect("b range");
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[a_range.0..a_range.1].contains(&"    User root"));
        assert!(lines[b_range.0..b_range.1].contains(&"    User plato"));
    }

    #[test]
    fn enable_password_inserts_comment_and_relaxes_identities() {
        let (_dir, store) = store();
        store.append_host(&sample_block("sandbox")).expect("append");
        store.enable_password("sandbox", "hunter2").expect("enable");

        let contents = std::fs::read_to_string(store.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        let host_idx = lines.iter().position(|l| *l == "Host sandbox").expect("host");
        assert_eq!(lines[host_idx + 1], "    # Password: hunter2");
        assert!(lines.contains(&"    IdentitiesOnly no"));
        assert!(!lines.contains(&"    IdentitiesOnly yes"));
    }
}
