//! Per-user directories on the host.
//!
//! Every user gets `<base>/<account name>` as their root. Processes run as the
//! server's own OS user with a scrubbed environment, optionally wrapped in
//! bubblewrap so the rest of the filesystem is read-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::{Child, Command};

use super::accounts::account_name;
use super::{
    BackendKind, ExecProgram, ExecRequest, IsolationBackend, IsolationHandle, KeyedLocks,
    canonicalize_lenient, job_env,
};
use crate::bootstrap::Bootstrap;
use crate::error::{Error, Result};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct DirectorySandbox {
    base: PathBuf,
    shell: String,
    preserve_homes: bool,
    bubblewrap: bool,
    bootstrap: Arc<Bootstrap>,
    refs: Mutex<HashMap<String, usize>>,
    user_locks: KeyedLocks,
}

impl DirectorySandbox {
    pub fn new(
        base: impl Into<PathBuf>,
        shell: impl Into<String>,
        preserve_homes: bool,
        bubblewrap: bool,
        bootstrap: Arc<Bootstrap>,
    ) -> Result<Self> {
        let base = base.into();
        std::fs::create_dir_all(&base)?;
        let base = std::fs::canonicalize(&base)?;

        let bubblewrap = if bubblewrap && !is_bwrap_available() {
            warn!("bubblewrap (bwrap) not found, sandbox commands run unwrapped");
            false
        } else {
            bubblewrap
        };

        info!(
            "Directory sandbox at {} (preserve_homes={}, bubblewrap={})",
            base.display(),
            preserve_homes,
            bubblewrap
        );

        Ok(Self {
            base,
            shell: shell.into(),
            preserve_homes,
            bubblewrap,
            bootstrap,
            refs: Mutex::new(HashMap::new()),
            user_locks: KeyedLocks::default(),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn root_for(&self, user_id: &str) -> PathBuf {
        self.base.join(account_name("", user_id))
    }

    /// Create the root (and seed it) if it does not exist yet.
    async fn ensure_root(&self, root: &Path) -> Result<()> {
        if root.is_dir() {
            return Ok(());
        }
        tokio::fs::create_dir_all(root).await?;

        let bootstrap = self.bootstrap.clone();
        let target = root.to_path_buf();
        tokio::task::spawn_blocking(move || bootstrap.populate_dir(&target))
            .await
            .map_err(std::io::Error::other)?
            .map_err(|e| std::io::Error::other(format!("{e:#}")))?;
        debug!("Created sandbox root {}", root.display());
        Ok(())
    }

    fn refs(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.refs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn command_for(&self, handle: &IsolationHandle, request: &ExecRequest) -> Result<Command> {
        let mut program: Vec<String> = match &request.program {
            ExecProgram::Shell(text) => vec![self.shell.clone(), "-c".to_string(), text.clone()],
            ExecProgram::Argv(argv) if !argv.is_empty() => argv.clone(),
            ExecProgram::Argv(_) => return Err(Error::validation("empty argument vector")),
        };

        if self.bubblewrap {
            let mut jailed = vec!["bwrap".to_string()];
            jailed.extend(bwrap_args(&handle.root));
            jailed.extend([
                "--chdir".to_string(),
                request.cwd.display().to_string(),
                "--".to_string(),
            ]);
            jailed.append(&mut program);
            program = jailed;
        }

        let mut cmd = Command::new(&program[0]);
        cmd.args(&program[1..])
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .envs(job_env(&handle.root, &handle.user_id))
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let bashrc = handle.root.join(".bashrc");
        if bashrc.is_file() {
            cmd.env("BASH_ENV", bashrc);
        }

        cmd.process_group(0);

        Ok(cmd)
    }
}

#[async_trait]
impl IsolationBackend for DirectorySandbox {
    fn kind(&self) -> BackendKind {
        BackendKind::DirectorySandbox
    }

    fn is_persistent(&self) -> bool {
        self.preserve_homes
    }

    async fn acquire(&self, user_id: &str) -> Result<IsolationHandle> {
        let _guard = self.user_locks.lock(user_id).await;

        let root = self.root_for(user_id);
        self.ensure_root(&root).await?;
        *self.refs().entry(user_id.to_string()).or_insert(0) += 1;

        Ok(IsolationHandle {
            backend: BackendKind::DirectorySandbox,
            user_id: user_id.to_string(),
            container_id: None,
            account: None,
            root,
        })
    }

    async fn release(&self, handle: &IsolationHandle) -> Result<()> {
        let _guard = self.user_locks.lock(&handle.user_id).await;

        let remaining = {
            let mut refs = self.refs();
            match refs.get_mut(&handle.user_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    *count
                }
                Some(_) => {
                    refs.remove(&handle.user_id);
                    0
                }
                None => return Ok(()),
            }
        };

        if remaining == 0 && !self.preserve_homes && handle.root.starts_with(&self.base) {
            debug!("Removing sandbox root {}", handle.root.display());
            match tokio::fs::remove_dir_all(&handle.root).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    async fn is_running(&self, handle: &IsolationHandle) -> bool {
        handle.root.is_dir()
    }

    async fn restart(&self, handle: &IsolationHandle) -> Result<()> {
        warn!(
            "Sandbox root {} disappeared, recreating",
            handle.root.display()
        );
        self.ensure_root(&handle.root)
            .await
            .map_err(|e| Error::handle_unavailable(e.to_string()))
    }

    async fn spawn(&self, handle: &IsolationHandle, request: &ExecRequest) -> Result<Child> {
        let mut cmd = self.command_for(handle, request)?;
        Ok(cmd.spawn()?)
    }

    async fn resolve_real_path(&self, _handle: &IsolationHandle, path: &Path) -> Result<PathBuf> {
        Ok(canonicalize_lenient(path)?)
    }
}

fn is_bwrap_available() -> bool {
    std::process::Command::new("bwrap")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// System directories exposed read-only inside the bubblewrap jail.
const RO_SYSTEM_DIRS: [&str; 6] = ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc"];

/// Jail `root` read-write on top of read-only system dirs, private `/tmp`
/// and a fresh pid namespace.
fn bwrap_args(root: &Path) -> Vec<String> {
    let root = root.display().to_string();
    let mut args: Vec<String> = RO_SYSTEM_DIRS
        .into_iter()
        .filter(|dir| Path::new(dir).exists())
        .flat_map(|dir| ["--ro-bind", dir, dir])
        .map(str::to_string)
        .collect();
    args.extend(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp", "--bind"].map(str::to_string));
    args.extend([root.clone(), root]);
    args.extend(["--unshare-pid", "--die-with-parent"].map(str::to_string));
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(base: &Path, preserve: bool) -> DirectorySandbox {
        DirectorySandbox::new(base, "/bin/sh", preserve, false, Arc::new(Bootstrap::default()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_creates_stable_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sandbox(dir.path(), true);

        let a = backend.acquire("alice").await.unwrap();
        let b = backend.acquire("alice").await.unwrap();
        let other = backend.acquire("bob").await.unwrap();

        assert_eq!(a.root, b.root);
        assert_ne!(a.root, other.root);
        assert!(a.root.is_dir());
        assert!(a.root.starts_with(backend.base()));
    }

    #[tokio::test]
    async fn test_release_removes_root_when_not_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sandbox(dir.path(), false);
        assert!(!backend.is_persistent());

        let first = backend.acquire("alice").await.unwrap();
        let second = backend.acquire("alice").await.unwrap();

        backend.release(&first).await.unwrap();
        assert!(first.root.is_dir());
        backend.release(&second).await.unwrap();
        assert!(!first.root.exists());
    }

    #[tokio::test]
    async fn test_spawn_runs_in_root_with_scrubbed_env() {
        let dir = tempfile::tempdir().unwrap();
        let backend = sandbox(dir.path(), true);
        let handle = backend.acquire("alice").await.unwrap();

        let request = ExecRequest {
            program: ExecProgram::Shell("pwd; echo \"$HOME\"".to_string()),
            cwd: handle.root.clone(),
            job_id: "j1".to_string(),
        };
        let child = backend.spawn(&handle, &request).await.unwrap();
        let output = child.wait_with_output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let root = handle.root.display().to_string();

        assert!(output.status.success());
        assert_eq!(stdout, format!("{root}\n{root}\n"));
    }

    #[test]
    fn test_bwrap_args_bind_root() {
        let args = bwrap_args(Path::new("/srv/sandboxes/alice"));
        let pos = args.iter().position(|a| a == "--bind").unwrap();
        assert_eq!(args[pos + 1], "/srv/sandboxes/alice");
        assert_eq!(args.last().map(String::as_str), Some("--die-with-parent"));
    }
}
