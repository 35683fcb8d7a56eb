//! Isolated execution environments.
//!
//! An [`IsolationBackend`] hands out [`IsolationHandle`]s (one per user, shared
//! by that user's sessions) and spawns processes inside them. The backend is
//! chosen once at startup:
//!
//! - [`BackendKind::DirectorySandbox`]: a per-user directory on the host,
//!   optionally wrapped in bubblewrap.
//! - [`BackendKind::SharedContainer`]: a Linux account inside one of the
//!   pooled containers managed by [`crate::pool::ContainerPool`].
//! - [`BackendKind::DedicatedContainer`]: one container per user.

pub mod accounts;
mod dedicated;
mod files;
mod sandbox;
mod shared;

pub use dedicated::{DedicatedConfig, DedicatedContainerBackend};
pub use files::{FileEntry, FileKind};
pub use sandbox::DirectorySandbox;
pub use shared::SharedContainerBackend;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::bootstrap::Bootstrap;
use crate::config::AppConfig;
use crate::container::{ContainerRuntime, ContainerRuntimeApi};
use crate::error::Result;
use crate::pool::{ContainerPool, PoolConfig};

/// Grace period between SIGTERM and SIGKILL when terminating a job.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Which kind of isolation a handle provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    DirectorySandbox,
    SharedContainer,
    DedicatedContainer,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::DirectorySandbox => write!(f, "directory_sandbox"),
            BackendKind::SharedContainer => write!(f, "shared_container"),
            BackendKind::DedicatedContainer => write!(f, "dedicated_container"),
        }
    }
}

/// Live reference to a user's execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationHandle {
    pub backend: BackendKind,
    pub user_id: String,
    /// Backing container, for container backends.
    pub container_id: Option<String>,
    /// Account the user's processes run as, for shared containers.
    pub account: Option<String>,
    /// The user's root directory. Built-in file operations never leave it.
    pub root: PathBuf,
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecProgram {
    /// Command text handed verbatim to the backend's shell.
    Shell(String),
    /// Argument vector executed without a shell.
    Argv(Vec<String>),
}

/// A process to spawn inside a handle.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub program: ExecProgram,
    /// Working directory, always under the handle root.
    pub cwd: PathBuf,
    /// Unique job id, used to find the job's processes again on cancellation.
    pub job_id: String,
}

/// Run commands inside isolated per-user environments.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether a user's files outlive their sessions.
    fn is_persistent(&self) -> bool;

    /// Obtain the user's handle, provisioning it when needed.
    ///
    /// Every successful call must be paired with one [`release`](Self::release).
    async fn acquire(&self, user_id: &str) -> Result<IsolationHandle>;

    /// Give back a handle obtained from [`acquire`](Self::acquire).
    async fn release(&self, handle: &IsolationHandle) -> Result<()>;

    /// Whether the handle can run processes right now.
    async fn is_running(&self, handle: &IsolationHandle) -> bool;

    /// Bring a stopped handle back.
    async fn restart(&self, handle: &IsolationHandle) -> Result<()>;

    /// Spawn a process with piped stdout and stderr.
    async fn spawn(&self, handle: &IsolationHandle, request: &ExecRequest) -> Result<Child>;

    /// Resolve symlinks in `path` as seen from inside the handle.
    ///
    /// Components that do not exist yet are appended unchanged.
    async fn resolve_real_path(&self, handle: &IsolationHandle, path: &Path) -> Result<PathBuf>;

    /// What `path` is, or `None` when nothing exists there.
    ///
    /// The file methods take paths already checked against the handle root.
    async fn file_kind(&self, _handle: &IsolationHandle, path: &Path) -> Result<Option<FileKind>> {
        files::host_kind(path).await
    }

    async fn list_dir(&self, _handle: &IsolationHandle, path: &Path) -> Result<Vec<FileEntry>> {
        files::host_list(path).await
    }

    async fn read_file(&self, _handle: &IsolationHandle, path: &Path) -> Result<Vec<u8>> {
        files::host_read(path).await
    }

    /// Create or replace a file, creating missing parent directories.
    async fn write_file(&self, _handle: &IsolationHandle, path: &Path, data: &[u8]) -> Result<()> {
        files::host_write(path, data).await
    }

    /// Remove a file or a directory tree.
    async fn remove_path(&self, _handle: &IsolationHandle, path: &Path) -> Result<()> {
        files::host_remove(path).await
    }

    async fn create_dir(&self, _handle: &IsolationHandle, path: &Path) -> Result<()> {
        files::host_create_dir(path).await
    }

    /// Stop a running job and reap it.
    async fn terminate(&self, _handle: &IsolationHandle, _job_id: &str, child: &mut Child) {
        terminate_process_group(child).await;
    }

    /// The container pool behind this backend, if any.
    fn pool(&self) -> Option<Arc<ContainerPool>> {
        None
    }
}

/// Build the configured backend. Called once at startup.
///
/// `runtime_override` replaces the container runtime derived from the configuration.
pub fn build_backend(
    config: &AppConfig,
    data_dir: &Path,
    bootstrap: Arc<Bootstrap>,
    runtime_override: Option<Arc<dyn ContainerRuntimeApi>>,
) -> anyhow::Result<Arc<dyn IsolationBackend>> {
    let shell = config.backend.shell.clone();
    let runtime = || -> Arc<dyn ContainerRuntimeApi> {
        if let Some(runtime) = runtime_override.clone() {
            return runtime;
        }
        let container = &config.container;
        Arc::new(ContainerRuntime::resolve(
            container.runtime,
            container.binary.clone(),
        ))
    };

    let backend: Arc<dyn IsolationBackend> = match config.backend.kind {
        BackendKind::DirectorySandbox => {
            let base = match config.sandbox.root.as_deref() {
                Some(root) => PathBuf::from(shellexpand::tilde(root).to_string()),
                None => data_dir.join("sandboxes"),
            };
            Arc::new(DirectorySandbox::new(
                base,
                shell,
                config.sandbox.preserve_homes,
                config.sandbox.bubblewrap,
                bootstrap,
            )?)
        }
        BackendKind::SharedContainer => {
            let pool = ContainerPool::new(
                runtime(),
                PoolConfig::from_config(&config.container, &shell),
                bootstrap,
            );
            Arc::new(SharedContainerBackend::new(Arc::new(pool), shell))
        }
        BackendKind::DedicatedContainer => {
            let container = &config.container;
            let dedicated = DedicatedConfig {
                image: container.image.clone(),
                name_prefix: container.name_prefix.clone(),
                max_containers: container.max_containers,
                workdir: PathBuf::from(&container.workdir),
                shell,
                memory_limit: container.memory_limit.clone(),
                cpu_quota: container.cpu_quota,
                network_mode: container.network_mode.clone(),
                provision_attempts: container.provision_attempts,
                provision_backoff: container.provision_backoff(),
            };
            Arc::new(DedicatedContainerBackend::new(runtime(), dedicated, bootstrap))
        }
    };

    Ok(backend)
}

/// Send SIGTERM to the child's process group, then SIGKILL after a grace period.
pub(crate) async fn terminate_process_group(child: &mut Child) {
    // The child was spawned with process_group(0), so its pid is the group id.
    signal_group(child, libc::SIGTERM);

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        signal_group(child, libc::SIGKILL);
        let _ = child.kill().await;
    }
}

fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as libc::pid_t, signal);
        }
    }
}

/// Canonicalize the longest existing prefix of `path` and append the rest.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();

    loop {
        match std::fs::canonicalize(&existing) {
            Ok(mut real) => {
                for part in missing.iter().rev() {
                    real.push(part);
                }
                return Ok(real);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        missing.push(name.to_os_string());
                        existing = parent.to_path_buf();
                    }
                    _ => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Async mutex per key, so work for one user is serialized while different
/// users proceed concurrently.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }
}

/// Environment variables every job sees.
pub(crate) fn job_env(home: &Path, user: &str) -> Vec<(String, String)> {
    vec![
        ("HOME".to_string(), home.display().to_string()),
        ("USER".to_string(), user.to_string()),
        ("LOGNAME".to_string(), user.to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ]
}

/// File inside the container recording a job's process group id.
pub(crate) fn job_pidfile(job_id: &str) -> String {
    format!("/tmp/termhub-job-{job_id}.pid")
}

/// Wrap a program for `exec` inside a container.
///
/// The job runs in its own session (`setsid -w`) and records its process
/// group id in [`job_pidfile`] so the whole group can be signalled later.
pub(crate) fn container_command(shell: &str, request: &ExecRequest) -> Vec<String> {
    let mut command = vec![
        "setsid".to_string(),
        "-w".to_string(),
        "/bin/sh".to_string(),
        "-c".to_string(),
        r#"echo $$ > "$1"; f=$1; shift; "$@"; s=$?; rm -f "$f"; exit $s"#.to_string(),
        "termhub-job".to_string(),
        job_pidfile(&request.job_id),
    ];
    match &request.program {
        ExecProgram::Shell(text) => {
            command.extend([shell.to_string(), "-lc".to_string(), text.clone()]);
        }
        ExecProgram::Argv(argv) => command.extend(argv.iter().cloned()),
    }
    command
}

/// Command that signals a container job's process group, run as the job's account.
pub(crate) fn container_cancel_command(job_id: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        r#"[ -f "$1" ] && kill -TERM -- -"$(cat "$1")" 2>/dev/null; rm -f "$1"; true"#.to_string(),
        "termhub-cancel".to_string(),
        job_pidfile(job_id),
    ]
}
