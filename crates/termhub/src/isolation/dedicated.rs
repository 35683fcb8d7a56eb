//! One container per user.
//!
//! The container is created on first use, stopped (not removed) when the
//! user's last handle is released and started again on the next acquire, so
//! files under the working directory persist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use tokio::process::Child;

use super::accounts::account_name;
use super::files::ContainerFiles;
use super::{
    BackendKind, ExecRequest, FileEntry, FileKind, IsolationBackend, IsolationHandle, KeyedLocks,
    container_cancel_command, container_command, job_env, terminate_process_group,
};
use crate::bootstrap::Bootstrap;
use crate::container::{ContainerConfig, ContainerRuntimeApi, ExecOptions};
use crate::error::{Error, Result};
use crate::pool::retry_with_backoff;

const STOP_TIMEOUT_SECS: u32 = 10;

/// Settings for per-user containers.
#[derive(Debug, Clone)]
pub struct DedicatedConfig {
    pub image: String,
    pub name_prefix: String,
    /// Maximum number of users with a running container.
    pub max_containers: usize,
    pub workdir: PathBuf,
    pub shell: String,
    pub memory_limit: Option<String>,
    pub cpu_quota: Option<f64>,
    pub network_mode: Option<String>,
    pub provision_attempts: u32,
    pub provision_backoff: Duration,
}

pub struct DedicatedContainerBackend {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: DedicatedConfig,
    bootstrap: Arc<Bootstrap>,
    /// user id -> live handles. Zero while the user's container comes up.
    refs: Mutex<HashMap<String, usize>>,
    user_locks: KeyedLocks,
}

impl DedicatedContainerBackend {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        config: DedicatedConfig,
        bootstrap: Arc<Bootstrap>,
    ) -> Self {
        Self {
            runtime,
            config,
            bootstrap,
            refs: Mutex::new(HashMap::new()),
            user_locks: KeyedLocks::default(),
        }
    }

    fn container_name(&self, user_id: &str) -> String {
        format!("{}-u-{}", self.config.name_prefix, account_name("", user_id))
    }

    fn refs(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.refs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exec_options(&self, handle: &IsolationHandle, workdir: Option<&Path>) -> ExecOptions {
        ExecOptions {
            user: None,
            workdir: workdir.map(|p| p.display().to_string()),
            env: job_env(&handle.root, &handle.user_id),
        }
    }

    fn files<'a>(&'a self, handle: &'a IsolationHandle) -> Result<ContainerFiles<'a>> {
        let name = handle
            .container_id
            .as_deref()
            .ok_or_else(|| Error::handle_unavailable("handle has no container"))?;
        Ok(ContainerFiles::new(self.runtime.as_ref(), name, None))
    }

    /// Make sure the user's container exists and is running.
    async fn ensure_container(&self, name: &str) -> Result<()> {
        match self.runtime.container_state_status(name).await? {
            Some(status) if status == "running" => Ok(()),
            Some(status) => {
                info!("Starting container {} (was {})", name, status);
                retry_with_backoff(
                    &format!("starting {name}"),
                    self.config.provision_attempts,
                    self.config.provision_backoff,
                    move |_| self.runtime.start_container(name),
                )
                .await?;
                Ok(())
            }
            None => {
                let config = ContainerConfig::new(&self.config.image)
                    .name(name)
                    .hostname(name)
                    .label("termhub.dedicated", &self.config.name_prefix)
                    .workdir(self.config.workdir.display().to_string())
                    .network_mode(self.config.network_mode.clone())
                    .limits(self.config.memory_limit.clone(), self.config.cpu_quota)
                    .command(vec!["sleep".to_string(), "infinity".to_string()]);
                let config = &config;

                info!("Creating container {}", name);
                retry_with_backoff(
                    &format!("creating {name}"),
                    self.config.provision_attempts,
                    self.config.provision_backoff,
                    move |attempt| async move {
                        if attempt > 1 {
                            let _ = self.runtime.remove_container(name, true).await;
                        }
                        self.runtime.create_container(config).await
                    },
                )
                .await?;

                let workdir = self.config.workdir.display().to_string();
                if let Some(command) = self.bootstrap.container_command(&workdir) {
                    let options = ExecOptions {
                        workdir: Some(workdir),
                        ..ExecOptions::default()
                    };
                    if let Err(e) = self.runtime.exec_output(name, &options, &command).await {
                        warn!("Bootstrap in {} failed: {}", name, e);
                    }
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for DedicatedContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DedicatedContainer
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn acquire(&self, user_id: &str) -> Result<IsolationHandle> {
        let _guard = self.user_locks.lock(user_id).await;

        // A new user holds a zero-count entry while the container comes up,
        // so concurrent new users see it against the limit.
        let newcomer = {
            let mut refs = self.refs();
            if refs.contains_key(user_id) {
                false
            } else if refs.len() >= self.config.max_containers {
                return Err(Error::PoolExhausted {
                    containers: self.config.max_containers,
                    users_per_container: 1,
                });
            } else {
                refs.insert(user_id.to_string(), 0);
                true
            }
        };

        let name = self.container_name(user_id);
        if let Err(e) = self.ensure_container(&name).await {
            warn!("Provisioning {} for user {} failed: {}", name, user_id, e);
            if newcomer {
                self.refs().remove(user_id);
            }
            return Err(Error::capacity(format!(
                "container provisioning failed ({e}); try again later"
            )));
        }

        *self.refs().entry(user_id.to_string()).or_insert(0) += 1;
        Ok(IsolationHandle {
            backend: BackendKind::DedicatedContainer,
            user_id: user_id.to_string(),
            container_id: Some(name),
            account: None,
            root: self.config.workdir.clone(),
        })
    }

    async fn release(&self, handle: &IsolationHandle) -> Result<()> {
        let _guard = self.user_locks.lock(&handle.user_id).await;

        let last = {
            let mut refs = self.refs();
            match refs.get_mut(&handle.user_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    refs.remove(&handle.user_id);
                    true
                }
                None => false,
            }
        };

        if last {
            if let Some(name) = handle.container_id.as_deref() {
                info!("Stopping idle container {}", name);
                self.runtime
                    .stop_container(name, Some(STOP_TIMEOUT_SECS))
                    .await?;
            }
        }
        Ok(())
    }

    async fn is_running(&self, handle: &IsolationHandle) -> bool {
        let Some(name) = handle.container_id.as_deref() else {
            return false;
        };
        matches!(
            self.runtime.container_state_status(name).await,
            Ok(Some(ref status)) if status == "running"
        )
    }

    async fn restart(&self, handle: &IsolationHandle) -> Result<()> {
        let name = handle
            .container_id
            .as_deref()
            .ok_or_else(|| Error::handle_unavailable("handle has no container"))?;
        self.ensure_container(name)
            .await
            .map_err(|e| Error::handle_unavailable(format!("{name}: {e}")))
    }

    async fn spawn(&self, handle: &IsolationHandle, request: &ExecRequest) -> Result<Child> {
        let name = handle
            .container_id
            .as_deref()
            .ok_or_else(|| Error::handle_unavailable("handle has no container"))?;
        let options = self.exec_options(handle, Some(&request.cwd));
        let command = container_command(&self.config.shell, request);
        Ok(self.runtime.exec_streaming(name, &options, &command).await?)
    }

    async fn resolve_real_path(&self, handle: &IsolationHandle, path: &Path) -> Result<PathBuf> {
        let name = handle
            .container_id
            .as_deref()
            .ok_or_else(|| Error::handle_unavailable("handle has no container"))?;
        let command = [
            "realpath".to_string(),
            "-m".to_string(),
            "--".to_string(),
            path.display().to_string(),
        ];
        let resolved = self
            .runtime
            .exec_output(name, &ExecOptions::default(), &command)
            .await?;
        Ok(PathBuf::from(resolved.trim_end_matches('\n')))
    }

    async fn file_kind(&self, handle: &IsolationHandle, path: &Path) -> Result<Option<FileKind>> {
        self.files(handle)?.kind(path).await
    }

    async fn list_dir(&self, handle: &IsolationHandle, path: &Path) -> Result<Vec<FileEntry>> {
        self.files(handle)?.list(path).await
    }

    async fn read_file(&self, handle: &IsolationHandle, path: &Path) -> Result<Vec<u8>> {
        self.files(handle)?.read(path).await
    }

    async fn write_file(&self, handle: &IsolationHandle, path: &Path, data: &[u8]) -> Result<()> {
        self.files(handle)?.write(path, data).await
    }

    async fn remove_path(&self, handle: &IsolationHandle, path: &Path) -> Result<()> {
        self.files(handle)?.remove(path).await
    }

    async fn create_dir(&self, handle: &IsolationHandle, path: &Path) -> Result<()> {
        self.files(handle)?.create_dir(path).await
    }

    async fn terminate(&self, handle: &IsolationHandle, job_id: &str, child: &mut Child) {
        if let Some(name) = handle.container_id.as_deref() {
            let options = self.exec_options(handle, None);
            if let Err(e) = self
                .runtime
                .exec_output(name, &options, &container_cancel_command(job_id))
                .await
            {
                warn!("Cancelling job {} in {} failed: {}", job_id, name, e);
            }
        }
        terminate_process_group(child).await;
    }
}
