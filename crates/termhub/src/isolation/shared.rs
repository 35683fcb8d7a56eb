//! Accounts inside pooled shared containers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Child;

use super::files::ContainerFiles;
use super::{
    BackendKind, ExecRequest, FileEntry, FileKind, IsolationBackend, IsolationHandle,
    container_cancel_command, container_command, job_env, terminate_process_group,
};
use crate::container::ExecOptions;
use crate::error::{Error, Result};
use crate::pool::ContainerPool;

pub struct SharedContainerBackend {
    pool: Arc<ContainerPool>,
    shell: String,
}

impl SharedContainerBackend {
    pub fn new(pool: Arc<ContainerPool>, shell: impl Into<String>) -> Self {
        Self {
            pool,
            shell: shell.into(),
        }
    }

    fn target(handle: &IsolationHandle) -> Result<(&str, &str)> {
        match (handle.container_id.as_deref(), handle.account.as_deref()) {
            (Some(container), Some(account)) => Ok((container, account)),
            _ => Err(Error::handle_unavailable(format!(
                "handle for {} has no container account",
                handle.user_id
            ))),
        }
    }

    /// File access as the user's account.
    fn files<'a>(&'a self, handle: &'a IsolationHandle) -> Result<ContainerFiles<'a>> {
        let (container, account) = Self::target(handle)?;
        Ok(ContainerFiles::new(
            self.pool.runtime().as_ref(),
            container,
            Some(account),
        ))
    }
}

#[async_trait]
impl IsolationBackend for SharedContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharedContainer
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn acquire(&self, user_id: &str) -> Result<IsolationHandle> {
        self.pool.acquire_handle(user_id).await
    }

    async fn release(&self, handle: &IsolationHandle) -> Result<()> {
        self.pool.release_handle(handle);
        Ok(())
    }

    async fn is_running(&self, handle: &IsolationHandle) -> bool {
        let Some(container) = handle.container_id.as_deref() else {
            return false;
        };
        matches!(
            self.pool.runtime().container_state_status(container).await,
            Ok(Some(ref status)) if status == "running"
        )
    }

    async fn restart(&self, handle: &IsolationHandle) -> Result<()> {
        let (container, _) = Self::target(handle)?;
        self.pool.restart_slot(container).await
    }

    async fn spawn(&self, handle: &IsolationHandle, request: &ExecRequest) -> Result<Child> {
        let (container, account) = Self::target(handle)?;
        let options = ExecOptions {
            user: Some(account.to_string()),
            workdir: Some(request.cwd.display().to_string()),
            env: job_env(&handle.root, account),
        };
        let command = container_command(&self.shell, request);
        debug!("exec in {} as {}: job {}", container, account, request.job_id);
        Ok(self
            .pool
            .runtime()
            .exec_streaming(container, &options, &command)
            .await?)
    }

    async fn resolve_real_path(&self, handle: &IsolationHandle, path: &Path) -> Result<PathBuf> {
        let (container, account) = Self::target(handle)?;
        let options = ExecOptions {
            user: Some(account.to_string()),
            workdir: None,
            env: Vec::new(),
        };
        let command = [
            "realpath".to_string(),
            "-m".to_string(),
            "--".to_string(),
            path.display().to_string(),
        ];
        let resolved = self
            .pool
            .runtime()
            .exec_output(container, &options, &command)
            .await?;
        Ok(PathBuf::from(resolved.trim_end_matches('\n')))
    }

    async fn terminate(&self, handle: &IsolationHandle, job_id: &str, child: &mut Child) {
        // Killing the local exec client does not reach the processes inside
        // the container; signal the job's group there as well.
        if let Ok((container, account)) = Self::target(handle) {
            let options = ExecOptions {
                user: Some(account.to_string()),
                workdir: None,
                env: Vec::new(),
            };
            if let Err(e) = self
                .pool
                .runtime()
                .exec_output(container, &options, &container_cancel_command(job_id))
                .await
            {
                warn!("Cancelling job {} in {} failed: {}", job_id, container, e);
            }
        }
        terminate_process_group(child).await;
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

    fn pool(&self) -> Option<Arc<ContainerPool>> {
        Some(self.pool.clone())
    }
}
