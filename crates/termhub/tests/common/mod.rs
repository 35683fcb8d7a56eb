//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use termhub::api::{AppState, create_router};
use termhub::bootstrap::Bootstrap;
use termhub::config::AppConfig;
use termhub::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ExecOptions,
};
use termhub::exec::{CommandExecutor, ExecutorConfig};
use termhub::gateway::StreamingGateway;
use termhub::isolation::{IsolationBackend, SharedContainerBackend, build_backend};
use termhub::pool::{ContainerPool, PoolConfig};
use termhub::session::{RegistryConfig, SessionRegistry};
use tokio::process::Child;

/// In-memory container runtime. Containers "run" once created and report
/// `exited` after a stop or a simulated crash; commands executed in them
/// succeed without doing anything, except `realpath`, which echoes its argument.
/// `create_delay_ms` makes container creation take that long.
#[derive(Default)]
pub struct FakeRuntime {
    pub creates: AtomicUsize,
    pub fail_creates: AtomicBool,
    pub create_delay_ms: AtomicU64,
    running: Mutex<HashSet<String>>,
    stopped: Mutex<HashSet<String>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_create_delay(delay: Duration) -> Arc<Self> {
        let runtime = Self::new();
        runtime.set_create_delay(delay);
        runtime
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self.running.lock().unwrap().iter().cloned().collect();
        running.sort();
        running
    }

    /// Simulate a container that died.
    pub fn kill(&self, container_id: &str) {
        self.halt(container_id);
    }

    fn halt(&self, container_id: &str) {
        if self.running.lock().unwrap().remove(container_id) {
            self.stopped.lock().unwrap().insert(container_id.to_string());
        }
    }

    /// Every command executed in `container_id`, in order.
    pub fn execs_in(&self, container_id: &str) -> Vec<Vec<String>> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == container_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "image not found".to_string(),
            });
        }
        let name = config.name.clone().unwrap_or_else(|| "anonymous".to_string());
        self.running.lock().unwrap().insert(name.clone());
        Ok(name)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.stopped.lock().unwrap().remove(container_id);
        self.running.lock().unwrap().insert(container_id.to_string());
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _grace_secs: Option<u32>,
    ) -> ContainerResult<()> {
        self.halt(container_id);
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        self.running.lock().unwrap().remove(container_id);
        self.stopped.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        if self.running.lock().unwrap().contains(id_or_name) {
            return Ok(Some("running".to_string()));
        }
        Ok(self
            .stopped
            .lock()
            .unwrap()
            .contains(id_or_name)
            .then(|| "exited".to_string()))
    }

    async fn exec_output(
        &self,
        container_id: &str,
        _options: &ExecOptions,
        command: &[String],
    ) -> ContainerResult<String> {
        self.execs
            .lock()
            .unwrap()
            .push((container_id.to_string(), command.to_vec()));
        if command.first().map(String::as_str) == Some("realpath") {
            return Ok(format!("{}\n", command.last().cloned().unwrap_or_default()));
        }
        Ok(String::new())
    }

    async fn exec_streaming(
        &self,
        _container_id: &str,
        _options: &ExecOptions,
        _command: &[String],
    ) -> ContainerResult<Child> {
        Err(ContainerError::CommandFailed {
            command: "exec".to_string(),
            message: "streaming exec is not supported by the fake runtime".to_string(),
        })
    }
}

pub fn pool_config(max_containers: usize, users_per_container: usize) -> PoolConfig {
    let mut config = AppConfig::default();
    config.container.max_containers = max_containers;
    config.container.users_per_container = users_per_container;
    config.container.provision_attempts = 2;
    config.container.provision_backoff_ms = 1;
    config.container.drain_timeout_secs = 2;
    PoolConfig::from_config(&config.container, "/bin/sh")
}

pub fn test_pool(
    runtime: Arc<FakeRuntime>,
    max_containers: usize,
    users_per_container: usize,
) -> Arc<ContainerPool> {
    Arc::new(ContainerPool::new(
        runtime,
        pool_config(max_containers, users_per_container),
        Arc::new(Bootstrap::default()),
    ))
}

/// A registry over a shared-container backend on the fake runtime.
pub fn pooled_registry(pool: Arc<ContainerPool>, timeout: Duration) -> Arc<SessionRegistry> {
    let backend: Arc<dyn IsolationBackend> = Arc::new(SharedContainerBackend::new(pool, "/bin/sh"));
    Arc::new(SessionRegistry::new(
        backend,
        RegistryConfig {
            timeout,
            max_sessions: 64,
            prewarm: 0,
            renew_window: Duration::from_secs(3600),
        },
    ))
}

/// A configuration for directory-sandbox tests rooted in `dir`.
pub fn sandbox_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.backend.shell = "/bin/sh".to_string();
    config.sandbox.root = Some(dir.join("sandboxes").display().to_string());
    config.sandbox.preserve_homes = true;
    config.exec.warn_after_secs = None;
    config
}

/// Everything behind the router, on a directory sandbox.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: AppConfig,
    pub gateway: Arc<StreamingGateway>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut config = sandbox_config(dir.path());
        configure(&mut config);

        let backend = build_backend(
            &config,
            dir.path(),
            Arc::new(Bootstrap::default()),
            None,
        )
        .expect("build sandbox backend");
        let registry = Arc::new(SessionRegistry::new(
            backend.clone(),
            RegistryConfig::from_config(&config.sessions),
        ));
        let executor = Arc::new(CommandExecutor::new(
            backend,
            ExecutorConfig::from_config(&config.exec),
        ));
        let gateway = Arc::new(StreamingGateway::new(
            registry,
            executor,
            config.gateway.clone(),
        ));

        Self {
            dir,
            config,
            gateway,
        }
    }

    pub fn app(&self) -> Router {
        create_router(
            AppState::new(self.gateway.clone()).with_api_key(self.config.auth.api_key.clone()),
        )
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.gateway.registry()
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        self.gateway.executor()
    }
}

/// Build the test app on a fresh directory sandbox.
pub fn test_app() -> (TestEnv, Router) {
    let env = TestEnv::new();
    let app = env.app();
    (env, app)
}
