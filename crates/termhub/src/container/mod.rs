//! Thin async driver for the Docker / Podman command line.
//!
//! The pool only talks to [`ContainerRuntimeApi`], so tests swap in an
//! in-memory runtime and never need a container engine installed.

mod config;
mod error;

pub use config::{ContainerConfig, validate_container_name, validate_container_path};
pub use error::{ContainerError, ContainerResult};

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

/// Which engine CLI to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    #[default]
    Podman,
}

impl RuntimeType {
    pub fn binary(self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// First engine found on `PATH`, podman preferred.
    fn detect() -> Self {
        [RuntimeType::Podman, RuntimeType::Docker]
            .into_iter()
            .find(|kind| on_path(kind.binary()))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

fn on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(name))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// How an `exec` is run inside a container.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// `run -d` the container and return the id the engine printed.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;

    async fn stop_container(&self, container_id: &str, grace_secs: Option<u32>)
    -> ContainerResult<()>;

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// `State.Status` of the container, `None` when the engine does not know it.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;

    /// Run to completion and collect stdout.
    async fn exec_output(
        &self,
        container_id: &str,
        options: &ExecOptions,
        command: &[String],
    ) -> ContainerResult<String>;

    /// Start an exec with piped output in its own process group.
    async fn exec_streaming(
        &self,
        container_id: &str,
        options: &ExecOptions,
        command: &[String],
    ) -> ContainerResult<Child>;
}

/// [`ContainerRuntimeApi`] backed by the engine CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    kind: RuntimeType,
    binary: String,
}

impl ContainerRuntime {
    /// Build from configuration; a missing kind is detected, a missing binary
    /// falls back to the engine's usual name.
    pub fn resolve(kind: Option<RuntimeType>, binary: Option<String>) -> Self {
        let kind = kind.unwrap_or_else(RuntimeType::detect);
        Self {
            binary: binary.unwrap_or_else(|| kind.binary().to_string()),
            kind,
        }
    }

    pub fn kind(&self) -> RuntimeType {
        self.kind
    }

    async fn invoke(&self, args: Vec<String>) -> ContainerResult<String> {
        let verb = args.first().cloned().unwrap_or_default();
        let out = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            Err(ContainerError::failed(
                &verb,
                String::from_utf8_lossy(&out.stderr).trim(),
            ))
        }
    }

    /// `<binary> version`, used as a liveness check.
    pub async fn version(&self) -> ContainerResult<String> {
        self.invoke(argv(["version"])).await
    }
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// `exec [-u user] [-w dir] [-e K=V]... <id> <command...>`
fn exec_argv(
    container_id: &str,
    options: &ExecOptions,
    command: &[String],
) -> ContainerResult<Vec<String>> {
    validate_container_name(container_id)?;
    let Some(program) = command.first() else {
        return Err(ContainerError::InvalidInput("empty exec command".into()));
    };
    if program.is_empty() {
        return Err(ContainerError::InvalidInput("empty exec command".into()));
    }

    let mut args = argv(["exec"]);
    if let Some(user) = &options.user {
        args.extend(["-u".to_string(), user.clone()]);
    }
    if let Some(dir) = &options.workdir {
        validate_container_path(dir)?;
        args.extend(["-w".to_string(), dir.clone()]);
    }
    for (key, value) in &options.env {
        args.extend(["-e".to_string(), format!("{key}={value}")]);
    }
    args.push(container_id.to_string());
    args.extend_from_slice(command);
    Ok(args)
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let id = self.invoke(config.run_args()).await?;
        Ok(id.trim().to_string())
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.invoke(argv(["start", container_id])).await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace_secs: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        let mut args = argv(["stop"]);
        if let Some(secs) = grace_secs {
            args.extend(["-t".to_string(), secs.to_string()]);
        }
        args.push(container_id.to_string());
        self.invoke(args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        let args = if force {
            argv(["rm", "-f", container_id])
        } else {
            argv(["rm", container_id])
        };
        self.invoke(args).await?;
        Ok(())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        validate_container_name(id_or_name)?;
        let inspected = self
            .invoke(argv(["inspect", "--format", "{{.State.Status}}", id_or_name]))
            .await;
        // Unknown containers make inspect exit non-zero.
        Ok(inspected
            .ok()
            .map(|out| out.trim().trim_matches('"').to_string())
            .filter(|status| !status.is_empty()))
    }

    async fn exec_output(
        &self,
        container_id: &str,
        options: &ExecOptions,
        command: &[String],
    ) -> ContainerResult<String> {
        self.invoke(exec_argv(container_id, options, command)?).await
    }

    async fn exec_streaming(
        &self,
        container_id: &str,
        options: &ExecOptions,
        command: &[String],
    ) -> ContainerResult<Child> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(exec_argv(container_id, options, command)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        Ok(cmd.spawn()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn version_check_when_engine_present() {
        let runtime = ContainerRuntime::resolve(None, None);
        if let Ok(version) = runtime.version().await {
            assert!(!version.trim().is_empty());
        }
    }

    #[test]
    fn explicit_binary_wins() {
        let runtime = ContainerRuntime::resolve(Some(RuntimeType::Docker), Some("/opt/dk".into()));
        assert_eq!(runtime.kind(), RuntimeType::Docker);
        assert_eq!(runtime.binary, "/opt/dk");
        assert_eq!(
            ContainerRuntime::resolve(Some(RuntimeType::Podman), None).binary,
            "podman"
        );
    }

    #[test]
    fn exec_flags_precede_container_id() {
        let options = ExecOptions {
            user: Some("th_alice".to_string()),
            workdir: Some("/home/th_alice".to_string()),
            env: vec![("HOME".to_string(), "/home/th_alice".to_string())],
        };
        let args = exec_argv(
            "termhub-pool-1",
            &options,
            &["/bin/bash".to_string(), "-lc".to_string(), "ls".to_string()],
        )
        .unwrap();

        assert_eq!(
            args,
            [
                "exec",
                "-u",
                "th_alice",
                "-w",
                "/home/th_alice",
                "-e",
                "HOME=/home/th_alice",
                "termhub-pool-1",
                "/bin/bash",
                "-lc",
                "ls"
            ]
        );
    }

    #[test]
    fn exec_rejects_bad_input() {
        let bad_id = exec_argv("bad id", &ExecOptions::default(), &["ls".into()]);
        assert!(matches!(bad_id, Err(ContainerError::InvalidInput(_))));
        let empty = exec_argv("ok", &ExecOptions::default(), &[]);
        assert!(matches!(empty, Err(ContainerError::InvalidInput(_))));
    }
}
