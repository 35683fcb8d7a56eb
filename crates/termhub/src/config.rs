//! Application configuration.
//!
//! Every section deserializes with `#[serde(default)]` so a partial TOML file
//! (or none at all) yields a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::RuntimeType;
use crate::isolation::BackendKind;

/// Idle time after which a session expires.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

/// Interval of the idle-session sweeper.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Upper bound on output retained per command.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Upper bound on job events buffered per session for replay.
pub const DEFAULT_REPLAY_BUFFER_BYTES: usize = 256 * 1024;

/// How long buffered output waits for a reconnecting client.
pub const DEFAULT_RECONNECT_GRACE_SECS: u64 = 120;

pub const DEFAULT_MAX_COMMAND_LEN: usize = 4096;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub auth: AuthConfig,
    pub backend: BackendConfig,
    pub sandbox: SandboxConfig,
    pub container: ContainerRuntimeConfig,
    pub sessions: SessionsConfig,
    pub exec: ExecConfig,
    pub gateway: GatewayConfig,
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared API key. Authentication is disabled when unset.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Shell used to run forwarded commands.
    pub shell: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::DirectorySandbox,
            shell: "/bin/bash".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Parent directory of per-user roots. Defaults to `<data_dir>/sandboxes`.
    pub root: Option<String>,
    /// Keep a user's root after their last session ends.
    pub preserve_homes: bool,
    /// Wrap commands in bubblewrap when available.
    pub bubblewrap: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: None,
            preserve_homes: true,
            bubblewrap: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    /// Container runtime. Auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Custom path to the runtime binary.
    pub binary: Option<String>,
    pub image: String,
    /// Prefix for container names.
    pub name_prefix: String,
    pub max_containers: usize,
    pub users_per_container: usize,
    /// First uid handed out inside each shared container.
    pub uid_start: u32,
    pub account_prefix: String,
    /// Parent of account home directories inside shared containers.
    pub home_base: String,
    pub memory_limit: Option<String>,
    /// Fraction of one CPU per container.
    pub cpu_quota: Option<f64>,
    pub network_mode: Option<String>,
    pub provision_attempts: u32,
    pub provision_backoff_ms: u64,
    pub drain_timeout_secs: u64,
    /// Working directory inside dedicated containers.
    pub workdir: String,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "termhub-multi-user:latest".to_string(),
            name_prefix: "termhub-pool".to_string(),
            max_containers: 10,
            users_per_container: 20,
            uid_start: 2000,
            account_prefix: "th_".to_string(),
            home_base: "/home".to_string(),
            memory_limit: Some("512m".to_string()),
            cpu_quota: Some(0.5),
            network_mode: None,
            provision_attempts: 3,
            provision_backoff_ms: 500,
            drain_timeout_secs: 60,
            workdir: "/workspace".to_string(),
        }
    }
}

impl ContainerRuntimeConfig {
    pub fn provision_backoff(&self) -> Duration {
        Duration::from_millis(self.provision_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Session ceiling across all users.
    pub max_sessions: usize,
    /// Anonymous sessions kept provisioned ahead of demand.
    pub prewarm: usize,
    /// How long an expired session id can still be renewed.
    pub renew_window_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_sessions: 256,
            prewarm: 0,
            renew_window_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub max_command_len: usize,
    pub max_output_bytes: usize,
    /// Log a warning when a command runs longer than this. Never kills.
    pub warn_after_secs: Option<u64>,
    /// Terminate commands running longer than this (exit code 124).
    pub kill_after_secs: Option<u64>,
    /// Allow package and service manager commands.
    pub allow_system_commands: bool,
    /// Substrings that reject a command outright.
    pub denied_patterns: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            warn_after_secs: Some(30),
            kill_after_secs: None,
            allow_system_commands: true,
            denied_patterns: [
                "sudo ",
                "su ",
                "chmod 777 ",
                "chmod -R 777 ",
                "rm -rf /",
                "dd if=/dev/zero",
                "> /dev/sda",
                ":(){ :|:& };:",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub replay_buffer_bytes: usize,
    pub reconnect_grace_secs: u64,
    pub ping_interval_secs: u64,
    /// Per-connection outbound queue length.
    pub connection_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            replay_buffer_bytes: DEFAULT_REPLAY_BUFFER_BYTES,
            reconnect_grace_secs: DEFAULT_RECONNECT_GRACE_SECS,
            ping_interval_secs: 30,
            connection_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Host directory copied into every fresh sandbox root.
    pub skel_dir: Option<String>,
    /// Script inside the container image, run as the new account with its home as argument.
    pub container_script: Option<String>,
}
