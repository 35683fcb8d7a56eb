//! `run` parameters for pool and dedicated containers.
//!
//! Every field lands on an engine command line, so [`ContainerConfig::validate`]
//! must pass before [`ContainerConfig::run_args`] is used.

use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub name: Option<String>,
    /// Ignored under host networking.
    pub hostname: Option<String>,
    /// Entrypoint override; empty keeps the image default.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub network_mode: Option<String>,
    /// Engine syntax, e.g. `512m`.
    pub memory_limit: Option<String>,
    pub cpus: Option<f64>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn hostname(self, hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..self
        }
    }

    pub fn command(self, command: Vec<String>) -> Self {
        Self { command, ..self }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn workdir(self, dir: impl Into<String>) -> Self {
        Self {
            workdir: Some(dir.into()),
            ..self
        }
    }

    pub fn network_mode(self, network_mode: Option<String>) -> Self {
        Self {
            network_mode,
            ..self
        }
    }

    pub fn limits(self, memory_limit: Option<String>, cpus: Option<f64>) -> Self {
        Self {
            memory_limit,
            cpus,
            ..self
        }
    }

    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        for name in self.name.iter().chain(&self.hostname) {
            validate_container_name(name)?;
        }
        self.env.keys().try_for_each(|k| validate_env_key(k))?;
        self.labels.keys().try_for_each(|k| validate_label_key(k))?;
        if let Some(dir) = &self.workdir {
            validate_container_path(dir)?;
        }
        if let Some(memory) = &self.memory_limit {
            validate_memory(memory)?;
        }
        match self.cpus {
            Some(cpus) if !(cpus.is_finite() && cpus > 0.0) => {
                Err(invalid(format!("cpus must be positive, got {cpus}")))
            }
            _ => Ok(()),
        }
    }

    /// `run -d [flags...] <image> [command...]`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        let mut flag = |name: &str, value: String| {
            args.push(name.to_string());
            args.push(value);
        };

        if let Some(name) = &self.name {
            flag("--name", name.clone());
        }
        match (&self.hostname, self.network_mode.as_deref()) {
            (Some(_), Some("host")) | (None, _) => {}
            (Some(hostname), _) => flag("--hostname", hostname.clone()),
        }
        if let Some(network) = &self.network_mode {
            flag("--network", network.clone());
        }
        if let Some(memory) = &self.memory_limit {
            flag("--memory", memory.clone());
        }
        if let Some(cpus) = self.cpus {
            flag("--cpus", cpus.to_string());
        }
        for (key, value) in &self.labels {
            flag("--label", format!("{key}={value}"));
        }
        for (key, value) in &self.env {
            flag("-e", format!("{key}={value}"));
        }
        if let Some(dir) = &self.workdir {
            flag("-w", dir.clone());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

fn invalid(message: impl Into<String>) -> ContainerError {
    ContainerError::InvalidInput(message.into())
}

/// Non-empty, at most `max_len` bytes, only `allowed` characters.
fn check_token(
    what: &str,
    value: &str,
    max_len: usize,
    allowed: impl Fn(char) -> bool,
) -> ContainerResult<()> {
    if value.is_empty() {
        return Err(invalid(format!("{what} is empty")));
    }
    if value.len() > max_len {
        return Err(invalid(format!("{what} longer than {max_len} bytes")));
    }
    match value.chars().find(|c| !allowed(*c)) {
        Some(bad) => Err(invalid(format!("{what} {value:?} contains {bad:?}"))),
        None => Ok(()),
    }
}

pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    check_token("image", image, 256, |c| {
        c.is_ascii_alphanumeric() || "._-/:@".contains(c)
    })?;
    if image.contains("..") {
        return Err(invalid(format!("image {image:?} contains '..'")));
    }
    Ok(())
}

/// Names, hostnames and ids share one rule: `[A-Za-z0-9_][A-Za-z0-9_-]*`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    check_token("container name", name, 128, |c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })?;
    if name.starts_with('-') {
        return Err(invalid(format!("container name {name:?} starts with '-'")));
    }
    Ok(())
}

fn validate_env_key(key: &str) -> ContainerResult<()> {
    check_token("env key", key, 256, |c| c.is_ascii_alphanumeric() || c == '_')?;
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid(format!("env key {key:?} starts with a digit")));
    }
    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    check_token("label key", key, 256, |c| {
        c.is_ascii_alphanumeric() || "._-".contains(c)
    })
}

/// Absolute, NUL-free, without `..` segments.
pub fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(invalid(format!("path {path:?} is not absolute")));
    }
    if path.contains('\0') || path.split('/').any(|seg| seg == "..") {
        return Err(invalid(format!("path {path:?} is not allowed")));
    }
    Ok(())
}

fn validate_memory(limit: &str) -> ContainerResult<()> {
    let number = limit.trim_end_matches(|c: char| "bkmgBKMG".contains(c));
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("memory limit {limit:?} is not valid")));
    }
    Ok(())
}
