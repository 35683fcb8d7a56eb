//! Environment bootstrap.
//!
//! Fresh user environments can be seeded from a skeleton directory on the host
//! (directory sandboxes) or by a script baked into the container image
//! (container backends). Both are resolved once at startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use walkdir::WalkDir;

use crate::config::BootstrapConfig;
use crate::container::validate_container_path;

#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    skel_dir: Option<PathBuf>,
    container_script: Option<String>,
}

impl Bootstrap {
    /// Resolve the configured sources, failing when a skeleton directory is
    /// configured but missing.
    pub fn resolve(config: &BootstrapConfig) -> Result<Self> {
        let skel_dir = match config.skel_dir.as_deref() {
            Some(raw) => {
                let expanded = shellexpand::full(raw).context("expanding skel_dir")?;
                let path = PathBuf::from(expanded.as_ref());
                if !path.is_dir() {
                    anyhow::bail!("bootstrap skeleton not found: {}", path.display());
                }
                Some(path)
            }
            None => None,
        };

        if let Some(script) = config.container_script.as_deref() {
            validate_container_path(script)
                .with_context(|| format!("invalid bootstrap script path: {script}"))?;
        }

        Ok(Self {
            skel_dir,
            container_script: config.container_script.clone(),
        })
    }

    pub fn skel_dir(&self) -> Option<&Path> {
        self.skel_dir.as_deref()
    }

    /// Command that bootstraps a container account whose home is `home`.
    pub fn container_command(&self, home: &str) -> Option<Vec<String>> {
        self.container_script
            .as_ref()
            .map(|script| vec![script.clone(), home.to_string()])
    }

    /// Copy the skeleton into `target`, leaving existing files alone.
    ///
    /// Returns the number of files copied.
    pub fn populate_dir(&self, target: &Path) -> Result<usize> {
        let Some(src) = self.skel_dir.as_deref() else {
            return Ok(0);
        };

        let mut copied = 0;
        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry.context("reading skeleton entry")?;
            let rel_path = entry
                .path()
                .strip_prefix(src)
                .context("getting relative path")?;
            let dest_path = target.join(rel_path);

            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest_path)
                    .with_context(|| format!("creating directory: {}", dest_path.display()))?;
            } else if !dest_path.exists() {
                if let Some(parent) = dest_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &dest_path)
                    .with_context(|| format!("copying file: {}", dest_path.display()))?;
                copied += 1;
            }
        }

        debug!("Copied {} skeleton file(s) into {}", copied, target.display());
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_skeleton_fails_fast() {
        let config = BootstrapConfig {
            skel_dir: Some("/definitely/not/here".to_string()),
            container_script: None,
        };
        assert!(Bootstrap::resolve(&config).is_err());
    }

    #[test]
    fn test_relative_script_rejected() {
        let config = BootstrapConfig {
            skel_dir: None,
            container_script: Some("setup.sh".to_string()),
        };
        assert!(Bootstrap::resolve(&config).is_err());
    }

    #[test]
    fn test_populate_keeps_existing_files() {
        let skel = tempfile::tempdir().unwrap();
        std::fs::write(skel.path().join(".bashrc"), "alias ll='ls -l'\n").unwrap();
        std::fs::create_dir(skel.path().join("docs")).unwrap();
        std::fs::write(skel.path().join("docs/README"), "hello\n").unwrap();

        let target = tempfile::tempdir().unwrap();
        std::fs::write(target.path().join(".bashrc"), "mine\n").unwrap();

        let bootstrap = Bootstrap::resolve(&BootstrapConfig {
            skel_dir: Some(skel.path().display().to_string()),
            container_script: None,
        })
        .unwrap();

        assert_eq!(bootstrap.populate_dir(target.path()).unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(target.path().join(".bashrc")).unwrap(),
            "mine\n"
        );
        assert_eq!(
            std::fs::read_to_string(target.path().join("docs/README")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn test_container_command() {
        let bootstrap = Bootstrap::resolve(&BootstrapConfig {
            skel_dir: None,
            container_script: Some("/opt/termhub/bootstrap.sh".to_string()),
        })
        .unwrap();
        assert_eq!(
            bootstrap.container_command("/home/th_a"),
            Some(vec![
                "/opt/termhub/bootstrap.sh".to_string(),
                "/home/th_a".to_string()
            ])
        );
        assert_eq!(Bootstrap::default().container_command("/home/x"), None);
    }
}
