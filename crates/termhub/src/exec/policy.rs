//! Command admission policy.

use crate::config::ExecConfig;
use crate::error::{Error, Result};

/// Package and service managers, rejected when system commands are disabled.
const SYSTEM_COMMANDS: &[&str] = &[
    "apt", "apt-get", "yum", "dnf", "pacman", "systemctl", "service",
];

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    pub max_len: usize,
    pub denied_patterns: Vec<String>,
    pub allow_system_commands: bool,
}

impl CommandPolicy {
    pub fn from_config(config: &ExecConfig) -> Self {
        Self {
            max_len: config.max_command_len,
            denied_patterns: config.denied_patterns.clone(),
            allow_system_commands: config.allow_system_commands,
        }
    }

    /// Reject commands that are empty, too long or match the deny list.
    pub fn check(&self, command: &str) -> Result<()> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("Command cannot be empty"));
        }
        if command.len() > self.max_len {
            return Err(Error::validation(format!(
                "Command exceeds maximum length of {} characters",
                self.max_len
            )));
        }

        if let Some(pattern) = self
            .denied_patterns
            .iter()
            .find(|p| contains_at_word_start(trimmed, p))
        {
            return Err(Error::validation(format!(
                "Command not allowed: contains '{}'",
                pattern.trim()
            )));
        }

        if !self.allow_system_commands {
            let program = trimmed.split_whitespace().next().unwrap_or_default();
            if SYSTEM_COMMANDS.contains(&program) {
                return Err(Error::validation(format!(
                    "System command '{program}' is not allowed"
                )));
            }
        }

        Ok(())
    }
}

/// `pattern` occurring at a word start: `su ` matches `su root` and
/// `ls; su root` but not `visu x`.
fn contains_at_word_start(command: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    command.match_indices(pattern).any(|(i, _)| {
        command[..i]
            .chars()
            .next_back()
            .is_none_or(|c| c.is_whitespace() || matches!(c, ';' | '|' | '&' | '(' | '`'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CommandPolicy {
        CommandPolicy::from_config(&ExecConfig::default())
    }

    #[test]
    fn test_rejects_empty_and_long_commands() {
        let policy = policy();
        assert!(matches!(policy.check("   "), Err(Error::Validation(_))));
        let long = "x".repeat(policy.max_len + 1);
        assert!(matches!(policy.check(&long), Err(Error::Validation(_))));
        assert!(policy.check("ls -la").is_ok());
    }

    #[test]
    fn test_denied_patterns_match_word_starts() {
        let policy = policy();
        assert!(policy.check("sudo rm x").is_err());
        assert!(policy.check("ls; su root").is_err());
        assert!(policy.check("rm -rf /").is_err());
        assert!(policy.check("echo visu alize").is_ok());
    }

    #[test]
    fn test_system_commands() {
        let mut policy = policy();
        assert!(policy.check("apt-get install vim").is_ok());
        policy.allow_system_commands = false;
        assert!(policy.check("apt-get install vim").is_err());
        assert!(policy.check("echo apt").is_ok());
    }
}
