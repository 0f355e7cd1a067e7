//! Process-wide configuration: listener defaults, autorun commands, and the
//! persistence file path. Loaded once at startup and threaded through
//! [`crate::Core::new`] as an explicit value — no singleton.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

fn default_name() -> String {
    "http".to_string()
}

fn default_delay() -> u32 {
    5
}

fn default_jitter() -> f64 {
    0.0
}

fn default_lost_limit() -> u32 {
    10
}

fn default_sqlite_path() -> String {
    "agents.db".to_string()
}

/// Mirrors the `listener_options` mapping described for `handle_agent_data`:
/// `Name`, `DefaultDelay`, `DefaultJitter`, `DefaultProfile`, `KillDate`,
/// `WorkingHours`, `DefaultLostLimit`, `SlackURL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerOptions {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_delay")]
    pub default_delay: u32,
    #[serde(default = "default_jitter")]
    pub default_jitter: f64,
    #[serde(default)]
    pub default_profile: String,
    #[serde(default)]
    pub kill_date: String,
    #[serde(default)]
    pub working_hours: String,
    #[serde(default = "default_lost_limit")]
    pub default_lost_limit: u32,
    #[serde(default)]
    pub slack_url: String,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            default_delay: default_delay(),
            default_jitter: default_jitter(),
            default_profile: String::new(),
            kill_date: String::new(),
            working_hours: String::new(),
            default_lost_limit: default_lost_limit(),
            slack_url: String::new(),
        }
    }
}

/// Commands to enqueue on first successful STAGE2 activation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutorunConfig {
    #[serde(default)]
    pub global_command: String,
    #[serde(default)]
    pub global_data: String,
    #[serde(default)]
    pub powershell: Vec<String>,
    #[serde(default)]
    pub python: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// Top-level configuration document. Every field has a default, so a
/// missing file is equivalent to `CoreConfig::default()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub install_path: String,
    #[serde(default)]
    pub listener_options: ListenerOptions,
    #[serde(default)]
    pub autorun: AutorunConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl CoreConfig {
    /// Load from a YAML file. A missing file yields defaults; a malformed
    /// one is a typed [`AgentError::Config`].
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_yaml::from_str(&text)
                .map_err(|e| AgentError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AgentError::Config(format!("{}: {e}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CoreConfig::load(Path::new("/nonexistent/path/empire.yaml")).unwrap();
        assert_eq!(cfg.listener_options.name, "http");
        assert_eq!(cfg.persistence.sqlite_path, "agents.db");
    }

    #[test]
    fn parses_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empire.yaml");
        std::fs::write(
            &path,
            "install_path: /opt/empire-core\nlistener_options:\n  name: https\n",
        )
        .unwrap();
        let cfg = CoreConfig::load(&path).unwrap();
        assert_eq!(cfg.install_path, "/opt/empire-core");
        assert_eq!(cfg.listener_options.name, "https");
        assert_eq!(cfg.listener_options.default_delay, 5);
    }

    #[test]
    fn malformed_yaml_is_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empire.yaml");
        std::fs::write(&path, "install_path: [unterminated\n").unwrap();
        assert!(matches!(
            CoreConfig::load(&path),
            Err(AgentError::Config(_))
        ));
    }
}
