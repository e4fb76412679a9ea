//! Agency configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via DIDBOT_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Agency configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multiplexer configuration.
    pub multiplexer: MultiplexerConfig,
    /// Machine configuration.
    pub machine: MachineConfig,
    /// Console configuration.
    pub console: ConsoleConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DIDBOT_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.multiplexer.apply_env_overrides();
        self.machine.apply_env_overrides();
        self.console.apply_env_overrides();
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplexer.conversation_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "multiplexer.conversation_buffer must be at least 1".to_string(),
            ));
        }
        if self.multiplexer.inbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "multiplexer.inbound_buffer must be at least 1".to_string(),
            ));
        }
        if self.console.conn_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "console.conn_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Multiplexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Capacity of each conversation's notification and hook channels.
    pub conversation_buffer: usize,
    /// Capacity of the shared inbound notification channel.
    pub inbound_buffer: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            conversation_buffer: 16,
            inbound_buffer: 64,
        }
    }
}

impl MultiplexerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(size) = std::env::var("DIDBOT_CONVERSATION_BUFFER") {
            if let Ok(n) = size.parse() {
                self.conversation_buffer = n;
            }
        }

        if let Ok(size) = std::env::var("DIDBOT_INBOUND_BUFFER") {
            if let Ok(n) = size.parse() {
                self.inbound_buffer = n;
            }
        }
    }
}

/// Machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Machine definition file used when none is given on the command line.
    pub path: Option<PathBuf>,
    /// Attach a Lua evaluator to machines that use `LUA` rules.
    pub scripts: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            path: None,
            scripts: true,
        }
    }
}

impl MachineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DIDBOT_MACHINE") {
            if !path.is_empty() {
                self.path = Some(PathBuf::from(path));
            }
        }

        if let Ok(scripts) = std::env::var("DIDBOT_SCRIPTS") {
            self.scripts = scripts == "1" || scripts.to_lowercase() == "true";
        }
    }
}

/// Interactive console configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Connection id the console conversation runs under.
    pub conn_id: String,
    /// History file; defaults to `~/.didbot_history`.
    pub history_file: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            conn_id: "console".to_string(),
            history_file: None,
        }
    }
}

impl ConsoleConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(conn_id) = std::env::var("DIDBOT_CONN_ID") {
            if !conn_id.is_empty() {
                self.conn_id = conn_id;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.multiplexer.conversation_buffer, 16);
        assert_eq!(config.multiplexer.inbound_buffer, 64);
        assert!(config.machine.scripts);
        assert!(config.machine.path.is_none());
        assert_eq!(config.console.conn_id, "console");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("didbot.yaml");
        std::fs::write(
            &path,
            "multiplexer:\n  conversation_buffer: 4\nmachine:\n  path: bots/echo.yaml\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.multiplexer.conversation_buffer, 4);
        assert_eq!(config.multiplexer.inbound_buffer, 64);
        assert_eq!(config.machine.path, Some(PathBuf::from("bots/echo.yaml")));
        assert!(config.machine.scripts);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/didbot.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_, _))));
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "multiplexer: [not, a, map]\n").unwrap();

        let result = Config::from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_, _))));
    }

    #[test]
    fn test_validate_zero_buffer() {
        let mut config = Config::default();
        config.multiplexer.conversation_buffer = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.console.conn_id, config.console.conn_id);
    }
}
