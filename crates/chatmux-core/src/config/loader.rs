//! Configuration loading and persistence.

use super::Config;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the connect auth token.
pub const AUTH_TOKEN_ENV: &str = "CHATMUX_AUTH_TOKEN";

/// Environment variable overriding the gateway port.
pub const PORT_ENV: &str = "CHATMUX_PORT";

impl Config {
    /// Default config file location (`~/.chatmux/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chatmux")
            .join("config.json")
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(&Self::default_path())
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string. Accepts JSON with comments.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Json5(e.to_string()))
    }

    /// Load from the default path, falling back to defaults if no file exists.
    /// Environment overrides are applied either way.
    pub fn load_or_default() -> Self {
        let mut config = match Self::load_default() {
            Ok(config) => config,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
            if !token.is_empty() {
                self.gateway.auth_token = Some(token);
            }
        }
        if let Some(port) = std::env::var(PORT_ENV)
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
        {
            self.gateway.port = port;
        }
    }

    /// Save configuration to a file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Validate the configuration, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.gateway.port == 0 {
            errors.push("Gateway port cannot be 0".to_string());
        }

        if self.gateway.max_connections == 0 {
            errors.push("Gateway max_connections must be greater than 0".to_string());
        }

        if self.worker.program.is_empty() {
            errors.push("Worker program must not be empty".to_string());
        }

        if self.worker.max == 0 {
            errors.push("Worker pool max must be greater than 0".to_string());
        }

        if self.worker.min > self.worker.max {
            errors.push(format!(
                "Worker pool min ({}) exceeds max ({})",
                self.worker.min, self.worker.max
            ));
        }

        if self.worker.health_check_failures == 0 {
            errors.push("Worker health_check_failures must be greater than 0".to_string());
        }

        if self.session.evict_after_secs < self.session.idle_timeout_secs {
            errors.push(format!(
                "Session evict_after_secs ({}) is shorter than idle_timeout_secs ({})",
                self.session.evict_after_secs, self.session.idle_timeout_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let content = r#"{
            // workers are spawned on demand up to max
            "worker": { "max": 8 }
        }"#;

        let config = Config::parse(content).unwrap();
        assert_eq!(config.worker.max, 8);
        assert_eq!(config.worker.min, 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Config::parse("not json at all {{{").is_err());
    }

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.gateway.port = 0;
        let result = config.validate();
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("port"), "Error should mention port: {}", err_msg);
    }

    #[test]
    fn test_validate_min_exceeds_max() {
        let mut config = Config::default();
        config.worker.min = 5;
        config.worker.max = 2;
        let result = config.validate();
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("min"), "Error should mention min: {}", err_msg);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.gateway.port = 0;
        config.worker.program = String::new();
        config.worker.health_check_failures = 0;

        let result = config.validate();
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("port"), "Should contain port error: {}", err_msg);
        assert!(err_msg.contains("program"), "Should contain program error: {}", err_msg);
        assert!(
            err_msg.contains("health_check_failures"),
            "Should contain health check error: {}",
            err_msg
        );
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.worker.max = 7;
        config.gateway.port = 9100;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.worker.max, 7);
        assert_eq!(loaded.gateway.port, 9100);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/chatmux/config.json"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
