//! Service configuration, loaded from YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tunrelay_stack::StackConfig;

use crate::error::{Result, ServiceError};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    /// Record every relayed packet for subscribers and trace sinks.
    #[serde(default)]
    pub capture: bool,
    #[serde(default)]
    pub stack: StackConfig,
}

impl ServiceConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_yaml(&yaml)?;
        tracing::info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.stack.validate().map_err(ServiceError::config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ServiceConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn nested_stack_settings() {
        let yaml = "log_level: debug\ncapture: true\nstack:\n  tcp:\n    mss: 1400\n  io:\n    core_workers: 4\n    max_workers: 16\n";
        let config = ServiceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.capture);
        assert_eq!(config.stack.tcp.mss, 1400);
        assert_eq!(config.stack.io.max_workers, 16);
        assert_eq!(config.stack.udp.idle_timeout_secs, 60);
    }

    #[test]
    fn invalid_stack_settings_are_rejected() {
        let err = ServiceConfig::from_yaml("stack:\n  io:\n    core_workers: 0\n").unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }

    #[test]
    fn unknown_log_level_fails_to_parse() {
        assert!(matches!(ServiceConfig::from_yaml("log_level: loud"), Err(ServiceError::Yaml(_))));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("tunrelay-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "log_level: warning\n").unwrap();
        let config = ServiceConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.log_level, LogLevel::Warning);
        assert!(ServiceConfig::load(&path).is_err());
    }
}
