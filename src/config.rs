//! YAML configuration file, loaded once at startup.
//!
//! Covers server port, logging, the current shimlet selection, per-shimlet
//! config paths, model-directory root, and the reconciler worker pool's
//! tuning knobs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read config file {}: {}", path.display(), source))]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {}: {}", path.display(), source))]
    Parse {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(rename = "current-shimlet")]
    pub current_shimlet: String,
    #[serde(default)]
    pub shimlets: BTreeMap<String, ShimletConfig>,
    #[serde(rename = "model-manage", default)]
    pub model_manage: ModelManageConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "maxSize", default)]
    pub max_size: u32,
    #[serde(rename = "maxAge", default)]
    pub max_age: u32,
    #[serde(default)]
    pub compress: bool,
    #[serde(rename = "showLine", default)]
    pub show_line: bool,
    #[serde(rename = "enableConsole", default = "default_true")]
    pub enable_console: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShimletConfig {
    #[serde(rename = "config-path")]
    pub config_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelManageConfig {
    #[serde(rename = "model-root", default)]
    pub model_root: String,
}

/// Knobs for the reconciler worker pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

fn default_workers() -> usize {
    5
}
fn default_retry_interval_secs() -> u64 {
    10
}
fn default_resync_interval_secs() -> u64 {
    300
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            workers: default_workers(),
            retry_interval_secs: default_retry_interval_secs(),
            resync_interval_secs: default_resync_interval_secs(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|_| ReadSnafu { path })?;
        serde_yaml::from_slice(&bytes).with_context(|_| ParseSnafu { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
current-shimlet: k8s
shimlets:
  k8s:
    config-path: /etc/modserv/k8s.yaml
model-manage:
  model-root: /models
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.current_shimlet, "k8s");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.reconciler.workers, 5);
        assert_eq!(
            config.shimlets.get("k8s").unwrap().config_path,
            "/etc/modserv/k8s.yaml"
        );
        assert_eq!(config.model_manage.model_root, "/models");
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Config::load("/nonexistent/modserv.yaml").unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }
}
