//! Server configuration: defaults, then an optional YAML file, then CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Deserialize;
use tcp_server::{DEFAULT_GROWTH_STEP, LoopConfig};
use tracing::Level;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Protocol spoken on accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Write back whatever the client sent
    Echo,
    /// Answer every request with a short plain-text 200
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub poll_timeout_ms: u64,
    pub growth_step: usize,
    /// Connections beyond this many are closed as soon as they are accepted.
    pub max_connections: Option<usize>,
    pub handler: HandlerKind,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: 8080,
            poll_timeout_ms: 1,
            growth_step: DEFAULT_GROWTH_STEP,
            max_connections: None,
            handler: HandlerKind::Http,
            log_level: "info".into(),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Args)]
pub struct Overrides {
    /// IPv4 address to listen on
    #[arg(long)]
    pub address: Option<String>,
    /// TCP port to listen on
    #[arg(long, short)]
    pub port: Option<u16>,
    /// Upper bound on shutdown latency with no traffic
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,
    /// Registry entries added per reallocation
    #[arg(long)]
    pub growth_step: Option<usize>,
    /// Close connections accepted beyond this many
    #[arg(long)]
    pub max_connections: Option<usize>,
    /// Connection handler
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,
    /// trace, debug, info, warn or error
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ServerConfig {
    /// Read a YAML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, overlaid by `path` if given, overlaid by `overrides`.
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, overrides: Overrides) {
        if let Some(address) = overrides.address {
            self.address = address;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(ms) = overrides.poll_timeout_ms {
            self.poll_timeout_ms = ms;
        }
        if let Some(step) = overrides.growth_step {
            self.growth_step = step;
        }
        if let Some(max) = overrides.max_connections {
            self.max_connections = Some(max);
        }
        if let Some(handler) = overrides.handler {
            self.handler = handler;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_timeout_ms must be at least 1".into(),
            ));
        }
        if self.growth_step == 0 {
            return Err(ConfigError::Invalid("growth_step must be at least 1".into()));
        }
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)))?;
        Ok(())
    }

    pub fn level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            growth_step: self.growth_step,
            max_connections: self.max_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, yaml: &str) -> PathBuf {
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let config = ServerConfig::resolve(None, Overrides::default()).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.loop_config(), LoopConfig::default());
        assert_eq!(config.level(), Level::INFO);
    }

    #[test]
    fn file_values_replace_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "address: 127.0.0.1\nport: 9000\nhandler: echo\ngrowth_step: 64\n",
        );

        let config = ServerConfig::resolve(Some(path.as_path()), Overrides::default()).unwrap();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.handler, HandlerKind::Echo);
        assert_eq!(config.growth_step, 64);
        // Untouched keys keep their defaults.
        assert_eq!(config.poll_timeout_ms, 1);
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "port: 9000\nlog_level: warn\n");

        let overrides = Overrides {
            port: Some(9100),
            poll_timeout_ms: Some(25),
            log_level: Some("debug".into()),
            ..Overrides::default()
        };
        let config = ServerConfig::resolve(Some(path.as_path()), overrides).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.level(), Level::DEBUG);
        assert_eq!(
            config.loop_config().poll_timeout,
            Duration::from_millis(25)
        );
    }

    #[test]
    fn connection_limit_from_file_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "max_connections: 100\n");

        let config = ServerConfig::resolve(Some(path.as_path()), Overrides::default()).unwrap();
        assert_eq!(config.loop_config().max_connections, Some(100));

        let overrides = Overrides {
            max_connections: Some(5),
            ..Overrides::default()
        };
        let config = ServerConfig::resolve(Some(path.as_path()), overrides).unwrap();
        assert_eq!(config.loop_config().max_connections, Some(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "prot: 9000\n");

        let err = ServerConfig::resolve(Some(path.as_path()), Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn missing_file_reports_path() {
        let path = PathBuf::from("/nonexistent/server.yaml");
        let err = ServerConfig::resolve(Some(path.as_path()), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/server.yaml"), "{err}");
    }

    #[test]
    fn zero_values_are_invalid() {
        for overrides in [
            Overrides {
                poll_timeout_ms: Some(0),
                ..Overrides::default()
            },
            Overrides {
                growth_step: Some(0),
                ..Overrides::default()
            },
            Overrides {
                log_level: Some("loud".into()),
                ..Overrides::default()
            },
        ] {
            let err = ServerConfig::resolve(None, overrides).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
        }
    }
}
