//! Configuration for the sockrpc daemon.

use serde::{Deserialize, Serialize};
use sockrpc_ipc::{Endpoint, IpcError, ServerOptions};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Host to bind. Absent means every address of this machine.
    #[serde(default)]
    pub host: Option<String>,

    /// Numeric TCP port, or a Unix socket path
    #[serde(default = "default_port", deserialize_with = "port_token")]
    pub port: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Largest accepted request, in bytes (default: unbounded)
    #[serde(default)]
    pub max_request_len: Option<usize>,

    /// How requests are answered
    #[serde(default)]
    pub handler: HandlerConfig,

    /// PID file path
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

/// Request handler selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Reply with the request bytes
    #[default]
    Echo,

    /// Run a program with the request on stdin; its stdout is the reply
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Accept `port: 9999` as well as `port: "9999"`
fn port_token<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Number(u64),
        Text(String),
    }

    Ok(match Token::deserialize(deserializer)? {
        Token::Number(n) => n.to_string(),
        Token::Text(s) => s,
    })
}

fn default_port() -> String {
    "/tmp/sockrpc.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/sockrpc.pid")
}

/// Default location of the configuration file
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sockrpc")
        .join("config.yaml")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            log_level: default_log_level(),
            max_request_len: None,
            handler: HandlerConfig::default(),
            pid_file: default_pid_file(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default file, falling back to defaults
    pub fn load() -> Self {
        let config_path = default_config_path();

        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config file: {}", e);
                }
            }
        }

        Self::default()
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// The endpoint to bind
    pub fn endpoint(&self) -> Result<Endpoint, IpcError> {
        Endpoint::parse(self.host.as_deref(), &self.port)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_request_len: self.max_request_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.host, None);
        assert_eq!(config.port, "/tmp/sockrpc.sock");
        assert_eq!(config.handler, HandlerConfig::Echo);
        assert_eq!(config.max_request_len, None);
    }

    #[test]
    fn test_default_endpoint_is_unix() {
        let endpoint = DaemonConfig::default().endpoint().unwrap();
        assert!(endpoint.unix_path().is_some());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
host: localhost
port: "9999"
max_request_len: 65536
handler:
  kind: exec
  program: /usr/bin/tr
  args: ["a-z", "A-Z"]
"#;
        let config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.host.as_deref(), Some("localhost"));
        assert_eq!(config.endpoint().unwrap().port(), Some(9999));
        assert_eq!(config.server_options().max_request_len, Some(65536));
        assert_eq!(
            config.handler,
            HandlerConfig::Exec {
                program: "/usr/bin/tr".to_string(),
                args: vec!["a-z".to_string(), "A-Z".to_string()],
            }
        );
        // Unset fields keep their defaults
        assert_eq!(config.log_level, "info");
        assert_eq!(config.pid_file, PathBuf::from("/tmp/sockrpc.pid"));
    }

    #[test]
    fn test_unquoted_numeric_port() {
        let config: DaemonConfig = serde_yaml::from_str("port: 8080\n").unwrap();
        assert_eq!(config.port, "8080");
        assert_eq!(config.endpoint().unwrap().port(), Some(8080));
    }

    #[test]
    fn test_remote_host_with_socket_path_rejected() {
        let config = DaemonConfig {
            host: Some("example.org".to_string()),
            ..DaemonConfig::default()
        };
        assert!(config.endpoint().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: /run/sockrpc.sock\nlog_level: debug\n").unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.port, "/run/sockrpc.sock");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_from_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "handler: [not, a, handler]\n").unwrap();

        let err = DaemonConfig::load_from(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.port, parsed.port);
        assert_eq!(config.handler, parsed.handler);
    }
}
