//! Connection and supervision settings for a tool server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_port_attempts() -> u32 {
    10
}

fn default_port_increment() -> u16 {
    1
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_readiness_timeout() -> u64 {
    5000
}

fn default_restart_backoff() -> u64 {
    1000
}

fn default_shutdown_grace() -> u64 {
    1000
}

fn default_readiness_markers() -> Vec<String> {
    vec![
        "server running".to_string(),
        "running on stdio".to_string(),
        "listening on".to_string(),
    ]
}

/// How the client reaches the tool server. Fixed for the client's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Spawn the server as a child process and talk over its stdio.
    #[default]
    OwnedProcess,
    /// Connect to an already-running server over TCP.
    ExternalSocket,
}

impl std::str::FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "owned_process" | "process" | "stdio" => Ok(Self::OwnedProcess),
            "external_socket" | "socket" | "tcp" => Ok(Self::ExternalSocket),
            other => Err(format!("unknown connection mode '{other}'")),
        }
    }
}

/// Configuration for one gateway client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: ConnectionMode,
    /// Command to run in owned-process mode (e.g., "node").
    #[serde(default)]
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the server process, e.g. a flag disabling an
    /// inbound listener that would fight over the port.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Environment variable that carries the port to the child.
    #[serde(default = "default_port_env")]
    pub port_env: String,
    /// Host for external-socket mode.
    #[serde(default = "default_host")]
    pub host: String,
    /// Initial port: handed to the child, or dialed in socket mode.
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many ports to try before giving up on startup.
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u32,
    #[serde(default = "default_port_increment")]
    pub port_increment: u16,
    /// Restarts allowed after the server exits unexpectedly.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Wait for a readiness line before assuming the server is up (ms).
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_ms: u64,
    /// Delay before restarting a crashed server (ms).
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_ms: u64,
    /// Time a server gets to exit on its own before it is killed (ms).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Case-insensitive substrings that mark the server as ready.
    #[serde(default = "default_readiness_markers")]
    pub readiness_markers: Vec<String>,
    /// Surface the server's stderr at info level.
    #[serde(default)]
    pub debug: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::default(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            port_env: default_port_env(),
            host: default_host(),
            port: default_port(),
            max_port_attempts: default_max_port_attempts(),
            port_increment: default_port_increment(),
            max_restart_attempts: default_max_restart_attempts(),
            readiness_timeout_ms: default_readiness_timeout(),
            restart_backoff_ms: default_restart_backoff(),
            shutdown_grace_ms: default_shutdown_grace(),
            readiness_markers: default_readiness_markers(),
            debug: false,
        }
    }
}

impl GatewayConfig {
    /// Owned-process config for `command args...`.
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            mode: ConnectionMode::OwnedProcess,
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    /// External-socket config for `host:port`.
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self {
            mode: ConnectionMode::ExternalSocket,
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_process_config() {
        let toml_str = r#"
mode = "owned_process"
command = "node"
args = ["dist/index.js"]
env = { HTTP_SERVER = "false" }
port = 4000
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mode, ConnectionMode::OwnedProcess);
        assert_eq!(config.command, "node");
        assert_eq!(config.args, vec!["dist/index.js"]);
        assert_eq!(config.env["HTTP_SERVER"], "false");
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_port_attempts, 10); // default
        assert_eq!(config.port_env, "PORT");
    }

    #[test]
    fn parse_socket_config() {
        let toml_str = r#"
mode = "external_socket"
host = "10.0.0.5"
port = 9000
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mode, ConnectionMode::ExternalSocket);
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.readiness_timeout(), Duration::from_secs(5));
        assert_eq!(config.restart_backoff(), Duration::from_secs(1));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(1));
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.port_increment, 1);
        assert!(!config.readiness_markers.is_empty());
        assert!(!config.debug);
    }

    #[test]
    fn connection_mode_from_str() {
        assert_eq!(
            "socket".parse::<ConnectionMode>().unwrap(),
            ConnectionMode::ExternalSocket
        );
        assert_eq!(
            "owned-process".parse::<ConnectionMode>().unwrap(),
            ConnectionMode::OwnedProcess
        );
        assert!("carrier-pigeon".parse::<ConnectionMode>().is_err());
    }
}
