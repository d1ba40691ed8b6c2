//! Error types for gateway operations.

use std::sync::Arc;
use thiserror::Error;

/// Errors from starting, supervising, or calling a tool server.
///
/// The type is `Clone` because one failure (a drained transport, a permanent
/// stop) is delivered to every caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Failed to spawn tool server '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: Arc<std::io::Error>,
    },

    #[error("Failed to connect to tool server at {addr}: {message}")]
    ConnectFailed { addr: String, message: String },

    #[error("Tool server could not bind a port: tried {attempts} ports ({first_port}..={last_port})")]
    PortsExhausted {
        attempts: u32,
        first_port: u16,
        last_port: u16,
    },

    #[error("Tool server exited before becoming ready (exit code {code:?})")]
    ExitedBeforeReady { code: Option<i32> },

    #[error("Tool server kept exiting; gave up after {attempts} restarts")]
    RestartsExhausted { attempts: u32 },

    #[error("Connection to tool server closed")]
    ConnectionClosed,

    #[error("No connection to tool server")]
    NoConnection,

    #[error("Broken pipe while writing to tool server: {0}")]
    BrokenPipe(Arc<std::io::Error>),

    #[error("Tool server disconnected before responding")]
    Disconnected,

    #[error("Gateway client is stopped")]
    Stopped,

    #[error("Request id '{0}' is already pending")]
    DuplicateRequestId(String),

    #[error("Invalid response from tool server: {0}")]
    InvalidResponse(String),

    #[error("JSON-RPC error (code {code}): {message}")]
    JsonRpc { code: i64, message: String },

    #[error("{0}")]
    ToolFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Whether this error means the transport went away (as opposed to the
    /// tool itself reporting a failure).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::NoConnection
                | GatewayError::BrokenPipe(_)
                | GatewayError::Disconnected
                | GatewayError::ConnectionClosed
                | GatewayError::Stopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_exhausted_message_names_attempts() {
        let err = GatewayError::PortsExhausted {
            attempts: 3,
            first_port: 4000,
            last_port: 4002,
        };
        let msg = err.to_string();
        assert!(msg.contains("tried 3 ports"), "{msg}");
        assert!(msg.contains("4000..=4002"), "{msg}");
    }

    #[test]
    fn tool_failure_displays_bare_text() {
        let err = GatewayError::ToolFailed("rate limited".into());
        assert_eq!(err.to_string(), "rate limited");
        assert!(!err.is_transport());
    }

    #[test]
    fn transport_errors_are_classified() {
        assert!(GatewayError::NoConnection.is_transport());
        assert!(GatewayError::Disconnected.is_transport());
        assert!(
            GatewayError::BrokenPipe(Arc::new(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe
            )))
            .is_transport()
        );
        assert!(
            !GatewayError::JsonRpc {
                code: -32601,
                message: "nope".into()
            }
            .is_transport()
        );
    }
}
