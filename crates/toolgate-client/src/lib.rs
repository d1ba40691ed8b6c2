//! Resilient JSON-RPC tool client for toolgate.
//!
//! Talks newline-delimited JSON-RPC 2.0 to a tool server, either a child
//! process it spawns and supervises or an already-running server reached over
//! TCP. Port conflicts at startup are resolved by moving to the next port;
//! crashes after startup are restarted within a bounded budget. Callers only
//! see [`GatewayClient`]: `start`, `list_tools`, `call_tool`, `stop`.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod router;
pub mod supervisor;
mod transport;

pub use client::{GatewayClient, ToolDescriptor};
pub use config::{ConnectionMode, GatewayConfig};
pub use error::GatewayError;
pub use supervisor::{Phase, SupervisorStatus};
pub use transport::CloseCause;
