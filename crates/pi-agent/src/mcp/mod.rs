pub mod bridge;
pub mod client;
pub mod config;
pub mod http;
pub mod protocol;
pub mod server;
pub mod stdio;

use async_trait::async_trait;
use protocol::{
    JsonRpcError,
    JsonRpcNotification,
    JsonRpcResponse,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("Server spawn was refused by the approval predicate")]
    SpawnRefused,
    #[error("Failed to spawn server process: {}", .0)]
    Spawn(String),
    #[error("The transport is closed")]
    Closed,
    #[error("The request was cancelled")]
    Cancelled,
    #[error("Failed to encode or decode a message: {}", .0)]
    Serialization(String),
    #[error("Invalid frame received: {}", .0)]
    Frame(String),
    #[error("HTTP request failed: {}", .0)]
    Http(String),
    #[error("Server returned an error: {} (code {})", .0.message, .0.code)]
    Rpc(JsonRpcError),
    #[error("Handshake with the server failed: {}", .0)]
    Handshake(String),
    #[error("The operation timed out")]
    Timeout,
    #[error("{}", .0)]
    Custom(String),
}

impl From<serde_json::Error> for McpError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// A bidirectional JSON-RPC channel to an MCP server.
///
/// `send` correlates the response by JSON-RPC id; `notify` expects no
/// response; `take_notifications` hands out the stream of server-initiated
/// notifications (once); `close` is idempotent.
#[async_trait]
pub trait McpTransport: Send + Sync + std::fmt::Debug {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        cancel_token: &CancellationToken,
    ) -> Result<JsonRpcResponse, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Takes ownership of the notifications receiver. Returns [None] after the
    /// first call.
    fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>>;

    async fn close(&self) -> Result<(), McpError>;
}
