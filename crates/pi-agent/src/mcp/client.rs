use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

use super::McpError;
use super::McpTransport;
use super::protocol::{
    CallToolParams,
    CallToolResult,
    Implementation,
    InitializeParams,
    InitializeResult,
    JsonRpcResponse,
    ListResourcesResult,
    ListToolsResult,
    MCP_PROTOCOL_VERSION,
    McpToolInfo,
    ReadResourceResult,
};

/// Timeout applied to a notification-driven tool refresh.
const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// An MCP client: handshake, tool listing/invocation, and resource access
/// over a [McpTransport].
#[derive(Debug)]
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn McpTransport>,
    init_result: std::sync::Mutex<Option<InitializeResult>>,
    tools: Arc<std::sync::Mutex<Vec<McpToolInfo>>>,
    /// One-slot guard coalescing concurrent refreshes.
    refresh_semaphore: Arc<Semaphore>,
    cancel_token: CancellationToken,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Performs the initialize handshake and starts the notification
    /// dispatcher.
    pub async fn connect(server_name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Result<Arc<Self>, McpError> {
        let server_name = server_name.into();
        let cancel_token = CancellationToken::new();

        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: Implementation {
                name: "pi-agent".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let response = transport
            .send("initialize", Some(serde_json::to_value(&params)?), &cancel_token)
            .await?;
        let init_result: InitializeResult = expect_result(response)
            .map_err(|err| McpError::Handshake(err.to_string()))?;
        info!(
            server_name,
            server = %init_result.server_info.name,
            version = %init_result.server_info.version,
            "MCP server initialized"
        );

        transport.notify("notifications/initialized", None).await?;

        let client = Arc::new(Self {
            server_name,
            transport,
            init_result: std::sync::Mutex::new(Some(init_result)),
            tools: Arc::new(std::sync::Mutex::new(Vec::new())),
            refresh_semaphore: Arc::new(Semaphore::new(1)),
            cancel_token,
            dispatcher: std::sync::Mutex::new(None),
        });

        if let Ok(tools) = client.list_tools().await {
            debug!(server_name = %client.server_name, count = tools.len(), "initial tool list fetched");
        }

        start_dispatcher(&client);
        Ok(client)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Identity and capabilities reported by the server at initialize.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.init_result.lock().expect("init lock poisoned").clone()
    }

    /// The most recently fetched tool list.
    pub fn cached_tools(&self) -> Vec<McpToolInfo> {
        self.tools.lock().expect("tools lock poisoned").clone()
    }

    /// Fetches the server's tool list and refreshes the cache.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let response = self.transport.send("tools/list", None, &self.cancel_token).await?;
        let result: ListToolsResult = expect_result(response)?;
        *self.tools.lock().expect("tools lock poisoned") = result.tools.clone();
        Ok(result.tools)
    }

    /// Invokes a remote tool.
    ///
    /// RPC-level errors are translated into `is_error` results rather than
    /// transport errors so the model gets to see them.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let response = self
            .transport
            .send("tools/call", Some(serde_json::to_value(&params)?), &self.cancel_token)
            .await?;
        if let Some(error) = response.error {
            return Ok(CallToolResult::error_text(format!(
                "Tool call failed: {} (code {})",
                error.message, error.code
            )));
        }
        let result = response.result.unwrap_or_default();
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        let response = self.transport.send("resources/list", None, &self.cancel_token).await?;
        expect_result(response)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let response = self
            .transport
            .send(
                "resources/read",
                Some(serde_json::json!({ "uri": uri })),
                &self.cancel_token,
            )
            .await?;
        expect_result(response)
    }

    pub async fn close(&self) -> Result<(), McpError> {
        self.cancel_token.cancel();
        let dispatcher = self.dispatcher.lock().expect("dispatcher lock poisoned").take();
        self.transport.close().await?;
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
        Ok(())
    }

}

/// Dispatches server-initiated notifications.
///
/// A `tools/list_changed` triggers a tool refresh unless one is already in
/// flight, in which case the notification is dropped.
fn start_dispatcher(client: &Arc<McpClient>) {
    let Some(mut notifications_rx) = client.transport.take_notifications() else {
        warn!(server_name = %client.server_name, "transport notifications already taken");
        return;
    };

    let client_clone = Arc::clone(client);
    let cancel_token = client.cancel_token.clone();
    let handle = tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                n = notifications_rx.recv() => n,
                _ = cancel_token.cancelled() => break,
            };
            let Some(notification) = notification else {
                break;
            };
            debug!(method = %notification.method, "received server notification");
            if notification.method == "notifications/tools/list_changed" {
                refresh_tools(&client_clone);
            }
        }
        debug!("MCP notification dispatcher exited");
    });
    *client.dispatcher.lock().expect("dispatcher lock poisoned") = Some(handle);
}

fn refresh_tools(client: &Arc<McpClient>) {
    let Ok(permit) = Arc::clone(&client.refresh_semaphore).try_acquire_owned() else {
        debug!(server_name = %client.server_name, "tool refresh already in flight, dropping notification");
        return;
    };
    let client = Arc::clone(client);
    tokio::spawn(async move {
        let _permit = permit;
        match tokio::time::timeout(REFRESH_TIMEOUT, client.list_tools()).await {
            Ok(Ok(tools)) => debug!(count = tools.len(), "tool list refreshed"),
            Ok(Err(err)) => warn!(?err, "failed to refresh tool list"),
            Err(_) => warn!("tool refresh timed out"),
        }
    });
}

fn expect_result<T: serde::de::DeserializeOwned>(response: JsonRpcResponse) -> Result<T, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::Rpc(error));
    }
    let result = response.result.unwrap_or_default();
    Ok(serde_json::from_value(result)?)
}
