use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{
    AsyncRead,
    AsyncWrite,
    AsyncWriteExt,
};
use tokio_util::codec::{
    FramedRead,
    LinesCodec,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

use super::McpError;
use super::protocol::{
    CallToolContent,
    CallToolParams,
    CallToolResult,
    Implementation,
    INVALID_PARAMS,
    JsonRpcMessage,
    JsonRpcRequest,
    JsonRpcResponse,
    ListResourcesResult,
    MCP_PROTOCOL_VERSION,
    METHOD_NOT_FOUND,
    McpToolInfo,
    PARSE_ERROR,
};
use crate::tools::{
    ProgressSink,
    ToolContext,
    ToolRegistry,
};

const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Exposes a local [ToolRegistry] to an external MCP client over stdio.
///
/// The server is stateless across calls: every `tools/call` executes in
/// isolation.
#[derive(Debug)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    server_info: Implementation,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            server_info: Implementation {
                name: "pi-agent".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Serves until the peer closes its end of the stream.
    pub async fn serve<R, W>(self, reader: R, mut writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(?err, "dropping unreadable frame from MCP client");
                    continue;
                },
            };
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<Value>(&line) {
                Ok(value) => match JsonRpcMessage::classify(value) {
                    Ok(JsonRpcMessage::Request(request)) => Some(self.handle_request(request).await),
                    Ok(JsonRpcMessage::Notification(notification)) => {
                        debug!(method = %notification.method, "received client notification");
                        None
                    },
                    Ok(JsonRpcMessage::Response(_)) => {
                        warn!("dropping unexpected response frame from MCP client");
                        None
                    },
                    Err(err) => Some(JsonRpcResponse::failure(0, PARSE_ERROR, err.to_string())),
                },
                Err(err) => Some(JsonRpcResponse::failure(0, PARSE_ERROR, err.to_string())),
            };
            if let Some(reply) = reply {
                let frame = serde_json::to_string(&reply)?;
                writer
                    .write_all(frame.as_bytes())
                    .await
                    .map_err(|err| McpError::Custom(format!("failed to write response: {}", err)))?;
                writer
                    .write_all(b"\n")
                    .await
                    .map_err(|err| McpError::Custom(format!("failed to write response: {}", err)))?;
                writer
                    .flush()
                    .await
                    .map_err(|err| McpError::Custom(format!("failed to flush response: {}", err)))?;
            }
        }
        debug!("MCP client disconnected");
        Ok(())
    }

    /// Serves the registry over this process's stdin/stdout.
    pub async fn serve_stdio(self) -> Result<(), McpError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, id = request.id, "handling MCP request");
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                request.id,
                serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}, "resources": {}},
                    "serverInfo": self.server_info,
                }),
            ),
            "tools/list" => {
                let tools: Vec<McpToolInfo> = self
                    .registry
                    .specs()
                    .into_iter()
                    .map(|spec| McpToolInfo {
                        name: spec.name,
                        description: Some(spec.description),
                        input_schema: spec.input_schema,
                    })
                    .collect();
                JsonRpcResponse::success(request.id, serde_json::json!({ "tools": tools }))
            },
            "tools/call" => self.handle_call_tool(request).await,
            "resources/list" => match serde_json::to_value(ListResourcesResult::default()) {
                Ok(value) => JsonRpcResponse::success(request.id, value),
                Err(err) => JsonRpcResponse::failure(request.id, PARSE_ERROR, err.to_string()),
            },
            other => JsonRpcResponse::failure(request.id, METHOD_NOT_FOUND, format!("method not found: {}", other)),
        }
    }

    async fn handle_call_tool(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let params: CallToolParams = match request.params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => return JsonRpcResponse::failure(request.id, INVALID_PARAMS, "missing params"),
            Err(err) => return JsonRpcResponse::failure(request.id, INVALID_PARAMS, err.to_string()),
        };

        let Some(descriptor) = self.registry.get(&params.name) else {
            return JsonRpcResponse::failure(
                request.id,
                INVALID_PARAMS,
                format!("unknown tool: {}", params.name),
            );
        };

        let ctx = ToolContext {
            cancel_token: CancellationToken::new(),
        };
        let args = params.arguments.unwrap_or_default();
        let result = match (descriptor.execute)(ctx, format!("rpc-{}", request.id), args, ProgressSink::noop()).await {
            Ok(outcome) => {
                let mut content = vec![CallToolContent::Text {
                    text: outcome.content,
                }];
                content.extend(outcome.images.into_iter().map(|img| CallToolContent::Image {
                    data: img.data,
                    mime_type: img.media_type,
                }));
                CallToolResult {
                    content,
                    is_error: outcome.is_error,
                }
            },
            Err(err) => CallToolResult::error_text(err.to_string()),
        };

        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(err) => JsonRpcResponse::failure(request.id, PARSE_ERROR, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{
        AsyncBufReadExt,
        AsyncWriteExt,
        BufReader,
    };

    use super::*;
    use crate::tools::simple_tool;
    use crate::types::ToolOutcome;

    async fn roundtrip(requests: &[Value]) -> Vec<JsonRpcResponse> {
        let mut registry = ToolRegistry::new();
        registry.register(simple_tool(
            "echo",
            "echoes back",
            serde_json::json!({"type": "object"}),
            true,
            |_ctx, args| async move {
                Ok(ToolOutcome::success(
                    args.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                ))
            },
        ));
        let server = McpServer::new(Arc::new(registry));

        let (mut client_write, server_read) = tokio::io::duplex(64 * 1024);
        let (server_write, client_read) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move { server.serve(server_read, server_write).await });

        for request in requests {
            let line = serde_json::to_string(request).unwrap();
            client_write.write_all(line.as_bytes()).await.unwrap();
            client_write.write_all(b"\n").await.unwrap();
        }
        drop(client_write);

        let mut responses = Vec::new();
        let mut reader = BufReader::new(client_read).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            responses.push(serde_json::from_str(&line).unwrap());
        }
        server_task.await.unwrap().unwrap();
        responses
    }

    #[tokio::test]
    async fn test_initialize_and_list_tools() {
        let responses = roundtrip(&[
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"},
            }}),
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        ])
        .await;

        assert_eq!(responses.len(), 2, "notification must not get a reply");
        let init = responses[0].result.as_ref().unwrap();
        assert_eq!(init["protocolVersion"], MCP_PROTOCOL_VERSION);
        let tools = responses[1].result.as_ref().unwrap();
        assert_eq!(tools["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn test_call_tool() {
        let responses = roundtrip(&[serde_json::json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi there"}},
        })])
        .await;
        let result = responses[0].result.as_ref().unwrap();
        assert_eq!(result["content"][0]["text"], "hi there");
        assert_eq!(result["isError"], false);
    }

    #[tokio::test]
    async fn test_unknown_method_returns_32601() {
        let responses = roundtrip(&[serde_json::json!({
            "jsonrpc": "2.0", "id": 9, "method": "prompts/list",
        })])
        .await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let responses = roundtrip(&[serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "nope"},
        })])
        .await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, INVALID_PARAMS);
    }
}
