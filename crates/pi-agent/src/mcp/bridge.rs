use std::sync::Arc;

use tracing::debug;

use super::client::McpClient;
use super::protocol::{
    CallToolContent,
    McpToolInfo,
};
use crate::tools::ToolDescriptor;
use crate::types::{
    ImageBlock,
    ToolOutcome,
};

/// Cap on the concatenated text content returned by a bridged tool.
const MAX_BRIDGED_TEXT_BYTES: usize = 1024 * 1024;

/// Computes the local name of a bridged tool: `mcp__<server>__<tool>` with
/// non-alphanumeric characters replaced by `_`.
pub fn bridged_tool_name(server_name: &str, tool_name: &str) -> String {
    format!("mcp__{}__{}", sanitize(server_name), sanitize(tool_name))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Wraps one remote tool as a local [ToolDescriptor] whose execute function
/// round-trips to the remote server.
pub fn bridge_tool(client: Arc<McpClient>, info: &McpToolInfo) -> ToolDescriptor {
    let local_name = bridged_tool_name(client.server_name(), &info.name);
    debug!(remote = %info.name, local = %local_name, "bridging MCP tool");

    let remote_name = info.name.clone();
    ToolDescriptor::new(
        local_name,
        info.description.clone().unwrap_or_default(),
        info.input_schema.clone(),
        // Remote tools may do anything; treat them as writers.
        false,
        Arc::new(move |_ctx, _id, args, _progress| {
            let client = Arc::clone(&client);
            let remote_name = remote_name.clone();
            Box::pin(async move {
                let arguments = if args.is_empty() { None } else { Some(args) };
                let result = match client.call_tool(&remote_name, arguments).await {
                    Ok(result) => result,
                    Err(err) => return Ok(ToolOutcome::error(format!("MCP tool call failed: {}", err))),
                };

                let mut text_parts = Vec::new();
                let mut images = Vec::new();
                for item in result.content {
                    match item {
                        CallToolContent::Text { text } => text_parts.push(text),
                        CallToolContent::Image { data, mime_type } => images.push(ImageBlock {
                            media_type: mime_type,
                            data,
                        }),
                    }
                }
                let text = text_parts.join("\n");
                if text.len() > MAX_BRIDGED_TEXT_BYTES {
                    return Ok(ToolOutcome::error(format!(
                        "Tool result exceeded the {} byte limit ({} bytes returned)",
                        MAX_BRIDGED_TEXT_BYTES,
                        text.len()
                    )));
                }

                let outcome = if result.is_error {
                    ToolOutcome::error(text)
                } else {
                    ToolOutcome::success(text)
                };
                Ok(outcome.with_images(images))
            })
        }),
    )
}

/// Bridges every tool the client currently knows about.
pub fn bridge_all(client: &Arc<McpClient>) -> Vec<ToolDescriptor> {
    client
        .cached_tools()
        .iter()
        .map(|info| bridge_tool(Arc::clone(client), info))
        .collect()
}
