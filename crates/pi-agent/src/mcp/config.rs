use std::collections::HashMap;
use std::path::{
    Path,
    PathBuf,
};
use std::sync::Arc;

use serde::{
    Deserialize,
    Serialize,
};
use tracing::{
    debug,
    warn,
};

use super::McpError;
use super::McpTransport;
use super::http::{
    HttpServerConfig,
    HttpTransport,
};
use super::stdio::{
    ServerCommand,
    SpawnApproval,
    StdioTransport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportType {
    #[default]
    Stdio,
    Http,
}

/// One entry in the `mcpServers` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "type", default)]
    pub transport_type: McpTransportType,
    #[serde(default)]
    pub url: Option<String>,
}

impl McpServerConfig {
    /// Builds the transport this config describes.
    pub fn connect_transport(&self, approval: Option<&SpawnApproval>) -> Result<Arc<dyn McpTransport>, McpError> {
        match self.transport_type {
            McpTransportType::Stdio => {
                let command = self
                    .command
                    .clone()
                    .ok_or_else(|| McpError::Custom("stdio server config requires a command".to_string()))?;
                let transport = StdioTransport::spawn(
                    &ServerCommand {
                        command,
                        args: self.args.clone(),
                        env: self.env.clone(),
                    },
                    approval,
                )?;
                Ok(Arc::new(transport))
            },
            McpTransportType::Http => {
                let url = self
                    .url
                    .clone()
                    .ok_or_else(|| McpError::Custom("http server config requires a url".to_string()))?;
                let transport = HttpTransport::new(HttpServerConfig {
                    url,
                    bearer_token: self.env.get("BEARER_TOKEN").cloned(),
                });
                transport.start_listener();
                Ok(Arc::new(transport))
            },
        }
    }
}

/// The MCP configuration document: a top-level `mcpServers` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Merges `other` on top of this config. Same-named servers in `other`
    /// override.
    pub fn merge(&mut self, other: McpConfig) {
        for (name, config) in other.mcp_servers {
            self.mcp_servers.insert(name, config);
        }
    }
}

/// Configuration sources in override order: later entries win.
pub fn default_config_paths(project_dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".pi").join("settings.json"));
    }
    paths.push(project_dir.join(".mcp.json"));
    paths.push(project_dir.join(".pi").join("settings.local.json"));
    paths
}

/// Loads and merges every readable config document, later sources overriding
/// same-named earlier ones. Missing or malformed files are skipped.
pub fn load_merged(paths: &[PathBuf]) -> McpConfig {
    let mut merged = McpConfig::default();
    for path in paths {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        match serde_json::from_str::<McpConfig>(&content) {
            Ok(config) => {
                debug!(?path, count = config.mcp_servers.len(), "loaded MCP config");
                merged.merge(config);
            },
            Err(err) => warn!(?path, ?err, "skipping malformed MCP config"),
        }
    }
    merged
}
