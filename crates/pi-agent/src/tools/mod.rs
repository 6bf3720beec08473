use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Map;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::ToolOutcome;
use crate::types::ToolSpec;
use crate::util::glob::matches_any_pattern;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutcome, ToolExecutionError>> + Send>>;

pub type ExecuteFn =
    Arc<dyn Fn(ToolContext, String, Map<String, serde_json::Value>, ProgressSink) -> ToolFuture + Send + Sync>;

/// Context handed to a tool's execute function.
///
/// Tools observe cancellation through [ToolContext::cancel_token]; a
/// long-running tool is expected to select against it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cancel_token: CancellationToken,
}

/// Accepts output-text fragments at any time while a call is in flight.
///
/// Pushes are non-blocking; fragments are dropped when the consumer lags.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<String>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn push(&self, fragment: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(fragment.into());
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolExecutionError {
    #[error("Tool execution was cancelled")]
    Cancelled,
    #[error("{}", .0)]
    Failed(String),
}

/// A named, invocable tool.
///
/// Descriptors are immutable after registration and live for the process
/// lifetime.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
    /// Marks the tool safe for parallel execution and free of side effects.
    pub read_only: bool,
    pub execute: ExecuteFn,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        read_only: bool,
        execute: ExecuteFn,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            read_only,
            execute,
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.parameters.clone(),
        }
    }
}

/// Named catalog of invocable tools.
///
/// Keyed by name with last-write-wins registration.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        debug!(name = %descriptor.name, read_only = descriptor.read_only, "registering tool");
        self.tools.insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of every tool whose descriptor is marked read-only, for seeding
    /// a permission engine's read-only set.
    pub fn read_only_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|d| d.read_only)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Tool specs for every registered tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|d| d.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Creates a filtered view for a sub-agent.
    ///
    /// The deny list is subtracted first; when an allow list is present the
    /// remainder is intersected with it. A `None` allow list inherits all
    /// remaining tools. An empty resulting registry is legal.
    pub fn filtered(&self, allow: Option<&[String]>, deny: &[String]) -> ToolRegistry {
        let mut out = ToolRegistry::new();
        for (name, descriptor) in &self.tools {
            if matches_any_pattern(deny, name) {
                continue;
            }
            if let Some(allow) = allow {
                if !matches_any_pattern(allow, name) {
                    continue;
                }
            }
            out.tools.insert(name.clone(), Arc::clone(descriptor));
        }
        out
    }
}

/// Builds a descriptor around an async closure, for hosts and tests.
pub fn simple_tool<F, Fut>(
    name: &str,
    description: &str,
    parameters: serde_json::Value,
    read_only: bool,
    f: F,
) -> ToolDescriptor
where
    F: Fn(ToolContext, Map<String, serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolOutcome, ToolExecutionError>> + Send + 'static,
{
    let f = Arc::new(f);
    ToolDescriptor::new(
        name,
        description,
        parameters,
        read_only,
        Arc::new(move |ctx, _id, args, _progress| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(ctx, args).await })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_tool(name: &str, read_only: bool) -> ToolDescriptor {
        simple_tool(
            name,
            "echoes its input back",
            serde_json::json!({"type": "object"}),
            read_only,
            |_ctx, args| async move { Ok(ToolOutcome::success(serde_json::to_string(&args).unwrap_or_default())) },
        )
    }

    #[test]
    fn test_last_write_wins() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("read", true));
        registry.register(echo_tool("read", false));
        assert_eq!(registry.len(), 1);
        assert!(!registry.get("read").unwrap().read_only);
    }

    #[test]
    fn test_filtered_deny_then_allow() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("read", true));
        registry.register(echo_tool("write", false));
        registry.register(echo_tool("grep", true));

        let deny = vec!["write".to_string()];
        let filtered = registry.filtered(None, &deny);
        assert_eq!(filtered.names(), vec!["grep", "read"]);

        let allow = vec!["read".to_string()];
        let filtered = registry.filtered(Some(&allow), &deny);
        assert_eq!(filtered.names(), vec!["read"]);

        // Deny wins over allow.
        let allow = vec!["write".to_string()];
        let filtered = registry.filtered(Some(&allow), &deny);
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_execute_through_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("read", true));
        let descriptor = registry.get("read").unwrap();
        let ctx = ToolContext {
            cancel_token: CancellationToken::new(),
        };
        let mut args = Map::new();
        args.insert("path".to_string(), serde_json::json!("/tmp/x"));
        let outcome = (descriptor.execute)(ctx, "t1".to_string(), args, ProgressSink::noop())
            .await
            .unwrap();
        assert!(!outcome.is_error);
        assert!(outcome.content.contains("/tmp/x"));
    }
}
