use std::sync::Arc;

use serde::{
    Deserialize,
    Serialize,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
};

use super::{
    AgentConfig,
    AgentDeps,
    AgentError,
    AgentLoop,
};
use crate::types::Message;

pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Configuration for a nested agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// When present, the sub-agent's tool set is intersected with this list.
    /// [None] inherits every tool that survives the deny list.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub background: bool,
}

/// What a sub-agent produced: the concatenated assistant text across all its
/// turns, plus the error that stopped it, if any.
#[derive(Debug, Clone)]
pub struct SubagentResult {
    pub text: String,
    pub error: Option<AgentError>,
}

/// Handle to a spawned sub-agent.
///
/// For foreground spawns the result is already published when the handle is
/// returned. For background spawns, [SubagentHandle::done] fires at
/// termination and [SubagentHandle::result] returns [None] until then.
#[derive(Debug)]
pub struct SubagentHandle {
    name: String,
    done: CancellationToken,
    result: Arc<std::sync::OnceLock<SubagentResult>>,
}

impl SubagentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves when the sub-agent has terminated. Safe to call repeatedly.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// The result, or [None] while a background sub-agent is still running.
    /// Once set, the reference is stable.
    pub fn result(&self) -> Option<&SubagentResult> {
        self.result.get()
    }

    /// Waits for termination and returns the result.
    pub async fn wait(&self) -> &SubagentResult {
        self.done().await;
        self.result().expect("result is published before the done signal")
    }
}

/// Spawns a nested agent with a filtered tool set and a bounded turn budget.
///
/// Foreground spawns block until completion and publish the result
/// atomically; background spawns return immediately.
pub async fn spawn(config: SubagentConfig, prompt: impl Into<String>, deps: &AgentDeps) -> SubagentHandle {
    let prompt = prompt.into();
    let name = config.name.clone();
    info!(name = %name, background = config.background, "spawning sub-agent");

    // Deny list first, then the allow-list intersection. An empty result is
    // legal: the sub-agent simply cannot invoke tools.
    let registry = deps
        .registry
        .filtered(config.allowed_tools.as_deref(), &config.disallowed_tools);
    debug!(name = %name, tools = ?registry.names(), "sub-agent tool set");

    let deps = AgentDeps {
        provider: Arc::clone(&deps.provider),
        registry: Arc::new(registry),
        permissions: Arc::clone(&deps.permissions),
        // The sub-agent's context is isolated from the parent session.
        recorder: None,
    };

    let done = CancellationToken::new();
    let result = Arc::new(std::sync::OnceLock::new());
    let handle = SubagentHandle {
        name,
        done: done.clone(),
        result: Arc::clone(&result),
    };

    if config.background {
        tokio::spawn(async move {
            let outcome = run_subagent(config, prompt, deps).await;
            let _ = result.set(outcome);
            done.cancel();
        });
    } else {
        let outcome = run_subagent(config, prompt, deps).await;
        let _ = result.set(outcome);
        done.cancel();
    }

    handle
}

/// Drives agent-loop invocations up to the turn budget.
///
/// The sub-agent owns a fresh context seeded only by the system prompt and
/// the initial user prompt; it stops early once an invocation finishes
/// without emitting any ToolEnd (the model reached end-turn).
async fn run_subagent(config: SubagentConfig, prompt: String, deps: AgentDeps) -> SubagentResult {
    let agent_config = AgentConfig {
        model: config.model.clone(),
        system_prompt: config.system_prompt.clone(),
        ..Default::default()
    };
    let max_turns = config.max_turns.unwrap_or(DEFAULT_MAX_TURNS).max(1);

    let mut context = Vec::new();
    let mut first_prompt = Some(Message::user(prompt));
    let mut collected = String::new();

    for turn in 0..max_turns {
        let agent_loop = AgentLoop::new(deps.clone(), agent_config.clone());
        let handle = agent_loop.spawn(context, first_prompt.take(), CancellationToken::new());
        let outcome = handle.join().await;

        collected.push_str(&outcome.collected_text);
        context = outcome.context;

        if let Some(error) = outcome.error {
            debug!(name = %config.name, turn, ?error, "sub-agent stopped on error");
            return SubagentResult {
                text: collected,
                error: Some(error),
            };
        }
        if outcome.tool_end_count == 0 {
            debug!(name = %config.name, turn, "sub-agent reached end-turn");
            break;
        }
    }

    SubagentResult {
        text: collected,
        error: None,
    }
}
