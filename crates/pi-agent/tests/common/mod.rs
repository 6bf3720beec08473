#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};
use std::time::Duration;

use pi_agent::agent::{
    AgentConfig,
    AgentDeps,
    AgentEvent,
    AgentHandle,
    AgentLoop,
    LoopOutcome,
    LoopState,
};
use pi_agent::permissions::PermissionEngine;
use pi_agent::provider::{
    FinalMessage,
    MockProvider,
    ProviderEvent,
};
use pi_agent::tools::{
    ToolRegistry,
    simple_tool,
};
use pi_agent::types::{
    ContentBlock,
    StopReason,
    ToolOutcome,
    ToolUseBlock,
};
use tokio_util::sync::CancellationToken;

pub fn tool_use_block(id: &str, name: &str, input: serde_json::Value) -> ContentBlock {
    ContentBlock::ToolUse(ToolUseBlock {
        id: id.to_string(),
        name: name.to_string(),
        input,
    })
}

/// A provider turn that requests the given tool uses.
pub fn tool_use_turn(blocks: Vec<ContentBlock>) -> Vec<ProviderEvent> {
    vec![ProviderEvent::Final(FinalMessage {
        content: blocks,
        stop_reason: StopReason::ToolUse,
        usage: None,
    })]
}

/// Registers a read-only tool that sleeps, then returns `output`, tracking
/// peak concurrency through the shared counters.
pub fn slow_read_tool(
    registry: &mut ToolRegistry,
    name: &str,
    sleep: Duration,
    output: &str,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
) {
    let output = output.to_string();
    registry.register(simple_tool(
        name,
        "a slow read",
        serde_json::json!({"type": "object"}),
        true,
        move |_ctx, _args| {
            let output = output.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(sleep).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutcome::success(output))
            }
        },
    ));
}

pub fn make_deps(provider: &MockProvider, registry: ToolRegistry) -> AgentDeps {
    let permissions = PermissionEngine::new();
    permissions.mark_read_only(registry.read_only_names());
    AgentDeps {
        provider: Arc::new(provider.clone()),
        registry: Arc::new(registry),
        permissions: Arc::new(permissions),
        recorder: None,
    }
}

pub fn spawn_loop(deps: AgentDeps, prompt: &str) -> AgentHandle {
    AgentLoop::new(deps, AgentConfig::default()).spawn(
        Vec::new(),
        Some(pi_agent::types::Message::user(prompt)),
        CancellationToken::new(),
    )
}

/// Drains every event, then joins the loop.
pub async fn drain(mut handle: AgentHandle) -> (Vec<AgentEvent>, LoopState, LoopOutcome) {
    let mut events = Vec::new();
    while let Some(event) = handle.recv().await {
        events.push(event);
    }
    let state = handle.state();
    let outcome = handle.join().await;
    (events, state, outcome)
}

pub fn event_names(events: &[AgentEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            AgentEvent::AgentStart => "start",
            AgentEvent::AgentEnd => "end",
            AgentEvent::AssistantText(_) => "text",
            AgentEvent::AssistantThinking(_) => "thinking",
            AgentEvent::ToolStart { .. } => "tool_start",
            AgentEvent::ToolUpdate { .. } => "tool_update",
            AgentEvent::ToolEnd { .. } => "tool_end",
            AgentEvent::UsageUpdate(_) => "usage",
            AgentEvent::Error(_) => "error",
        })
        .collect()
}

/// Asserts the universal event-ordering invariants: AgentStart first,
/// AgentEnd last and exactly once, every ToolStart paired with exactly one
/// ToolEnd carrying the same id.
pub fn assert_event_invariants(events: &[AgentEvent]) {
    assert!(
        matches!(events.first(), Some(AgentEvent::AgentStart)),
        "AgentStart must be the first event"
    );
    assert!(
        matches!(events.last(), Some(AgentEvent::AgentEnd)),
        "AgentEnd must be the last event"
    );
    let end_count = events.iter().filter(|e| matches!(e, AgentEvent::AgentEnd)).count();
    assert_eq!(end_count, 1, "AgentEnd must be emitted exactly once");

    let start_ids: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::ToolStart { id, .. } => Some(id),
            _ => None,
        })
        .collect();
    for id in &start_ids {
        let ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolEnd { id: end_id, .. } if end_id == *id))
            .count();
        assert_eq!(ends, 1, "ToolStart({}) must pair with exactly one ToolEnd", id);
    }
}
