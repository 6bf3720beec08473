mod common;

use std::sync::Arc;
use std::sync::atomic::{
    AtomicBool,
    AtomicUsize,
    Ordering,
};
use std::time::Duration;

use common::{
    assert_event_invariants,
    drain,
    event_names,
    make_deps,
    slow_read_tool,
    spawn_loop,
    tool_use_block,
    tool_use_turn,
};
use pi_agent::agent::{
    AgentConfig,
    AgentEvent,
    AgentLoop,
    LoopState,
};
use pi_agent::provider::{
    FinalMessage,
    MockProvider,
    ProviderEvent,
};
use pi_agent::tools::{
    ToolExecutionError,
    ToolRegistry,
    simple_tool,
};
use pi_agent::types::{
    ContentBlock,
    Message,
    Role,
    StopReason,
    ToolOutcome,
    Usage,
};
use tokio_util::sync::CancellationToken;

/// Scenario: a plain answer with no tool use terminates after one turn.
#[tokio::test]
async fn plain_answer() {
    let provider = MockProvider::new().with_turn(vec![
        ProviderEvent::ContentDelta("Hello!".to_string()),
        ProviderEvent::Final(FinalMessage {
            content: vec![ContentBlock::Text("Hello!".to_string())],
            stop_reason: StopReason::EndTurn,
            usage: Some(Usage {
                input_tokens: 12,
                output_tokens: 3,
                ..Default::default()
            }),
        }),
    ]);
    let deps = make_deps(&provider, ToolRegistry::new());

    let handle = spawn_loop(deps, "hi");
    let (events, state, outcome) = drain(handle).await;

    assert_eq!(event_names(&events), vec!["start", "text", "usage", "end"]);
    assert_event_invariants(&events);
    assert_eq!(state, LoopState::Idle);
    assert_eq!(provider.request_count(), 1);
    assert_eq!(outcome.collected_text, "Hello!");
    assert_eq!(outcome.usage.input_tokens, 12);

    // History grew by exactly one assistant message with a single text block.
    let last = outcome.context.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content.len(), 1);
    assert_eq!(last.text(), "Hello!");
}

/// Scenario: one read-only tool call resumes the loop with its result.
#[tokio::test]
async fn one_read_only_tool_call() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![tool_use_block(
            "t1",
            "read",
            serde_json::json!({"path": "/tmp/x"}),
        )]))
        .with_text_turn("File says: hello", StopReason::EndTurn);

    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "read",
        "reads a file",
        serde_json::json!({"type": "object"}),
        true,
        |_ctx, _args| async move { Ok(ToolOutcome::success("hello")) },
    ));
    let deps = make_deps(&provider, registry);

    let handle = spawn_loop(deps, "read /tmp/x");
    let (events, _, outcome) = drain(handle).await;

    assert_event_invariants(&events);
    assert_eq!(provider.request_count(), 2);

    let tool_start = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolStart { id, name, args } => Some((id.clone(), name.clone(), args.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool_start.0, "t1");
    assert_eq!(tool_start.1, "read");
    assert_eq!(tool_start.2.get("path").unwrap(), "/tmp/x");

    let tool_end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolEnd { outcome, .. } => Some(outcome.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool_end.content, "hello");
    assert!(!tool_end.is_error);

    assert!(events.iter().any(|e| matches!(e, AgentEvent::AssistantText(t) if t == "File says: hello")));

    // History: user, assistant(tool use), user(tool result), assistant(text).
    assert_eq!(outcome.context.len(), 4);
    let result_msg = &outcome.context[2];
    assert_eq!(result_msg.role, Role::User);
    assert_eq!(result_msg.tool_result_ids(), vec!["t1"]);
}

/// Scenario: read-only tools execute concurrently, and their results land in
/// request order even when completion order differs.
#[tokio::test]
async fn concurrent_read_only_tools() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![
            tool_use_block("t1", "slow_read_a", serde_json::json!({})),
            tool_use_block("t2", "slow_read_b", serde_json::json!({})),
        ]))
        .with_text_turn("done", StopReason::EndTurn);

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    // a is slower than b: completion order is t2, t1; request order is t1, t2.
    slow_read_tool(
        &mut registry,
        "slow_read_a",
        Duration::from_millis(100),
        "a",
        Arc::clone(&current),
        Arc::clone(&peak),
    );
    slow_read_tool(
        &mut registry,
        "slow_read_b",
        Duration::from_millis(10),
        "b",
        Arc::clone(&current),
        Arc::clone(&peak),
    );
    let deps = make_deps(&provider, registry);

    let handle = spawn_loop(deps, "go");
    let (events, _, outcome) = drain(handle).await;

    assert_event_invariants(&events);
    assert!(peak.load(Ordering::SeqCst) >= 2, "tools must overlap in time");

    let tool_use_msg = &outcome.context[1];
    assert_eq!(tool_use_msg.tool_use_ids(), vec!["t1", "t2"]);
    let result_msg = &outcome.context[2];
    assert_eq!(
        result_msg.tool_result_ids(),
        vec!["t1", "t2"],
        "results must be in request order, not completion order"
    );
    let contents: Vec<String> = result_msg.tool_results().map(|r| r.content.clone()).collect();
    assert_eq!(contents, vec!["a", "b"]);
}

/// Scenario: an unparseable tool input is fed back to the model as an error
/// result, never silently dropped.
#[tokio::test]
async fn tool_parse_failure_is_not_dropped() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![tool_use_block(
            "t_bad",
            "read",
            serde_json::Value::String("not valid json".to_string()),
        )]))
        .with_text_turn("I see the parse error", StopReason::EndTurn);

    let mut registry = ToolRegistry::new();
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_clone = Arc::clone(&invoked);
    registry.register(simple_tool(
        "read",
        "reads a file",
        serde_json::json!({"type": "object"}),
        true,
        move |_ctx, _args| {
            let invoked = Arc::clone(&invoked_clone);
            async move {
                invoked.store(true, Ordering::SeqCst);
                Ok(ToolOutcome::success("unreachable"))
            }
        },
    ));
    let deps = make_deps(&provider, registry);

    let handle = spawn_loop(deps, "go");
    let (events, _, _) = drain(handle).await;

    assert_event_invariants(&events);
    assert_eq!(provider.request_count(), 2);
    assert!(!invoked.load(Ordering::SeqCst), "the tool must not execute");

    // The second request's context carries the error result for t_bad.
    let second_request = provider.request_messages(1);
    let result_msg = second_request.last().unwrap();
    let result = result_msg.tool_results().next().unwrap();
    assert_eq!(result.id, "t_bad");
    assert!(result.is_error);
    assert!(result.content.contains("not valid JSON"));
}

/// Scenario: an unknown tool name fails without invoking anything.
#[tokio::test]
async fn unknown_tool_fails_without_invocation() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![tool_use_block(
            "t1",
            "not_registered",
            serde_json::json!({}),
        )]))
        .with_text_turn("ok", StopReason::EndTurn);
    let deps = make_deps(&provider, ToolRegistry::new());

    let handle = spawn_loop(deps, "go");
    let (events, _, outcome) = drain(handle).await;

    assert_event_invariants(&events);
    let result = outcome.context[2].tool_results().next().unwrap().clone();
    assert!(result.is_error);
    assert!(result.content.contains("unknown tool"));
}

/// Scenario: a permission denial synthesizes an error result and the loop
/// continues to the next turn.
#[tokio::test]
async fn permission_denial_does_not_terminate() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![tool_use_block(
            "t1",
            "write",
            serde_json::json!({"path": "/tmp/x", "content": "y"}),
        )]))
        .with_text_turn("understood", StopReason::EndTurn);

    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_clone = Arc::clone(&invoked);
    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "write",
        "writes a file",
        serde_json::json!({"type": "object"}),
        false,
        move |_ctx, _args| {
            let invoked = Arc::clone(&invoked_clone);
            async move {
                invoked.store(true, Ordering::SeqCst);
                Ok(ToolOutcome::success("wrote"))
            }
        },
    ));
    // Normal mode with no ask callback: writers need approval nobody can give.
    let deps = make_deps(&provider, registry);

    let handle = spawn_loop(deps, "write it");
    let (events, state, _) = drain(handle).await;

    assert_event_invariants(&events);
    assert_eq!(state, LoopState::Idle);
    assert_eq!(provider.request_count(), 2);
    assert!(!invoked.load(Ordering::SeqCst), "denied tool must not execute");

    let tool_end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolEnd { outcome, .. } => Some(outcome.clone()),
            _ => None,
        })
        .unwrap();
    assert!(tool_end.is_error);
}

/// Scenario: abort cancels an in-flight tool; the loop lands in Cancelled and
/// nothing leaks.
#[tokio::test]
async fn abort_cancels_in_flight_tool() {
    let provider = MockProvider::new().with_turn(tool_use_turn(vec![tool_use_block(
        "t1",
        "slow",
        serde_json::json!({}),
    )]));

    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "slow",
        "blocks until cancelled",
        serde_json::json!({"type": "object"}),
        false,
        |ctx, _args| async move {
            tokio::select! {
                _ = ctx.cancel_token.cancelled() => Err(ToolExecutionError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(ToolOutcome::success("too late")),
            }
        },
    ));
    let mut deps = make_deps(&provider, registry);
    deps.permissions = Arc::new(pi_agent::PermissionEngine::new().with_mode(pi_agent::PermissionMode::Bypass));

    let mut handle = spawn_loop(deps, "go");
    let mut events = Vec::new();
    let mut aborted = false;
    let aborter = tokio::time::sleep(Duration::from_millis(50));
    tokio::pin!(aborter);
    loop {
        tokio::select! {
            event = handle.recv() => {
                match event {
                    Some(event) => events.push(event),
                    None => break,
                }
            },
            _ = &mut aborter, if !aborted => {
                aborted = true;
                handle.abort();
            },
        }
    }

    assert_eq!(handle.state(), LoopState::Cancelled);
    let tool_end_error = events
        .iter()
        .any(|e| matches!(e, AgentEvent::ToolEnd { outcome, .. } if outcome.is_error));
    let loop_error = events.iter().any(|e| matches!(e, AgentEvent::Error(_)));
    assert!(tool_end_error || loop_error, "cancellation must surface");
    assert!(matches!(events.last(), Some(AgentEvent::AgentEnd)));

    let outcome = handle.join().await;
    assert!(outcome.error.is_some());
}

/// Boundary: the steering queue holds eight messages; the ninth enqueue
/// returns false without blocking.
#[tokio::test]
async fn steering_queue_overflow() {
    let provider = MockProvider::new()
        .with_first_event_delay(Duration::from_millis(300))
        .with_text_turn("ok", StopReason::EndTurn);
    let deps = make_deps(&provider, ToolRegistry::new());

    let handle = spawn_loop(deps, "go");
    // Give the loop time to drain its initial (empty) steering pass and get
    // stuck in the provider stream.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for i in 0..8 {
        assert!(handle.steer(Message::user(format!("steer {}", i))), "enqueue {}", i);
    }
    assert!(!handle.steer(Message::user("one too many")), "ninth enqueue must fail");

    let (events, _, _) = drain(handle).await;
    assert_event_invariants(&events);
}

/// Steering messages enter the context at the next iteration boundary.
#[tokio::test]
async fn steering_applied_between_iterations() {
    let provider = MockProvider::new()
        .with_first_event_delay(Duration::from_millis(100))
        .with_turn(tool_use_turn(vec![tool_use_block("t1", "read", serde_json::json!({}))]))
        .with_text_turn("saw it", StopReason::EndTurn);

    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "read",
        "reads",
        serde_json::json!({"type": "object"}),
        true,
        |_ctx, _args| async move { Ok(ToolOutcome::success("data")) },
    ));
    let deps = make_deps(&provider, registry);

    let handle = spawn_loop(deps, "go");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handle.steer(Message::user("also consider this")));

    let (_, _, outcome) = drain(handle).await;
    // The steered message landed before the second provider call.
    let second_request = provider.request_messages(1);
    assert!(
        second_request.iter().any(|m| m.text() == "also consider this"),
        "steering message must reach the model"
    );
    assert!(outcome.context.iter().any(|m| m.text() == "also consider this"));
}

/// Mixed turns: read-only results come first in the composed user message,
/// then writer results, never interleaved.
#[tokio::test]
async fn writer_results_follow_reader_results() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![
            tool_use_block("w1", "writer", serde_json::json!({})),
            tool_use_block("r1", "reader", serde_json::json!({})),
            tool_use_block("w2", "writer", serde_json::json!({})),
        ]))
        .with_text_turn("done", StopReason::EndTurn);

    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "reader",
        "reads",
        serde_json::json!({"type": "object"}),
        true,
        |_ctx, _args| async move { Ok(ToolOutcome::success("r")) },
    ));
    let writer_running = Arc::new(AtomicUsize::new(0));
    let writer_peak = Arc::new(AtomicUsize::new(0));
    let running = Arc::clone(&writer_running);
    let peak = Arc::clone(&writer_peak);
    registry.register(simple_tool(
        "writer",
        "writes",
        serde_json::json!({"type": "object"}),
        false,
        move |_ctx, _args| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(ToolOutcome::success("w"))
            }
        },
    ));
    let mut deps = make_deps(&provider, registry);
    deps.permissions = Arc::new(pi_agent::PermissionEngine::new().with_mode(pi_agent::PermissionMode::Bypass));

    let handle = spawn_loop(deps, "go");
    let (events, _, outcome) = drain(handle).await;

    assert_event_invariants(&events);
    assert_eq!(writer_peak.load(Ordering::SeqCst), 1, "writers must run serially");
    let result_msg = &outcome.context[2];
    assert_eq!(
        result_msg.tool_result_ids(),
        vec!["r1", "w1", "w2"],
        "read-only results first, then writers in request order"
    );
}

/// A panicking tool is isolated to its call: the loop survives and the model
/// sees an error result.
#[tokio::test]
async fn panicking_tool_does_not_kill_the_loop() {
    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![tool_use_block("t1", "boom", serde_json::json!({}))]))
        .with_text_turn("recovered", StopReason::EndTurn);

    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "boom",
        "always panics",
        serde_json::json!({"type": "object"}),
        true,
        |_ctx, _args| async move {
            panic!("tool bug");
            #[allow(unreachable_code)]
            Ok(ToolOutcome::success(""))
        },
    ));
    let deps = make_deps(&provider, registry);

    let handle = spawn_loop(deps, "go");
    let (events, state, outcome) = drain(handle).await;

    assert_event_invariants(&events);
    assert_eq!(state, LoopState::Idle);
    assert_eq!(provider.request_count(), 2);
    let result = outcome.context[2].tool_results().next().unwrap().clone();
    assert!(result.is_error);
}

/// Zero-token usage reports are suppressed; non-zero ones accumulate.
#[tokio::test]
async fn zero_usage_is_suppressed() {
    let provider = MockProvider::new().with_turn(vec![ProviderEvent::Final(FinalMessage {
        content: vec![ContentBlock::Text("hi".to_string())],
        stop_reason: StopReason::EndTurn,
        usage: Some(Usage::default()),
    })]);
    let deps = make_deps(&provider, ToolRegistry::new());

    let handle = spawn_loop(deps, "go");
    let (events, _, _) = drain(handle).await;
    assert!(
        !events.iter().any(|e| matches!(e, AgentEvent::UsageUpdate(_))),
        "all-zero usage must not emit an update"
    );
}

/// A provider stream error abandons the turn and terminates with an Error
/// event followed by AgentEnd.
#[tokio::test]
async fn stream_error_terminates_loop() {
    let provider = MockProvider::new().with_turn(vec![
        ProviderEvent::ContentDelta("partial".to_string()),
        ProviderEvent::Error(pi_agent::provider::ProviderError::ServiceFailure("503".to_string())),
    ]);
    let deps = make_deps(&provider, ToolRegistry::new());

    let handle = spawn_loop(deps, "go");
    let (events, state, outcome) = drain(handle).await;

    assert_event_invariants(&events);
    assert_eq!(state, LoopState::Idle);
    assert!(events.iter().any(|e| matches!(e, AgentEvent::Error(_))));
    assert!(outcome.error.is_some());
    assert_eq!(provider.request_count(), 1);
}

/// Every message the loop appends also lands in the session store, in order.
#[tokio::test]
async fn loop_records_session_history() {
    use pi_agent::session::{
        SessionRecordKind,
        SessionRecorder,
        SessionStore,
    };

    let provider = MockProvider::new()
        .with_turn(tool_use_turn(vec![tool_use_block("t1", "read", serde_json::json!({}))]))
        .with_text_turn("done", StopReason::EndTurn);
    let mut registry = ToolRegistry::new();
    registry.register(simple_tool(
        "read",
        "reads",
        serde_json::json!({"type": "object"}),
        true,
        |_ctx, _args| async move { Ok(ToolOutcome::success("data")) },
    ));

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(dir.path()));
    let mut deps = make_deps(&provider, registry);
    deps.recorder = Some(SessionRecorder::new(Arc::clone(&store), "sess-1"));

    let handle = spawn_loop(deps, "go");
    let (_, _, _) = drain(handle).await;

    let records = store.read_records("sess-1").await.unwrap();
    let kinds: Vec<SessionRecordKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![
        SessionRecordKind::UserMessage,
        SessionRecordKind::AssistantMessage,
        SessionRecordKind::ToolResult,
        SessionRecordKind::AssistantMessage,
    ]);
}

/// The adaptive config clamps per-turn output tokens into the options the
/// provider sees.
#[tokio::test]
async fn adaptive_config_threads_into_options() {
    let provider = MockProvider::new().with_text_turn("ok", StopReason::EndTurn);
    let deps = make_deps(&provider, ToolRegistry::new());
    let config = AgentConfig {
        adaptive: Some(pi_agent::AdaptiveConfig {
            context_window: 10_000,
            max_output_tokens: 2_000,
            latency_profile: Default::default(),
        }),
        ..Default::default()
    };

    let handle = AgentLoop::new(deps, config).spawn(
        Vec::new(),
        Some(Message::user("hi")),
        CancellationToken::new(),
    );
    let (_, _, _) = drain(handle).await;
    assert_eq!(provider.request_count(), 1);
    // With a near-empty context, the model maximum is the binding limit.
    assert_eq!(provider.request_options(0).max_output_tokens, Some(2_000));
}
