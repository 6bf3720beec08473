pub mod definitions;
pub mod events;
pub mod subagent;

use std::sync::Arc;
use std::time::Instant;

pub use events::{
    AgentError,
    AgentEvent,
};
use events::EventSender;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use tokio::sync::{
    Semaphore,
    mpsc,
    watch,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    info,
    warn,
};

use crate::permissions::PermissionEngine;
use crate::provider::{
    AdaptiveConfig,
    Provider,
    ProviderEvent,
    ProviderOptions,
};
use crate::session::{
    SessionRecordKind,
    SessionRecorder,
};
use crate::tools::{
    ProgressSink,
    ToolContext,
    ToolDescriptor,
    ToolRegistry,
};
use crate::types::{
    ContentBlock,
    Message,
    Role,
    ToolOutcome,
    ToolResultBlock,
    ToolUseBlock,
    Usage,
};
use crate::util::estimate_tokens;

/// Capacity of the steering queue; the ninth pending enqueue returns false.
pub const STEERING_CAPACITY: usize = 8;

/// Default capacity of the event channel when no adaptive config is supplied.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

const DEFAULT_MAX_PARALLEL_TOOLS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum LoopState {
    #[default]
    Idle,
    Running,
    /// Sticky: a cancelled loop never reverts.
    Cancelled,
}

/// Static configuration for one loop instance.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Whether the model accepts image content in tool results. When false,
    /// images returned by tools are stripped from the composed tool-result
    /// blocks.
    pub supports_images: bool,
    pub adaptive: Option<AdaptiveConfig>,
    pub max_parallel_tools: Option<usize>,
}

/// Collaborators the loop drives.
#[derive(Clone)]
pub struct AgentDeps {
    pub provider: Arc<dyn Provider>,
    pub registry: Arc<ToolRegistry>,
    pub permissions: Arc<PermissionEngine>,
    pub recorder: Option<SessionRecorder>,
}

impl std::fmt::Debug for AgentDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDeps")
            .field("provider", &self.provider.api_tag())
            .field("tools", &self.registry.len())
            .finish()
    }
}

/// The prompt/stream/tool/resume state machine for a single user request.
///
/// One loop instance serves one prompt; a session sees many loops.
#[derive(Debug)]
pub struct AgentLoop {
    config: AgentConfig,
    deps: AgentDeps,
}

/// Where the loop ended up, returned from [AgentHandle::join].
#[derive(Debug, Default)]
pub struct LoopOutcome {
    /// The conversation context including everything this loop appended.
    pub context: Vec<Message>,
    /// Concatenation of the assistant text deltas across all turns.
    pub collected_text: String,
    /// Number of ToolEnd events emitted.
    pub tool_end_count: usize,
    /// Accumulated usage across provider turns.
    pub usage: Usage,
    pub error: Option<AgentError>,
}

impl AgentLoop {
    pub fn new(deps: AgentDeps, config: AgentConfig) -> Self {
        Self { config, deps }
    }

    /// Starts the loop on a task, returning the handle used to observe events,
    /// steer, and abort.
    ///
    /// `prompt`, when given, is appended to the context before the first
    /// provider call.
    pub fn spawn(self, context: Vec<Message>, prompt: Option<Message>, cancel_token: CancellationToken) -> AgentHandle {
        let event_buffer = self
            .config
            .adaptive
            .as_ref()
            .map_or(DEFAULT_EVENT_BUFFER, AdaptiveConfig::event_buffer_size);
        let (event_tx, event_rx) = mpsc::channel(event_buffer);
        let (steer_tx, steer_rx) = mpsc::channel(STEERING_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);

        // The loop owns a sub-token it cancels on abort; provider streams and
        // tool executions observe it.
        let loop_token = cancel_token.child_token();

        let join_handle = tokio::spawn(run_loop(
            self.config,
            self.deps,
            context,
            prompt,
            EventSender::new(event_tx),
            steer_rx,
            loop_token.clone(),
            state_tx,
        ));

        AgentHandle {
            event_rx,
            steer_tx,
            cancel_token: loop_token,
            state_rx,
            join_handle: Some(join_handle),
        }
    }
}

#[derive(Debug)]
pub struct AgentHandle {
    event_rx: mpsc::Receiver<AgentEvent>,
    steer_tx: mpsc::Sender<Message>,
    cancel_token: CancellationToken,
    state_rx: watch::Receiver<LoopState>,
    join_handle: Option<JoinHandle<LoopOutcome>>,
}

impl AgentHandle {
    /// Receives the next event. Returns [None] once the loop has exited and
    /// all buffered events are drained.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.event_rx.recv().await
    }

    /// Non-blocking enqueue of a steering message, consumed at the next
    /// iteration boundary. Returns false when the queue is full.
    pub fn steer(&self, message: Message) -> bool {
        self.steer_tx.try_send(message).is_ok()
    }

    /// Cancels the in-flight provider stream and tool executions.
    pub fn abort(&self) {
        self.cancel_token.cancel();
    }

    pub fn state(&self) -> LoopState {
        *self.state_rx.borrow()
    }

    /// Waits for the loop to finish, dropping the event stream.
    pub async fn join(mut self) -> LoopOutcome {
        // Dropping the receiver first keeps the loop from blocking on a
        // guaranteed send with nobody left to read it.
        self.event_rx.close();
        let Some(handle) = self.join_handle.take() else {
            return LoopOutcome::default();
        };
        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(?err, "agent loop task failed");
                LoopOutcome {
                    error: Some(AgentError::Custom(format!("agent loop task failed: {}", err))),
                    ..Default::default()
                }
            },
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            debug!("agent handle dropped, aborting loop task");
            handle.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: AgentConfig,
    deps: AgentDeps,
    mut context: Vec<Message>,
    prompt: Option<Message>,
    events: EventSender,
    mut steer_rx: mpsc::Receiver<Message>,
    cancel_token: CancellationToken,
    state_tx: watch::Sender<LoopState>,
) -> LoopOutcome {
    let _ = state_tx.send(LoopState::Running);
    events.send(AgentEvent::AgentStart).await;
    info!("agent loop start");

    let mut outcome = LoopOutcome::default();
    let mut turn_count = 0u32;

    if let Some(prompt) = prompt {
        record(&deps.recorder, SessionRecordKind::UserMessage, &prompt).await;
        context.push(prompt);
    }

    let result: Result<(), AgentError> = loop {
        if cancel_token.is_cancelled() {
            break Err(AgentError::Cancelled);
        }

        // Steering messages are consumed at iteration boundaries only, never
        // mid-stream.
        while let Ok(message) = steer_rx.try_recv() {
            debug!("applying steering message");
            record(&deps.recorder, SessionRecordKind::UserMessage, &message).await;
            context.push(message);
        }

        let options = make_options(&config, &deps.registry, &context);
        let mut stream = deps.provider.stream(context.clone(), options, cancel_token.clone());
        turn_count += 1;

        let mut final_message = None;
        let mut stream_error = None;
        while let Some(event) = stream.next().await {
            match event {
                ProviderEvent::ContentDelta(text) => {
                    outcome.collected_text.push_str(&text);
                    events.send(AgentEvent::AssistantText(text)).await;
                },
                ProviderEvent::ThinkingDelta(text) => {
                    events.send(AgentEvent::AssistantThinking(text)).await;
                },
                ProviderEvent::Error(err) => {
                    stream_error = Some(err);
                    break;
                },
                ProviderEvent::Final(message) => {
                    final_message = Some(message);
                    break;
                },
            }
        }

        if let Some(err) = stream_error {
            error!(?err, "provider stream failed");
            break Err(if cancel_token.is_cancelled() {
                AgentError::Cancelled
            } else {
                AgentError::Stream(err)
            });
        }
        let Some(final_message) = final_message else {
            break Err(if cancel_token.is_cancelled() {
                AgentError::Cancelled
            } else {
                AgentError::StreamEndedEarly
            });
        };

        if let Some(usage) = final_message.usage {
            if !usage.is_zero() {
                outcome.usage.add(&usage);
                record(&deps.recorder, SessionRecordKind::UsageUpdate, &usage).await;
                events.send(AgentEvent::UsageUpdate(usage)).await;
            }
        }

        let assistant = Message::new(Role::Assistant, final_message.content);
        record(&deps.recorder, SessionRecordKind::AssistantMessage, &assistant).await;
        context.push(assistant);
        let tool_uses: Vec<ToolUseBlock> = context
            .last()
            .map(|m| m.tool_uses().cloned().collect())
            .unwrap_or_default();

        if tool_uses.is_empty() {
            debug!(turn_count, "turn ended with no tool uses");
            break Ok(());
        }

        let results = execute_tool_uses(&config, &deps, &tool_uses, &events, &cancel_token).await;
        outcome.tool_end_count += results.len();

        let content = results.into_iter().map(ContentBlock::ToolResult).collect();
        let tool_result_message = Message::new(Role::User, content);
        record(&deps.recorder, SessionRecordKind::ToolResult, &tool_result_message).await;
        context.push(tool_result_message);
    };

    match result {
        Ok(()) => {
            let _ = state_tx.send(LoopState::Idle);
        },
        Err(err) => {
            events.send(AgentEvent::Error(err.clone())).await;
            let _ = state_tx.send(if matches!(err, AgentError::Cancelled) {
                LoopState::Cancelled
            } else {
                LoopState::Idle
            });
            outcome.error = Some(err);
        },
    }
    events.send(AgentEvent::AgentEnd).await;
    info!(turn_count, tool_end_count = outcome.tool_end_count, "agent loop end");

    outcome.context = context;
    outcome
}

fn make_options(config: &AgentConfig, registry: &ToolRegistry, context: &[Message]) -> ProviderOptions {
    let mut options = ProviderOptions {
        model: config.model.clone(),
        system_prompt: config.system_prompt.clone(),
        tool_specs: registry.specs(),
        max_output_tokens: None,
        supports_images: config.supports_images,
    };
    if let Some(adaptive) = &config.adaptive {
        let estimated: u64 = context
            .iter()
            .map(|m| serde_json::to_string(m).map_or(0, |s| estimate_tokens(&s)))
            .sum();
        let estimated = u32::try_from(estimated).unwrap_or(u32::MAX);
        options.max_output_tokens = Some(adaptive.clamp_max_output_tokens(estimated));
    }
    options
}

/// Executes one turn's tool calls: read-only tools concurrently under a
/// bounded scatter/gather, writers serially afterwards.
///
/// The returned results hold read-only outcomes first, then writer outcomes,
/// each group in the order the model requested them regardless of completion
/// order.
async fn execute_tool_uses(
    config: &AgentConfig,
    deps: &AgentDeps,
    tool_uses: &[ToolUseBlock],
    events: &EventSender,
    cancel_token: &CancellationToken,
) -> Vec<ToolResultBlock> {
    let mut parallel: Vec<(ToolUseBlock, Arc<ToolDescriptor>)> = Vec::new();
    let mut sequential: Vec<(ToolUseBlock, Option<Arc<ToolDescriptor>>)> = Vec::new();
    for block in tool_uses {
        match deps.registry.get(&block.name) {
            Some(descriptor) if descriptor.read_only => parallel.push((block.clone(), descriptor)),
            other => sequential.push((block.clone(), other)),
        }
    }

    // Cancelling this token on the first gather failure stops the surviving
    // siblings while their partial results are still collected.
    let gather_token = cancel_token.child_token();
    let semaphore = Arc::new(Semaphore::new(
        config.max_parallel_tools.unwrap_or(DEFAULT_MAX_PARALLEL_TOOLS).max(1),
    ));

    let parallel_blocks: Vec<ToolUseBlock> = parallel.iter().map(|(block, _)| block.clone()).collect();
    let mut slots: Vec<Option<ToolResultBlock>> = Vec::with_capacity(parallel.len());
    slots.resize_with(parallel.len(), || None);

    let mut gathers = FuturesUnordered::new();
    for (slot, (block, descriptor)) in parallel.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let events = events.clone();
        let deps = deps.clone();
        let gather_token = gather_token.clone();
        let supports_images = config.supports_images;
        let task = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            run_tool_call(&deps, &block, Some(descriptor), &events, &gather_token, supports_images).await
        });
        gathers.push(async move { (slot, task.await) });
    }

    while let Some((slot, joined)) = gathers.next().await {
        match joined {
            Ok(result) => slots[slot] = Some(result),
            Err(err) => {
                // A panicking tool is isolated to its call; siblings are
                // cancelled and the loop carries on.
                error!(?err, "tool task failed");
                gather_token.cancel();
            },
        }
    }

    let mut results = Vec::with_capacity(tool_uses.len());
    for (slot, result) in slots.into_iter().enumerate() {
        match result {
            Some(result) => results.push(result),
            None => {
                let block = &parallel_blocks[slot];
                let outcome = ToolOutcome::error("The tool call failed unexpectedly");
                events
                    .send(AgentEvent::ToolEnd {
                        id: block.id.clone(),
                        name: block.name.clone(),
                        outcome: outcome.clone(),
                    })
                    .await;
                results.push(ToolResultBlock::error(block.id.clone(), outcome.content));
            },
        }
    }

    for (block, descriptor) in sequential {
        let events_clone = events.clone();
        let deps_clone = deps.clone();
        let gather_token = gather_token.clone();
        let supports_images = config.supports_images;
        let block_clone = block.clone();
        let task = tokio::spawn(async move {
            run_tool_call(
                &deps_clone,
                &block_clone,
                descriptor,
                &events_clone,
                &gather_token,
                supports_images,
            )
            .await
        });
        match task.await {
            Ok(result) => results.push(result),
            Err(err) => {
                error!(?err, "tool task failed");
                let outcome = ToolOutcome::error(format!("The tool panicked: {}", err));
                events
                    .send(AgentEvent::ToolEnd {
                        id: block.id.clone(),
                        name: block.name.clone(),
                        outcome: outcome.clone(),
                    })
                    .await;
                results.push(ToolResultBlock::error(block.id.clone(), outcome.content));
            },
        }
    }

    results
}

/// Runs a single tool call through the full pipeline: parse, permission
/// check, execute. Emits ToolStart before and exactly one ToolEnd after,
/// including on denial and failure. Never invokes an unknown tool.
async fn run_tool_call(
    deps: &AgentDeps,
    block: &ToolUseBlock,
    descriptor: Option<Arc<ToolDescriptor>>,
    events: &EventSender,
    cancel_token: &CancellationToken,
    supports_images: bool,
) -> ToolResultBlock {
    let (args, parse_error) = match block.parse_args() {
        Ok(args) => (args, None),
        Err(diagnostic) => (Map::new(), Some(diagnostic)),
    };

    events
        .send(AgentEvent::ToolStart {
            id: block.id.clone(),
            name: block.name.clone(),
            args: args.clone(),
        })
        .await;

    let outcome = match (descriptor, parse_error) {
        (_, Some(diagnostic)) => ToolOutcome::error(diagnostic),
        (None, None) => ToolOutcome::error(format!("unknown tool: {}", block.name)),
        (Some(descriptor), None) => match deps.permissions.check(&block.name, &args).await {
            Err(err) => ToolOutcome::error(format!("Tool use was not permitted: {}", err)),
            Ok(()) => {
                let (progress_tx, mut progress_rx) = mpsc::channel(16);
                let forwarder = {
                    let events = events.clone();
                    let id = block.id.clone();
                    let name = block.name.clone();
                    tokio::spawn(async move {
                        while let Some(text) = progress_rx.recv().await {
                            events.send(AgentEvent::ToolUpdate {
                                id: id.clone(),
                                name: name.clone(),
                                text,
                            })
                            .await;
                        }
                    })
                };

                let ctx = ToolContext {
                    cancel_token: cancel_token.clone(),
                };
                let started = Instant::now();
                let result = (descriptor.execute)(ctx, block.id.clone(), args, ProgressSink::new(progress_tx)).await;
                let duration = started.elapsed();
                let _ = forwarder.await;

                let mut outcome = match result {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(name = %block.name, ?err, "tool execution failed");
                        ToolOutcome::error(err.to_string())
                    },
                };
                outcome.duration = duration;
                outcome
            },
        },
    };

    events
        .send(AgentEvent::ToolEnd {
            id: block.id.clone(),
            name: block.name.clone(),
            outcome: outcome.clone(),
        })
        .await;

    ToolResultBlock {
        id: block.id.clone(),
        content: outcome.content,
        images: if supports_images { outcome.images } else { Vec::new() },
        is_error: outcome.is_error,
    }
}

async fn record<T: Serialize>(recorder: &Option<SessionRecorder>, kind: SessionRecordKind, payload: &T) {
    if let Some(recorder) = recorder {
        recorder.record(kind, payload).await;
    }
}
