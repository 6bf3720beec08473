use std::pin::Pin;
use std::sync::{
    Arc,
    Mutex,
};
use std::time::Duration;

use futures::Stream;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    trace,
};

use crate::types::{
    ContentBlock,
    Message,
    StopReason,
    ToolSpec,
    Usage,
};

/// Represents an LLM backend capable of streaming one assistant turn.
///
/// **Important** - implementations should be cancel safe.
pub trait Provider: std::fmt::Debug + Send + Sync + 'static {
    /// Vendor tag identifying the backend, e.g. `"anthropic"`.
    fn api_tag(&self) -> &'static str;

    /// Sends a conversation to the model, returning a stream of events as the
    /// response. The stream terminates after yielding [ProviderEvent::Final]
    /// or [ProviderEvent::Error].
    fn stream(
        &self,
        messages: Vec<Message>,
        options: ProviderOptions,
        cancel_token: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = ProviderEvent> + Send + 'static>>;
}

/// Options applied to a single streamed turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tool_specs: Vec<ToolSpec>,
    pub max_output_tokens: Option<u32>,
    /// Whether the model accepts image content in tool results.
    #[serde(default)]
    pub supports_images: bool,
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A fragment of assistant text, in stream order.
    ContentDelta(String),
    /// A fragment of extended reasoning, in stream order.
    ThinkingDelta(String),
    /// A stream-level failure. Terminates the stream.
    Error(ProviderError),
    /// The complete assistant message. Terminates the stream.
    Final(FinalMessage),
}

#[derive(Debug, Clone)]
pub struct FinalMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

impl FinalMessage {
    /// The assistant [Message] this turn produced.
    pub fn into_message(self) -> Message {
        Message::new(crate::types::Role::Assistant, self.content)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("The request was throttled by the service")]
    Throttling,
    #[error("The service failed to process the request: {}", .0)]
    ServiceFailure(String),
    #[error("The stream was interrupted")]
    Interrupted,
    #[error("{}", .0)]
    Other(String),
}

/// Latency profiles used for sizing internal stream buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LatencyProfile {
    #[default]
    Balanced,
    LowLatency,
    HighThroughput,
}

/// Optional per-model limits used to adapt stream parameters each turn.
///
/// When supplied, the agent loop clamps max-output-tokens to the smaller of
/// the model's documented maximum and what remains of the context window, and
/// sizes the internal event buffer off the latency profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveConfig {
    /// The model's documented context window, in tokens.
    pub context_window: u32,
    /// The model's documented maximum output tokens per turn.
    pub max_output_tokens: u32,
    #[serde(default)]
    pub latency_profile: LatencyProfile,
}

impl AdaptiveConfig {
    /// Clamps the per-turn output budget given an estimate of the input size.
    pub fn clamp_max_output_tokens(&self, estimated_input_tokens: u32) -> u32 {
        let remaining = self.context_window.saturating_sub(estimated_input_tokens);
        self.max_output_tokens.min(remaining.max(1))
    }

    pub fn event_buffer_size(&self) -> usize {
        match self.latency_profile {
            LatencyProfile::LowLatency => 16,
            LatencyProfile::Balanced => 64,
            LatencyProfile::HighThroughput => 256,
        }
    }
}

/// A scripted provider for tests.
///
/// Responses are played back in registration order; receiving more requests
/// than scripted responses is a test bug and panics.
#[derive(Debug, Clone)]
pub struct MockProvider {
    inner: Arc<Mutex<MockInner>>,
    /// Delay before yielding the first event of every turn.
    first_event_delay: Option<Duration>,
}

#[derive(Debug)]
struct MockInner {
    response_index: usize,
    responses: Vec<Vec<ProviderEvent>>,
    received_requests: Vec<(Vec<Message>, ProviderOptions)>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                response_index: 0,
                responses: Vec::new(),
                received_requests: Vec::new(),
            })),
            first_event_delay: None,
        }
    }

    pub fn with_turn(self, events: Vec<ProviderEvent>) -> Self {
        self.inner.lock().unwrap().responses.push(events);
        self
    }

    /// Scripts a plain-text turn ending with the given stop reason.
    pub fn with_text_turn(self, text: &str, stop_reason: StopReason) -> Self {
        let events = vec![
            ProviderEvent::ContentDelta(text.to_string()),
            ProviderEvent::Final(FinalMessage {
                content: vec![ContentBlock::Text(text.to_string())],
                stop_reason,
                usage: None,
            }),
        ];
        self.with_turn(events)
    }

    pub fn with_first_event_delay(mut self, delay: Duration) -> Self {
        self.first_event_delay = Some(delay);
        self
    }

    /// Number of stream requests received so far.
    pub fn request_count(&self) -> usize {
        self.inner.lock().unwrap().received_requests.len()
    }

    /// The conversation sent with the nth request.
    pub fn request_messages(&self, n: usize) -> Vec<Message> {
        self.inner.lock().unwrap().received_requests[n].0.clone()
    }

    /// The options sent with the nth request.
    pub fn request_options(&self, n: usize) -> ProviderOptions {
        self.inner.lock().unwrap().received_requests[n].1.clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for MockProvider {
    fn api_tag(&self) -> &'static str {
        "mock"
    }

    fn stream(
        &self,
        messages: Vec<Message>,
        options: ProviderOptions,
        cancel_token: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = ProviderEvent> + Send + 'static>> {
        let events = {
            let mut inner = self.inner.lock().unwrap();
            let Some(events) = inner.responses.get(inner.response_index).cloned() else {
                error!("mock provider received an unexpected request: {:?}", messages);
                panic!("mock provider received an unexpected request");
            };
            inner.received_requests.push((messages, options));
            inner.response_index += 1;
            events
        };

        let delay = self.first_event_delay;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                debug!(?delay, "sleeping before sending first mock event");
                tokio::time::sleep(delay).await;
            }
            for event in events {
                if cancel_token.is_cancelled() {
                    trace!("mock stream cancelled");
                    let _ = tx.send(ProviderEvent::Error(ProviderError::Interrupted)).await;
                    return;
                }
                let _ = tx.send(event).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}
