use serde_json::Map;
use tokio::sync::mpsc;

use crate::provider::ProviderError;
use crate::types::{
    ToolOutcome,
    Usage,
};

/// Lifecycle events emitted by the agent loop.
///
/// AgentStart precedes every other event; AgentEnd is emitted exactly once and
/// is the last event on the stream; every ToolStart is followed by exactly one
/// ToolEnd with the same id.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd,
    AssistantText(String),
    AssistantThinking(String),
    ToolStart {
        id: String,
        name: String,
        args: Map<String, serde_json::Value>,
    },
    ToolUpdate {
        id: String,
        name: String,
        text: String,
    },
    ToolEnd {
        id: String,
        name: String,
        outcome: ToolOutcome,
    },
    UsageUpdate(Usage),
    Error(AgentError),
}

impl AgentEvent {
    /// Whether delivery of this event is guaranteed.
    ///
    /// Guaranteed events are written synchronously by the producer; all others
    /// are best-effort and may drop when the consumer lags. An aborted tool's
    /// ToolEnd counts as guaranteed so its pair is never broken.
    pub fn is_guaranteed(&self) -> bool {
        matches!(
            self,
            AgentEvent::AgentStart | AgentEvent::AgentEnd | AgentEvent::Error(_) | AgentEvent::ToolEnd { .. }
        )
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("The agent loop was cancelled")]
    Cancelled,
    #[error(transparent)]
    Stream(#[from] ProviderError),
    #[error("The provider stream ended without a final message")]
    StreamEndedEarly,
    #[error("{}", .0)]
    Custom(String),
}

/// Sender side of the loop's event channel, enforcing the delivery policy.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<AgentEvent>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: AgentEvent) {
        if event.is_guaranteed() {
            let _ = self.tx.send(event).await;
        } else {
            let _ = self.tx.try_send(event);
        }
    }
}
