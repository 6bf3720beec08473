use serde::{
    Deserialize,
    Serialize,
};
use tracing::debug;

use crate::types::{
    Message,
    Role,
};
use crate::util::estimate_tokens;

const DEFAULT_KEEP_RECENT: usize = 10;

/// Percentage of the context window at which compaction triggers.
const DEFAULT_TRIGGER_PERCENT: u8 = 80;

/// Policy governing when and how a conversation history is compacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionPolicy {
    /// How many of the most recent messages survive verbatim.
    pub keep_recent: usize,
    /// Trigger threshold as a percentage of the model context window. Values
    /// outside [1, 100] fall back to the default.
    pub trigger_percent: u8,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            keep_recent: DEFAULT_KEEP_RECENT,
            trigger_percent: DEFAULT_TRIGGER_PERCENT,
        }
    }
}

/// The result of one compaction pass.
#[derive(Debug, Clone)]
pub struct Compaction {
    pub messages: Vec<Message>,
    pub summary_text: String,
    pub tokens_saved: u64,
}

impl CompactionPolicy {
    pub fn new(keep_recent: usize, trigger_percent: u8) -> Self {
        Self {
            keep_recent,
            trigger_percent,
        }
    }

    /// The effective trigger threshold, clamped to [1, 100].
    pub fn threshold_percent(&self) -> u8 {
        if (1..=100).contains(&self.trigger_percent) {
            self.trigger_percent
        } else {
            DEFAULT_TRIGGER_PERCENT
        }
    }

    /// Whether the estimated input size warrants proactive compaction.
    pub fn should_compact(&self, messages: &[Message], context_window_tokens: u64) -> bool {
        if context_window_tokens == 0 {
            return false;
        }
        let estimated = estimate_messages(messages);
        estimated * 100 >= context_window_tokens * u64::from(self.threshold_percent())
    }

    /// Summarizes everything but the most recent messages into a single
    /// synthetic user message.
    ///
    /// The first user message (the original request) survives whenever one
    /// exists in the elided prefix. Compacting an already-compacted history
    /// whose length is at or below `keep_recent` is the identity.
    pub fn compact(&self, messages: Vec<Message>) -> Compaction {
        if messages.len() <= self.keep_recent {
            return Compaction {
                messages,
                summary_text: String::new(),
                tokens_saved: 0,
            };
        }

        let split = messages.len() - self.keep_recent;
        let (prefix, recent) = messages.split_at(split);

        let first_user = prefix
            .iter()
            .find(|m| m.role == Role::User && !is_summary_marker(m))
            .cloned();
        let mut prior_elided = 0u64;
        let mut elided: Vec<&Message> = Vec::new();
        for message in prefix {
            if let Some(count) = summary_marker_count(message) {
                prior_elided += count;
                continue;
            }
            let is_first_user = first_user
                .as_ref()
                .is_some_and(|fu| fu.id.is_some() && fu.id == message.id);
            if !is_first_user {
                elided.push(message);
            }
        }

        if elided.is_empty() {
            // Only the original request and an earlier summary remain in the
            // prefix; re-compacting is the identity.
            return Compaction {
                messages,
                summary_text: String::new(),
                tokens_saved: 0,
            };
        }

        let elided_count = elided.len() as u64 + prior_elided;
        let tokens_saved = elided.iter().map(|m| estimate_message(m)).sum();
        let summary_text = format!("[Summary: {} older turns elided]", elided_count);

        let mut compacted = Vec::with_capacity(self.keep_recent + 2);
        if let Some(first_user) = first_user {
            compacted.push(first_user);
        }
        compacted.push(Message::user(summary_text.clone()));
        compacted.extend(recent.iter().cloned());

        debug!(elided_count, tokens_saved, "compacted conversation history");
        Compaction {
            messages: compacted,
            summary_text,
            tokens_saved,
        }
    }
}

fn is_summary_marker(message: &Message) -> bool {
    summary_marker_count(message).is_some()
}

/// Parses the elided-turn count out of a synthetic summary message.
fn summary_marker_count(message: &Message) -> Option<u64> {
    if message.role != Role::User {
        return None;
    }
    let text = message.text();
    text.strip_prefix("[Summary: ")?
        .strip_suffix(" older turns elided]")?
        .parse()
        .ok()
}

fn estimate_message(message: &Message) -> u64 {
    serde_json::to_string(message).map_or(0, |s| estimate_tokens(&s))
}

/// Estimated input tokens for a whole history.
pub fn estimate_messages(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}
