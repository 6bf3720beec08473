use std::time::Duration;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use uuid::Uuid;

/// A single entry in a conversation history.
///
/// Messages are immutable once appended to history: the agent loop only ever
/// pushes new messages, it never mutates earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Creates a new message with a generated id and the current timestamp.
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            role,
            content,
            timestamp: Some(Utc::now()),
        }
    }

    /// Convenience constructor for a plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::Text(text.into())])
    }

    /// Convenience constructor for a plain-text system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::Text(text.into())])
    }

    /// Returns only the text content, joined as a single string.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUseBlock> {
        self.content.iter().filter_map(|c| match c {
            ContentBlock::ToolUse(block) => Some(block),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultBlock> {
        self.content.iter().filter_map(|c| match c {
            ContentBlock::ToolResult(block) => Some(block),
            _ => None,
        })
    }

    /// Ids of every tool use in this message, in content order.
    pub fn tool_use_ids(&self) -> Vec<String> {
        self.tool_uses().map(|b| b.id.clone()).collect()
    }

    /// Ids of every tool result in this message, in content order.
    pub fn tool_result_ids(&self) -> Vec<String> {
        self.tool_results().map(|b| b.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One tagged element of a message's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlock {
    Text(String),
    /// Extended reasoning emitted by the model. Opaque to tool execution.
    Thinking(String),
    Image(ImageBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

impl ContentBlock {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            ContentBlock::ToolUse(block) => Some(block),
            _ => None,
        }
    }

    pub fn tool_result(&self) -> Option<&ToolResultBlock> {
        match self {
            ContentBlock::ToolResult(block) => Some(block),
            _ => None,
        }
    }
}

impl From<String> for ContentBlock {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ContentBlock {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlock {
    /// Mime type of the image, e.g. `image/png`
    pub media_type: String,
    /// Base64-encoded image bytes
    pub data: String,
}

impl ImageBlock {
    /// Builds a block from raw image bytes.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decodes the payload back to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.decode(&self.data)
    }
}

/// A tool invocation requested by the assistant.
///
/// The id is provider-assigned and unique within the turn. `input` holds
/// whatever the provider produced: a JSON object when the arguments parsed, or
/// a raw string when they did not. [ToolUseBlock::parse_args] resolves either
/// form into an argument map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    /// Resolves the input into an argument map.
    ///
    /// Accepts an object directly, a JSON-encoded string containing an object,
    /// or null (no arguments). Anything else is a parse failure that the agent
    /// loop feeds back to the model as an error tool result.
    pub fn parse_args(&self) -> Result<Map<String, serde_json::Value>, String> {
        match &self.input {
            serde_json::Value::Object(map) => Ok(map.clone()),
            serde_json::Value::Null => Ok(Map::new()),
            serde_json::Value::String(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Object(map)) => Ok(map),
                Ok(other) => Err(format!(
                    "tool input for '{}' must be a JSON object, got: {}",
                    self.name, other
                )),
                Err(err) => Err(format!("tool input for '{}' is not valid JSON: {}", self.name, err)),
            },
            other => Err(format!(
                "tool input for '{}' must be a JSON object, got: {}",
                self.name, other
            )),
        }
    }
}

/// The result of a tool invocation, correlated to a [ToolUseBlock] by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBlock>,
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn error(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            images: Vec::new(),
            is_error: true,
        }
    }
}

/// Token counters reported per LLM call and accumulated on the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_creation_tokens = self.cache_creation_tokens.saturating_add(other.cache_creation_tokens);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Stop,
}

/// A tool specification as presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// The outcome of executing one tool call.
///
/// Always carries a human-readable content string, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageBlock>,
    pub is_error: bool,
    #[serde(default, skip)]
    pub duration: Duration,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            images: Vec::new(),
            is_error: false,
            duration: Duration::ZERO,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            images: Vec::new(),
            is_error: true,
            duration: Duration::ZERO,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageBlock>) -> Self {
        self.images = images;
        self
    }
}
