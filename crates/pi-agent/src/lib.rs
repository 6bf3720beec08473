//! Core of the pi coding agent: the prompt/stream/tool cycle that drives an
//! LLM conversation in which the model may invoke local tools.
//!
//! The crate is organized around four subsystems:
//!
//! * [agent] - the agent loop state machine, sub-agent spawning, and agent
//!   definition files
//! * [permissions] - the rule evaluator, policy modes, and path sandbox
//! * [mcp] - the tool-extension protocol: JSON-RPC 2.0 client and server over
//!   stdio or streamable HTTP
//! * [session] - durable conversation records and compaction
//!
//! Hosts supply a [provider::Provider] implementation and a
//! [tools::ToolRegistry]; the TUI, input handling, and provider wire formats
//! live outside this crate.

pub mod agent;
pub mod mcp;
pub mod permissions;
pub mod provider;
pub mod session;
pub mod tools;
pub mod types;
pub mod util;

pub use agent::{
    AgentConfig,
    AgentDeps,
    AgentError,
    AgentEvent,
    AgentHandle,
    AgentLoop,
    LoopOutcome,
    LoopState,
};
pub use permissions::{
    AskCallback,
    AskDecision,
    PermissionEngine,
    PermissionError,
    PermissionMode,
};
pub use provider::{
    AdaptiveConfig,
    MockProvider,
    Provider,
    ProviderEvent,
    ProviderOptions,
};
pub use session::{
    SessionRecorder,
    SessionStore,
};
pub use tools::{
    ToolDescriptor,
    ToolRegistry,
};
pub use types::{
    ContentBlock,
    Message,
    Role,
    StopReason,
    ToolOutcome,
    Usage,
};
