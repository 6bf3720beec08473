pub mod rules;
pub mod sandbox;

use std::collections::HashSet;
use std::sync::{
    Arc,
    RwLock,
};

use async_trait::async_trait;
use rules::{
    PermissionRule,
    READ_ONLY_TOOLS,
    RuleAction,
    extract_specifier,
};
use sandbox::{
    Sandbox,
    SandboxError,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use tracing::{
    debug,
    warn,
};

/// Governs the default behavior when no rule matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Normal,
    AcceptEdits,
    Plan,
    DontAsk,
    Bypass,
}

/// Response from the interactive ask dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskDecision {
    Allow,
    /// Allow, and insert a persistent allow-rule for this (tool, specifier).
    AllowAlways,
    Deny,
}

/// A host-supplied callback for obtaining interactive approval.
///
/// May block indefinitely; it is always invoked outside the engine's lock so
/// the dialog can inspect rules mid-flight without deadlocking.
#[async_trait]
pub trait AskCallback: Send + Sync {
    async fn ask(&self, tool_name: &str, args: &Map<String, serde_json::Value>) -> eyre::Result<AskDecision>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PermissionError {
    #[error("Approval is required but no approval channel is configured")]
    NeedsApproval,
    #[error("Tool use was denied by rule: {}", .rule)]
    DeniedByRule { rule: String },
    #[error("Tool '{}' is blocked in plan mode", .tool)]
    BlockedInPlanMode { tool: String },
    #[error("Tool '{}' is not read-only and asking is disabled", .tool)]
    DeniedByMode { tool: String },
    #[error("Tool use was denied by the user")]
    DeniedByUser,
    #[error("The approval dialog failed: {}", .0)]
    AskFailed(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Debug)]
enum Verdict {
    Allow,
    Ask,
    Deny(PermissionError),
}

#[derive(Debug, Default)]
struct RuleState {
    mode: PermissionMode,
    deny_rules: Vec<PermissionRule>,
    allow_rules: Vec<PermissionRule>,
    glob_rules: Vec<PermissionRule>,
}

/// Evaluates whether a tool use may execute.
///
/// Rule lists live under a read-write lock: every tool call takes the read
/// lock, mutation (rule insertion on AllowAlways, removal from a UI) takes the
/// write lock.
pub struct PermissionEngine {
    state: RwLock<RuleState>,
    read_only_tools: RwLock<HashSet<String>>,
    ask_callback: Option<Arc<dyn AskCallback>>,
    sandbox: Option<Sandbox>,
}

impl std::fmt::Debug for PermissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionEngine")
            .field("mode", &self.mode())
            .field("has_ask_callback", &self.ask_callback.is_some())
            .field("has_sandbox", &self.sandbox.is_some())
            .finish()
    }
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RuleState::default()),
            read_only_tools: RwLock::new(READ_ONLY_TOOLS.iter().map(|s| s.to_string()).collect()),
            ask_callback: None,
            sandbox: None,
        }
    }

    pub fn with_mode(self, mode: PermissionMode) -> Self {
        self.set_mode(mode);
        self
    }

    pub fn with_ask_callback(mut self, callback: Arc<dyn AskCallback>) -> Self {
        self.ask_callback = Some(callback);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Sandbox) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn mode(&self) -> PermissionMode {
        self.state.read().expect("rule lock poisoned").mode
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        debug!(%mode, "changing permission mode");
        self.state.write().expect("rule lock poisoned").mode = mode;
    }

    /// Extends the read-only tool set, e.g. from a registry's descriptors.
    pub fn mark_read_only<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.read_only_tools.write().expect("read-only lock poisoned");
        set.extend(names.into_iter().map(Into::into));
    }

    pub fn is_read_only(&self, tool_name: &str) -> bool {
        self.read_only_tools
            .read()
            .expect("read-only lock poisoned")
            .contains(&tool_name.to_lowercase())
    }

    pub fn add_allow_rule(&self, rule: PermissionRule) {
        self.state.write().expect("rule lock poisoned").allow_rules.push(rule);
    }

    pub fn add_deny_rule(&self, rule: PermissionRule) {
        self.state.write().expect("rule lock poisoned").deny_rules.push(rule);
    }

    pub fn add_glob_rule(&self, rule: PermissionRule) {
        self.state.write().expect("rule lock poisoned").glob_rules.push(rule);
    }

    /// Removes every rule equal to `rule` from all three lists.
    pub fn remove_rule(&self, rule: &PermissionRule) {
        let mut state = self.state.write().expect("rule lock poisoned");
        state.deny_rules.retain(|r| r != rule);
        state.allow_rules.retain(|r| r != rule);
        state.glob_rules.retain(|r| r != rule);
    }

    pub fn rules(&self) -> Vec<PermissionRule> {
        let state = self.state.read().expect("rule lock poisoned");
        state
            .deny_rules
            .iter()
            .chain(state.allow_rules.iter())
            .chain(state.glob_rules.iter())
            .cloned()
            .collect()
    }

    /// Returns Ok when execution is authorized.
    ///
    /// When the verdict is "ask", the lock is released and the ask-callback is
    /// invoked; without a callback, [PermissionError::NeedsApproval] is
    /// returned instead.
    pub async fn check(&self, tool_name: &str, args: &Map<String, serde_json::Value>) -> Result<(), PermissionError> {
        let specifier = extract_specifier(tool_name, args);
        let read_only = self.is_read_only(tool_name);

        let verdict = {
            let state = self.state.read().expect("rule lock poisoned");
            evaluate(&state, tool_name, &specifier, read_only)
        };
        debug!(tool_name, %specifier, ?verdict, "permission evaluation");

        match verdict {
            Verdict::Allow => self.validate_sandbox(tool_name, &specifier),
            Verdict::Deny(err) => Err(err),
            Verdict::Ask => {
                let Some(callback) = &self.ask_callback else {
                    return Err(PermissionError::NeedsApproval);
                };
                // Deliberately outside the lock: the dialog may query the
                // engine while open.
                match callback.ask(tool_name, args).await {
                    Ok(AskDecision::Allow) => self.validate_sandbox(tool_name, &specifier),
                    Ok(AskDecision::AllowAlways) => {
                        let specifier_pattern = (!specifier.is_empty()).then(|| specifier.clone());
                        self.add_allow_rule(PermissionRule::new(tool_name, specifier_pattern, RuleAction::Allow));
                        self.validate_sandbox(tool_name, &specifier)
                    },
                    Ok(AskDecision::Deny) => Err(PermissionError::DeniedByUser),
                    Err(err) => {
                        warn!(?err, tool_name, "ask callback failed");
                        Err(PermissionError::AskFailed(err.to_string()))
                    },
                }
            },
        }
    }

    /// File-tool approvals are only honored once the path clears the sandbox.
    fn validate_sandbox(&self, tool_name: &str, specifier: &str) -> Result<(), PermissionError> {
        let Some(sandbox) = &self.sandbox else {
            return Ok(());
        };
        if specifier.is_empty() {
            return Ok(());
        }
        let lowered = tool_name.to_lowercase();
        let for_write = matches!(lowered.as_str(), "edit" | "write" | "notebook_edit");
        let is_file_tool = for_write || matches!(lowered.as_str(), "read" | "grep" | "find" | "ls");
        if !is_file_tool {
            return Ok(());
        }
        sandbox.validate(specifier, for_write)?;
        Ok(())
    }
}

/// Rule evaluation, performed under the read lock.
///
/// Order: unconditional deny, unconditional allow, glob-deny, the plan-mode
/// gate (which an explicit glob-allow escapes), glob-ask, glob-allow, then
/// the mode default. Deny beats ask beats allow throughout.
fn evaluate(state: &RuleState, tool_name: &str, specifier: &str, read_only: bool) -> Verdict {
    for rule in &state.deny_rules {
        if rule.matches(tool_name, specifier) {
            return Verdict::Deny(PermissionError::DeniedByRule { rule: rule.display() });
        }
    }

    for rule in &state.allow_rules {
        if rule.matches(tool_name, specifier) {
            return Verdict::Allow;
        }
    }

    for rule in state.glob_rules.iter().filter(|r| r.action == RuleAction::Deny) {
        if rule.matches(tool_name, specifier) {
            return Verdict::Deny(PermissionError::DeniedByRule { rule: rule.display() });
        }
    }

    let glob_allow_matches = state
        .glob_rules
        .iter()
        .filter(|r| r.action == RuleAction::Allow)
        .any(|r| r.matches(tool_name, specifier));

    if state.mode == PermissionMode::Plan && !read_only {
        if glob_allow_matches {
            return Verdict::Allow;
        }
        return Verdict::Deny(PermissionError::BlockedInPlanMode {
            tool: tool_name.to_string(),
        });
    }

    for rule in state.glob_rules.iter().filter(|r| r.action == RuleAction::Ask) {
        if rule.matches(tool_name, specifier) {
            return Verdict::Ask;
        }
    }

    if glob_allow_matches {
        return Verdict::Allow;
    }

    match state.mode {
        PermissionMode::Bypass => Verdict::Allow,
        PermissionMode::AcceptEdits => {
            let lowered = tool_name.to_lowercase();
            if read_only || matches!(lowered.as_str(), "edit" | "write" | "notebook_edit") {
                Verdict::Allow
            } else {
                Verdict::Ask
            }
        },
        PermissionMode::DontAsk => {
            if read_only {
                Verdict::Allow
            } else {
                Verdict::Deny(PermissionError::DeniedByMode {
                    tool: tool_name.to_string(),
                })
            }
        },
        PermissionMode::Plan | PermissionMode::Normal => {
            if read_only {
                Verdict::Allow
            } else {
                Verdict::Ask
            }
        },
    }
}
