use globset::Glob;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;

/// Tools considered safe to run without side effects.
///
/// This set drives the mode defaults and the plan-mode gate; hosts may extend
/// it through the engine when they register additional read-only tools.
pub const READ_ONLY_TOOLS: &[&str] = &["read", "grep", "find", "ls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

/// A single permission rule.
///
/// The tool pattern matches the tool name; the optional specifier pattern
/// matches the tool-specific detail extracted from the arguments (command
/// string, file path, `domain:<host>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    pub tool_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specifier_pattern: Option<String>,
    pub action: RuleAction,
}

impl PermissionRule {
    pub fn new(tool_pattern: impl Into<String>, specifier_pattern: Option<String>, action: RuleAction) -> Self {
        Self {
            tool_pattern: tool_pattern.into(),
            specifier_pattern,
            action,
        }
    }

    pub fn matches(&self, tool_name: &str, specifier: &str) -> bool {
        if !tool_pattern_matches(&self.tool_pattern, tool_name) {
            return false;
        }
        match &self.specifier_pattern {
            Some(pattern) => specifier_pattern_matches(pattern, specifier),
            None => true,
        }
    }

    /// Human-readable form used in denial diagnostics.
    pub fn display(&self) -> String {
        match &self.specifier_pattern {
            Some(spec) => format!("{}({})", self.tool_pattern, spec),
            None => self.tool_pattern.clone(),
        }
    }
}

/// Tool-name match: `*` matches all, a trailing `*` matches as a prefix,
/// anything else is case-insensitive equality.
pub fn tool_pattern_matches(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return tool_name.to_lowercase().starts_with(&prefix.to_lowercase());
    }
    pattern.eq_ignore_ascii_case(tool_name)
}

/// Specifier match.
///
/// A trailing ` *` is a space-prefix match for argv strings, a trailing `*`
/// without the space is a plain character-prefix match, a trailing `/**` is a
/// path-prefix match respecting the directory boundary, and anything else is
/// a glob match with an exact-equality fallback.
pub fn specifier_pattern_matches(pattern: &str, specifier: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(" *") {
        return specifier == prefix || specifier.starts_with(&format!("{} ", prefix));
    }
    if let Some(base) = pattern.strip_suffix("/**") {
        return specifier == base || specifier.starts_with(&format!("{}/", base));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return specifier.starts_with(prefix);
    }
    if let Ok(glob) = Glob::new(pattern) {
        if glob.compile_matcher().is_match(specifier) {
            return true;
        }
    }
    pattern == specifier
}

/// Extracts the tool-specific specifier from the arguments.
pub fn extract_specifier(tool_name: &str, args: &Map<String, serde_json::Value>) -> String {
    let str_arg = |key: &str| {
        args.get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default()
    };

    match tool_name.to_lowercase().as_str() {
        "shell" | "bash" => str_arg("command"),
        "edit" | "write" | "read" | "notebook_edit" => str_arg("file_path"),
        "webfetch" => args
            .get("url")
            .and_then(|v| v.as_str())
            .and_then(|raw| url::Url::parse(raw).ok())
            .and_then(|u| u.host_str().map(|h| format!("domain:{}", h)))
            .unwrap_or_default(),
        "grep" | "find" | "ls" => str_arg("path"),
        _ => String::new(),
    }
}
