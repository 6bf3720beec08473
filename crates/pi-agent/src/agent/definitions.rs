use std::path::{
    Path,
    PathBuf,
};

use tracing::warn;

use super::subagent::SubagentConfig;

const FRONTMATTER_DELIMITER: &str = "---";

/// An agent definition file: `---`-delimited frontmatter over a markdown body
/// that becomes the system prompt.
///
/// Recognized frontmatter keys: `name`, `description`, `model`, `max-turns`,
/// `tools`, `disallowed-tools`, `allowed-tools`. A missing `name` defaults to
/// the file stem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentDefinition {
    pub name: String,
    pub description: Option<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub tools: Option<Vec<String>>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Vec<String>,
    pub system_prompt: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DefinitionError {
    #[error("Frontmatter is not terminated by '---'")]
    UnterminatedFrontmatter,
    #[error("Invalid value for '{}': {}", .key, .value)]
    InvalidValue { key: String, value: String },
    #[error("Failed to read definition file: {}", .0)]
    Io(String),
}

impl AgentDefinition {
    pub fn parse(content: &str, fallback_name: &str) -> Result<Self, DefinitionError> {
        let mut definition = Self {
            name: fallback_name.to_string(),
            ..Default::default()
        };

        let mut lines = content.lines();
        let Some(first) = lines.next() else {
            return Ok(definition);
        };
        if first.trim() != FRONTMATTER_DELIMITER {
            // No frontmatter: the whole document is the system prompt.
            definition.system_prompt = content.trim().to_string();
            return Ok(definition);
        }

        let mut in_frontmatter = true;
        let mut body = Vec::new();
        for line in lines {
            if in_frontmatter {
                if line.trim() == FRONTMATTER_DELIMITER {
                    in_frontmatter = false;
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let Some((key, value)) = line.split_once(':') else {
                    warn!(line, "skipping malformed frontmatter line");
                    continue;
                };
                definition.apply_key(key.trim(), value.trim())?;
            } else {
                body.push(line);
            }
        }
        if in_frontmatter {
            return Err(DefinitionError::UnterminatedFrontmatter);
        }

        definition.system_prompt = body.join("\n").trim().to_string();
        Ok(definition)
    }

    fn apply_key(&mut self, key: &str, value: &str) -> Result<(), DefinitionError> {
        match key {
            "name" => self.name = value.to_string(),
            "description" => self.description = Some(value.to_string()),
            "model" => self.model = Some(value.to_string()),
            "max-turns" => {
                self.max_turns = Some(value.parse().map_err(|_| DefinitionError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?);
            },
            "tools" => self.tools = Some(split_list(value)),
            "allowed-tools" => self.allowed_tools = Some(split_list(value)),
            "disallowed-tools" => self.disallowed_tools = split_list(value),
            other => warn!(key = other, "skipping unrecognized frontmatter key"),
        }
        Ok(())
    }

    /// Renders the definition back to frontmatter form. Parsing the output
    /// yields a definition equal to this one.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(FRONTMATTER_DELIMITER);
        out.push('\n');
        out.push_str(&format!("name: {}\n", self.name));
        if let Some(description) = &self.description {
            out.push_str(&format!("description: {}\n", description));
        }
        if let Some(model) = &self.model {
            out.push_str(&format!("model: {}\n", model));
        }
        if let Some(max_turns) = self.max_turns {
            out.push_str(&format!("max-turns: {}\n", max_turns));
        }
        if let Some(tools) = &self.tools {
            out.push_str(&format!("tools: {}\n", tools.join(", ")));
        }
        if let Some(allowed) = &self.allowed_tools {
            out.push_str(&format!("allowed-tools: {}\n", allowed.join(", ")));
        }
        if !self.disallowed_tools.is_empty() {
            out.push_str(&format!("disallowed-tools: {}\n", self.disallowed_tools.join(", ")));
        }
        out.push_str(FRONTMATTER_DELIMITER);
        out.push('\n');
        if !self.system_prompt.is_empty() {
            out.push_str(&self.system_prompt);
            out.push('\n');
        }
        out
    }

    pub fn to_subagent_config(&self, background: bool) -> SubagentConfig {
        SubagentConfig {
            name: self.name.clone(),
            description: self.description.clone(),
            model: self.model.clone(),
            system_prompt: (!self.system_prompt.is_empty()).then(|| self.system_prompt.clone()),
            allowed_tools: self.allowed_tools.clone().or_else(|| self.tools.clone()),
            disallowed_tools: self.disallowed_tools.clone(),
            max_turns: self.max_turns,
            background,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn load_file(path: &Path) -> Result<AgentDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|err| DefinitionError::Io(err.to_string()))?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("agent");
    AgentDefinition::parse(&content, stem)
}

/// Discovers agent definitions under `.pi-*/agents/*.md` in the project
/// directory. Unreadable files are skipped.
pub fn discover(project_dir: &Path) -> Vec<AgentDefinition> {
    let mut definitions = Vec::new();
    let mut agent_files: Vec<PathBuf> = Vec::new();

    let Ok(entries) = std::fs::read_dir(project_dir) else {
        return definitions;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(".pi-") {
            continue;
        }
        let agents_dir = entry.path().join("agents");
        let Ok(files) = std::fs::read_dir(&agents_dir) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                agent_files.push(path);
            }
        }
    }

    agent_files.sort();
    for path in agent_files {
        match load_file(&path) {
            Ok(definition) => definitions.push(definition),
            Err(err) => warn!(?path, ?err, "skipping unreadable agent definition"),
        }
    }
    definitions
}
