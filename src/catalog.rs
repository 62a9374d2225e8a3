//! Built-in table of launchable tools.

use serde::Serialize;

use crate::protocol::EXTERNAL_TOOL_ID;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDefinition {
    pub id: String,
    pub display_name: String,
    /// Shell command line that starts the tool.
    pub invocation: String,
}

impl ToolDefinition {
    fn new(id: &str, display_name: &str, invocation: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            invocation: invocation.to_string(),
        }
    }

    /// The program part of the invocation, used for PATH resolution.
    pub fn executable(&self) -> Option<String> {
        shlex::split(&self.invocation).and_then(|parts| parts.into_iter().next())
    }
}

#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDefinition>,
}

impl ToolCatalog {
    pub fn builtin() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self {
            tools: vec![
                ToolDefinition::new("claude", "Claude", "claude"),
                ToolDefinition::new("codex", "Codex", "codex"),
                ToolDefinition::new("gemini", "Gemini", "gemini"),
                ToolDefinition::new("aider", "Aider", "aider"),
                ToolDefinition::new("opencode", "OpenCode", "opencode"),
                ToolDefinition::new("shell", "Shell", &shell),
            ],
        }
    }

    #[cfg(test)]
    pub(crate) fn from_tools(tools: Vec<ToolDefinition>) -> Self {
        Self { tools }
    }

    pub fn get(&self, id: &str) -> Option<&ToolDefinition> {
        if id == EXTERNAL_TOOL_ID {
            return None;
        }
        self.tools.iter().find(|tool| tool.id == id)
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
pub(crate) fn test_tool(id: &str, invocation: &str) -> ToolDefinition {
    ToolDefinition::new(id, id, invocation)
}
