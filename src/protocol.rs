use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of entries kept in a session's focus history.
pub const FOCUS_HISTORY_CAP: usize = 32;

/// Tool id used for windows attached from outside a launch.
pub const EXTERNAL_TOOL_ID: &str = "external";

/// Role assigned to attached windows.
pub const ATTACHED_ROLE: &str = "Attached";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Running,
    NeedsInput,
    Blocked,
    Done,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Running => "running",
            AgentState::NeedsInput => "needs_input",
            AgentState::Blocked => "blocked",
            AgentState::Done => "done",
        }
    }

    /// States that warrant the operator's attention.
    pub fn wants_attention(self) -> bool {
        matches!(self, AgentState::NeedsInput | AgentState::Blocked)
    }

    /// Badge text shown in the window decoration.
    pub fn badge(self) -> &'static str {
        match self {
            AgentState::Running => "RUN",
            AgentState::NeedsInput => "INPUT",
            AgentState::Blocked => "BLOCKED",
            AgentState::Done => "DONE",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "running" => Ok(AgentState::Running),
            "needs_input" => Ok(AgentState::NeedsInput),
            "blocked" => Ok(AgentState::Blocked),
            "done" => Ok(AgentState::Done),
            other => Err(format!(
                "invalid state '{other}' (expected running|needs_input|blocked|done)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutPreset {
    #[default]
    Adaptive,
    Balanced,
    Wide,
    Dense,
}

impl LayoutPreset {
    /// Fixed column count, or `None` for the aspect-driven preset.
    pub fn fixed_columns(self) -> Option<usize> {
        match self {
            LayoutPreset::Adaptive => None,
            LayoutPreset::Balanced => Some(2),
            LayoutPreset::Wide => Some(3),
            LayoutPreset::Dense => Some(4),
        }
    }
}

impl FromStr for LayoutPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "adaptive" => Ok(LayoutPreset::Adaptive),
            "balanced" => Ok(LayoutPreset::Balanced),
            "wide" => Ok(LayoutPreset::Wide),
            "dense" => Ok(LayoutPreset::Dense),
            other => Err(format!("unknown layout preset '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalTarget {
    #[default]
    Tmux,
    /// Windows owned by some other terminal, tracked only through attach.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub id: String,
    pub label: String,
    pub frame: Rect,
    /// Area left after menu bars, docks and similar chrome.
    pub usable: Rect,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchItem {
    pub tool_id: String,
    pub directory: PathBuf,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_slot: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub target: TerminalTarget,
    #[serde(default)]
    pub layout: LayoutPreset,
    #[serde(default)]
    pub items: Vec<LaunchItem>,
    /// Display ids to tile across. Empty selects every display.
    #[serde(default)]
    pub displays: Vec<String>,
}

/// One concrete window to create, produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPlan {
    pub agent_id: String,
    pub tool_id: String,
    pub invocation: String,
    pub directory: PathBuf,
    pub name: String,
    pub role: String,
    pub objective: String,
    pub tone: String,
    pub slot: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWindow {
    pub agent_id: String,
    pub window_id: String,
    pub tool_id: String,
    pub directory: PathBuf,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub slot: Option<u32>,
    pub launched_at: DateTime<Utc>,
    pub state: AgentState,
    #[serde(default)]
    pub last_focused_at: Option<DateTime<Utc>>,
}

impl AgentWindow {
    pub fn from_plan(plan: &LaunchPlan, window_id: String, launched_at: DateTime<Utc>) -> Self {
        Self {
            agent_id: plan.agent_id.clone(),
            window_id,
            tool_id: plan.tool_id.clone(),
            directory: plan.directory.clone(),
            name: plan.name.clone(),
            role: plan.role.clone(),
            objective: plan.objective.clone(),
            tone: plan.tone.clone(),
            slot: plan.slot,
            launched_at,
            state: AgentState::Running,
            last_focused_at: None,
        }
    }

    /// Window title pushed to the automation provider.
    pub fn title(&self) -> String {
        match self.slot {
            Some(slot) => format!("[{slot}] {}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusEntry {
    pub agent_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: String,
    pub agents: Vec<AgentWindow>,
    pub request: LaunchRequest,
    pub launched_at: DateTime<Utc>,
    #[serde(default)]
    pub focus_history: VecDeque<FocusEntry>,
    /// Event log position consumed for this session.
    #[serde(default)]
    pub event_offset: u64,
}

impl ActiveSession {
    pub fn new(request: LaunchRequest, launched_at: DateTime<Utc>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            agents: Vec::new(),
            request,
            launched_at,
            focus_history: VecDeque::new(),
            event_offset: 0,
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentWindow> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: &str) -> Option<&mut AgentWindow> {
        self.agents.iter_mut().find(|a| a.agent_id == agent_id)
    }

    pub fn has_window(&self, window_id: &str) -> bool {
        self.agents.iter().any(|a| a.window_id == window_id)
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Record a focus on `agent_id`, trimming the oldest history entries.
    pub fn record_focus(&mut self, agent_id: &str, at: DateTime<Utc>) -> bool {
        let Some(agent) = self.agent_mut(agent_id) else {
            return false;
        };
        agent.last_focused_at = Some(at);
        self.focus_history.push_back(FocusEntry {
            agent_id: agent_id.to_string(),
            at,
        });
        while self.focus_history.len() > FOCUS_HISTORY_CAP {
            self.focus_history.pop_front();
        }
        true
    }
}

/// One line of the event log, written by the wrapper process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub session_id: String,
    pub agent_id: String,
    pub tool: String,
    pub state: AgentState,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn now(
        session_id: &str,
        agent_id: &str,
        tool: &str,
        state: AgentState,
        reason: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            tool: tool.to_string(),
            state,
            reason,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchPreset {
    pub name: String,
    pub request: LaunchRequest,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(ids: &[&str]) -> ActiveSession {
        let mut session = ActiveSession::new(LaunchRequest::default(), Utc::now());
        for id in ids {
            session.agents.push(AgentWindow {
                agent_id: (*id).to_string(),
                window_id: format!("w-{id}"),
                tool_id: "claude".into(),
                directory: PathBuf::from("/tmp"),
                name: (*id).to_string(),
                role: String::new(),
                objective: String::new(),
                tone: String::new(),
                slot: None,
                launched_at: Utc::now(),
                state: AgentState::Running,
                last_focused_at: None,
            });
        }
        session
    }

    #[test]
    fn state_tokens_parse_and_print() {
        for token in ["running", "needs_input", "blocked", "done"] {
            let state: AgentState = token.parse().unwrap();
            assert_eq!(state.to_string(), token);
        }
        assert!("idle".parse::<AgentState>().is_err());
    }

    #[test]
    fn runtime_event_wire_format() {
        let line = r#"{"session_id":"s","agent_id":"a","tool":"claude","state":"needs_input","reason":null,"timestamp":"2026-01-02T03:04:05Z"}"#;
        let event: RuntimeEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.state, AgentState::NeedsInput);
        assert_eq!(event.reason, None);

        let encoded = serde_json::to_value(&event).unwrap();
        assert!(encoded.get("reason").unwrap().is_null());
        assert_eq!(encoded["state"], "needs_input");
    }

    #[test]
    fn launch_item_defaults_count_to_one() {
        let item: LaunchItem =
            serde_json::from_str(r#"{"tool_id":"codex","directory":"/tmp"}"#).unwrap();
        assert_eq!(item.count, 1);
        assert_eq!(item.start_slot, None);
    }

    #[test]
    fn focus_history_is_capped() {
        let mut session = session_with(&["a", "b"]);
        for i in 0..(FOCUS_HISTORY_CAP + 5) {
            let id = if i % 2 == 0 { "a" } else { "b" };
            assert!(session.record_focus(id, Utc::now()));
        }
        assert_eq!(session.focus_history.len(), FOCUS_HISTORY_CAP);
        assert!(session.agent("a").unwrap().last_focused_at.is_some());
        assert!(!session.record_focus("missing", Utc::now()));
    }

    #[test]
    fn title_includes_slot() {
        let mut session = session_with(&["a"]);
        session.agents[0].slot = Some(4);
        assert_eq!(session.agents[0].title(), "[4] a");
    }
}
