use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::lifecycle::Transition;
use crate::protocol::AgentWindow;

/// `RUST_LOG` wins over `--log-level` when set.
pub fn init_logging(cfg: &Config) -> Result<()> {
    install(&cfg.log_level, true)
}

/// Logging for the wrapper. The child's terminal owns stdout, so only
/// warnings and errors reach stderr.
pub fn init_wrapper_logging() -> Result<()> {
    install("warn", false)
}

fn install(default_level: &str, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(ansi)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event_type,
            "payload": payload,
        });

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }

    /// Announce a transition that needs the operator. Silent otherwise.
    pub fn notify(&self, agent: &AgentWindow, transition: &Transition) -> bool {
        if !transition.should_notify() {
            return false;
        }
        tracing::warn!(
            target = "agent_fleet::notify",
            agent = %agent.name,
            agent_id = %agent.agent_id,
            state = %transition.to,
            reason = transition.reason.as_deref().unwrap_or(""),
            "agent needs attention"
        );
        self.emit(
            "agent_attention",
            json!({
                "agent_id": agent.agent_id,
                "name": agent.name,
                "tool": agent.tool_id,
                "window_id": agent.window_id,
                "from": transition.from,
                "state": transition.to,
                "source": transition.source,
                "reason": transition.reason,
            }),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::EventEmitter;
    use crate::lifecycle::{Transition, TransitionSource};
    use crate::protocol::{AgentState, AgentWindow};
    use chrono::Utc;
    use serde_json::json;

    fn agent() -> AgentWindow {
        AgentWindow {
            agent_id: "a1".into(),
            window_id: "@1".into(),
            tool_id: "claude".into(),
            directory: PathBuf::from("/tmp"),
            name: "claude 1".into(),
            role: String::new(),
            objective: String::new(),
            tone: String::new(),
            slot: None,
            launched_at: Utc::now(),
            state: AgentState::NeedsInput,
            last_focused_at: None,
        }
    }

    fn transition(from: AgentState, to: AgentState) -> Transition {
        Transition {
            agent_id: "a1".into(),
            from,
            to,
            source: TransitionSource::IdleHeuristic,
            reason: None,
        }
    }

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::new(false);
        emitter.emit("test", json!({"key": "value"}));
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit("session_launched", json!({"agents": 3}));
        emitter.emit("agent_state", "plain string payload");
    }

    #[test]
    fn only_attention_transitions_notify() {
        let emitter = EventEmitter::new(false);
        assert!(emitter.notify(&agent(), &transition(AgentState::Running, AgentState::NeedsInput)));
        assert!(emitter.notify(&agent(), &transition(AgentState::Running, AgentState::Blocked)));
        assert!(!emitter.notify(&agent(), &transition(AgentState::NeedsInput, AgentState::Running)));
        assert!(!emitter.notify(&agent(), &transition(AgentState::Running, AgentState::Done)));
    }
}
