//! Agent lifecycle state machine.
//!
//! Three sources drive transitions: explicit wrapper events, the idle
//! heuristics and manual operator overrides. Explicit events always win; the
//! heuristics only toggle between `running` and `needs_input`.

use std::collections::HashSet;

use serde::Serialize;

use crate::protocol::{ActiveSession, AgentState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    EventBus,
    IdleHeuristic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// State reported by the wrapper through the event log.
    Reported {
        state: AgentState,
        reason: Option<String>,
    },
    /// A heuristic believes the worker is waiting on a human.
    Idle,
    /// A heuristic saw active work.
    Busy,
    /// Operator override.
    Manual(AgentState),
}

impl Signal {
    pub fn source(&self) -> TransitionSource {
        match self {
            Signal::Reported { .. } => TransitionSource::EventBus,
            Signal::Idle | Signal::Busy => TransitionSource::IdleHeuristic,
            Signal::Manual(_) => TransitionSource::Manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub agent_id: String,
    pub from: AgentState,
    pub to: AgentState,
    pub source: TransitionSource,
    pub reason: Option<String>,
}

impl Transition {
    /// Entering `needs_input` or `blocked` is announced; leaving is silent.
    pub fn should_notify(&self) -> bool {
        self.from != self.to && self.to.wants_attention()
    }
}

/// Next state for `current` under `signal`, or `None` when nothing changes.
pub fn next_state(current: AgentState, signal: &Signal) -> Option<AgentState> {
    match signal {
        Signal::Reported { state, .. } => (*state != current).then_some(*state),
        Signal::Idle => (current == AgentState::Running).then_some(AgentState::NeedsInput),
        Signal::Busy => (current == AgentState::NeedsInput).then_some(AgentState::Running),
        Signal::Manual(state) => Some(*state),
    }
}

/// Apply one signal to one agent of `session`.
pub fn apply(session: &mut ActiveSession, agent_id: &str, signal: &Signal) -> Option<Transition> {
    let agent = session.agent_mut(agent_id)?;
    let to = next_state(agent.state, signal)?;
    let from = agent.state;
    agent.state = to;
    let reason = match signal {
        Signal::Reported { reason, .. } => reason.clone(),
        _ => None,
    };
    Some(Transition {
        agent_id: agent_id.to_string(),
        from,
        to,
        source: signal.source(),
        reason,
    })
}

/// Apply everything gathered during one poll cycle in priority order.
///
/// Reported events are applied first, in arrival order. Agents that received
/// a reported event this cycle ignore heuristic signals for the same cycle.
pub fn apply_cycle(
    session: &mut ActiveSession,
    signals: impl IntoIterator<Item = (String, Signal)>,
) -> Vec<Transition> {
    let (reported, rest): (Vec<_>, Vec<_>) = signals
        .into_iter()
        .partition(|(_, signal)| matches!(signal, Signal::Reported { .. }));

    let mut transitions = Vec::new();
    let mut explicit: HashSet<String> = HashSet::new();
    for (agent_id, signal) in reported {
        if session.agent(&agent_id).is_none() {
            continue;
        }
        explicit.insert(agent_id.clone());
        transitions.extend(apply(session, &agent_id, &signal));
    }

    for (agent_id, signal) in rest {
        if matches!(signal, Signal::Idle | Signal::Busy) && explicit.contains(&agent_id) {
            continue;
        }
        transitions.extend(apply(session, &agent_id, &signal));
    }
    transitions
}
