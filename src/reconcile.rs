//! Keep the session in step with the windows that actually exist.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::automation::WindowSnapshot;
use crate::protocol::{ActiveSession, AgentState, AgentWindow, ATTACHED_ROLE, EXTERNAL_TOOL_ID};

/// Drop every agent whose window is not in `snapshots`. Returns the removed
/// agents in session order. Windows the session does not know are ignored.
pub fn reconcile(session: &mut ActiveSession, snapshots: &[WindowSnapshot]) -> Vec<AgentWindow> {
    let live: HashSet<&str> = snapshots.iter().map(|s| s.window_id.as_str()).collect();
    let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut session.agents)
        .into_iter()
        .partition(|agent| live.contains(agent.window_id.as_str()));
    session.agents = kept;
    if !removed.is_empty() {
        let gone: HashSet<&str> = removed.iter().map(|a| a.agent_id.as_str()).collect();
        session
            .focus_history
            .retain(|entry| !gone.contains(entry.agent_id.as_str()));
    }
    removed
}

/// Adopt existing windows as `external` agents. Window ids already tracked,
/// or repeated in `window_ids`, are skipped. Returns the new agent ids.
pub fn import_windows(
    session: &mut ActiveSession,
    window_ids: &[String],
    snapshots: &[WindowSnapshot],
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut added = Vec::new();
    for window_id in window_ids {
        let window_id = window_id.trim();
        if window_id.is_empty() || session.has_window(window_id) {
            continue;
        }
        let name = snapshots
            .iter()
            .find(|s| s.window_id == window_id)
            .map(|s| s.title.trim())
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Window {window_id}"));
        let agent_id = uuid::Uuid::new_v4().to_string();
        session.agents.push(AgentWindow {
            agent_id: agent_id.clone(),
            window_id: window_id.to_string(),
            tool_id: EXTERNAL_TOOL_ID.to_string(),
            directory: std::env::current_dir().unwrap_or_default(),
            name,
            role: ATTACHED_ROLE.to_string(),
            objective: String::new(),
            tone: String::new(),
            slot: None,
            launched_at: now,
            state: AgentState::Running,
            last_focused_at: None,
        });
        added.push(agent_id);
    }
    added
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::protocol::LaunchRequest;

    fn snapshot(id: &str, title: &str) -> WindowSnapshot {
        WindowSnapshot {
            window_id: id.into(),
            title: title.into(),
            bounds: None,
        }
    }

    fn session_with_windows(ids: &[&str]) -> ActiveSession {
        let mut session = ActiveSession::new(LaunchRequest::default(), Utc::now());
        for id in ids {
            session.agents.push(AgentWindow {
                agent_id: format!("agent-{id}"),
                window_id: (*id).to_string(),
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
    fn vanished_windows_are_pruned() {
        let mut session = session_with_windows(&["@1", "@2", "@3"]);
        session.record_focus("agent-@2", Utc::now());
        let removed = reconcile(&mut session, &[snapshot("@1", ""), snapshot("@3", ""), snapshot("@9", "")]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].window_id, "@2");
        let ids: Vec<_> = session.agents.iter().map(|a| a.window_id.as_str()).collect();
        assert_eq!(ids, vec!["@1", "@3"]);
        assert!(session.focus_history.is_empty());
    }

    #[test]
    fn last_window_gone_empties_session() {
        let mut session = session_with_windows(&["@1"]);
        reconcile(&mut session, &[]);
        assert!(session.is_empty());
    }

    #[test]
    fn reconcile_never_imports() {
        let mut session = session_with_windows(&[]);
        reconcile(&mut session, &[snapshot("@4", "vim")]);
        assert!(session.is_empty());
    }

    #[test]
    fn import_dedupes_and_names_windows() {
        let mut session = session_with_windows(&["@1"]);
        let snapshots = [snapshot("@1", "claude"), snapshot("@5", "htop"), snapshot("@6", "  ")];
        let added = import_windows(
            &mut session,
            &["@1".into(), "@5".into(), "@5".into(), "@6".into()],
            &snapshots,
            Utc::now(),
        );
        assert_eq!(added.len(), 2);
        let attached: Vec<_> = session.agents.iter().skip(1).collect();
        assert_eq!(attached[0].name, "htop");
        assert_eq!(attached[1].name, "Window @6");
        for agent in attached {
            assert_eq!(agent.tool_id, EXTERNAL_TOOL_ID);
            assert_eq!(agent.role, ATTACHED_ROLE);
            assert_eq!(agent.state, AgentState::Running);
        }
    }
}
