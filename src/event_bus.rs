//! Append-only NDJSON event log shared by wrappers and the controller.
//!
//! Wrappers append one [`RuntimeEvent`] per line. The controller tails the
//! file with a byte-offset cursor and a carry buffer for partial lines, so a
//! poll that lands mid-write picks the rest of the line up next time.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::ProtocolError;
use crate::lifecycle::Signal;
use crate::protocol::{ActiveSession, RuntimeEvent};

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. The whole line goes out in a single `write_all` on
    /// an `O_APPEND` handle so concurrent writers never interleave.
    pub fn append(&self, event: &RuntimeEvent) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()
    }
}

/// Incremental reader over an [`EventLog`] file.
#[derive(Debug)]
pub struct EventTail {
    path: PathBuf,
    offset: u64,
    carry: Vec<u8>,
}

impl EventTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            carry: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Start of the first line not yet decoded. A tail resumed here yields
    /// exactly the events this one has not returned.
    pub fn committed_offset(&self) -> u64 {
        self.offset - self.carry.len() as u64
    }

    /// Continue from a previously committed offset.
    pub fn resume_at(&mut self, offset: u64) {
        self.carry.clear();
        self.offset = offset;
    }

    /// Skip everything currently in the file. Called when a new session starts
    /// so events from earlier sessions are never replayed.
    pub fn prime_to_end(&mut self) -> std::io::Result<()> {
        self.carry.clear();
        self.offset = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(())
    }

    fn reset(&mut self) {
        tracing::debug!(
            target = "agent_fleet::event_bus",
            path = %self.path.display(),
            offset = self.offset,
            "event log shrank, re-reading from start"
        );
        self.offset = 0;
        self.carry.clear();
    }

    /// Read and decode every complete line appended since the last poll.
    pub fn poll(&mut self) -> std::io::Result<Vec<RuntimeEvent>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.offset > 0 || !self.carry.is_empty() {
                    self.reset();
                }
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            self.reset();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)?;
        let chunk_start = self.offset - self.carry.len() as u64;
        self.offset += fresh.len() as u64;
        self.carry.extend_from_slice(&fresh);

        let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        let mut events = Vec::new();
        let mut line_offset = chunk_start;
        for line in complete.split(|b| *b == b'\n') {
            let this_offset = line_offset;
            line_offset += line.len() as u64 + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<RuntimeEvent>(line) {
                Ok(event) => events.push(event),
                Err(source) => {
                    let error = ProtocolError {
                        offset: this_offset,
                        source,
                    };
                    tracing::debug!(target = "agent_fleet::event_bus", error = %error, "dropping event line");
                }
            }
        }
        Ok(events)
    }
}

/// Turn decoded events into lifecycle signals for agents of `session`.
/// Events for other sessions or for agents no longer tracked are dropped.
pub fn route_events(events: Vec<RuntimeEvent>, session: &ActiveSession) -> Vec<(String, Signal)> {
    events
        .into_iter()
        .filter(|event| event.session_id == session.session_id)
        .filter(|event| session.agent(&event.agent_id).is_some())
        .map(|event| {
            (
                event.agent_id,
                Signal::Reported {
                    state: event.state,
                    reason: event.reason,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;

    use super::*;
    use crate::protocol::{AgentState, AgentWindow, LaunchRequest};

    fn event(agent: &str, state: AgentState) -> RuntimeEvent {
        RuntimeEvent::now("s1", agent, "claude", state, None)
    }

    fn line(event: &RuntimeEvent) -> String {
        format!("{}\n", serde_json::to_string(event).unwrap())
    }

    fn append_raw(path: &Path, text: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn append_then_poll_returns_each_event_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let log = EventLog::new(&path);
        let mut tail = EventTail::new(&path);

        log.append(&event("a", AgentState::Running)).unwrap();
        log.append(&event("b", AgentState::Done)).unwrap();
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].agent_id, "a");
        assert_eq!(events[1].state, AgentState::Done);
        assert!(tail.poll().unwrap().is_empty());
    }

    #[test]
    fn partial_line_is_carried_to_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut tail = EventTail::new(&path);

        let first = line(&event("a", AgentState::Running));
        let second = line(&event("b", AgentState::NeedsInput));
        let (head, tail_half) = second.split_at(second.len() / 2);

        append_raw(&path, &first);
        append_raw(&path, head);
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, "a");

        append_raw(&path, tail_half);
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, "b");
        assert_eq!(events[0].state, AgentState::NeedsInput);
        assert!(tail.poll().unwrap().is_empty());
    }

    #[test]
    fn resumed_tail_picks_up_after_committed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut tail = EventTail::new(&path);

        let first = line(&event("a", AgentState::Running));
        let second = line(&event("b", AgentState::Done));
        let (head, rest) = second.split_at(10);
        append_raw(&path, &first);
        append_raw(&path, head);
        assert_eq!(tail.poll().unwrap().len(), 1);
        assert_eq!(tail.committed_offset(), first.len() as u64);

        let mut resumed = EventTail::new(&path);
        resumed.resume_at(tail.committed_offset());
        append_raw(&path, rest);
        let events = resumed.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, "b");
        assert_eq!(events[0].state, AgentState::Done);
    }

    #[test]
    fn truncation_resets_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let log = EventLog::new(&path);
        let mut tail = EventTail::new(&path);

        log.append(&event("a", AgentState::Running)).unwrap();
        log.append(&event("a", AgentState::NeedsInput)).unwrap();
        assert_eq!(tail.poll().unwrap().len(), 2);

        std::fs::write(&path, "").unwrap();
        log.append(&event("c", AgentState::Blocked)).unwrap();
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, "c");
        assert_eq!(tail.offset(), std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut tail = EventTail::new(&path);

        append_raw(&path, "not json\n\n{\"session_id\":\"s1\"}\n");
        append_raw(&path, &line(&event("a", AgentState::Done)));
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, AgentState::Done);
    }

    #[test]
    fn prime_skips_existing_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let log = EventLog::new(&path);
        log.append(&event("old", AgentState::Done)).unwrap();

        let mut tail = EventTail::new(&path);
        tail.prime_to_end().unwrap();
        log.append(&event("new", AgentState::Running)).unwrap();
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].agent_id, "new");
    }

    #[test]
    fn missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut tail = EventTail::new(dir.path().join("absent.ndjson"));
        tail.prime_to_end().unwrap();
        assert_eq!(tail.offset(), 0);
        assert!(tail.poll().unwrap().is_empty());
    }

    #[test]
    fn routing_filters_session_and_agent() {
        let mut session = ActiveSession::new(LaunchRequest::default(), Utc::now());
        session.session_id = "s1".into();
        session.agents.push(AgentWindow {
            agent_id: "a".into(),
            window_id: "w".into(),
            tool_id: "claude".into(),
            directory: PathBuf::from("/tmp"),
            name: "a".into(),
            role: String::new(),
            objective: String::new(),
            tone: String::new(),
            slot: None,
            launched_at: Utc::now(),
            state: AgentState::Running,
            last_focused_at: None,
        });

        let mut foreign = event("a", AgentState::Done);
        foreign.session_id = "other".into();
        let routed = route_events(
            vec![foreign, event("gone", AgentState::Done), event("a", AgentState::Blocked)],
            &session,
        );
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, "a");
        assert!(matches!(
            routed[0].1,
            Signal::Reported {
                state: AgentState::Blocked,
                ..
            }
        ));
    }
}
