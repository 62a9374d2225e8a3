//! Foreground process-group census.
//!
//! A terminal whose foreground process group holds only the shell and the
//! tool itself is treated as idle. Any extra foreground process (a compiler,
//! a test run, a subprocess the tool launched) marks it busy. One process
//! table snapshot serves every terminal in a poll cycle.
//!
//! Tools launched through the wrapper run on a PTY the wrapper owns, so the
//! window's terminal is first resolved to the innermost terminal reachable
//! through its process tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Command;

use serde::Serialize;

/// Foreground process count at or below which a terminal counts as idle.
pub const IDLE_FOREGROUND_THRESHOLD: usize = 2;
/// Nested terminals followed when resolving a window's terminal.
const MAX_TERMINAL_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Busy,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcessEntry {
    pid: u32,
    ppid: u32,
    tty: Option<String>,
    stat: String,
}

/// Parsed `ps -A -o pid=,ppid=,tty=,stat=` snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
}

/// Normalise a tty path so `/dev/ttys003` and `ttys003` compare equal.
pub fn normalize_tty(tty: &str) -> String {
    tty.trim().trim_start_matches("/dev/").to_string()
}

fn has_terminal(tty: &str) -> bool {
    !(tty.is_empty() || tty.starts_with('?') || tty == "-")
}

impl ProcessTable {
    pub fn parse(ps_output: &str) -> Self {
        let entries = ps_output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let pid = fields.next()?.parse().ok()?;
                let ppid = fields.next()?.parse().ok()?;
                let tty = fields.next()?;
                let stat = fields.next()?;
                Some(ProcessEntry {
                    pid,
                    ppid,
                    tty: has_terminal(tty).then(|| normalize_tty(tty)),
                    stat: stat.to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn capture() -> std::io::Result<Self> {
        let output = Command::new("ps")
            .args(["-A", "-o", "pid=,ppid=,tty=,stat="])
            .output()?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "ps exited with {}",
                output.status
            )));
        }
        Ok(Self::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    fn on_tty<'a>(&'a self, tty: &'a str) -> impl Iterator<Item = &'a ProcessEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.tty.as_deref() == Some(tty))
    }

    /// First terminal other than `tty` found among descendants of processes
    /// on `tty`, breadth first.
    fn nested_terminal(&self, tty: &str) -> Option<String> {
        let mut seen: HashSet<u32> = self.on_tty(tty).map(|e| e.pid).collect();
        let mut queue: VecDeque<u32> = seen.iter().copied().collect();
        while let Some(parent) = queue.pop_front() {
            for child in self.entries.iter().filter(|e| e.ppid == parent) {
                if !seen.insert(child.pid) {
                    continue;
                }
                match child.tty.as_deref() {
                    Some(other) if other != tty => return Some(other.to_string()),
                    _ => queue.push_back(child.pid),
                }
            }
        }
        None
    }

    /// Innermost terminal reachable from `tty`.
    pub fn resolve_terminal(&self, tty: &str) -> String {
        let mut current = normalize_tty(tty);
        for _ in 0..MAX_TERMINAL_DEPTH {
            match self.nested_terminal(&current) {
                Some(inner) => current = inner,
                None => break,
            }
        }
        current
    }

    /// Processes on `tty` flagged as members of its foreground process group.
    pub fn foreground_count(&self, tty: &str) -> usize {
        let tty = normalize_tty(tty);
        self.on_tty(&tty)
            .filter(|entry| entry.stat.contains('+'))
            .count()
    }

    pub fn classify(&self, tty: &str) -> Activity {
        let terminal = self.resolve_terminal(tty);
        if self.foreground_count(&terminal) <= IDLE_FOREGROUND_THRESHOLD {
            Activity::Idle
        } else {
            Activity::Busy
        }
    }
}

/// Decides busy/idle for a set of terminals.
pub trait ForegroundClassifier: Send + Sync {
    fn classify(&self, ttys: &[String]) -> HashMap<String, Activity>;
}

/// Classifier backed by the system `ps` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsCensus;

impl ForegroundClassifier for PsCensus {
    fn classify(&self, ttys: &[String]) -> HashMap<String, Activity> {
        if ttys.is_empty() {
            return HashMap::new();
        }
        let table = match ProcessTable::capture() {
            Ok(table) => table,
            Err(error) => {
                tracing::warn!(
                    target = "agent_fleet::attention::census",
                    error = %error,
                    "process snapshot failed, skipping idle census"
                );
                return HashMap::new();
            }
        };
        ttys.iter()
            .map(|tty| (tty.clone(), table.classify(tty)))
            .collect()
    }
}
