//! Seams to the terminal and display layers.
//!
//! The controller only talks to [`TerminalAutomation`] and [`DisplayProvider`].
//! [`TmuxAutomation`] drives windows of one dedicated tmux session;
//! [`StaticDisplays`] serves display geometry from configuration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::attention::{Activity, ForegroundClassifier, PsCensus};
use crate::error::AutomationError;
use crate::protocol::{DisplayGeometry, Rect};

/// Everything a provider needs to open one worker window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowLaunch {
    pub title: String,
    pub directory: PathBuf,
    /// Shell command line run inside the new window.
    pub command: String,
    pub display_id: String,
    pub bounds: Rect,
}

/// Visible decoration of a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowIdentity {
    pub title: String,
    pub badge: String,
    pub tone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub window_id: String,
    pub title: String,
    pub bounds: Option<Rect>,
}

/// Platform capability that creates and manipulates terminal windows.
///
/// Calls are blocking; async callers move them onto the blocking pool.
pub trait TerminalAutomation: Send + Sync {
    /// Open a window and return its provider-assigned id.
    fn launch_window(&self, launch: &WindowLaunch) -> Result<String, AutomationError>;
    fn set_bounds(&self, window_id: &str, bounds: Rect) -> Result<(), AutomationError>;
    fn close_window(&self, window_id: &str) -> Result<(), AutomationError>;
    fn focus_window(&self, window_id: &str) -> Result<(), AutomationError>;
    /// Every window the provider currently knows about.
    fn list_window_snapshots(&self) -> Result<Vec<WindowSnapshot>, AutomationError>;
    fn apply_identity(
        &self,
        window_id: &str,
        identity: &WindowIdentity,
    ) -> Result<(), AutomationError>;
    /// Visible text of the window.
    fn read_session_content(&self, window_id: &str) -> Result<String, AutomationError>;
    /// Subset of `candidates` whose terminals look idle. Windows left out are
    /// busy.
    fn detect_idle_window_ids(
        &self,
        candidates: &[String],
    ) -> Result<HashSet<String>, AutomationError>;
}

pub trait DisplayProvider: Send + Sync {
    fn displays(&self) -> Vec<DisplayGeometry>;
}

/// A `WxH[+X+Y]` display description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySpec {
    pub frame: Rect,
}

impl FromStr for DisplaySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || format!("invalid display '{s}' (expected WxH or WxH+X+Y)");
        let (size, origin) = match s.find(['+', '-']) {
            Some(idx) => (&s[..idx], Some(&s[idx..])),
            None => (s, None),
        };
        let (w, h) = size.split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: i32 = w.parse().map_err(|_| invalid())?;
        let height: i32 = h.parse().map_err(|_| invalid())?;
        if width <= 0 || height <= 0 {
            return Err(invalid());
        }
        let (x, y) = match origin {
            None => (0, 0),
            Some(origin) => parse_origin(origin).ok_or_else(invalid)?,
        };
        Ok(Self {
            frame: Rect::new(x, y, width, height),
        })
    }
}

/// Parse `+X+Y` where either sign may be `-`.
fn parse_origin(origin: &str) -> Option<(i32, i32)> {
    let split = origin[1..].find(['+', '-'])? + 1;
    let x: i32 = origin[..split].trim_start_matches('+').parse().ok()?;
    let y: i32 = origin[split..].trim_start_matches('+').parse().ok()?;
    Some((x, y))
}

/// Displays fixed at startup. Usable area equals the full frame.
#[derive(Debug, Clone)]
pub struct StaticDisplays {
    displays: Vec<DisplayGeometry>,
}

impl StaticDisplays {
    pub fn new(specs: &[DisplaySpec]) -> Self {
        let displays = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| DisplayGeometry {
                id: format!("display-{}", index + 1),
                label: format!(
                    "Display {} ({}x{})",
                    index + 1,
                    spec.frame.width,
                    spec.frame.height
                ),
                frame: spec.frame,
                usable: spec.frame,
            })
            .collect();
        Self { displays }
    }
}

impl Default for StaticDisplays {
    fn default() -> Self {
        Self::new(&[DisplaySpec {
            frame: Rect::new(0, 0, 1920, 1080),
        }])
    }
}

impl DisplayProvider for StaticDisplays {
    fn displays(&self) -> Vec<DisplayGeometry> {
        self.displays.clone()
    }
}

/// Windows are tmux windows inside one dedicated tmux session.
///
/// tmux windows are always full-size, so bounds are only remembered and
/// reported back through snapshots.
pub struct TmuxAutomation {
    session_name: String,
    bounds: Mutex<HashMap<String, Rect>>,
    classifier: Arc<dyn ForegroundClassifier>,
}

impl TmuxAutomation {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            bounds: Mutex::new(HashMap::new()),
            classifier: Arc::new(PsCensus),
        }
    }

    fn tmux(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| format!("failed to run tmux: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn has_session(&self) -> bool {
        self.tmux(&["has-session", "-t", &self.session_name]).is_ok()
    }

    fn session_target(&self) -> String {
        format!("{}:", self.session_name)
    }

    /// Map of window id to the tty of its active pane.
    fn pane_ttys(&self) -> Result<HashMap<String, String>, AutomationError> {
        let out = self
            .tmux(&[
                "list-panes",
                "-s",
                "-t",
                &self.session_name,
                "-F",
                "#{window_id}\t#{pane_active}\t#{pane_tty}",
            ])
            .map_err(AutomationError::Unavailable)?;
        Ok(parse_pane_ttys(&out))
    }
}

fn session_missing(message: &str) -> bool {
    message.contains("can't find session")
        || message.contains("no server running")
        || message.contains("error connecting")
}

fn parse_window_list(out: &str) -> Vec<(String, String)> {
    out.lines()
        .filter_map(|line| {
            let (id, name) = line.split_once('\t')?;
            let id = id.trim();
            (!id.is_empty()).then(|| (id.to_string(), name.to_string()))
        })
        .collect()
}

fn parse_pane_ttys(out: &str) -> HashMap<String, String> {
    let mut ttys = HashMap::new();
    for line in out.lines() {
        let mut fields = line.split('\t');
        let (Some(window), Some(active), Some(tty)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if active == "1" || !ttys.contains_key(window) {
            ttys.insert(window.to_string(), tty.to_string());
        }
    }
    ttys
}

/// Title as shown in the tmux status line.
fn decorated_title(identity: &WindowIdentity) -> String {
    if identity.badge.is_empty() {
        identity.title.clone()
    } else {
        format!("{} {}", identity.badge, identity.title)
    }
}

impl TerminalAutomation for TmuxAutomation {
    fn launch_window(&self, launch: &WindowLaunch) -> Result<String, AutomationError> {
        let directory = launch.directory.to_string_lossy();
        let result = if self.has_session() {
            self.tmux(&[
                "new-window",
                "-d",
                "-P",
                "-F",
                "#{window_id}",
                "-t",
                &self.session_target(),
                "-n",
                &launch.title,
                "-c",
                &directory,
                &launch.command,
            ])
        } else {
            self.tmux(&[
                "new-session",
                "-d",
                "-P",
                "-F",
                "#{window_id}",
                "-s",
                &self.session_name,
                "-n",
                &launch.title,
                "-c",
                &directory,
                &launch.command,
            ])
        };
        let window_id = result.map_err(AutomationError::Launch)?.trim().to_string();
        if window_id.is_empty() {
            return Err(AutomationError::Launch("tmux returned no window id".into()));
        }
        tracing::debug!(
            target = "agent_fleet::automation",
            window_id = %window_id,
            session = %self.session_name,
            "opened tmux window"
        );
        Ok(window_id)
    }

    fn set_bounds(&self, window_id: &str, bounds: Rect) -> Result<(), AutomationError> {
        self.tmux(&["display-message", "-p", "-t", window_id, "#{window_id}"])
            .map_err(|message| AutomationError::Bounds {
                window_id: window_id.to_string(),
                message,
            })?;
        self.bounds.lock().insert(window_id.to_string(), bounds);
        Ok(())
    }

    fn close_window(&self, window_id: &str) -> Result<(), AutomationError> {
        match self.tmux(&["kill-window", "-t", window_id]) {
            Ok(_) => {}
            // Already gone counts as closed.
            Err(message) if message.contains("can't find window") => {}
            Err(message) => {
                return Err(AutomationError::Close {
                    window_id: window_id.to_string(),
                    message,
                })
            }
        }
        self.bounds.lock().remove(window_id);
        Ok(())
    }

    fn focus_window(&self, window_id: &str) -> Result<(), AutomationError> {
        self.tmux(&["select-window", "-t", window_id])
            .map(|_| ())
            .map_err(|message| AutomationError::Focus {
                window_id: window_id.to_string(),
                message,
            })
    }

    fn list_window_snapshots(&self) -> Result<Vec<WindowSnapshot>, AutomationError> {
        let out = match self.tmux(&[
            "list-windows",
            "-t",
            &self.session_name,
            "-F",
            "#{window_id}\t#{window_name}",
        ]) {
            Ok(out) => out,
            Err(message) if session_missing(&message) => return Ok(Vec::new()),
            Err(message) => return Err(AutomationError::Unavailable(message)),
        };
        let bounds = self.bounds.lock();
        Ok(parse_window_list(&out)
            .into_iter()
            .map(|(window_id, title)| WindowSnapshot {
                bounds: bounds.get(&window_id).copied(),
                window_id,
                title,
            })
            .collect())
    }

    fn apply_identity(
        &self,
        window_id: &str,
        identity: &WindowIdentity,
    ) -> Result<(), AutomationError> {
        let to_error = |message: String| AutomationError::Identity {
            window_id: window_id.to_string(),
            message,
        };
        self.tmux(&["rename-window", "-t", window_id, &decorated_title(identity)])
            .map_err(to_error)?;
        if !identity.tone.is_empty() {
            let style = format!("fg={}", identity.tone);
            self.tmux(&[
                "set-window-option",
                "-t",
                window_id,
                "window-status-style",
                &style,
            ])
            .map_err(to_error)?;
        }
        Ok(())
    }

    fn read_session_content(&self, window_id: &str) -> Result<String, AutomationError> {
        self.tmux(&["capture-pane", "-p", "-J", "-t", window_id])
            .map_err(|message| {
                if message.contains("can't find") {
                    AutomationError::UnknownWindow(window_id.to_string())
                } else {
                    AutomationError::Unavailable(message)
                }
            })
    }

    fn detect_idle_window_ids(
        &self,
        candidates: &[String],
    ) -> Result<HashSet<String>, AutomationError> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }
        let ttys = self.pane_ttys()?;
        let wanted: Vec<String> = candidates
            .iter()
            .filter_map(|id| ttys.get(id).cloned())
            .collect();
        if wanted.is_empty() {
            return Ok(HashSet::new());
        }
        let activity = self.classifier.classify(&wanted);
        if activity.is_empty() {
            return Err(AutomationError::Unavailable(
                "foreground census returned nothing".into(),
            ));
        }
        Ok(candidates
            .iter()
            .filter(|id| {
                ttys.get(*id)
                    .and_then(|tty| activity.get(tty))
                    .is_some_and(|a| *a == Activity::Idle)
            })
            .cloned()
            .collect())
    }
}
