//! The wrapper process launched inside every fleet window.
//!
//! Runs the tool's command line through the user's shell on a PTY, passes the
//! terminal through in raw mode, watches the output for prompts and reports
//! lifecycle events to the shared event log.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::attention::{ContentMatcher, ContentSignal};
use crate::error::IdentityResolutionError;
use crate::event_bus::EventLog;
use crate::protocol::{AgentState, RuntimeEvent};
use crate::pty::{PtyExit, PtySession};

/// Exit code for failures inside the wrapper itself.
pub const INTERNAL_FAILURE_EXIT: i32 = 1;

/// Which agent an event speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub session_id: String,
    pub agent_id: String,
    pub tool: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve identity from explicit values, typically flags with an env
/// fallback already applied.
pub fn resolve_identity(
    session_id: Option<String>,
    agent_id: Option<String>,
    tool: Option<String>,
) -> Result<AgentIdentity, IdentityResolutionError> {
    let session_id = non_empty(session_id).ok_or(IdentityResolutionError::MissingSession)?;
    let agent_id = non_empty(agent_id).ok_or(IdentityResolutionError::MissingAgent)?;
    Ok(AgentIdentity {
        session_id,
        agent_id,
        tool: non_empty(tool).unwrap_or_default(),
    })
}

/// Appends this agent's events to the log. Failures are logged, never fatal.
#[derive(Debug, Clone)]
pub struct Reporter {
    log: EventLog,
    identity: AgentIdentity,
}

impl Reporter {
    pub fn new(log: EventLog, identity: AgentIdentity) -> Self {
        Self { log, identity }
    }

    pub fn report(&self, state: AgentState, reason: Option<String>) -> std::io::Result<()> {
        let event = RuntimeEvent::now(
            &self.identity.session_id,
            &self.identity.agent_id,
            &self.identity.tool,
            state,
            reason,
        );
        self.log.append(&event)
    }

    fn report_quietly(&self, state: AgentState, reason: Option<String>) {
        if let Err(error) = self.report(state, reason) {
            tracing::warn!(
                target = "agent_fleet::wrap",
                path = %self.log.path().display(),
                error = %error,
                "failed to append event"
            );
        }
    }
}

/// Command line from `--command`, or else the base64 payload from the
/// environment.
pub fn resolve_command(flag: Option<String>, encoded: Option<String>) -> Result<String, String> {
    if let Some(command) = non_empty(flag) {
        return Ok(command);
    }
    let encoded = non_empty(encoded).ok_or_else(|| "no command given".to_string())?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| format!("command payload is not valid base64: {e}"))?;
    let command =
        String::from_utf8(bytes).map_err(|_| "command payload is not valid UTF-8".to_string())?;
    non_empty(Some(command)).ok_or_else(|| "command payload is empty".to_string())
}

/// `$SHELL -lc <command>`, or `/bin/sh -c <command>` without a usable shell.
pub fn shell_invocation(shell: Option<String>, command: &str) -> (String, Vec<String>) {
    match non_empty(shell) {
        Some(shell) => (shell, vec!["-lc".into(), command.to_string()]),
        None => ("/bin/sh".into(), vec!["-c".into(), command.to_string()]),
    }
}

/// Final event and process exit code for how the child ended.
pub fn final_report(exit: Option<PtyExit>) -> (AgentState, Option<String>, i32) {
    match exit {
        Some(exit) if exit.success => (AgentState::Done, None, 0),
        Some(exit) => (
            AgentState::Blocked,
            Some(format!("exited with status {}", exit.code)),
            i32::try_from(exit.code).unwrap_or(INTERNAL_FAILURE_EXIT),
        ),
        None => (
            AgentState::Blocked,
            Some("exit status unavailable".into()),
            INTERNAL_FAILURE_EXIT,
        ),
    }
}

#[derive(Debug, Clone)]
pub struct WrapOptions {
    pub identity: AgentIdentity,
    pub command: Option<String>,
    pub command_b64: Option<String>,
    pub event_log: PathBuf,
}

fn terminal_size() -> Option<(u16, u16)> {
    use nix::libc;
    use nix::pty::Winsize;

    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    unsafe {
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) == 0
            && winsize.ws_row > 0
            && winsize.ws_col > 0
        {
            Some((winsize.ws_row, winsize.ws_col))
        } else {
            None
        }
    }
}

/// Report `blocked` for a wrapper that could not get its tool going.
fn startup_failure(reporter: &Reporter, reason: String) -> i32 {
    tracing::error!(target = "agent_fleet::wrap", reason = %reason, "wrapper failed to start");
    reporter.report_quietly(AgentState::Blocked, Some(reason));
    INTERNAL_FAILURE_EXIT
}

/// Puts stdin in raw mode and restores the saved settings on drop.
struct RawMode(Option<nix::sys::termios::Termios>);

impl RawMode {
    fn enable() -> Self {
        use nix::sys::termios;
        let Ok(orig) = termios::tcgetattr(std::io::stdin()) else {
            return Self(None);
        };
        let mut raw = orig.clone();
        termios::cfmakeraw(&mut raw);
        let _ = termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &raw);
        Self(Some(orig))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        use nix::sys::termios;
        if let Some(orig) = self.0.take() {
            let _ = termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &orig);
        }
    }
}

/// Run the wrapped tool to completion. Returns the exit code to mirror.
///
/// Every failure after the identity is known ends in a `blocked` event.
pub async fn run_wrap(options: WrapOptions) -> Result<i32> {
    let reporter = Reporter::new(EventLog::new(&options.event_log), options.identity.clone());

    let command = match resolve_command(options.command, options.command_b64) {
        Ok(command) => command,
        Err(reason) => return Ok(startup_failure(&reporter, reason)),
    };

    let (program, args) = shell_invocation(std::env::var("SHELL").ok(), &command);
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(error) => {
            return Ok(startup_failure(
                &reporter,
                format!("working directory unavailable: {error}"),
            ))
        }
    };
    let mut sigwinch =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
            Ok(signal) => signal,
            Err(error) => {
                return Ok(startup_failure(
                    &reporter,
                    format!("cannot watch terminal resizes: {error}"),
                ))
            }
        };
    let (rows, cols) = terminal_size().unwrap_or((24, 80));

    reporter.report_quietly(AgentState::Running, None);
    let (pty, mut pty_rx) = match PtySession::spawn(&program, &args, &cwd, rows, cols) {
        Ok(spawned) => spawned,
        Err(error) => return Ok(startup_failure(&reporter, format!("failed to start: {error:#}"))),
    };

    let raw_mode = RawMode::enable();

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut matcher = ContentMatcher::for_tool(&options.identity.tool);
    let mut reap_tick = tokio::time::interval(Duration::from_millis(500));
    reap_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stdout = tokio::io::stdout();
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }

            Some(data) = stdin_rx.recv() => {
                let _ = pty.write_all(&data);
            }

            chunk = pty_rx.recv() => {
                let Some(chunk) = chunk else {
                    break;
                };
                let _ = stdout.write_all(&chunk).await;
                let _ = stdout.flush().await;

                let text = String::from_utf8_lossy(&chunk);
                match matcher.feed(&text, Instant::now()) {
                    Some(ContentSignal::NeedsInput { pattern, line }) => {
                        tracing::debug!(target = "agent_fleet::wrap", pattern = %pattern, "prompt detected");
                        reporter.report_quietly(AgentState::NeedsInput, Some(line));
                    }
                    Some(ContentSignal::Resumed { pattern }) => {
                        tracing::debug!(target = "agent_fleet::wrap", pattern = %pattern, "tool resumed");
                        reporter.report_quietly(AgentState::Running, None);
                    }
                    None => {}
                }
            }

            _ = reap_tick.tick() => {
                if pty.has_exited() {
                    while let Ok(chunk) = pty_rx.try_recv() {
                        let _ = stdout.write_all(&chunk).await;
                    }
                    let _ = stdout.flush().await;
                    break;
                }
            }

            _ = sigwinch.recv() => {
                if let Some((rows, cols)) = terminal_size() {
                    let _ = pty.resize(rows, cols);
                }
            }
        }
    }

    if interrupted {
        let _ = pty.shutdown();
    }
    let exit = pty.wait().await;
    drop(raw_mode);

    let (state, reason, code) = if interrupted {
        (
            AgentState::Blocked,
            Some("interrupted".to_string()),
            INTERNAL_FAILURE_EXIT,
        )
    } else {
        final_report(exit)
    };
    reporter.report_quietly(state, reason);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_session_and_agent() {
        assert_eq!(
            resolve_identity(None, Some("a".into()), None),
            Err(IdentityResolutionError::MissingSession)
        );
        assert_eq!(
            resolve_identity(Some("s".into()), Some("  ".into()), None),
            Err(IdentityResolutionError::MissingAgent)
        );
        let identity = resolve_identity(Some("s".into()), Some("a".into()), None).unwrap();
        assert_eq!(identity.tool, "");
    }

    #[test]
    fn command_flag_wins_over_payload() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("codex --full-auto");
        assert_eq!(
            resolve_command(Some("claude".into()), Some(encoded.clone())),
            Ok("claude".to_string())
        );
        assert_eq!(
            resolve_command(None, Some(encoded)),
            Ok("codex --full-auto".to_string())
        );
    }

    #[test]
    fn bad_payloads_are_rejected() {
        assert!(resolve_command(None, None).is_err());
        assert!(resolve_command(None, Some("%%%".into())).is_err());
        let not_utf8 = base64::engine::general_purpose::STANDARD.encode([0xff, 0xfe]);
        assert!(resolve_command(None, Some(not_utf8)).is_err());
        let blank = base64::engine::general_purpose::STANDARD.encode("   ");
        assert!(resolve_command(None, Some(blank)).is_err());
    }

    #[test]
    fn shell_falls_back_to_sh() {
        let (program, args) = shell_invocation(Some("/bin/zsh".into()), "claude");
        assert_eq!(program, "/bin/zsh");
        assert_eq!(args, vec!["-lc", "claude"]);
        let (program, args) = shell_invocation(Some(String::new()), "claude");
        assert_eq!(program, "/bin/sh");
        assert_eq!(args, vec!["-c", "claude"]);
    }

    #[test]
    fn exit_maps_to_final_state() {
        assert_eq!(
            final_report(Some(PtyExit {
                code: 0,
                success: true
            })),
            (AgentState::Done, None, 0)
        );
        let (state, reason, code) = final_report(Some(PtyExit {
            code: 2,
            success: false,
        }));
        assert_eq!(state, AgentState::Blocked);
        assert_eq!(reason.as_deref(), Some("exited with status 2"));
        assert_eq!(code, 2);
        assert_eq!(final_report(None).2, INTERNAL_FAILURE_EXIT);
    }

    #[test]
    fn reporter_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let identity = resolve_identity(Some("s".into()), Some("a".into()), Some("claude".into())).unwrap();
        let reporter = Reporter::new(EventLog::new(&path), identity);
        reporter.report(AgentState::Running, None).unwrap();
        reporter
            .report(AgentState::Blocked, Some("exited with status 1".into()))
            .unwrap();

        let mut tail = crate::event_bus::EventTail::new(&path);
        let events = tail.poll().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tool, "claude");
        assert_eq!(events[1].reason.as_deref(), Some("exited with status 1"));
    }

    #[test]
    fn startup_failure_reports_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let identity = resolve_identity(Some("s".into()), Some("a".into()), None).unwrap();
        let reporter = Reporter::new(EventLog::new(&path), identity);

        let code = startup_failure(&reporter, "working directory unavailable".into());
        assert_eq!(code, INTERNAL_FAILURE_EXIT);

        let events = crate::event_bus::EventTail::new(&path).poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, AgentState::Blocked);
        assert_eq!(events[0].reason.as_deref(), Some("working directory unavailable"));
    }

    #[tokio::test]
    async fn wrap_without_command_exits_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let options = WrapOptions {
            identity: resolve_identity(Some("s".into()), Some("a".into()), None).unwrap(),
            command: None,
            command_b64: None,
            event_log: path.clone(),
        };

        assert_eq!(run_wrap(options).await.unwrap(), INTERNAL_FAILURE_EXIT);
        let events = crate::event_bus::EventTail::new(&path).poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].state, AgentState::Blocked);
        assert_eq!(events[0].reason.as_deref(), Some("no command given"));
    }
}
