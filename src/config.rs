use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use crate::automation::DisplaySpec;
use crate::planner::ENV_EVENT_LOG;

pub const DEFAULT_TMUX_SESSION: &str = "agent-fleet";

/// Flags shared by every subcommand.
#[derive(Debug, Args, Clone)]
pub struct Config {
    /// Directory holding session, presets and the event log.
    #[arg(long, global = true, env = "AGENT_FLEET_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "AGENT_FLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit JSON notifications on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub json_output: bool,

    #[arg(long, global = true, default_value_t = 1_500)]
    pub poll_interval_ms: u64,

    #[arg(long, global = true, default_value_t = 400)]
    pub launch_delay_ms: u64,

    #[arg(long, global = true, env = "AGENT_FLEET_TMUX_SESSION", default_value = DEFAULT_TMUX_SESSION)]
    pub tmux_session: String,

    /// Display geometry as WxH or WxH+X+Y. Repeat for more displays.
    #[arg(long = "display", global = true, value_name = "WxH[+X+Y]")]
    pub displays: Vec<DisplaySpec>,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    pub fn paths(&self) -> FleetPaths {
        FleetPaths::new(self.state_dir())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-fleet")
}

/// Files under the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPaths {
    pub root: PathBuf,
    pub session: PathBuf,
    pub presets: PathBuf,
    pub events: PathBuf,
    pub lock: PathBuf,
}

impl FleetPaths {
    pub fn new(root: PathBuf) -> Self {
        let events = std::env::var_os(ENV_EVENT_LOG)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("events.ndjson"));
        Self {
            session: root.join("session.json"),
            presets: root.join("presets.json"),
            lock: root.join("controller.lock"),
            events,
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create state dir {}", self.root.display()))
    }

    /// Take the single-controller lock. Held until the returned guard drops.
    pub fn lock_controller(&self) -> Result<ControllerLock> {
        self.ensure()?;
        ControllerLock::acquire(&self.lock)
    }
}

/// Exclusive `flock` on the controller lock file.
#[derive(Debug)]
pub struct ControllerLock {
    _file: File,
}

impl ControllerLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create lock file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { nix::libc::flock(file.as_raw_fd(), nix::libc::LOCK_EX | nix::libc::LOCK_NB) };
            if rc != 0 {
                anyhow::bail!(
                    "another controller is already running ({})",
                    path.display()
                );
            }
        }

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults() {
        let cfg = Harness::parse_from(["agent-fleet"]).config;
        assert_eq!(cfg.poll_interval(), Duration::from_millis(1_500));
        assert_eq!(cfg.launch_delay(), Duration::from_millis(400));
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.json_output);
        assert!(cfg.displays.is_empty());
    }

    #[test]
    fn displays_repeat() {
        let cfg = Harness::parse_from([
            "agent-fleet",
            "--display",
            "1920x1080",
            "--display",
            "2560x1440+1920+0",
            "--state-dir",
            "/tmp/fleet",
        ])
        .config;
        assert_eq!(cfg.displays.len(), 2);
        assert_eq!(cfg.displays[1].frame.x, 1920);
        let paths = cfg.paths();
        assert_eq!(paths.session, PathBuf::from("/tmp/fleet/session.json"));
        assert_eq!(paths.lock, PathBuf::from("/tmp/fleet/controller.lock"));
    }

    #[cfg(unix)]
    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FleetPaths::new(dir.path().to_path_buf());
        let _held = paths.lock_controller().unwrap();
        assert!(paths.lock_controller().is_err());
    }
}
