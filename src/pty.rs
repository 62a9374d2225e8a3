//! The pseudo-terminal the wrapper runs its tool on.

use std::{
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::helpers::resolve_command_path;

const READ_CHUNK: usize = 4096;
const OUTPUT_QUEUE: usize = 256;

/// How the wrapped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyExit {
    pub code: u32,
    pub success: bool,
}

impl From<portable_pty::ExitStatus> for PtyExit {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            success: status.success(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildStatus {
    Running,
    Exited(PtyExit),
    /// Gone, but someone else collected the status.
    Lost,
}

impl ChildStatus {
    fn is_running(self) -> bool {
        self == ChildStatus::Running
    }

    fn exit(self) -> Option<PtyExit> {
        match self {
            ChildStatus::Exited(exit) => Some(exit),
            _ => None,
        }
    }
}

fn size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Forward PTY output until EOF or until the receiver goes away.
fn pump_output(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut chunk = [0u8; READ_CHUNK];
    while let Ok(n) = reader.read(&mut chunk) {
        if n == 0 || tx.blocking_send(chunk[..n].to_vec()).is_err() {
            break;
        }
    }
}

pub struct PtySession {
    master: Box<dyn MasterPty>,
    input: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send>>>,
    pid: Option<u32>,
    status: Mutex<ChildStatus>,
}

impl PtySession {
    /// Start `program` on a fresh PTY in `cwd`. Output arrives on the
    /// returned channel, which closes when the PTY reaches EOF.
    pub fn spawn(
        program: &str,
        args: &[String],
        cwd: &Path,
        rows: u16,
        cols: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pair = native_pty_system()
            .openpty(size(rows, cols))
            .context("openpty failed")?;

        let program_path = resolve_command_path(program)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());
        let mut command = CommandBuilder::new(program_path);
        command.args(args);
        command.cwd(cwd);

        let child = pair
            .slave
            .spawn_command(command)
            .with_context(|| format!("could not start {program}"))?;
        let pid = child.process_id();
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("pty has no readable side")?;
        let input = pair
            .master
            .take_writer()
            .context("pty has no writable side")?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        std::thread::spawn(move || pump_output(reader, tx));

        let session = Self {
            master: pair.master,
            input: Mutex::new(input),
            child: Arc::new(Mutex::new(child)),
            pid,
            status: Mutex::new(ChildStatus::Running),
        };
        Ok((session, rx))
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut input = self.input.lock();
        input.write_all(bytes)?;
        input.flush()?;
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(size(rows, cols))
            .context("pty resize failed")
    }

    /// Exit status, once the child has been reaped.
    pub fn exit_status(&self) -> Option<PtyExit> {
        self.status.lock().exit()
    }

    /// Non-blocking check whether the child is gone.
    pub fn has_exited(&self) -> bool {
        if !self.status.lock().is_running() {
            return true;
        }
        let next = match self.child.lock().try_wait() {
            Ok(Some(exit)) => ChildStatus::Exited(exit.into()),
            Ok(None) if self.process_missing() => ChildStatus::Lost,
            Ok(None) => return false,
            Err(error) => {
                tracing::debug!(
                    target = "agent_fleet::pty",
                    pid = ?self.pid,
                    error = %error,
                    "try_wait failed, treating child as gone"
                );
                ChildStatus::Lost
            }
        };
        *self.status.lock() = next;
        true
    }

    #[cfg(unix)]
    fn process_missing(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        // SAFETY: signal 0 performs the existence check only.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
    }

    #[cfg(not(unix))]
    fn process_missing(&self) -> bool {
        false
    }

    /// Block (off the runtime) until the child exits.
    pub async fn wait(&self) -> Option<PtyExit> {
        let current = *self.status.lock();
        if !current.is_running() {
            return current.exit();
        }
        let child = Arc::clone(&self.child);
        let waited = tokio::task::spawn_blocking(move || {
            let mut child = child.lock();
            child.wait()
        })
        .await;
        let next = match waited {
            Ok(Ok(exit)) => ChildStatus::Exited(exit.into()),
            _ => ChildStatus::Lost,
        };
        *self.status.lock() = next;
        next.exit()
    }

    /// Kill the child and collect its status.
    pub fn shutdown(&self) -> Result<()> {
        let mut child = self.child.lock();
        if let Err(error) = child.kill() {
            tracing::debug!(target = "agent_fleet::pty", error = %error, "kill failed");
        }
        let next = match child.wait() {
            Ok(exit) => ChildStatus::Exited(exit.into()),
            Err(_) => ChildStatus::Lost,
        };
        let mut status = self.status.lock();
        if status.is_running() {
            *status = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::PtySession;
    use tokio::time::{timeout, Duration};

    fn sh(script: &str) -> PtySession {
        let args = vec!["-c".to_string(), script.to_string()];
        PtySession::spawn("sh", &args, &std::env::temp_dir(), 24, 80)
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn output_reaches_the_channel() {
        let args = vec!["-c".to_string(), "printf 'Allow command? [y/n]'".to_string()];
        let (pty, mut rx) = PtySession::spawn("sh", &args, &std::env::temp_dir(), 24, 80).unwrap();
        let mut seen = String::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(3), rx.recv()).await {
            seen.push_str(&String::from_utf8_lossy(&chunk));
            if seen.contains("[y/n]") {
                break;
            }
        }
        assert!(seen.contains("Allow command? [y/n]"));
        let _ = pty.wait().await;
    }

    #[tokio::test]
    async fn nonzero_exit_is_captured() {
        let pty = sh("exit 7");
        let exit = timeout(Duration::from_secs(5), pty.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, 7);
        assert!(!exit.success);
        assert!(pty.has_exited());
        assert_eq!(pty.exit_status(), Some(exit));
    }

    #[tokio::test]
    async fn shutdown_stops_a_running_child() {
        let pty = sh("sleep 30");
        assert!(!pty.has_exited());
        assert!(pty.child_pid().is_some());
        pty.shutdown().unwrap();
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn window_size_changes_apply() {
        let pty = sh("sleep 2");
        pty.resize(50, 160).unwrap();
        pty.shutdown().unwrap();
    }
}
