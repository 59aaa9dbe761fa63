//! Child process transport.
//!
//! Owns the server process and its three pipes. stdin is written directly by
//! the caller; stdout is read by a dedicated task that forwards complete lines
//! over a channel, so a read can be raced against a deadline without ever
//! cancelling a half-finished read; stderr goes to a [`StderrDrain`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::IpcError;
use super::framing;
use super::stderr::{StderrBuffer, StderrDrain};

/// Bound on lines queued between the stdout task and the caller.
const CHANNEL_BOUND: usize = 64;

/// How long `close` waits for stderr to hit end-of-file after the child exits.
const STDERR_FLUSH_GRACE: Duration = Duration::from_millis(250);

/// What the stdout task delivers.
#[derive(Debug)]
enum StdoutEvent {
    Line(String),
    Closed(String),
}

/// A spawned server and its captured standard streams.
pub struct ProcessTransport {
    program: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<StdoutEvent>,
    stdout_task: Option<JoinHandle<()>>,
    stderr: StderrDrain,
    /// Set once stdout has signalled end-of-file; every later read fails fast.
    peer_closed: Option<String>,
    closed: bool,
}

impl ProcessTransport {
    /// Spawn `program` with all three standard streams piped.
    ///
    /// `env` is added to the inherited environment.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Launch` if the path does not name an executable
    /// file or the process cannot be started.
    pub fn spawn(
        program: &Path,
        env: &[(String, String)],
        stderr_capacity: usize,
    ) -> Result<Self, IpcError> {
        check_executable(program)?;

        let mut child = Command::new(program)
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_error(program, e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(program, "failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(program, "failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| launch_error(program, "failed to capture stderr".into()))?;

        let (tx, lines) = mpsc::channel(CHANNEL_BOUND);
        let stdout_task = tokio::spawn(stdout_loop(stdout, tx));
        let stderr = StderrDrain::spawn(stderr, stderr_capacity);

        info!(
            pid = child.id().unwrap_or_default(),
            "Spawned server {}",
            program.display()
        );

        Ok(Self {
            program: program.to_path_buf(),
            child,
            stdin: Some(stdin),
            lines,
            stdout_task: Some(stdout_task),
            stderr,
            peer_closed: None,
            closed: false,
        })
    }

    /// OS process id, while the child is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Shared view of the captured stderr lines.
    pub fn stderr(&self) -> StderrBuffer {
        self.stderr.buffer()
    }

    /// Write one line to the child's stdin and flush it.
    pub async fn write_line(&mut self, line: &str) -> Result<(), IpcError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| IpcError::Protocol("Transport is closed".to_string()))?;

        debug!("-> {}", line);
        framing::write_line(stdin, line).await.map_err(|e| {
            IpcError::Io(
                e.downcast::<std::io::Error>()
                    .unwrap_or_else(|e| std::io::Error::other(format!("{:#}", e))),
            )
        })
    }

    /// Next complete line from stdout, waiting no later than `deadline`.
    ///
    /// # Errors
    ///
    /// - `IpcError::Timeout` if no line arrives before the deadline. A line
    ///   that arrives afterwards stays queued for the next read.
    /// - `IpcError::PeerClosed` if stdout reached end-of-file.
    pub async fn read_line(&mut self, deadline: Instant) -> Result<String, IpcError> {
        if let Some(reason) = &self.peer_closed {
            return Err(IpcError::PeerClosed(reason.clone()));
        }

        let waited_from = Instant::now();
        match tokio::time::timeout_at(deadline, self.lines.recv()).await {
            Ok(Some(StdoutEvent::Line(line))) => Ok(line),
            Ok(Some(StdoutEvent::Closed(reason))) => {
                self.peer_closed = Some(reason.clone());
                Err(IpcError::PeerClosed(reason))
            }
            Ok(None) => {
                let reason = "stdout reader stopped".to_string();
                self.peer_closed = Some(reason.clone());
                Err(IpcError::PeerClosed(reason))
            }
            Err(_) => Err(IpcError::Timeout(deadline.saturating_duration_since(waited_from))),
        }
    }

    /// Close stdin, wait up to `grace` for the child to exit, then kill it.
    ///
    /// Safe to call more than once and after any failure.
    pub async fn close(&mut self, grace: Duration) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Dropping stdin signals end of input to the child.
        self.stdin.take();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Server exited with {}", status);
            }
            Ok(Err(e)) => {
                warn!("Error waiting for server: {}", e);
                let _ = self.child.kill().await;
            }
            Err(_) => {
                warn!(
                    "Server didn't exit within {:?} after stdin closed, killing",
                    grace
                );
                let _ = self.child.kill().await;
            }
        }

        self.stderr.finish(STDERR_FLUSH_GRACE).await;
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }

        info!("Closed transport to {}", self.program.display());
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if !self.closed {
            // kill_on_drop covers the wait; start the kill now so the child
            // does not outlive a panicking caller.
            let _ = self.child.start_kill();
        }
    }
}

/// Forward stdout lines until end-of-file or a read error.
async fn stdout_loop(stdout: ChildStdout, tx: mpsc::Sender<StdoutEvent>) {
    let mut reader = BufReader::new(stdout);

    loop {
        let event = match framing::read_line(&mut reader).await {
            Ok(Some(line)) => {
                debug!("<- {}", line);
                StdoutEvent::Line(line)
            }
            Ok(None) => StdoutEvent::Closed("server closed stdout (process may have exited)".into()),
            Err(e) => StdoutEvent::Closed(format!("failed to read server stdout: {:#}", e)),
        };

        let last = matches!(event, StdoutEvent::Closed(_));
        if tx.send(event).await.is_err() || last {
            return;
        }
    }
}

fn launch_error(program: &Path, reason: String) -> IpcError {
    IpcError::Launch {
        path: program.to_path_buf(),
        reason,
    }
}

/// Fail early with a clear message instead of a raw spawn error.
fn check_executable(program: &Path) -> Result<(), IpcError> {
    let metadata = std::fs::metadata(program)
        .map_err(|e| launch_error(program, format!("server binary not found: {}", e)))?;

    if !metadata.is_file() {
        return Err(launch_error(program, "not a regular file".into()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(launch_error(program, "file is not executable".into()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_executable_missing() {
        let err = check_executable(Path::new("/definitely/not/here/server")).unwrap_err();
        assert!(matches!(err, IpcError::Launch { .. }));
        assert!(err.to_string().contains("not found"), "{}", err);
    }

    #[test]
    fn test_check_executable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_executable(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not a regular file"), "{}", err);
    }

    #[cfg(unix)]
    #[test]
    fn test_check_executable_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = check_executable(&path).unwrap_err();
        assert!(err.to_string().contains("not executable"), "{}", err);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(check_executable(&path).is_ok());
    }

    #[tokio::test]
    async fn test_stdout_loop_reports_close_after_lines() {
        use tokio::io::AsyncWriteExt;

        // Exercise the loop through a real pipe: `cat` echoes stdin to stdout.
        let mut child = match Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(_) => return,
        };
        let mut stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(stdout_loop(stdout, tx));

        stdin.write_all(b"one\n\ntwo\n").await.unwrap();
        drop(stdin);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        task.await.unwrap();
        let _ = child.wait().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StdoutEvent::Line(l) if l == "one"));
        assert!(matches!(&events[1], StdoutEvent::Line(l) if l == "two"));
        assert!(matches!(&events[2], StdoutEvent::Closed(_)));
    }
}
