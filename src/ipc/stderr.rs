//! Background draining of the server's stderr.
//!
//! A child that logs heavily will block once its stderr pipe fills up, and a
//! blocked child stops answering on stdout. The drain task owns the stream
//! for the whole session and keeps the most recent lines for failure reports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Number of stderr lines included in failure reports.
pub const STDERR_REPORT_LINES: usize = 30;

/// Number of stderr lines retained in memory.
pub const STDERR_RETAINED_LINES: usize = 1_000;

/// Capped, append-only log of recent stderr lines.
///
/// Cloning yields another handle to the same buffer. Only the drain task
/// appends; everyone else reads snapshots.
#[derive(Debug, Clone)]
pub struct StderrBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, line: String) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy of the last `n` lines, oldest first.
    pub fn snapshot(&self, n: usize) -> Vec<String> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for StderrBuffer {
    fn default() -> Self {
        Self::new(STDERR_RETAINED_LINES)
    }
}

/// Handle to the task draining one stderr stream.
pub struct StderrDrain {
    buffer: StderrBuffer,
    task: Option<JoinHandle<()>>,
}

impl StderrDrain {
    /// Start draining `stream` into a buffer holding at most `capacity` lines.
    pub fn spawn<R>(stream: R, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = StderrBuffer::new(capacity);
        let sink = buffer.clone();

        let task = tokio::spawn(async move {
            drain_loop(stream, sink).await;
        });

        Self {
            buffer,
            task: Some(task),
        }
    }

    /// Read-only handle to the captured lines.
    pub fn buffer(&self) -> StderrBuffer {
        self.buffer.clone()
    }

    pub fn snapshot(&self, n: usize) -> Vec<String> {
        self.buffer.snapshot(n)
    }

    /// Whether the stream has reached end-of-file (or the task was stopped).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Give the drain up to `grace` to reach end-of-file, then stop it.
    ///
    /// Called after the child has exited so its last words make it into the
    /// buffer. Idempotent.
    pub async fn finish(&mut self, grace: Duration) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!("stderr drain still running after {:?}, stopping it", grace);
            task.abort();
        }
    }
}

impl Drop for StderrDrain {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Append every line of `stream` to `sink` until end-of-file.
///
/// Read errors end the loop quietly: diagnostics are best-effort.
async fn drain_loop<R>(stream: R, sink: StderrBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                trace!(target: "mcp_probe::server_stderr", "{}", line);
                sink.push(line);
            }
            Err(e) => {
                debug!("stderr drain stopped: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_buffer_caps_to_most_recent() {
        let buffer = StderrBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.snapshot(10), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.snapshot(1), vec!["line 4"]);
        assert!(buffer.snapshot(0).is_empty());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let buffer = StderrBuffer::new(10);
        buffer.push("a".to_string());
        let snap = buffer.snapshot(10);
        buffer.push("b".to_string());
        assert_eq!(snap, vec!["a"]);
        assert_eq!(buffer.snapshot(10), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_drain_collects_lines_until_eof() {
        let (mut writer, reader) = duplex(64);
        let mut drain = StderrDrain::spawn(reader, 100);

        writer.write_all(b"starting\r\nready\npartial").await.unwrap();
        drop(writer);

        drain.finish(Duration::from_secs(5)).await;
        assert!(drain.is_finished());
        assert_eq!(drain.snapshot(10), vec!["starting", "ready", "partial"]);
    }

    #[tokio::test]
    async fn test_drain_keeps_up_with_flood() {
        // Far more than the duplex buffer: the writer only completes if the
        // drain keeps consuming.
        let (mut writer, reader) = duplex(256);
        let mut drain = StderrDrain::spawn(reader, 20);

        let writer_task = tokio::spawn(async move {
            for i in 0..5_000 {
                let line = format!("noise {}\n", i);
                writer.write_all(line.as_bytes()).await.unwrap();
            }
        });

        tokio::time::timeout(Duration::from_secs(10), writer_task)
            .await
            .expect("writer blocked")
            .unwrap();
        drain.finish(Duration::from_secs(5)).await;

        let snap = drain.snapshot(STDERR_REPORT_LINES);
        assert_eq!(snap.len(), 20);
        assert_eq!(snap.last().map(String::as_str), Some("noise 4999"));
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let (_writer, reader) = duplex(64);
        let mut drain = StderrDrain::spawn(reader, 10);

        drain.finish(Duration::from_millis(20)).await;
        drain.finish(Duration::from_millis(20)).await;
        assert!(drain.is_finished());
    }
}
