//! Newline framing for JSON-RPC over child process pipes.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","method":"tools/list","id":2}\n
//! ```
//!
//! One UTF-8 JSON object per line. Lines that are empty or whitespace-only
//! carry no message and are skipped. Bytes left over at end-of-file without a
//! terminating newline are not a complete message and are dropped.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Read the next non-blank line.
///
/// Returns `Ok(None)` once the stream reaches end-of-file without another
/// complete line. Invalid UTF-8 is replaced rather than rejected; the JSON
/// decoder reports anything that matters.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut buf)
            .await
            .context("Failed to read line")?;

        if bytes_read == 0 {
            return Ok(None);
        }

        if buf.last() != Some(&b'\n') {
            warn!(
                "Dropping {} trailing bytes without newline at end of stream",
                buf.len()
            );
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

/// Write one message followed by a newline and flush immediately.
///
/// The peer reads by line, so nothing may stay buffered between calls.
pub async fn write_line<W>(writer: &mut W, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(body.as_bytes())
        .await
        .context("Failed to write message body")?;
    writer
        .write_all(b"\n")
        .await
        .context("Failed to write message terminator")?;
    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}
