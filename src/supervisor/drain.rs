use super::log_buffer::LogBuffer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Bytes read from the diagnostic pipe per iteration.
pub const DRAIN_CHUNK: usize = 4096;

/// Pause after end-of-stream before reading again.
pub const EOF_BACKOFF: Duration = Duration::from_secs(60);

/// Forwards a daemon's diagnostic output to tracing and its [`LogBuffer`].
pub struct Drain {
    name: String,
    buffer: Arc<LogBuffer>,
    cancel: CancellationToken,
    eof_backoff: Duration,
}

impl Drain {
    pub fn new(name: impl Into<String>, buffer: Arc<LogBuffer>, cancel: CancellationToken) -> Self {
        Self {
            name: name.into(),
            buffer,
            cancel,
            eof_backoff: EOF_BACKOFF,
        }
    }

    pub fn with_eof_backoff(mut self, backoff: Duration) -> Self {
        self.eof_backoff = backoff;
        self
    }

    /// Runs until cancelled or the stream fails.
    pub async fn run<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; DRAIN_CHUNK];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        self.flush(&mut pending);
                        trace!(instance = %self.name, "Diagnostic stream at EOF, backing off");
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.eof_backoff) => {}
                        }
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&chunk[..n]);
                        self.emit_lines(&mut pending);
                    }
                    Err(e) => {
                        error!(instance = %self.name, "Diagnostic stream read failed: {}", e);
                        break;
                    }
                }
            }
        }

        self.flush(&mut pending);
        debug!(instance = %self.name, "Diagnostic drain stopped");
    }

    fn emit_lines(&self, pending: &mut Vec<u8>) {
        while let Some(idx) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line[..idx]);
            self.emit(line.trim_end_matches('\r').to_string());
        }

        // A daemon that never prints a newline must not grow the buffer unbounded.
        if pending.len() > DRAIN_CHUNK {
            let keep = incomplete_utf8_tail(pending);
            let tail = pending.split_off(pending.len() - keep);
            let head = std::mem::replace(pending, tail);
            self.emit(String::from_utf8_lossy(&head).into_owned());
        }
    }

    fn flush(&self, pending: &mut Vec<u8>) {
        if !pending.is_empty() {
            let bytes = std::mem::take(pending);
            self.emit(String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    fn emit(&self, line: String) {
        debug!(instance = %self.name, "{}", line);
        self.buffer.push(line);
    }
}

/// Number of trailing bytes that start a UTF-8 sequence still missing bytes.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
