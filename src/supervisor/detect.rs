use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls the filesystem for the daemon's extension socket.
pub struct SocketDetector {
    path: PathBuf,
    cancel: CancellationToken,
    interval: Duration,
}

impl SocketDetector {
    pub fn new(path: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            path: path.into(),
            cancel,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true once the socket exists.
    ///
    /// `max_attempts == 0` only checks the current state. Otherwise the path is
    /// re-checked every interval until it appears, `max_attempts` checks have
    /// failed, or the owning instance is cancelled.
    pub async fn detect(&self, max_attempts: u32) -> bool {
        if self.exists() {
            return true;
        }

        if max_attempts == 0 {
            return false;
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        let mut attempts = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(socket = %self.path.display(), "Socket detection cancelled");
                    return false;
                }
                _ = ticker.tick() => {
                    attempts += 1;
                    if self.exists() {
                        trace!(socket = %self.path.display(), attempts, "Socket appeared");
                        return true;
                    }
                    if attempts >= max_attempts {
                        debug!(socket = %self.path.display(), attempts, "Socket did not appear");
                        return false;
                    }
                }
            }
        }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}
