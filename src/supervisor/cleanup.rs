//! Residual file removal after a daemon is killed.
//!
//! A force-killed osqueryd leaves its pid file, database lock files and logs
//! behind under its working prefix; on windows the next launch refuses to
//! start while they exist.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PID_FILE: &str = "osquery.pid";
pub const DATABASE_DIR: &str = "osquery.db";
pub const DATABASE_LOCK_FILES: [&str; 2] = ["LOCK", "CURRENT"];

pub trait ResidualCleaner: Send + Sync {
    /// Best-effort removal; returns how many files were deleted.
    fn clean(&self, instance: &str) -> usize;
}

/// For platforms where the daemon leaves nothing behind.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCleaner;

impl ResidualCleaner for NoopCleaner {
    fn clean(&self, _instance: &str) -> usize {
        0
    }
}

/// Removes the pid, lock and log files under a working prefix.
#[derive(Debug, Clone)]
pub struct PrefixCleaner {
    prefix: PathBuf,
}

impl PrefixCleaner {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn fixed_files(&self) -> Vec<PathBuf> {
        let db = self.prefix.join(DATABASE_DIR);
        let mut files = vec![self.prefix.join(PID_FILE)];
        files.extend(DATABASE_LOCK_FILES.iter().map(|f| db.join(f)));
        files
    }

    fn log_files(&self, instance: &str) -> Vec<PathBuf> {
        let escaped = glob::Pattern::escape(&self.prefix.to_string_lossy());
        let pattern = Path::new(&escaped).join("*.log");

        match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths
                .filter_map(|entry| match entry {
                    Ok(path) => Some(path),
                    Err(e) => {
                        warn!(instance = %instance, "Failed to read log entry: {}", e);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(instance = %instance, pattern = %pattern.display(), "Invalid log pattern: {}", e);
                Vec::new()
            }
        }
    }
}

impl ResidualCleaner for PrefixCleaner {
    fn clean(&self, instance: &str) -> usize {
        let mut removed = 0;
        let mut files = self.fixed_files();
        files.extend(self.log_files(instance));

        for file in files {
            match std::fs::remove_file(&file) {
                Ok(()) => {
                    debug!(instance = %instance, file = %file.display(), "Removed residual file");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(instance = %instance, file = %file.display(), "Failed to remove residual file: {}", e);
                }
            }
        }
        removed
    }
}

/// Cleaner for the current platform: only windows daemons leave residue.
pub fn default_cleaner(prefix: Option<&Path>) -> Arc<dyn ResidualCleaner> {
    match prefix {
        Some(prefix) if cfg!(windows) => Arc::new(PrefixCleaner::new(prefix)),
        _ => Arc::new(NoopCleaner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn removes_pid_lock_and_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path();
        touch(&prefix.join(PID_FILE));
        touch(&prefix.join(DATABASE_DIR).join("LOCK"));
        touch(&prefix.join(DATABASE_DIR).join("CURRENT"));
        touch(&prefix.join("osqueryd.INFO.log"));
        touch(&prefix.join("osqueryd.results.log"));
        touch(&prefix.join("osquery.conf"));
        touch(&prefix.join(DATABASE_DIR).join("000005.sst"));

        let removed = PrefixCleaner::new(prefix).clean("test");

        assert_eq!(removed, 5);
        assert!(!prefix.join(PID_FILE).exists());
        assert!(!prefix.join(DATABASE_DIR).join("LOCK").exists());
        assert!(!prefix.join("osqueryd.INFO.log").exists());
        assert!(prefix.join("osquery.conf").exists());
        assert!(prefix.join(DATABASE_DIR).join("000005.sst").exists());
    }

    #[test]
    fn missing_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PrefixCleaner::new(dir.path()).clean("test"), 0);
    }

    #[test]
    fn prefix_with_glob_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("osquery[1]");
        touch(&prefix.join("osqueryd.log"));
        touch(&dir.path().join("osquery1").join("other.log"));

        assert_eq!(PrefixCleaner::new(&prefix).clean("test"), 1);
        assert!(dir.path().join("osquery1").join("other.log").exists());
    }

    #[test]
    fn noop_without_prefix() {
        assert_eq!(default_cleaner(None).clean("test"), 0);
    }
}
