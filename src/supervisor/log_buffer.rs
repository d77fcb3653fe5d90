use std::collections::VecDeque;
use std::sync::RwLock;

pub const DEFAULT_MAX_LINES: usize = 1_000;

/// Ring buffer of the most recent diagnostic lines printed by a daemon.
pub struct LogBuffer {
    max_lines: usize,
    lines: RwLock<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: RwLock::new(VecDeque::new()),
        }
    }

    /// Append a line, evicting the oldest if over capacity.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.write().expect("LogBuffer lock poisoned");
        lines.push_back(line);
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    /// Return the last `n` lines (or all if `n` exceeds stored count).
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.read().expect("LogBuffer lock poisoned");
        let start = lines.len().saturating_sub(n);
        lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.read().expect("LogBuffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lines.write().expect("LogBuffer lock poisoned").clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
