use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Terminal line appended once an install attempt is over
pub const FINISH_MARKER: &str = "finish";

#[derive(Debug, Default)]
struct Lines {
    lines: VecDeque<String>,
    finished: bool,
}

/// Bounded log of installer output, oldest lines dropped first
#[derive(Debug)]
pub struct InstallLog {
    capacity: usize,
    inner: Mutex<Lines>,
}

impl InstallLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Lines::default()),
        }
    }

    fn lines(&self) -> MutexGuard<'_, Lines> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut inner = self.lines();
        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.into());
    }

    /// Append the finish marker; later calls are no-ops
    pub fn finish(&self) {
        let mut inner = self.lines();
        if inner.finished {
            return;
        }
        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(FINISH_MARKER.to_string());
        inner.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.lines().finished
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines().lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines().lines.is_empty()
    }

    pub fn reset(&self) {
        *self.lines() = Lines::default();
    }
}
