//! Bounded output buffer shared between the supervisor and readers.

use std::collections::VecDeque;
use std::sync::RwLock;

/// Lines kept before the oldest are dropped.
pub const MAX_OUTPUT_LINES: usize = 100;

/// Append-only ring of the most recent output lines.
///
/// Writers append from the control loop; readers (the preview pane, the CLI)
/// snapshot it concurrently.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: RwLock<VecDeque<String>>,
    capacity: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// Creates a buffer holding [`MAX_OUTPUT_LINES`] lines.
    pub fn new() -> Self {
        Self::with_capacity(MAX_OUTPUT_LINES)
    }

    /// Creates a buffer holding at most `capacity` lines.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends one line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.write().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Appends each line of `text`.
    pub fn push_text(&self, text: &str) {
        for line in text.lines() {
            self.push(line);
        }
    }

    /// Number of lines currently held.
    pub fn len(&self) -> usize {
        self.lines.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// All lines joined with newlines.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.read().unwrap_or_else(|e| e.into_inner());
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}
