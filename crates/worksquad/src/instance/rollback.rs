//! Undo stack for multi-resource acquisition.

/// A resource acquisition that can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoStep {
    /// Close the terminal session that was started.
    CloseSession,
    /// Remove the worktree that was set up.
    CleanupWorktree,
}

/// Steps recorded during a start, unwound newest-first on failure.
#[derive(Debug, Default)]
pub struct Rollback {
    steps: Vec<UndoStep>,
}

impl Rollback {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful acquisition.
    pub fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    /// Whether nothing has been acquired.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Consumes the stack, yielding steps in reverse acquisition order.
    pub fn unwind(self) -> impl Iterator<Item = UndoStep> {
        self.steps.into_iter().rev()
    }
}
