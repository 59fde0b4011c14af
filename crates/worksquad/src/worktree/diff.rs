//! Diff statistics for a worktree.

use records::DiffStatsRecord;

/// Line counts and text of a worktree's diff against its base commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Lines added.
    pub added: usize,
    /// Lines removed.
    pub removed: usize,
    /// Unified diff text.
    pub content: String,
}

impl DiffStats {
    /// Counts added and removed lines in unified diff output. File headers
    /// (`+++`/`---`) are not counted.
    pub fn from_diff(content: String) -> Self {
        let mut added = 0;
        let mut removed = 0;
        for line in content.lines() {
            if line.starts_with('+') && !line.starts_with("+++") {
                added += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                removed += 1;
            }
        }
        Self {
            added,
            removed,
            content,
        }
    }

    /// Whether the diff touched nothing.
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

impl From<DiffStats> for DiffStatsRecord {
    fn from(stats: DiffStats) -> Self {
        Self {
            added: stats.added,
            removed: stats.removed,
            content: stats.content,
        }
    }
}

impl From<DiffStatsRecord> for DiffStats {
    fn from(record: DiffStatsRecord) -> Self {
        Self {
            added: record.added,
            removed: record.removed,
            content: record.content,
        }
    }
}
