use crate::sample::{Sample, SampleKey};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    New,
    /// At or before the cursor: already sunk in an earlier page or cycle.
    Behind,
    /// Same identity as a sample already admitted since the last advance.
    Repeat,
}

/// Drops samples the sink has already seen. The cursor is the newest sunk
/// timestamp; `seen` covers the samples admitted since the cursor last moved.
#[derive(Debug)]
pub struct BoundaryFilter {
    cursor: DateTime<Utc>,
    include_cursor: bool,
    seen: HashSet<SampleKey>,
}

impl BoundaryFilter {
    /// A filter resuming after a stored checkpoint; the checkpoint's own
    /// timestamp was already sunk.
    pub fn after(checkpoint: DateTime<Utc>) -> Self {
        Self {
            cursor: checkpoint,
            include_cursor: false,
            seen: HashSet::new(),
        }
    }

    /// A filter for a sensor with no checkpoint yet: samples at exactly
    /// `start` are still wanted.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            cursor: start,
            include_cursor: true,
            seen: HashSet::new(),
        }
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// Whether a sample exactly at the cursor would still be admitted.
    pub fn includes_cursor(&self) -> bool {
        self.include_cursor
    }

    pub fn admit(&mut self, sample: &Sample) -> Verdict {
        let behind = if self.include_cursor {
            sample.timestamp < self.cursor
        } else {
            sample.timestamp <= self.cursor
        };
        if behind {
            return Verdict::Behind;
        }
        if !self.seen.insert(sample.key()) {
            return Verdict::Repeat;
        }
        Verdict::New
    }

    /// Moves the cursor after a page is sunk and checkpointed. Everything
    /// in `seen` is now at or behind the cursor, so it is dropped.
    pub fn advance(&mut self, checkpoint: DateTime<Utc>) {
        if checkpoint >= self.cursor {
            self.cursor = checkpoint;
            self.include_cursor = false;
            self.seen.clear();
        }
    }
}
