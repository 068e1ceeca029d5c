//! Ordering of asynchronous exports for cursor advancement.
//!
//! Exports may finish in any order. The cursor only moves to the end of the
//! highest export whose predecessors (in submission order) have all
//! completed, so it never skips a range that is still in flight or failed.

use std::collections::BTreeMap;

use crate::domain::BlockRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Done,
    Failed,
}

/// Submission-ordered bookkeeping of in-flight exports.
#[derive(Debug, Default)]
pub struct ExportSequence {
    next_seq: u64,
    entries: BTreeMap<u64, (BlockRange, State)>,
    cursor: Option<u64>,
}

impl ExportSequence {
    /// Register a new export; returns its sequence number.
    pub fn register(&mut self, range: BlockRange) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(seq, (range, State::Pending));
        seq
    }

    /// Mark an export done; returns the cursor if it advanced.
    pub fn complete(&mut self, seq: u64) -> Option<u64> {
        let (_, state) = self.entries.get_mut(&seq)?;
        *state = State::Done;

        let before = self.cursor;
        while let Some(entry) = self.entries.first_entry() {
            if entry.get().1 != State::Done {
                break;
            }
            let (range, _) = entry.remove();
            self.cursor = Some(self.cursor.map_or(range.end, |c| c.max(range.end)));
        }
        (self.cursor != before).then_some(self.cursor).flatten()
    }

    /// Mark an export failed; it blocks the cursor until [`reset`](Self::reset).
    pub fn fail(&mut self, seq: u64) {
        if let Some((_, state)) = self.entries.get_mut(&seq) {
            *state = State::Failed;
        }
    }

    /// Forget all in-flight bookkeeping; late completions are ignored.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Highest contiguously exported block.
    #[must_use]
    pub const fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Exports registered but not yet released from the sequence.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }
}
