//! The replicated log: a sequence of terms-stamped entries plus a commit
//! index, with the append/truncate rules that keep every node's log a
//! prefix-consistent view of the same history.
//!
//! Invariants maintained here:
//! - Indices are contiguous starting at 1; there is no entry at index 0.
//! - Entry terms are non-decreasing along the log.
//! - Once `commit_index` passes an index, the entry at that index is never
//!   rewritten by a later `append`.

use serde::{Deserialize, Serialize};

use crate::ids::{Index, Term};

/// A single committed-or-not log entry: the term it was accepted in, and the
/// opaque payload the caller asked to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub data: Vec<u8>,
}

/// A (term, index) pair identifying a specific point in a log. `LogCoords::EMPTY`
/// denotes "before the first entry" and compares less than every real entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogCoords {
    pub term: Term,
    pub index: Index,
}

impl LogCoords {
    pub const EMPTY: LogCoords = LogCoords { term: 0, index: 0 };

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// What changed in the log as a result of a successful `append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// Coordinates of the first entry actually appended this call, or
    /// `LogCoords::EMPTY` for a heartbeat (no entries).
    pub first: LogCoords,
    /// Coordinates of the last entry actually appended this call, or
    /// `LogCoords::EMPTY` for a heartbeat.
    pub last: LogCoords,
    /// Indices whose previous contents were discarded due to a term
    /// conflict with the incoming entries.
    pub replaced: Vec<Index>,
}

/// Why `append` refused to apply an `AppendEntries`-shaped request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAppendError {
    /// The request starts past the end of our log; we're missing entries
    /// in between and can't place these without a gap.
    Skip,
    /// We have an entry at `prevCoords.index`, but its term doesn't match --
    /// the logs have diverged before this point.
    MissingPrevious,
    /// The first incoming entry's term is older than our own tail, which
    /// would mean a leader from a stale term is trying to overwrite us.
    EarlierTerm,
}

impl std::fmt::Display for LogAppendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogAppendError::Skip => write!(f, "append would leave a gap in the log"),
            LogAppendError::MissingPrevious => {
                write!(f, "no matching entry at the given previous coordinates")
            }
            LogAppendError::EarlierTerm => {
                write!(f, "incoming entries are from an earlier term than our tail")
            }
        }
    }
}

impl std::error::Error for LogAppendError {}

#[derive(Debug, Default)]
pub struct Log {
    // entries[i] lives at index i + 1.
    entries: Vec<LogEntry>,
    commit_index: Index,
}

impl Log {
    pub fn new() -> Self {
        Log { entries: Vec::new(), commit_index: 0 }
    }

    /// Coordinates of the last entry in the log, or `LogCoords::EMPTY` if the
    /// log has never had anything appended.
    pub fn latest_appended(&self) -> LogCoords {
        match self.entries.last() {
            Some(e) => LogCoords { term: e.term, index: self.entries.len() as Index },
            None => LogCoords::EMPTY,
        }
    }

    pub fn latest_commit(&self) -> Index {
        self.commit_index
    }

    pub fn coords_for_index(&self, index: Index) -> Option<LogCoords> {
        self.term_for_index(index).map(|term| LogCoords { term, index })
    }

    pub fn term_for_index(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize).map(|e| e.term)
    }

    pub fn entry_at(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// True if `coords` names a point this log actually passed through
    /// (either the empty prefix, or a real entry with a matching term).
    pub fn contains(&self, coords: LogCoords) -> bool {
        coords.is_empty() || self.coords_for_index(coords.index) == Some(coords)
    }

    /// Up to `max` contiguous entries starting at `index` (1-based). Returns
    /// an empty vec if `index` is past the end of the log.
    pub fn entries_from(&self, index: Index, max: usize) -> Vec<LogEntry> {
        if index == 0 || (index as usize) > self.entries.len() {
            return Vec::new();
        }
        let start = (index - 1) as usize;
        let end = start.saturating_add(max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Apply an `AppendEntries`-shaped write: check that `prev` still
    /// matches our log, truncate any conflicting tail, and append.
    ///
    /// An empty `entries` is always accepted as a heartbeat and never
    /// mutates the log; whatever commit advancement it implies is bounded
    /// by how far we've actually appended (see `commit`), so skipping the
    /// `prev` check here cannot let us commit something we don't have.
    pub fn append(
        &mut self,
        prev: LogCoords,
        term: Term,
        entries: Vec<LogEntry>,
    ) -> Result<AppendResult, LogAppendError> {
        if entries.is_empty() {
            return Ok(AppendResult { first: LogCoords::EMPTY, last: LogCoords::EMPTY, replaced: Vec::new() });
        }

        let len = self.entries.len() as Index;
        if prev.index > 0 {
            if prev.index > len {
                return Err(LogAppendError::Skip);
            }
            let existing_term = self.entries[(prev.index - 1) as usize].term;
            if existing_term != prev.term {
                return Err(LogAppendError::MissingPrevious);
            }
        }

        let last_appended_term = self.latest_appended().term;
        if entries[0].term < last_appended_term {
            return Err(LogAppendError::EarlierTerm);
        }

        let target = prev.index + 1;
        let mut idx = target;
        let mut cursor = 0usize;
        let mut replaced = Vec::new();
        while cursor < entries.len() {
            let pos = (idx - 1) as usize;
            if pos >= self.entries.len() {
                break;
            }
            if self.entries[pos].term != entries[cursor].term {
                for r in idx..=self.entries.len() as Index {
                    replaced.push(r);
                }
                self.entries.truncate(pos);
                break;
            }
            idx += 1;
            cursor += 1;
        }
        for e in &entries[cursor..] {
            self.entries.push(e.clone());
        }

        let last_index = target + entries.len() as Index - 1;
        let first = LogCoords { term: entries[0].term, index: target };
        let last = LogCoords { term: entries.last().unwrap().term, index: last_index };
        let _ = term; // the leader's term is carried by each entry, not re-checked here
        Ok(AppendResult { first, last, replaced })
    }

    /// Advance the commit index to `upto`, clamped to what's actually in the
    /// log. Returns the coordinates newly committed, in order.
    pub fn commit(&mut self, upto: Index) -> Vec<LogCoords> {
        let clamped = upto.min(self.latest_appended().index);
        if clamped <= self.commit_index {
            return Vec::new();
        }
        let mut newly = Vec::with_capacity((clamped - self.commit_index) as usize);
        for idx in (self.commit_index + 1)..=clamped {
            let coords = self.coords_for_index(idx).expect("index within latest_appended must exist");
            newly.push(coords);
        }
        self.commit_index = clamped;
        newly
    }
}
