//! In-memory view of the replicated log.
//!
//! Entries before `snapshot_index` have been compacted into the latest snapshot. The
//! snapshot's last included entry still answers `term_at`, which is what lets the
//! consistency check run against a freshly compacted log.

use crate::storage::StorageError;
use crate::types::{LogEntry, LogIndex, Term};

#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from what the stores returned at startup. Entries covered by the snapshot
    /// are dropped; the remainder must be contiguous and start right after it.
    pub fn restore(
        snapshot_index: LogIndex,
        snapshot_term: Term,
        entries: Vec<LogEntry>,
    ) -> Result<Self, StorageError> {
        let entries: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();

        let mut expected = snapshot_index.next();
        for entry in &entries {
            if entry.index != expected {
                return Err(StorageError::Inconsistent(format!(
                    "log gap: expected {expected}, found {}",
                    entry.index
                )));
            }
            expected = expected.next();
        }

        Ok(Self {
            entries,
            snapshot_index,
            snapshot_term,
        })
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index.next()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot_index, |entry| entry.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map_or(self.snapshot_term, |entry| entry.term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn offset(&self, index: LogIndex) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = index.distance_from(self.snapshot_index) - 1;
        usize::try_from(offset).ok()
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.offset(index).and_then(|o| self.entries.get(o))
    }

    /// Term of the entry at `index`. Index 0 has term 0; compacted indices other than the
    /// snapshot's own last entry are unknown.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|entry| entry.term)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        match self.offset(start) {
            Some(o) if o < self.entries.len() => {
                let end = o.saturating_add(max).min(self.entries.len());
                self.entries[o..end].to_vec()
            }
            _ => Vec::new(),
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index().next());
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Drop `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        match self.offset(index) {
            Some(o) => self.entries.truncate(o),
            None => self.entries.clear(),
        }
    }

    /// Fold everything up to `index` into a snapshot ending at (`index`, `term`).
    /// Entries after `index` are kept.
    pub fn compact_through(&mut self, index: LogIndex, term: Term) {
        if index <= self.snapshot_index {
            return;
        }
        match self.offset(index) {
            Some(o) if o < self.entries.len() => {
                self.entries.drain(..=o);
            }
            _ => self.entries.clear(),
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// §5.4.1: a log is more up-to-date if its last term is higher, or the terms match
    /// and it is at least as long.
    pub fn is_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        (last_log_term, last_log_index) >= (self.last_term(), self.last_index())
    }

    /// First retained index holding `term`.
    pub fn first_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .find(|entry| entry.term == term)
            .map(|entry| entry.index)
    }

    /// Last retained index holding `term`.
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.term == term)
            .map(|entry| entry.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(LogIndex::from(index), Term::from(term), vec![index as u8])
    }

    fn log_of(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, &t) in terms.iter().enumerate() {
            log.push(entry(i as u64 + 1, t));
        }
        log
    }

    #[test]
    fn empty_log_has_zero_base() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), LogIndex::ZERO);
        assert_eq!(log.last_term(), Term::ZERO);
        assert_eq!(log.term_at(LogIndex::ZERO), Some(Term::ZERO));
        assert_eq!(log.term_at(LogIndex::from(1)), None);
    }

    #[test]
    fn entries_from_respects_max() {
        let log = log_of(&[1, 1, 2, 2, 3]);
        let batch = log.entries_from(LogIndex::from(2), 2);
        assert_eq!(batch, vec![entry(2, 1), entry(3, 2)]);
        assert!(log.entries_from(LogIndex::from(6), 10).is_empty());
    }

    #[test]
    fn truncate_from_drops_suffix() {
        let mut log = log_of(&[1, 1, 2]);
        log.truncate_from(LogIndex::from(2));
        assert_eq!(log.last_index(), LogIndex::from(1));
    }

    #[test]
    fn compaction_keeps_suffix_and_answers_boundary_term() {
        let mut log = log_of(&[1, 1, 2, 2, 3]);
        log.compact_through(LogIndex::from(3), Term::from(2));

        assert_eq!(log.first_index(), LogIndex::from(4));
        assert_eq!(log.term_at(LogIndex::from(3)), Some(Term::from(2)));
        assert_eq!(log.term_at(LogIndex::from(2)), None);
        assert_eq!(log.get(LogIndex::from(4)), Some(&entry(4, 2)));
        assert_eq!(log.last_index(), LogIndex::from(5));
    }

    #[test]
    fn compaction_past_the_end_clears_log() {
        let mut log = log_of(&[1, 1]);
        log.compact_through(LogIndex::from(100), Term::from(4));
        assert!(log.is_empty());
        assert_eq!(log.last_index(), LogIndex::from(100));
        assert_eq!(log.last_term(), Term::from(4));
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_of(&[1, 2, 2]);
        assert!(log.is_up_to_date(Term::from(3), LogIndex::from(1)));
        assert!(log.is_up_to_date(Term::from(2), LogIndex::from(3)));
        assert!(!log.is_up_to_date(Term::from(2), LogIndex::from(2)));
        assert!(!log.is_up_to_date(Term::from(1), LogIndex::from(9)));
    }

    #[test]
    fn restore_rejects_gaps() {
        let err = RaftLog::restore(LogIndex::ZERO, Term::ZERO, vec![entry(1, 1), entry(3, 1)])
            .unwrap_err();
        assert!(matches!(err, StorageError::Inconsistent(_)));
    }

    #[test]
    fn restore_skips_entries_inside_snapshot() {
        let log = RaftLog::restore(
            LogIndex::from(2),
            Term::from(1),
            vec![entry(1, 1), entry(2, 1), entry(3, 2)],
        )
        .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.first_index(), LogIndex::from(3));
    }

    #[test]
    fn term_lookup_helpers() {
        let log = log_of(&[1, 2, 2, 2, 3]);
        assert_eq!(log.first_index_of_term(Term::from(2)), Some(LogIndex::from(2)));
        assert_eq!(log.last_index_of_term(Term::from(2)), Some(LogIndex::from(4)));
        assert_eq!(log.last_index_of_term(Term::from(7)), None);
    }
}
