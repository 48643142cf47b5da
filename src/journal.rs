//! Append-only replicated log.
//!
//! Entries are stored contiguously from index 0 with non-decreasing terms.
//! The journal owns a [`Processor`]: committing an entry applies it to the
//! processor, so the applied prefix always equals `[0..=commit_index]`.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::processor::Processor;

/// A single journal record.
///
/// The default value is the zero sentinel returned for out-of-range reads;
/// callers rely on `term == 0` when probing index -1 of an empty log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub term: i64,
    pub index: i64,
    pub data: Value,
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{{TERM:{}, DATA:{:?}}}",
            self.index,
            self.term,
            self.data.to_string()
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JournalError {
    #[error("entry index {index} is not the next index {expected}")]
    NonSequentialIndex { index: i64, expected: i64 },

    #[error("entry term {term} regresses from the last term {last}")]
    TermRegression { term: i64, last: i64 },
}

pub struct Journal {
    storage: Vec<Entry>,
    commit_index: i64,
    processor: Box<dyn Processor>,
}

impl Journal {
    pub fn new(processor: Box<dyn Processor>) -> Self {
        Self {
            storage: Vec::new(),
            commit_index: -1,
            processor,
        }
    }

    /// Append an entry. Entries must arrive strictly in index order and
    /// terms may never regress.
    pub fn put(&mut self, entry: Entry) -> Result<(), JournalError> {
        if entry.index != self.len() {
            return Err(JournalError::NonSequentialIndex {
                index: entry.index,
                expected: self.len(),
            });
        }
        if let Some(last) = self.storage.last() {
            if entry.term < last.term {
                return Err(JournalError::TermRegression {
                    term: entry.term,
                    last: last.term,
                });
            }
        }
        self.storage.push(entry);
        Ok(())
    }

    /// Apply the next entry to the processor and advance the commit index.
    ///
    /// The commit index only moves once the processor accepts the entry, so
    /// a failed apply leaves the journal unchanged and returns `false`.
    /// Returns `false` as well when there is nothing left to commit.
    pub fn commit(&mut self) -> bool {
        let next = self.commit_index + 1;
        if next >= self.len() {
            return false;
        }
        let data = self.storage[next as usize].data.clone();
        match self.processor.process(&data) {
            Ok(_) => {
                self.commit_index = next;
                true
            }
            Err(err) => {
                tracing::error!(index = next, %err, "journal commit failed");
                false
            }
        }
    }

    pub fn len(&self) -> i64 {
        self.storage.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn commit_index(&self) -> i64 {
        self.commit_index
    }

    /// Index of the most recent entry, -1 when empty.
    pub fn prev_index(&self) -> i64 {
        self.len() - 1
    }

    /// Term of the most recent entry, 0 when empty.
    pub fn prev_term(&self) -> i64 {
        self.get(self.prev_index()).term
    }

    /// Entry at `i`, or the zero sentinel when `i` is out of range.
    pub fn get(&self, i: i64) -> Entry {
        if i < 0 || i >= self.len() {
            return Entry::default();
        }
        self.storage[i as usize].clone()
    }

    pub fn last(&self) -> Entry {
        self.get(self.prev_index())
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.storage.iter()
    }

    pub fn processor(&self) -> &dyn Processor {
        self.processor.as_ref()
    }
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("len", &self.len())
            .field("commit_index", &self.commit_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::KvStore;
    use serde_json::json;

    fn record(key: &str, value: &str) -> Value {
        json!({"key": key, "value": value})
    }

    fn journal() -> Journal {
        Journal::new(Box::new(KvStore::new()))
    }

    #[test]
    fn test_new_journal_is_empty() {
        let j = journal();
        assert_eq!(j.len(), 0);
        assert_eq!(j.commit_index(), -1);
        assert_eq!(j.prev_index(), -1);
        assert_eq!(j.prev_term(), 0);
    }

    #[test]
    fn test_put_appends_sequentially() {
        let mut j = journal();
        j.put(Entry { term: 0, index: 0, data: record("a", "1") })
            .unwrap();
        j.put(Entry { term: 1, index: 1, data: record("b", "2") })
            .unwrap();

        assert_eq!(j.len(), 2);
        assert_eq!(j.get(1).term, 1);
    }

    #[test]
    fn test_put_rejects_non_sequential_index() {
        let mut j = journal();
        let err = j
            .put(Entry { term: 0, index: 1, data: record("a", "1") })
            .unwrap_err();
        assert_eq!(err, JournalError::NonSequentialIndex { index: 1, expected: 0 });

        let err = j
            .put(Entry { term: 0, index: -1, data: record("a", "1") })
            .unwrap_err();
        assert_eq!(err, JournalError::NonSequentialIndex { index: -1, expected: 0 });
    }

    #[test]
    fn test_put_rejects_term_regression() {
        let mut j = journal();
        j.put(Entry { term: 3, index: 0, data: record("a", "1") })
            .unwrap();

        let err = j
            .put(Entry { term: 2, index: 1, data: record("b", "2") })
            .unwrap_err();
        assert_eq!(err, JournalError::TermRegression { term: 2, last: 3 });
    }

    #[test]
    fn test_terms_are_non_decreasing() {
        let mut j = journal();
        for (i, term) in [0, 0, 1, 1, 4].into_iter().enumerate() {
            j.put(Entry { term, index: i as i64, data: record("k", "v") })
                .unwrap();
        }
        for i in 0..j.len() - 1 {
            assert!(j.get(i).term <= j.get(i + 1).term);
        }
    }

    #[test]
    fn test_commit_applies_to_processor() {
        let mut j = journal();
        j.put(Entry { term: 0, index: 0, data: record("a", "1") })
            .unwrap();

        assert!(j.commit());
        assert_eq!(j.commit_index(), 0);
        assert_eq!(j.processor().get("a"), Some(json!("1")));
    }

    #[test]
    fn test_commit_with_nothing_pending_returns_false() {
        let mut j = journal();
        assert!(!j.commit());
        assert_eq!(j.commit_index(), -1);

        j.put(Entry { term: 0, index: 0, data: record("a", "1") })
            .unwrap();
        assert!(j.commit());
        assert!(!j.commit());
        assert_eq!(j.commit_index(), 0);
    }

    #[test]
    fn test_failed_apply_does_not_advance_commit_index() {
        let mut j = journal();
        j.put(Entry { term: 0, index: 0, data: json!("garbage") })
            .unwrap();

        assert!(!j.commit());
        assert_eq!(j.commit_index(), -1);
    }

    #[test]
    fn test_get_out_of_range_returns_zero_entry() {
        let mut j = journal();
        j.put(Entry { term: 2, index: 0, data: record("a", "1") })
            .unwrap();

        assert_eq!(j.get(-1), Entry::default());
        assert_eq!(j.get(5), Entry::default());
        assert_eq!(j.get(-1).term, 0);
    }

    #[test]
    fn test_commit_index_stays_within_bounds() {
        let mut j = journal();
        for i in 0..3 {
            j.put(Entry { term: 0, index: i, data: record("k", "v") })
                .unwrap();
            j.commit();
            assert!(j.commit_index() + 1 <= j.len());
            assert!(j.commit_index() >= -1);
        }
    }

    #[test]
    fn test_entry_display_format() {
        let entry = Entry {
            term: 2,
            index: 4,
            data: record("a", "1"),
        };
        assert_eq!(
            entry.to_string(),
            r#"4:{TERM:2, DATA:"{\"key\":\"a\",\"value\":\"1\"}"}"#
        );
    }
}
