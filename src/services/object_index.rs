//! src/services/object_index.rs
//!
//! ObjectIndex — in-memory metadata index for stored objects. Keeps a
//! name → record map and a sequence ordered by `last_modified_utc`
//! descending. Both live behind one mutex so they can never be observed
//! out of step with each other.

use crate::models::object::ObjectRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default, Debug)]
struct IndexState {
    /// Newest first.
    ordered: Vec<ObjectRecord>,
    by_name: HashMap<String, ObjectRecord>,
}

impl IndexState {
    /// Position of the first record not newer than `at`.
    ///
    /// Inserting there places a record ahead of older ones and behind any
    /// record that is strictly newer.
    fn insert_position(&self, at: DateTime<Utc>) -> usize {
        self.ordered.partition_point(|rec| rec.last_modified_utc > at)
    }

    /// Locate `name` in the ordered sequence using its known timestamp.
    fn position_of(&self, name: &str, at: DateTime<Utc>) -> Option<usize> {
        let start = self.insert_position(at);
        self.ordered[start..]
            .iter()
            .take_while(|rec| rec.last_modified_utc == at)
            .position(|rec| rec.name == name)
            .map(|offset| start + offset)
    }

    fn remove_ordered(&mut self, prev: &ObjectRecord) {
        if let Some(pos) = self.position_of(&prev.name, prev.last_modified_utc) {
            self.ordered.remove(pos);
        }
    }
}

/// What [`ObjectIndex::upsert`] did with a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// The indexed record is newer; nothing changed.
    Stale,
}

/// Thread-safe metadata index.
///
/// All structural operations hold the lock only for the duration of the
/// in-memory update; no I/O ever happens under it.
#[derive(Default, Debug)]
pub struct ObjectIndex {
    state: Mutex<IndexState>,
}

impl ObjectIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<ObjectRecord> {
        self.state.lock().by_name.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new record or update an existing one with the same name.
    ///
    /// An update re-positions the record so listing order always reflects
    /// the latest modification time. A record older than the indexed one is
    /// ignored, so `last_modified_utc` never moves backwards for a name.
    pub fn upsert(&self, record: ObjectRecord) -> Upsert {
        let mut state = self.state.lock();
        let outcome = match state.by_name.get(&record.name).cloned() {
            Some(prev) if prev.last_modified_utc > record.last_modified_utc => {
                return Upsert::Stale;
            }
            Some(prev) => {
                state.remove_ordered(&prev);
                Upsert::Updated
            }
            None => Upsert::Inserted,
        };
        let pos = state.insert_position(record.last_modified_utc);
        state.ordered.insert(pos, record.clone());
        state.by_name.insert(record.name.clone(), record);
        outcome
    }

    /// Remove `name` from both structures. Returns the removed record.
    pub fn remove(&self, name: &str) -> Option<ObjectRecord> {
        let mut state = self.state.lock();
        let prev = state.by_name.remove(name)?;
        state.remove_ordered(&prev);
        Some(prev)
    }

    /// Copy of the full ordered sequence, newest first.
    pub fn snapshot_ordered(&self) -> Vec<ObjectRecord> {
        self.state.lock().ordered.clone()
    }

    /// Contiguous window of the ordered sequence.
    ///
    /// Records newer than `until` are skipped from the top, the scan stops at
    /// the first record not newer than `since`, and at most `limit` records
    /// are returned.
    pub fn range(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<ObjectRecord> {
        let state = self.state.lock();
        state
            .ordered
            .iter()
            .skip_while(|rec| until.is_some_and(|until| rec.last_modified_utc > until))
            .take_while(|rec| since.is_none_or(|since| rec.last_modified_utc > since))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Atomically replace the whole index with the records from `source`.
    ///
    /// The source is drained before the lock is taken; the first enumeration
    /// error aborts the rebuild and the previous index stays in place.
    /// Duplicate names keep the last record seen.
    pub fn rebuild_all<I, E>(&self, source: I) -> Result<usize, E>
    where
        I: IntoIterator<Item = Result<ObjectRecord, E>>,
    {
        let mut by_name = HashMap::new();
        for record in source {
            let record = record?;
            by_name.insert(record.name.clone(), record);
        }

        let mut ordered: Vec<ObjectRecord> = by_name.values().cloned().collect();
        ordered.sort_by(|a, b| b.last_modified_utc.cmp(&a.last_modified_utc));
        let count = ordered.len();

        *self.state.lock() = IndexState { ordered, by_name };
        Ok(count)
    }
}
