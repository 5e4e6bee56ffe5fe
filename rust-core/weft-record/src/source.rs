// SPDX-License-Identifier: PMPL-1.0-or-later
//! Record sources: the per-partition record arena.

use std::collections::hash_map::{self, HashMap};
use std::sync::Arc;

use crate::ids::DataId;
use crate::record::Record;

/// Known state of one identifier inside a source.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
    Existent(Arc<Record>),
    /// The record is known to have been deleted.
    Nonexistent,
}

/// Status of an identifier, including the "never seen" case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Existent,
    Nonexistent,
    Unknown,
}

/// Map of identifiers to record states for a single partition.
///
/// Cloning is shallow: records are shared until one side writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSource {
    records: HashMap<DataId, RecordState>,
}

impl RecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has(&self, id: &DataId) -> bool {
        self.records.contains_key(id)
    }

    pub fn status(&self, id: &DataId) -> RecordStatus {
        match self.records.get(id) {
            Some(RecordState::Existent(_)) => RecordStatus::Existent,
            Some(RecordState::Nonexistent) => RecordStatus::Nonexistent,
            None => RecordStatus::Unknown,
        }
    }

    pub fn state(&self, id: &DataId) -> Option<&RecordState> {
        self.records.get(id)
    }

    /// The record for `id`, if it exists.
    pub fn get(&self, id: &DataId) -> Option<&Arc<Record>> {
        match self.records.get(id) {
            Some(RecordState::Existent(record)) => Some(record),
            _ => None,
        }
    }

    /// Mutable access that clones the record first if it is shared.
    pub fn get_mut(&mut self, id: &DataId) -> Option<&mut Record> {
        match self.records.get_mut(id) {
            Some(RecordState::Existent(record)) => Some(Arc::make_mut(record)),
            _ => None,
        }
    }

    pub fn set(&mut self, record: Record) {
        self.records
            .insert(record.id().clone(), RecordState::Existent(Arc::new(record)));
    }

    pub fn set_arc(&mut self, record: Arc<Record>) {
        self.records
            .insert(record.id().clone(), RecordState::Existent(record));
    }

    pub fn set_state(&mut self, id: DataId, state: RecordState) {
        self.records.insert(id, state);
    }

    /// Mark `id` as deleted.
    pub fn delete(&mut self, id: &DataId) {
        self.records.insert(id.clone(), RecordState::Nonexistent);
    }

    /// Forget `id` entirely, returning it to the unknown state.
    pub fn remove(&mut self, id: &DataId) -> Option<RecordState> {
        self.records.remove(id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn ids(&self) -> impl Iterator<Item = &DataId> {
        self.records.keys()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, DataId, RecordState> {
        self.records.iter()
    }

    /// Publish `other` into this source.
    ///
    /// Existing records are merged field by field; deletions in `other` win.
    pub fn merge_from(&mut self, other: &RecordSource) {
        for (id, incoming) in other.iter() {
            match incoming {
                RecordState::Existent(next) => {
                    let merged = match self.records.get(id) {
                        Some(RecordState::Existent(prev)) => Record::update(prev, next),
                        _ => Arc::clone(next),
                    };
                    self.records.insert(id.clone(), RecordState::Existent(merged));
                }
                RecordState::Nonexistent => {
                    self.records.insert(id.clone(), RecordState::Nonexistent);
                }
            }
        }
    }
}

impl FromIterator<Record> for RecordSource {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut source = RecordSource::new();
        for record in iter {
            source.set(record);
        }
        source
    }
}
