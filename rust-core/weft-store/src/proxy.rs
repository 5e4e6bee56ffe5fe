// SPDX-License-Identifier: PMPL-1.0-or-later
//! Copy-on-write view over a record source.
//!
//! Reads fall through from the sink (changes staged so far) to the base
//! (the store's current records). Writes always land in the sink: the first
//! write to a base record copies it, so the base is never mutated.

use serde_json::Value;
use std::sync::Arc;

use weft_record::{DataId, FieldValue, Record, RecordError, RecordSource, RecordState, RecordStatus};

/// Imperative change applied to the store through a proxy.
pub type StoreUpdater = Arc<dyn Fn(&mut RecordSourceProxy<'_>) -> Result<(), RecordError> + Send + Sync>;

/// Box a closure as a `StoreUpdater`.
pub fn store_updater<F>(updater: F) -> StoreUpdater
where
    F: Fn(&mut RecordSourceProxy<'_>) -> Result<(), RecordError> + Send + Sync + 'static,
{
    Arc::new(updater)
}

pub struct RecordSourceProxy<'a> {
    base: &'a RecordSource,
    sink: &'a mut RecordSource,
}

impl<'a> RecordSourceProxy<'a> {
    pub fn new(base: &'a RecordSource, sink: &'a mut RecordSource) -> Self {
        Self { base, sink }
    }

    pub fn status(&self, id: &DataId) -> RecordStatus {
        match self.sink.status(id) {
            RecordStatus::Unknown => self.base.status(id),
            status => status,
        }
    }

    pub fn get(&self, id: &DataId) -> Option<&Arc<Record>> {
        match self.sink.state(id) {
            Some(RecordState::Existent(record)) => Some(record),
            Some(RecordState::Nonexistent) => None,
            None => self.base.get(id),
        }
    }

    fn writable(&mut self, id: &DataId) -> Result<&mut Record, RecordError> {
        if !matches!(self.sink.state(id), Some(RecordState::Existent(_))) {
            let record = match self.sink.state(id) {
                Some(RecordState::Nonexistent) => None,
                _ => self.base.get(id).cloned(),
            };
            match record {
                Some(record) => self.sink.set_arc(record),
                None => return Err(RecordError::MissingRecord(id.to_string())),
            }
        }
        self.sink
            .get_mut(id)
            .ok_or_else(|| RecordError::MissingRecord(id.to_string()))
    }

    pub fn create(&mut self, id: DataId, typename: impl Into<String>) -> Result<(), RecordError> {
        if self.status(&id) == RecordStatus::Existent {
            return Err(RecordError::DuplicateRecord(id.to_string()));
        }
        self.sink.set(Record::new(id, typename));
        Ok(())
    }

    /// Create `id` unless it already exists.
    pub fn get_or_create(&mut self, id: DataId, typename: &str) {
        if self.status(&id) != RecordStatus::Existent {
            self.sink.set(Record::new(id, typename));
        }
    }

    pub fn delete(&mut self, id: &DataId) {
        self.sink.delete(id);
    }

    pub fn get_field(&self, id: &DataId, storage_key: &str) -> Option<FieldValue> {
        self.get(id).and_then(|record| record.get(storage_key).cloned())
    }

    pub fn get_value(&self, id: &DataId, storage_key: &str) -> Option<Value> {
        self.get(id).and_then(|record| record.get_value(storage_key).cloned())
    }

    pub fn get_linked_id(&self, id: &DataId, storage_key: &str) -> Option<DataId> {
        self.get(id).and_then(|record| record.get_linked_id(storage_key).cloned())
    }

    pub fn get_linked_ids(&self, id: &DataId, storage_key: &str) -> Option<Vec<Option<DataId>>> {
        self.get(id)
            .and_then(|record| record.get_linked_ids(storage_key).map(<[_]>::to_vec))
    }

    pub fn set_field(&mut self, id: &DataId, storage_key: &str, value: FieldValue) -> Result<(), RecordError> {
        self.writable(id)?.set(storage_key, value);
        Ok(())
    }

    pub fn set_value(&mut self, id: &DataId, storage_key: &str, value: Value) -> Result<(), RecordError> {
        self.set_field(id, storage_key, FieldValue::Scalar(value))
    }

    pub fn set_linked_id(&mut self, id: &DataId, storage_key: &str, linked: DataId) -> Result<(), RecordError> {
        self.set_field(id, storage_key, FieldValue::Link(linked))
    }

    pub fn set_linked_ids(
        &mut self,
        id: &DataId,
        storage_key: &str,
        linked: Vec<Option<DataId>>,
    ) -> Result<(), RecordError> {
        self.set_field(id, storage_key, FieldValue::Links(linked))
    }

    /// Copy every field of `from` onto `to`.
    pub fn copy_fields(&mut self, from: &DataId, to: &DataId) -> Result<(), RecordError> {
        let source = self
            .get(from)
            .cloned()
            .ok_or_else(|| RecordError::MissingRecord(from.to_string()))?;
        self.writable(to)?.copy_fields_from(&source);
        Ok(())
    }

    /// Write every record of `source` through this proxy.
    pub fn publish_source(&mut self, source: &RecordSource) {
        for (id, state) in source.iter() {
            match state {
                RecordState::Existent(record) => match self.sink.get(id).cloned() {
                    Some(staged) => self.sink.set_arc(Record::update(&staged, record)),
                    None => match self.base.get(id) {
                        Some(prev) => self.sink.set_arc(Record::update(prev, record)),
                        None => self.sink.set_arc(Arc::clone(record)),
                    },
                },
                RecordState::Nonexistent => self.sink.delete(id),
            }
        }
    }
}
