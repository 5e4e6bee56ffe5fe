// SPDX-License-Identifier: PMPL-1.0-or-later
//! Normalized records.
//!
//! A `Record` is one flat object: scalar fields hold JSON values, linked
//! fields hold identifiers of other records in the same partition. Records
//! are shared behind `Arc` and mutated copy-on-write, so a reader holding an
//! older `Arc<Record>` never observes a later write.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ids::{DataId, PartitionId};

/// Value stored under one storage key of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Plain JSON value (including `null`).
    Scalar(Value),
    /// Reference to a single record.
    Link(DataId),
    /// Ordered references; `None` marks a null list entry.
    Links(Vec<Option<DataId>>),
    /// Reference to a record that lives in another partition.
    PartitionLink { partition: PartitionId, id: DataId },
}

/// A single normalized object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: DataId,
    typename: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: DataId, typename: impl Into<String>) -> Self {
        Self {
            id,
            typename: typename.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &DataId {
        &self.id
    }

    pub fn typename(&self) -> &str {
        &self.typename
    }

    pub fn get(&self, storage_key: &str) -> Option<&FieldValue> {
        self.fields.get(storage_key)
    }

    pub fn has_field(&self, storage_key: &str) -> bool {
        self.fields.contains_key(storage_key)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Scalar value under `storage_key`, if the field is a scalar.
    pub fn get_value(&self, storage_key: &str) -> Option<&Value> {
        match self.fields.get(storage_key) {
            Some(FieldValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_linked_id(&self, storage_key: &str) -> Option<&DataId> {
        match self.fields.get(storage_key) {
            Some(FieldValue::Link(id)) => Some(id),
            _ => None,
        }
    }

    pub fn get_linked_ids(&self, storage_key: &str) -> Option<&[Option<DataId>]> {
        match self.fields.get(storage_key) {
            Some(FieldValue::Links(ids)) => Some(ids),
            _ => None,
        }
    }

    pub fn get_partition_link(&self, storage_key: &str) -> Option<(&PartitionId, &DataId)> {
        match self.fields.get(storage_key) {
            Some(FieldValue::PartitionLink { partition, id }) => Some((partition, id)),
            _ => None,
        }
    }

    pub fn set(&mut self, storage_key: impl Into<String>, value: FieldValue) {
        self.fields.insert(storage_key.into(), value);
    }

    pub fn set_value(&mut self, storage_key: impl Into<String>, value: Value) {
        self.set(storage_key, FieldValue::Scalar(value));
    }

    pub fn set_linked_id(&mut self, storage_key: impl Into<String>, id: DataId) {
        self.set(storage_key, FieldValue::Link(id));
    }

    pub fn set_linked_ids(&mut self, storage_key: impl Into<String>, ids: Vec<Option<DataId>>) {
        self.set(storage_key, FieldValue::Links(ids));
    }

    pub fn set_partition_link(&mut self, storage_key: impl Into<String>, partition: PartitionId, id: DataId) {
        self.set(storage_key, FieldValue::PartitionLink { partition, id });
    }

    pub fn remove_field(&mut self, storage_key: &str) -> Option<FieldValue> {
        self.fields.remove(storage_key)
    }

    /// Overwrite this record's fields with every field of `other`.
    pub fn copy_fields_from(&mut self, other: &Record) {
        for (key, value) in &other.fields {
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Merge `next` over `prev`.
    ///
    /// Returns `prev` itself when `next` changes nothing, so identity checks
    /// on the `Arc` can short-circuit change detection.
    pub fn update(prev: &Arc<Record>, next: &Record) -> Arc<Record> {
        let unchanged = prev.typename == next.typename
            && next
                .fields
                .iter()
                .all(|(key, value)| prev.fields.get(key) == Some(value));
        if unchanged {
            return Arc::clone(prev);
        }
        let mut merged = Record::clone(prev);
        merged.typename = next.typename.clone();
        merged.copy_fields_from(next);
        Arc::new(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str) -> Record {
        Record::new(DataId::new(id), "User")
    }

    #[test]
    fn test_field_accessors_by_kind() {
        let mut record = user("1");
        record.set_value("name", json!("Ada"));
        record.set_linked_id("best_friend", DataId::new("2"));
        record.set_linked_ids("friends", vec![Some(DataId::new("2")), None]);

        assert_eq!(record.get_value("name"), Some(&json!("Ada")));
        assert_eq!(record.get_linked_id("best_friend"), Some(&DataId::new("2")));
        assert_eq!(record.get_linked_ids("friends").map(|ids| ids.len()), Some(2));
        // Kind mismatch reads as absent.
        assert!(record.get_value("best_friend").is_none());
    }

    #[test]
    fn test_update_returns_prev_when_unchanged() {
        let mut base = user("1");
        base.set_value("name", json!("Ada"));
        let prev = Arc::new(base.clone());

        let same = Record::update(&prev, &base);
        assert!(Arc::ptr_eq(&prev, &same));
    }

    #[test]
    fn test_update_merges_without_touching_prev() {
        let mut base = user("1");
        base.set_value("name", json!("Ada"));
        base.set_value("age", json!(36));
        let prev = Arc::new(base);

        let mut next = user("1");
        next.set_value("name", json!("Grace"));
        let merged = Record::update(&prev, &next);

        assert_eq!(merged.get_value("name"), Some(&json!("Grace")));
        assert_eq!(merged.get_value("age"), Some(&json!(36)));
        assert_eq!(prev.get_value("name"), Some(&json!("Ada")));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let mut record = user("1");
        record.set_partition_link("account", PartitionId::new("b"), DataId::new("9"));
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
