// SPDX-License-Identifier: PMPL-1.0-or-later
//! Reads denormalized data back out of a record source.

use serde_json::{Map, Value};
use std::collections::HashSet;

use weft_record::{
    DataId, FieldValue, LinkedField, ReaderSelector, Record, RecordSource, RecordStatus, Selection,
    Variables,
};

/// Result of reading a selector: the data plus every record it touched.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub data: Option<Value>,
    pub is_missing_data: bool,
    pub seen_records: HashSet<DataId>,
    pub selector: ReaderSelector,
}

pub fn read(source: &RecordSource, selector: &ReaderSelector) -> Snapshot {
    let mut reader = Reader {
        source,
        variables: &selector.variables,
        is_missing_data: false,
        seen_records: HashSet::new(),
    };
    let data = reader.read_record(&selector.node.selections, &selector.data_id);
    Snapshot {
        data,
        is_missing_data: reader.is_missing_data,
        seen_records: reader.seen_records,
        selector: selector.clone(),
    }
}

struct Reader<'a> {
    source: &'a RecordSource,
    variables: &'a Variables,
    is_missing_data: bool,
    seen_records: HashSet<DataId>,
}

impl Reader<'_> {
    fn read_record(&mut self, selections: &[Selection], id: &DataId) -> Option<Value> {
        self.seen_records.insert(id.clone());
        match self.source.status(id) {
            RecordStatus::Unknown => {
                self.is_missing_data = true;
                None
            }
            RecordStatus::Nonexistent => Some(Value::Null),
            RecordStatus::Existent => {
                let record = self.source.get(id)?.clone();
                let mut data = Map::new();
                self.read_selections(selections, &record, &mut data);
                Some(Value::Object(data))
            }
        }
    }

    fn read_selections(&mut self, selections: &[Selection], record: &Record, data: &mut Map<String, Value>) {
        for selection in selections {
            match selection {
                Selection::Scalar(field) => {
                    let key = field.storage_key(self.variables);
                    match record.get_value(&key) {
                        Some(value) => {
                            data.insert(field.response_key().to_string(), value.clone());
                        }
                        None if field.name == "__typename" => {
                            data.insert(field.response_key().to_string(), Value::from(record.typename()));
                        }
                        None => self.is_missing_data = true,
                    }
                }
                Selection::Linked(field) => self.read_linked(field, record, data),
                Selection::Stream(stream) => self.read_linked(&stream.field, record, data),
                Selection::InlineFragment(fragment) => {
                    if record.typename() == fragment.type_condition {
                        self.read_selections(&fragment.selections, record, data);
                    }
                }
                Selection::Defer(defer) => self.read_selections(&defer.selections, record, data),
                Selection::ClientComponent(_) => {}
                Selection::ModuleImport(module) => {
                    if let Some(component) = record.get_value(&module.component_key()) {
                        data.insert("__module_component".to_string(), component.clone());
                        data.insert(
                            "__fragment_prop_name".to_string(),
                            Value::from(module.fragment_prop_name.clone()),
                        );
                    }
                }
                Selection::ActorChange(actor) => {
                    let key = actor.field.storage_key(self.variables);
                    let value = match record.get(&key) {
                        Some(FieldValue::PartitionLink { partition, id }) => {
                            serde_json::json!({ "__id": id.as_str(), "__partition": partition.as_str() })
                        }
                        Some(FieldValue::Scalar(Value::Null)) => Value::Null,
                        _ => {
                            self.is_missing_data = true;
                            continue;
                        }
                    };
                    data.insert(actor.field.response_key().to_string(), value);
                }
            }
        }
    }

    fn read_linked(&mut self, field: &LinkedField, record: &Record, data: &mut Map<String, Value>) {
        let key = field.storage_key(self.variables);
        let value = match record.get(&key) {
            Some(FieldValue::Link(id)) => self.read_record(&field.selections, id),
            Some(FieldValue::Links(ids)) => {
                let items = ids
                    .iter()
                    .map(|id| match id {
                        Some(id) => self.read_record(&field.selections, id).unwrap_or(Value::Null),
                        None => Value::Null,
                    })
                    .collect();
                Some(Value::Array(items))
            }
            Some(FieldValue::Scalar(Value::Null)) => Some(Value::Null),
            _ => {
                self.is_missing_data = true;
                None
            }
        };
        if let Some(value) = value {
            data.insert(field.response_key().to_string(), value);
        }
    }
}
