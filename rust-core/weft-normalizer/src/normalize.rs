// SPDX-License-Identifier: PMPL-1.0-or-later
//! Reference response normalizer.
//!
//! Walks the selection AST alongside the response data, writing one record
//! per object. Identifiers come from `get_data_id`, then from a link already
//! written for the same field, then from a derived client id. Deferred and
//! streamed selections become placeholders; module imports and actor-change
//! fields become followups.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use weft_record::{
    arguments_to_variables, generate_client_id, get_handle_storage_key, DataId, FieldValue,
    LinkedField, NormalizationNode, NormalizationSelector, Record, RecordSource, ScalarField,
    Selection, Variables,
};
use weft_store::{
    ActorPayload, DeferPlaceholder, FieldPayload, FollowupPayload, IncrementalPlaceholder,
    ModuleImportPayload, Payload, StreamPlaceholder,
};

use crate::error::NormalizeError;
use crate::options::NormalizeOptions;
use crate::Normalizer;

/// Response key carrying the partition of an actor-change field.
pub const ACTOR_KEY: &str = "actor_key";

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseNormalizer;

impl Normalizer for ResponseNormalizer {
    fn normalize(
        &self,
        response: &Value,
        selector: &NormalizationSelector,
        typename: &str,
        options: &NormalizeOptions,
    ) -> Result<Payload, NormalizeError> {
        let empty = Map::new();
        let data = match response.get("data") {
            Some(Value::Object(data)) => data,
            Some(Value::Null) | None => &empty,
            Some(_) => {
                return Err(NormalizeError::ExpectedObject {
                    path: "data".to_string(),
                })
            }
        };

        let mut state = Normalization {
            options,
            variables: &selector.variables,
            path: options.path.clone(),
            source: RecordSource::new(),
            field_payloads: Vec::new(),
            placeholders: Vec::new(),
            followups: Vec::new(),
        };
        state.ensure_record(&selector.data_id, typename);
        state.traverse(&selector.node.selections, &selector.data_id, data)?;

        Ok(Payload {
            source: state.source,
            field_payloads: state.field_payloads,
            incremental_placeholders: state.placeholders,
            followup_payloads: state.followups,
            errors: response.get("errors").and_then(Value::as_array).cloned(),
            is_final: response.pointer("/extensions/is_final") == Some(&Value::Bool(true)),
        })
    }
}

struct Normalization<'a> {
    options: &'a NormalizeOptions,
    variables: &'a Variables,
    path: Vec<String>,
    source: RecordSource,
    field_payloads: Vec<FieldPayload>,
    placeholders: Vec<IncrementalPlaceholder>,
    followups: Vec<FollowupPayload>,
}

impl Normalization<'_> {
    fn ensure_record(&mut self, id: &DataId, typename: &str) {
        if self.source.get(id).is_none() {
            self.source.set(Record::new(id.clone(), typename));
        }
    }

    fn typename_of(&self, id: &DataId) -> String {
        self.source
            .get(id)
            .map(|record| record.typename().to_string())
            .unwrap_or_default()
    }

    fn set_field(&mut self, id: &DataId, key: &str, value: FieldValue) {
        if let Some(record) = self.source.get_mut(id) {
            record.set(key, value);
        }
    }

    fn path_with(&self, key: &str) -> String {
        let mut path = self.path.clone();
        path.push(key.to_string());
        path.join(".")
    }

    fn is_enabled(&self, condition: Option<&String>) -> bool {
        match condition {
            Some(name) => self.variables.get(name) != Some(&Value::Bool(false)),
            None => true,
        }
    }

    fn typename_for(&self, field: &LinkedField, object: &Map<String, Value>) -> Result<String, NormalizeError> {
        field
            .concrete_type
            .clone()
            .or_else(|| object.get("__typename").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| NormalizeError::MissingTypename {
                field: field.name.clone(),
                path: self.path_with(field.response_key()),
            })
    }

    fn push_handle(&mut self, id: &DataId, name: &str, args: &[weft_record::Argument], storage_key: &str, handle: &str) {
        self.field_payloads.push(FieldPayload {
            args: arguments_to_variables(args, self.variables),
            data_id: id.clone(),
            field_key: storage_key.to_string(),
            handle: handle.to_string(),
            handle_key: get_handle_storage_key(handle, name, args, self.variables),
        });
    }

    fn traverse(&mut self, selections: &[Selection], id: &DataId, data: &Map<String, Value>) -> Result<(), NormalizeError> {
        for selection in selections {
            match selection {
                Selection::Scalar(field) => self.normalize_scalar(field, id, data),
                Selection::Linked(field) => self.normalize_linked(field, id, data)?,
                Selection::InlineFragment(fragment) => {
                    if self.typename_of(id) == fragment.type_condition {
                        self.traverse(&fragment.selections, id, data)?;
                    }
                }
                Selection::Defer(defer) => {
                    if !self.is_enabled(defer.if_variable.as_ref()) {
                        self.traverse(&defer.selections, id, data)?;
                        continue;
                    }
                    let node = NormalizationNode::fragment(defer.label.clone(), defer.selections.clone());
                    self.placeholders.push(IncrementalPlaceholder::Defer(DeferPlaceholder {
                        label: defer.label.clone(),
                        path: self.path.clone(),
                        data: Value::Object(data.clone()),
                        selector: NormalizationSelector::new(Arc::new(node), id.clone(), self.variables.clone()),
                        typename: self.typename_of(id),
                        partition: Some(self.options.partition.clone()),
                    }));
                }
                Selection::Stream(stream) => {
                    self.normalize_linked(&stream.field, id, data)?;
                    if self.is_enabled(stream.if_variable.as_ref()) {
                        if !stream.field.plural {
                            return Err(NormalizeError::UnsupportedSelection {
                                field: stream.field.name.clone(),
                                reason: "streamed fields must be plural",
                            });
                        }
                        self.placeholders.push(IncrementalPlaceholder::Stream(StreamPlaceholder {
                            label: stream.label.clone(),
                            path: self.path.clone(),
                            parent_id: id.clone(),
                            field: stream.field.clone(),
                            variables: self.variables.clone(),
                            partition: Some(self.options.partition.clone()),
                        }));
                    }
                }
                Selection::ModuleImport(module) => {
                    let component_key = module.component_key();
                    let component = data.get(&component_key).cloned().unwrap_or(Value::Null);
                    self.set_field(id, &component_key, FieldValue::Scalar(component));

                    let operation_key = module.operation_key();
                    let operation = data.get(&operation_key).cloned().unwrap_or(Value::Null);
                    self.set_field(id, &operation_key, FieldValue::Scalar(operation.clone()));

                    if let Value::String(reference) = operation {
                        let args = (!module.args.is_empty())
                            .then(|| arguments_to_variables(&module.args, self.variables));
                        self.followups.push(FollowupPayload::ModuleImport(ModuleImportPayload {
                            args,
                            data: Value::Object(data.clone()),
                            data_id: id.clone(),
                            operation_reference: reference,
                            path: self.path.clone(),
                            typename: self.typename_of(id),
                            variables: self.variables.clone(),
                            partition: Some(self.options.partition.clone()),
                        }));
                    }
                }
                Selection::ActorChange(actor) => self.normalize_actor_change(&actor.field, id, data)?,
                Selection::ClientComponent(component) => {
                    if self.options.should_process_client_components {
                        self.traverse(&component.selections, id, data)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn normalize_scalar(&mut self, field: &ScalarField, id: &DataId, data: &Map<String, Value>) {
        let key = field.storage_key(self.variables);
        match data.get(field.response_key()) {
            Some(value) => self.set_field(id, &key, FieldValue::Scalar(value.clone())),
            None if self.options.treat_missing_fields_as_null => {
                self.set_field(id, &key, FieldValue::Scalar(Value::Null))
            }
            None => {}
        }
        if let Some(handle) = &field.handle {
            self.push_handle(id, &field.name, &field.args, &key, handle);
        }
    }

    fn normalize_linked(&mut self, field: &LinkedField, id: &DataId, data: &Map<String, Value>) -> Result<(), NormalizeError> {
        let key = field.storage_key(self.variables);
        if let Some(handle) = &field.handle {
            self.push_handle(id, &field.name, &field.args, &key, handle);
        }
        let value = match data.get(field.response_key()) {
            Some(Value::Null) => {
                self.set_field(id, &key, FieldValue::Scalar(Value::Null));
                return Ok(());
            }
            Some(value) => value,
            None => {
                if self.options.treat_missing_fields_as_null {
                    self.set_field(id, &key, FieldValue::Scalar(Value::Null));
                }
                return Ok(());
            }
        };
        if field.plural {
            self.normalize_plural(field, id, &key, value)
        } else {
            self.normalize_singular(field, id, &key, value)
        }
    }

    fn normalize_singular(&mut self, field: &LinkedField, parent: &DataId, key: &str, value: &Value) -> Result<(), NormalizeError> {
        let response_key = field.response_key();
        let object = value.as_object().ok_or_else(|| NormalizeError::ExpectedObject {
            path: self.path_with(response_key),
        })?;
        let typename = self.typename_for(field, object)?;
        let previous = self
            .source
            .get(parent)
            .and_then(|record| record.get_linked_id(key).cloned());
        let next_id = (self.options.get_data_id)(object, &typename)
            .or(previous)
            .unwrap_or_else(|| generate_client_id(parent, key, None));

        self.set_field(parent, key, FieldValue::Link(next_id.clone()));
        self.ensure_record(&next_id, &typename);
        self.path.push(response_key.to_string());
        self.traverse(&field.selections, &next_id, object)?;
        self.path.pop();
        Ok(())
    }

    fn normalize_plural(&mut self, field: &LinkedField, parent: &DataId, key: &str, value: &Value) -> Result<(), NormalizeError> {
        let response_key = field.response_key();
        let items = value.as_array().ok_or_else(|| NormalizeError::ExpectedList {
            path: self.path_with(response_key),
        })?;
        let previous: Vec<Option<DataId>> = self
            .source
            .get(parent)
            .and_then(|record| record.get_linked_ids(key).map(<[_]>::to_vec))
            .unwrap_or_default();

        let mut ids = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let object = match item {
                Value::Null => {
                    ids.push(None);
                    continue;
                }
                Value::Object(object) => object,
                _ => {
                    return Err(NormalizeError::ExpectedObject {
                        path: format!("{}.{index}", self.path_with(response_key)),
                    })
                }
            };
            let typename = self.typename_for(field, object)?;
            let next_id = (self.options.get_data_id)(object, &typename)
                .or_else(|| previous.get(index).cloned().flatten())
                .unwrap_or_else(|| generate_client_id(parent, key, Some(index)));
            self.ensure_record(&next_id, &typename);
            self.path.push(response_key.to_string());
            self.path.push(index.to_string());
            self.traverse(&field.selections, &next_id, object)?;
            self.path.pop();
            self.path.pop();
            ids.push(Some(next_id));
        }
        self.set_field(parent, key, FieldValue::Links(ids));
        Ok(())
    }

    fn normalize_actor_change(&mut self, field: &LinkedField, parent: &DataId, data: &Map<String, Value>) -> Result<(), NormalizeError> {
        if field.plural {
            return Err(NormalizeError::UnsupportedSelection {
                field: field.name.clone(),
                reason: "actor-change fields must be singular",
            });
        }
        let key = field.storage_key(self.variables);
        let response_key = field.response_key();
        let value = match data.get(response_key) {
            Some(Value::Null) => {
                self.set_field(parent, &key, FieldValue::Scalar(Value::Null));
                return Ok(());
            }
            Some(value) => value,
            None => {
                if self.options.treat_missing_fields_as_null {
                    self.set_field(parent, &key, FieldValue::Scalar(Value::Null));
                }
                return Ok(());
            }
        };
        let object = value.as_object().ok_or_else(|| NormalizeError::ExpectedObject {
            path: self.path_with(response_key),
        })?;
        let Some(partition) = object.get(ACTOR_KEY).and_then(Value::as_str) else {
            warn!(field = %field.name, "actor-change field without `{}`", ACTOR_KEY);
            self.set_field(parent, &key, FieldValue::Scalar(Value::Null));
            return Ok(());
        };
        let partition = weft_record::PartitionId::new(partition);
        let typename = self.typename_for(field, object)?;
        let previous = self
            .source
            .get(parent)
            .and_then(|record| record.get_partition_link(&key).map(|(_, id)| id.clone()));
        let next_id = (self.options.get_data_id)(object, &typename)
            .or(previous)
            .unwrap_or_else(|| generate_client_id(parent, &key, None));

        self.set_field(
            parent,
            &key,
            FieldValue::PartitionLink {
                partition: partition.clone(),
                id: next_id.clone(),
            },
        );
        let mut path = self.path.clone();
        path.push(response_key.to_string());
        self.followups.push(FollowupPayload::Actor(ActorPayload {
            data: value.clone(),
            data_id: next_id,
            path,
            node: Arc::new(NormalizationNode::fragment(field.name.clone(), field.selections.clone())),
            typename,
            variables: self.variables.clone(),
            partition,
        }));
        Ok(())
    }
}
