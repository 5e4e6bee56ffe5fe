// SPDX-License-Identifier: PMPL-1.0-or-later
//! Availability checks.
//!
//! Walks a normalization selector over a record source to decide whether
//! everything it selects is present. Missing fields may be answered by
//! registered `MissingFieldHandler`s; their answers are written into a target
//! source for the partition that was being traversed, never into another
//! partition's source. The caller decides when to commit those targets.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use weft_record::{
    DataId, FieldValue, LinkedField, NormalizationSelector, PartitionId, Record, RecordSource,
    RecordState, RecordStatus, ScalarField, Selection, Variables,
};

use crate::proxy::RecordSourceProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available { fetch_time: Option<DateTime<Utc>> },
    Missing,
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub availability: Availability,
    /// Handler answers, keyed by the partition they belong to.
    pub targets: HashMap<PartitionId, RecordSource>,
}

/// What a missing-field handler can see.
pub struct CheckContext<'a> {
    pub partition: &'a PartitionId,
    pub source: &'a RecordSource,
    /// Records of any other partition.
    pub source_for: &'a dyn Fn(&PartitionId) -> RecordSource,
}

/// Supplies values for fields absent from the store.
pub trait MissingFieldHandler: Send + Sync {
    fn handle_scalar(
        &self,
        _field: &ScalarField,
        _record: &Record,
        _args: &Variables,
        _context: &CheckContext<'_>,
    ) -> Option<Value> {
        None
    }

    fn handle_linked(
        &self,
        _field: &LinkedField,
        _record: &Record,
        _args: &Variables,
        _context: &CheckContext<'_>,
    ) -> Option<DataId> {
        None
    }

    fn handle_plural_linked(
        &self,
        _field: &LinkedField,
        _record: &Record,
        _args: &Variables,
        _context: &CheckContext<'_>,
    ) -> Option<Vec<Option<DataId>>> {
        None
    }
}

pub struct CheckOptions<'a> {
    pub partition: PartitionId,
    pub should_process_client_components: bool,
    pub handlers: &'a [Arc<dyn MissingFieldHandler>],
    pub source_for: &'a dyn Fn(&PartitionId) -> RecordSource,
}

/// Check `selector` against `source`, the records of `options.partition`.
pub fn check(source: RecordSource, selector: &NormalizationSelector, options: &CheckOptions<'_>) -> CheckOutcome {
    let mut sources = HashMap::new();
    sources.insert(options.partition.clone(), source);
    let mut checker = DataChecker {
        options,
        partition: options.partition.clone(),
        sources,
        targets: HashMap::new(),
        variables: &selector.variables,
        is_missing: false,
    };
    checker.traverse(&selector.node.selections, &selector.data_id);
    let availability = if checker.is_missing {
        Availability::Missing
    } else {
        Availability::Available { fetch_time: None }
    };
    let targets = checker
        .targets
        .into_iter()
        .filter(|(_, target)| !target.is_empty())
        .collect();
    CheckOutcome { availability, targets }
}

struct DataChecker<'a> {
    options: &'a CheckOptions<'a>,
    partition: PartitionId,
    sources: HashMap<PartitionId, RecordSource>,
    targets: HashMap<PartitionId, RecordSource>,
    variables: &'a Variables,
    is_missing: bool,
}

impl DataChecker<'_> {
    fn record(&self, id: &DataId) -> (RecordStatus, Option<Arc<Record>>) {
        if let Some(state) = self.targets.get(&self.partition).and_then(|target| target.state(id)) {
            return match state {
                RecordState::Existent(record) => (RecordStatus::Existent, Some(Arc::clone(record))),
                RecordState::Nonexistent => (RecordStatus::Nonexistent, None),
            };
        }
        match self.sources.get(&self.partition) {
            Some(source) => (source.status(id), source.get(id).cloned()),
            None => (RecordStatus::Unknown, None),
        }
    }

    fn ensure_source(&mut self, partition: &PartitionId) {
        if !self.sources.contains_key(partition) {
            let source = (self.options.source_for)(partition);
            self.sources.insert(partition.clone(), source);
        }
    }

    fn traverse(&mut self, selections: &[Selection], id: &DataId) {
        match self.record(id) {
            (RecordStatus::Existent, Some(record)) => self.traverse_selections(selections, &record),
            (RecordStatus::Nonexistent, _) => {}
            _ => self.is_missing = true,
        }
    }

    fn traverse_selections(&mut self, selections: &[Selection], record: &Arc<Record>) {
        for selection in selections {
            match selection {
                Selection::Scalar(field) => self.check_scalar(field, record),
                Selection::Linked(field) => self.check_linked(field, record),
                Selection::Stream(stream) => self.check_linked(&stream.field, record),
                Selection::InlineFragment(fragment) => {
                    if record.typename() == fragment.type_condition {
                        self.traverse_selections(&fragment.selections, record);
                    }
                }
                Selection::Defer(defer) => self.traverse_selections(&defer.selections, record),
                Selection::ClientComponent(component) => {
                    if self.options.should_process_client_components {
                        self.traverse_selections(&component.selections, record);
                    }
                }
                Selection::ModuleImport(module) => {
                    if record.get_value(&module.operation_key()).is_none() {
                        self.is_missing = true;
                    }
                }
                Selection::ActorChange(actor) => {
                    let key = actor.field.storage_key(self.variables);
                    match record.get(&key) {
                        Some(FieldValue::PartitionLink { partition, id }) => {
                            let partition = partition.clone();
                            let id = id.clone();
                            self.ensure_source(&partition);
                            let previous = std::mem::replace(&mut self.partition, partition);
                            self.traverse(&actor.field.selections, &id);
                            self.partition = previous;
                        }
                        Some(FieldValue::Scalar(Value::Null)) => {}
                        _ => self.is_missing = true,
                    }
                }
            }
        }
    }

    fn check_scalar(&mut self, field: &ScalarField, record: &Arc<Record>) {
        let key = field.storage_key(self.variables);
        if record.has_field(&key) || field.name == "__typename" {
            return;
        }
        let args: Variables = weft_record::get_argument_values(&field.args, self.variables)
            .into_iter()
            .collect();
        let answer = {
            let context = self.context();
            self.options
                .handlers
                .iter()
                .find_map(|handler| handler.handle_scalar(field, record, &args, &context))
        };
        match answer {
            Some(value) => self.write(record.id(), &key, FieldValue::Scalar(value)),
            None => self.is_missing = true,
        }
    }

    fn check_linked(&mut self, field: &LinkedField, record: &Arc<Record>) {
        let key = field.storage_key(self.variables);
        match record.get(&key) {
            Some(FieldValue::Link(id)) => self.traverse(&field.selections, id),
            Some(FieldValue::Links(ids)) => {
                for id in ids.iter().flatten() {
                    self.traverse(&field.selections, id);
                }
            }
            Some(FieldValue::Scalar(Value::Null)) => {}
            Some(_) => self.is_missing = true,
            None if field.plural => match self.answer_plural(field, record) {
                Some(ids) => {
                    self.write(record.id(), &key, FieldValue::Links(ids.clone()));
                    for id in ids.iter().flatten() {
                        self.traverse(&field.selections, id);
                    }
                }
                None => self.is_missing = true,
            },
            None => match self.answer_linked(field, record) {
                Some(id) => {
                    self.write(record.id(), &key, FieldValue::Link(id.clone()));
                    self.traverse(&field.selections, &id);
                }
                None => self.is_missing = true,
            },
        }
    }

    fn answer_linked(&self, field: &LinkedField, record: &Record) -> Option<DataId> {
        let args: Variables = weft_record::get_argument_values(&field.args, self.variables)
            .into_iter()
            .collect();
        let context = self.context();
        self.options.handlers.iter().find_map(|handler| {
            handler
                .handle_linked(field, record, &args, &context)
                .filter(|id| self.record(id).0 == RecordStatus::Existent)
        })
    }

    fn answer_plural(&self, field: &LinkedField, record: &Record) -> Option<Vec<Option<DataId>>> {
        let args: Variables = weft_record::get_argument_values(&field.args, self.variables)
            .into_iter()
            .collect();
        let context = self.context();
        self.options.handlers.iter().find_map(|handler| {
            handler
                .handle_plural_linked(field, record, &args, &context)
                .filter(|ids| {
                    ids.iter()
                        .flatten()
                        .all(|id| self.record(id).0 == RecordStatus::Existent)
                })
        })
    }

    fn context(&self) -> CheckContext<'_> {
        CheckContext {
            partition: &self.partition,
            source: self
                .sources
                .get(&self.partition)
                .unwrap_or_else(|| empty_source()),
            source_for: self.options.source_for,
        }
    }

    fn write(&mut self, id: &DataId, key: &str, value: FieldValue) {
        let empty = RecordSource::new();
        let base = self.sources.get(&self.partition).unwrap_or(&empty);
        let target = self.targets.entry(self.partition.clone()).or_default();
        let mut proxy = RecordSourceProxy::new(base, target);
        if let Err(error) = proxy.set_field(id, key, value) {
            tracing::warn!(%error, "failed to record missing-field answer");
        }
    }
}

fn empty_source() -> &'static RecordSource {
    static EMPTY: std::sync::OnceLock<RecordSource> = std::sync::OnceLock::new();
    EMPTY.get_or_init(RecordSource::new)
}
