// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shared fixtures for executor integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use weft_executor::{ExecutionEvent, ExecutorError, LocalPartitions, OperationTracker};
use weft_record::{
    CacheConfig, ConcreteRequest, DataId, LinkedField, NormalizationNode, OperationDescriptor, PartitionId, Record,
    ReaderSelector, RequestDescriptor, RequestIdentifier, ScalarField, Selection, Variables,
};
use weft_store::{Disposable, Store, SubscriptionCallback};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tracker that records every call.
#[derive(Default)]
pub struct RecordingTracker {
    updates: Mutex<Vec<HashSet<RequestIdentifier>>>,
    completes: Mutex<Vec<RequestIdentifier>>,
}

impl RecordingTracker {
    pub fn update_count(&self) -> usize {
        self.updates.lock().len()
    }

    pub fn complete_count(&self) -> usize {
        self.completes.lock().len()
    }

    pub fn updated_owners(&self) -> HashSet<RequestIdentifier> {
        self.updates.lock().iter().flatten().cloned().collect()
    }
}

impl OperationTracker for RecordingTracker {
    fn update(&self, _request: &RequestDescriptor, affected_owners: &HashSet<RequestIdentifier>) {
        self.updates.lock().push(affected_owners.clone());
    }

    fn complete(&self, request: &RequestDescriptor) {
        self.completes.lock().push(request.identifier.clone());
    }
}

pub fn scalar(name: &str) -> Selection {
    Selection::Scalar(ScalarField::new(name))
}

pub fn linked(name: &str, typename: &str, selections: Vec<Selection>) -> LinkedField {
    LinkedField::new(name)
        .with_concrete_type(typename)
        .with_selections(selections)
}

pub fn query(name: &str, selections: Vec<Selection>) -> OperationDescriptor {
    OperationDescriptor::new(
        Arc::new(ConcreteRequest::query(NormalizationNode::operation(name, selections))),
        Variables::new(),
        CacheConfig::default(),
    )
}

pub fn mutation(name: &str, selections: Vec<Selection>) -> OperationDescriptor {
    OperationDescriptor::new(
        Arc::new(ConcreteRequest::mutation(NormalizationNode::operation(name, selections))),
        Variables::new(),
        CacheConfig::default(),
    )
}

pub fn subscription(name: &str, selections: Vec<Selection>) -> OperationDescriptor {
    OperationDescriptor::new(
        Arc::new(ConcreteRequest::subscription(NormalizationNode::operation(name, selections))),
        Variables::new(),
        CacheConfig::default(),
    )
}

pub fn default_partition() -> PartitionId {
    PartitionId::default()
}

pub fn record(partitions: &LocalPartitions, partition: &PartitionId, id: &str) -> Option<Arc<Record>> {
    partitions
        .in_memory_store(partition)
        .get_source()
        .get(&DataId::new(id))
        .cloned()
}

pub fn field(partitions: &LocalPartitions, partition: &PartitionId, id: &str, key: &str) -> Option<Value> {
    record(partitions, partition, id).and_then(|record| record.get_value(key).cloned())
}

/// Subscribe `owner` to the records `node` reads from `data_id`, so store
/// notifications report it.
pub fn watch(
    partitions: &LocalPartitions,
    partition: &PartitionId,
    data_id: &str,
    node: NormalizationNode,
    owner: &str,
) -> Disposable {
    watch_with(partitions, partition, data_id, node, owner, Arc::new(|_| {}))
}

/// Like `watch`, calling `callback` with every changed snapshot.
pub fn watch_with(
    partitions: &LocalPartitions,
    partition: &PartitionId,
    data_id: &str,
    node: NormalizationNode,
    owner: &str,
    callback: SubscriptionCallback,
) -> Disposable {
    let store = partitions.in_memory_store(partition);
    let snapshot = store.lookup(&ReaderSelector {
        node: Arc::new(node),
        data_id: DataId::new(data_id),
        variables: Variables::new(),
        owner: RequestIdentifier::new(owner),
    });
    store.subscribe(snapshot, callback)
}

pub fn is_complete(events: &[ExecutionEvent]) -> bool {
    matches!(events.last(), Some(ExecutionEvent::Complete))
}

pub fn next_payloads(events: &[ExecutionEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::Next(response) => Some(response.clone()),
            _ => None,
        })
        .collect()
}

/// The terminal error, if the execution failed.
pub fn error_of(events: &[ExecutionEvent]) -> Option<ExecutorError> {
    events.iter().find_map(|event| match event {
        ExecutionEvent::Error(error) => Some(error.clone()),
        _ => None,
    })
}
