// SPDX-License-Identifier: PMPL-1.0-or-later
//! Execution configuration.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use weft_normalizer::{default_get_data_id, GetDataId, Normalizer, ResponseNormalizer};
use weft_record::{OperationDescriptor, PartitionId};
use weft_store::StoreUpdater;

use crate::loader::OperationLoader;
use crate::partition::PartitionAccess;
use crate::response::ResponseSource;
use crate::scheduler::TaskScheduler;
use crate::state::OperationExecutions;
use crate::tracker::{OperationTracker, PendingOperationTracker};

/// Speculative data applied before the first real response.
#[derive(Clone, Default)]
pub struct OptimisticConfig {
    /// Optimistic `data`, normalized against the operation.
    pub response: Option<Value>,
    pub updater: Option<StoreUpdater>,
}

impl fmt::Debug for OptimisticConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticConfig")
            .field("response", &self.response)
            .field("updater", &self.updater.is_some())
            .finish()
    }
}

/// Everything one execution needs.
pub struct ExecuteConfig {
    pub operation: OperationDescriptor,
    pub source: ResponseSource,
    /// Partition the operation starts in.
    pub partition: PartitionId,
    pub partitions: Arc<dyn PartitionAccess>,
    pub normalizer: Arc<dyn Normalizer>,
    pub get_data_id: GetDataId,
    pub operation_loader: Option<Arc<dyn OperationLoader>>,
    pub operation_tracker: Arc<dyn OperationTracker>,
    pub operation_executions: OperationExecutions,
    /// `None` runs store mutations inline.
    pub scheduler: Option<Arc<dyn TaskScheduler>>,
    pub optimistic: Option<OptimisticConfig>,
    /// Runs after each non-incremental payload is written.
    pub updater: Option<StoreUpdater>,
    /// The data comes from the client, so no incremental payloads will follow.
    pub is_client_payload: bool,
    pub treat_missing_fields_as_null: bool,
    pub should_process_client_components: bool,
    /// Report owners affected by optimistic updates to the tracker.
    pub track_optimistic_updates: bool,
}

impl ExecuteConfig {
    pub fn new(operation: OperationDescriptor, source: ResponseSource, partitions: Arc<dyn PartitionAccess>) -> Self {
        Self {
            operation,
            source,
            partition: PartitionId::default(),
            partitions,
            normalizer: Arc::new(ResponseNormalizer),
            get_data_id: default_get_data_id(),
            operation_loader: None,
            operation_tracker: Arc::new(PendingOperationTracker::new()),
            operation_executions: Arc::new(Mutex::new(HashMap::new())),
            scheduler: None,
            optimistic: None,
            updater: None,
            is_client_payload: false,
            treat_missing_fields_as_null: false,
            should_process_client_components: false,
            track_optimistic_updates: false,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_operation_loader(mut self, loader: Arc<dyn OperationLoader>) -> Self {
        self.operation_loader = Some(loader);
        self
    }

    pub fn with_operation_tracker(mut self, tracker: Arc<dyn OperationTracker>) -> Self {
        self.operation_tracker = tracker;
        self
    }

    pub fn with_operation_executions(mut self, executions: OperationExecutions) -> Self {
        self.operation_executions = executions;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_optimistic(mut self, optimistic: OptimisticConfig) -> Self {
        self.optimistic = Some(optimistic);
        self
    }

    pub fn with_updater(mut self, updater: StoreUpdater) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn client_payload(mut self) -> Self {
        self.is_client_payload = true;
        self
    }
}

impl fmt::Debug for ExecuteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteConfig")
            .field("operation", &self.operation.name())
            .field("partition", &self.partition)
            .field("optimistic", &self.optimistic)
            .field("is_client_payload", &self.is_client_payload)
            .field("treat_missing_fields_as_null", &self.treat_missing_fields_as_null)
            .field("should_process_client_components", &self.should_process_client_components)
            .field("track_optimistic_updates", &self.track_optimistic_updates)
            .finish()
    }
}
