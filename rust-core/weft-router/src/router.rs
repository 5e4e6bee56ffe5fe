// SPDX-License-Identifier: PMPL-1.0-or-later
//! Partition router.
//!
//! Owns one `PartitionEnvironment` per partition and routes store, queue and
//! execution calls to it. Environments are created the first time a
//! partition is named and live as long as the router.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use weft_executor::{
    execute, ActiveState, CancelToken, ExecuteConfig, ExecutionOutput, Executor, OperationExecutions,
    OperationLoader, OptimisticConfig, PartitionAccess, PendingOperationTracker, ResponseSource, TaskScheduler,
};
use weft_normalizer::{GetDataId, Normalizer};
use weft_record::{OperationDescriptor, PartitionId, ReaderSelector, RecordSource, RequestIdentifier};
use weft_store::{
    Availability, CheckOptions, Disposable, HandlerProvider, InMemoryStore, MissingFieldHandler, OptimisticUpdate,
    PublishQueue, Snapshot, Store, StoreUpdater, SubscriptionCallback,
};

use crate::config::RouterConfig;
use crate::environment::{ConfigNameFactory, NetworkFactory, PartitionEnvironment, StoreFactory, TrackerFactory};
use crate::network::Uploadables;

/// Handle to store work handed to a scheduler.
pub struct ScheduledUpdate {
    token: CancelToken,
    scheduler: Arc<dyn TaskScheduler>,
    done: Arc<AtomicBool>,
}

impl ScheduledUpdate {
    pub fn token(&self) -> CancelToken {
        self.token
    }

    /// Whether the task has run.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Drop the task if it has not run yet.
    pub fn cancel(&self) {
        if !self.is_done() {
            self.scheduler.cancel(self.token);
        }
    }
}

impl fmt::Debug for ScheduledUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledUpdate")
            .field("token", &self.token)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Options for `execute_mutation`.
#[derive(Clone, Default)]
pub struct MutationConfig {
    pub optimistic: Option<OptimisticConfig>,
    pub updater: Option<StoreUpdater>,
    pub uploadables: Option<Uploadables>,
}

impl fmt::Debug for MutationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationConfig")
            .field("optimistic", &self.optimistic)
            .field("updater", &self.updater.is_some())
            .field("uploadables", &self.uploadables.as_ref().map(|files| files.len()))
            .finish()
    }
}

pub(crate) struct RouterShared {
    pub(crate) config: RouterConfig,
    pub(crate) network_factory: NetworkFactory,
    pub(crate) store_factory: Option<StoreFactory>,
    pub(crate) config_name_factory: Option<ConfigNameFactory>,
    pub(crate) tracker_factory: Option<TrackerFactory>,
    pub(crate) handler_provider: HandlerProvider,
    pub(crate) missing_field_handlers: Vec<Arc<dyn MissingFieldHandler>>,
    pub(crate) scheduler: Option<Arc<dyn TaskScheduler>>,
    pub(crate) operation_loader: Option<Arc<dyn OperationLoader>>,
    pub(crate) normalizer: Arc<dyn Normalizer>,
    pub(crate) get_data_id: GetDataId,
    pub(crate) executions: OperationExecutions,
    pub(crate) environments: Mutex<HashMap<PartitionId, PartitionEnvironment>>,
}

impl RouterShared {
    fn environment(&self, partition: &PartitionId) -> PartitionEnvironment {
        if let Some(environment) = self.environments.lock().get(partition) {
            return environment.clone();
        }
        // Factories run unlocked; a concurrent creation of the same
        // partition keeps whichever environment was inserted first.
        let created = self.create_environment(partition);
        self.environments
            .lock()
            .entry(partition.clone())
            .or_insert(created)
            .clone()
    }

    fn create_environment(&self, partition: &PartitionId) -> PartitionEnvironment {
        let store: Arc<dyn Store> = match &self.store_factory {
            Some(factory) => factory(partition),
            None => Arc::new(InMemoryStore::new()),
        };
        let queue = PublishQueue::new(Arc::clone(&store), self.handler_provider.clone());
        let network = (self.network_factory)(partition);
        let tracker = match &self.tracker_factory {
            Some(factory) => factory(partition),
            None => Arc::new(PendingOperationTracker::new()),
        };
        let config_name = self.config_name_factory.as_ref().and_then(|factory| factory(partition));
        info!(partition = %partition, config_name = ?config_name, "router.partition.create");
        PartitionEnvironment::new(partition.clone(), store, queue, network, tracker, config_name)
    }
}

impl PartitionAccess for RouterShared {
    fn publish_queue(&self, partition: &PartitionId) -> Arc<Mutex<PublishQueue>> {
        Arc::clone(self.environment(partition).publish_queue())
    }

    fn store(&self, partition: &PartitionId) -> Arc<dyn Store> {
        Arc::clone(self.environment(partition).store())
    }
}

/// Run everything staged on `queue`. Failures are logged; the queue has
/// already applied what it could. Subscribers are called after the queue
/// is unlocked.
fn run_queue(partition: &PartitionId, queue: &Mutex<PublishQueue>) {
    let (notification, error) = queue.lock().run_deferred(None);
    if let Some(error) = error {
        warn!(partition = %partition, error = %error, "router.publish.failed");
    }
    notification.deliver();
}

/// Routes calls to per-partition environments. Cloning shares the
/// environments.
#[derive(Clone)]
pub struct PartitionRouter {
    pub(crate) shared: Arc<RouterShared>,
}

impl PartitionRouter {
    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    pub fn default_partition(&self) -> PartitionId {
        self.shared.config.default_partition_id()
    }

    /// The environment of `partition`, created on first use.
    pub fn environment(&self, partition: &PartitionId) -> PartitionEnvironment {
        self.shared.environment(partition)
    }

    /// Partitions created so far, sorted.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.shared.environments.lock().keys().cloned().collect();
        partitions.sort();
        partitions
    }

    pub fn is_server(&self) -> bool {
        self.shared.config.is_server
    }

    pub fn scheduler(&self) -> Option<Arc<dyn TaskScheduler>> {
        self.shared.scheduler.clone()
    }

    /// Whether a running execution of `identifier` may still deliver data.
    pub fn is_request_active(&self, identifier: &RequestIdentifier) -> bool {
        self.shared.executions.lock().get(identifier) == Some(&ActiveState::Active)
    }

    /// Run `task` on the scheduler, or inline when there is none.
    pub fn schedule_updates<F>(&self, task: F) -> Option<ScheduledUpdate>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(scheduler) = self.shared.scheduler.clone() else {
            task();
            return None;
        };
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let token = scheduler.schedule(Box::new(move || {
            task();
            flag.store(true, Ordering::Release);
        }));
        Some(ScheduledUpdate { token, scheduler, done })
    }

    // ========================================================================
    // Store access
    // ========================================================================

    /// Whether everything `operation` selects is available in `partition`.
    ///
    /// Missing-field handlers may answer absent fields. Their answers are
    /// committed to the partition they were produced for.
    #[instrument(skip_all, fields(partition = %partition, operation = %operation.name()))]
    pub fn check(&self, partition: &PartitionId, operation: &OperationDescriptor) -> Availability {
        let environment = self.environment(partition);
        let shared = Arc::clone(&self.shared);
        let source_for = move |other: &PartitionId| -> RecordSource { shared.environment(other).store().get_source() };
        let options = CheckOptions {
            partition: partition.clone(),
            should_process_client_components: self.shared.config.should_process_client_components,
            handlers: &self.shared.missing_field_handlers,
            source_for: &source_for,
        };
        let outcome = environment.store().check(operation, &options);

        let mut targets: Vec<(PartitionId, RecordSource)> = outcome.targets.into_iter().collect();
        targets.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (target_partition, target) in targets {
            debug!(partition = %target_partition, records = target.len(), "router.check.commit");
            let queue = Arc::clone(self.environment(&target_partition).publish_queue());
            self.schedule_updates(move || {
                queue.lock().commit_source(target);
                run_queue(&target_partition, &queue);
            });
        }
        outcome.availability
    }

    pub fn lookup(&self, partition: &PartitionId, selector: &ReaderSelector) -> Snapshot {
        self.environment(partition).store().lookup(selector)
    }

    pub fn subscribe(&self, partition: &PartitionId, snapshot: Snapshot, callback: SubscriptionCallback) -> Disposable {
        self.environment(partition).store().subscribe(snapshot, callback)
    }

    pub fn retain(&self, partition: &PartitionId, operation: &OperationDescriptor) -> Disposable {
        self.environment(partition).store().retain(operation)
    }

    // ========================================================================
    // Publish queue access
    // ========================================================================

    /// Apply an optimistic update; disposing the handle reverts it.
    pub fn apply_update(&self, partition: &PartitionId, update: Arc<OptimisticUpdate>) -> Disposable {
        let queue = Arc::clone(self.environment(partition).publish_queue());
        let target = partition.clone();
        {
            let queue = Arc::clone(&queue);
            let update = Arc::clone(&update);
            let target = target.clone();
            self.schedule_updates(move || {
                let staged = queue.lock().apply_update(update);
                match staged {
                    Ok(()) => run_queue(&target, &queue),
                    Err(error) => warn!(partition = %target, error = %error, "router.apply_update.rejected"),
                }
            });
        }
        let router = self.clone();
        Disposable::new(move || router.revert_update(&target, &update))
    }

    pub fn revert_update(&self, partition: &PartitionId, update: &Arc<OptimisticUpdate>) {
        let queue = Arc::clone(self.environment(partition).publish_queue());
        let update = Arc::clone(update);
        let target = partition.clone();
        self.schedule_updates(move || {
            queue.lock().revert_update(&update);
            run_queue(&target, &queue);
        });
    }

    /// Swap `old` for `new` in one run.
    pub fn replace_update(&self, partition: &PartitionId, old: &Arc<OptimisticUpdate>, new: Arc<OptimisticUpdate>) {
        let queue = Arc::clone(self.environment(partition).publish_queue());
        let old = Arc::clone(old);
        let target = partition.clone();
        self.schedule_updates(move || {
            let staged = {
                let mut queue = queue.lock();
                queue.revert_update(&old);
                queue.apply_update(new)
            };
            if let Err(error) = staged {
                warn!(partition = %target, error = %error, "router.replace_update.rejected");
            }
            run_queue(&target, &queue);
        });
    }

    pub fn commit_update(&self, partition: &PartitionId, updater: StoreUpdater) {
        let queue = Arc::clone(self.environment(partition).publish_queue());
        let target = partition.clone();
        self.schedule_updates(move || {
            queue.lock().commit_update(updater);
            run_queue(&target, &queue);
        });
    }

    /// Run `updater` against every partition created so far.
    pub fn commit_multi_partition_update(&self, updater: StoreUpdater) {
        for partition in self.partitions() {
            self.commit_update(&partition, Arc::clone(&updater));
        }
    }

    // ========================================================================
    // Executions
    // ========================================================================

    fn execute_config(&self, partition: &PartitionId, operation: OperationDescriptor, source: ResponseSource) -> ExecuteConfig {
        let environment = self.environment(partition);
        let partitions: Arc<dyn PartitionAccess> = Arc::clone(&self.shared) as Arc<dyn PartitionAccess>;
        let mut config = ExecuteConfig::new(operation, source, partitions)
            .with_partition(partition.clone())
            .with_operation_tracker(Arc::clone(environment.tracker()))
            .with_operation_executions(Arc::clone(&self.shared.executions));
        config.normalizer = Arc::clone(&self.shared.normalizer);
        config.get_data_id = Arc::clone(&self.shared.get_data_id);
        config.operation_loader = self.shared.operation_loader.clone();
        config.scheduler = self.shared.scheduler.clone();
        config.treat_missing_fields_as_null = self.shared.config.treat_missing_fields_as_null;
        config.should_process_client_components = self.shared.config.should_process_client_components;
        config.track_optimistic_updates = self.shared.config.track_optimistic_updates;
        config
    }

    fn network_source(
        &self,
        partition: &PartitionId,
        operation: &OperationDescriptor,
        uploadables: Option<&Uploadables>,
    ) -> ResponseSource {
        let request = &operation.request;
        self.environment(partition).network().execute(
            &request.node.params,
            &request.variables,
            &request.cache_config,
            uploadables,
        )
    }

    /// Fetch `operation` from the partition's network and write the results
    /// to its store.
    pub fn execute(&self, partition: &PartitionId, operation: OperationDescriptor) -> (Executor, ExecutionOutput) {
        let source = self.network_source(partition, &operation, None);
        execute(self.execute_config(partition, operation, source))
    }

    pub fn execute_mutation(
        &self,
        partition: &PartitionId,
        operation: OperationDescriptor,
        mutation: MutationConfig,
    ) -> (Executor, ExecutionOutput) {
        let source = self.network_source(partition, &operation, mutation.uploadables.as_ref());
        let mut config = self.execute_config(partition, operation, source);
        config.optimistic = mutation.optimistic;
        config.updater = mutation.updater;
        execute(config)
    }

    pub fn execute_subscription(
        &self,
        partition: &PartitionId,
        operation: OperationDescriptor,
        updater: Option<StoreUpdater>,
    ) -> (Executor, ExecutionOutput) {
        let source = self.network_source(partition, &operation, None);
        let mut config = self.execute_config(partition, operation, source);
        config.updater = updater;
        execute(config)
    }

    /// Execute with responses from `source` instead of the network.
    pub fn execute_with_source(
        &self,
        partition: &PartitionId,
        operation: OperationDescriptor,
        source: ResponseSource,
    ) -> (Executor, ExecutionOutput) {
        execute(self.execute_config(partition, operation, source))
    }

    /// Apply an optimistic mutation without sending it. Disposing the handle
    /// reverts it.
    pub fn apply_mutation(
        &self,
        partition: &PartitionId,
        operation: OperationDescriptor,
        optimistic: OptimisticConfig,
    ) -> Disposable {
        let mut config = self.execute_config(partition, operation, ResponseSource::never());
        config.optimistic = Some(optimistic);
        let (executor, _output) = execute(config);
        Disposable::new(move || executor.cancel())
    }

    /// Write client-provided `data` for `operation` as if the server had
    /// sent it. The returned executor must be kept until scheduled work has
    /// run.
    pub fn commit_payload(&self, partition: &PartitionId, operation: OperationDescriptor, data: Value) -> Executor {
        let source = ResponseSource::from_responses(vec![json!({ "data": data })]);
        let config = self.execute_config(partition, operation, source).client_payload();
        let (executor, _output) = execute(config);
        executor
    }
}

impl fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("config", &self.shared.config)
            .field("partitions", &self.partitions())
            .field("scheduler", &self.shared.scheduler.is_some())
            .finish()
    }
}
