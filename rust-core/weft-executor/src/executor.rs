// SPDX-License-Identifier: PMPL-1.0-or-later
//! The incremental executor.
//!
//! One `Executor` drives one request: it pulls response chunks from the
//! source, normalizes them, commits the results through the partition's
//! publish queue and forwards every chunk to the caller. Deferred and
//! streamed chunks are matched to the placeholders announced by earlier
//! chunks, buffering whichever side arrives first. Module imports that are
//! not yet loaded become extra subscriptions, and the execution completes
//! once every subscription has finished.
//!
//! All mutable state lives behind one lock. Work that mutates stores is
//! either run inline or handed to the configured scheduler, and the lock is
//! never held while calling into the scheduler.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use weft_normalizer::{GetDataId, NormalizeOptions, Normalizer};
use weft_record::{
    generate_client_id, generate_unique_client_id, get_local_variables, DataId, NodeKind, NormalizationNode,
    NormalizationSelector, OperationDescriptor, OperationKind, PartitionId, Record, RequestIdentifier, ROOT_TYPE,
};
use weft_store::{
    store_updater, DeferPlaceholder, Disposable, FieldPayload, FollowupPayload, IncrementalPlaceholder,
    deliver_all, ModuleImportPayload, OptimisticUpdate, Payload, PendingDelivery, PublishQueue, StoreUpdater,
    StreamPlaceholder,
};

use crate::config::ExecuteConfig;
use crate::error::ExecutorError;
use crate::loader::{ModuleLoad, OperationLoader};
use crate::partition::PartitionAccess;
use crate::response::{ExecutionOutput, OutputSink, ResponseSource, SourceEvent};
use crate::scheduler::{CancelToken, TaskScheduler};
use crate::state::{ActiveState, ExecutorState, OperationExecutions};
use crate::tracker::OperationTracker;

/// Extension key carrying the root id a subscription payload was written to.
pub const SUBSCRIPTION_ROOT_ID_KEY: &str = "__subscription_root_id";

/// Labels containing this marker belong to deferred fragments; every other
/// label belongs to a stream.
pub const DEFER_LABEL_MARKER: &str = "$defer$";

type Work = Box<dyn FnOnce(&mut ExecutorInner) -> Result<(), ExecutorError> + Send>;

type PartitionUpdates = Vec<(PartitionId, Arc<OptimisticUpdate>)>;

/// Something the execution is still waiting on.
enum Subscription {
    Source(ResponseSource),
    Task(Option<CancelToken>),
    ModuleLoad {
        /// Taken once the load has settled.
        receiver: Option<ModuleLoad>,
        module: ModuleImportPayload,
        partition: PartitionId,
        token: Option<CancelToken>,
    },
}

/// Module load started while applying an optimistic response. It does not
/// keep the execution alive.
struct OptimisticLoad {
    receiver: ModuleLoad,
    module: ModuleImportPayload,
    partition: PartitionId,
}

#[derive(Debug, Clone)]
struct IncrementalResponse {
    label: String,
    path: Vec<Value>,
    response: Value,
}

enum IncrementalResult {
    Placeholder(IncrementalPlaceholder),
    /// Responses that arrived before their placeholder.
    Responses(Vec<IncrementalResponse>),
}

/// Parent record of a placeholder as the announcing payload wrote it.
struct ParentEntry {
    record: Arc<Record>,
    field_payloads: Vec<FieldPayload>,
}

enum Action {
    Next(Value),
    SourceError(ExecutorError),
    SubscriptionDone(u64),
    ModuleLoaded { id: u64, node: Arc<NormalizationNode> },
    ModuleFailed { id: u64, message: String },
    OptimisticModuleLoaded {
        node: Arc<NormalizationNode>,
        module: ModuleImportPayload,
        partition: PartitionId,
    },
}

/// Handle to a running execution.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Mutex<ExecutorInner>>,
}

/// Start executing `config.operation`.
///
/// Responses already available from the source are processed before this
/// returns; call [`Executor::drain`] when more become available.
pub fn execute(config: ExecuteConfig) -> (Executor, ExecutionOutput) {
    let (sink, output) = OutputSink::channel();
    let ExecuteConfig {
        operation,
        source,
        partition,
        partitions,
        normalizer,
        get_data_id,
        operation_loader,
        operation_tracker,
        operation_executions,
        scheduler,
        optimistic,
        updater,
        is_client_payload,
        treat_missing_fields_as_null,
        should_process_client_components,
        track_optimistic_updates,
    } = config;

    let execute_id = Uuid::new_v4();
    let is_subscription = operation.kind() == OperationKind::Subscription;
    let variables = Value::Object(operation.variables().clone());
    info!(
        execute_id = %execute_id,
        operation = %operation.name(),
        variables = %variables,
        partition = %partition,
        "execute.start"
    );

    let mut inner = ExecutorInner {
        execute_id,
        operation,
        partition,
        partitions,
        normalizer,
        get_data_id,
        operation_loader,
        operation_tracker,
        operation_executions,
        scheduler,
        updater,
        is_client_payload,
        is_subscription,
        treat_missing_fields_as_null,
        should_process_client_components,
        track_optimistic_updates,
        state: ExecutorState::Started,
        sink,
        subscriptions: BTreeMap::new(),
        next_subscription_id: 0,
        optimistic_loads: Vec::new(),
        optimistic_updates: None,
        pending_module_imports: 0,
        incremental_payloads_pending: false,
        incremental_results: HashMap::new(),
        parent_cache: HashMap::new(),
        seen_partitions: HashSet::new(),
        retained: HashMap::new(),
        tracker_completed: false,
        pending_deliveries: Vec::new(),
    };

    inner.start(Subscription::Source(source));
    if let Some(optimistic) = optimistic {
        let response = optimistic.response.map(|data| data_response(&data));
        if let Err(error) = inner.process_optimistic_response(response.as_ref(), optimistic.updater, false) {
            inner.fail(error);
        }
    }
    deliver_all(std::mem::take(&mut inner.pending_deliveries));

    let executor = Executor {
        inner: Arc::new(Mutex::new(inner)),
    };
    executor.drain();
    (executor, output)
}

impl Executor {
    pub fn execute_id(&self) -> Uuid {
        self.inner.lock().execute_id
    }

    pub fn state(&self) -> ExecutorState {
        self.inner.lock().state
    }

    /// The operation being executed. Subscriptions are re-rooted for every
    /// non-incremental payload.
    pub fn operation(&self) -> OperationDescriptor {
        self.inner.lock().operation.clone()
    }

    /// Stop the execution: pending work is dropped and optimistic updates are
    /// reverted. Calling it again does nothing.
    pub fn cancel(&self) {
        locked(&self.inner, ExecutorInner::cancel);
    }

    /// Process every event that is ready: source chunks, settled module
    /// loads. Returns how many events were handled.
    pub fn drain(&self) -> usize {
        let mut handled = 0;
        loop {
            let action = self.inner.lock().next_action();
            let Some(action) = action else {
                break;
            };
            handled += 1;
            self.dispatch(action);
        }
        handled
    }

    fn dispatch(&self, action: Action) {
        match action {
            Action::Next(response) => {
                self.run_task(None, Box::new(move |inner| inner.handle_next_timed(response)));
            }
            Action::SourceError(error) => locked(&self.inner, |inner| inner.fail(error)),
            Action::SubscriptionDone(id) => locked(&self.inner, |inner| inner.settle(id, Ok(()))),
            Action::ModuleLoaded { id, node } => {
                self.run_task(Some(id), Box::new(move |inner| inner.publish_module_import(id, &node)));
            }
            Action::ModuleFailed { id, message } => {
                locked(&self.inner, |inner| inner.settle(id, Err(ExecutorError::ModuleLoad(message))));
            }
            Action::OptimisticModuleLoaded {
                node,
                module,
                partition,
            } => {
                locked(&self.inner, |inner| {
                    if let Err(error) = inner.apply_async_optimistic_module(&node, module, partition) {
                        inner.fail(error);
                    }
                });
            }
        }
    }

    /// Run `work` inline, or through the scheduler when one is configured.
    /// A scheduled task is tracked as a subscription until it has run.
    fn run_task(&self, existing: Option<u64>, work: Work) {
        let scheduler = self.inner.lock().scheduler.clone();
        let Some(scheduler) = scheduler else {
            locked(&self.inner, |inner| inner.run_work(existing, work));
            return;
        };

        let id = {
            let mut inner = self.inner.lock();
            if inner.state == ExecutorState::Completed {
                return;
            }
            match existing {
                Some(id) => id,
                None => inner.start(Subscription::Task(None)),
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let token = scheduler.schedule(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            locked(&inner, |inner| {
                if inner.subscriptions.contains_key(&id) {
                    inner.run_work(Some(id), work);
                }
            });
        }));
        self.inner.lock().set_token(id, token);
    }
}

/// Run `body` under the executor lock, then hand subscribers their fresh
/// snapshots once the lock is released so callbacks may call back into the
/// executor.
fn locked<T>(inner: &Mutex<ExecutorInner>, body: impl FnOnce(&mut ExecutorInner) -> T) -> T {
    let (result, deliveries) = {
        let mut guard = inner.lock();
        let result = body(&mut *guard);
        (result, std::mem::take(&mut guard.pending_deliveries))
    };
    deliver_all(deliveries);
    result
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Executor")
            .field("execute_id", &inner.execute_id)
            .field("operation", &inner.operation.name())
            .field("state", &inner.state)
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}

struct ExecutorInner {
    execute_id: Uuid,
    operation: OperationDescriptor,
    /// Partition the current payload is processed in.
    partition: PartitionId,
    partitions: Arc<dyn PartitionAccess>,
    normalizer: Arc<dyn Normalizer>,
    get_data_id: GetDataId,
    operation_loader: Option<Arc<dyn OperationLoader>>,
    operation_tracker: Arc<dyn OperationTracker>,
    operation_executions: OperationExecutions,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    updater: Option<StoreUpdater>,
    is_client_payload: bool,
    is_subscription: bool,
    treat_missing_fields_as_null: bool,
    should_process_client_components: bool,
    track_optimistic_updates: bool,

    state: ExecutorState,
    sink: OutputSink,
    subscriptions: BTreeMap<u64, Subscription>,
    next_subscription_id: u64,
    optimistic_loads: Vec<OptimisticLoad>,
    /// `Some` while an optimistic response is applied.
    optimistic_updates: Option<PartitionUpdates>,
    pending_module_imports: usize,
    incremental_payloads_pending: bool,
    /// Keyed by label, then placeholder path.
    incremental_results: HashMap<(String, String), IncrementalResult>,
    parent_cache: HashMap<(PartitionId, DataId), ParentEntry>,
    /// Partitions whose publish queue has work from the current step.
    seen_partitions: HashSet<PartitionId>,
    retained: HashMap<PartitionId, Disposable>,
    tracker_completed: bool,
    /// Subscriber callbacks from publish queue runs, delivered after unlock.
    pending_deliveries: Vec<PendingDelivery>,
}

impl ExecutorInner {
    fn start(&mut self, subscription: Subscription) -> u64 {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscriptions.insert(id, subscription);
        self.update_active_state();
        id
    }

    fn set_token(&mut self, id: u64, token: CancelToken) {
        match self.subscriptions.get_mut(&id) {
            Some(Subscription::Task(slot)) | Some(Subscription::ModuleLoad { token: slot, .. }) => {
                *slot = Some(token);
            }
            _ => {}
        }
    }

    fn next_action(&mut self) -> Option<Action> {
        if self.state == ExecutorState::Completed {
            return None;
        }
        for (&id, subscription) in self.subscriptions.iter_mut() {
            match subscription {
                Subscription::Source(source) => match source.poll() {
                    Some(SourceEvent::Next(response)) => return Some(Action::Next(response)),
                    Some(SourceEvent::Error(error)) => return Some(Action::SourceError(error)),
                    Some(SourceEvent::Complete) => return Some(Action::SubscriptionDone(id)),
                    None => {}
                },
                Subscription::ModuleLoad { receiver, .. } => {
                    let Some(load) = receiver.as_mut() else {
                        continue;
                    };
                    let result = load.try_recv();
                    if matches!(result, Err(TryRecvError::Empty)) {
                        continue;
                    }
                    *receiver = None;
                    return Some(match result {
                        Ok(Ok(Some(node))) => Action::ModuleLoaded { id, node },
                        Ok(Ok(None)) => Action::SubscriptionDone(id),
                        Ok(Err(message)) => Action::ModuleFailed { id, message },
                        Err(_) => Action::ModuleFailed {
                            id,
                            message: "operation loader dropped the load".to_string(),
                        },
                    });
                }
                Subscription::Task(_) => {}
            }
        }

        let mut index = 0;
        while index < self.optimistic_loads.len() {
            let result = self.optimistic_loads[index].receiver.try_recv();
            if matches!(result, Err(TryRecvError::Empty)) {
                index += 1;
                continue;
            }
            let load = self.optimistic_loads.remove(index);
            match result {
                Ok(Ok(Some(node))) => {
                    return Some(Action::OptimisticModuleLoaded {
                        node,
                        module: load.module,
                        partition: load.partition,
                    })
                }
                Ok(Err(message)) => {
                    warn!(execute_id = %self.execute_id, %message, "optimistic module load failed");
                }
                _ => {}
            }
        }
        None
    }

    fn run_work(&mut self, id: Option<u64>, work: Work) {
        if self.state == ExecutorState::Completed {
            return;
        }
        let result = work(self);
        match id {
            Some(id) => self.settle(id, result),
            None => {
                if let Err(error) = result {
                    self.fail(error);
                }
            }
        }
    }

    /// Finish subscription `id`. The execution completes when the last one
    /// finishes; an error fails it. Unknown ids are ignored.
    fn settle(&mut self, id: u64, result: Result<(), ExecutorError>) {
        let Some(subscription) = self.subscriptions.remove(&id) else {
            return;
        };
        match result {
            Ok(()) => {
                if self.subscriptions.is_empty() {
                    self.cancel();
                    self.sink.complete();
                    info!(execute_id = %self.execute_id, operation = %self.operation.name(), "execute.complete");
                }
            }
            Err(error) => self.fail(error),
        }
        if matches!(subscription, Subscription::ModuleLoad { .. }) {
            self.pending_module_imports = self.pending_module_imports.saturating_sub(1);
            self.update_active_state();
            self.maybe_complete_subscription_tracking();
        }
    }

    fn fail(&mut self, error: ExecutorError) {
        self.cancel();
        error!(
            execute_id = %self.execute_id,
            operation = %self.operation.name(),
            error = %error,
            "execute.error"
        );
        self.sink.error(error);
    }

    fn cancel(&mut self) {
        if self.state == ExecutorState::Completed {
            return;
        }
        self.state = ExecutorState::Completed;
        self.operation_executions.lock().remove(self.operation.identifier());

        let subscriptions = std::mem::take(&mut self.subscriptions);
        if let Some(scheduler) = &self.scheduler {
            for subscription in subscriptions.into_values() {
                match subscription {
                    Subscription::Task(Some(token)) | Subscription::ModuleLoad { token: Some(token), .. } => {
                        scheduler.cancel(token);
                    }
                    _ => {}
                }
            }
        }
        self.optimistic_loads.clear();

        self.seen_partitions.clear();
        if self.revert_optimistic_updates() {
            if let Err(error) = self.run_publish_queue(false) {
                warn!(execute_id = %self.execute_id, error = %error, "failed to revert optimistic updates");
            }
        }
        self.incremental_results.clear();
        self.parent_cache.clear();
        self.complete_operation_tracker();
        for (_, mut retained) in self.retained.drain() {
            retained.dispose();
        }
        debug!(execute_id = %self.execute_id, "execute.cancel");
    }

    fn update_active_state(&mut self) {
        let active = match self.state {
            ExecutorState::Completed => {
                self.operation_executions.lock().remove(self.operation.identifier());
                return;
            }
            ExecutorState::LoadingFinal if self.pending_module_imports == 0 => ActiveState::Inactive,
            _ => ActiveState::Active,
        };
        self.operation_executions
            .lock()
            .insert(self.operation.identifier().clone(), active);
    }

    /// A subscription payload is fully applied once no module import or
    /// incremental payload is outstanding; its tracking entry is closed then.
    fn maybe_complete_subscription_tracking(&mut self) {
        if !self.is_subscription {
            return;
        }
        if self.pending_module_imports == 0 && !self.incremental_payloads_pending {
            self.complete_operation_tracker();
        }
    }

    fn update_operation_tracker(&mut self, owners: HashSet<RequestIdentifier>) {
        if owners.is_empty() {
            return;
        }
        self.tracker_completed = false;
        self.operation_tracker.update(&self.operation.request, &owners);
    }

    fn complete_operation_tracker(&mut self) {
        if self.tracker_completed {
            return;
        }
        self.tracker_completed = true;
        self.operation_tracker.complete(&self.operation.request);
    }

    /// Keep the operation's data while incremental payloads are outstanding.
    fn retain_data(&mut self) {
        let mut partitions: Vec<PartitionId> = self.seen_partitions.iter().cloned().collect();
        partitions.push(self.partition.clone());
        for partition in partitions {
            if let Entry::Vacant(entry) = self.retained.entry(partition) {
                let disposable = self.partitions.store(entry.key()).retain(&self.operation);
                entry.insert(disposable);
            }
        }
    }

    /// Publish queue of the current partition, marking it as seen.
    fn queue(&mut self) -> Arc<Mutex<PublishQueue>> {
        self.seen_partitions.insert(self.partition.clone());
        self.partitions.publish_queue(&self.partition)
    }

    fn run_publish_queue(&mut self, with_operation: bool) -> Result<HashSet<RequestIdentifier>, ExecutorError> {
        let mut partitions: Vec<PartitionId> = self.seen_partitions.iter().cloned().collect();
        if partitions.is_empty() {
            partitions.push(self.partition.clone());
        }
        partitions.sort();
        let source_operation = with_operation.then_some(&self.operation);
        let mut owners = HashSet::new();
        for partition in partitions {
            let queue = self.partitions.publish_queue(&partition);
            let (notification, error) = queue.lock().run_deferred(source_operation);
            owners.extend(notification.owners);
            self.pending_deliveries.extend(notification.deliveries);
            if let Some(error) = error {
                return Err(error.into());
            }
        }
        Ok(owners)
    }

    /// Run `body` with `partition` as the current partition.
    fn with_partition<T>(
        &mut self,
        partition: Option<PartitionId>,
        body: impl FnOnce(&mut Self) -> Result<T, ExecutorError>,
    ) -> Result<T, ExecutorError> {
        let Some(partition) = partition else {
            return body(self);
        };
        let previous = std::mem::replace(&mut self.partition, partition);
        let result = body(self);
        self.partition = previous;
        result
    }

    fn normalize(
        &self,
        response: &Value,
        selector: &NormalizationSelector,
        typename: &str,
        path: Vec<String>,
        treat_missing_fields_as_null: bool,
    ) -> Result<Payload, ExecutorError> {
        let options = NormalizeOptions {
            partition: self.partition.clone(),
            get_data_id: Arc::clone(&self.get_data_id),
            path,
            treat_missing_fields_as_null,
            should_process_client_components: self.should_process_client_components,
        };
        Ok(self.normalizer.normalize(response, selector, typename, &options)?)
    }

    fn expect_operation_loader(&self) -> Result<Arc<dyn OperationLoader>, ExecutorError> {
        self.operation_loader
            .clone()
            .ok_or_else(|| ExecutorError::invariant("expected an operation loader to be configured when using `@module`"))
    }

    fn handle_next_timed(&mut self, response: Value) -> Result<(), ExecutorError> {
        let started = Instant::now();
        let result = self.handle_next(response);
        debug!(execute_id = %self.execute_id, duration = ?started.elapsed(), "execute.next");
        result
    }

    fn handle_next(&mut self, response: Value) -> Result<(), ExecutorError> {
        if self.state == ExecutorState::Completed {
            return Ok(());
        }
        self.seen_partitions.clear();

        let is_batch = response.is_array();
        let mut parts = match response {
            Value::Array(parts) => parts,
            part => vec![part],
        };

        let with_data = self.parts_with_data(&parts)?;
        if with_data.is_empty() {
            if parts.iter().any(is_final_part) {
                self.state = ExecutorState::LoadingFinal;
                self.update_active_state();
                self.incremental_payloads_pending = false;
            }
            self.sink.next(reassemble(parts, is_batch));
            return Ok(());
        }

        if self.handle_optimistic_part(&parts, &with_data)? {
            self.sink.next(reassemble(parts, is_batch));
            return Ok(());
        }

        let mut non_incremental = Vec::new();
        let mut incremental = Vec::new();
        for &index in &with_data {
            let part = &parts[index];
            let label = part.get("label").filter(|label| !label.is_null());
            let path = part.get("path").filter(|path| !path.is_null());
            match (label, path) {
                (None, None) => non_incremental.push(part.clone()),
                (Some(Value::String(label)), Some(Value::Array(path))) => incremental.push(IncrementalResponse {
                    label: label.clone(),
                    path: path.clone(),
                    response: part.clone(),
                }),
                _ => {
                    return Err(ExecutorError::invariant(format!(
                        "expected an incremental response of `{}` to have a string `label` and an array `path`",
                        self.operation.name()
                    )))
                }
            }
        }

        let has_non_incremental = !non_incremental.is_empty();
        if has_non_incremental {
            if self.is_subscription {
                self.operation = self.operation.rerooted(generate_unique_client_id());
            }
            let payloads = self.process_responses(non_incremental)?;
            self.process_payload_followups(payloads)?;
        }
        if !incremental.is_empty() {
            let payloads = self.process_incremental_responses(incremental)?;
            self.process_payload_followups(payloads)?;
        }

        if self.is_subscription {
            let root_id = Value::from(self.operation.root.data_id.as_str());
            if let Some(Value::Object(first)) = parts.get_mut(with_data[0]) {
                let extensions = first
                    .entry("extensions")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !extensions.is_object() {
                    *extensions = Value::Object(Map::new());
                }
                if let Value::Object(extensions) = extensions {
                    extensions.insert(SUBSCRIPTION_ROOT_ID_KEY.to_string(), root_id);
                }
            }
        }

        let owners = self.run_publish_queue(has_non_incremental)?;
        if has_non_incremental && self.incremental_payloads_pending {
            self.retain_data();
        }
        self.update_operation_tracker(owners);
        self.sink.next(reassemble(parts, is_batch));
        Ok(())
    }

    /// Indices of the parts carrying data. A part without data is either a
    /// bare continuation or, if it has an `errors` key, fatal.
    fn parts_with_data(&self, parts: &[Value]) -> Result<Vec<usize>, ExecutorError> {
        let mut with_data = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let has_data = part.get("data").is_some_and(|data| !data.is_null());
            if has_data {
                with_data.push(index);
                continue;
            }
            let Some(errors) = part.get("errors") else {
                continue;
            };
            let messages = match errors {
                Value::Null => "(No errors)".to_string(),
                Value::Array(errors) => errors
                    .iter()
                    .map(|error| error.get("message").and_then(Value::as_str).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            return Err(ExecutorError::NoData {
                operation: self.operation.name().to_string(),
                messages,
                errors: errors.clone(),
                variables: self.operation.variables().clone(),
            });
        }
        Ok(with_data)
    }

    /// Apply the chunk as an optimistic response if it is marked as one.
    /// Returns whether it was.
    fn handle_optimistic_part(&mut self, parts: &[Value], with_data: &[usize]) -> Result<bool, ExecutorError> {
        let is_optimistic = |index: &usize| {
            parts[*index].pointer("/extensions/isOptimistic") == Some(&Value::Bool(true))
        };
        if with_data.len() > 1 {
            if with_data.iter().any(is_optimistic) {
                return Err(ExecutorError::invariant(
                    "optimistic responses cannot be batched",
                ));
            }
            return Ok(false);
        }
        let index = with_data[0];
        if !is_optimistic(&index) {
            return Ok(false);
        }
        if self.state != ExecutorState::Started {
            return Err(ExecutorError::invariant(
                "optimistic payload received after server payload",
            ));
        }
        let treat_missing_fields_as_null = self.treat_missing_fields_as_null;
        self.process_optimistic_response(Some(&parts[index]), None, treat_missing_fields_as_null)?;
        Ok(true)
    }

    fn revert_optimistic_updates(&mut self) -> bool {
        let Some(updates) = self.optimistic_updates.take() else {
            return false;
        };
        for (partition, update) in updates {
            self.partitions.publish_queue(&partition).lock().revert_update(&update);
            self.seen_partitions.insert(partition);
        }
        true
    }

    fn process_optimistic_response(
        &mut self,
        response: Option<&Value>,
        updater: Option<StoreUpdater>,
        treat_missing_fields_as_null: bool,
    ) -> Result<(), ExecutorError> {
        if self.optimistic_updates.is_some() {
            return Err(ExecutorError::invariant(
                "only one optimistic response may be applied per execution",
            ));
        }
        if response.is_none() && updater.is_none() {
            return Ok(());
        }

        let mut updates = PartitionUpdates::new();
        match response {
            Some(response) => {
                let root = self.operation.root.clone();
                let payload = self.normalize(response, &root, ROOT_TYPE, Vec::new(), treat_missing_fields_as_null)?;
                if !payload.incremental_placeholders.is_empty() {
                    return Err(ExecutorError::invariant(
                        "optimistic responses cannot be returned for operations that use incremental data delivery",
                    ));
                }
                let followups = payload.followup_payloads.clone();
                updates.push((
                    self.partition.clone(),
                    Arc::new(OptimisticUpdate::payload(self.operation.clone(), payload, updater)),
                ));
                self.process_optimistic_followups(&followups, &mut updates)?;
            }
            None => {
                if let Some(updater) = updater {
                    updates.push((self.partition.clone(), Arc::new(OptimisticUpdate::updater(updater))));
                }
            }
        }

        self.seen_partitions.clear();
        self.apply_optimistic_updates(&updates)?;
        self.optimistic_updates = Some(updates);
        let owners = self.run_publish_queue(false)?;
        if self.track_optimistic_updates {
            self.update_operation_tracker(owners);
        }
        Ok(())
    }

    fn apply_optimistic_updates(&mut self, updates: &[(PartitionId, Arc<OptimisticUpdate>)]) -> Result<(), ExecutorError> {
        for (partition, update) in updates {
            self.partitions
                .publish_queue(partition)
                .lock()
                .apply_update(Arc::clone(update))?;
            self.seen_partitions.insert(partition.clone());
        }
        Ok(())
    }

    fn process_optimistic_followups(
        &mut self,
        followups: &[FollowupPayload],
        updates: &mut PartitionUpdates,
    ) -> Result<(), ExecutorError> {
        for followup in followups {
            match followup {
                FollowupPayload::ModuleImport(module) => {
                    let loader = self.expect_operation_loader()?;
                    let partition = module.partition.clone().unwrap_or_else(|| self.partition.clone());
                    match loader.get(&module.operation_reference) {
                        Some(node) => self.with_partition(Some(partition), |this| {
                            this.process_optimistic_module_import(&node, module, updates)
                        })?,
                        None => self.optimistic_loads.push(OptimisticLoad {
                            receiver: loader.load(&module.operation_reference),
                            module: module.clone(),
                            partition,
                        }),
                    }
                }
                FollowupPayload::Actor(actor) => {
                    warn!(
                        execute_id = %self.execute_id,
                        partition = %actor.partition,
                        "actor changes are not supported in optimistic responses"
                    );
                }
            }
        }
        Ok(())
    }

    fn process_optimistic_module_import(
        &mut self,
        node: &Arc<NormalizationNode>,
        module: &ModuleImportPayload,
        updates: &mut PartitionUpdates,
    ) -> Result<(), ExecutorError> {
        let followup = FollowupPayload::ModuleImport(module.clone());
        let payload = self.normalize_followup_payload(&followup, node, false)?;
        let followups = payload.followup_payloads.clone();
        updates.push((
            self.partition.clone(),
            Arc::new(OptimisticUpdate::payload(self.operation.clone(), payload, None)),
        ));
        self.process_optimistic_followups(&followups, updates)
    }

    /// An optimistic module load settled. Its data is applied only while the
    /// optimistic response is still in effect.
    fn apply_async_optimistic_module(
        &mut self,
        node: &Arc<NormalizationNode>,
        module: ModuleImportPayload,
        partition: PartitionId,
    ) -> Result<(), ExecutorError> {
        if self.state != ExecutorState::Started || self.optimistic_updates.is_none() {
            debug!(execute_id = %self.execute_id, "dropping stale optimistic module");
            return Ok(());
        }
        self.seen_partitions.clear();
        let mut updates = PartitionUpdates::new();
        self.with_partition(Some(partition), |this| {
            this.process_optimistic_module_import(node, &module, &mut updates)
        })?;
        self.apply_optimistic_updates(&updates)?;
        if let Some(live) = self.optimistic_updates.as_mut() {
            live.extend(updates);
        }
        let owners = self.run_publish_queue(false)?;
        if self.track_optimistic_updates {
            self.update_operation_tracker(owners);
        }
        Ok(())
    }

    /// Normalize and commit non-incremental parts. Any optimistic response is
    /// reverted first. Registered placeholders are dropped; responses still
    /// waiting for their placeholder stay buffered for this payload to claim.
    fn process_responses(&mut self, parts: Vec<Value>) -> Result<Vec<Payload>, ExecutorError> {
        self.revert_optimistic_updates();
        self.incremental_payloads_pending = false;
        self.incremental_results
            .retain(|_, result| matches!(result, IncrementalResult::Responses(_)));
        self.parent_cache.clear();

        let root = self.operation.root.clone();
        let mut payloads = Vec::with_capacity(parts.len());
        for part in &parts {
            let payload = self.normalize(part, &root, ROOT_TYPE, Vec::new(), self.treat_missing_fields_as_null)?;
            let queue = self.queue();
            queue.lock().commit_payload(&self.operation, payload.clone(), self.updater.clone());
            payloads.push(payload);
        }
        Ok(payloads)
    }

    fn process_payload_followups(&mut self, payloads: Vec<Payload>) -> Result<(), ExecutorError> {
        if self.state == ExecutorState::Completed {
            return Ok(());
        }
        for payload in payloads {
            if payload.is_final {
                self.state = ExecutorState::LoadingFinal;
            } else if self.state == ExecutorState::Started {
                self.state = ExecutorState::LoadingIncremental;
            }
            self.update_active_state();

            for followup in &payload.followup_payloads {
                self.with_partition(followup.partition().cloned(), |this| {
                    this.process_followup_payload(followup)
                })?;
            }

            if payload.incremental_placeholders.is_empty() {
                continue;
            }
            self.incremental_payloads_pending = self.state != ExecutorState::LoadingFinal;
            for placeholder in &payload.incremental_placeholders {
                self.with_partition(placeholder.partition().cloned(), |this| {
                    this.process_incremental_placeholder(&payload, placeholder)
                })?;
            }

            if self.is_client_payload || self.state == ExecutorState::LoadingFinal {
                if !self.is_client_payload {
                    warn!(
                        execute_id = %self.execute_id,
                        operation = %self.operation.name(),
                        "final payload still announced incremental data; resolving deferred fragments with the data at hand"
                    );
                }
                let mut resolved = Vec::new();
                for placeholder in &payload.incremental_placeholders {
                    let IncrementalPlaceholder::Defer(defer) = placeholder else {
                        continue;
                    };
                    let response = deferred_data_response(&defer.data);
                    let payload = self.with_partition(defer.partition.clone(), |this| {
                        this.process_defer_response(defer, &response)
                    })?;
                    resolved.push(payload);
                }
                if !resolved.is_empty() {
                    self.process_payload_followups(resolved)?;
                }
            }
        }
        Ok(())
    }

    fn process_followup_payload(&mut self, followup: &FollowupPayload) -> Result<(), ExecutorError> {
        match followup {
            FollowupPayload::ModuleImport(module) => {
                let loader = self.expect_operation_loader()?;
                match loader.get(&module.operation_reference) {
                    Some(node) => {
                        self.handle_followup_payload(followup, &node)?;
                        self.maybe_complete_subscription_tracking();
                    }
                    None => {
                        debug!(
                            execute_id = %self.execute_id,
                            reference = %module.operation_reference,
                            "waiting for module"
                        );
                        self.pending_module_imports += 1;
                        let receiver = loader.load(&module.operation_reference);
                        self.start(Subscription::ModuleLoad {
                            receiver: Some(receiver),
                            module: module.clone(),
                            partition: self.partition.clone(),
                            token: None,
                        });
                    }
                }
            }
            FollowupPayload::Actor(actor) => {
                let node = Arc::clone(&actor.node);
                self.handle_followup_payload(followup, &node)?;
                self.maybe_complete_subscription_tracking();
            }
        }
        Ok(())
    }

    fn handle_followup_payload(
        &mut self,
        followup: &FollowupPayload,
        node: &Arc<NormalizationNode>,
    ) -> Result<(), ExecutorError> {
        let payload = self.normalize_followup_payload(followup, node, self.treat_missing_fields_as_null)?;
        let queue = self.queue();
        queue.lock().commit_payload(&self.operation, payload.clone(), None);
        self.process_payload_followups(vec![payload])
    }

    fn normalize_followup_payload(
        &self,
        followup: &FollowupPayload,
        node: &Arc<NormalizationNode>,
        treat_missing_fields_as_null: bool,
    ) -> Result<Payload, ExecutorError> {
        let (data, data_id, path, typename, variables) = match followup {
            FollowupPayload::ModuleImport(module) => {
                let variables = if node.kind == NodeKind::SplitOperation {
                    get_local_variables(&module.variables, &node.argument_definitions, module.args.as_ref())
                } else {
                    module.variables.clone()
                };
                (&module.data, &module.data_id, &module.path, &module.typename, variables)
            }
            FollowupPayload::Actor(actor) => (
                &actor.data,
                &actor.data_id,
                &actor.path,
                &actor.typename,
                actor.variables.clone(),
            ),
        };
        let selector = NormalizationSelector::new(Arc::clone(node), data_id.clone(), variables);
        self.normalize(
            &data_response(data),
            &selector,
            typename,
            path.clone(),
            treat_missing_fields_as_null,
        )
    }

    /// A module load settled with a node: normalize and publish the module's
    /// data in the partition the import was announced in.
    fn publish_module_import(&mut self, id: u64, node: &Arc<NormalizationNode>) -> Result<(), ExecutorError> {
        let Some(Subscription::ModuleLoad { module, partition, .. }) = self.subscriptions.get(&id) else {
            return Ok(());
        };
        let followup = FollowupPayload::ModuleImport(module.clone());
        let partition = partition.clone();
        let started = Instant::now();

        self.seen_partitions.clear();
        self.with_partition(Some(partition), |this| this.handle_followup_payload(&followup, node))?;
        let owners = self.run_publish_queue(false)?;
        self.update_operation_tracker(owners);
        info!(
            execute_id = %self.execute_id,
            operation = %self.operation.name(),
            reference = %node.name,
            duration = ?started.elapsed(),
            "execute.async.module"
        );
        Ok(())
    }

    /// Register a placeholder, cache its parent record and replay any
    /// responses that arrived before it.
    #[instrument(level = "debug", skip_all, fields(execute_id = %self.execute_id, label = %placeholder.label()))]
    fn process_incremental_placeholder(
        &mut self,
        payload: &Payload,
        placeholder: &IncrementalPlaceholder,
    ) -> Result<(), ExecutorError> {
        let key = (placeholder.label().to_string(), placeholder.path_key());
        let buffered = match self
            .incremental_results
            .insert(key, IncrementalResult::Placeholder(placeholder.clone()))
        {
            Some(IncrementalResult::Responses(responses)) => responses,
            _ => Vec::new(),
        };

        let parent_id = placeholder.parent_id().clone();
        let Some(parent) = payload.source.get(&parent_id) else {
            return Err(ExecutorError::invariant(format!(
                "expected record `{}` announcing `{}` to be present in the payload",
                parent_id.as_str(),
                placeholder.label()
            )));
        };
        let parent = Arc::clone(parent);
        let field_payloads: Vec<FieldPayload> = payload
            .field_payloads
            .iter()
            .filter(|field_payload| {
                field_payload.data_id == parent_id
                    || generate_client_id(&field_payload.data_id, &field_payload.field_key, None) == parent_id
            })
            .cloned()
            .collect();

        match self.parent_cache.entry((self.partition.clone(), parent_id)) {
            Entry::Occupied(mut entry) => {
                let cached = entry.get_mut();
                cached.record = Record::update(&cached.record, &parent);
                let previous = std::mem::take(&mut cached.field_payloads);
                cached.field_payloads = merge_field_payloads(previous, field_payloads);
            }
            Entry::Vacant(entry) => {
                entry.insert(ParentEntry {
                    record: parent,
                    field_payloads,
                });
            }
        }

        if buffered.is_empty() {
            return Ok(());
        }
        debug!(
            execute_id = %self.execute_id,
            label = %placeholder.label(),
            count = buffered.len(),
            "replaying buffered incremental responses"
        );
        let mut payloads = Vec::with_capacity(buffered.len());
        for response in &buffered {
            payloads.push(self.process_incremental_response(placeholder, response)?);
        }
        self.process_payload_followups(payloads)
    }

    fn process_incremental_responses(
        &mut self,
        responses: Vec<IncrementalResponse>,
    ) -> Result<Vec<Payload>, ExecutorError> {
        let mut payloads = Vec::new();
        for response in responses {
            let is_defer = response.label.contains(DEFER_LABEL_MARKER);
            let key_len = if is_defer {
                response.path.len()
            } else {
                response.path.len().saturating_sub(2)
            };
            let key = (response.label.clone(), path_key(&response.path[..key_len]));

            let placeholder = match self.incremental_results.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(IncrementalResult::Responses(vec![response]));
                    continue;
                }
                Entry::Occupied(mut entry) => match entry.get_mut() {
                    IncrementalResult::Responses(buffered) => {
                        buffered.push(response);
                        continue;
                    }
                    IncrementalResult::Placeholder(placeholder) => placeholder.clone(),
                },
            };

            let kind_matches = matches!(
                (&placeholder, is_defer),
                (IncrementalPlaceholder::Defer(_), true) | (IncrementalPlaceholder::Stream(_), false)
            );
            if !kind_matches {
                return Err(ExecutorError::invariant(format!(
                    "incremental response `{}` does not match the kind of its placeholder `{}`",
                    response.label,
                    placeholder.label()
                )));
            }
            payloads.push(self.process_incremental_response(&placeholder, &response)?);
        }
        Ok(payloads)
    }

    #[instrument(level = "debug", skip_all, fields(execute_id = %self.execute_id, label = %response.label))]
    fn process_incremental_response(
        &mut self,
        placeholder: &IncrementalPlaceholder,
        response: &IncrementalResponse,
    ) -> Result<Payload, ExecutorError> {
        self.with_partition(placeholder.partition().cloned(), |this| match placeholder {
            IncrementalPlaceholder::Defer(defer) => this.process_defer_response(defer, &response.response),
            IncrementalPlaceholder::Stream(stream) => this.process_stream_response(stream, response),
        })
    }

    fn process_defer_response(&mut self, defer: &DeferPlaceholder, response: &Value) -> Result<Payload, ExecutorError> {
        let payload = self.normalize(
            response,
            &defer.selector,
            &defer.typename,
            defer.path.clone(),
            self.treat_missing_fields_as_null,
        )?;
        let queue = self.queue();
        queue.lock().commit_payload(&self.operation, payload.clone(), None);

        let key = (self.partition.clone(), defer.selector.data_id.clone());
        let Some(parent) = self.parent_cache.get(&key) else {
            return Err(ExecutorError::invariant(format!(
                "expected the parent record `{}` of deferred fragment `{}` to be cached",
                defer.selector.data_id.as_str(),
                defer.label
            )));
        };
        if !parent.field_payloads.is_empty() {
            let handles = Payload {
                field_payloads: parent.field_payloads.clone(),
                is_final: is_final_part(response),
                ..Payload::default()
            };
            queue.lock().commit_payload(&self.operation, handles, None);
        }
        Ok(payload)
    }

    fn process_stream_response(
        &mut self,
        stream: &StreamPlaceholder,
        response: &IncrementalResponse,
    ) -> Result<Payload, ExecutorError> {
        let Some(Value::Object(item)) = response.response.get("data") else {
            return Err(ExecutorError::invariant(format!(
                "expected the data of stream item `{}` to be an object",
                response.label
            )));
        };
        let field = &stream.field;
        let storage_key = field.storage_key(&stream.variables);
        let parent_key = (self.partition.clone(), stream.parent_id.clone());
        let Some(parent) = self.parent_cache.get(&parent_key) else {
            return Err(ExecutorError::invariant(format!(
                "expected the parent record `{}` of stream `{}` to be cached",
                stream.parent_id.as_str(),
                stream.label
            )));
        };
        let Some(prev_ids) = parent.record.get_linked_ids(&storage_key).map(<[_]>::to_vec) else {
            return Err(ExecutorError::invariant(format!(
                "expected field `{}` of record `{}` to hold a list of links",
                storage_key,
                stream.parent_id.as_str()
            )));
        };
        let Some(index) = response
            .path
            .last()
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
        else {
            return Err(ExecutorError::invariant(format!(
                "expected the path of stream item `{}` to end with an index",
                response.label
            )));
        };

        let Some(typename) = field
            .concrete_type
            .clone()
            .or_else(|| item.get("__typename").and_then(Value::as_str).map(str::to_string))
        else {
            return Err(ExecutorError::invariant(format!(
                "expected stream item `{}` to have a `__typename`",
                response.label
            )));
        };
        let item_id = (self.get_data_id)(item, &typename)
            .or_else(|| prev_ids.get(index).cloned().flatten())
            .unwrap_or_else(|| generate_client_id(&stream.parent_id, &storage_key, Some(index)));

        let mut next_ids = prev_ids.clone();
        if next_ids.len() <= index {
            next_ids.resize(index + 1, None);
        }
        next_ids[index] = Some(item_id.clone());
        if let Some(parent) = self.parent_cache.get_mut(&parent_key) {
            Arc::make_mut(&mut parent.record).set_linked_ids(storage_key.clone(), next_ids);
        }

        let mut path = stream.path.clone();
        path.push(field.response_key().to_string());
        path.push(index.to_string());
        let node = NormalizationNode::fragment(stream.label.clone(), field.selections.clone());
        let selector = NormalizationSelector::new(Arc::new(node), item_id.clone(), stream.variables.clone());
        let payload = self.normalize(
            &response.response,
            &selector,
            &typename,
            path,
            self.treat_missing_fields_as_null,
        )?;

        let updater = stream_item_updater(stream.parent_id.clone(), storage_key, prev_ids, item_id, index);
        let queue = self.queue();
        queue.lock().commit_payload(&self.operation, payload.clone(), Some(updater));

        if let Some(parent) = self.parent_cache.get(&parent_key) {
            if !parent.field_payloads.is_empty() {
                let handles = Payload {
                    field_payloads: parent.field_payloads.clone(),
                    is_final: is_final_part(&response.response),
                    ..Payload::default()
                };
                queue.lock().commit_payload(&self.operation, handles, None);
            }
        }
        Ok(payload)
    }
}

/// Writes a stream item into its parent's list, but only if the list still
/// holds the ids it had when the item was processed. Any other change means
/// the list was refetched or edited and the item is dropped.
fn stream_item_updater(
    parent_id: DataId,
    storage_key: String,
    prev_ids: Vec<Option<DataId>>,
    item_id: DataId,
    index: usize,
) -> StoreUpdater {
    store_updater(move |proxy| {
        if proxy.get(&parent_id).is_none() {
            return Ok(());
        }
        let Some(current) = proxy.get_linked_ids(&parent_id, &storage_key) else {
            return Ok(());
        };
        if current != prev_ids {
            return Ok(());
        }
        let mut next = current;
        if next.len() <= index {
            next.resize(index + 1, None);
        }
        next[index] = proxy.get(&item_id).map(|_| item_id.clone());
        proxy.set_linked_ids(&parent_id, &storage_key, next)
    })
}

fn merge_field_payloads(previous: Vec<FieldPayload>, next: Vec<FieldPayload>) -> Vec<FieldPayload> {
    let mut seen = HashSet::new();
    previous
        .into_iter()
        .chain(next)
        .filter(|payload| seen.insert(payload.stable_key()))
        .collect()
}

fn path_key(path: &[Value]) -> String {
    path.iter()
        .map(|segment| match segment {
            Value::String(segment) => segment.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn is_final_part(part: &Value) -> bool {
    part.pointer("/extensions/is_final") == Some(&Value::Bool(true))
}

fn data_response(data: &Value) -> Value {
    let mut response = Map::new();
    response.insert("data".to_string(), data.clone());
    Value::Object(response)
}

fn deferred_data_response(data: &Value) -> Value {
    let mut extensions = Map::new();
    extensions.insert("is_final".to_string(), Value::Bool(true));
    let mut response = Map::new();
    response.insert("data".to_string(), data.clone());
    response.insert("extensions".to_string(), Value::Object(extensions));
    Value::Object(response)
}

fn reassemble(parts: Vec<Value>, is_batch: bool) -> Value {
    if is_batch {
        Value::Array(parts)
    } else {
        parts.into_iter().next().unwrap_or(Value::Null)
    }
}
