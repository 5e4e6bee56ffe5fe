// SPDX-License-Identifier: PMPL-1.0-or-later
//! Record store with an optimistic overlay.
//!
//! `InMemoryStore` keeps a base `RecordSource` plus, while optimistic updates
//! are applied, an overlay copy taken by `snapshot()`. Writes go to the
//! overlay when present; `restore()` drops it and rewinds subscriptions to
//! their pre-optimistic snapshots. `notify()` re-reads every subscription
//! touching an updated record and reports the owners whose data changed.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use weft_record::{DataId, OperationDescriptor, ReaderSelector, RecordSource, RequestIdentifier};

use crate::checker::{self, Availability, CheckOptions, CheckOutcome};
use crate::disposable::Disposable;
use crate::reader::{read, Snapshot};

/// Called with the fresh snapshot when a subscription's data changes.
pub type SubscriptionCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// A subscriber callback waiting to receive its fresh snapshot.
pub struct PendingDelivery {
    callback: SubscriptionCallback,
    snapshot: Snapshot,
}

impl PendingDelivery {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn deliver(self) {
        (self.callback)(&self.snapshot);
    }
}

impl fmt::Debug for PendingDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDelivery")
            .field("owner", &self.snapshot.selector.owner)
            .finish()
    }
}

/// Result of re-reading subscriptions after a publish.
///
/// Callbacks are not run until `deliver` is called, so callers holding
/// their own locks can release them first.
#[derive(Debug, Default)]
pub struct Notification {
    pub owners: HashSet<RequestIdentifier>,
    pub deliveries: Vec<PendingDelivery>,
}

impl Notification {
    /// Run every pending callback and hand back the changed owners.
    pub fn deliver(self) -> HashSet<RequestIdentifier> {
        deliver_all(self.deliveries);
        self.owners
    }
}

pub fn deliver_all(deliveries: Vec<PendingDelivery>) {
    for delivery in deliveries {
        delivery.deliver();
    }
}

/// Record store operations the publish queue and executor rely on.
pub trait Store: Send + Sync {
    /// Current records, including applied optimistic changes.
    fn get_source(&self) -> RecordSource;

    fn check(&self, operation: &OperationDescriptor, options: &CheckOptions<'_>) -> CheckOutcome;

    fn lookup(&self, selector: &ReaderSelector) -> Snapshot;

    fn subscribe(&self, snapshot: Snapshot, callback: SubscriptionCallback) -> Disposable;

    /// Keep `operation`'s data from being collected until disposed.
    fn retain(&self, operation: &OperationDescriptor) -> Disposable;

    fn is_retained(&self, identifier: &RequestIdentifier) -> bool;

    fn publish(&self, source: &RecordSource);

    /// Deliver changes to subscribers; returns owners whose data changed.
    fn notify(&self, source_operation: Option<&OperationDescriptor>) -> HashSet<RequestIdentifier> {
        self.collect_notifications(source_operation).deliver()
    }

    /// Re-read subscriptions touching updated records without running
    /// their callbacks.
    fn collect_notifications(&self, source_operation: Option<&OperationDescriptor>) -> Notification;

    /// Start an optimistic overlay.
    fn snapshot(&self);

    /// Drop the optimistic overlay.
    fn restore(&self);
}

struct StoreSubscription {
    snapshot: Snapshot,
    backup: Option<Snapshot>,
    stale: bool,
    callback: SubscriptionCallback,
}

struct RetainedRoot {
    ref_count: usize,
    fetch_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoreState {
    base: RecordSource,
    optimistic: Option<RecordSource>,
    updated_ids: HashSet<DataId>,
    subscriptions: HashMap<u64, StoreSubscription>,
    next_subscription_id: u64,
    roots: HashMap<RequestIdentifier, RetainedRoot>,
}

impl StoreState {
    fn current(&self) -> &RecordSource {
        self.optimistic.as_ref().unwrap_or(&self.base)
    }
}

/// In-memory `Store`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: RecordSource) -> Self {
        let store = Self::default();
        store.state.lock().base = source;
        store
    }

    /// Records without any optimistic overlay.
    pub fn base_source(&self) -> RecordSource {
        self.state.lock().base.clone()
    }

    pub fn has_optimistic_overlay(&self) -> bool {
        self.state.lock().optimistic.is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    fn weak(&self) -> Weak<Mutex<StoreState>> {
        Arc::downgrade(&self.state)
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryStore")
            .field("records", &state.base.len())
            .field("optimistic", &state.optimistic.is_some())
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

impl Store for InMemoryStore {
    fn get_source(&self) -> RecordSource {
        self.state.lock().current().clone()
    }

    fn check(&self, operation: &OperationDescriptor, options: &CheckOptions<'_>) -> CheckOutcome {
        // Handlers may read other stores; never hold this lock across them.
        let source = self.get_source();
        let mut outcome = checker::check(source, &operation.root, options);
        if let Availability::Available { fetch_time } = &mut outcome.availability {
            *fetch_time = self
                .state
                .lock()
                .roots
                .get(operation.identifier())
                .and_then(|root| root.fetch_time);
        }
        outcome
    }

    fn lookup(&self, selector: &ReaderSelector) -> Snapshot {
        let state = self.state.lock();
        read(state.current(), selector)
    }

    fn subscribe(&self, snapshot: Snapshot, callback: SubscriptionCallback) -> Disposable {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_subscription_id;
            state.next_subscription_id += 1;
            state.subscriptions.insert(
                id,
                StoreSubscription {
                    snapshot,
                    backup: None,
                    stale: false,
                    callback,
                },
            );
            id
        };
        let weak = self.weak();
        Disposable::new(move || {
            if let Some(state) = weak.upgrade() {
                state.lock().subscriptions.remove(&id);
            }
        })
    }

    fn retain(&self, operation: &OperationDescriptor) -> Disposable {
        let identifier = operation.identifier().clone();
        {
            let mut state = self.state.lock();
            state
                .roots
                .entry(identifier.clone())
                .or_insert(RetainedRoot {
                    ref_count: 0,
                    fetch_time: None,
                })
                .ref_count += 1;
        }
        let weak = self.weak();
        Disposable::new(move || {
            let Some(state) = weak.upgrade() else { return };
            let mut state = state.lock();
            if let Some(root) = state.roots.get_mut(&identifier) {
                root.ref_count = root.ref_count.saturating_sub(1);
                if root.ref_count == 0 {
                    state.roots.remove(&identifier);
                }
            }
        })
    }

    fn is_retained(&self, identifier: &RequestIdentifier) -> bool {
        self.state.lock().roots.contains_key(identifier)
    }

    fn publish(&self, source: &RecordSource) {
        let mut state = self.state.lock();
        state.updated_ids.extend(source.ids().cloned());
        match state.optimistic.as_mut() {
            Some(overlay) => overlay.merge_from(source),
            None => state.base.merge_from(source),
        }
    }

    fn collect_notifications(&self, source_operation: Option<&OperationDescriptor>) -> Notification {
        let mut owners = HashSet::new();
        let mut deliveries = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(operation) = source_operation {
                if let Some(root) = state.roots.get_mut(operation.identifier()) {
                    root.fetch_time = Some(Utc::now());
                }
            }
            let updated = std::mem::take(&mut state.updated_ids);
            let source = state.optimistic.as_ref().unwrap_or(&state.base);
            for subscription in state.subscriptions.values_mut() {
                let overlaps = subscription
                    .snapshot
                    .seen_records
                    .iter()
                    .any(|id| updated.contains(id));
                if !subscription.stale && !overlaps {
                    continue;
                }
                subscription.stale = false;
                let next = read(source, &subscription.snapshot.selector);
                if next.data != subscription.snapshot.data {
                    owners.insert(next.selector.owner.clone());
                    deliveries.push(PendingDelivery {
                        callback: Arc::clone(&subscription.callback),
                        snapshot: next.clone(),
                    });
                }
                subscription.snapshot = next;
            }
            debug!(updated = updated.len(), changed = deliveries.len(), "store notify");
        }
        Notification { owners, deliveries }
    }

    fn snapshot(&self) {
        let mut state = self.state.lock();
        if state.optimistic.is_some() {
            warn!("store snapshot requested while an optimistic overlay is active");
            return;
        }
        state.optimistic = Some(state.base.clone());
        for subscription in state.subscriptions.values_mut() {
            subscription.backup = Some(subscription.snapshot.clone());
        }
    }

    fn restore(&self) {
        let mut state = self.state.lock();
        state.optimistic = None;
        for subscription in state.subscriptions.values_mut() {
            if let Some(backup) = subscription.backup.take() {
                subscription.snapshot = backup;
            }
            subscription.stale = true;
        }
    }
}
