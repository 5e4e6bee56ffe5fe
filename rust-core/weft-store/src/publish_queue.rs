// SPDX-License-Identifier: PMPL-1.0-or-later
//! Publish queue: staged writes applied to a store in one step.
//!
//! Real changes (payloads, sources, updaters) and optimistic updates are
//! staged, then `run()` applies them:
//!
//! ```text
//!  pending rebase? ──yes──> store.restore()
//!        │
//!        ▼
//!  commit staged data (source → field handlers → updater)
//!        │
//!        ▼
//!  optimistic updates? ──yes──> store.snapshot(), (re)apply updates
//!        │
//!        ▼
//!  store.collect_notifications() ──> owners, pending callbacks
//! ```
//!
//! Any real commit forces already-applied optimistic updates to be re-applied
//! on top of the new base, so optimistic state never leaks into the base.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument};

use weft_record::{OperationDescriptor, RecordSource, RequestIdentifier};

use crate::error::StoreError;
use crate::handler::HandlerProvider;
use crate::payload::Payload;
use crate::proxy::{RecordSourceProxy, StoreUpdater};
use crate::store::{Notification, Store};

static NEXT_UPDATE_ID: AtomicU64 = AtomicU64::new(1);

pub enum OptimisticUpdateKind {
    Payload {
        operation: OperationDescriptor,
        payload: Payload,
        updater: Option<StoreUpdater>,
    },
    Updater(StoreUpdater),
}

/// A speculative change that can be reverted. Identity is the `id`.
pub struct OptimisticUpdate {
    id: u64,
    kind: OptimisticUpdateKind,
}

impl OptimisticUpdate {
    pub fn new(kind: OptimisticUpdateKind) -> Self {
        Self {
            id: NEXT_UPDATE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
        }
    }

    pub fn payload(operation: OperationDescriptor, payload: Payload, updater: Option<StoreUpdater>) -> Self {
        Self::new(OptimisticUpdateKind::Payload {
            operation,
            payload,
            updater,
        })
    }

    pub fn updater(updater: StoreUpdater) -> Self {
        Self::new(OptimisticUpdateKind::Updater(updater))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &OptimisticUpdateKind {
        &self.kind
    }
}

impl fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            OptimisticUpdateKind::Payload { operation, .. } => operation.name().to_string(),
            OptimisticUpdateKind::Updater(_) => "updater".to_string(),
        };
        f.debug_struct("OptimisticUpdate")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

enum PendingCommit {
    Payload {
        payload: Payload,
        updater: Option<StoreUpdater>,
    },
    Source(RecordSource),
    Updater(StoreUpdater),
}

pub struct PublishQueue {
    store: Arc<dyn Store>,
    handler_provider: HandlerProvider,
    pending_backup_rebase: bool,
    pending_data: Vec<PendingCommit>,
    pending_optimistic: Vec<Arc<OptimisticUpdate>>,
    applied_optimistic: Vec<Arc<OptimisticUpdate>>,
    has_store_snapshot: bool,
}

impl PublishQueue {
    pub fn new(store: Arc<dyn Store>, handler_provider: HandlerProvider) -> Self {
        Self {
            store,
            handler_provider,
            pending_backup_rebase: false,
            pending_data: Vec::new(),
            pending_optimistic: Vec::new(),
            applied_optimistic: Vec::new(),
            has_store_snapshot: false,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn is_staged(&self, update: &OptimisticUpdate) -> bool {
        self.pending_optimistic
            .iter()
            .chain(self.applied_optimistic.iter())
            .any(|staged| staged.id == update.id)
    }

    /// Stage an optimistic update for the next `run()`.
    pub fn apply_update(&mut self, update: Arc<OptimisticUpdate>) -> Result<(), StoreError> {
        if self.is_staged(&update) {
            return Err(StoreError::DuplicateUpdate(update.id));
        }
        self.pending_optimistic.push(update);
        Ok(())
    }

    /// Unstage an optimistic update; reverting an applied one schedules a rebase.
    pub fn revert_update(&mut self, update: &OptimisticUpdate) {
        if let Some(index) = self.pending_optimistic.iter().position(|u| u.id == update.id) {
            self.pending_optimistic.remove(index);
        } else if let Some(index) = self.applied_optimistic.iter().position(|u| u.id == update.id) {
            self.applied_optimistic.remove(index);
            self.pending_backup_rebase = true;
        }
    }

    pub fn revert_all(&mut self) {
        self.pending_backup_rebase = true;
        self.pending_optimistic.clear();
        self.applied_optimistic.clear();
    }

    pub fn commit_payload(&mut self, _operation: &OperationDescriptor, payload: Payload, updater: Option<StoreUpdater>) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingCommit::Payload { payload, updater });
    }

    pub fn commit_source(&mut self, source: RecordSource) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingCommit::Source(source));
    }

    pub fn commit_update(&mut self, updater: StoreUpdater) {
        self.pending_backup_rebase = true;
        self.pending_data.push(PendingCommit::Updater(updater));
    }

    pub fn applied_update_count(&self) -> usize {
        self.applied_optimistic.len()
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending_data.is_empty() || !self.pending_optimistic.is_empty() || self.pending_backup_rebase
    }

    /// Apply everything staged and notify subscribers.
    ///
    /// Every staged change is applied even if one of them fails; the first
    /// failure is returned after subscribers have been notified.
    pub fn run(&mut self, source_operation: Option<&OperationDescriptor>) -> Result<HashSet<RequestIdentifier>, StoreError> {
        let (notification, error) = self.run_deferred(source_operation);
        let owners = notification.deliver();
        match error {
            Some(error) => Err(error),
            None => Ok(owners),
        }
    }

    /// Like `run`, but hands subscriber callbacks back instead of calling
    /// them. Callers deliver them once their own locks are released, so a
    /// callback may re-enter whatever owns this queue.
    #[instrument(skip_all, fields(operation = source_operation.map(|op| op.name())))]
    pub fn run_deferred(&mut self, source_operation: Option<&OperationDescriptor>) -> (Notification, Option<StoreError>) {
        let mut first_error = None;
        if self.pending_backup_rebase && self.has_store_snapshot {
            self.store.restore();
            self.has_store_snapshot = false;
        }
        if let Err(error) = self.commit_data() {
            first_error.get_or_insert(error);
        }
        let needs_apply = !self.pending_optimistic.is_empty()
            || (self.pending_backup_rebase && !self.applied_optimistic.is_empty());
        if needs_apply {
            if !self.has_store_snapshot {
                self.store.snapshot();
                self.has_store_snapshot = true;
            }
            if let Err(error) = self.apply_updates() {
                first_error.get_or_insert(error);
            }
        }
        self.pending_backup_rebase = false;
        let notification = self.store.collect_notifications(source_operation);
        debug!(
            owners = notification.owners.len(),
            applied = self.applied_optimistic.len(),
            "publish queue run"
        );
        (notification, first_error)
    }

    fn commit_data(&mut self) -> Result<(), StoreError> {
        let mut result = Ok(());
        for commit in std::mem::take(&mut self.pending_data) {
            let base = self.store.get_source();
            let mut sink = RecordSource::new();
            let outcome = {
                let mut proxy = RecordSourceProxy::new(&base, &mut sink);
                match &commit {
                    PendingCommit::Payload { payload, updater } => {
                        self.write_payload(&mut proxy, payload, updater.as_ref())
                    }
                    PendingCommit::Source(source) => {
                        proxy.publish_source(source);
                        Ok(())
                    }
                    PendingCommit::Updater(updater) => updater(&mut proxy).map_err(StoreError::from),
                }
            };
            self.store.publish(&sink);
            if let Err(error) = outcome {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        result
    }

    fn apply_updates(&mut self) -> Result<(), StoreError> {
        let mut result = Ok(());
        let mut updates: Vec<Arc<OptimisticUpdate>> = Vec::new();
        if self.pending_backup_rebase {
            updates.extend(self.applied_optimistic.iter().cloned());
        }
        let newly_applied = std::mem::take(&mut self.pending_optimistic);
        updates.extend(newly_applied.iter().cloned());
        self.applied_optimistic.extend(newly_applied);

        for update in updates {
            let base = self.store.get_source();
            let mut sink = RecordSource::new();
            let outcome = {
                let mut proxy = RecordSourceProxy::new(&base, &mut sink);
                match &update.kind {
                    OptimisticUpdateKind::Payload { payload, updater, .. } => {
                        self.write_payload(&mut proxy, payload, updater.as_ref())
                    }
                    OptimisticUpdateKind::Updater(updater) => updater(&mut proxy).map_err(StoreError::from),
                }
            };
            self.store.publish(&sink);
            if let Err(error) = outcome {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        result
    }

    fn write_payload(
        &self,
        proxy: &mut RecordSourceProxy<'_>,
        payload: &Payload,
        updater: Option<&StoreUpdater>,
    ) -> Result<(), StoreError> {
        proxy.publish_source(&payload.source);
        for field_payload in &payload.field_payloads {
            let handler = self
                .handler_provider
                .get(&field_payload.handle)
                .ok_or_else(|| StoreError::MissingHandler(field_payload.handle.clone()))?;
            handler.update(proxy, field_payload)?;
        }
        if let Some(updater) = updater {
            updater(proxy)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublishQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishQueue")
            .field("pending_data", &self.pending_data.len())
            .field("pending_optimistic", &self.pending_optimistic.len())
            .field("applied_optimistic", &self.applied_optimistic.len())
            .field("pending_backup_rebase", &self.pending_backup_rebase)
            .finish()
    }
}
