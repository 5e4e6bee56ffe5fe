// SPDX-License-Identifier: PMPL-1.0-or-later
//! Tracking of operations that affect other operations' data.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use weft_record::{RequestDescriptor, RequestIdentifier};

pub trait OperationTracker: Send + Sync {
    /// `request` changed data owned by `affected_owners`.
    fn update(&self, request: &RequestDescriptor, affected_owners: &HashSet<RequestIdentifier>);

    /// `request` will not change any more data.
    fn complete(&self, request: &RequestDescriptor);
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Owner -> requests still changing its data.
    pending_by_owner: HashMap<RequestIdentifier, HashSet<RequestIdentifier>>,
    /// Request -> owners it affected.
    owners_by_request: HashMap<RequestIdentifier, HashSet<RequestIdentifier>>,
}

/// Keeps, per owner, the set of in-flight requests affecting it.
#[derive(Debug, Default)]
pub struct PendingOperationTracker {
    state: Mutex<TrackerState>,
}

impl PendingOperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests still changing data owned by `owner`, sorted.
    pub fn pending_for_owner(&self, owner: &RequestIdentifier) -> Vec<RequestIdentifier> {
        let state = self.state.lock();
        let mut pending: Vec<RequestIdentifier> = state
            .pending_by_owner
            .get(owner)
            .map(|requests| requests.iter().cloned().collect())
            .unwrap_or_default();
        pending.sort();
        pending
    }

    pub fn has_pending(&self, owner: &RequestIdentifier) -> bool {
        self.state
            .lock()
            .pending_by_owner
            .get(owner)
            .is_some_and(|requests| !requests.is_empty())
    }
}

impl OperationTracker for PendingOperationTracker {
    fn update(&self, request: &RequestDescriptor, affected_owners: &HashSet<RequestIdentifier>) {
        if affected_owners.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for owner in affected_owners {
            state
                .pending_by_owner
                .entry(owner.clone())
                .or_default()
                .insert(request.identifier.clone());
        }
        state
            .owners_by_request
            .entry(request.identifier.clone())
            .or_default()
            .extend(affected_owners.iter().cloned());
    }

    fn complete(&self, request: &RequestDescriptor) {
        let mut state = self.state.lock();
        let Some(owners) = state.owners_by_request.remove(&request.identifier) else {
            return;
        };
        for owner in owners {
            if let Some(pending) = state.pending_by_owner.get_mut(&owner) {
                pending.remove(&request.identifier);
                if pending.is_empty() {
                    state.pending_by_owner.remove(&owner);
                }
            }
        }
    }
}
