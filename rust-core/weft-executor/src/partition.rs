// SPDX-License-Identifier: PMPL-1.0-or-later
//! Access to per-partition stores and publish queues.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use weft_record::PartitionId;
use weft_store::{HandlerProvider, InMemoryStore, PublishQueue, Store};

/// Looks up (creating on first use) the environment of a partition.
pub trait PartitionAccess: Send + Sync {
    fn publish_queue(&self, partition: &PartitionId) -> Arc<Mutex<PublishQueue>>;

    fn store(&self, partition: &PartitionId) -> Arc<dyn Store>;
}

#[derive(Clone)]
struct LocalPartition {
    store: InMemoryStore,
    queue: Arc<Mutex<PublishQueue>>,
}

/// In-memory partitions for embedding the executor without a router.
#[derive(Default)]
pub struct LocalPartitions {
    handler_provider: HandlerProvider,
    partitions: Mutex<HashMap<PartitionId, LocalPartition>>,
}

impl LocalPartitions {
    pub fn new(handler_provider: HandlerProvider) -> Self {
        Self {
            handler_provider,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn partition(&self, partition: &PartitionId) -> LocalPartition {
        self.partitions
            .lock()
            .entry(partition.clone())
            .or_insert_with(|| {
                debug!(partition = %partition, "creating local partition");
                let store = InMemoryStore::new();
                let queue = PublishQueue::new(Arc::new(store.clone()), self.handler_provider.clone());
                LocalPartition {
                    store,
                    queue: Arc::new(Mutex::new(queue)),
                }
            })
            .clone()
    }

    /// The concrete store of `partition`, sharing state with `store()`.
    pub fn in_memory_store(&self, partition: &PartitionId) -> InMemoryStore {
        self.partition(partition).store
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.partitions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl PartitionAccess for LocalPartitions {
    fn publish_queue(&self, partition: &PartitionId) -> Arc<Mutex<PublishQueue>> {
        self.partition(partition).queue
    }

    fn store(&self, partition: &PartitionId) -> Arc<dyn Store> {
        Arc::new(self.partition(partition).store)
    }
}

impl fmt::Debug for LocalPartitions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPartitions")
            .field("partitions", &self.partition_ids())
            .finish()
    }
}
