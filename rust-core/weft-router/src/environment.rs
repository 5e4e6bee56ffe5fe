// SPDX-License-Identifier: PMPL-1.0-or-later
//! Per-partition environments and the factories that build them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use weft_executor::OperationTracker;
use weft_record::PartitionId;
use weft_store::{PublishQueue, Store};

use crate::network::Network;

pub type NetworkFactory = Arc<dyn Fn(&PartitionId) -> Arc<dyn Network> + Send + Sync>;
pub type StoreFactory = Arc<dyn Fn(&PartitionId) -> Arc<dyn Store> + Send + Sync>;
/// Name of the configuration a partition runs under, if any.
pub type ConfigNameFactory = Arc<dyn Fn(&PartitionId) -> Option<String> + Send + Sync>;
pub type TrackerFactory = Arc<dyn Fn(&PartitionId) -> Arc<dyn OperationTracker> + Send + Sync>;

/// Everything one partition owns. Created on first use and kept for the
/// router's lifetime.
#[derive(Clone)]
pub struct PartitionEnvironment {
    partition: PartitionId,
    store: Arc<dyn Store>,
    publish_queue: Arc<Mutex<PublishQueue>>,
    network: Arc<dyn Network>,
    tracker: Arc<dyn OperationTracker>,
    config_name: Option<String>,
}

impl PartitionEnvironment {
    pub fn new(
        partition: PartitionId,
        store: Arc<dyn Store>,
        publish_queue: PublishQueue,
        network: Arc<dyn Network>,
        tracker: Arc<dyn OperationTracker>,
        config_name: Option<String>,
    ) -> Self {
        Self {
            partition,
            store,
            publish_queue: Arc::new(Mutex::new(publish_queue)),
            network,
            tracker,
            config_name,
        }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn publish_queue(&self) -> &Arc<Mutex<PublishQueue>> {
        &self.publish_queue
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn tracker(&self) -> &Arc<dyn OperationTracker> {
        &self.tracker
    }

    pub fn config_name(&self) -> Option<&str> {
        self.config_name.as_deref()
    }
}

impl fmt::Debug for PartitionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionEnvironment")
            .field("partition", &self.partition)
            .field("config_name", &self.config_name)
            .finish()
    }
}
