// SPDX-License-Identifier: PMPL-1.0-or-later
//! Builder for `PartitionRouter`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use weft_executor::{OperationLoader, TaskScheduler};
use weft_normalizer::{default_get_data_id, GetDataId, Normalizer, ResponseNormalizer};
use weft_record::PartitionId;
use weft_store::{HandlerProvider, MissingFieldHandler, Store};

use crate::config::RouterConfig;
use crate::environment::{ConfigNameFactory, NetworkFactory, StoreFactory, TrackerFactory};
use crate::error::RouterError;
use crate::network::Network;
use crate::router::{PartitionRouter, RouterShared};

/// Collects the router's collaborators. Only the network factory is
/// required.
#[derive(Default)]
pub struct PartitionRouterBuilder {
    config: RouterConfig,
    network_factory: Option<NetworkFactory>,
    store_factory: Option<StoreFactory>,
    config_name_factory: Option<ConfigNameFactory>,
    tracker_factory: Option<TrackerFactory>,
    handler_provider: HandlerProvider,
    missing_field_handlers: Vec<Arc<dyn MissingFieldHandler>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    operation_loader: Option<Arc<dyn OperationLoader>>,
    normalizer: Option<Arc<dyn Normalizer>>,
    get_data_id: Option<GetDataId>,
}

impl PartitionRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn network_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PartitionId) -> Arc<dyn Network> + Send + Sync + 'static,
    {
        self.network_factory = Some(Arc::new(factory));
        self
    }

    /// Use the same network for every partition.
    pub fn network(self, network: Arc<dyn Network>) -> Self {
        self.network_factory(move |_| Arc::clone(&network))
    }

    pub fn store_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PartitionId) -> Arc<dyn Store> + Send + Sync + 'static,
    {
        self.store_factory = Some(Arc::new(factory));
        self
    }

    pub fn config_name_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&PartitionId) -> Option<String> + Send + Sync + 'static,
    {
        self.config_name_factory = Some(Arc::new(factory));
        self
    }

    pub fn tracker_factory(mut self, factory: TrackerFactory) -> Self {
        self.tracker_factory = Some(factory);
        self
    }

    pub fn handler_provider(mut self, handler_provider: HandlerProvider) -> Self {
        self.handler_provider = handler_provider;
        self
    }

    pub fn missing_field_handler(mut self, handler: Arc<dyn MissingFieldHandler>) -> Self {
        self.missing_field_handlers.push(handler);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn operation_loader(mut self, loader: Arc<dyn OperationLoader>) -> Self {
        self.operation_loader = Some(loader);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn get_data_id(mut self, get_data_id: GetDataId) -> Self {
        self.get_data_id = Some(get_data_id);
        self
    }

    pub fn build(self) -> Result<PartitionRouter, RouterError> {
        self.config.validate()?;
        let network_factory = self.network_factory.ok_or(RouterError::MissingNetwork)?;
        let shared = RouterShared {
            config: self.config,
            network_factory,
            store_factory: self.store_factory,
            config_name_factory: self.config_name_factory,
            tracker_factory: self.tracker_factory,
            handler_provider: self.handler_provider,
            missing_field_handlers: self.missing_field_handlers,
            scheduler: self.scheduler,
            operation_loader: self.operation_loader,
            normalizer: self.normalizer.unwrap_or_else(|| Arc::new(ResponseNormalizer)),
            get_data_id: self.get_data_id.unwrap_or_else(default_get_data_id),
            executions: Arc::new(Mutex::new(HashMap::new())),
            environments: Mutex::new(HashMap::new()),
        };
        Ok(PartitionRouter {
            shared: Arc::new(shared),
        })
    }
}
