// SPDX-License-Identifier: PMPL-1.0-or-later
//! Requests, selectors and operation descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::ids::{DataId, RequestIdentifier};
use crate::selection::NormalizationNode;
use crate::variables::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Network-facing description of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    pub name: String,
    /// Persisted query id, when the request is sent by id.
    #[serde(default)]
    pub id: Option<String>,
    pub operation_kind: OperationKind,
    #[serde(default)]
    pub text: Option<String>,
}

/// A request together with the AST used to normalize its responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteRequest {
    pub params: RequestParameters,
    pub operation: Arc<NormalizationNode>,
}

impl ConcreteRequest {
    pub fn new(name: impl Into<String>, operation_kind: OperationKind, operation: NormalizationNode) -> Self {
        Self {
            params: RequestParameters {
                name: name.into(),
                id: None,
                operation_kind,
                text: None,
            },
            operation: Arc::new(operation),
        }
    }

    pub fn query(operation: NormalizationNode) -> Self {
        Self::new(operation.name.clone(), OperationKind::Query, operation)
    }

    pub fn mutation(operation: NormalizationNode) -> Self {
        Self::new(operation.name.clone(), OperationKind::Mutation, operation)
    }

    pub fn subscription(operation: NormalizationNode) -> Self {
        Self::new(operation.name.clone(), OperationKind::Subscription, operation)
    }
}

/// Per-request cache hints passed through to the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub identifier: RequestIdentifier,
    pub node: Arc<ConcreteRequest>,
    pub variables: Variables,
    pub cache_config: CacheConfig,
}

impl RequestDescriptor {
    pub fn new(node: Arc<ConcreteRequest>, variables: Variables, cache_config: CacheConfig) -> Self {
        let base = node.params.id.as_deref().unwrap_or(&node.params.name);
        let identifier = RequestIdentifier::new(format!("{base}{}", Value::Object(variables.clone())));
        Self {
            identifier,
            node,
            variables,
            cache_config,
        }
    }
}

/// Where to write (or what to check): a node applied at a record.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationSelector {
    pub node: Arc<NormalizationNode>,
    pub data_id: DataId,
    pub variables: Variables,
}

impl NormalizationSelector {
    pub fn new(node: Arc<NormalizationNode>, data_id: DataId, variables: Variables) -> Self {
        Self { node, data_id, variables }
    }
}

/// What to read, and on whose behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSelector {
    pub node: Arc<NormalizationNode>,
    pub data_id: DataId,
    pub variables: Variables,
    pub owner: RequestIdentifier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub request: RequestDescriptor,
    pub root: NormalizationSelector,
    pub fragment: ReaderSelector,
}

impl OperationDescriptor {
    /// Describe `request` rooted at the root record.
    pub fn new(request: Arc<ConcreteRequest>, variables: Variables, cache_config: CacheConfig) -> Self {
        Self::with_data_id(request, variables, cache_config, DataId::root())
    }

    /// Describe `request` rooted at `data_id`.
    pub fn with_data_id(
        request: Arc<ConcreteRequest>,
        variables: Variables,
        cache_config: CacheConfig,
        data_id: DataId,
    ) -> Self {
        let node = Arc::clone(&request.operation);
        let request = RequestDescriptor::new(request, variables.clone(), cache_config);
        let root = NormalizationSelector::new(Arc::clone(&node), data_id.clone(), variables.clone());
        let fragment = ReaderSelector {
            node,
            data_id,
            variables,
            owner: request.identifier.clone(),
        };
        Self { request, root, fragment }
    }

    /// Same request, re-rooted at a fresh record (used per subscription event).
    pub fn rerooted(&self, data_id: DataId) -> Self {
        Self::with_data_id(
            Arc::clone(&self.request.node),
            self.request.variables.clone(),
            self.request.cache_config.clone(),
            data_id,
        )
    }

    pub fn identifier(&self) -> &RequestIdentifier {
        &self.request.identifier
    }

    pub fn name(&self) -> &str {
        &self.request.node.params.name
    }

    pub fn kind(&self) -> OperationKind {
        self.request.node.params.operation_kind
    }

    pub fn variables(&self) -> &Variables {
        &self.request.variables
    }
}
