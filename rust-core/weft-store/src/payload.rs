// SPDX-License-Identifier: PMPL-1.0-or-later
//! Normalized response payloads.
//!
//! A `Payload` carries the records produced from one response plus the work
//! that could not be finished while normalizing it: incremental placeholders
//! (data promised by a later `@defer`/`@stream` response) and followups
//! (module imports and actor-change payloads resolved by the executor).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use weft_record::{
    DataId, LinkedField, NormalizationNode, NormalizationSelector, PartitionId, RecordSource,
    Variables,
};

/// Request for a field handler to run against a freshly written field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPayload {
    pub args: Variables,
    pub data_id: DataId,
    pub field_key: String,
    pub handle: String,
    pub handle_key: String,
}

impl FieldPayload {
    /// Stable textual form, used to de-duplicate payloads.
    pub fn stable_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Deferred selections announced at `path`, resolved by a later response.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferPlaceholder {
    pub label: String,
    pub path: Vec<String>,
    /// Data present for the parent when the placeholder was emitted.
    pub data: Value,
    pub selector: NormalizationSelector,
    pub typename: String,
    pub partition: Option<PartitionId>,
}

/// A streamed plural field whose remaining items arrive one response each.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPlaceholder {
    pub label: String,
    pub path: Vec<String>,
    pub parent_id: DataId,
    pub field: LinkedField,
    pub variables: Variables,
    pub partition: Option<PartitionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncrementalPlaceholder {
    Defer(DeferPlaceholder),
    Stream(StreamPlaceholder),
}

impl IncrementalPlaceholder {
    pub fn label(&self) -> &str {
        match self {
            IncrementalPlaceholder::Defer(defer) => &defer.label,
            IncrementalPlaceholder::Stream(stream) => &stream.label,
        }
    }

    pub fn path(&self) -> &[String] {
        match self {
            IncrementalPlaceholder::Defer(defer) => &defer.path,
            IncrementalPlaceholder::Stream(stream) => &stream.path,
        }
    }

    /// Key matching incremental responses against this placeholder.
    pub fn path_key(&self) -> String {
        self.path().join(".")
    }

    pub fn partition(&self) -> Option<&PartitionId> {
        match self {
            IncrementalPlaceholder::Defer(defer) => defer.partition.as_ref(),
            IncrementalPlaceholder::Stream(stream) => stream.partition.as_ref(),
        }
    }

    /// Record the placeholder hangs off.
    pub fn parent_id(&self) -> &DataId {
        match self {
            IncrementalPlaceholder::Defer(defer) => &defer.selector.data_id,
            IncrementalPlaceholder::Stream(stream) => &stream.parent_id,
        }
    }
}

/// Data for a split operation that must be loaded before it is normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleImportPayload {
    pub args: Option<Variables>,
    pub data: Value,
    pub data_id: DataId,
    pub operation_reference: String,
    pub path: Vec<String>,
    pub typename: String,
    pub variables: Variables,
    pub partition: Option<PartitionId>,
}

/// Data belonging to another partition, normalized and committed there.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorPayload {
    pub data: Value,
    pub data_id: DataId,
    pub path: Vec<String>,
    pub node: Arc<NormalizationNode>,
    pub typename: String,
    pub variables: Variables,
    pub partition: PartitionId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FollowupPayload {
    ModuleImport(ModuleImportPayload),
    Actor(ActorPayload),
}

impl FollowupPayload {
    pub fn partition(&self) -> Option<&PartitionId> {
        match self {
            FollowupPayload::ModuleImport(module) => module.partition.as_ref(),
            FollowupPayload::Actor(actor) => Some(&actor.partition),
        }
    }
}

/// Everything produced by normalizing one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub source: RecordSource,
    pub field_payloads: Vec<FieldPayload>,
    pub incremental_placeholders: Vec<IncrementalPlaceholder>,
    pub followup_payloads: Vec<FollowupPayload>,
    pub errors: Option<Vec<Value>>,
    pub is_final: bool,
}

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_source(source: RecordSource) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }
}
