// SPDX-License-Identifier: PMPL-1.0-or-later
//! Network layer seam.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use weft_executor::{ResponseSender, ResponseSource};
use weft_record::{CacheConfig, RequestParameters, Variables};

/// Files attached to a request, keyed by variable path.
pub type Uploadables = BTreeMap<String, Vec<u8>>;

/// Sends requests and returns their response streams.
pub trait Network: Send + Sync {
    fn execute(
        &self,
        request: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
        uploadables: Option<&Uploadables>,
    ) -> ResponseSource;
}

/// One request as seen by a `StaticNetwork`.
#[derive(Debug, Clone, PartialEq)]
pub struct SentRequest {
    pub name: String,
    pub variables: Variables,
    pub uploadables: Option<Uploadables>,
}

/// Network answering each operation name with canned responses.
///
/// Operations without canned responses get a source that stays open; its
/// sender is kept so callers can push chunks later through `sender_for`.
#[derive(Default)]
pub struct StaticNetwork {
    responses: Mutex<HashMap<String, Vec<Value>>>,
    open: Mutex<HashMap<String, Vec<ResponseSender>>>,
    sent: Mutex<Vec<SentRequest>>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(self, operation: impl Into<String>, responses: Vec<Value>) -> Self {
        self.responses.lock().insert(operation.into(), responses);
        self
    }

    /// Senders of the open sources handed out for `operation`, oldest first.
    pub fn sender_for(&self, operation: &str) -> Vec<ResponseSender> {
        self.open.lock().get(operation).cloned().unwrap_or_default()
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().clone()
    }
}

impl Network for StaticNetwork {
    fn execute(
        &self,
        request: &RequestParameters,
        variables: &Variables,
        _cache_config: &CacheConfig,
        uploadables: Option<&Uploadables>,
    ) -> ResponseSource {
        self.sent.lock().push(SentRequest {
            name: request.name.clone(),
            variables: variables.clone(),
            uploadables: uploadables.cloned(),
        });
        if let Some(responses) = self.responses.lock().get(&request.name) {
            return ResponseSource::from_responses(responses.clone());
        }
        let (sender, source) = ResponseSource::channel();
        self.open
            .lock()
            .entry(request.name.clone())
            .or_default()
            .push(sender);
        source
    }
}

impl fmt::Debug for StaticNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut operations: Vec<String> = self.responses.lock().keys().cloned().collect();
        operations.sort();
        f.debug_struct("StaticNetwork")
            .field("operations", &operations)
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}
