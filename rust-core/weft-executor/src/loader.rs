// SPDX-License-Identifier: PMPL-1.0-or-later
//! Operation loaders for module imports.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use weft_record::NormalizationNode;

/// Outcome of an asynchronous load: the node, `None` when the reference has
/// nothing to normalize, or an error message.
pub type ModuleLoadResult = Result<Option<Arc<NormalizationNode>>, String>;

/// Pending asynchronous load.
pub type ModuleLoad = oneshot::Receiver<ModuleLoadResult>;

/// Resolves module-import references to normalization nodes.
pub trait OperationLoader: Send + Sync {
    /// The node, if it is available right now.
    fn get(&self, reference: &str) -> Option<Arc<NormalizationNode>>;

    /// Start loading `reference`.
    fn load(&self, reference: &str) -> ModuleLoad;
}

/// Loader whose pending loads are settled by the caller.
///
/// Preloaded nodes answer `get` immediately; any other reference waits in
/// `load` until `resolve` or `fail` is called for it.
#[derive(Default)]
pub struct DeferredOperationLoader {
    loaded: Mutex<HashMap<String, Arc<NormalizationNode>>>,
    waiting: Mutex<HashMap<String, Vec<oneshot::Sender<ModuleLoadResult>>>>,
}

impl DeferredOperationLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, reference: impl Into<String>, node: NormalizationNode) -> Self {
        self.loaded.lock().insert(reference.into(), Arc::new(node));
        self
    }

    /// Settle pending loads of `reference`. A resolved node is also kept for
    /// later `get` calls. Returns how many loads were settled.
    pub fn resolve(&self, reference: &str, node: Option<NormalizationNode>) -> usize {
        let node = node.map(Arc::new);
        if let Some(node) = &node {
            self.loaded.lock().insert(reference.to_string(), Arc::clone(node));
        }
        self.settle(reference, Ok(node))
    }

    pub fn fail(&self, reference: &str, message: impl Into<String>) -> usize {
        self.settle(reference, Err(message.into()))
    }

    pub fn pending(&self, reference: &str) -> usize {
        self.waiting.lock().get(reference).map_or(0, Vec::len)
    }

    fn settle(&self, reference: &str, result: ModuleLoadResult) -> usize {
        let waiters = self.waiting.lock().remove(reference).unwrap_or_default();
        let mut settled = 0;
        for waiter in waiters {
            // A dropped receiver belongs to a cancelled execution.
            if waiter.send(result.clone()).is_ok() {
                settled += 1;
            }
        }
        settled
    }
}

impl OperationLoader for DeferredOperationLoader {
    fn get(&self, reference: &str) -> Option<Arc<NormalizationNode>> {
        self.loaded.lock().get(reference).cloned()
    }

    fn load(&self, reference: &str) -> ModuleLoad {
        let (tx, rx) = oneshot::channel();
        match self.get(reference) {
            Some(node) => {
                let _ = tx.send(Ok(Some(node)));
            }
            None => self
                .waiting
                .lock()
                .entry(reference.to_string())
                .or_default()
                .push(tx),
        }
        rx
    }
}

impl fmt::Debug for DeferredOperationLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredOperationLoader")
            .field("loaded", &self.loaded.lock().len())
            .field("waiting", &self.waiting.lock().len())
            .finish()
    }
}
