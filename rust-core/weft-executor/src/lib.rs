// SPDX-License-Identifier: PMPL-1.0-or-later
//! Weft Executor
//!
//! Applies the response stream of one request to partitioned record stores:
//!
//! - **`execute`** — starts an execution and returns its handle plus the
//!   stream of forwarded responses.
//! - **Incremental delivery** — deferred fragments and streamed list items
//!   are matched to placeholders, in either arrival order.
//! - **Optimistic updates** — applied before the first real response and
//!   reverted when it arrives or the execution is cancelled.
//! - **Module imports and actor changes** — normalized with loaded
//!   operations, possibly after an asynchronous load, in the partition they
//!   were announced in.
//!
//! Store mutations go through each partition's `PublishQueue`, optionally
//! on a `TaskScheduler`.

pub mod config;
pub mod error;
pub mod executor;
pub mod loader;
pub mod partition;
pub mod response;
pub mod scheduler;
pub mod state;
pub mod tracker;

pub use config::{ExecuteConfig, OptimisticConfig};
pub use error::ExecutorError;
pub use executor::{execute, Executor, DEFER_LABEL_MARKER, SUBSCRIPTION_ROOT_ID_KEY};
pub use loader::{DeferredOperationLoader, ModuleLoad, ModuleLoadResult, OperationLoader};
pub use partition::{LocalPartitions, PartitionAccess};
pub use response::{ExecutionEvent, ExecutionOutput, ResponseSender, ResponseSource, SourceEvent};
pub use scheduler::{CancelToken, ImmediateScheduler, QueuedScheduler, Task, TaskScheduler};
pub use state::{ActiveState, ExecutorState, OperationExecutions};
pub use tracker::{OperationTracker, PendingOperationTracker};
