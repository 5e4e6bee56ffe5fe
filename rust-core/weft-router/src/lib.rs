// SPDX-License-Identifier: PMPL-1.0-or-later
//! Weft Router
//!
//! Gives every partition its own store, publish queue, network and
//! operation tracker, and routes calls to the right one:
//!
//! - **Store access** — `check`, `lookup`, `subscribe`, `retain`.
//! - **Queue access** — optimistic `apply_update` / `revert_update` /
//!   `replace_update`, plus `commit_update` and `commit_payload`.
//! - **Executions** — `execute`, `execute_mutation`, `execute_subscription`,
//!   `execute_with_source` and `apply_mutation`, all backed by
//!   `weft_executor`.
//!
//! Store-mutating calls go through `schedule_updates`, which hands the work
//! to the configured scheduler or runs it inline.

pub mod builder;
pub mod config;
pub mod environment;
pub mod error;
pub mod network;
pub mod router;

pub use builder::PartitionRouterBuilder;
pub use config::RouterConfig;
pub use environment::{ConfigNameFactory, NetworkFactory, PartitionEnvironment, StoreFactory, TrackerFactory};
pub use error::RouterError;
pub use network::{Network, SentRequest, StaticNetwork, Uploadables};
pub use router::{MutationConfig, PartitionRouter, ScheduledUpdate};
