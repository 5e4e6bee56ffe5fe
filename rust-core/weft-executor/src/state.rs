// SPDX-License-Identifier: PMPL-1.0-or-later
//! Execution state.
//!
//! ```text
//! ┌─────────┐  non-final payload  ┌────────────────────┐
//! │ Started │ ──────────────────> │ LoadingIncremental │
//! └─────────┘                     └────────────────────┘
//!      │                                    │
//!      │ final payload        final payload │
//!      │       ┌──────────────┐             │
//!      └─────> │ LoadingFinal │ <───────────┘
//!              └──────────────┘
//!
//! any state ── cancel, error or last subscription done ──> Completed
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use weft_record::RequestIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Started,
    LoadingIncremental,
    LoadingFinal,
    Completed,
}

/// Whether a request may still deliver data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    Active,
    Inactive,
}

/// Active state of every running execution, keyed by request identifier.
/// Completed executions are removed.
pub type OperationExecutions = Arc<Mutex<HashMap<RequestIdentifier, ActiveState>>>;
