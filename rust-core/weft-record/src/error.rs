// SPDX-License-Identifier: PMPL-1.0-or-later
//! Record error types.

use thiserror::Error;

/// Errors raised when mutating records through a source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record `{0}` does not exist")]
    MissingRecord(String),

    #[error("record `{0}` already exists")]
    DuplicateRecord(String),
}
