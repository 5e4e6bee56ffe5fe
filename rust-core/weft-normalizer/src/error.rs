// SPDX-License-Identifier: PMPL-1.0-or-later
//! Normalizer error types.

use thiserror::Error;

/// Errors raised when a response does not fit its selections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("expected an object at `{path}`")]
    ExpectedObject { path: String },

    #[error("expected a list at `{path}`")]
    ExpectedList { path: String },

    #[error("expected `__typename` for field `{field}` at `{path}`")]
    MissingTypename { field: String, path: String },

    #[error("unsupported selection on field `{field}`: {reason}")]
    UnsupportedSelection { field: String, reason: &'static str },
}
