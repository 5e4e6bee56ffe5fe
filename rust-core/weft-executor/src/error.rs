// SPDX-License-Identifier: PMPL-1.0-or-later
//! Executor error types.

use serde_json::Value;
use thiserror::Error;

use weft_normalizer::NormalizeError;
use weft_record::Variables;
use weft_store::StoreError;

/// Errors that end an execution. Every variant is fatal: the executor is
/// cancelled before the error is emitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    /// A response part carried an `errors` key but no data.
    #[error("No data returned for operation `{operation}`, got error(s):\n{messages}\n\nSee the error `errors` property for more information.")]
    NoData {
        operation: String,
        messages: String,
        errors: Value,
        variables: Variables,
    },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("module load failed: {0}")]
    ModuleLoad(String),

    #[error("response source error: {0}")]
    Source(String),
}

impl ExecutorError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        ExecutorError::Invariant(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_data_message_names_operation() {
        let error = ExecutorError::NoData {
            operation: "UserQuery".into(),
            messages: "boom".into(),
            errors: json!([{"message": "boom"}]),
            variables: Variables::new(),
        };
        let message = error.to_string();
        assert!(message.contains("`UserQuery`"));
        assert!(message.contains("boom"));
    }
}
