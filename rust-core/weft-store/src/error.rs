// SPDX-License-Identifier: PMPL-1.0-or-later
//! Store error types.

use thiserror::Error;
use weft_record::RecordError;

/// Errors raised while staging or applying changes to a store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    #[error("no field handler registered for handle `{0}`")]
    MissingHandler(String),

    #[error("optimistic update {0} is already staged")]
    DuplicateUpdate(u64),
}
