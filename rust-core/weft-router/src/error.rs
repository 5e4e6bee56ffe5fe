// SPDX-License-Identifier: PMPL-1.0-or-later
//! Router error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("invalid router configuration: {0}")]
    InvalidConfig(String),

    #[error("a network factory is required")]
    MissingNetwork,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
