// SPDX-License-Identifier: PMPL-1.0-or-later
//! Weft Normalizer
//!
//! Turns one graph-shaped response into a `Payload`: flat records keyed by
//! identifier, plus the deferred, streamed, module and cross-partition work
//! the executor must finish later. The executor only depends on the
//! `Normalizer` trait; `ResponseNormalizer` is the implementation used by
//! default.

pub mod error;
pub mod normalize;
pub mod options;

pub use error::NormalizeError;
pub use normalize::ResponseNormalizer;
pub use options::{default_get_data_id, GetDataId, NormalizeOptions};

use serde_json::Value;
use weft_record::NormalizationSelector;
use weft_store::Payload;

/// Normalizes one response against a selector.
///
/// `response` is the full response object (`data`, `errors`, `extensions`);
/// the root record of `selector` is created with `typename`.
pub trait Normalizer: Send + Sync {
    fn normalize(
        &self,
        response: &Value,
        selector: &NormalizationSelector,
        typename: &str,
        options: &NormalizeOptions,
    ) -> Result<Payload, NormalizeError>;
}
