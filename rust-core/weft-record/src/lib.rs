// SPDX-License-Identifier: PMPL-1.0-or-later
//! Weft Record
//!
//! Normalized record primitives shared by every weft crate:
//!
//! - **Identifiers** — `DataId`, `PartitionId`, `RequestIdentifier` and the
//!   client-id conventions (`client:root`, derived and unique client ids).
//! - **Records** — copy-on-write `Record`s held in a per-partition
//!   `RecordSource`.
//! - **Selections** — the normalization AST the normalizer, reader and checker
//!   walk, plus storage-key and variable helpers.
//! - **Selectors** — `NormalizationSelector`, `ReaderSelector` and the
//!   `OperationDescriptor` that ties a request to its root selector.

pub mod error;
pub mod ids;
pub mod record;
pub mod selection;
pub mod selector;
pub mod source;
pub mod storage_key;
pub mod variables;

pub use error::RecordError;
pub use ids::{
    generate_client_id, generate_unique_client_id, is_client_id, DataId, PartitionId,
    RequestIdentifier, CLIENT_ID_PREFIX, ROOT_ID, ROOT_TYPE,
};
pub use record::{FieldValue, Record};
pub use selection::{
    ActorChange, Argument, ArgumentDefinition, ArgumentValue, ClientComponent, Defer, InlineFragment, LinkedField,
    ModuleImport, NodeKind, NormalizationNode, ScalarField, Selection, Stream,
};
pub use selector::{
    CacheConfig, ConcreteRequest, OperationDescriptor, OperationKind, ReaderSelector,
    RequestDescriptor, RequestParameters, NormalizationSelector,
};
pub use source::{RecordSource, RecordState, RecordStatus};
pub use storage_key::{format_storage_key, get_argument_values, get_handle_storage_key, get_storage_key};
pub use variables::{arguments_to_variables, get_local_variables, Variables};
