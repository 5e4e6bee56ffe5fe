// SPDX-License-Identifier: PMPL-1.0-or-later
//! Normalization options.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use weft_record::{DataId, PartitionId};

/// Picks the identifier of a response object given its typename.
pub type GetDataId = Arc<dyn Fn(&Map<String, Value>, &str) -> Option<DataId> + Send + Sync>;

/// Identifier from the object's `id` field (string or number).
pub fn default_get_data_id() -> GetDataId {
    Arc::new(|object, _typename| match object.get("id") {
        Some(Value::String(id)) => Some(DataId::new(id.clone())),
        Some(Value::Number(id)) => Some(DataId::new(id.to_string())),
        _ => None,
    })
}

#[derive(Clone)]
pub struct NormalizeOptions {
    /// Partition the produced records belong to.
    pub partition: PartitionId,
    pub get_data_id: GetDataId,
    /// Path of the selector's record inside the overall response.
    pub path: Vec<String>,
    /// Write null for fields absent from the response instead of skipping them.
    pub treat_missing_fields_as_null: bool,
    pub should_process_client_components: bool,
}

impl NormalizeOptions {
    pub fn new(partition: PartitionId, get_data_id: GetDataId) -> Self {
        Self {
            partition,
            get_data_id,
            path: Vec::new(),
            treat_missing_fields_as_null: false,
            should_process_client_components: false,
        }
    }

    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::new(PartitionId::default(), default_get_data_id())
    }
}

impl fmt::Debug for NormalizeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizeOptions")
            .field("partition", &self.partition)
            .field("path", &self.path)
            .field("treat_missing_fields_as_null", &self.treat_missing_fields_as_null)
            .field("should_process_client_components", &self.should_process_client_components)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_get_data_id_accepts_numbers() {
        let get_data_id = default_get_data_id();
        let object = json!({"id": 7});
        assert_eq!(get_data_id(object.as_object().unwrap(), "User"), Some(DataId::new("7")));
        let object = json!({"name": "x"});
        assert_eq!(get_data_id(object.as_object().unwrap(), "User"), None);
    }
}
