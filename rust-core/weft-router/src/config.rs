// SPDX-License-Identifier: PMPL-1.0-or-later
//! Router configuration.

use serde::{Deserialize, Serialize};

use weft_record::PartitionId;

use crate::error::RouterError;

/// Serializable router settings. Collaborators that cannot be serialized
/// (networks, stores, schedulers) are supplied through the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Fields absent from a response are written as null instead of being
    /// left missing.
    pub treat_missing_fields_as_null: bool,
    pub should_process_client_components: bool,
    /// Running on a server; reported through `PartitionRouter::is_server`.
    pub is_server: bool,
    /// Report owners affected by optimistic updates to the tracker.
    pub track_optimistic_updates: bool,
    /// Partition used when callers do not name one.
    pub default_partition: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            treat_missing_fields_as_null: false,
            should_process_client_components: false,
            is_server: false,
            track_optimistic_updates: false,
            default_partition: "default".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn from_json_str(json: &str) -> Result<Self, RouterError> {
        let config: RouterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.default_partition.trim().is_empty() {
            return Err(RouterError::InvalidConfig(
                "default_partition must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_partition_id(&self) -> PartitionId {
        PartitionId::new(self.default_partition.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert!(!config.treat_missing_fields_as_null);
        assert!(!config.is_server);
        assert_eq!(config.default_partition_id(), PartitionId::new("default"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config = RouterConfig::from_json_str(r#"{"is_server": true}"#).unwrap();
        assert!(config.is_server);
        assert_eq!(config.default_partition, "default");
    }

    #[test]
    fn test_empty_partition_rejected() {
        let error = RouterConfig::from_json_str(r#"{"default_partition": "  "}"#).unwrap_err();
        assert!(matches!(error, RouterError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_json() {
        let error = RouterConfig::from_json_str("{").unwrap_err();
        assert!(matches!(error, RouterError::Serialization(_)));
    }
}
