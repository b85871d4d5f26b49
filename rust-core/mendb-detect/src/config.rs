// SPDX-License-Identifier: PMPL-1.0-or-later
//! Detector rule tables.
//!
//! Every check reads its targets from here rather than hard-coding them. The
//! defaults describe the classic `users` / `orders` / `products` layout.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::DetectError;

/// Default pause between detection cycles.
pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(30);

/// A field whose values must be unique within a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UniqueRule {
    pub collection: String,
    pub field: String,
}

/// A child foreign key that must match a parent key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferenceRule {
    pub collection: String,
    pub foreign_key: String,
    pub parent_collection: String,
    pub parent_key: String,
}

/// Fields every record of a collection must carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequiredRule {
    pub collection: String,
    pub fields: Vec<String>,
}

/// An enumerated field and the value used to repair it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainRule {
    pub collection: String,
    pub field: String,
    pub allowed: Vec<Value>,
    pub default: Value,
}

/// Indexes a large collection should have.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexRule {
    pub collection: String,
    /// Only collections with more documents than this are inspected
    pub threshold: u64,
    pub recommended: Vec<String>,
}

/// Per-check enable flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnabledChecks {
    pub duplicates: bool,
    pub orphans: bool,
    pub missing_fields: bool,
    pub invalid_values: bool,
    pub missing_indexes: bool,
}

impl Default for EnabledChecks {
    fn default() -> Self {
        Self {
            duplicates: true,
            orphans: true,
            missing_fields: true,
            invalid_values: true,
            missing_indexes: true,
        }
    }
}

/// Configuration for the detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Pause between cycles
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub enabled: EnabledChecks,
    /// Cap on findings per check per cycle; `None` is unlimited
    pub max_findings_per_check: Option<usize>,
    pub unique: Vec<UniqueRule>,
    pub references: Vec<ReferenceRule>,
    pub required: Vec<RequiredRule>,
    pub domains: Vec<DomainRule>,
    pub indexes: Vec<IndexRule>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_DETECTION_INTERVAL,
            enabled: EnabledChecks::default(),
            max_findings_per_check: None,
            unique: vec![UniqueRule {
                collection: "users".to_string(),
                field: "email".to_string(),
            }],
            references: vec![ReferenceRule {
                collection: "orders".to_string(),
                foreign_key: "user_email".to_string(),
                parent_collection: "users".to_string(),
                parent_key: "email".to_string(),
            }],
            required: vec![RequiredRule {
                collection: "users".to_string(),
                fields: vec!["email".to_string(), "name".to_string()],
            }],
            domains: vec![DomainRule {
                collection: "orders".to_string(),
                field: "status".to_string(),
                allowed: vec![
                    json!("pending"),
                    json!("processing"),
                    json!("completed"),
                    json!("cancelled"),
                ],
                default: json!("pending"),
            }],
            indexes: vec![IndexRule {
                collection: "products".to_string(),
                threshold: 100,
                recommended: vec![
                    "category".to_string(),
                    "price".to_string(),
                    "name".to_string(),
                ],
            }],
        }
    }
}

impl DetectorConfig {
    /// Reject rule tables that could never produce a meaningful finding.
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.interval.is_zero() {
            return Err(DetectError::InvalidConfig(
                "detection interval must be non-zero".to_string(),
            ));
        }
        if self.max_findings_per_check == Some(0) {
            return Err(DetectError::InvalidConfig(
                "max_findings_per_check must be at least 1 when set".to_string(),
            ));
        }
        for rule in &self.domains {
            if !rule.allowed.contains(&rule.default) {
                return Err(DetectError::InvalidConfig(format!(
                    "default {} for {}.{} is not an allowed value",
                    rule.default, rule.collection, rule.field
                )));
            }
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DetectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.required[0].fields, vec!["email", "name"]);
        assert_eq!(config.indexes[0].threshold, 100);
    }

    #[test]
    fn test_default_outside_domain_is_rejected() {
        let mut config = DetectorConfig::default();
        config.domains[0].default = json!("shipped");
        assert!(matches!(
            config.validate(),
            Err(DetectError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: DetectorConfig =
            serde_json::from_value(json!({"interval": 5, "enabled": {"orphans": false}})).unwrap();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert!(!config.enabled.orphans);
        assert!(config.enabled.duplicates);
        assert_eq!(config.unique.len(), 1);
    }
}
