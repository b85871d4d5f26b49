// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Record model for the MendDB repository abstraction.
//
// Records are schemaless documents: an identifier plus a JSON object of fields.
// Integrity rules (required fields, enumerated domains, foreign keys) are
// applied by the detector, never by the repository.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Name of the identifier field when a record is rendered as a JSON document.
pub const ID_FIELD: &str = "_id";

/// Identifier of a record within a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub String);

impl RecordId {
    /// Create a record identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single stored document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Identifier, unique within its collection.
    pub id: RecordId,
    /// Field values, excluding the identifier.
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create an empty record.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Build a record from an identifier and a JSON object of fields.
    pub fn from_json(id: impl Into<RecordId>, fields: Value) -> Result<Self, StoreError> {
        match fields {
            Value::Object(fields) => Ok(Self {
                id: id.into(),
                fields,
            }),
            other => Err(StoreError::Serialization(format!(
                "record fields must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Build a record from a JSON document carrying its identifier in `_id`.
    pub fn from_document(document: Value) -> Result<Self, StoreError> {
        let Value::Object(mut fields) = document else {
            return Err(StoreError::Serialization(
                "document must be a JSON object".to_string(),
            ));
        };
        let id = match fields.remove(ID_FIELD) {
            Some(Value::String(s)) => RecordId(s),
            Some(Value::Number(n)) => RecordId(n.to_string()),
            Some(other) => {
                return Err(StoreError::Serialization(format!(
                    "unsupported {} value: {}",
                    ID_FIELD, other
                )))
            }
            None => {
                return Err(StoreError::Serialization(format!(
                    "document is missing {}",
                    ID_FIELD
                )))
            }
        };
        Ok(Self { id, fields })
    }

    /// Render the record as a JSON document with `_id` included.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::with_capacity(self.fields.len() + 1);
        doc.insert(ID_FIELD.to_string(), Value::String(self.id.0.clone()));
        for (k, v) in &self.fields {
            doc.insert(k.clone(), v.clone());
        }
        Value::Object(doc)
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Read a field.
    pub fn field(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// True when the field is absent, null, or the empty string.
    pub fn is_blank(&self, field: &str) -> bool {
        is_blank(self.fields.get(field))
    }
}

/// A value counts as blank when it is absent, null, or the empty string.
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Predicate for [`crate::Repository::scan`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every record.
    All,
    /// Records whose field is absent, null, or empty.
    Blank(String),
    /// Records whose field holds a non-blank value.
    NotBlank(String),
    /// Records whose field is not one of `values`. An absent field matches.
    NotIn { field: String, values: Vec<Value> },
}

impl Filter {
    /// Evaluate the filter against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::All => true,
            Filter::Blank(field) => record.is_blank(field),
            Filter::NotBlank(field) => !record.is_blank(field),
            Filter::NotIn { field, values } => match record.field(field) {
                Some(v) => !values.contains(v),
                None => true,
            },
        }
    }
}

/// Result row of [`crate::Repository::group_by`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordGroup {
    /// The shared field value.
    pub key: Value,
    /// Members in discovery order.
    pub ids: Vec<RecordId>,
}

impl RecordGroup {
    /// Number of records sharing the key.
    pub fn count(&self) -> usize {
        self.ids.len()
    }
}

/// An index definition on a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name.
    pub name: String,
    /// Indexed fields, in key order.
    pub fields: Vec<String>,
}

impl IndexSpec {
    /// A single-field ascending index named `<field>_1`.
    pub fn single(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: format!("{}_1", field),
            fields: vec![field],
        }
    }

    /// Whether `field` appears anywhere in this index's key.
    pub fn covers(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blank_values() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&Value::Null)));
        assert!(is_blank(Some(&json!(""))));
        assert!(!is_blank(Some(&json!("x"))));
        assert!(!is_blank(Some(&json!(0))));
    }

    #[test]
    fn test_document_conversion_keeps_id() {
        let record = Record::from_document(json!({"_id": "u1", "email": "a@x.com"})).unwrap();
        assert_eq!(record.id, RecordId::new("u1"));
        assert!(!record.fields.contains_key(ID_FIELD));

        let doc = record.to_document();
        assert_eq!(doc["_id"], "u1");
        assert_eq!(doc["email"], "a@x.com");
    }

    #[test]
    fn test_document_without_id_is_rejected() {
        let err = Record::from_document(json!({"email": "a@x.com"})).unwrap_err();
        assert!(err.to_string().contains("_id"));
    }

    #[test]
    fn test_not_in_matches_absent_field() {
        let filter = Filter::NotIn {
            field: "status".into(),
            values: vec![json!("pending"), json!("completed")],
        };
        assert!(filter.matches(&Record::new("o1")));
        assert!(filter.matches(&Record::new("o2").with_field("status", "bogus")));
        assert!(!filter.matches(&Record::new("o3").with_field("status", "pending")));
    }

    #[test]
    fn test_index_covers_compound_key() {
        let spec = IndexSpec {
            name: "category_1_price_1".into(),
            fields: vec!["category".into(), "price".into()],
        };
        assert!(spec.covers("price"));
        assert!(!spec.covers("name"));
        assert_eq!(IndexSpec::single("name").name, "name_1");
    }
}
