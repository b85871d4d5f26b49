// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory repository for MendDB.
//
// Collections live in a `BTreeMap` wrapped in a tokio `RwLock`. Records inside
// a collection are kept in a `Vec` so insertion order doubles as discovery
// order for grouping and scans. Intended for testing, development, benches and
// the demo binary.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::backend::Repository;
use crate::error::StoreError;
use crate::record::{is_blank, Filter, IndexSpec, Record, RecordGroup, RecordId};

#[derive(Debug, Clone, Default)]
struct Collection {
    records: Vec<Record>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    fn position(&self, id: &RecordId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }
}

/// An in-memory repository backed by insertion-ordered collections.
///
/// Cloning is cheap and clones share the same data, so a test can keep a
/// handle for inspection while the detector and fixer own others.
///
/// # Example
///
/// ```rust
/// use mendb_store::{InMemoryRepository, Repository};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let repo = InMemoryRepository::new();
/// repo.insert_documents("users", vec![
///     json!({"_id": "u1", "email": "a@x.com"}),
///     json!({"_id": "u2", "email": "a@x.com"}),
/// ]).await.unwrap();
///
/// let groups = repo.group_by("users", "email").await.unwrap();
/// assert_eq!(groups[0].count(), 2);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    data: Arc<RwLock<BTreeMap<String, Collection>>>,
    available: Arc<AtomicBool>,
}

impl InMemoryRepository {
    /// Create a new, empty repository.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Build a repository from `{ "<collection>": [ { "_id": ..., ... } ] }`.
    pub async fn from_json(seed: Value) -> Result<Self, StoreError> {
        let Value::Object(collections) = seed else {
            return Err(StoreError::Serialization(
                "seed must be an object of collections".to_string(),
            ));
        };

        let repo = Self::new();
        for (name, docs) in collections {
            let Value::Array(docs) = docs else {
                return Err(StoreError::Serialization(format!(
                    "collection {} must be an array of documents",
                    name
                )));
            };
            let loaded = repo.insert_documents(&name, docs).await?;
            tracing::debug!(collection = %name, records = loaded, "Seeded collection");
        }
        Ok(repo)
    }

    /// Load a JSON seed file (see [`InMemoryRepository::from_json`]).
    pub async fn load_json_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        let seed: Value = serde_json::from_slice(&raw)?;
        Self::from_json(seed).await
    }

    /// Insert several `_id`-carrying JSON documents into one collection.
    pub async fn insert_documents(
        &self,
        collection: &str,
        docs: Vec<Value>,
    ) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for doc in docs {
            self.insert(collection, Record::from_document(doc)?).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Simulate connectivity loss (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Ordered copy of every collection's records.
    pub async fn dump(&self) -> BTreeMap<String, Vec<Record>> {
        self.data
            .read()
            .await
            .iter()
            .map(|(name, c)| (name.clone(), c.records.clone()))
            .collect()
    }

    /// Records of one collection in discovery order (empty if absent).
    pub async fn records(&self, collection: &str) -> Vec<Record> {
        self.data
            .read()
            .await
            .get(collection)
            .map(|c| c.records.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory repository marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        Ok(self.data.read().await.keys().cloned().collect())
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let map = self.data.read().await;
        Ok(map.get(collection).map(|c| c.records.len() as u64).unwrap_or(0))
    }

    async fn group_by(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Vec<RecordGroup>, StoreError> {
        self.check_available()?;
        let map = self.data.read().await;
        let Some(coll) = map.get(collection) else {
            return Ok(Vec::new());
        };

        // Value is not Hash; its canonical JSON text is.
        let mut slots: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<RecordGroup> = Vec::new();
        for record in &coll.records {
            let Some(value) = record.field(field).filter(|v| !is_blank(Some(v))) else {
                continue;
            };
            let slot = *slots.entry(value.to_string()).or_insert_with(|| {
                groups.push(RecordGroup {
                    key: value.clone(),
                    ids: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].ids.push(record.id.clone());
        }
        Ok(groups)
    }

    async fn scan(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        self.check_available()?;
        let map = self.data.read().await;
        let Some(coll) = map.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<Record>, StoreError> {
        self.check_available()?;
        let map = self.data.read().await;
        Ok(map
            .get(collection)
            .and_then(|c| c.records.iter().find(|r| &r.id == id))
            .cloned())
    }

    async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
        self.check_available()?;
        let mut map = self.data.write().await;
        let coll = map.entry(collection.to_string()).or_default();
        if coll.position(&record.id).is_some() {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                id: record.id.to_string(),
            });
        }
        coll.records.push(record);
        Ok(())
    }

    async fn update_field(
        &self,
        collection: &str,
        id: &RecordId,
        field: &str,
        value: Value,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut map = self.data.write().await;
        let Some(coll) = map.get_mut(collection) else {
            return Ok(false);
        };
        match coll.records.iter_mut().find(|r| &r.id == id) {
            Some(record) => {
                record.fields.insert(field.to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut map = self.data.write().await;
        let Some(coll) = map.get_mut(collection) else {
            return Ok(false);
        };
        match coll.position(id) {
            Some(pos) => {
                coll.records.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        self.check_available()?;
        let map = self.data.read().await;
        Ok(map
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError> {
        self.check_available()?;
        let mut map = self.data.write().await;
        let coll = map.entry(collection.to_string()).or_default();
        if !coll.indexes.iter().any(|i| i.name == index.name) {
            coll.indexes.push(index);
        }
        Ok(())
    }
}
