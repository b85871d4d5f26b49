// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Metrics-collecting wrapper for MendDB repositories.
//
// Wraps any `Repository` and transparently counts reads, writes and failures
// together with cumulative latency. The binary logs these figures at shutdown;
// tests use the write counter to prove that dry-run healing never mutates.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::backend::Repository;
use crate::error::StoreError;
use crate::record::{Filter, IndexSpec, Record, RecordGroup, RecordId};

/// Accumulated statistics for a repository.
///
/// All counters are monotonically increasing for the lifetime of the
/// [`MetricsRepository`] that owns them, unless explicitly reset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepositoryStats {
    /// Read calls (`ping`, `list_collections`, `count`, `group_by`, `scan`,
    /// `get`, `list_indexes`).
    pub reads: u64,
    /// Mutating calls (`insert`, `update_field`, `delete`, `create_index`).
    pub writes: u64,
    /// Calls of either kind that returned an error.
    pub failures: u64,
    /// Cumulative wall-clock latency of all reads, in milliseconds.
    pub read_latency_sum_ms: f64,
    /// Cumulative wall-clock latency of all writes, in milliseconds.
    pub write_latency_sum_ms: f64,
    /// Records returned by `scan` and `get`.
    pub records_read: u64,
}

#[derive(Clone, Copy)]
enum OpKind {
    Read,
    Write,
}

/// A repository wrapper that collects operation metrics.
///
/// # Example
///
/// ```rust
/// use mendb_store::{InMemoryRepository, MetricsRepository, Record, Repository};
///
/// # tokio_test::block_on(async {
/// let metered = MetricsRepository::new(InMemoryRepository::new());
///
/// metered.insert("users", Record::new("u1")).await.unwrap();
/// metered.get("users", &"u1".into()).await.unwrap();
///
/// let stats = metered.stats().await;
/// assert_eq!(stats.writes, 1);
/// assert_eq!(stats.reads, 1);
/// # });
/// ```
pub struct MetricsRepository<R: Repository> {
    inner: R,
    stats: Arc<RwLock<RepositoryStats>>,
}

impl<R: Repository> MetricsRepository<R> {
    /// Wrap `inner` with metrics collection.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            stats: Arc::new(RwLock::new(RepositoryStats::default())),
        }
    }

    /// Return a snapshot of the current statistics.
    pub async fn stats(&self) -> RepositoryStats {
        self.stats.read().await.clone()
    }

    /// Reset all statistics to zero.
    pub async fn reset_stats(&self) {
        let mut s = self.stats.write().await;
        *s = RepositoryStats::default();
    }

    /// Return a reference to the inner repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn observe<T>(
        &self,
        kind: OpKind,
        started: Instant,
        result: &Result<T, StoreError>,
        records: u64,
    ) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut s = self.stats.write().await;
        match kind {
            OpKind::Read => {
                s.reads += 1;
                s.read_latency_sum_ms += elapsed_ms;
            }
            OpKind::Write => {
                s.writes += 1;
                s.write_latency_sum_ms += elapsed_ms;
            }
        }
        if result.is_err() {
            s.failures += 1;
        } else {
            s.records_read += records;
        }
    }
}

#[async_trait]
impl<R: Repository> Repository for MetricsRepository<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self.inner.ping().await;
        self.observe(OpKind::Read, start, &result, 0).await;
        result
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let start = Instant::now();
        let result = self.inner.list_collections().await;
        self.observe(OpKind::Read, start, &result, 0).await;
        result
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let start = Instant::now();
        let result = self.inner.count(collection).await;
        self.observe(OpKind::Read, start, &result, 0).await;
        result
    }

    async fn group_by(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Vec<RecordGroup>, StoreError> {
        let start = Instant::now();
        let result = self.inner.group_by(collection, field).await;
        self.observe(OpKind::Read, start, &result, 0).await;
        result
    }

    async fn scan(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, StoreError> {
        let start = Instant::now();
        let result = self.inner.scan(collection, filter, limit).await;
        let records = result.as_ref().map(|r| r.len() as u64).unwrap_or(0);
        self.observe(OpKind::Read, start, &result, records).await;
        result
    }

    async fn get(&self, collection: &str, id: &RecordId) -> Result<Option<Record>, StoreError> {
        let start = Instant::now();
        let result = self.inner.get(collection, id).await;
        let records = matches!(result, Ok(Some(_))) as u64;
        self.observe(OpKind::Read, start, &result, records).await;
        result
    }

    async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self.inner.insert(collection, record).await;
        self.observe(OpKind::Write, start, &result, 0).await;
        result
    }

    async fn update_field(
        &self,
        collection: &str,
        id: &RecordId,
        field: &str,
        value: Value,
    ) -> Result<bool, StoreError> {
        let start = Instant::now();
        let result = self.inner.update_field(collection, id, field, value).await;
        self.observe(OpKind::Write, start, &result, 0).await;
        result
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> Result<bool, StoreError> {
        let start = Instant::now();
        let result = self.inner.delete(collection, id).await;
        self.observe(OpKind::Write, start, &result, 0).await;
        result
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        let start = Instant::now();
        let result = self.inner.list_indexes(collection).await;
        self.observe(OpKind::Read, start, &result, 0).await;
        result
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<(), StoreError> {
        let start = Instant::now();
        let result = self.inner.create_index(collection, index).await;
        self.observe(OpKind::Write, start, &result, 0).await;
        result
    }
}
