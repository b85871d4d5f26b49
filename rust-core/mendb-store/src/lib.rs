// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// MendDB Repository Abstraction
//
// The detector and fixer never talk to a storage engine directly. They depend
// on the `Repository` trait defined here: list collections, count, group,
// scan, point reads, insert/update/delete by identifier, and index listing.
// Any document store that can answer those questions can be healed.
//
// # Modules
//
// - [`backend`] -- The `Repository` trait.
// - [`record`] -- Schemaless records, identifiers, scan filters, index specs.
// - [`error`] -- The `StoreError` enum covering all repository failure modes.
// - [`memory`] -- An insertion-ordered in-memory repository for tests, benches
//   and the demo binary.
// - [`metrics`] -- A transparent wrapper that counts reads and writes.
//
// # Example
//
// ```rust
// use mendb_store::{InMemoryRepository, MetricsRepository, Record, Repository};
// use serde_json::json;
//
// # tokio_test::block_on(async {
// let metered = MetricsRepository::new(InMemoryRepository::new());
//
// metered
//     .insert("users", Record::from_json("u1", json!({"email": "a@x.com"})).unwrap())
//     .await
//     .unwrap();
//
// let found = metered.get("users", &"u1".into()).await.unwrap().unwrap();
// assert_eq!(found.field("email"), Some(&json!("a@x.com")));
// assert_eq!(metered.stats().await.writes, 1);
// # });
// ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod record;

pub use backend::Repository;
pub use error::StoreError;
pub use memory::InMemoryRepository;
pub use metrics::{MetricsRepository, RepositoryStats};
pub use record::{is_blank, Filter, IndexSpec, Record, RecordGroup, RecordId, ID_FIELD};
