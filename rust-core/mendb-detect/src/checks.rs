// SPDX-License-Identifier: PMPL-1.0-or-later
//! Built-in integrity checks.
//!
//! A check inspects the repository and returns findings; it never touches the
//! shared state. The detector feeds findings into the state and contains any
//! error a check returns, so one broken check cannot stall the others.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use mendb_state::{Anomaly, AnomalyKind};
use mendb_store::{Filter, RecordId, Repository};

use crate::config::{DetectorConfig, DomainRule, IndexRule, ReferenceRule, RequiredRule, UniqueRule};
use crate::DetectError;

/// Context shared by every check during one detection cycle.
///
/// Created fresh per cycle and dropped at its end, so nothing flagged here
/// leaks into the next cycle.
#[derive(Debug, Default)]
pub struct CycleScope {
    cycle: u64,
    collections: HashSet<String>,
    flagged: HashSet<(String, RecordId, String)>,
}

impl CycleScope {
    pub fn new(cycle: u64, collections: impl IntoIterator<Item = String>) -> Self {
        Self {
            cycle,
            collections: collections.into_iter().collect(),
            flagged: HashSet::new(),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Whether `collection` existed when the cycle started.
    pub fn has_collection(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }

    /// Mark `(collection, id, field)` as reported. Returns `false` if it
    /// already was, keyed by record identifier rather than record contents.
    pub fn flag(&mut self, collection: &str, id: &RecordId, field: &str) -> bool {
        self.flagged
            .insert((collection.to_string(), id.clone(), field.to_string()))
    }

    pub fn flagged_count(&self) -> usize {
        self.flagged.len()
    }
}

/// An integrity check run once per detection cycle.
#[async_trait]
pub trait Check: Send + Sync {
    /// Check name, used in logs and metric labels
    fn name(&self) -> &str;

    /// Kind of anomaly this check produces
    fn kind(&self) -> AnomalyKind;

    /// Inspect the repository and return this cycle's findings.
    async fn run(
        &self,
        repository: &dyn Repository,
        scope: &mut CycleScope,
    ) -> Result<Vec<Anomaly>, DetectError>;
}

/// How many more findings a check may emit.
fn remaining(limit: Option<usize>, found: usize) -> Option<usize> {
    limit.map(|l| l.saturating_sub(found))
}

fn exhausted(limit: Option<usize>, found: usize) -> bool {
    limit.is_some_and(|l| found >= l)
}

fn skip_missing(check: &str, collection: &str, scope: &CycleScope) -> bool {
    if scope.has_collection(collection) {
        return false;
    }
    debug!(check, collection, "Collection does not exist, skipping rule");
    true
}

/// Records sharing a value that must be unique.
pub struct DuplicateCheck {
    rules: Vec<UniqueRule>,
    limit: Option<usize>,
}

impl DuplicateCheck {
    pub fn new(rules: Vec<UniqueRule>, limit: Option<usize>) -> Self {
        Self { rules, limit }
    }
}

#[async_trait]
impl Check for DuplicateCheck {
    fn name(&self) -> &str {
        "duplicates"
    }

    fn kind(&self) -> AnomalyKind {
        AnomalyKind::DuplicateRecord
    }

    async fn run(
        &self,
        repository: &dyn Repository,
        scope: &mut CycleScope,
    ) -> Result<Vec<Anomaly>, DetectError> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if skip_missing(self.name(), &rule.collection, scope) {
                continue;
            }
            let groups = repository.group_by(&rule.collection, &rule.field).await?;
            for group in groups.into_iter().filter(|g| g.count() > 1) {
                if exhausted(self.limit, findings.len()) {
                    return Ok(findings);
                }
                findings.push(Anomaly::duplicate(
                    &rule.collection,
                    &rule.field,
                    group.key,
                    group.ids,
                ));
            }
        }
        Ok(findings)
    }
}

/// Child records whose foreign key matches no parent.
pub struct OrphanCheck {
    rules: Vec<ReferenceRule>,
    limit: Option<usize>,
}

impl OrphanCheck {
    pub fn new(rules: Vec<ReferenceRule>, limit: Option<usize>) -> Self {
        Self { rules, limit }
    }
}

#[async_trait]
impl Check for OrphanCheck {
    fn name(&self) -> &str {
        "orphans"
    }

    fn kind(&self) -> AnomalyKind {
        AnomalyKind::OrphanedDocument
    }

    async fn run(
        &self,
        repository: &dyn Repository,
        scope: &mut CycleScope,
    ) -> Result<Vec<Anomaly>, DetectError> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            // Without parents every child would look orphaned
            if skip_missing(self.name(), &rule.parent_collection, scope)
                || skip_missing(self.name(), &rule.collection, scope)
            {
                continue;
            }

            let parents: HashSet<String> = repository
                .scan(
                    &rule.parent_collection,
                    &Filter::NotBlank(rule.parent_key.clone()),
                    None,
                )
                .await?
                .iter()
                .filter_map(|r| r.field(&rule.parent_key))
                .map(|v| v.to_string())
                .collect();

            let children = repository
                .scan(
                    &rule.collection,
                    &Filter::NotBlank(rule.foreign_key.clone()),
                    None,
                )
                .await?;

            for child in children {
                let Some(value) = child.field(&rule.foreign_key) else {
                    continue;
                };
                if parents.contains(&value.to_string()) {
                    continue;
                }
                if exhausted(self.limit, findings.len()) {
                    return Ok(findings);
                }
                findings.push(Anomaly::orphan(
                    &rule.collection,
                    child.id.clone(),
                    &rule.foreign_key,
                    value.clone(),
                    &rule.parent_collection,
                    &rule.parent_key,
                ));
            }
        }
        Ok(findings)
    }
}

/// Records lacking a required field, one finding per (record, field).
pub struct MissingFieldCheck {
    rules: Vec<RequiredRule>,
    limit: Option<usize>,
}

impl MissingFieldCheck {
    pub fn new(rules: Vec<RequiredRule>, limit: Option<usize>) -> Self {
        Self { rules, limit }
    }
}

#[async_trait]
impl Check for MissingFieldCheck {
    fn name(&self) -> &str {
        "missing_fields"
    }

    fn kind(&self) -> AnomalyKind {
        AnomalyKind::MissingField
    }

    async fn run(
        &self,
        repository: &dyn Repository,
        scope: &mut CycleScope,
    ) -> Result<Vec<Anomaly>, DetectError> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if skip_missing(self.name(), &rule.collection, scope) {
                continue;
            }
            for field in &rule.fields {
                if exhausted(self.limit, findings.len()) {
                    return Ok(findings);
                }
                let records = repository
                    .scan(
                        &rule.collection,
                        &Filter::Blank(field.clone()),
                        remaining(self.limit, findings.len()),
                    )
                    .await?;
                for record in records {
                    if scope.flag(&rule.collection, &record.id, field) {
                        findings.push(Anomaly::missing_field(
                            &rule.collection,
                            record.id,
                            field,
                        ));
                    }
                }
            }
        }
        Ok(findings)
    }
}

/// Enumerated fields holding a value outside their domain.
pub struct DomainCheck {
    rules: Vec<DomainRule>,
    limit: Option<usize>,
}

impl DomainCheck {
    pub fn new(rules: Vec<DomainRule>, limit: Option<usize>) -> Self {
        Self { rules, limit }
    }
}

#[async_trait]
impl Check for DomainCheck {
    fn name(&self) -> &str {
        "invalid_values"
    }

    fn kind(&self) -> AnomalyKind {
        AnomalyKind::InvalidData
    }

    async fn run(
        &self,
        repository: &dyn Repository,
        scope: &mut CycleScope,
    ) -> Result<Vec<Anomaly>, DetectError> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if skip_missing(self.name(), &rule.collection, scope) {
                continue;
            }
            if exhausted(self.limit, findings.len()) {
                break;
            }
            let filter = Filter::NotIn {
                field: rule.field.clone(),
                values: rule.allowed.clone(),
            };
            let records = repository
                .scan(
                    &rule.collection,
                    &filter,
                    remaining(self.limit, findings.len()),
                )
                .await?;
            for record in records {
                let observed = record.field(&rule.field).cloned();
                findings.push(Anomaly::invalid_value(
                    &rule.collection,
                    record.id,
                    &rule.field,
                    observed,
                    rule.allowed.clone(),
                    rule.default.clone(),
                ));
            }
        }
        Ok(findings)
    }
}

/// Large collections missing a recommended index.
pub struct IndexCheck {
    rules: Vec<IndexRule>,
    limit: Option<usize>,
}

impl IndexCheck {
    pub fn new(rules: Vec<IndexRule>, limit: Option<usize>) -> Self {
        Self { rules, limit }
    }
}

#[async_trait]
impl Check for IndexCheck {
    fn name(&self) -> &str {
        "missing_indexes"
    }

    fn kind(&self) -> AnomalyKind {
        AnomalyKind::SlowQuery
    }

    async fn run(
        &self,
        repository: &dyn Repository,
        scope: &mut CycleScope,
    ) -> Result<Vec<Anomaly>, DetectError> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if skip_missing(self.name(), &rule.collection, scope) {
                continue;
            }
            let document_count = repository.count(&rule.collection).await?;
            if document_count <= rule.threshold {
                continue;
            }
            let indexes = repository.list_indexes(&rule.collection).await?;
            for field in &rule.recommended {
                if indexes.iter().any(|index| index.covers(field)) {
                    continue;
                }
                if exhausted(self.limit, findings.len()) {
                    return Ok(findings);
                }
                findings.push(Anomaly::missing_index(
                    &rule.collection,
                    field,
                    document_count,
                    rule.threshold,
                ));
            }
        }
        Ok(findings)
    }
}

/// The built-in checks enabled by `config`, in a fixed order.
pub fn default_checks(config: &DetectorConfig) -> Vec<Arc<dyn Check>> {
    let limit = config.max_findings_per_check;
    let mut checks: Vec<Arc<dyn Check>> = Vec::new();
    if config.enabled.duplicates {
        checks.push(Arc::new(DuplicateCheck::new(config.unique.clone(), limit)));
    }
    if config.enabled.orphans {
        checks.push(Arc::new(OrphanCheck::new(config.references.clone(), limit)));
    }
    if config.enabled.missing_fields {
        checks.push(Arc::new(MissingFieldCheck::new(config.required.clone(), limit)));
    }
    if config.enabled.invalid_values {
        checks.push(Arc::new(DomainCheck::new(config.domains.clone(), limit)));
    }
    if config.enabled.missing_indexes {
        checks.push(Arc::new(IndexCheck::new(config.indexes.clone(), limit)));
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use mendb_state::AnomalyContext;
    use mendb_store::{InMemoryRepository, IndexSpec};
    use serde_json::json;

    async fn scope_for(repo: &InMemoryRepository) -> CycleScope {
        CycleScope::new(1, repo.list_collections().await.unwrap())
    }

    #[tokio::test]
    async fn test_duplicates_keep_discovery_order() {
        let repo = InMemoryRepository::new();
        repo.insert_documents(
            "users",
            vec![
                json!({"_id": "u1", "email": "a@x.com"}),
                json!({"_id": "u2", "email": "b@x.com"}),
                json!({"_id": "u3", "email": "a@x.com"}),
                json!({"_id": "u4", "email": ""}),
                json!({"_id": "u5", "email": ""}),
            ],
        )
        .await
        .unwrap();

        let check = DuplicateCheck::new(DetectorConfig::default().unique, None);
        let mut scope = scope_for(&repo).await;
        let findings = check.run(&repo, &mut scope).await.unwrap();

        // Blank emails are not a duplicate group
        assert_eq!(findings.len(), 1);
        match findings[0].context() {
            AnomalyContext::Duplicate { ids, count, .. } => {
                assert_eq!(*count, 2);
                assert_eq!(ids, &vec![RecordId::new("u1"), RecordId::new("u3")]);
            }
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_orphans_ignore_blank_keys() {
        let repo = InMemoryRepository::new();
        repo.insert_documents("users", vec![json!({"_id": "u1", "email": "a@x.com"})])
            .await
            .unwrap();
        repo.insert_documents(
            "orders",
            vec![
                json!({"_id": "o1", "user_email": "a@x.com"}),
                json!({"_id": "o2", "user_email": "c@x.com"}),
                json!({"_id": "o3", "user_email": ""}),
                json!({"_id": "o4"}),
            ],
        )
        .await
        .unwrap();

        let check = OrphanCheck::new(DetectorConfig::default().references, None);
        let mut scope = scope_for(&repo).await;
        let findings = check.run(&repo, &mut scope).await.unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].target().record_id, Some(RecordId::new("o2")));
    }

    #[tokio::test]
    async fn test_orphans_skipped_without_parent_collection() {
        let repo = InMemoryRepository::new();
        repo.insert_documents("orders", vec![json!({"_id": "o1", "user_email": "a@x.com"})])
            .await
            .unwrap();

        let check = OrphanCheck::new(DetectorConfig::default().references, None);
        let mut scope = scope_for(&repo).await;
        assert!(check.run(&repo, &mut scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_one_per_field() {
        let repo = InMemoryRepository::new();
        repo.insert_documents(
            "users",
            vec![
                json!({"_id": "u1"}),
                json!({"_id": "u2", "email": "b@x.com", "name": null}),
                json!({"_id": "u3", "email": "c@x.com", "name": "C"}),
            ],
        )
        .await
        .unwrap();

        let check = MissingFieldCheck::new(DetectorConfig::default().required, None);
        let mut scope = scope_for(&repo).await;
        let findings = check.run(&repo, &mut scope).await.unwrap();

        assert_eq!(findings.len(), 3);
        assert_eq!(scope.flagged_count(), 3);
    }

    #[tokio::test]
    async fn test_repeated_required_field_is_reported_once() {
        let repo = InMemoryRepository::new();
        repo.insert_documents("users", vec![json!({"_id": "u1"})])
            .await
            .unwrap();

        let rules = vec![
            RequiredRule {
                collection: "users".to_string(),
                fields: vec!["email".to_string()],
            },
            RequiredRule {
                collection: "users".to_string(),
                fields: vec!["email".to_string(), "name".to_string()],
            },
        ];
        let check = MissingFieldCheck::new(rules, None);
        let mut scope = scope_for(&repo).await;
        assert_eq!(check.run(&repo, &mut scope).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_domain_check_flags_absent_and_unknown() {
        let repo = InMemoryRepository::new();
        repo.insert_documents(
            "orders",
            vec![
                json!({"_id": "o1", "status": "pending"}),
                json!({"_id": "o2", "status": "shipped"}),
                json!({"_id": "o3"}),
            ],
        )
        .await
        .unwrap();

        let check = DomainCheck::new(DetectorConfig::default().domains, None);
        let mut scope = scope_for(&repo).await;
        let findings = check.run(&repo, &mut scope).await.unwrap();

        assert_eq!(findings.len(), 2);
        match findings[0].context() {
            AnomalyContext::InvalidValue {
                observed, default, ..
            } => {
                assert_eq!(observed, &Some(json!("shipped")));
                assert_eq!(default, &json!("pending"));
            }
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_index_check_respects_threshold_and_coverage() {
        let repo = InMemoryRepository::new();
        let products: Vec<_> = (0..150)
            .map(|i| json!({"_id": format!("p{}", i), "category": "c", "price": i}))
            .collect();
        repo.insert_documents("products", products).await.unwrap();
        repo.create_index(
            "products",
            IndexSpec {
                name: "category_price".to_string(),
                fields: vec!["category".to_string(), "price".to_string()],
            },
        )
        .await
        .unwrap();

        let check = IndexCheck::new(DetectorConfig::default().indexes, None);
        let mut scope = scope_for(&repo).await;
        let findings = check.run(&repo, &mut scope).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].target().field.as_deref(), Some("name"));

        let small = IndexCheck::new(
            vec![IndexRule {
                collection: "products".to_string(),
                threshold: 150,
                recommended: vec!["name".to_string()],
            }],
            None,
        );
        assert!(small.run(&repo, &mut scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limit_caps_findings() {
        let repo = InMemoryRepository::new();
        let orders: Vec<_> = (0..5)
            .map(|i| json!({"_id": format!("o{}", i), "status": "bogus"}))
            .collect();
        repo.insert_documents("orders", orders).await.unwrap();

        let check = DomainCheck::new(DetectorConfig::default().domains, Some(2));
        let mut scope = scope_for(&repo).await;
        assert_eq!(check.run(&repo, &mut scope).await.unwrap().len(), 2);
    }

    #[test]
    fn test_default_checks_follow_enable_flags() {
        let mut config = DetectorConfig::default();
        assert_eq!(default_checks(&config).len(), 5);

        config.enabled.orphans = false;
        config.enabled.missing_indexes = false;
        let names: Vec<_> = default_checks(&config)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["duplicates", "missing_fields", "invalid_values"]);
    }
}
