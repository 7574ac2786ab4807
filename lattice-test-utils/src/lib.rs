//! Lattice Test Utilities
//!
//! Centralized test infrastructure for the workspace:
//! - scriptable mock graph and vector stores with call recording and
//!   failure injection
//! - fluent entity builders
//! - proptest generators for identifiers and entities

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use lattice_core::{
    CallsEdge, Entity, K8sDeploymentNode, KafkaTopicNode, LatticeError, LatticeResult, ServiceNode,
};
use lattice_graph::{EmbeddingRecord, GraphStore, Row, VectorStore};
use lattice_guard::QueryParams;

// ============================================================================
// MOCK GRAPH STORE
// ============================================================================

/// Scriptable in-memory stand-in for the graph driver.
///
/// Responses are keyed by query substring (first match wins). Every call is
/// recorded for assertion; failures can be injected by substring, once or
/// persistently.
#[derive(Clone)]
struct FailRule {
    substring: String,
    err: LatticeError,
    /// Matching calls to let through before failing.
    skips: usize,
    /// Remove the rule after its first failure.
    once: bool,
}

#[derive(Default)]
pub struct MockGraphStore {
    responses: Mutex<Vec<(String, Vec<Row>)>>,
    failures: Mutex<Vec<FailRule>>,
    recorded: Mutex<Vec<(String, QueryParams)>>,
    delay: Mutex<Option<Duration>>,
}

impl MockGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `rows` for any query containing `substring`.
    pub fn on_query(&self, substring: &str, rows: Vec<Row>) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((substring.to_string(), rows));
    }

    /// Fail every query containing `substring` with `err`.
    pub fn fail_on(&self, substring: &str, err: LatticeError) {
        self.push_rule(substring, err, 0, false);
    }

    /// Fail the next matching query only, then recover.
    pub fn fail_once_on(&self, substring: &str, err: LatticeError) {
        self.push_rule(substring, err, 0, true);
    }

    /// Let `skips` matching queries through, then fail persistently.
    pub fn fail_after_on(&self, substring: &str, skips: usize, err: LatticeError) {
        self.push_rule(substring, err, skips, false);
    }

    fn push_rule(&self, substring: &str, err: LatticeError, skips: usize, once: bool) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FailRule {
                substring: substring.to_string(),
                err,
                skips,
                once,
            });
    }

    /// Delay every call (for timeout tests).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// All recorded (query, params) pairs.
    pub fn recorded(&self) -> Vec<(String, QueryParams)> {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recorded queries containing `substring`.
    pub fn recorded_matching(&self, substring: &str) -> Vec<(String, QueryParams)> {
        self.recorded()
            .into_iter()
            .filter(|(q, _)| q.contains(substring))
            .collect()
    }

    async fn execute(&self, query: &str, params: &QueryParams) -> LatticeResult<Vec<Row>> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((query.to_string(), params.clone()));

        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(index) = failures
                .iter()
                .position(|rule| query.contains(&rule.substring))
            {
                if failures[index].skips > 0 {
                    failures[index].skips -= 1;
                } else {
                    let rule = failures[index].clone();
                    if rule.once {
                        failures.remove(index);
                    }
                    return Err(rule.err);
                }
            }
        }

        let responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(responses
            .iter()
            .find(|(s, _)| query.contains(s))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl GraphStore for MockGraphStore {
    async fn execute_read(&self, query: &str, params: &QueryParams) -> LatticeResult<Vec<Row>> {
        self.execute(query, params).await
    }

    async fn execute_write(&self, query: &str, params: &QueryParams) -> LatticeResult<Vec<Row>> {
        self.execute(query, params).await
    }
}

// ============================================================================
// MOCK VECTOR STORE
// ============================================================================

#[derive(Default)]
pub struct MockVectorStore {
    deletes: Mutex<Vec<(String, Vec<String>)>>,
    upserts: Mutex<Vec<(String, Vec<EmbeddingRecord>)>>,
    fail_deletes: Mutex<Option<LatticeError>>,
}

impl MockVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_deletes_with(&self, err: LatticeError) {
        *self.fail_deletes.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
    }

    pub fn recover(&self) {
        *self.fail_deletes.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn deletes(&self) -> Vec<(String, Vec<String>)> {
        self.deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn upserts(&self) -> Vec<(String, Vec<EmbeddingRecord>)> {
        self.upserts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    async fn delete(&self, collection: &str, ids: &[String]) -> LatticeResult<()> {
        if let Some(err) = self
            .fail_deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(err);
        }
        self.deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((collection.to_string(), ids.to_vec()));
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        embeddings: &[EmbeddingRecord],
    ) -> LatticeResult<()> {
        self.upserts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((collection.to_string(), embeddings.to_vec()));
        Ok(())
    }
}

// ============================================================================
// ENTITY BUILDERS
// ============================================================================

/// Fluent builder for service nodes in tests.
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    node: ServiceNode,
}

pub fn service(id: &str) -> ServiceBuilder {
    ServiceBuilder {
        node: ServiceNode {
            id: id.to_string(),
            name: id.to_string(),
            language: "go".to_string(),
            framework: "gin".to_string(),
            otel_enabled: false,
            tenant_id: "tenant-a".to_string(),
            team_owner: None,
            namespace_acl: vec![],
            read_roles: vec![],
            confidence: 1.0,
            content_hash: String::new(),
        },
    }
}

impl ServiceBuilder {
    pub fn tenant(mut self, tenant_id: &str) -> Self {
        self.node.tenant_id = tenant_id.to_string();
        self
    }

    pub fn team(mut self, team: &str) -> Self {
        self.node.team_owner = Some(team.to_string());
        self
    }

    pub fn namespaces(mut self, namespaces: &[&str]) -> Self {
        self.node.namespace_acl = namespaces.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn language(mut self, language: &str) -> Self {
        self.node.language = language.to_string();
        self
    }

    pub fn framework(mut self, framework: &str) -> Self {
        self.node.framework = framework.to_string();
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.node.confidence = confidence;
        self
    }

    pub fn build(self) -> Entity {
        Entity::Service(self.node)
    }

    pub fn build_node(self) -> ServiceNode {
        self.node
    }
}

pub fn calls(source: &str, target: &str, tenant_id: &str) -> Entity {
    Entity::Calls(CallsEdge {
        source_service_id: source.to_string(),
        target_service_id: target.to_string(),
        protocol: "http".to_string(),
        tenant_id: tenant_id.to_string(),
        confidence: 1.0,
        ingestion_id: String::new(),
        last_seen_at: String::new(),
    })
}

pub fn topic(name: &str, tenant_id: &str) -> Entity {
    Entity::KafkaTopic(KafkaTopicNode {
        name: name.to_string(),
        partitions: 3,
        retention_ms: 604_800_000,
        tenant_id: tenant_id.to_string(),
        team_owner: None,
        namespace_acl: vec![],
        read_roles: vec![],
        content_hash: String::new(),
    })
}

pub fn deployment(id: &str, namespace: &str, tenant_id: &str) -> Entity {
    Entity::K8sDeployment(K8sDeploymentNode {
        id: id.to_string(),
        namespace: namespace.to_string(),
        replicas: 1,
        tenant_id: tenant_id.to_string(),
        team_owner: None,
        namespace_acl: vec![namespace.to_string()],
        read_roles: vec![],
        content_hash: String::new(),
    })
}

/// Build a result row for mocks.
pub fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use proptest::prelude::*;

    /// Valid entity identifiers per the anchored safe pattern.
    pub fn entity_identifier() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9][a-zA-Z0-9._-]{0,40}"
    }

    /// Tenant ids: short non-empty alphanumerics.
    pub fn tenant_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }

    /// A service entity with valid fields.
    pub fn service_entity() -> impl Strategy<Value = lattice_core::Entity> {
        (entity_identifier(), tenant_id(), 0.0f64..=1.0).prop_map(|(id, tenant, confidence)| {
            super::service(&id)
                .tenant(&tenant)
                .confidence(confidence)
                .build()
        })
    }
}
