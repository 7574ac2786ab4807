//! Graph entity ontology.
//!
//! A small closed set of labeled node and edge types. Node identity always
//! includes `tenant_id`: nodes with the same primary key from distinct
//! tenants are distinct entities. Edges carry their own `tenant_id` copy for
//! scan predicates plus the `ingestion_id` / `last_seen_at` pair that drives
//! the tombstone pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{LatticeResult, ValidationError};

// ============================================================================
// IDENTIFIER VALIDATION
// ============================================================================

/// Anchored pattern for node identifiers (DNS-label-ish, max 253 chars).
static SAFE_ENTITY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]{0,252}$").unwrap());

/// Characters an edge endpoint reference may never contain.
static EDGE_INJECTION_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"{};\\`\x00]"#).unwrap());

const MAX_EDGE_REF_LENGTH: usize = 512;

/// Validate a node identifier against the anchored safe pattern.
pub fn validate_entity_identifier(field: &str, value: &str) -> LatticeResult<()> {
    if !SAFE_ENTITY_NAME.is_match(value) {
        return Err(ValidationError::DisallowedIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validate an edge endpoint reference.
///
/// Looser than node identifiers (up to 512 chars) but must exclude quotes,
/// braces, semicolons, backslashes, backticks, and NUL.
pub fn validate_edge_reference(field: &str, value: &str) -> LatticeResult<()> {
    if value.is_empty() || value.len() > MAX_EDGE_REF_LENGTH {
        return Err(ValidationError::DisallowedEdgeReference {
            field: field.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    if EDGE_INJECTION_CHARS.is_match(value) {
        return Err(ValidationError::DisallowedEdgeReference {
            field: field.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

fn validate_tenant(tenant_id: &str) -> LatticeResult<()> {
    if tenant_id.is_empty() {
        return Err(ValidationError::EmptyTenant.into());
    }
    Ok(())
}

fn validate_confidence(value: f64) -> LatticeResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::OutOfRange {
            field: "confidence".to_string(),
            value: value.to_string(),
            reason: "must be within [0.0, 1.0]".to_string(),
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// NODE TYPES
// ============================================================================

/// A microservice, API server, or standalone application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub id: String,
    pub name: String,
    pub language: String,
    pub framework: String,
    pub otel_enabled: bool,
    pub tenant_id: String,
    #[serde(default)]
    pub team_owner: Option<String>,
    #[serde(default)]
    pub namespace_acl: Vec<String>,
    #[serde(default)]
    pub read_roles: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub content_hash: String,
}

fn default_confidence() -> f64 {
    1.0
}

/// A backing datastore referenced by one or more services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseNode {
    pub id: String,
    pub db_type: String,
    pub tenant_id: String,
    #[serde(default)]
    pub team_owner: Option<String>,
    #[serde(default)]
    pub namespace_acl: Vec<String>,
    #[serde(default)]
    pub read_roles: Vec<String>,
    #[serde(default)]
    pub content_hash: String,
}

/// A Kafka topic declared via manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KafkaTopicNode {
    pub name: String,
    pub partitions: i64,
    pub retention_ms: i64,
    pub tenant_id: String,
    #[serde(default)]
    pub team_owner: Option<String>,
    #[serde(default)]
    pub namespace_acl: Vec<String>,
    #[serde(default)]
    pub read_roles: Vec<String>,
    #[serde(default)]
    pub content_hash: String,
}

/// A Kubernetes Deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sDeploymentNode {
    pub id: String,
    pub namespace: String,
    pub replicas: i64,
    pub tenant_id: String,
    #[serde(default)]
    pub team_owner: Option<String>,
    #[serde(default)]
    pub namespace_acl: Vec<String>,
    #[serde(default)]
    pub read_roles: Vec<String>,
    #[serde(default)]
    pub content_hash: String,
}

// ============================================================================
// EDGE TYPES
// ============================================================================

/// An inter-service HTTP or gRPC call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallsEdge {
    pub source_service_id: String,
    pub target_service_id: String,
    pub protocol: String,
    pub tenant_id: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub ingestion_id: String,
    #[serde(default)]
    pub last_seen_at: String,
}

/// A service producing to a Kafka topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducesEdge {
    pub service_id: String,
    pub topic_name: String,
    pub event_schema: String,
    pub tenant_id: String,
    #[serde(default)]
    pub ingestion_id: String,
    #[serde(default)]
    pub last_seen_at: String,
}

/// A service consuming from a Kafka topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumesEdge {
    pub service_id: String,
    pub topic_name: String,
    pub consumer_group: String,
    pub tenant_id: String,
    #[serde(default)]
    pub ingestion_id: String,
    #[serde(default)]
    pub last_seen_at: String,
}

/// A service deployed inside a Kubernetes Deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedInEdge {
    pub service_id: String,
    pub deployment_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub ingestion_id: String,
    #[serde(default)]
    pub last_seen_at: String,
}

// ============================================================================
// TAGGED ENTITY UNION
// ============================================================================

/// The closed ontology as a tagged union.
///
/// Runtime type dispatch happens over this enum rather than trait objects:
/// the repository groups entities by [`Entity::type_name`], orders them by
/// `(type_name, primary_key)`, and looks up the matching upsert statement in
/// the ontology-generated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entity {
    Service(ServiceNode),
    Database(DatabaseNode),
    KafkaTopic(KafkaTopicNode),
    K8sDeployment(K8sDeploymentNode),
    Calls(CallsEdge),
    Produces(ProducesEdge),
    Consumes(ConsumesEdge),
    DeployedIn(DeployedInEdge),
}

impl Entity {
    /// True for node variants, false for edge variants.
    pub fn is_node(&self) -> bool {
        matches!(
            self,
            Entity::Service(_)
                | Entity::Database(_)
                | Entity::KafkaTopic(_)
                | Entity::K8sDeployment(_)
        )
    }

    /// Stable type name used for grouping, ordering, and statement lookup.
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::Service(_) => "Service",
            Entity::Database(_) => "Database",
            Entity::KafkaTopic(_) => "KafkaTopic",
            Entity::K8sDeployment(_) => "K8sDeployment",
            Entity::Calls(_) => "CALLS",
            Entity::Produces(_) => "PRODUCES",
            Entity::Consumes(_) => "CONSUMES",
            Entity::DeployedIn(_) => "DEPLOYED_IN",
        }
    }

    /// Primary key within the type. For edges this is the endpoint pair,
    /// which makes the write order total and deterministic.
    pub fn primary_key(&self) -> String {
        match self {
            Entity::Service(n) => n.id.clone(),
            Entity::Database(n) => n.id.clone(),
            Entity::KafkaTopic(n) => n.name.clone(),
            Entity::K8sDeployment(n) => n.id.clone(),
            Entity::Calls(e) => format!("{}->{}", e.source_service_id, e.target_service_id),
            Entity::Produces(e) => format!("{}->{}", e.service_id, e.topic_name),
            Entity::Consumes(e) => format!("{}->{}", e.service_id, e.topic_name),
            Entity::DeployedIn(e) => format!("{}->{}", e.service_id, e.deployment_id),
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            Entity::Service(n) => &n.tenant_id,
            Entity::Database(n) => &n.tenant_id,
            Entity::KafkaTopic(n) => &n.tenant_id,
            Entity::K8sDeployment(n) => &n.tenant_id,
            Entity::Calls(e) => &e.tenant_id,
            Entity::Produces(e) => &e.tenant_id,
            Entity::Consumes(e) => &e.tenant_id,
            Entity::DeployedIn(e) => &e.tenant_id,
        }
    }

    /// Extraction confidence. Manifest and AST entities are exact (1.0);
    /// LLM-provenance entities carry the model's confidence.
    pub fn confidence(&self) -> f64 {
        match self {
            Entity::Service(n) => n.confidence,
            Entity::Calls(e) => e.confidence,
            _ => 1.0,
        }
    }

    /// Stamp the ingestion run id and observation time on edge variants.
    /// Nodes are unaffected.
    pub fn stamp_ingestion(&mut self, ingestion_id: &str, last_seen_at: &str) {
        match self {
            Entity::Calls(e) => {
                e.ingestion_id = ingestion_id.to_string();
                e.last_seen_at = last_seen_at.to_string();
            }
            Entity::Produces(e) => {
                e.ingestion_id = ingestion_id.to_string();
                e.last_seen_at = last_seen_at.to_string();
            }
            Entity::Consumes(e) => {
                e.ingestion_id = ingestion_id.to_string();
                e.last_seen_at = last_seen_at.to_string();
            }
            Entity::DeployedIn(e) => {
                e.ingestion_id = ingestion_id.to_string();
                e.last_seen_at = last_seen_at.to_string();
            }
            _ => {}
        }
    }

    /// Validate identifier shape, tenant presence, and field bounds.
    pub fn validate(&self) -> LatticeResult<()> {
        validate_tenant(self.tenant_id())?;
        match self {
            Entity::Service(n) => {
                validate_entity_identifier("id", &n.id)?;
                validate_entity_identifier("name", &n.name)?;
                validate_confidence(n.confidence)
            }
            Entity::Database(n) => validate_entity_identifier("id", &n.id),
            Entity::KafkaTopic(n) => validate_entity_identifier("name", &n.name),
            Entity::K8sDeployment(n) => validate_entity_identifier("id", &n.id),
            Entity::Calls(e) => {
                validate_edge_reference("source_service_id", &e.source_service_id)?;
                validate_edge_reference("target_service_id", &e.target_service_id)?;
                validate_confidence(e.confidence)
            }
            Entity::Produces(e) => {
                validate_edge_reference("service_id", &e.service_id)?;
                validate_edge_reference("topic_name", &e.topic_name)
            }
            Entity::Consumes(e) => {
                validate_edge_reference("service_id", &e.service_id)?;
                validate_edge_reference("topic_name", &e.topic_name)?;
                validate_edge_reference("consumer_group", &e.consumer_group)
            }
            Entity::DeployedIn(e) => {
                validate_edge_reference("service_id", &e.service_id)?;
                validate_edge_reference("deployment_id", &e.deployment_id)
            }
        }
    }

    /// Entity properties as a JSON object (flat, without the enum tag).
    pub fn to_properties(&self) -> serde_json::Map<String, serde_json::Value> {
        let value = match self {
            Entity::Service(n) => serde_json::to_value(n),
            Entity::Database(n) => serde_json::to_value(n),
            Entity::KafkaTopic(n) => serde_json::to_value(n),
            Entity::K8sDeployment(n) => serde_json::to_value(n),
            Entity::Calls(e) => serde_json::to_value(e),
            Entity::Produces(e) => serde_json::to_value(e),
            Entity::Consumes(e) => serde_json::to_value(e),
            Entity::DeployedIn(e) => serde_json::to_value(e),
        };
        match value {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    fn set_content_hash(&mut self, hash: String) {
        match self {
            Entity::Service(n) => n.content_hash = hash,
            Entity::Database(n) => n.content_hash = hash,
            Entity::KafkaTopic(n) => n.content_hash = hash,
            Entity::K8sDeployment(n) => n.content_hash = hash,
            _ => {}
        }
    }
}

// ============================================================================
// CONTENT HASH
// ============================================================================

/// SHA-256 over the entity's canonical JSON, excluding `content_hash` itself.
///
/// serde_json maps are ordered (BTreeMap keys), so the serialization is
/// canonical without an explicit sort. Computing the hash twice over the same
/// entity yields the same digest regardless of whether the hash field was
/// already populated.
pub fn compute_content_hash(entity: &Entity) -> String {
    let mut props = entity.to_properties();
    props.remove("content_hash");
    let canonical = serde_json::Value::Object(props).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// Fill `content_hash` on every node entity in place. Edges are skipped
/// (the tombstone pass keys on `ingestion_id`, not content).
pub fn compute_hashes(entities: &mut [Entity]) {
    for entity in entities.iter_mut() {
        if entity.is_node() {
            let hash = compute_content_hash(entity);
            entity.set_content_hash(hash);
        }
    }
}

// ============================================================================
// EXTRACTION PAYLOAD
// ============================================================================

/// Structured output of a source-code extraction pass (LLM or AST worker).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub services: Vec<ServiceNode>,
    pub calls: Vec<CallsEdge>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.calls.is_empty()
    }

    /// Flatten into the tagged union form the pipeline accumulates.
    pub fn into_entities(self) -> Vec<Entity> {
        let mut out: Vec<Entity> = Vec::with_capacity(self.services.len() + self.calls.len());
        out.extend(self.services.into_iter().map(Entity::Service));
        out.extend(self.calls.into_iter().map(Entity::Calls));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, tenant: &str) -> Entity {
        Entity::Service(ServiceNode {
            id: id.to_string(),
            name: id.to_string(),
            language: "go".to_string(),
            framework: "gin".to_string(),
            otel_enabled: false,
            tenant_id: tenant.to_string(),
            team_owner: None,
            namespace_acl: vec![],
            read_roles: vec![],
            confidence: 1.0,
            content_hash: String::new(),
        })
    }

    #[test]
    fn test_identifier_accepts_dns_style_names() {
        for ok in ["auth", "auth-svc", "a1.b2_c3", "0leading-digit"] {
            assert!(validate_entity_identifier("id", ok).is_ok(), "{ok}");
        }
    }

    #[test]
    fn test_identifier_rejects_injection_shapes() {
        for bad in ["", "-leading-dash", "a'b", "a;b", "a b", &"x".repeat(254)] {
            assert!(validate_entity_identifier("id", bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_edge_reference_rejects_cypher_metacharacters() {
        for bad in ["", "a{b}", "a\"b", "a`b", "a\\b", "a;b", "a\u{0}b"] {
            assert!(validate_edge_reference("ref", bad).is_err(), "{bad:?}");
        }
        assert!(validate_edge_reference("ref", "svc/payments:8080").is_ok());
    }

    #[test]
    fn test_empty_tenant_fails_validation() {
        let entity = service("auth", "");
        assert!(entity.validate().is_err());
    }

    #[test]
    fn test_content_hash_is_idempotent() {
        let mut a = service("auth", "tenant-a");
        let first = compute_content_hash(&a);
        a.set_content_hash(first.clone());
        // Recomputing over the already-hashed entity excludes the hash field.
        let second = compute_content_hash(&a);
        assert_eq!(first, second);
    }

    #[test]
    fn test_content_hash_differs_across_tenants() {
        let a = service("auth", "tenant-a");
        let b = service("auth", "tenant-b");
        assert_ne!(compute_content_hash(&a), compute_content_hash(&b));
    }

    #[test]
    fn test_compute_hashes_fills_nodes_only() {
        let mut entities = vec![
            service("auth", "tenant-a"),
            Entity::Calls(CallsEdge {
                source_service_id: "auth".to_string(),
                target_service_id: "billing".to_string(),
                protocol: "http".to_string(),
                tenant_id: "tenant-a".to_string(),
                confidence: 1.0,
                ingestion_id: String::new(),
                last_seen_at: String::new(),
            }),
        ];
        compute_hashes(&mut entities);
        match &entities[0] {
            Entity::Service(n) => assert!(!n.content_hash.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sort_key_orders_types_then_keys() {
        let mut entities = vec![service("zeta", "t"), service("alpha", "t")];
        entities.sort_by_key(|e| (e.type_name(), e.primary_key()));
        assert_eq!(entities[0].primary_key(), "alpha");
    }
}
