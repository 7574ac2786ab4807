//! Ontology and statement generation.
//!
//! The node/edge schema is data: the builtin set mirrors the closed entity
//! ontology, and `ONTOLOGY_FILE` swaps in a custom one. Every write path
//! consumes the statement tables generated here, so a custom ontology flows
//! through commits without touching the repository.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use lattice_core::{LatticeResult, OntologyConfig, StoreError, ValidationError};

static VALID_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Reject anything that cannot be safely interpolated as a Cypher
/// identifier (label, property, index name).
pub fn validate_cypher_identifier(value: &str, what: &str) -> LatticeResult<()> {
    if !VALID_IDENTIFIER.is_match(value) {
        return Err(ValidationError::DisallowedIdentifier {
            field: what.to_string(),
            value: value.to_string(),
        }
        .into());
    }
    Ok(())
}

// ============================================================================
// SCHEMA TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    String,
    Integer,
    Float,
    Boolean,
    StringList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    pub name: String,
    pub prop_type: PropertyType,
}

impl PropertySchema {
    pub fn new(name: &str, prop_type: PropertyType) -> Self {
        Self {
            name: name.to_string(),
            prop_type,
        }
    }
}

/// A node label: its properties, unique key, merge keys, and ACL fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSchema {
    pub label: String,
    pub properties: Vec<PropertySchema>,
    pub unique_key: String,
    /// Always includes at least {unique_key, tenant_id}: node identity is
    /// tenant-scoped by construction.
    pub merge_keys: Vec<String>,
    pub acl_fields: Vec<String>,
}

/// An edge type: endpoint labels/keys, the row fields carrying endpoint
/// identifiers, and edge properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSchema {
    pub rel_type: String,
    pub source_label: String,
    pub target_label: String,
    /// Property matched on the source node (e.g. `id`).
    pub source_match_key: String,
    pub target_match_key: String,
    /// Row field carrying the source identifier (e.g. `service_id`).
    pub source_param: String,
    pub target_param: String,
    pub properties: Vec<PropertySchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ontology {
    pub nodes: Vec<NodeSchema>,
    pub edges: Vec<EdgeSchema>,
}

impl Ontology {
    /// The builtin ontology matching the closed entity set.
    pub fn builtin() -> Self {
        use PropertyType::*;
        Self {
            nodes: vec![
                NodeSchema {
                    label: "Service".to_string(),
                    properties: vec![
                        PropertySchema::new("id", String),
                        PropertySchema::new("name", String),
                        PropertySchema::new("language", String),
                        PropertySchema::new("framework", String),
                        PropertySchema::new("otel_enabled", Boolean),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("team_owner", String),
                        PropertySchema::new("namespace_acl", StringList),
                        PropertySchema::new("read_roles", StringList),
                        PropertySchema::new("confidence", Float),
                        PropertySchema::new("content_hash", String),
                    ],
                    unique_key: "id".to_string(),
                    merge_keys: vec!["id".to_string(), "tenant_id".to_string()],
                    acl_fields: vec!["team_owner".to_string(), "namespace_acl".to_string()],
                },
                NodeSchema {
                    label: "Database".to_string(),
                    properties: vec![
                        PropertySchema::new("id", String),
                        PropertySchema::new("db_type", String),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("team_owner", String),
                        PropertySchema::new("namespace_acl", StringList),
                        PropertySchema::new("read_roles", StringList),
                        PropertySchema::new("content_hash", String),
                    ],
                    unique_key: "id".to_string(),
                    merge_keys: vec!["id".to_string(), "tenant_id".to_string()],
                    acl_fields: vec!["team_owner".to_string(), "namespace_acl".to_string()],
                },
                NodeSchema {
                    label: "KafkaTopic".to_string(),
                    properties: vec![
                        PropertySchema::new("name", String),
                        PropertySchema::new("partitions", Integer),
                        PropertySchema::new("retention_ms", Integer),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("team_owner", String),
                        PropertySchema::new("namespace_acl", StringList),
                        PropertySchema::new("read_roles", StringList),
                        PropertySchema::new("content_hash", String),
                    ],
                    unique_key: "name".to_string(),
                    merge_keys: vec!["name".to_string(), "tenant_id".to_string()],
                    acl_fields: vec!["team_owner".to_string(), "namespace_acl".to_string()],
                },
                NodeSchema {
                    label: "K8sDeployment".to_string(),
                    properties: vec![
                        PropertySchema::new("id", String),
                        PropertySchema::new("namespace", String),
                        PropertySchema::new("replicas", Integer),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("team_owner", String),
                        PropertySchema::new("namespace_acl", StringList),
                        PropertySchema::new("read_roles", StringList),
                        PropertySchema::new("content_hash", String),
                    ],
                    unique_key: "id".to_string(),
                    merge_keys: vec!["id".to_string(), "tenant_id".to_string()],
                    acl_fields: vec!["team_owner".to_string(), "namespace_acl".to_string()],
                },
            ],
            edges: vec![
                EdgeSchema {
                    rel_type: "CALLS".to_string(),
                    source_label: "Service".to_string(),
                    target_label: "Service".to_string(),
                    source_match_key: "id".to_string(),
                    target_match_key: "id".to_string(),
                    source_param: "source_service_id".to_string(),
                    target_param: "target_service_id".to_string(),
                    properties: vec![
                        PropertySchema::new("protocol", String),
                        PropertySchema::new("confidence", Float),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("ingestion_id", String),
                        PropertySchema::new("last_seen_at", String),
                    ],
                },
                EdgeSchema {
                    rel_type: "PRODUCES".to_string(),
                    source_label: "Service".to_string(),
                    target_label: "KafkaTopic".to_string(),
                    source_match_key: "id".to_string(),
                    target_match_key: "name".to_string(),
                    source_param: "service_id".to_string(),
                    target_param: "topic_name".to_string(),
                    properties: vec![
                        PropertySchema::new("event_schema", String),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("ingestion_id", String),
                        PropertySchema::new("last_seen_at", String),
                    ],
                },
                EdgeSchema {
                    rel_type: "CONSUMES".to_string(),
                    source_label: "Service".to_string(),
                    target_label: "KafkaTopic".to_string(),
                    source_match_key: "id".to_string(),
                    target_match_key: "name".to_string(),
                    source_param: "service_id".to_string(),
                    target_param: "topic_name".to_string(),
                    properties: vec![
                        PropertySchema::new("consumer_group", String),
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("ingestion_id", String),
                        PropertySchema::new("last_seen_at", String),
                    ],
                },
                EdgeSchema {
                    rel_type: "DEPLOYED_IN".to_string(),
                    source_label: "Service".to_string(),
                    target_label: "K8sDeployment".to_string(),
                    source_match_key: "id".to_string(),
                    target_match_key: "id".to_string(),
                    source_param: "service_id".to_string(),
                    target_param: "deployment_id".to_string(),
                    properties: vec![
                        PropertySchema::new("tenant_id", String),
                        PropertySchema::new("ingestion_id", String),
                        PropertySchema::new("last_seen_at", String),
                    ],
                },
            ],
        }
    }

    /// Load from a YAML file, replacing the builtin set entirely.
    pub fn from_yaml_file(path: &Path) -> LatticeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| StoreError::Serialization {
            message: format!("reading ontology file {}: {err}", path.display()),
        })?;
        let ontology: Ontology =
            serde_yaml::from_str(&raw).map_err(|err| StoreError::Serialization {
                message: format!("parsing ontology file {}: {err}", path.display()),
            })?;
        ontology.validate()?;
        Ok(ontology)
    }

    /// Resolve the active ontology: the configured file when present, the
    /// builtin set otherwise.
    pub fn load(config: &OntologyConfig) -> LatticeResult<Self> {
        match &config.file {
            Some(path) => {
                tracing::info!(path, "loading custom ontology");
                Self::from_yaml_file(Path::new(path))
            }
            None => Ok(Self::builtin()),
        }
    }

    /// Structural validation: identifier safety, merge-key coverage, and
    /// edge endpoints referring to declared labels.
    pub fn validate(&self) -> LatticeResult<()> {
        for node in &self.nodes {
            validate_cypher_identifier(&node.label, "node label")?;
            for prop in &node.properties {
                validate_cypher_identifier(&prop.name, "node property")?;
            }
            if !node.merge_keys.contains(&node.unique_key)
                || !node.merge_keys.iter().any(|k| k == "tenant_id")
            {
                return Err(ValidationError::OutOfRange {
                    field: format!("{}.merge_keys", node.label),
                    value: format!("{:?}", node.merge_keys),
                    reason: "merge keys must include the unique key and tenant_id".to_string(),
                }
                .into());
            }
        }
        for edge in &self.edges {
            validate_cypher_identifier(&edge.rel_type, "relationship type")?;
            for prop in &edge.properties {
                validate_cypher_identifier(&prop.name, "edge property")?;
            }
            for (what, label) in [
                ("source_label", &edge.source_label),
                ("target_label", &edge.target_label),
            ] {
                validate_cypher_identifier(label, what)?;
                if !self.nodes.iter().any(|n| &n.label == label) {
                    return Err(ValidationError::UnknownEntityType {
                        type_name: label.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, label: &str) -> Option<&NodeSchema> {
        self.nodes.iter().find(|n| n.label == label)
    }

    pub fn edge(&self, rel_type: &str) -> Option<&EdgeSchema> {
        self.edges.iter().find(|e| e.rel_type == rel_type)
    }
}

// ============================================================================
// STATEMENT GENERATION
// ============================================================================

fn node_unwind(node: &NodeSchema) -> String {
    let merge_pattern = node
        .merge_keys
        .iter()
        .map(|k| format!("{k}: row.{k}"))
        .collect::<Vec<_>>()
        .join(", ");
    let set_clause = node
        .properties
        .iter()
        .filter(|p| !node.merge_keys.contains(&p.name))
        .map(|p| format!("n.{0} = row.{0}", p.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UNWIND $batch AS row MERGE (n:{label} {{{merge_pattern}}}) SET {set_clause}",
        label = node.label
    )
}

fn node_single_merge(node: &NodeSchema) -> String {
    let merge_pattern = node
        .merge_keys
        .iter()
        .map(|k| format!("{k}: ${k}"))
        .collect::<Vec<_>>()
        .join(", ");
    let set_clause = node
        .properties
        .iter()
        .filter(|p| !node.merge_keys.contains(&p.name))
        .map(|p| format!("n.{0} = ${0}", p.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "MERGE (n:{label} {{{merge_pattern}}}) SET {set_clause}",
        label = node.label
    )
}

fn edge_unwind(edge: &EdgeSchema) -> String {
    let set_clause = edge
        .properties
        .iter()
        .map(|p| format!("r.{0} = row.{0}", p.name))
        .collect::<Vec<_>>()
        .join(", ");
    // A re-seen edge is alive again: the merge clears any tombstone.
    format!(
        "UNWIND $batch AS row \
         MATCH (a:{src_label} {{{src_key}: row.{src_param}, tenant_id: row.tenant_id}}), \
         (b:{tgt_label} {{{tgt_key}: row.{tgt_param}, tenant_id: row.tenant_id}}) \
         MERGE (a)-[r:{rel}]->(b) \
         SET {set_clause}, r.tombstoned_at = null",
        src_label = edge.source_label,
        src_key = edge.source_match_key,
        src_param = edge.source_param,
        tgt_label = edge.target_label,
        tgt_key = edge.target_match_key,
        tgt_param = edge.target_param,
        rel = edge.rel_type,
    )
}

/// Per-type UNWIND statements, keyed by node label / relationship type.
pub fn build_unwind_queries(ontology: &Ontology) -> HashMap<String, String> {
    let mut queries = HashMap::new();
    for node in &ontology.nodes {
        queries.insert(node.label.clone(), node_unwind(node));
    }
    for edge in &ontology.edges {
        queries.insert(edge.rel_type.clone(), edge_unwind(edge));
    }
    queries
}

/// Per-node-type single-row merges with `$name`-style parameters.
pub fn build_single_merge_queries(ontology: &Ontology) -> HashMap<String, String> {
    ontology
        .nodes
        .iter()
        .map(|n| (n.label.clone(), node_single_merge(n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ontology_is_valid() {
        Ontology::builtin().validate().unwrap();
    }

    #[test]
    fn test_node_unwind_excludes_merge_keys_from_set() {
        let ontology = Ontology::builtin();
        let queries = build_unwind_queries(&ontology);
        let service = &queries["Service"];
        assert!(service.contains("MERGE (n:Service {id: row.id, tenant_id: row.tenant_id})"));
        assert!(!service.contains("n.id = row.id"));
        assert!(!service.contains("n.tenant_id = row.tenant_id"));
        assert!(service.contains("n.content_hash = row.content_hash"));
    }

    #[test]
    fn test_edge_unwind_matches_both_endpoints_with_tenant() {
        let queries = build_unwind_queries(&Ontology::builtin());
        let calls = &queries["CALLS"];
        assert!(calls.contains("(a:Service {id: row.source_service_id, tenant_id: row.tenant_id})"));
        assert!(calls.contains("(b:Service {id: row.target_service_id, tenant_id: row.tenant_id})"));
        assert!(calls.contains("r.tombstoned_at = null"));
        assert!(calls.contains("r.ingestion_id = row.ingestion_id"));
    }

    #[test]
    fn test_single_merge_uses_dollar_params() {
        let queries = build_single_merge_queries(&Ontology::builtin());
        let topic = &queries["KafkaTopic"];
        assert!(topic.contains("MERGE (n:KafkaTopic {name: $name, tenant_id: $tenant_id})"));
        assert!(topic.contains("n.partitions = $partitions"));
    }

    #[test]
    fn test_merge_keys_must_include_tenant() {
        let mut ontology = Ontology::builtin();
        ontology.nodes[0].merge_keys = vec!["id".to_string()];
        assert!(ontology.validate().is_err());
    }

    #[test]
    fn test_identifier_validation_rejects_injection() {
        assert!(validate_cypher_identifier("Service", "label").is_ok());
        assert!(validate_cypher_identifier("Service` ", "label").is_err());
        assert!(validate_cypher_identifier("1Service", "label").is_err());
        assert!(validate_cypher_identifier("", "label").is_err());
    }

    #[test]
    fn test_custom_ontology_yaml_roundtrip() {
        let ontology = Ontology::builtin();
        let yaml = serde_yaml::to_string(&ontology).unwrap();
        let parsed: Ontology = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(ontology, parsed);
    }

    #[test]
    fn test_edge_endpoint_labels_must_exist() {
        let mut ontology = Ontology::builtin();
        ontology.edges[0].target_label = "Ghost".to_string();
        assert!(ontology.validate().is_err());
    }
}
