//! Kubernetes and Kafka manifest parsing.
//!
//! Multi-document YAML via serde_yaml; non-mapping documents are skipped
//! and malformed YAML degrades to a WARN rather than failing the file set.
//! Ownership comes from labels with documented fallbacks; the namespace ACL
//! from an annotation, falling back to the manifest namespace. Under the
//! default-deny ACL a missing owner or ACL makes the entity invisible to
//! non-admins, so both gaps are logged loudly.

use serde::Deserialize;
use serde_yaml::Value;

use lattice_core::{Entity, K8sDeploymentNode, KafkaTopicNode};

use crate::workspace::RawFile;

pub const TEAM_OWNER_LABEL: &str = "lattice.io/team-owner";
pub const NAMESPACE_ACL_ANNOTATION: &str = "lattice.io/namespace-acl";

const TEAM_OWNER_FALLBACK_LABELS: [&str; 4] = [
    TEAM_OWNER_LABEL,
    "team",
    "owner",
    "app.kubernetes.io/managed-by",
];

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_REPLICAS: i64 = 1;
const DEFAULT_PARTITIONS: i64 = 1;
const DEFAULT_RETENTION_MS: i64 = 604_800_000;

const YAML_EXTENSIONS: [&str; 2] = [".yaml", ".yml"];

fn safe_load_all(content: &str) -> Vec<serde_yaml::Mapping> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(content) {
        match Value::deserialize(deserializer) {
            Ok(Value::Mapping(mapping)) => documents.push(mapping),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%err, "failed to parse YAML document");
                return documents;
            }
        }
    }
    documents
}

fn get_str(mapping: &serde_yaml::Mapping, key: &str) -> Option<String> {
    match mapping.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn get_i64(mapping: &serde_yaml::Mapping, key: &str) -> Option<i64> {
    match mapping.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn get_mapping<'a>(mapping: &'a serde_yaml::Mapping, key: &str) -> Option<&'a serde_yaml::Mapping> {
    match mapping.get(key)? {
        Value::Mapping(m) => Some(m),
        _ => None,
    }
}

fn extract_team_owner(metadata: &serde_yaml::Mapping) -> Option<String> {
    let labels = get_mapping(metadata, "labels")?;
    TEAM_OWNER_FALLBACK_LABELS
        .iter()
        .find_map(|label| get_str(labels, label))
}

fn extract_namespace_acl(metadata: &serde_yaml::Mapping, manifest_namespace: &str) -> Vec<String> {
    let from_annotation = get_mapping(metadata, "annotations")
        .and_then(|annotations| get_str(annotations, NAMESPACE_ACL_ANNOTATION))
        .map(|raw| {
            raw.split(',')
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if !from_annotation.is_empty() {
        return from_annotation;
    }
    if manifest_namespace.is_empty() {
        Vec::new()
    } else {
        vec![manifest_namespace.to_string()]
    }
}

fn extract_deployment(doc: &serde_yaml::Mapping, tenant_id: &str) -> Option<K8sDeploymentNode> {
    if get_str(doc, "kind").as_deref() != Some("Deployment") {
        return None;
    }
    let metadata = get_mapping(doc, "metadata")?;
    let name = get_str(metadata, "name")?;
    let namespace = get_str(metadata, "namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let replicas = get_mapping(doc, "spec")
        .and_then(|spec| get_i64(spec, "replicas"))
        .unwrap_or(DEFAULT_REPLICAS);
    let team_owner = extract_team_owner(metadata);
    let namespace_acl = extract_namespace_acl(metadata, &namespace);

    if team_owner.is_none() {
        tracing::warn!(
            deployment = %name,
            namespace = %namespace,
            label = TEAM_OWNER_LABEL,
            "Deployment missing team-owner label; invisible to non-admin users under default-deny ACL"
        );
    }
    if namespace_acl.is_empty() {
        tracing::warn!(
            deployment = %name,
            namespace = %namespace,
            annotation = NAMESPACE_ACL_ANNOTATION,
            "Deployment missing namespace-acl annotation; invisible to namespace-scoped users"
        );
    }

    Some(K8sDeploymentNode {
        id: name,
        namespace,
        replicas,
        tenant_id: tenant_id.to_string(),
        team_owner,
        namespace_acl,
        read_roles: vec![],
        content_hash: String::new(),
    })
}

fn extract_kafka_topic(doc: &serde_yaml::Mapping, tenant_id: &str) -> Option<KafkaTopicNode> {
    if get_str(doc, "kind").as_deref() != Some("KafkaTopic") {
        return None;
    }
    let metadata = get_mapping(doc, "metadata")?;
    let name = get_str(metadata, "name")?;
    let namespace = get_str(metadata, "namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let spec = get_mapping(doc, "spec");
    let partitions = spec
        .and_then(|s| get_i64(s, "partitions"))
        .unwrap_or(DEFAULT_PARTITIONS);
    let retention_ms = spec
        .and_then(|s| get_mapping(s, "config"))
        .and_then(|config| get_i64(config, "retention.ms"))
        .unwrap_or(DEFAULT_RETENTION_MS);
    let team_owner = extract_team_owner(metadata);
    let namespace_acl = extract_namespace_acl(metadata, &namespace);

    if team_owner.is_none() {
        tracing::warn!(
            topic = %name,
            label = TEAM_OWNER_LABEL,
            "KafkaTopic missing team-owner label; invisible to non-admin users under default-deny ACL"
        );
    }
    if namespace_acl.is_empty() {
        tracing::warn!(
            topic = %name,
            annotation = NAMESPACE_ACL_ANNOTATION,
            "KafkaTopic missing namespace-acl annotation; invisible to namespace-scoped users"
        );
    }

    Some(KafkaTopicNode {
        name,
        partitions,
        retention_ms,
        tenant_id: tenant_id.to_string(),
        team_owner,
        namespace_acl,
        read_roles: vec![],
        content_hash: String::new(),
    })
}

/// Parse one file's content for Deployments.
pub fn parse_k8s_manifests(content: &str, tenant_id: &str) -> Vec<K8sDeploymentNode> {
    safe_load_all(content)
        .iter()
        .filter_map(|doc| extract_deployment(doc, tenant_id))
        .collect()
}

/// Parse one file's content for KafkaTopics.
pub fn parse_kafka_topics(content: &str, tenant_id: &str) -> Vec<KafkaTopicNode> {
    safe_load_all(content)
        .iter()
        .filter_map(|doc| extract_kafka_topic(doc, tenant_id))
        .collect()
}

/// Parse every YAML file in the set and return the manifest entities.
/// Returns the entity list plus the paths that were consumed (checkpointed
/// as extracted by the pipeline).
pub fn parse_all_manifests(files: &[RawFile], tenant_id: &str) -> (Vec<Entity>, Vec<String>) {
    let mut entities: Vec<Entity> = Vec::new();
    let mut consumed: Vec<String> = Vec::new();
    for file in files {
        if !YAML_EXTENSIONS.iter().any(|ext| file.path.ends_with(ext)) {
            continue;
        }
        consumed.push(file.path.clone());
        entities.extend(
            parse_k8s_manifests(&file.content, tenant_id)
                .into_iter()
                .map(Entity::K8sDeployment),
        );
        entities.extend(
            parse_kafka_topics(&file.content, tenant_id)
                .into_iter()
                .map(Entity::KafkaTopic),
        );
    }
    (entities, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT_YAML: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: auth-deploy
  namespace: identity
  labels:
    lattice.io/team-owner: identity-team
  annotations:
    lattice.io/namespace-acl: "identity, platform"
spec:
  replicas: 3
"#;

    const TOPIC_YAML: &str = r#"
apiVersion: kafka.strimzi.io/v1beta2
kind: KafkaTopic
metadata:
  name: orders
  labels:
    team: commerce
spec:
  partitions: 12
  config:
    retention.ms: 86400000
"#;

    #[test]
    fn test_deployment_extraction() {
        let deployments = parse_k8s_manifests(DEPLOYMENT_YAML, "tenant-a");
        assert_eq!(deployments.len(), 1);
        let d = &deployments[0];
        assert_eq!(d.id, "auth-deploy");
        assert_eq!(d.namespace, "identity");
        assert_eq!(d.replicas, 3);
        assert_eq!(d.team_owner.as_deref(), Some("identity-team"));
        assert_eq!(d.namespace_acl, vec!["identity", "platform"]);
        assert_eq!(d.tenant_id, "tenant-a");
    }

    #[test]
    fn test_topic_extraction_with_label_fallback() {
        let topics = parse_kafka_topics(TOPIC_YAML, "tenant-a");
        assert_eq!(topics.len(), 1);
        let t = &topics[0];
        assert_eq!(t.name, "orders");
        assert_eq!(t.partitions, 12);
        assert_eq!(t.retention_ms, 86_400_000);
        assert_eq!(t.team_owner.as_deref(), Some("commerce"));
        // No annotation: falls back to the manifest namespace (default).
        assert_eq!(t.namespace_acl, vec!["default"]);
    }

    #[test]
    fn test_multi_document_and_non_mapping_docs() {
        let combined = format!("{DEPLOYMENT_YAML}\n---\n{TOPIC_YAML}\n---\n- just\n- a\n- list\n");
        let (entities, consumed) = parse_all_manifests(
            &[RawFile {
                path: "stack.yaml".to_string(),
                content: combined,
            }],
            "tenant-a",
        );
        assert_eq!(entities.len(), 2);
        assert_eq!(consumed, vec!["stack.yaml"]);
    }

    #[test]
    fn test_defaults_applied() {
        let minimal = "kind: Deployment\nmetadata:\n  name: bare\n";
        let deployments = parse_k8s_manifests(minimal, "t");
        assert_eq!(deployments[0].namespace, "default");
        assert_eq!(deployments[0].replicas, 1);
        assert!(deployments[0].team_owner.is_none());
    }

    #[test]
    fn test_malformed_yaml_degrades_gracefully() {
        let bad = "kind: Deployment\nmetadata:\n  name: [unclosed";
        assert!(parse_k8s_manifests(bad, "t").is_empty());
    }

    #[test]
    fn test_non_yaml_files_are_ignored() {
        let (entities, consumed) = parse_all_manifests(
            &[RawFile {
                path: "main.go".to_string(),
                content: "package main".to_string(),
            }],
            "t",
        );
        assert!(entities.is_empty());
        assert!(consumed.is_empty());
    }
}
