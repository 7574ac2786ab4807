//! Entity resolution.
//!
//! Extraction produces near-duplicate services: the same service seen from
//! different files, with naming drift (`auth_service` vs `auth-service`) and
//! partially-filled attributes. The resolver collapses them under a scoped
//! identity, merging attributes and rewriting edge endpoints onto the
//! canonical id.

use std::collections::HashMap;

use lattice_core::{Entity, ServiceNode};

/// Identity scope for resolution: the same name in different repositories
/// or namespaces is a different service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ScopedIdentity {
    pub repository: String,
    pub namespace: String,
    pub name: String,
}

impl ScopedIdentity {
    pub fn new(repository: &str, namespace: &str, name: &str) -> Self {
        Self {
            repository: repository.to_string(),
            namespace: namespace.to_string(),
            name: normalize_name(name),
        }
    }
}

/// Normalize a service name: lowercase, separators collapsed to a single
/// dash, trimmed.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch == '_' || ch == '.' || ch == '-' || ch.is_whitespace() {
            if !last_was_sep {
                out.push('-');
                last_was_sep = true;
            }
        } else {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Jaccard similarity over the descriptive attribute set.
pub fn attribute_similarity(a: &ServiceNode, b: &ServiceNode) -> f64 {
    let attrs = |s: &ServiceNode| {
        let mut set: Vec<String> = Vec::new();
        if !s.language.is_empty() && s.language != "unknown" {
            set.push(format!("lang:{}", s.language));
        }
        if !s.framework.is_empty() && s.framework != "unknown" {
            set.push(format!("fw:{}", s.framework));
        }
        if let Some(owner) = &s.team_owner {
            set.push(format!("team:{owner}"));
        }
        set
    };
    let set_a = attrs(a);
    let set_b = attrs(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.iter().filter(|x| set_b.contains(x)).count();
    let union = set_a.len() + set_b.len() - intersection;
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    /// Candidates sharing a normalized name merge only when their attribute
    /// similarity reaches this floor.
    pub similarity_threshold: f64,
}

impl Default for EntityResolver {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
        }
    }
}

impl EntityResolver {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    /// Merge `incoming` into `canonical`: keep the higher confidence, fill
    /// missing attributes, union ACL fields.
    fn merge_into(canonical: &mut ServiceNode, incoming: &ServiceNode) {
        if incoming.confidence > canonical.confidence {
            canonical.confidence = incoming.confidence;
        }
        if canonical.team_owner.is_none() {
            canonical.team_owner = incoming.team_owner.clone();
        }
        if canonical.framework == "unknown" && incoming.framework != "unknown" {
            canonical.framework = incoming.framework.clone();
        }
        if canonical.language == "unknown" && incoming.language != "unknown" {
            canonical.language = incoming.language.clone();
        }
        canonical.otel_enabled = canonical.otel_enabled || incoming.otel_enabled;
        for ns in &incoming.namespace_acl {
            if !canonical.namespace_acl.contains(ns) {
                canonical.namespace_acl.push(ns.clone());
            }
        }
        for role in &incoming.read_roles {
            if !canonical.read_roles.contains(role) {
                canonical.read_roles.push(role.clone());
            }
        }
    }

    /// Resolve an entity set: collapse near-duplicate services and rewrite
    /// edge endpoints onto the surviving canonical ids. Non-service entities
    /// pass through unchanged.
    pub fn resolve(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let mut canonical: Vec<ServiceNode> = Vec::new();
        // original id -> canonical id, for endpoint rewriting.
        let mut alias: HashMap<String, String> = HashMap::new();
        let mut passthrough: Vec<Entity> = Vec::new();

        for entity in entities {
            match entity {
                Entity::Service(incoming) => {
                    let normalized = normalize_name(&incoming.id);
                    let matched = canonical.iter_mut().find(|existing| {
                        existing.tenant_id == incoming.tenant_id
                            && normalize_name(&existing.id) == normalized
                            && attribute_similarity(existing, &incoming)
                                >= self.similarity_threshold
                    });
                    match matched {
                        Some(existing) => {
                            alias.insert(incoming.id.clone(), existing.id.clone());
                            Self::merge_into(existing, &incoming);
                        }
                        None => {
                            alias.insert(incoming.id.clone(), incoming.id.clone());
                            canonical.push(incoming);
                        }
                    }
                }
                other => passthrough.push(other),
            }
        }

        let rewrite = |id: &mut String| {
            if let Some(target) = alias.get(id.as_str()) {
                *id = target.clone();
            }
        };

        let mut out: Vec<Entity> = canonical.into_iter().map(Entity::Service).collect();
        let mut seen_edges: Vec<(&'static str, String)> = Vec::new();
        for mut entity in passthrough {
            match &mut entity {
                Entity::Calls(e) => {
                    rewrite(&mut e.source_service_id);
                    rewrite(&mut e.target_service_id);
                }
                Entity::Produces(e) => rewrite(&mut e.service_id),
                Entity::Consumes(e) => rewrite(&mut e.service_id),
                Entity::DeployedIn(e) => rewrite(&mut e.service_id),
                _ => {}
            }
            // Endpoint rewriting can fold two edges into one.
            let key = (entity.type_name(), entity.primary_key());
            if entity.is_node() || !seen_edges.contains(&key) {
                if !entity.is_node() {
                    seen_edges.push(key);
                }
                out.push(entity);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::CallsEdge;

    fn service(id: &str, framework: &str, owner: Option<&str>) -> ServiceNode {
        ServiceNode {
            id: id.to_string(),
            name: id.to_string(),
            language: "go".to_string(),
            framework: framework.to_string(),
            otel_enabled: false,
            tenant_id: "t".to_string(),
            team_owner: owner.map(String::from),
            namespace_acl: vec![],
            read_roles: vec![],
            confidence: 0.8,
            content_hash: String::new(),
        }
    }

    #[test]
    fn test_normalize_name_collapses_separators() {
        assert_eq!(normalize_name("Auth_Service"), "auth-service");
        assert_eq!(normalize_name("auth.service"), "auth-service");
        assert_eq!(normalize_name("auth--service-"), "auth-service");
    }

    #[test]
    fn test_similar_services_merge() {
        let resolver = EntityResolver::default();
        let out = resolver.resolve(vec![
            Entity::Service(service("auth_service", "gin", Some("identity"))),
            Entity::Service(service("auth-service", "gin", None)),
        ]);
        let services: Vec<_> = out
            .iter()
            .filter_map(|e| match e {
                Entity::Service(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].team_owner.as_deref(), Some("identity"));
    }

    #[test]
    fn test_dissimilar_services_stay_separate() {
        let resolver = EntityResolver::new(0.9);
        let out = resolver.resolve(vec![
            Entity::Service(service("gateway", "gin", Some("platform"))),
            Entity::Service(service("gateway", "fastapi", Some("ml"))),
        ]);
        let count = out
            .iter()
            .filter(|e| matches!(e, Entity::Service(_)))
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cross_tenant_services_never_merge() {
        let resolver = EntityResolver::default();
        let mut other_tenant = service("auth", "gin", None);
        other_tenant.tenant_id = "other".to_string();
        let out = resolver.resolve(vec![
            Entity::Service(service("auth", "gin", None)),
            Entity::Service(other_tenant),
        ]);
        let count = out
            .iter()
            .filter(|e| matches!(e, Entity::Service(_)))
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_edge_endpoints_follow_canonical_id() {
        let resolver = EntityResolver::default();
        let out = resolver.resolve(vec![
            Entity::Service(service("auth-service", "gin", None)),
            Entity::Service(service("auth_service", "gin", None)),
            Entity::Calls(CallsEdge {
                source_service_id: "auth_service".to_string(),
                target_service_id: "billing".to_string(),
                protocol: "http".to_string(),
                tenant_id: "t".to_string(),
                confidence: 1.0,
                ingestion_id: String::new(),
                last_seen_at: String::new(),
            }),
        ]);
        let edge = out
            .iter()
            .find_map(|e| match e {
                Entity::Calls(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(edge.source_service_id, "auth-service");
    }

    #[test]
    fn test_duplicate_edges_collapse_after_rewrite() {
        let resolver = EntityResolver::default();
        let edge = |src: &str| {
            Entity::Calls(CallsEdge {
                source_service_id: src.to_string(),
                target_service_id: "billing".to_string(),
                protocol: "http".to_string(),
                tenant_id: "t".to_string(),
                confidence: 1.0,
                ingestion_id: String::new(),
                last_seen_at: String::new(),
            })
        };
        let out = resolver.resolve(vec![
            Entity::Service(service("auth-service", "gin", None)),
            Entity::Service(service("auth_service", "gin", None)),
            edge("auth-service"),
            edge("auth_service"),
        ]);
        let edges = out
            .iter()
            .filter(|e| matches!(e, Entity::Calls(_)))
            .count();
        assert_eq!(edges, 1);
    }
}
