//! ACL enforcement and the canonical traversal statement builders.
//!
//! This module is the single producer of the ACL fragment. Every traversal
//! statement in the workspace is built here so the runtime validator, the
//! build-time scanner, and the statements themselves cannot drift apart.

use once_cell::sync::Lazy;
use regex::Regex;

use lattice_core::{LatticeResult, SecurityError, ValidationError};

use crate::session::{query_references_tenant_id, QueryParams};

/// Relationship types a traversal may expand. Anything else is refused
/// before statement construction.
pub const ALLOWED_RELATIONSHIP_TYPES: [&str; 4] = ["CALLS", "PRODUCES", "CONSUMES", "DEPLOYED_IN"];

/// Markers whose presence satisfies the ACL requirement.
const ACL_MARKERS: [&str; 5] = [
    "$is_admin",
    "$acl_team",
    "$acl_namespaces",
    "team_owner",
    "namespace_acl",
];

static CLAUSE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(MATCH|WITH|RETURN|UNWIND|MERGE|CREATE|CALL|SET|DELETE|DETACH)\b").unwrap()
});

/// Check that every MATCH scope (pattern plus its WHERE) references
/// tenant_id. A MATCH that relies on a later clause for scoping is a leak.
pub fn validate_acl_coverage(cypher: &str) -> bool {
    let mut boundaries: Vec<(usize, String)> = CLAUSE_KEYWORD
        .find_iter(cypher)
        .map(|m| (m.start(), m.as_str().to_ascii_uppercase()))
        .collect();
    boundaries.push((cypher.len(), String::new()));

    for window in boundaries.windows(2) {
        let (start, ref keyword) = window[0];
        let (end, _) = window[1];
        if keyword == "MATCH" {
            let scope = &cypher[start..end];
            if !scope.contains("tenant_id") {
                return false;
            }
        }
    }
    true
}

/// Runtime validator layered above [`TenantScopedSession`]: additionally
/// requires a non-empty tenant parameter, tenant coverage in every MATCH
/// scope, and at least one ACL marker in the statement.
#[derive(Debug, Clone, Default)]
pub struct SecurityProvider;

impl SecurityProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_query(
        &self,
        cypher: &str,
        params: &QueryParams,
        require_acl: bool,
    ) -> LatticeResult<()> {
        let tenant_ok = params
            .get("tenant_id")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !tenant_ok {
            return Err(SecurityError::SecurityViolation {
                reason: "tenant_id parameter is missing or empty".to_string(),
            }
            .into());
        }

        if !query_references_tenant_id(cypher) {
            return Err(SecurityError::SecurityViolation {
                reason: "query does not reference tenant_id".to_string(),
            }
            .into());
        }

        if !validate_acl_coverage(cypher) {
            return Err(SecurityError::SecurityViolation {
                reason: "tenant_id filter missing from one or more MATCH scopes".to_string(),
            }
            .into());
        }

        if require_acl && !ACL_MARKERS.iter().any(|marker| cypher.contains(marker)) {
            return Err(SecurityError::SecurityViolation {
                reason: "query does not contain ACL enforcement clause".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

// ============================================================================
// ACL PARAMETERS
// ============================================================================

/// Caller identity for ACL predicates: admin bypass, team match, or
/// namespace-ACL membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AclParams {
    pub is_admin: bool,
    pub acl_team: String,
    pub acl_namespaces: Vec<String>,
}

impl AclParams {
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Default::default()
        }
    }

    pub fn for_team(team: impl Into<String>, namespaces: Vec<String>) -> Self {
        Self {
            is_admin: false,
            acl_team: team.into(),
            acl_namespaces: namespaces,
        }
    }

    /// Merge into a query parameter map.
    pub fn apply(&self, params: &mut QueryParams) {
        params.insert("is_admin".to_string(), self.is_admin.into());
        params.insert("acl_team".to_string(), self.acl_team.clone().into());
        params.insert(
            "acl_namespaces".to_string(),
            serde_json::Value::Array(
                self.acl_namespaces
                    .iter()
                    .map(|ns| serde_json::Value::String(ns.clone()))
                    .collect(),
            ),
        );
    }
}

// ============================================================================
// STATEMENT BUILDERS
// ============================================================================

/// The canonical ACL fragment over `alias`. Empty when `skip_acl` is set —
/// valid only under physical tenant isolation, where the database boundary
/// already enforces what the predicate would.
fn acl_where_fragment(alias: &str, skip_acl: bool) -> String {
    if skip_acl {
        return String::new();
    }
    format!(
        "AND ($is_admin OR {alias}.team_owner = $acl_team \
         OR ANY(ns IN {alias}.namespace_acl WHERE ns IN $acl_namespaces)) "
    )
}

fn check_relationship_type(rel_type: &str) -> LatticeResult<()> {
    if !ALLOWED_RELATIONSHIP_TYPES.contains(&rel_type) {
        return Err(ValidationError::OutOfRange {
            field: "rel_type".to_string(),
            value: rel_type.to_string(),
            reason: "not an allowed relationship type".to_string(),
        }
        .into());
    }
    Ok(())
}

/// One-hop expansion over a single allowed relationship type.
pub fn build_traversal_one_hop(rel_type: &str, skip_acl: bool) -> LatticeResult<String> {
    check_relationship_type(rel_type)?;
    let acl = acl_where_fragment("target", skip_acl);
    Ok(format!(
        "MATCH (source {{id: $source_id, tenant_id: $tenant_id}})-[r:{rel_type}]->(target) \
         WHERE target.tenant_id = $tenant_id \
         AND r.tombstoned_at IS NULL \
         {acl}\
         RETURN target {{.*}} AS result, type(r) AS rel_type \
         LIMIT $limit"
    ))
}

/// Untyped neighbor discovery with deterministic ordering.
pub fn build_neighbor_discovery(skip_acl: bool) -> String {
    let acl = acl_where_fragment("target", skip_acl);
    format!(
        "MATCH (source {{id: $source_id, tenant_id: $tenant_id}})-[r]->(target) \
         WHERE target.tenant_id = $tenant_id \
         AND r.tombstoned_at IS NULL \
         {acl}\
         RETURN target.id AS target_id, target.name AS target_name, \
         type(r) AS rel_type, labels(target)[0] AS target_label, \
         coalesce(target.pagerank, 0) AS pagerank, \
         coalesce(target.degree, 0) AS degree \
         ORDER BY pagerank DESC, degree DESC, target.id \
         LIMIT $limit"
    )
}

/// Deterministic supernode sample: top neighbors by (pagerank, degree, id).
/// Never `rand()` — the sample must be identical across replicas and runs.
pub fn build_sampled_neighbor(skip_acl: bool) -> String {
    let acl = acl_where_fragment("target", skip_acl);
    format!(
        "MATCH (source {{id: $source_id, tenant_id: $tenant_id}})-[r]->(target) \
         WHERE target.tenant_id = $tenant_id AND r.tombstoned_at IS NULL \
         {acl}\
         RETURN target.id AS target_id, target.name AS target_name, \
         type(r) AS rel_type, labels(target)[0] AS target_label, \
         coalesce(target.pagerank, 0) AS pagerank, \
         coalesce(target.degree, 0) AS degree \
         ORDER BY pagerank DESC, degree DESC, target.id \
         LIMIT $sample_size"
    )
}

/// Semantic supernode sample: fetch neighbor embeddings for client-side
/// cosine ranking against the query embedding.
pub fn build_semantic_neighbor_scan(skip_acl: bool) -> String {
    let acl = acl_where_fragment("target", skip_acl);
    format!(
        "MATCH (source {{id: $source_id, tenant_id: $tenant_id}})-[r]->(target) \
         WHERE target.tenant_id = $tenant_id AND r.tombstoned_at IS NULL \
         {acl}\
         RETURN target.id AS target_id, target.name AS target_name, \
         type(r) AS rel_type, labels(target)[0] AS target_label, \
         target.embedding AS embedding, \
         coalesce(target.pagerank, 0) AS pagerank, \
         coalesce(target.degree, 0) AS degree \
         LIMIT $scan_limit"
    )
}

/// Batched multi-source hop with a per-source expansion cap (the collect
/// slice) so one high-degree source cannot dominate the frontier, plus a
/// global LIMIT.
pub fn build_batched_neighbor(skip_acl: bool) -> String {
    let acl = acl_where_fragment("target", skip_acl);
    format!(
        "UNWIND $frontier_ids AS fid \
         MATCH (source {{id: fid, tenant_id: $tenant_id}})-[r]->(target) \
         WHERE target.tenant_id = $tenant_id \
         AND r.tombstoned_at IS NULL \
         {acl}\
         WITH source, target, r \
         ORDER BY coalesce(target.pagerank, 0) DESC, \
         coalesce(target.degree, 0) DESC, target.id \
         WITH source, collect({{source_id: source.id, target_id: target.id, \
         target_name: target.name, rel_type: type(r), \
         target_label: labels(target)[0], \
         pagerank: coalesce(target.pagerank, 0), \
         degree: coalesce(target.degree, 0)}})[0..$per_source_limit] AS rows \
         UNWIND rows AS row \
         RETURN row.source_id AS source_id, row.target_id AS target_id, \
         row.target_name AS target_name, row.rel_type AS rel_type, \
         row.target_label AS target_label, row.pagerank AS pagerank, \
         row.degree AS degree \
         LIMIT $limit"
    )
}

/// One-round-trip degree lookup for a frontier batch. Degrees of nodes the
/// caller cannot see are not revealed either.
pub fn build_batch_degree_check(skip_acl: bool) -> String {
    let acl = acl_where_fragment("n", skip_acl);
    let guard = if acl.is_empty() {
        String::new()
    } else {
        format!("WHERE true {acl}")
    };
    format!(
        "UNWIND $node_ids AS nid \
         MATCH (n {{id: nid, tenant_id: $tenant_id}}) \
         {guard}\
         RETURN n.id AS id, coalesce(n.degree, 0) AS degree"
    )
}

/// Single bounded-path statement. `max_hops` is clamped to [1, 5] before
/// interpolation; everything else is parameter-bound.
pub fn build_bounded_path(max_hops: usize, skip_acl: bool) -> String {
    let hops = max_hops.clamp(1, 5);
    let acl = acl_where_fragment("target", skip_acl);
    format!(
        "MATCH (source {{id: $source_id, tenant_id: $tenant_id}})-[rels*1..{hops}]->(target) \
         WHERE target.tenant_id = $tenant_id \
         AND ALL(rel IN rels WHERE rel.tombstoned_at IS NULL) \
         {acl}\
         RETURN DISTINCT target {{.*}} AS result, labels(target)[0] AS target_label, \
         coalesce(target.pagerank, 0) AS pagerank, \
         coalesce(target.degree, 0) AS degree \
         ORDER BY pagerank DESC, degree DESC, target.id \
         LIMIT $max_nodes"
    )
}

/// Procedure-based expansion, node side.
pub fn build_procedure_nodes(skip_acl: bool) -> String {
    let acl = acl_where_fragment("node", skip_acl);
    format!(
        "MATCH (start {{id: $start_id, tenant_id: $tenant_id}}) \
         CALL apoc.path.subgraphNodes(start, {{maxLevel: $max_hops, limit: $max_nodes}}) \
         YIELD node \
         WITH node WHERE node.tenant_id = $tenant_id \
         {acl}\
         RETURN node {{.*}} AS node, labels(node) AS labels"
    )
}

/// Procedure-based expansion, edge side. Endpoints outside the node set are
/// dropped by the caller.
pub fn build_procedure_edges(skip_acl: bool) -> String {
    let acl = acl_where_fragment("b", skip_acl);
    format!(
        "MATCH (a {{tenant_id: $tenant_id}})-[r]->(b {{tenant_id: $tenant_id}}) \
         WHERE a.id IN $node_ids AND b.id IN $node_ids \
         AND r.tombstoned_at IS NULL \
         {acl}\
         RETURN a.id AS source, b.id AS target, type(r) AS rel_type"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::LatticeError;
    use serde_json::json;

    fn tenant_params() -> QueryParams {
        let mut params = QueryParams::new();
        params.insert("tenant_id".to_string(), json!("tenant-a"));
        params
    }

    #[test]
    fn test_one_hop_refuses_unknown_relationship() {
        assert!(build_traversal_one_hop("CALLS", false).is_ok());
        assert!(build_traversal_one_hop("OWNS", false).is_err());
        // An injection attempt through the type parameter never reaches the
        // statement builder's format string.
        assert!(build_traversal_one_hop("CALLS]->() MATCH (x", false).is_err());
    }

    #[test]
    fn test_builders_emit_tenant_and_acl_markers() {
        let provider = SecurityProvider::new();
        for query in [
            build_traversal_one_hop("CALLS", false).unwrap(),
            build_neighbor_discovery(false),
            build_sampled_neighbor(false),
            build_batched_neighbor(false),
            build_batch_degree_check(false),
            build_bounded_path(3, false),
            build_procedure_nodes(false),
            build_procedure_edges(false),
        ] {
            provider
                .validate_query(&query, &tenant_params(), true)
                .unwrap_or_else(|e| panic!("{query}: {e}"));
        }
    }

    #[test]
    fn test_skip_acl_drops_predicate_but_keeps_tenant() {
        let query = build_neighbor_discovery(true);
        assert!(!query.contains("$is_admin"));
        assert!(query.contains("$tenant_id"));
        // Still validates with ACL requirement relaxed.
        SecurityProvider::new()
            .validate_query(&query, &tenant_params(), false)
            .unwrap();
    }

    #[test]
    fn test_acl_coverage_flags_unscoped_match() {
        let good = "MATCH (a {tenant_id: $tenant_id}) MATCH (b {tenant_id: $tenant_id}) RETURN a, b";
        assert!(validate_acl_coverage(good));
        let bad = "MATCH (a {tenant_id: $tenant_id}) MATCH (b:Service) RETURN a, b";
        assert!(!validate_acl_coverage(bad));
    }

    #[test]
    fn test_validator_requires_nonempty_tenant_param() {
        let provider = SecurityProvider::new();
        let query = build_neighbor_discovery(false);
        let err = provider
            .validate_query(&query, &QueryParams::new(), true)
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Security(SecurityError::SecurityViolation { .. })
        ));
    }

    #[test]
    fn test_validator_requires_acl_marker() {
        let provider = SecurityProvider::new();
        let query = "MATCH (n {tenant_id: $tenant_id}) RETURN n";
        let err = provider
            .validate_query(query, &tenant_params(), true)
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Security(SecurityError::SecurityViolation { .. })
        ));
        // Relaxed mode accepts it.
        provider.validate_query(query, &tenant_params(), false).unwrap();
    }

    #[test]
    fn test_acl_params_apply() {
        let mut params = tenant_params();
        AclParams::for_team("payments", vec!["prod".to_string()]).apply(&mut params);
        assert_eq!(params.get("is_admin"), Some(&json!(false)));
        assert_eq!(params.get("acl_team"), Some(&json!("payments")));
        assert_eq!(params.get("acl_namespaces"), Some(&json!(["prod"])));
    }

    #[test]
    fn test_batched_neighbor_caps_per_source() {
        let query = build_batched_neighbor(false);
        assert!(query.contains("[0..$per_source_limit]"));
        assert!(query.contains("LIMIT $limit"));
    }
}
