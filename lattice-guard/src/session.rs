//! Tenant-scoped session validation.
//!
//! Data queries never interpolate tenant values: the session validates that
//! the query text parameter-binds `$tenant_id` (or is schema DDL on the
//! allowlist) and injects the session tenant into the parameter map,
//! refusing cross-tenant parameter values.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use lattice_core::{LatticeResult, SecurityError};

/// Graph-query parameter map. serde_json maps keep the driver seam untyped
/// without giving up structure.
pub type QueryParams = serde_json::Map<String, serde_json::Value>;

static TENANT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$tenant_id|tenant_id\s*[:=]").unwrap());

static INDEX_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+(RANGE\s+|VECTOR\s+|FULLTEXT\s+|TEXT\s+|POINT\s+|LOOKUP\s+)?INDEX\b")
        .unwrap()
});
static CONSTRAINT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*CREATE\s+CONSTRAINT\b").unwrap());
static SCHEMA_CALL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*CALL\s+(db\.|dbms\.|gds\.)").unwrap());
static DROP_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*DROP\s+(INDEX|CONSTRAINT)\b").unwrap());

/// Statements allowed verbatim without tenant scoping: tombstone-index DDL
/// and the edition probe. Kept in lockstep with the canonical schema file.
pub static SCHEMA_DDL_ALLOWLIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "CREATE RANGE INDEX tombstone_calls_idx IF NOT EXISTS \
         FOR ()-[r:CALLS]-() ON (r.tombstoned_at)",
        "CREATE RANGE INDEX tombstone_produces_idx IF NOT EXISTS \
         FOR ()-[r:PRODUCES]-() ON (r.tombstoned_at)",
        "CREATE RANGE INDEX tombstone_consumes_idx IF NOT EXISTS \
         FOR ()-[r:CONSUMES]-() ON (r.tombstoned_at)",
        "CREATE RANGE INDEX tombstone_deployed_in_idx IF NOT EXISTS \
         FOR ()-[r:DEPLOYED_IN]-() ON (r.tombstoned_at)",
        "CALL dbms.components() YIELD edition RETURN edition",
    ])
});

/// True for schema DDL by prefix: index/constraint creation, schema-namespace
/// CALLs, and index/constraint drops.
pub fn is_schema_ddl(query: &str) -> bool {
    let stripped = query.trim_start();
    INDEX_PREFIX.is_match(stripped)
        || CONSTRAINT_PREFIX.is_match(stripped)
        || SCHEMA_CALL_PREFIX.is_match(stripped)
        || DROP_PREFIX.is_match(stripped)
}

/// True when the query text references tenant_id as parameter or predicate.
pub fn query_references_tenant_id(query: &str) -> bool {
    TENANT_ID_PATTERN.is_match(query)
}

/// A graph session bound to a single tenant.
///
/// Every data query routed through [`validate_query`](Self::validate_query)
/// leaves with `tenant_id` bound to the session tenant or is refused.
#[derive(Debug, Clone)]
pub struct TenantScopedSession {
    tenant_id: String,
    allowlist: HashSet<&'static str>,
}

impl TenantScopedSession {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            allowlist: SCHEMA_DDL_ALLOWLIST.clone(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Validate a query and return the augmented parameter map.
    ///
    /// 1. Allowlisted or prefix-matched schema DDL passes as-is.
    /// 2. Everything else must reference `$tenant_id`.
    /// 3. A caller-supplied `tenant_id` param must equal the session tenant.
    /// 4. Otherwise the session tenant is injected.
    pub fn validate_query(&self, query: &str, params: &QueryParams) -> LatticeResult<QueryParams> {
        if self.allowlist.contains(query) || is_schema_ddl(query) {
            return Ok(params.clone());
        }

        if !query_references_tenant_id(query) {
            return Err(SecurityError::TenantScopeViolation {
                reason: "query does not reference $tenant_id and is not on the schema DDL \
                         allowlist; all data queries must include tenant_id scoping"
                    .to_string(),
            }
            .into());
        }

        let mut result = params.clone();
        match result.get("tenant_id").and_then(|v| v.as_str()) {
            Some(existing) if existing != self.tenant_id => {
                return Err(SecurityError::TenantScopeViolation {
                    reason: format!(
                        "tenant_id parameter mismatch: session bound to {:?} but query supplies \
                         {existing:?}; cross-tenant access blocked",
                        self.tenant_id
                    ),
                }
                .into());
            }
            Some(_) => {}
            None => {
                result.insert(
                    "tenant_id".to_string(),
                    serde_json::Value::String(self.tenant_id.clone()),
                );
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::LatticeError;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> QueryParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_allowlisted_ddl_passes_unscoped() {
        let session = TenantScopedSession::new("tenant-a");
        let query = "CALL dbms.components() YIELD edition RETURN edition";
        assert!(session.validate_query(query, &QueryParams::new()).is_ok());
    }

    #[test]
    fn test_ddl_prefixes_pass_unscoped() {
        let session = TenantScopedSession::new("tenant-a");
        for query in [
            "CREATE INDEX svc_idx IF NOT EXISTS FOR (n:Service) ON (n.id)",
            "CREATE VECTOR INDEX emb IF NOT EXISTS FOR (n:Service) ON (n.embedding)",
            "CREATE CONSTRAINT svc_key IF NOT EXISTS FOR (n:Service) REQUIRE (n.id, n.tenant_id) IS NODE KEY",
            "DROP INDEX svc_idx IF EXISTS",
            "CALL db.indexes()",
        ] {
            assert!(session.validate_query(query, &QueryParams::new()).is_ok(), "{query}");
        }
    }

    #[test]
    fn test_unscoped_data_query_refused() {
        let session = TenantScopedSession::new("tenant-a");
        let err = session
            .validate_query("MATCH (n:Service) RETURN n", &QueryParams::new())
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Security(SecurityError::TenantScopeViolation { .. })
        ));
    }

    #[test]
    fn test_session_tenant_is_injected() {
        let session = TenantScopedSession::new("tenant-a");
        let out = session
            .validate_query(
                "MATCH (n:Service {tenant_id: $tenant_id}) RETURN n",
                &QueryParams::new(),
            )
            .unwrap();
        assert_eq!(out.get("tenant_id"), Some(&json!("tenant-a")));
    }

    #[test]
    fn test_cross_tenant_parameter_blocked() {
        let session = TenantScopedSession::new("tenant-a");
        let err = session
            .validate_query(
                "MATCH (n:Service {tenant_id: $tenant_id}) RETURN n",
                &params(&[("tenant_id", json!("tenant-b"))]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Security(SecurityError::TenantScopeViolation { .. })
        ));
    }

    #[test]
    fn test_matching_tenant_parameter_passes_through() {
        let session = TenantScopedSession::new("tenant-a");
        let out = session
            .validate_query(
                "MATCH (n:Service {tenant_id: $tenant_id}) RETURN n",
                &params(&[("tenant_id", json!("tenant-a")), ("limit", json!(10))]),
            )
            .unwrap();
        assert_eq!(out.get("limit"), Some(&json!(10)));
    }
}
