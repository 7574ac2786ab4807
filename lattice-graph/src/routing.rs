//! Tenant registry and database routing.
//!
//! Tenants are isolated logically (shared database, mandatory tenant and
//! ACL predicates) or physically (database per tenant). The registry is the
//! single place that decision lives: traversal consults it to decide
//! whether `skip_acl` is legal, the driver layer consults it to pick the
//! target database.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use lattice_core::{LatticeResult, SecurityError};

/// How a tenant's data is separated from everyone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Shared database; every query carries tenant and ACL predicates.
    Logical,
    /// Dedicated database; the boundary itself enforces isolation and
    /// traversal may legally skip ACL predicates.
    Physical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub isolation: IsolationMode,
    /// Database name for physical tenants; ignored for logical ones.
    #[serde(default)]
    pub database: Option<String>,
}

/// In-process tenant registry.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    default_database: String,
    tenants: RwLock<HashMap<String, TenantRecord>>,
}

impl TenantRegistry {
    pub fn new(default_database: impl Into<String>) -> Self {
        Self {
            default_database: default_database.into(),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, record: TenantRecord) -> LatticeResult<()> {
        if record.tenant_id.is_empty() {
            return Err(SecurityError::IngestRejection {
                reason: "tenant registration requires a non-empty tenant id".to_string(),
            }
            .into());
        }
        if record.isolation == IsolationMode::Physical
            && record.database.as_deref().unwrap_or("").is_empty()
        {
            return Err(SecurityError::IngestRejection {
                reason: format!(
                    "physical tenant {:?} requires a dedicated database name",
                    record.tenant_id
                ),
            }
            .into());
        }
        self.tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.tenant_id.clone(), record);
        Ok(())
    }

    /// Unregistered tenants are logical by default — the safe direction.
    pub fn isolation_for(&self, tenant_id: &str) -> IsolationMode {
        self.tenants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant_id)
            .map(|r| r.isolation)
            .unwrap_or(IsolationMode::Logical)
    }

    /// The database a tenant's queries must run against.
    pub fn database_for(&self, tenant_id: &str) -> String {
        self.tenants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant_id)
            .and_then(|r| r.database.clone())
            .unwrap_or_else(|| self.default_database.clone())
    }

    /// ACL predicates may be skipped only under physical isolation.
    pub fn may_skip_acl(&self, tenant_id: &str) -> bool {
        self.isolation_for(tenant_id) == IsolationMode::Physical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_tenants_default_to_logical() {
        let registry = TenantRegistry::new("neo4j");
        assert_eq!(registry.isolation_for("stranger"), IsolationMode::Logical);
        assert!(!registry.may_skip_acl("stranger"));
        assert_eq!(registry.database_for("stranger"), "neo4j");
    }

    #[test]
    fn test_physical_tenant_routes_to_its_database() {
        let registry = TenantRegistry::new("neo4j");
        registry
            .register(TenantRecord {
                tenant_id: "acme".to_string(),
                isolation: IsolationMode::Physical,
                database: Some("acme_graph".to_string()),
            })
            .unwrap();
        assert!(registry.may_skip_acl("acme"));
        assert_eq!(registry.database_for("acme"), "acme_graph");
    }

    #[test]
    fn test_physical_without_database_is_refused() {
        let registry = TenantRegistry::new("neo4j");
        let err = registry
            .register(TenantRecord {
                tenant_id: "acme".to_string(),
                isolation: IsolationMode::Physical,
                database: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            lattice_core::LatticeError::Security(SecurityError::IngestRejection { .. })
        ));
    }

    #[test]
    fn test_empty_tenant_is_refused() {
        let registry = TenantRegistry::new("neo4j");
        assert!(registry
            .register(TenantRecord {
                tenant_id: String::new(),
                isolation: IsolationMode::Logical,
                database: None,
            })
            .is_err());
    }
}
