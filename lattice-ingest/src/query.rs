//! The query flow.
//!
//! classify -> retrieve -> assemble -> format. A question that matches a
//! template runs the template statement; anything else expands from a
//! start node through the traversal engine. Both paths share the tenant
//! session, the ACL identity, and the token budget, and the result is
//! always an HMAC-fenced context block.

use std::sync::Arc;

use lattice_context::{truncate_context_topology, Candidate, ContextBlock, ContextFormatter};
use lattice_core::{LatticeResult, TokenBudget, TraversalConfig};
use lattice_graph::GraphStore;
use lattice_guard::{
    sanitize_query_input, AclParams, QueryParams, SecurityProvider, TenantScopedSession,
    DEFAULT_MAX_QUERY_CHARS,
};
use lattice_traverse::{match_template, run_traversal, TemplateCatalog};

/// How the flow answered: which retrieval path ran.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalPath {
    Template(String),
    Traversal,
    Empty,
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub path: RetrievalPath,
    pub sanitized_question: String,
    pub context: ContextBlock,
    pub record_count: usize,
}

pub struct QueryFlow {
    store: Arc<dyn GraphStore>,
    tenant_id: String,
    acl: AclParams,
    traversal_config: TraversalConfig,
    budget: TokenBudget,
    formatter: ContextFormatter,
    catalog: TemplateCatalog,
    security: SecurityProvider,
}

impl QueryFlow {
    pub fn new(
        store: Arc<dyn GraphStore>,
        tenant_id: &str,
        acl: AclParams,
        traversal_config: TraversalConfig,
        budget: TokenBudget,
    ) -> Self {
        Self {
            store,
            tenant_id: tenant_id.to_string(),
            acl,
            traversal_config,
            budget,
            formatter: ContextFormatter::new(),
            catalog: TemplateCatalog::new(),
            security: SecurityProvider::new(),
        }
    }

    async fn run_template(
        &self,
        template_name: &str,
        extracted: &std::collections::HashMap<String, String>,
    ) -> LatticeResult<Vec<Candidate>> {
        let Some(template) = self.catalog.get(template_name) else {
            return Ok(Vec::new());
        };
        let session = TenantScopedSession::new(&self.tenant_id);
        let mut params = QueryParams::new();
        for (key, value) in extracted {
            // `limit` binds as an integer, names bind as strings.
            match value.parse::<i64>() {
                Ok(number) if key == "limit" => {
                    params.insert(key.clone(), number.into());
                }
                _ => {
                    params.insert(key.clone(), value.clone().into());
                }
            }
        }
        self.acl.apply(&mut params);
        let params = session.validate_query(template.cypher, &params)?;
        self.security.validate_query(template.cypher, &params, true)?;
        self.store.execute_read(template.cypher, &params).await
    }

    /// Answer a question: sanitize, classify, retrieve, rank, format.
    pub async fn answer(
        &self,
        question: &str,
        start_node_hint: Option<&str>,
        degree_hint: Option<u64>,
    ) -> LatticeResult<QueryOutcome> {
        let sanitized_question = sanitize_query_input(question, DEFAULT_MAX_QUERY_CHARS);

        let (path, candidates) = if let Some(matched) = match_template(question) {
            let rows = self
                .run_template(&matched.template_name, &matched.params)
                .await?;
            (RetrievalPath::Template(matched.template_name), rows)
        } else if let Some(start) = start_node_hint {
            let rows = run_traversal(
                self.store.as_ref(),
                start,
                &self.tenant_id,
                &self.acl,
                &self.traversal_config,
                degree_hint,
            )
            .await?;
            (RetrievalPath::Traversal, rows)
        } else {
            (RetrievalPath::Empty, Vec::new())
        };

        let ranked = truncate_context_topology(&candidates, &self.budget);
        let record_count = ranked.len();
        let context = self
            .formatter
            .format_context_for_prompt(&ranked, &self.budget)?;

        Ok(QueryOutcome {
            path,
            sanitized_question,
            context,
            record_count,
        })
    }
}
