//! Graph repository: the single writer.
//!
//! Commits run in a deterministic total order on (type, primary key) — the
//! lock-acquisition order on the database, identical across replicas so hot
//! targets cannot deadlock. Node groups complete before any edge group
//! starts; per-type groups run concurrently up to `write_concurrency`; hot
//! edges (in-batch target in-degree over threshold) are written in one
//! serialized UNWIND instead of competing chunks. Degree refresh is
//! decoupled: commit returns affected ids, callers schedule the refresh.

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lattice_core::{
    compute_hashes, Entity, GraphConfig, LatticeResult, ValidationError,
};
use lattice_guard::{AclParams, QueryParams, SecurityProvider, TenantScopedSession};
use lattice_resilience::CircuitBreaker;

use crate::ontology::{build_unwind_queries, validate_cypher_identifier, Ontology};
use crate::store::{EmbeddingRecord, GraphStore, Row};

/// Ids of nodes whose degree must be refreshed after a commit or prune.
pub type AffectedIds = HashSet<String>;

/// Deterministic total order for writes: (type_name, primary_key).
pub fn sort_entities_for_write(entities: &mut [Entity]) {
    entities.sort_by(|a, b| {
        (a.type_name(), a.primary_key()).cmp(&(b.type_name(), b.primary_key()))
    });
}

/// Split `items` into chunks of at most `size`.
pub fn chunk_list<T: Clone>(items: &[T], size: usize) -> Vec<Vec<T>> {
    items.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

/// The in-batch endpoint a hot-edge split keys on.
fn edge_target_ref(entity: &Entity) -> Option<&str> {
    match entity {
        Entity::Calls(e) => Some(&e.target_service_id),
        Entity::Produces(e) => Some(&e.topic_name),
        Entity::Consumes(e) => Some(&e.topic_name),
        Entity::DeployedIn(e) => Some(&e.deployment_id),
        _ => None,
    }
}

/// Targets whose in-batch in-degree reaches `threshold`.
pub fn detect_hot_targets(edges: &[Entity], threshold: usize) -> HashSet<String> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for edge in edges {
        if let Some(target) = edge_target_ref(edge) {
            *in_degree.entry(target).or_default() += 1;
        }
    }
    in_degree
        .into_iter()
        .filter(|(_, count)| *count >= threshold)
        .map(|(target, _)| target.to_string())
        .collect()
}

pub struct GraphRepository {
    store: Arc<dyn GraphStore>,
    breaker: Arc<CircuitBreaker>,
    ontology: Ontology,
    unwind_queries: HashMap<String, String>,
    security: SecurityProvider,
    config: GraphConfig,
}

impl GraphRepository {
    pub fn new(
        store: Arc<dyn GraphStore>,
        breaker: Arc<CircuitBreaker>,
        ontology: Ontology,
        config: GraphConfig,
    ) -> LatticeResult<Self> {
        ontology.validate()?;
        let unwind_queries = build_unwind_queries(&ontology);
        Ok(Self {
            store,
            breaker,
            ontology,
            unwind_queries,
            security: SecurityProvider::new(),
            config,
        })
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    /// Commit and discard the affected-id set.
    pub async fn commit_topology(
        &self,
        entities: Vec<Entity>,
        tenant_id: &str,
        ingestion_id: &str,
    ) -> LatticeResult<()> {
        self.commit_topology_with_affected_ids(entities, tenant_id, ingestion_id)
            .await
            .map(|_| ())
    }

    /// Commit the entity set and return the node ids whose degree changed.
    ///
    /// Degree recomputation is never done inside the commit; callers
    /// schedule [`refresh_degree_for_ids`](Self::refresh_degree_for_ids)
    /// asynchronously with the returned set.
    pub async fn commit_topology_with_affected_ids(
        &self,
        mut entities: Vec<Entity>,
        tenant_id: &str,
        ingestion_id: &str,
    ) -> LatticeResult<AffectedIds> {
        if entities.is_empty() {
            return Ok(AffectedIds::new());
        }

        // An entity type the ontology cannot write is a caller bug, not a
        // driver failure; refuse before the breaker sees anything.
        for entity in &entities {
            if !self.unwind_queries.contains_key(entity.type_name()) {
                return Err(ValidationError::UnknownEntityType {
                    type_name: entity.type_name().to_string(),
                }
                .into());
            }
        }

        let last_seen_at = Utc::now().to_rfc3339();
        for entity in entities.iter_mut() {
            entity.stamp_ingestion(ingestion_id, &last_seen_at);
        }
        compute_hashes(&mut entities);
        sort_entities_for_write(&mut entities);

        let (nodes, edges): (Vec<Entity>, Vec<Entity>) =
            entities.into_iter().partition(Entity::is_node);

        let mut affected = AffectedIds::new();
        for node in &nodes {
            affected.insert(node.primary_key());
        }
        for edge in &edges {
            if let Entity::Calls(e) = edge {
                affected.insert(e.source_service_id.clone());
            } else if let Entity::Produces(e) = edge {
                affected.insert(e.service_id.clone());
            } else if let Entity::Consumes(e) = edge {
                affected.insert(e.service_id.clone());
            } else if let Entity::DeployedIn(e) = edge {
                affected.insert(e.service_id.clone());
            }
            if let Some(target) = edge_target_ref(edge) {
                affected.insert(target.to_string());
            }
        }

        let session = TenantScopedSession::new(tenant_id);
        self.breaker
            .call(self.execute_batched_commit(&session, nodes, edges))
            .await?;
        Ok(affected)
    }

    async fn execute_batched_commit(
        &self,
        session: &TenantScopedSession,
        nodes: Vec<Entity>,
        edges: Vec<Entity>,
    ) -> LatticeResult<()> {
        // Referential integrity: every node group lands before any edge.
        let node_groups = self.group_rows(nodes)?;
        self.write_groups_concurrently(session, node_groups).await?;

        let hot_targets = detect_hot_targets(&edges, self.config.hot_edge_threshold);
        let (hot, cold): (Vec<Entity>, Vec<Entity>) = edges.into_iter().partition(|e| {
            edge_target_ref(e).is_some_and(|t| hot_targets.contains(t))
        });

        let cold_groups = self.group_rows(cold)?;
        self.write_groups_concurrently(session, cold_groups).await?;

        // Hot edges collapse onto few targets; chunked concurrent writes
        // would serialize on the target lock anyway and amplify deadlock
        // exposure. One UNWIND per type, sequentially.
        if !hot.is_empty() {
            tracing::debug!(count = hot.len(), "writing hot edges serialized");
            for (query, rows) in self.group_rows(hot)? {
                self.run_unwind(session, &query, rows).await?;
            }
        }
        Ok(())
    }

    /// Group entities by type and pair each group with its UNWIND statement.
    /// An entity type missing from the ontology is a hard error — records
    /// are never silently dropped.
    fn group_rows(&self, entities: Vec<Entity>) -> LatticeResult<Vec<(String, Vec<Row>)>> {
        let mut groups: Vec<(String, Vec<Row>)> = Vec::new();
        for entity in entities {
            let type_name = entity.type_name();
            let query = self.unwind_queries.get(type_name).ok_or_else(|| {
                ValidationError::UnknownEntityType {
                    type_name: type_name.to_string(),
                }
            })?;
            match groups.iter_mut().find(|(q, _)| q == query) {
                Some((_, rows)) => rows.push(entity.to_properties()),
                None => groups.push((query.clone(), vec![entity.to_properties()])),
            }
        }
        Ok(groups)
    }

    async fn write_groups_concurrently(
        &self,
        session: &TenantScopedSession,
        groups: Vec<(String, Vec<Row>)>,
    ) -> LatticeResult<()> {
        stream::iter(groups.into_iter().map(|(query, rows)| {
            let session = session.clone();
            async move { self.run_unwind(&session, &query, rows).await }
        }))
        .buffer_unordered(self.config.write_concurrency)
        .try_collect::<Vec<()>>()
        .await?;
        Ok(())
    }

    async fn run_unwind(
        &self,
        session: &TenantScopedSession,
        query: &str,
        rows: Vec<Row>,
    ) -> LatticeResult<()> {
        for chunk in chunk_list(&rows, self.config.batch_size) {
            let mut params = QueryParams::new();
            params.insert(
                "batch".to_string(),
                serde_json::Value::Array(
                    chunk.into_iter().map(serde_json::Value::Object).collect(),
                ),
            );
            let params = session.validate_query(query, &params)?;
            self.store.execute_write(query, &params).await?;
        }
        Ok(())
    }

    // ========================================================================
    // TOMBSTONE PASS
    // ========================================================================

    /// Tombstone every edge not re-seen by the current run inside the
    /// freshness window. Returns the tombstone count and the endpoint ids
    /// that lost at least one edge (queued for vector cleanup downstream).
    pub async fn prune_stale_edges(
        &self,
        tenant_id: &str,
        current_ingestion_id: &str,
        max_age_hours: i64,
    ) -> LatticeResult<(u64, AffectedIds)> {
        let session = TenantScopedSession::new(tenant_id);
        let cutoff = (Utc::now() - ChronoDuration::hours(max_age_hours)).to_rfc3339();
        let now = Utc::now().to_rfc3339();

        let query = "MATCH (a)-[r]->(b) \
                     WHERE r.tenant_id = $tenant_id \
                     AND r.ingestion_id IS NOT NULL \
                     AND r.ingestion_id <> $current_id \
                     AND r.last_seen_at < $cutoff \
                     AND r.tombstoned_at IS NULL \
                     SET r.tombstoned_at = $now \
                     RETURN coalesce(a.id, a.name) AS source_id, \
                     coalesce(b.id, b.name) AS target_id";

        let mut params = QueryParams::new();
        params.insert("current_id".to_string(), current_ingestion_id.into());
        params.insert("cutoff".to_string(), cutoff.into());
        params.insert("now".to_string(), now.into());
        let params = session.validate_query(query, &params)?;

        let rows = self.store.execute_write(query, &params).await?;
        let mut affected = AffectedIds::new();
        for row in &rows {
            for key in ["source_id", "target_id"] {
                if let Some(id) = row.get(key).and_then(|v| v.as_str()) {
                    affected.insert(id.to_string());
                }
            }
        }
        let count = rows.len() as u64;
        if count > 0 {
            tracing::info!(count, tenant_id, "tombstoned stale edges");
        }
        Ok((count, affected))
    }

    /// Recompute the denormalized `degree` property for the supplied nodes,
    /// counting live (non-tombstoned) relationships only.
    pub async fn refresh_degree_for_ids(
        &self,
        ids: &AffectedIds,
        tenant_id: &str,
    ) -> LatticeResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let session = TenantScopedSession::new(tenant_id);
        let query = "UNWIND $node_ids AS nid \
                     MATCH (n {tenant_id: $tenant_id}) \
                     WHERE n.id = nid OR n.name = nid \
                     OPTIONAL MATCH (n)-[r]-() \
                     WHERE r.tombstoned_at IS NULL \
                     WITH n, count(r) AS live_degree \
                     SET n.degree = live_degree";

        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        let mut params = QueryParams::new();
        params.insert(
            "node_ids".to_string(),
            serde_json::Value::Array(
                sorted
                    .into_iter()
                    .map(|id| serde_json::Value::String(id.clone()))
                    .collect(),
            ),
        );
        let params = session.validate_query(query, &params)?;
        self.store.execute_write(query, &params).await?;
        Ok(())
    }

    // ========================================================================
    // READS AND DDL
    // ========================================================================

    /// Tenant-scoped read of every node with `label` visible to the caller.
    /// The tenant is a required argument, not a query-time option.
    pub async fn read_topology(
        &self,
        label: &str,
        tenant_id: &str,
        acl: &AclParams,
    ) -> LatticeResult<Vec<Row>> {
        if self.ontology.node(label).is_none() {
            return Err(ValidationError::UnknownEntityType {
                type_name: label.to_string(),
            }
            .into());
        }
        validate_cypher_identifier(label, "label")?;

        let query = format!(
            "MATCH (n:{label} {{tenant_id: $tenant_id}}) \
             WHERE ($is_admin OR n.team_owner = $acl_team \
             OR ANY(ns IN n.namespace_acl WHERE ns IN $acl_namespaces)) \
             RETURN n {{.*}} AS node \
             ORDER BY coalesce(n.id, n.name)"
        );

        let session = TenantScopedSession::new(tenant_id);
        let mut params = QueryParams::new();
        acl.apply(&mut params);
        let params = session.validate_query(&query, &params)?;
        self.security.validate_query(&query, &params, true)?;
        self.store.execute_read(&query, &params).await
    }

    /// Create the vector index. Identifiers are validated before the only
    /// interpolation in this statement family.
    pub async fn create_vector_index(
        &self,
        index_name: &str,
        label: &str,
        property_name: &str,
        dimensions: usize,
    ) -> LatticeResult<()> {
        validate_cypher_identifier(index_name, "index_name")?;
        validate_cypher_identifier(label, "label")?;
        validate_cypher_identifier(property_name, "property_name")?;
        let query = format!(
            "CREATE VECTOR INDEX {index_name} IF NOT EXISTS \
             FOR (n:{label}) ON (n.{property_name}) \
             OPTIONS {{indexConfig: {{\
             `vector.dimensions`: {dimensions}, \
             `vector.similarity_function`: 'cosine'\
             }}}}"
        );
        self.store.execute_write(&query, &QueryParams::new()).await?;
        Ok(())
    }

    /// Attach embeddings to existing nodes.
    pub async fn upsert_embeddings(
        &self,
        label: &str,
        id_field: &str,
        tenant_id: &str,
        embeddings: &[EmbeddingRecord],
    ) -> LatticeResult<()> {
        if embeddings.is_empty() {
            return Ok(());
        }
        validate_cypher_identifier(label, "label")?;
        validate_cypher_identifier(id_field, "id_field")?;
        let query = format!(
            "UNWIND $batch AS item \
             MATCH (n:{label} {{{id_field}: item.id, tenant_id: $tenant_id}}) \
             SET n.embedding = item.vector"
        );
        let session = TenantScopedSession::new(tenant_id);
        let mut params = QueryParams::new();
        params.insert(
            "batch".to_string(),
            serde_json::to_value(embeddings)
                .unwrap_or(serde_json::Value::Array(vec![])),
        );
        let params = session.validate_query(&query, &params)?;
        self.store.execute_write(&query, &params).await?;
        Ok(())
    }

    /// Declare the composite NODE KEY (unique_key, tenant_id) plus the
    /// tenant secondary index for every node label, and the tombstone
    /// indexes for every edge type.
    pub async fn ensure_schema(&self) -> LatticeResult<()> {
        for node in &self.ontology.nodes {
            let label = &node.label;
            let key = &node.unique_key;
            let constraint = format!(
                "CREATE CONSTRAINT {label_lc}_node_key IF NOT EXISTS \
                 FOR (n:{label}) REQUIRE (n.{key}, n.tenant_id) IS NODE KEY",
                label_lc = label.to_lowercase(),
            );
            let tenant_index = format!(
                "CREATE INDEX {label_lc}_tenant_idx IF NOT EXISTS \
                 FOR (n:{label}) ON (n.tenant_id)",
                label_lc = label.to_lowercase(),
            );
            self.store
                .execute_write(&constraint, &QueryParams::new())
                .await?;
            self.store
                .execute_write(&tenant_index, &QueryParams::new())
                .await?;
        }
        for edge in &self.ontology.edges {
            let index = format!(
                "CREATE RANGE INDEX tombstone_{rel_lc}_idx IF NOT EXISTS \
                 FOR ()-[r:{rel}]-() ON (r.tombstoned_at)",
                rel = edge.rel_type,
                rel_lc = edge.rel_type.to_lowercase(),
            );
            self.store.execute_write(&index, &QueryParams::new()).await?;
        }
        Ok(())
    }
}
