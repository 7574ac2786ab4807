//! The traversal engine.
//!
//! Strategy selection:
//! - `BoundedCypher`: one bounded-path statement, cheapest for quiet nodes;
//! - `BatchedBfs`: cooperative multi-hop with one degree-check query per
//!   hop, per-source fairness caps, supernode sampling, and a beam limit;
//! - `Procedure`: two-query subgraph expansion via the graph procedure;
//! - `Adaptive`: picks by degree hint, falling back down the ladder on
//!   driver errors.
//!
//! Every query runs under the caller's timeout; a timeout mid-walk returns
//! the rows accumulated so far rather than discarding them.

use std::collections::{HashMap, HashSet};

use lattice_core::{
    LatticeError, LatticeResult, StoreError, TokenBudget, TraversalConfig, TraversalStrategy,
};
use lattice_graph::{GraphStore, Row};
use lattice_guard::{
    build_batch_degree_check, build_batched_neighbor, build_bounded_path, build_procedure_edges,
    build_procedure_nodes, build_sampled_neighbor, build_semantic_neighbor_scan,
    build_neighbor_discovery, AclParams, QueryParams, SecurityProvider, TenantScopedSession,
};

use crate::state::{TraversalState, TraversalStep};

fn get_str(row: &Row, key: &str) -> Option<String> {
    row.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn get_f64(row: &Row, key: &str) -> f64 {
    row.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

/// Composite beam score: PageRank dominates, degree breaks near-ties.
fn beam_score(row: &Row) -> f64 {
    get_f64(row, "pagerank") + get_f64(row, "degree") / 1000.0
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

fn is_timeout(err: &LatticeError) -> bool {
    matches!(err, LatticeError::Store(StoreError::Timeout))
}

/// The engine, bound to one tenant and one caller identity.
pub struct TraversalEngine<'a> {
    store: &'a dyn GraphStore,
    session: TenantScopedSession,
    security: SecurityProvider,
    acl: AclParams,
    config: TraversalConfig,
    budget: TokenBudget,
    /// Query embedding for semantic supernode sampling, when available.
    query_embedding: Option<Vec<f32>>,
}

impl<'a> TraversalEngine<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        tenant_id: &str,
        acl: AclParams,
        config: TraversalConfig,
    ) -> Self {
        Self {
            store,
            session: TenantScopedSession::new(tenant_id),
            security: SecurityProvider::new(),
            acl,
            config,
            budget: TokenBudget::default(),
            query_embedding: None,
        }
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_query_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    async fn run_query(&self, query: &str, mut params: QueryParams) -> LatticeResult<Vec<Row>> {
        self.acl.apply(&mut params);
        let params = self.session.validate_query(query, &params)?;
        if !self.config.skip_acl {
            self.security.validate_query(query, &params, true)?;
        }
        match tokio::time::timeout(
            self.config.query_timeout,
            self.store.execute_read(query, &params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout.into()),
        }
    }

    // ========================================================================
    // STRATEGIES
    // ========================================================================

    /// Single bounded-path statement with LIMIT, ACL, tombstone filter, and
    /// deterministic ordering.
    pub async fn bounded_cypher(&self, start_node_id: &str) -> LatticeResult<Vec<Row>> {
        let query = build_bounded_path(self.config.max_hops, self.config.skip_acl);
        let mut params = QueryParams::new();
        params.insert("source_id".to_string(), start_node_id.into());
        params.insert("max_nodes".to_string(), (self.config.max_nodes as u64).into());
        self.run_query(&query, params).await
    }

    /// One round trip resolving the degree of every frontier node.
    pub async fn batch_check_degrees(
        &self,
        frontier_ids: &[String],
    ) -> LatticeResult<HashMap<String, u64>> {
        let query = build_batch_degree_check(self.config.skip_acl);
        let mut params = QueryParams::new();
        params.insert(
            "node_ids".to_string(),
            serde_json::Value::Array(
                frontier_ids
                    .iter()
                    .map(|id| serde_json::Value::String(id.clone()))
                    .collect(),
            ),
        );
        let rows = self.run_query(&query, params).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some((
                    get_str(row, "id")?,
                    row.get("degree").and_then(|v| v.as_u64()).unwrap_or(0),
                ))
            })
            .collect())
    }

    /// Sample up to `sample_size` neighbors of a supernode: semantically
    /// when a query embedding is present, deterministically otherwise.
    /// Never `rand()`.
    pub async fn sample_supernode(&self, node_id: &str) -> LatticeResult<Vec<Row>> {
        if let Some(embedding) = &self.query_embedding {
            let query = build_semantic_neighbor_scan(self.config.skip_acl);
            let mut params = QueryParams::new();
            params.insert("source_id".to_string(), node_id.into());
            params.insert(
                "scan_limit".to_string(),
                (self.config.max_node_degree as u64).into(),
            );
            let rows = self.run_query(&query, params).await?;

            let mut scored: Vec<(f64, Row)> = rows
                .into_iter()
                .filter_map(|mut row| {
                    let neighbor: Vec<f32> = row
                        .remove("embedding")
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    let similarity = cosine_similarity(embedding, &neighbor);
                    if similarity >= self.config.semantic_similarity_threshold {
                        Some((similarity, row))
                    } else {
                        None
                    }
                })
                .collect();
            scored.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        get_str(&a.1, "target_id")
                            .unwrap_or_default()
                            .cmp(&get_str(&b.1, "target_id").unwrap_or_default())
                    })
            });
            scored.truncate(self.config.sample_size);
            return Ok(scored.into_iter().map(|(_, row)| row).collect());
        }

        let query = build_sampled_neighbor(self.config.skip_acl);
        let mut params = QueryParams::new();
        params.insert("source_id".to_string(), node_id.into());
        params.insert(
            "sample_size".to_string(),
            (self.config.sample_size as u64).into(),
        );
        self.run_query(&query, params).await
    }

    /// One hop from a single node, supernode-aware: quiet nodes expand via
    /// neighbor discovery, supernodes via sampling.
    pub async fn execute_hop(
        &self,
        node_id: &str,
        degree_hint: Option<u64>,
    ) -> LatticeResult<Vec<Row>> {
        let degree = match degree_hint {
            Some(d) => d,
            None => {
                let ids = vec![node_id.to_string()];
                self.batch_check_degrees(&ids)
                    .await?
                    .get(node_id)
                    .copied()
                    .unwrap_or(0)
            }
        };
        if degree > self.config.max_node_degree as u64 {
            return self.sample_supernode(node_id).await;
        }
        let query = build_neighbor_discovery(self.config.skip_acl);
        let mut params = QueryParams::new();
        params.insert("source_id".to_string(), node_id.into());
        params.insert("limit".to_string(), (self.config.beam_width as u64).into());
        self.run_query(&query, params).await
    }

    /// Cooperative batched BFS. A timeout mid-walk ends the walk and
    /// returns everything accumulated so far.
    pub async fn batched_bfs(&self, start_node_id: &str) -> LatticeResult<Vec<Row>> {
        let mut state = TraversalState::new(start_node_id, &self.config, self.budget);
        let mut hop_number = 0usize;

        while state.should_continue() {
            let frontier = state.drain_frontier();
            if frontier.is_empty() {
                break;
            }

            let degrees = match self.batch_check_degrees(&frontier).await {
                Ok(degrees) => degrees,
                Err(err) if is_timeout(&err) => break,
                Err(err) => return Err(err),
            };

            let (supernodes, normal): (Vec<String>, Vec<String>) =
                frontier.iter().cloned().partition(|id| {
                    degrees.get(id).copied().unwrap_or(0) > self.config.max_node_degree as u64
                });

            let mut hop_rows: Vec<Row> = Vec::new();

            if !normal.is_empty() {
                let per_source_limit =
                    std::cmp::max(1, self.config.beam_width / normal.len());
                let query = build_batched_neighbor(self.config.skip_acl);
                let mut params = QueryParams::new();
                params.insert(
                    "frontier_ids".to_string(),
                    serde_json::Value::Array(
                        normal
                            .iter()
                            .map(|id| serde_json::Value::String(id.clone()))
                            .collect(),
                    ),
                );
                params.insert(
                    "per_source_limit".to_string(),
                    (per_source_limit as u64).into(),
                );
                params.insert("limit".to_string(), (self.config.beam_width as u64).into());
                match self.run_query(&query, params).await {
                    Ok(rows) => hop_rows.extend(rows),
                    Err(err) if is_timeout(&err) => {
                        state.record_step(TraversalStep {
                            source_ids: frontier,
                            hop_number,
                            results: hop_rows,
                            new_frontier: vec![],
                        });
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            let mut supernode_timeout = false;
            for supernode in &supernodes {
                match self.sample_supernode(supernode).await {
                    Ok(rows) => hop_rows.extend(rows),
                    Err(err) if is_timeout(&err) => {
                        supernode_timeout = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            // Beam: keep the top-K by composite score; ties break on id so
            // the frontier is identical across replicas.
            hop_rows.sort_by(|a, b| {
                beam_score(b)
                    .partial_cmp(&beam_score(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        get_str(a, "target_id")
                            .unwrap_or_default()
                            .cmp(&get_str(b, "target_id").unwrap_or_default())
                    })
            });
            hop_rows.truncate(self.config.beam_width);

            let new_frontier: Vec<String> = hop_rows
                .iter()
                .filter_map(|row| get_str(row, "target_id"))
                .collect();

            state.record_step(TraversalStep {
                source_ids: frontier,
                hop_number,
                results: hop_rows,
                new_frontier,
            });
            hop_number += 1;

            if supernode_timeout {
                break;
            }
        }

        Ok(state.accumulated_context)
    }

    /// Procedure-based two-query expansion: nodes, then edges over the node
    /// set. Duplicate edges collapse; edges with an endpoint outside the
    /// node set are dropped.
    pub async fn procedure_expand(&self, start_node_id: &str) -> LatticeResult<Vec<Row>> {
        let node_query = build_procedure_nodes(self.config.skip_acl);
        let mut params = QueryParams::new();
        params.insert("start_id".to_string(), start_node_id.into());
        params.insert("max_hops".to_string(), (self.config.max_hops as u64).into());
        params.insert("max_nodes".to_string(), (self.config.max_nodes as u64).into());
        let node_rows = self.run_query(&node_query, params).await?;

        let mut node_ids: HashSet<String> = HashSet::new();
        let mut nodes: Vec<Row> = Vec::new();
        for row in node_rows {
            let node = match row.get("node").and_then(|v| v.as_object()) {
                Some(obj) => obj.clone(),
                None => continue,
            };
            if let Some(id) = node
                .get("id")
                .or_else(|| node.get("name"))
                .and_then(|v| v.as_str())
            {
                node_ids.insert(id.to_string());
            }
            let mut flattened = node;
            if let Some(labels) = row.get("labels") {
                flattened.insert("labels".to_string(), labels.clone());
            }
            nodes.push(flattened);
        }

        let edge_query = build_procedure_edges(self.config.skip_acl);
        let mut params = QueryParams::new();
        params.insert(
            "node_ids".to_string(),
            serde_json::Value::Array(
                node_ids
                    .iter()
                    .map(|id| serde_json::Value::String(id.clone()))
                    .collect(),
            ),
        );
        let edge_rows = self.run_query(&edge_query, params).await?;

        let mut seen_edges: HashSet<(String, String, String)> = HashSet::new();
        let mut edges: Vec<Row> = Vec::new();
        for row in edge_rows {
            let (Some(source), Some(target)) = (get_str(&row, "source"), get_str(&row, "target"))
            else {
                continue;
            };
            if !node_ids.contains(&source) || !node_ids.contains(&target) {
                continue;
            }
            let rel_type = get_str(&row, "rel_type").unwrap_or_default();
            if seen_edges.insert((source, target, rel_type)) {
                edges.push(row);
            }
        }

        // Deterministic ordering: nodes by (pagerank, degree, id), edges
        // appended after.
        nodes.sort_by(|a, b| {
            beam_score(b)
                .partial_cmp(&beam_score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    get_str(a, "id")
                        .unwrap_or_default()
                        .cmp(&get_str(b, "id").unwrap_or_default())
                })
        });
        nodes.extend(edges);
        Ok(nodes)
    }

    /// Adaptive selection by degree hint, with fallbacks down the ladder.
    pub async fn adaptive(
        &self,
        start_node_id: &str,
        degree_hint: Option<u64>,
    ) -> LatticeResult<Vec<Row>> {
        match degree_hint {
            Some(degree) if degree > self.config.procedure_degree_threshold as u64 => {
                match self.procedure_expand(start_node_id).await {
                    Ok(rows) => Ok(rows),
                    Err(err) => {
                        tracing::warn!(%err, "procedure expansion failed, falling back to batched BFS");
                        self.batched_bfs(start_node_id).await
                    }
                }
            }
            Some(degree) if degree > self.config.degree_threshold as u64 => {
                self.batched_bfs(start_node_id).await
            }
            Some(_) => match self.bounded_cypher(start_node_id).await {
                Ok(rows) => Ok(rows),
                Err(err) => {
                    tracing::warn!(%err, "bounded traversal failed, falling back to batched BFS");
                    self.batched_bfs(start_node_id).await
                }
            },
            None => match self.procedure_expand(start_node_id).await {
                Ok(rows) => Ok(rows),
                Err(err) => {
                    tracing::warn!(%err, "procedure expansion failed, falling back to batched BFS");
                    self.batched_bfs(start_node_id).await
                }
            },
        }
    }
}

/// Run a traversal with the configured strategy.
pub async fn run_traversal(
    store: &dyn GraphStore,
    start_node_id: &str,
    tenant_id: &str,
    acl: &AclParams,
    config: &TraversalConfig,
    degree_hint: Option<u64>,
) -> LatticeResult<Vec<Row>> {
    let engine = TraversalEngine::new(store, tenant_id, acl.clone(), config.clone());
    match config.strategy {
        TraversalStrategy::BoundedCypher => engine.bounded_cypher(start_node_id).await,
        TraversalStrategy::BatchedBfs => engine.batched_bfs(start_node_id).await,
        TraversalStrategy::Procedure => engine.procedure_expand(start_node_id).await,
        TraversalStrategy::Adaptive => engine.adaptive(start_node_id, degree_hint).await,
    }
}
