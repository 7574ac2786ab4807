//! Write-layer scenarios against the mock driver: tenant isolation, write
//! ordering, hot-edge serialization, idempotent commits, and the tombstone
//! pass.

use std::sync::Arc;

use lattice_core::{Entity, GraphConfig, LatticeError, StoreError};
use lattice_graph::{GraphRepository, Ontology};
use lattice_guard::AclParams;
use lattice_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use lattice_test_utils::{calls, deployment, row, service, topic, MockGraphStore};
use serde_json::json;

fn repository(store: Arc<MockGraphStore>) -> GraphRepository {
    GraphRepository::new(
        store,
        Arc::new(CircuitBreaker::new("graph", CircuitBreakerConfig::default())),
        Ontology::builtin(),
        GraphConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn two_tenant_reads_are_parameter_scoped() {
    let store = Arc::new(MockGraphStore::new());
    store.on_query(
        "MATCH (n:Service {tenant_id: $tenant_id})",
        vec![row(&[("node", json!({"id": "auth", "tenant_id": "A"}))])],
    );
    let repo = repository(Arc::clone(&store));

    let rows = repo
        .read_topology("Service", "A", &AclParams::admin())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let (query, params) = store.recorded_matching("MATCH (n:Service").remove(0);
    assert!(query.contains("$tenant_id"));
    assert!(query.contains("$is_admin"));
    assert_eq!(params.get("tenant_id"), Some(&json!("A")));
}

#[tokio::test]
async fn unknown_label_is_refused_before_interpolation() {
    let store = Arc::new(MockGraphStore::new());
    let repo = repository(Arc::clone(&store));
    let err = repo
        .read_topology("Service) MATCH (m", "A", &AclParams::admin())
        .await
        .unwrap_err();
    assert!(matches!(err, LatticeError::Validation(_)));
    assert!(store.recorded().is_empty());
}

#[tokio::test]
async fn nodes_are_written_before_edges() {
    let store = Arc::new(MockGraphStore::new());
    let repo = repository(Arc::clone(&store));

    let entities = vec![
        calls("auth", "billing", "A"),
        service("billing").build(),
        service("auth").build(),
    ];
    repo.commit_topology(entities, "A", "run-1").await.unwrap();

    let recorded = store.recorded();
    let node_index = recorded
        .iter()
        .position(|(q, _)| q.contains("MERGE (n:Service"))
        .expect("node write recorded");
    let edge_index = recorded
        .iter()
        .position(|(q, _)| q.contains("MERGE (a)-[r:CALLS]->(b)"))
        .expect("edge write recorded");
    assert!(node_index < edge_index);
}

#[tokio::test]
async fn edge_writes_stamp_ingestion_id() {
    let store = Arc::new(MockGraphStore::new());
    let repo = repository(Arc::clone(&store));

    repo.commit_topology(
        vec![
            service("auth").build(),
            service("billing").build(),
            calls("auth", "billing", "A"),
        ],
        "A",
        "run-42",
    )
    .await
    .unwrap();

    let (_, params) = store
        .recorded_matching("MERGE (a)-[r:CALLS]->(b)")
        .remove(0);
    let batch = params.get("batch").and_then(|v| v.as_array()).unwrap();
    assert_eq!(batch[0].get("ingestion_id"), Some(&json!("run-42")));
    assert!(batch[0]
        .get("last_seen_at")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn identical_ingestions_produce_identical_writes() {
    // Content hashes and batch payloads must match across two runs of the
    // same source set (the repeated MERGE is then a no-op server-side).
    let build = || {
        vec![
            service("auth").team("identity").build(),
            service("billing").build(),
            topic("orders", "tenant-a"),
            deployment("auth-deploy", "prod", "tenant-a"),
            calls("auth", "billing", "tenant-a"),
        ]
    };

    let payloads = |store: &MockGraphStore| -> Vec<serde_json::Value> {
        store
            .recorded_matching("MERGE (n:")
            .into_iter()
            .map(|(_, params)| params.get("batch").cloned().unwrap())
            .collect()
    };

    let store_a = Arc::new(MockGraphStore::new());
    repository(Arc::clone(&store_a))
        .commit_topology(build(), "tenant-a", "run-1")
        .await
        .unwrap();

    let store_b = Arc::new(MockGraphStore::new());
    repository(Arc::clone(&store_b))
        .commit_topology(build(), "tenant-a", "run-1")
        .await
        .unwrap();

    assert_eq!(payloads(&store_a), payloads(&store_b));
}

#[tokio::test]
async fn hot_edges_are_written_in_one_unwind() {
    let store = Arc::new(MockGraphStore::new());
    let config = GraphConfig {
        hot_edge_threshold: 10,
        batch_size: 5,
        ..GraphConfig::default()
    };
    let repo = GraphRepository::new(
        Arc::clone(&store) as Arc<dyn lattice_graph::GraphStore>,
        Arc::new(CircuitBreaker::new("graph", CircuitBreakerConfig::default())),
        Ontology::builtin(),
        config,
    )
    .unwrap();

    // 12 edges onto one hub (hot), plus one cold edge.
    let mut entities: Vec<Entity> = vec![service("hub").build(), service("quiet").build()];
    for i in 0..12 {
        entities.push(service(&format!("s{i}")).build());
        entities.push(calls(&format!("s{i}"), "hub", "tenant-a"));
    }
    entities.push(calls("s0", "quiet", "tenant-a"));
    repo.commit_topology(entities, "tenant-a", "run-1").await.unwrap();

    let edge_writes = store.recorded_matching("MERGE (a)-[r:CALLS]->(b)");
    // One chunked write for the cold edge, one serialized write carrying
    // all 12 hot edges despite the batch size of 5.
    let hot_write = edge_writes
        .iter()
        .find(|(_, params)| {
            params
                .get("batch")
                .and_then(|v| v.as_array())
                .is_some_and(|batch| batch.len() == 12)
        })
        .expect("hot edges in a single UNWIND");
    assert!(hot_write.0.contains("UNWIND $batch"));
}

#[tokio::test]
async fn commit_failure_propagates_and_feeds_the_breaker() {
    let store = Arc::new(MockGraphStore::new());
    store.fail_on(
        "MERGE (n:Service",
        StoreError::Unavailable {
            message: "connection refused".to_string(),
        }
        .into(),
    );
    let breaker = Arc::new(CircuitBreaker::new(
        "graph",
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        },
    ));
    let repo = GraphRepository::new(
        Arc::clone(&store) as Arc<dyn lattice_graph::GraphStore>,
        Arc::clone(&breaker),
        Ontology::builtin(),
        GraphConfig::default(),
    )
    .unwrap();

    let err = repo
        .commit_topology(vec![service("auth").build()], "tenant-a", "run-1")
        .await
        .unwrap_err();
    assert!(matches!(err, LatticeError::Store(_)));
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn prune_tombstones_and_returns_endpoint_ids() {
    let store = Arc::new(MockGraphStore::new());
    store.on_query(
        "SET r.tombstoned_at = $now",
        vec![
            row(&[("source_id", json!("auth")), ("target_id", json!("legacy"))]),
            row(&[("source_id", json!("auth")), ("target_id", json!("billing"))]),
        ],
    );
    let repo = repository(Arc::clone(&store));

    let (count, affected) = repo
        .prune_stale_edges("tenant-a", "run-2", 24)
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(affected.len(), 3);
    assert!(affected.contains("legacy"));

    let (query, params) = store.recorded_matching("SET r.tombstoned_at").remove(0);
    // Logical delete, not physical.
    assert!(!query.contains("DELETE"));
    assert!(query.contains("r.ingestion_id <> $current_id"));
    assert_eq!(params.get("current_id"), Some(&json!("run-2")));
    assert_eq!(params.get("tenant_id"), Some(&json!("tenant-a")));
}

#[tokio::test]
async fn degree_refresh_counts_live_edges_only() {
    let store = Arc::new(MockGraphStore::new());
    let repo = repository(Arc::clone(&store));
    let ids = ["auth".to_string()].into_iter().collect();
    repo.refresh_degree_for_ids(&ids, "tenant-a").await.unwrap();

    let (query, _) = store.recorded_matching("SET n.degree").remove(0);
    assert!(query.contains("r.tombstoned_at IS NULL"));
    assert!(query.contains("$tenant_id"));
}

#[tokio::test]
async fn unknown_ontology_type_is_a_hard_error() {
    // An ontology missing the Database label must refuse Database entities
    // rather than dropping them.
    let mut ontology = Ontology::builtin();
    ontology.nodes.retain(|n| n.label != "Database");
    ontology.edges.retain(|e| e.rel_type != "CALLS");

    let store = Arc::new(MockGraphStore::new());
    let repo = GraphRepository::new(
        Arc::clone(&store) as Arc<dyn lattice_graph::GraphStore>,
        Arc::new(CircuitBreaker::new("graph", CircuitBreakerConfig::default())),
        ontology,
        GraphConfig::default(),
    )
    .unwrap();

    let entities = vec![
        service("auth").build(),
        service("billing").build(),
        calls("auth", "billing", "tenant-a"),
    ];
    let err = repo
        .commit_topology(entities, "tenant-a", "run-1")
        .await
        .unwrap_err();
    assert!(matches!(err, LatticeError::Validation(_)));
}
