//! The ingestion pipeline.
//!
//! An explicit finite state machine — the state object is the contract, no
//! framework hides it:
//!
//! ```text
//! load_workspace -> parse_source_ast -> parse_manifests -> validate_schema
//!        -> {fix_errors (self-loop, bounded) | commit} -> post_commit
//! ```
//!
//! The commit stage is the only writer and runs under the per-(tenant,
//! namespace) distributed lock. Post-commit side effects (tombstone prune,
//! durable vector-sync event, targeted cache invalidation, drain kick) run
//! after the transaction and never fail the commit — except the one
//! misconfiguration that would silently lose durability: production mode
//! without a durable outbox fails closed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use lattice_cache::TieredCache;
use lattice_core::{DeploymentMode, Entity, LatticeResult, LockConfig, WorkspaceConfig};
use lattice_graph::{
    drain_vector_outbox, validate_topology, AffectedIds, DurableOutbox, EntityResolver,
    GraphRepository, InMemoryOutbox, OutboxSink, PeriodicVectorDrainer, VectorStore,
    VectorSyncEvent,
};
use lattice_resilience::{ingestion_lock_key, BoundedTaskSet, DistributedLock, LockBackend};

use crate::ast::{convert_to_extraction_result, AstExtractionService};
use crate::extractor::ServiceExtractor;
use crate::manifest::parse_all_manifests;
use crate::workspace::{load_directory_with_skips, RawFile};

pub const MAX_VALIDATION_RETRIES: u32 = 3;
const PRUNE_MAX_AGE_HOURS: i64 = 24;
const VECTOR_COLLECTION: &str = "svc";
const LOCK_ACQUIRE_ATTEMPTS: u32 = 5;

// ============================================================================
// STATE
// ============================================================================

/// Per-file extraction checkpoint: YAML files tick over to `Extracted` so
/// fix cycles never reparse manifests; raw source stays `Pending` because
/// the extractor is stateful per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Extracted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct IngestionState {
    pub directory_path: String,
    pub tenant_id: String,
    pub namespace: String,
    pub ingestion_id: String,
    pub raw_files: Vec<RawFile>,
    pub extracted_nodes: Vec<Entity>,
    pub extraction_errors: Vec<String>,
    pub validation_retries: u32,
    pub commit_status: CommitStatus,
    pub checkpoint: HashMap<String, FileStatus>,
    pub skipped_files: Vec<String>,
    /// Node ids touched by the commit, for degree refresh and targeted
    /// cache eviction. None until a commit succeeds.
    pub affected_ids: Option<AffectedIds>,
}

impl IngestionState {
    pub fn new(tenant_id: &str, namespace: &str) -> Self {
        Self {
            directory_path: String::new(),
            tenant_id: tenant_id.to_string(),
            namespace: namespace.to_string(),
            ingestion_id: Uuid::now_v7().to_string(),
            raw_files: Vec::new(),
            extracted_nodes: Vec::new(),
            extraction_errors: Vec::new(),
            validation_retries: 0,
            commit_status: CommitStatus::Pending,
            checkpoint: HashMap::new(),
            skipped_files: Vec::new(),
            affected_ids: None,
        }
    }

    pub fn with_directory(mut self, directory_path: &str) -> Self {
        self.directory_path = directory_path.to_string();
        self
    }

    pub fn with_raw_files(mut self, raw_files: Vec<RawFile>) -> Self {
        self.raw_files = raw_files;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    LoadWorkspace,
    ParseSourceAst,
    ParseManifests,
    ValidateSchema,
    FixErrors,
    Commit,
    PostCommit,
    Done,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct IngestionPipeline {
    repository: Arc<GraphRepository>,
    lock_backend: Arc<dyn LockBackend>,
    lock_config: LockConfig,
    ast: Arc<AstExtractionService>,
    llm: Option<Arc<ServiceExtractor>>,
    resolver: EntityResolver,
    cache: Arc<TieredCache>,
    durable_outbox: Option<Arc<DurableOutbox>>,
    memory_outbox: Arc<InMemoryOutbox>,
    vector_store: Arc<dyn VectorStore>,
    drainer: Option<Arc<PeriodicVectorDrainer>>,
    tasks: Arc<BoundedTaskSet>,
    mode: DeploymentMode,
    workspace_config: WorkspaceConfig,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<GraphRepository>,
        lock_backend: Arc<dyn LockBackend>,
        lock_config: LockConfig,
        ast: Arc<AstExtractionService>,
        llm: Option<Arc<ServiceExtractor>>,
        cache: Arc<TieredCache>,
        durable_outbox: Option<Arc<DurableOutbox>>,
        memory_outbox: Arc<InMemoryOutbox>,
        vector_store: Arc<dyn VectorStore>,
        mode: DeploymentMode,
    ) -> Self {
        Self {
            repository,
            lock_backend,
            lock_config,
            ast,
            llm,
            resolver: EntityResolver::default(),
            cache,
            durable_outbox,
            memory_outbox,
            vector_store,
            drainer: None,
            tasks: Arc::new(BoundedTaskSet::new(32)),
            mode,
            workspace_config: WorkspaceConfig::from_env(),
        }
    }

    pub fn with_drainer(mut self, drainer: Arc<PeriodicVectorDrainer>) -> Self {
        self.drainer = Some(drainer);
        self
    }

    pub fn with_workspace_config(mut self, config: WorkspaceConfig) -> Self {
        self.workspace_config = config;
        self
    }

    /// Drive the state machine to completion.
    pub async fn run(&self, mut state: IngestionState) -> LatticeResult<IngestionState> {
        let mut stage = Stage::LoadWorkspace;
        while stage != Stage::Done {
            let span = tracing::info_span!(
                "ingestion.stage",
                stage = ?stage,
                tenant_id = %state.tenant_id,
                ingestion_id = %state.ingestion_id,
            );
            stage = async {
                let next = match stage {
                    Stage::LoadWorkspace => {
                        self.load_workspace(&mut state)?;
                        Stage::ParseSourceAst
                    }
                    Stage::ParseSourceAst => {
                        self.parse_source_ast(&mut state).await?;
                        Stage::ParseManifests
                    }
                    Stage::ParseManifests => {
                        self.parse_manifests(&mut state);
                        Stage::ValidateSchema
                    }
                    Stage::ValidateSchema => {
                        self.validate_schema(&mut state);
                        self.route_validation(&state)
                    }
                    Stage::FixErrors => {
                        self.fix_errors(&mut state).await?;
                        Stage::ValidateSchema
                    }
                    Stage::Commit => {
                        self.commit(&mut state).await;
                        if state.commit_status == CommitStatus::Failed {
                            // Post-commit side effects (including cache
                            // invalidation) never run for a failed commit.
                            Stage::Done
                        } else {
                            Stage::PostCommit
                        }
                    }
                    Stage::PostCommit => {
                        self.post_commit(&mut state).await?;
                        Stage::Done
                    }
                    Stage::Done => Stage::Done,
                };
                Ok::<Stage, lattice_core::LatticeError>(next)
            }
            .instrument(span)
            .await?;
        }
        Ok(state)
    }

    // ========================================================================
    // STAGES
    // ========================================================================

    fn load_workspace(&self, state: &mut IngestionState) -> LatticeResult<()> {
        if !state.directory_path.is_empty() {
            let loaded = load_directory_with_skips(&state.directory_path, &self.workspace_config)?;
            state.raw_files = loaded.files;
            state.skipped_files = loaded.skipped;
        }
        // Pre-populated raw_files pass through verbatim.
        for file in &state.raw_files {
            state
                .checkpoint
                .entry(file.path.clone())
                .or_insert(FileStatus::Pending);
        }
        tracing::info!(file_count = state.raw_files.len(), "workspace loaded");
        Ok(())
    }

    fn pending_source_files(&self, state: &IngestionState) -> Vec<RawFile> {
        state
            .raw_files
            .iter()
            .filter(|f| f.path.ends_with(".go") || f.path.ends_with(".py"))
            .filter(|f| {
                state.checkpoint.get(&f.path).copied() != Some(FileStatus::Extracted)
            })
            .cloned()
            .collect()
    }

    async fn parse_source_ast(&self, state: &mut IngestionState) -> LatticeResult<()> {
        let source_files = self.pending_source_files(state);
        if source_files.is_empty() {
            return Ok(());
        }

        let ast_results = self.ast.extract_batch(&source_files).await?;
        for result in &ast_results {
            let extraction = convert_to_extraction_result(result, &state.tenant_id);
            state.extracted_nodes.extend(extraction.into_entities());
        }

        if let Some(llm) = &self.llm {
            let extraction = llm.extract_all(&source_files).await?;
            state.extracted_nodes.extend(extraction.into_entities());
        }
        Ok(())
    }

    fn parse_manifests(&self, state: &mut IngestionState) {
        let pending: Vec<RawFile> = state
            .raw_files
            .iter()
            .filter(|f| {
                state.checkpoint.get(&f.path).copied() != Some(FileStatus::Extracted)
            })
            .cloned()
            .collect();
        let (entities, consumed) = parse_all_manifests(&pending, &state.tenant_id);
        state.extracted_nodes.extend(entities);
        for path in consumed {
            state.checkpoint.insert(path, FileStatus::Extracted);
        }
    }

    fn validate_schema(&self, state: &mut IngestionState) {
        let resolved = self
            .resolver
            .resolve(std::mem::take(&mut state.extracted_nodes));
        state.extracted_nodes = resolved;
        state.extraction_errors = validate_topology(&state.extracted_nodes);
        if !state.extraction_errors.is_empty() {
            tracing::warn!(
                errors = state.extraction_errors.len(),
                retries = state.validation_retries,
                "schema validation found errors"
            );
        }
    }

    fn route_validation(&self, state: &IngestionState) -> Stage {
        if state.extraction_errors.is_empty() {
            return Stage::Commit;
        }
        if self.llm.is_none() || state.validation_retries >= MAX_VALIDATION_RETRIES {
            // Commit anyway: the write layer enforces per-entity safety and
            // the graph tolerates dangling-free subsets.
            return Stage::Commit;
        }
        Stage::FixErrors
    }

    /// Re-run the extractor. The fresh result REPLACES prior LLM-provenance
    /// entities and PRESERVES manifest entities and AST-provenance entities
    /// (confidence == 1.0).
    async fn fix_errors(&self, state: &mut IngestionState) -> LatticeResult<()> {
        let Some(llm) = &self.llm else {
            return Ok(());
        };
        let source_files = self.pending_source_files(state);
        let extraction = llm.extract_all(&source_files).await?;

        state.extracted_nodes.retain(|entity| match entity {
            Entity::Service(_) | Entity::Calls(_) => entity.confidence() >= 1.0,
            _ => true,
        });
        state.extracted_nodes.extend(extraction.into_entities());
        state.validation_retries += 1;
        state.extraction_errors.clear();
        Ok(())
    }

    async fn acquire_ingestion_lock(
        &self,
        state: &IngestionState,
    ) -> LatticeResult<DistributedLock> {
        let key = ingestion_lock_key(&state.tenant_id, &state.namespace);
        let mut wait = std::time::Duration::from_millis(200);
        let mut last_err = None;
        for _ in 0..LOCK_ACQUIRE_ATTEMPTS {
            match DistributedLock::acquire(
                Arc::clone(&self.lock_backend),
                key.clone(),
                &self.lock_config,
            )
            .await
            {
                Ok(lock) => return Ok(lock),
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(wait).await;
                    wait *= 2;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            lattice_core::ResilienceError::LockUnavailable { key }.into()
        }))
    }

    async fn commit(&self, state: &mut IngestionState) {
        let lock = match self.acquire_ingestion_lock(state).await {
            Ok(lock) => lock,
            Err(err) => {
                tracing::error!(%err, "failed to acquire ingestion lock");
                state.commit_status = CommitStatus::Failed;
                return;
            }
        };

        let result = self
            .repository
            .commit_topology_with_affected_ids(
                state.extracted_nodes.clone(),
                &state.tenant_id,
                &state.ingestion_id,
            )
            .await;

        match result {
            Ok(affected) => {
                state.affected_ids = Some(affected);
                state.commit_status = CommitStatus::Success;
            }
            Err(err) => {
                tracing::error!(%err, "graph commit failed");
                state.commit_status = CommitStatus::Failed;
            }
        }

        if let Err(err) = lock.release().await {
            tracing::warn!(%err, "ingestion lock release failed");
        }
    }

    async fn post_commit(&self, state: &mut IngestionState) -> LatticeResult<()> {
        // (a) Tombstone pass.
        let pruned_ids = match self
            .repository
            .prune_stale_edges(&state.tenant_id, &state.ingestion_id, PRUNE_MAX_AGE_HOURS)
            .await
        {
            Ok((count, pruned)) => {
                if count > 0 {
                    tracing::info!(count, "stale edges tombstoned");
                }
                pruned
            }
            Err(err) => {
                tracing::warn!(%err, "tombstone prune failed; durable outbox will catch up next run");
                HashSet::new()
            }
        };

        // (b) Durable vector-sync event.
        if !pruned_ids.is_empty() {
            let mut ids: Vec<String> = pruned_ids.iter().cloned().collect();
            ids.sort();
            let event = VectorSyncEvent::new(VECTOR_COLLECTION, ids, &state.tenant_id);
            self.enqueue_vector_event(event).await?;
        }

        // Degree refresh is decoupled from the commit: schedule it in the
        // bounded background set.
        let mut refresh_ids: AffectedIds = state.affected_ids.clone().unwrap_or_default();
        refresh_ids.extend(pruned_ids.iter().cloned());
        if !refresh_ids.is_empty() {
            let repository = Arc::clone(&self.repository);
            let tenant_id = state.tenant_id.clone();
            let ids = refresh_ids.clone();
            if let Err(err) = self
                .tasks
                .spawn(async move {
                    if let Err(err) = repository.refresh_degree_for_ids(&ids, &tenant_id).await {
                        tracing::warn!(%err, "degree refresh failed");
                    }
                })
                .await
            {
                tracing::warn!(%err, "degree refresh rejected by task set");
            }
        }

        // (c) Targeted cache invalidation; tenant-wide only as a fallback.
        match &state.affected_ids {
            Some(affected) => {
                let mut touched: Vec<String> = affected.iter().cloned().collect();
                touched.extend(pruned_ids.iter().cloned());
                if let Err(err) = self.cache.invalidate_by_nodes(touched).await {
                    tracing::warn!(%err, "node-targeted cache invalidation failed");
                }
            }
            None => {
                tracing::warn!(
                    tenant_id = %state.tenant_id,
                    "committed node set unknown; falling back to tenant-wide cache invalidation"
                );
                if let Err(err) = self.cache.invalidate_tenant(&state.tenant_id).await {
                    tracing::warn!(%err, "tenant cache invalidation failed");
                }
            }
        }

        // (d) Kick the drainer without blocking the response.
        if let Some(drainer) = &self.drainer {
            drainer.notify();
        } else {
            let durable = self.durable_outbox.clone();
            let memory = Arc::clone(&self.memory_outbox);
            let vector_store = Arc::clone(&self.vector_store);
            let worker_id = format!("commit-{}", state.ingestion_id);
            if let Err(err) = self
                .tasks
                .spawn(async move {
                    let config = lattice_core::OutboxConfig::default();
                    if let Err(err) = drain_vector_outbox(
                        durable.as_deref(),
                        &memory,
                        vector_store.as_ref(),
                        &worker_id,
                        &config,
                    )
                    .await
                    {
                        tracing::warn!(%err, "post-commit outbox drain failed");
                    }
                })
                .await
            {
                tracing::warn!(%err, "post-commit drain rejected by task set");
            }
        }

        Ok(())
    }

    /// Adapt this pipeline into an [`IngestSink`](crate::worker::IngestSink)
    /// for the message-bus extraction worker, bound to one (tenant,
    /// namespace).
    pub fn into_sink(
        self: Arc<Self>,
        tenant_id: &str,
        namespace: &str,
    ) -> Arc<dyn crate::worker::IngestSink> {
        Arc::new(PipelineSink {
            pipeline: self,
            tenant_id: tenant_id.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Route a vector-sync event by durability policy: durable outbox when
    /// available; otherwise fail closed in production, fall back to the
    /// in-memory outbox in development.
    async fn enqueue_vector_event(&self, event: VectorSyncEvent) -> LatticeResult<()> {
        match &self.durable_outbox {
            Some(durable) => match durable.write_event(event.clone()).await {
                Ok(()) => Ok(()),
                Err(err) if self.mode.is_production() => {
                    tracing::error!(%err, "durable outbox write failed in production");
                    Err(err)
                }
                Err(err) => {
                    tracing::warn!(%err, "durable outbox write failed; using in-memory outbox");
                    self.memory_outbox.enqueue(event);
                    Ok(())
                }
            },
            None if self.mode.is_production() => {
                tracing::error!(
                    "no durable outbox configured in production; refusing lossy vector sync"
                );
                Err(lattice_core::StoreError::Unavailable {
                    message: "durable outbox required in production".to_string(),
                }
                .into())
            }
            None => {
                self.memory_outbox.enqueue(event);
                Ok(())
            }
        }
    }
}

/// One-file ingestion entry for bus-driven extraction: each event becomes a
/// pipeline run whose `commit_status` decides the event outcome.
struct PipelineSink {
    pipeline: Arc<IngestionPipeline>,
    tenant_id: String,
    namespace: String,
}

#[async_trait::async_trait]
impl crate::worker::IngestSink for PipelineSink {
    async fn ingest(&self, files: Vec<RawFile>) -> LatticeResult<()> {
        let state = IngestionState::new(&self.tenant_id, &self.namespace).with_raw_files(files);
        let finished = self.pipeline.run(state).await?;
        if finished.commit_status == CommitStatus::Failed {
            return Err(lattice_core::IngestionError::CommitFailed {
                reason: "bus-driven ingestion commit failed".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
