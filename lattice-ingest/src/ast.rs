//! AST worker extraction.
//!
//! Two modes, selected by configuration and never mixed:
//! - remote: a gRPC AST worker fleet behind its own circuit breaker. An
//!   open breaker or a network failure surfaces as `IngestionDegraded`
//!   (503 + Retry-After at the HTTP edge) and the payload lands in a
//!   bounded in-memory dead-letter queue, oldest evicted first;
//! - local: a semaphore-bounded blocking pool running the heuristic
//!   extractor, worker count clamped so a large codebase cannot OOM the
//!   orchestrator. The pool is never constructed in remote mode.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use lattice_core::{
    AstConfig, CallsEdge, ExtractionResult, IngestionError, LatticeResult, ServiceNode, StoreError,
};
use lattice_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::workspace::RawFile;

// ============================================================================
// RESULT MODEL
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    #[serde(default)]
    pub exported: bool,
    #[serde(default)]
    pub parameters: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpCallInfo {
    pub method: String,
    #[serde(default)]
    pub path_hint: String,
}

/// Structured result for one file from the AST worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAstResult {
    pub file_path: String,
    pub language: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub functions: Vec<FunctionInfo>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub http_calls: Vec<HttpCallInfo>,
    #[serde(default)]
    pub service_hints: Vec<String>,
    #[serde(default)]
    pub http_handlers: Vec<String>,
    #[serde(default)]
    pub source_type: String,
}

fn derive_service_id(file_path: &str) -> String {
    let normalized = file_path.replace('\\', "/");
    let parts: Vec<&str> = normalized.split('/').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2].to_string()
    } else {
        parts
            .last()
            .map(|name| name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name))
            .unwrap_or(&"")
            .to_string()
    }
}

fn detect_framework(result: &RemoteAstResult) -> String {
    if result.service_hints.iter().any(|h| h == "http-server") {
        return "net/http".to_string();
    }
    if result.service_hints.iter().any(|h| h == "grpc-server") {
        return "grpc".to_string();
    }
    "unknown".to_string()
}

/// Convert one AST result into extraction entities. AST provenance is
/// exact: confidence 1.0.
pub fn convert_to_extraction_result(result: &RemoteAstResult, tenant_id: &str) -> ExtractionResult {
    let service_id = derive_service_id(&result.file_path);
    let is_server = !result.service_hints.is_empty() || !result.http_handlers.is_empty();

    let mut services = Vec::new();
    if is_server {
        services.push(ServiceNode {
            id: service_id.clone(),
            name: if result.package_name.is_empty() {
                service_id.clone()
            } else {
                result.package_name.clone()
            },
            language: result.language.clone(),
            framework: detect_framework(result),
            otel_enabled: result.imports.iter().any(|i| i.contains("opentelemetry")),
            tenant_id: tenant_id.to_string(),
            team_owner: None,
            namespace_acl: vec![],
            read_roles: vec![],
            confidence: 1.0,
            content_hash: String::new(),
        });
    }

    let calls = result
        .http_calls
        .iter()
        .map(|call| CallsEdge {
            source_service_id: service_id.clone(),
            target_service_id: if call.path_hint.is_empty() {
                "unknown".to_string()
            } else {
                call.path_hint.clone()
            },
            protocol: "http".to_string(),
            tenant_id: tenant_id.to_string(),
            confidence: 1.0,
            ingestion_id: String::new(),
            last_seen_at: String::new(),
        })
        .collect();

    ExtractionResult { services, calls }
}

// ============================================================================
// TRANSPORT SEAM + TONIC IMPLEMENTATION
// ============================================================================

/// Wire request for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct AstFileRequest {
    pub path: String,
    pub content: String,
}

/// Transport to the AST worker fleet.
#[async_trait]
pub trait AstTransport: Send + Sync {
    async fn send_batch(&self, requests: &[AstFileRequest]) -> LatticeResult<Vec<RemoteAstResult>>;
}

/// Prost wire types for the AST worker service.
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AstFile {
        #[prost(string, tag = "1")]
        pub path: String,
        #[prost(string, tag = "2")]
        pub content: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ExtractBatchRequest {
        #[prost(message, repeated, tag = "1")]
        pub files: Vec<AstFile>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FunctionInfo {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(bool, tag = "2")]
        pub exported: bool,
        #[prost(uint32, tag = "3")]
        pub parameters: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct HttpCallInfo {
        #[prost(string, tag = "1")]
        pub method: String,
        #[prost(string, tag = "2")]
        pub path_hint: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FileResult {
        #[prost(string, tag = "1")]
        pub file_path: String,
        #[prost(string, tag = "2")]
        pub language: String,
        #[prost(string, tag = "3")]
        pub package_name: String,
        #[prost(message, repeated, tag = "4")]
        pub functions: Vec<FunctionInfo>,
        #[prost(string, repeated, tag = "5")]
        pub imports: Vec<String>,
        #[prost(message, repeated, tag = "6")]
        pub http_calls: Vec<HttpCallInfo>,
        #[prost(string, repeated, tag = "7")]
        pub service_hints: Vec<String>,
        #[prost(string, repeated, tag = "8")]
        pub http_handlers: Vec<String>,
        #[prost(string, tag = "9")]
        pub source_type: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ExtractBatchResponse {
        #[prost(message, repeated, tag = "1")]
        pub results: Vec<FileResult>,
    }
}

impl From<proto::FileResult> for RemoteAstResult {
    fn from(value: proto::FileResult) -> Self {
        RemoteAstResult {
            file_path: value.file_path,
            language: value.language,
            package_name: value.package_name,
            functions: value
                .functions
                .into_iter()
                .map(|f| FunctionInfo {
                    name: f.name,
                    exported: f.exported,
                    parameters: f.parameters,
                })
                .collect(),
            imports: value.imports,
            http_calls: value
                .http_calls
                .into_iter()
                .map(|c| HttpCallInfo {
                    method: c.method,
                    path_hint: c.path_hint,
                })
                .collect(),
            service_hints: value.service_hints,
            http_handlers: value.http_handlers,
            source_type: if value.source_type.is_empty() {
                "source_code".to_string()
            } else {
                value.source_type
            },
        }
    }
}

fn map_transport_error(err: tonic::Status) -> lattice_core::LatticeError {
    match err.code() {
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded => StoreError::Unavailable {
            message: err.to_string(),
        }
        .into(),
        tonic::Code::ResourceExhausted => StoreError::RateLimited {
            message: err.to_string(),
        }
        .into(),
        _ => StoreError::Driver {
            message: err.to_string(),
        }
        .into(),
    }
}

/// gRPC transport over tonic.
pub struct TonicAstTransport {
    channel: tonic::transport::Channel,
}

impl TonicAstTransport {
    pub async fn connect(config: &AstConfig) -> LatticeResult<Self> {
        let endpoint = tonic::transport::Endpoint::from_shared(config.endpoint.clone())
            .map_err(|err| StoreError::Driver {
                message: format!("invalid AST endpoint: {err}"),
            })?
            .timeout(config.timeout);
        let channel = endpoint.connect().await.map_err(|err| StoreError::Unavailable {
            message: err.to_string(),
        })?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl AstTransport for TonicAstTransport {
    async fn send_batch(&self, requests: &[AstFileRequest]) -> LatticeResult<Vec<RemoteAstResult>> {
        let request = proto::ExtractBatchRequest {
            files: requests
                .iter()
                .map(|r| proto::AstFile {
                    path: r.path.clone(),
                    content: r.content.clone(),
                })
                .collect(),
        };

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|err| StoreError::Unavailable {
            message: err.to_string(),
        })?;
        let codec: tonic::codec::ProstCodec<proto::ExtractBatchRequest, proto::ExtractBatchResponse> =
            tonic::codec::ProstCodec::default();
        let path = tonic::codegen::http::uri::PathAndQuery::from_static(
            "/lattice.ast.AstExtractor/ExtractBatch",
        );
        let response = grpc
            .unary(tonic::Request::new(request), path, codec)
            .await
            .map_err(map_transport_error)?;
        Ok(response
            .into_inner()
            .results
            .into_iter()
            .map(RemoteAstResult::from)
            .collect())
    }
}

// ============================================================================
// REMOTE CLIENT
// ============================================================================

/// Retry-After hint surfaced with degradation, matching the breaker's
/// recovery window.
const DEGRADED_RETRY_AFTER_SECONDS: u64 = 30;

/// gRPC AST client: transport + dedicated breaker + dead-letter queue.
pub struct GrpcAstClient {
    config: AstConfig,
    transport: Option<Arc<dyn AstTransport>>,
    breaker: CircuitBreaker,
    dead_letter: Mutex<VecDeque<Vec<AstFileRequest>>>,
    dead_letter_cap: usize,
}

impl GrpcAstClient {
    pub fn new(config: AstConfig, transport: Option<Arc<dyn AstTransport>>) -> Self {
        let breaker = CircuitBreaker::new(
            "ast-grpc",
            CircuitBreakerConfig {
                failure_threshold: config.max_retries,
                recovery_timeout: config.timeout,
                half_open_max_calls: 1,
                jitter_factor: 0.0,
            },
        );
        Self {
            config,
            transport,
            breaker,
            dead_letter: Mutex::new(VecDeque::new()),
            dead_letter_cap: 64,
        }
    }

    pub fn is_available(&self) -> bool {
        !self.config.endpoint.is_empty() && self.breaker.state() != CircuitState::Open
    }

    /// Payloads parked after degradation, oldest first.
    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take everything parked in the dead-letter queue (for replay).
    pub fn drain_dead_letter(&self) -> Vec<Vec<AstFileRequest>> {
        self.dead_letter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    fn park_dead_letter(&self, payload: Vec<AstFileRequest>) {
        let mut queue = self.dead_letter.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(payload);
        while queue.len() > self.dead_letter_cap {
            queue.pop_front();
            tracing::warn!("AST dead-letter queue full, evicting oldest payload");
        }
    }

    /// Extract a batch remotely. Breaker-open and network-class failures
    /// park the payload and degrade.
    pub async fn extract_batch(
        &self,
        files: &[RawFile],
    ) -> LatticeResult<Vec<RemoteAstResult>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let transport = self.transport.as_ref().ok_or_else(|| StoreError::Unavailable {
            message: format!(
                "no transport configured for gRPC endpoint {}",
                self.config.endpoint
            ),
        })?;

        let requests: Vec<AstFileRequest> = files
            .iter()
            .map(|f| AstFileRequest {
                path: f.path.clone(),
                content: f.content.clone(),
            })
            .collect();

        let result = self
            .breaker
            .call(transport.send_batch(&requests))
            .await;

        match result {
            Ok(results) => Ok(results),
            Err(err) => {
                let degraded = matches!(
                    err,
                    lattice_core::LatticeError::Resilience(_)
                ) || lattice_core::is_global_failure(&err);
                if degraded {
                    tracing::warn!(%err, "AST worker fleet degraded, parking payload");
                    self.park_dead_letter(requests);
                    return Err(IngestionError::Degraded {
                        retry_after_seconds: DEGRADED_RETRY_AFTER_SECONDS,
                    }
                    .into());
                }
                Err(err)
            }
        }
    }
}

// ============================================================================
// LOCAL POOL
// ============================================================================

/// Heuristic extraction for local mode: framework and handler hints from
/// the raw source, good enough to seed the graph without the worker fleet.
pub fn heuristic_extract(file: &RawFile) -> RemoteAstResult {
    let language = if file.path.ends_with(".go") { "go" } else { "python" };
    let mut service_hints = Vec::new();
    let mut http_handlers = Vec::new();
    let mut imports = Vec::new();

    for line in file.content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            imports.push(trimmed.to_string());
        }
        if trimmed.contains("http.ListenAndServe")
            || trimmed.contains("gin.Default()")
            || trimmed.contains("echo.New()")
            || trimmed.contains("FastAPI(")
            || trimmed.contains("Flask(")
        {
            service_hints.push("http-server".to_string());
        }
        if trimmed.contains("grpc.NewServer") || trimmed.contains("add_insecure_port") {
            service_hints.push("grpc-server".to_string());
        }
        if trimmed.contains("HandleFunc(") || trimmed.contains("@app.route") {
            http_handlers.push(trimmed.to_string());
        }
    }
    service_hints.dedup();

    RemoteAstResult {
        file_path: file.path.clone(),
        language: language.to_string(),
        package_name: String::new(),
        functions: vec![],
        imports,
        http_calls: vec![],
        service_hints,
        http_handlers,
        source_type: "source_code".to_string(),
    }
}

/// Local worker pool: blocking extraction bounded by a semaphore whose
/// permit count is the clamped `AST_POOL_WORKERS`.
pub struct LocalAstPool {
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl LocalAstPool {
    pub fn new(config: &AstConfig) -> Self {
        Self {
            semaphore: Arc::new(tokio::sync::Semaphore::new(config.pool_workers)),
        }
    }

    pub async fn extract_batch(&self, files: &[RawFile]) -> LatticeResult<Vec<RemoteAstResult>> {
        let mut handles = Vec::with_capacity(files.len());
        for file in files.iter().cloned() {
            let semaphore = Arc::clone(&self.semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                tokio::task::spawn_blocking(move || heuristic_extract(&file))
                    .await
                    .map_err(|err| StoreError::Driver {
                        message: format!("local AST task failed: {err}"),
                    })
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle.await.map_err(|err| StoreError::Driver {
                message: format!("local AST task join failed: {err}"),
            })??;
            results.push(result);
        }
        Ok(results)
    }
}

// ============================================================================
// MODE SELECTION
// ============================================================================

/// Remote or local extraction, fixed at construction. The local pool is
/// only built when remote mode is off.
pub enum AstExtractionService {
    Remote(GrpcAstClient),
    Local(LocalAstPool),
}

impl AstExtractionService {
    pub fn from_config(config: AstConfig, transport: Option<Arc<dyn AstTransport>>) -> Self {
        if config.use_remote {
            AstExtractionService::Remote(GrpcAstClient::new(config, transport))
        } else {
            AstExtractionService::Local(LocalAstPool::new(&config))
        }
    }

    pub async fn extract_batch(&self, files: &[RawFile]) -> LatticeResult<Vec<RemoteAstResult>> {
        match self {
            AstExtractionService::Remote(client) => client.extract_batch(files).await,
            AstExtractionService::Local(pool) => pool.extract_batch(files).await,
        }
    }
}
