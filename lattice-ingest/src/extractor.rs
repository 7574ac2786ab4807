//! LLM-backed service extraction.
//!
//! The provider itself is a collaborator behind a trait. This module owns
//! the parts that must not drift per provider: source-file filtering,
//! token-budgeted batching, bounded concurrency, rate-limit retries with
//! exponential backoff, cross-batch dedup, and ACL defaulting (read roles
//! plus team-owner inference from repository layout).

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

use lattice_core::{
    count_tokens, CallsEdge, ExtractionResult, LatticeError, LatticeResult, ServiceNode,
    StoreError,
};
use lattice_guard::sanitize_source_content;

use crate::workspace::RawFile;

/// Seam to the model provider. Implementations receive sanitized file
/// payloads and return structured extraction output.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(&self, files: &[RawFile]) -> LatticeResult<ExtractionResult>;
}

const DEFAULT_READ_ROLES: [&str; 1] = ["reader"];

static SAFE_TEAM_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]{0,62}$").unwrap());

const TEAM_HINT_DIRECTORIES: [&str; 6] = ["services", "teams", "apps", "cmd", "pkg", "internal"];

/// Infer a team owner from path layout: the segment after a well-known
/// grouping directory, when it looks like a team name.
pub fn infer_team_owner_from_paths(paths: &[String]) -> Option<String> {
    for path in paths {
        let parts: Vec<&str> = path.split('/').collect();
        for (index, segment) in parts.iter().enumerate() {
            // The candidate must not be the file name itself.
            if TEAM_HINT_DIRECTORIES.contains(segment) && index + 2 < parts.len() {
                let candidate = parts[index + 1];
                if SAFE_TEAM_NAME.is_match(candidate) {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    None
}

fn apply_acl_defaults(mut result: ExtractionResult, source_paths: &[String]) -> ExtractionResult {
    let inferred_owner = infer_team_owner_from_paths(source_paths);
    for service in &mut result.services {
        if service.read_roles.is_empty() {
            service.read_roles = DEFAULT_READ_ROLES.iter().map(|r| r.to_string()).collect();
        }
        if service.team_owner.is_none() {
            service.team_owner = inferred_owner.clone();
        }
    }
    result
}

/// Extraction configuration the orchestrator owns (provider settings live
/// with the provider).
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub token_budget_per_batch: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_min_wait: Duration,
    pub retry_max_wait: Duration,
    pub max_source_bytes: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            token_budget_per_batch: 24_000,
            max_concurrency: 5,
            max_retries: 3,
            retry_min_wait: Duration::from_millis(200),
            retry_max_wait: Duration::from_secs(10),
            max_source_bytes: 1_000_000,
        }
    }
}

pub struct ServiceExtractor {
    provider: std::sync::Arc<dyn ExtractionProvider>,
    config: ExtractorConfig,
}

impl ServiceExtractor {
    pub fn new(
        provider: std::sync::Arc<dyn ExtractionProvider>,
        config: ExtractorConfig,
    ) -> Self {
        Self { provider, config }
    }

    /// Only raw source participates in LLM extraction.
    pub fn filter_source_files(raw_files: &[RawFile]) -> Vec<RawFile> {
        raw_files
            .iter()
            .filter(|f| f.path.ends_with(".go") || f.path.ends_with(".py"))
            .cloned()
            .collect()
    }

    /// Split files into batches whose combined token estimate stays under
    /// the per-batch budget. A single oversized file still forms a batch.
    pub fn batch_by_token_budget(files: Vec<RawFile>, budget: usize) -> Vec<Vec<RawFile>> {
        let mut batches: Vec<Vec<RawFile>> = Vec::new();
        let mut current: Vec<RawFile> = Vec::new();
        let mut current_tokens = 0usize;

        for file in files {
            let estimated = count_tokens(&file.content);
            if !current.is_empty() && current_tokens + estimated > budget {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += estimated;
            current.push(file);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    fn is_retryable(err: &LatticeError) -> bool {
        matches!(
            err,
            LatticeError::Store(StoreError::RateLimited { .. })
                | LatticeError::Store(StoreError::Unavailable { .. })
        )
    }

    async fn extract_batch_with_retry(&self, batch: &[RawFile]) -> LatticeResult<ExtractionResult> {
        // Sanitize file contents before they reach the provider prompt.
        let mut sanitized = Vec::with_capacity(batch.len());
        for file in batch {
            sanitized.push(RawFile {
                path: file.path.clone(),
                content: sanitize_source_content(
                    &file.content,
                    &file.path,
                    self.config.max_source_bytes,
                )?,
            });
        }

        let mut wait = self.config.retry_min_wait;
        let mut attempt = 0u32;
        loop {
            match self.provider.extract(&sanitized).await {
                Ok(result) => return Ok(result),
                Err(err) if Self::is_retryable(&err) && attempt + 1 < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(%err, attempt, "extraction retrying after backoff");
                    tokio::time::sleep(wait).await;
                    wait = std::cmp::min(wait * 2, self.config.retry_max_wait);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Extract over the whole file set: batch, fan out under the
    /// concurrency bound, dedupe services by id, merge calls, apply ACL
    /// defaults.
    pub async fn extract_all(&self, raw_files: &[RawFile]) -> LatticeResult<ExtractionResult> {
        let source_files = Self::filter_source_files(raw_files);
        if source_files.is_empty() {
            return Ok(ExtractionResult::default());
        }
        let source_paths: Vec<String> = source_files.iter().map(|f| f.path.clone()).collect();

        let batches =
            Self::batch_by_token_budget(source_files, self.config.token_budget_per_batch);

        let results: Vec<ExtractionResult> = stream::iter(
            batches
                .into_iter()
                .map(|batch| async move { self.extract_batch_with_retry(&batch).await }),
        )
        .buffer_unordered(self.config.max_concurrency)
        .try_collect()
        .await?;

        let mut seen_service_ids = std::collections::HashSet::new();
        let mut services: Vec<ServiceNode> = Vec::new();
        let mut calls: Vec<CallsEdge> = Vec::new();
        for result in results {
            for service in result.services {
                if seen_service_ids.insert(service.id.clone()) {
                    services.push(service);
                }
            }
            calls.extend(result.calls);
        }

        Ok(apply_acl_defaults(
            ExtractionResult { services, calls },
            &source_paths,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedProvider {
        results: Mutex<Vec<LatticeResult<ExtractionResult>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(results: Vec<LatticeResult<ExtractionResult>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionProvider for ScriptedProvider {
        async fn extract(&self, _files: &[RawFile]) -> LatticeResult<ExtractionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
            if results.is_empty() {
                Ok(ExtractionResult::default())
            } else {
                results.remove(0)
            }
        }
    }

    fn file(path: &str, content: &str) -> RawFile {
        RawFile {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn svc(id: &str) -> ServiceNode {
        ServiceNode {
            id: id.to_string(),
            name: id.to_string(),
            language: "go".to_string(),
            framework: "gin".to_string(),
            otel_enabled: false,
            tenant_id: "tenant-a".to_string(),
            team_owner: None,
            namespace_acl: vec![],
            read_roles: vec![],
            confidence: 0.9,
            content_hash: String::new(),
        }
    }

    fn fast_config() -> ExtractorConfig {
        ExtractorConfig {
            retry_min_wait: Duration::from_millis(1),
            retry_max_wait: Duration::from_millis(5),
            ..ExtractorConfig::default()
        }
    }

    #[test]
    fn test_filter_keeps_source_only() {
        let files = vec![
            file("a/main.go", ""),
            file("b/app.py", ""),
            file("c/deploy.yaml", ""),
        ];
        let filtered = ServiceExtractor::filter_source_files(&files);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_batching_respects_token_budget() {
        let files: Vec<RawFile> = (0..6)
            .map(|i| file(&format!("f{i}.go"), &"word ".repeat(100)))
            .collect();
        let per_file = count_tokens(&"word ".repeat(100));
        let batches = ServiceExtractor::batch_by_token_budget(files, per_file * 2);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 2));
    }

    #[test]
    fn test_team_owner_inference() {
        assert_eq!(
            infer_team_owner_from_paths(&["services/payments/api/main.go".to_string()]),
            Some("payments".to_string())
        );
        // The segment right before the file name is not a team directory.
        assert_eq!(
            infer_team_owner_from_paths(&["services/main.go".to_string()]),
            None
        );
        assert_eq!(
            infer_team_owner_from_paths(&["docs/guide.md".to_string()]),
            None
        );
    }

    #[tokio::test]
    async fn test_extract_all_dedupes_services() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ExtractionResult {
            services: vec![svc("auth"), svc("auth"), svc("billing")],
            calls: vec![],
        })]));
        let extractor = ServiceExtractor::new(provider, fast_config());
        let result = extractor
            .extract_all(&[file("services/auth/main.go", "package main")])
            .await
            .unwrap();
        assert_eq!(result.services.len(), 2);
    }

    #[tokio::test]
    async fn test_acl_defaults_applied() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(ExtractionResult {
            services: vec![svc("auth")],
            calls: vec![],
        })]));
        let extractor = ServiceExtractor::new(provider, fast_config());
        let result = extractor
            .extract_all(&[file("services/identity/auth/main.go", "package main")])
            .await
            .unwrap();
        assert_eq!(result.services[0].read_roles, vec!["reader"]);
        assert_eq!(result.services[0].team_owner.as_deref(), Some("identity"));
    }

    #[tokio::test]
    async fn test_rate_limits_retry_then_succeed() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(StoreError::RateLimited {
                message: "429".to_string(),
            }
            .into()),
            Ok(ExtractionResult {
                services: vec![svc("auth")],
                calls: vec![],
            }),
        ]));
        let extractor = ServiceExtractor::new(Arc::clone(&provider) as Arc<dyn ExtractionProvider>, fast_config());
        let result = extractor
            .extract_all(&[file("a/main.go", "package main")])
            .await
            .unwrap();
        assert_eq!(result.services.len(), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(StoreError::Driver {
            message: "schema mismatch".to_string(),
        }
        .into())]));
        let extractor = ServiceExtractor::new(Arc::clone(&provider) as Arc<dyn ExtractionProvider>, fast_config());
        assert!(extractor
            .extract_all(&[file("a/main.go", "package main")])
            .await
            .is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
