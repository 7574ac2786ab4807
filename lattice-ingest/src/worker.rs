//! Message-bus extraction worker.
//!
//! Consumes staged-file events and feeds them into the ingestion callback
//! under a concurrency bound. The staging directory is honored literally:
//! the event path must canonicalize inside it, or the event is rejected as
//! path traversal before any byte is read into a prompt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use lattice_core::{IngestionError, LatticeResult, SecurityError};
use lattice_guard::sanitize_source_content;

use crate::workspace::RawFile;

/// One extraction event from the bus: a staged file plus routing headers
/// (`file_path`, `source_type`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionEvent {
    pub staging_path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ExtractionEvent {
    pub fn from_json(raw: &[u8]) -> LatticeResult<Self> {
        serde_json::from_slice(raw).map_err(|err| {
            lattice_core::StoreError::Serialization {
                message: format!("extraction event decode failed: {err}"),
            }
            .into()
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionWorkerConfig {
    pub max_concurrent: usize,
    pub staging_dir: String,
    pub max_source_bytes: usize,
}

impl Default for ExtractionWorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            staging_dir: "/var/lattice/staging".to_string(),
            max_source_bytes: 1_000_000,
        }
    }
}

/// The ingestion entry point the worker feeds.
#[async_trait::async_trait]
pub trait IngestSink: Send + Sync {
    async fn ingest(&self, files: Vec<RawFile>) -> LatticeResult<()>;
}

pub struct ExtractionWorker {
    config: ExtractionWorkerConfig,
    sink: Arc<dyn IngestSink>,
    semaphore: Arc<tokio::sync::Semaphore>,
}

impl ExtractionWorker {
    pub fn new(config: ExtractionWorkerConfig, sink: Arc<dyn IngestSink>) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            config,
            sink,
            semaphore: Arc::new(tokio::sync::Semaphore::new(permits)),
        }
    }

    /// Canonicalized path must begin with the canonicalized staging root.
    fn check_staging_path(&self, path: &str) -> LatticeResult<std::path::PathBuf> {
        let root = Path::new(&self.config.staging_dir)
            .canonicalize()
            .map_err(|_| SecurityError::PathTraversal {
                path: path.to_string(),
            })?;
        let resolved = Path::new(path)
            .canonicalize()
            .map_err(|_| IngestionError::StagingFileUnreadable {
                path: path.to_string(),
            })?;
        if !resolved.starts_with(&root) || resolved == root {
            return Err(SecurityError::PathTraversal {
                path: path.to_string(),
            }
            .into());
        }
        Ok(resolved)
    }

    /// Process one event: guard the path, read and sanitize the payload,
    /// hand it to the ingest sink.
    pub async fn process_event(&self, event: &ExtractionEvent) -> LatticeResult<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| lattice_core::ResilienceError::TaskSetOverflow)?;

        let resolved = self.check_staging_path(&event.staging_path)?;
        let content = std::fs::read_to_string(&resolved).map_err(|err| {
            tracing::error!(path = %resolved.display(), %err, "failed to read staged file");
            IngestionError::StagingFileUnreadable {
                path: event.staging_path.clone(),
            }
        })?;

        let file_path = event
            .headers
            .get("file_path")
            .cloned()
            .unwrap_or_else(|| event.staging_path.clone());
        let content =
            sanitize_source_content(&content, &file_path, self.config.max_source_bytes)?;

        self.sink
            .ingest(vec![RawFile {
                path: file_path,
                content,
            }])
            .await
    }

    /// Process a batch of events concurrently (each bounded by the
    /// semaphore). Per-event outcomes are returned in order.
    pub async fn run(&self, events: &[ExtractionEvent]) -> Vec<LatticeResult<()>> {
        let mut handles = Vec::with_capacity(events.len());
        for event in events {
            handles.push(self.process_event(event));
        }
        futures_util::future::join_all(handles).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::LatticeError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Vec<RawFile>>>,
    }

    #[async_trait::async_trait]
    impl IngestSink for RecordingSink {
        async fn ingest(&self, files: Vec<RawFile>) -> LatticeResult<()> {
            self.received
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(files);
            Ok(())
        }
    }

    fn setup_staging() -> (std::path::PathBuf, ExtractionWorkerConfig) {
        let dir = std::env::temp_dir().join(format!(
            "lattice-staging-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let config = ExtractionWorkerConfig {
            staging_dir: dir.to_string_lossy().into_owned(),
            ..ExtractionWorkerConfig::default()
        };
        (dir, config)
    }

    #[tokio::test]
    async fn test_staged_file_flows_to_sink() {
        let (dir, config) = setup_staging();
        std::fs::write(dir.join("payload.go"), "package main").unwrap();

        let sink = Arc::new(RecordingSink::default());
        let worker = ExtractionWorker::new(config, Arc::clone(&sink) as Arc<dyn IngestSink>);
        let event = ExtractionEvent {
            staging_path: dir.join("payload.go").to_string_lossy().into_owned(),
            headers: HashMap::from([("file_path".to_string(), "services/auth/main.go".to_string())]),
        };
        worker.process_event(&event).await.unwrap();

        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0][0].path, "services/auth/main.go");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (dir, config) = setup_staging();
        // A real file outside the staging root.
        let outside = std::env::temp_dir().join(format!("lattice-outside-{}", std::process::id()));
        std::fs::write(&outside, "secrets").unwrap();

        let worker = ExtractionWorker::new(config, Arc::new(RecordingSink::default()));
        let event = ExtractionEvent {
            staging_path: format!(
                "{}/../{}",
                dir.to_string_lossy(),
                outside.file_name().unwrap().to_string_lossy()
            ),
            headers: HashMap::new(),
        };
        let err = worker.process_event(&event).await.unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Security(SecurityError::PathTraversal { .. })
        ));

        std::fs::remove_file(&outside).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_staged_file_is_reported() {
        let (dir, config) = setup_staging();
        let worker = ExtractionWorker::new(config, Arc::new(RecordingSink::default()));
        let event = ExtractionEvent {
            staging_path: dir.join("ghost.go").to_string_lossy().into_owned(),
            headers: HashMap::new(),
        };
        let err = worker.process_event(&event).await.unwrap_err();
        assert!(matches!(
            err,
            LatticeError::Ingestion(IngestionError::StagingFileUnreadable { .. })
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_event_json_roundtrip() {
        let raw = br#"{"staging_path": "/staging/x.go", "headers": {"file_path": "a/x.go", "source_type": "source_code"}}"#;
        let event = ExtractionEvent::from_json(raw).unwrap();
        assert_eq!(event.staging_path, "/staging/x.go");
        assert_eq!(event.headers.get("source_type").map(String::as_str), Some("source_code"));
    }
}
