//! Workspace loading.
//!
//! Walks a source tree with hard caps: excluded directories, an extension
//! allowlist, a per-file size cap (oversized files are skipped), and a
//! per-workspace byte cap (exceeding it fails the load). Results are sorted
//! by forward-slash relative path so every replica sees the same order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use lattice_core::{IngestionError, LatticeResult, WorkspaceConfig};

/// One loaded source file: relative forward-slash path plus content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFile {
    pub path: String,
    pub content: String,
}

const EXCLUDED_DIRS: [&str; 9] = [
    ".git",
    ".venv",
    "__pycache__",
    "node_modules",
    ".mypy_cache",
    ".pytest_cache",
    ".tox",
    ".eggs",
    "venv",
];

const INCLUDED_EXTENSIONS: [&str; 4] = ["go", "py", "yaml", "yml"];

fn normalize_relative(root: &Path, full: &Path) -> Option<String> {
    let relative = full.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// A loaded workspace: eligible files plus the relative paths that were
/// skipped (oversized or unreadable).
#[derive(Debug, Clone, Default)]
pub struct LoadedWorkspace {
    pub files: Vec<RawFile>,
    pub skipped: Vec<String>,
}

/// Load every eligible file under `directory_path`.
pub fn load_directory(directory_path: &str, config: &WorkspaceConfig) -> LatticeResult<Vec<RawFile>> {
    load_directory_with_skips(directory_path, config).map(|loaded| loaded.files)
}

/// Load every eligible file under `directory_path`, reporting skips.
pub fn load_directory_with_skips(
    directory_path: &str,
    config: &WorkspaceConfig,
) -> LatticeResult<LoadedWorkspace> {
    let root = Path::new(directory_path);
    if !root.is_dir() {
        return Ok(LoadedWorkspace::default());
    }

    let excluded: HashSet<&str> = EXCLUDED_DIRS.into_iter().collect();
    let mut results: Vec<RawFile> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    let mut total_bytes: u64 = 0;
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %current.display(), %err, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !excluded.contains(name.as_str()) {
                    stack.push(path);
                }
                continue;
            }

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !INCLUDED_EXTENSIONS.contains(&extension.as_str()) {
                continue;
            }

            let size = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if size > config.max_file_bytes {
                tracing::debug!(path = %path.display(), size, "skipping oversized file");
                if let Some(relative) = normalize_relative(root, &path) {
                    skipped.push(relative);
                }
                continue;
            }

            total_bytes += size;
            if total_bytes > config.max_workspace_bytes {
                return Err(IngestionError::WorkspaceTooLarge {
                    bytes: total_bytes,
                    limit: config.max_workspace_bytes,
                }
                .into());
            }

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(_) => {
                    if let Some(relative) = normalize_relative(root, &path) {
                        skipped.push(relative);
                    }
                    continue;
                }
            };
            if let Some(relative) = normalize_relative(root, &path) {
                results.push(RawFile {
                    path: relative,
                    content,
                });
            }
        }
    }

    results.sort_by(|a, b| a.path.cmp(&b.path));
    skipped.sort();
    Ok(LoadedWorkspace {
        files: results,
        skipped,
    })
}

/// Load and yield files in deterministic chunks so callers can bound peak
/// memory while processing very large workspaces.
pub fn load_directory_in_chunks(
    directory_path: &str,
    config: &WorkspaceConfig,
    chunk_size: usize,
) -> LatticeResult<Vec<Vec<RawFile>>> {
    let files = load_directory(directory_path, config)?;
    Ok(files
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect())
}
