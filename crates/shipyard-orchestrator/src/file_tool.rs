use crate::collaborators::{ToolExecutor, ToolRequest, ToolResponse};
use async_trait::async_trait;
use shipyard_core::ShipyardResult;
use std::path::{Path, PathBuf};
use tracing::info;

/// Largest artifact the reader will open.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

const BLOCKED_PATTERNS: &[&str] = &[".ssh/", ".env", "credentials", "secret", ".aws/", ".git/"];

/// Read-only artifact reader confined to one workspace directory.
///
/// Supports a single tool, `read_file`. Paths are resolved against the
/// workspace root and canonicalized, so symlinks and `..` cannot escape it.
pub struct FileToolExecutor {
    root: PathBuf,
    max_file_size: u64,
}

impl FileToolExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_file(&self, path_str: &str) -> ToolResponse {
        if path_str.is_empty() {
            return ToolResponse::error("Empty path");
        }

        let root = match tokio::fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(e) => return ToolResponse::error(format!("Workspace root unavailable: {e}")),
        };
        let requested = Path::new(path_str);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            root.join(requested)
        };
        let canonical = match tokio::fs::canonicalize(&joined).await {
            Ok(p) => p,
            Err(e) => return ToolResponse::error(format!("Cannot resolve path '{path_str}': {e}")),
        };

        if !canonical.starts_with(&root) {
            return ToolResponse::denied(format!("'{path_str}' is outside the workspace"));
        }
        let canonical_str = canonical.to_string_lossy();
        if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| canonical_str.contains(*p)) {
            return ToolResponse::denied(format!(
                "Access denied: '{path_str}' matches blocked pattern '{pattern}'"
            ));
        }

        let metadata = match tokio::fs::metadata(&canonical).await {
            Ok(m) => m,
            Err(e) => {
                return ToolResponse::error(format!("Cannot read metadata for '{path_str}': {e}"))
            }
        };
        if !metadata.is_file() {
            return ToolResponse::error(format!("'{path_str}' is not a file"));
        }
        if metadata.len() > self.max_file_size {
            return ToolResponse::error(format!(
                "'{path_str}' is {} bytes, limit is {}",
                metadata.len(),
                self.max_file_size
            ));
        }

        match tokio::fs::read(&canonical).await {
            Ok(bytes) => {
                info!(path = %canonical.display(), bytes = bytes.len(), "artifact read");
                ToolResponse::ok(serde_json::json!({
                    "path": path_str,
                    "content": String::from_utf8_lossy(&bytes),
                    "size": bytes.len(),
                }))
            }
            Err(e) => ToolResponse::error(format!("Failed to read '{path_str}': {e}")),
        }
    }
}

#[async_trait]
impl ToolExecutor for FileToolExecutor {
    async fn execute(&self, request: ToolRequest) -> ShipyardResult<ToolResponse> {
        match request.tool.as_str() {
            "read_file" => {
                let path = request.arguments["path"].as_str().unwrap_or_default();
                Ok(self.read_file(path).await)
            }
            other => Ok(ToolResponse::denied(format!("Unknown tool '{other}'"))),
        }
    }
}
