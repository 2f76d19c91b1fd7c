use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_params, schema_of, Tool, ToolContext, ToolOutput};
use crate::error::ToolError;
use crate::memory::SharedMemory;

const MAX_READ_LEN: usize = 50_000;
const ENOSPC: i32 = 28;

/// Where file tools may reach and where they report activity.
#[derive(Clone, Default)]
pub struct FsScope {
    /// Relative paths resolve against this directory (process cwd when unset).
    pub base_dir: Option<PathBuf>,
    /// When set, every resolved path must stay inside this directory.
    pub allowed_dir: Option<PathBuf>,
    /// Working-state sink for file access and edits.
    pub memory: Option<SharedMemory>,
}

impl FsScope {
    pub fn new(base_dir: Option<PathBuf>, allowed_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            allowed_dir,
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: SharedMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    fn expand(&self, path: &str) -> PathBuf {
        let expanded = if path.starts_with("~/") || path == "~" {
            dirs::home_dir()
                .map(|h| h.join(path.strip_prefix("~/").unwrap_or("")))
                .unwrap_or_else(|| PathBuf::from(path))
        } else {
            PathBuf::from(path)
        };
        match (&self.base_dir, expanded.is_relative()) {
            (Some(base), true) => base.join(expanded),
            _ => expanded,
        }
    }

    fn check_allowed(&self, path: &str, resolved: &Path) -> Result<(), ToolError> {
        if let Some(allowed) = &self.allowed_dir {
            let allowed_resolved = allowed
                .canonicalize()
                .unwrap_or_else(|_| allowed.to_path_buf());
            if !resolved.starts_with(&allowed_resolved) {
                return Err(ToolError::execution(format!(
                    "Path {path} is outside allowed directory {}",
                    allowed.display()
                )));
            }
        }
        Ok(())
    }

    /// Resolve an existing path, following symlinks.
    fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let expanded = self.expand(path);
        let resolved = expanded
            .canonicalize()
            .unwrap_or_else(|_| std::path::absolute(&expanded).unwrap_or(expanded));
        self.check_allowed(path, &resolved)?;
        Ok(resolved)
    }

    /// Resolve a path that may not exist yet.
    fn resolve_for_write(&self, path: &str) -> Result<PathBuf, ToolError> {
        let expanded = self.expand(path);
        let resolved = std::path::absolute(&expanded).unwrap_or(expanded);
        // Canonicalize the deepest existing ancestor so symlinked temp dirs still match.
        let resolved = match resolved.parent().and_then(|p| p.canonicalize().ok()) {
            Some(parent) => match resolved.file_name() {
                Some(name) => parent.join(name),
                None => resolved,
            },
            None => resolved,
        };
        self.check_allowed(path, &resolved)?;
        Ok(resolved)
    }

    async fn record_access(&self, path: &str) {
        if let Some(memory) = &self.memory {
            memory.lock().await.record_file_access(path);
        }
    }

    async fn record_edit(&self, path: &str, summary: &str) {
        if let Some(memory) = &self.memory {
            memory.lock().await.record_edit(path, summary);
        }
    }
}

/// User-facing message for a filesystem failure.
pub fn fs_error_message(action: &str, path: &str, err: &io::Error) -> String {
    if err.raw_os_error() == Some(ENOSPC) {
        return format!("Disk full: could not {action} {path}");
    }
    match err.kind() {
        io::ErrorKind::NotFound => format!("File not found: {path}"),
        io::ErrorKind::PermissionDenied => format!("Permission denied: {path}"),
        _ => format!("Could not {action} {path}: {err}"),
    }
}

fn fs_error(action: &str, path: &str, err: io::Error) -> ToolError {
    ToolError::Execution(fs_error_message(action, path, &err))
}

// ---------------------------------------------------------------------------
// ReadFileTool
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PathParams {
    /// File or directory path; relative paths resolve against the workspace
    pub path: String,
}

pub struct ReadFileTool {
    scope: FsScope,
}

impl ReadFileTool {
    pub fn new(scope: FsScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: PathParams = parse_params(self.name(), params)?;
        let file_path = self.scope.resolve(&p.path)?;
        if file_path.is_dir() {
            return Err(ToolError::execution(format!("Not a file: {}", p.path)));
        }
        let content =
            std::fs::read_to_string(&file_path).map_err(|e| fs_error("read", &p.path, e))?;
        self.scope.record_access(&p.path).await;

        if content.len() > MAX_READ_LEN {
            let mut end = MAX_READ_LEN;
            while end > 0 && !content.is_char_boundary(end) {
                end -= 1;
            }
            return Ok(ToolOutput::ok(format!(
                "{}\n... (truncated, {} more chars)",
                &content[..end],
                content.len() - end
            )));
        }
        Ok(ToolOutput::ok(content))
    }
}

// ---------------------------------------------------------------------------
// WriteFileTool
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteParams {
    /// The file path to write to
    pub path: String,
    /// The content to write
    pub content: String,
}

pub struct WriteFileTool {
    scope: FsScope,
}

impl WriteFileTool {
    pub fn new(scope: FsScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path. Creates parent directories if needed."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WriteParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: WriteParams = parse_params(self.name(), params)?;
        let file_path = self.scope.resolve_for_write(&p.path)?;
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| fs_error("create directories for", &p.path, e))?;
        }
        std::fs::write(&file_path, &p.content).map_err(|e| fs_error("write", &p.path, e))?;
        let summary = format!("wrote {} bytes", p.content.len());
        self.scope.record_edit(&p.path, &summary).await;
        Ok(ToolOutput::ok(format!(
            "Successfully wrote {} bytes to {}",
            p.content.len(),
            p.path
        )))
    }
}

// ---------------------------------------------------------------------------
// EditFileTool
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditParams {
    /// The file path to edit
    pub path: String,
    /// The exact text to find and replace
    pub old_text: String,
    /// The text to replace with
    pub new_text: String,
}

pub struct EditFileTool {
    scope: FsScope,
}

impl EditFileTool {
    pub fn new(scope: FsScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing old_text with new_text. The old_text must exist exactly once in the file."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EditParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: EditParams = parse_params(self.name(), params)?;
        let file_path = self.scope.resolve(&p.path)?;
        let content =
            std::fs::read_to_string(&file_path).map_err(|e| fs_error("read", &p.path, e))?;

        match content.matches(p.old_text.as_str()).count() {
            0 => {
                return Err(ToolError::execution(
                    "old_text not found in file. Make sure it matches exactly.",
                ))
            }
            1 => {}
            count => {
                return Err(ToolError::execution(format!(
                    "old_text appears {count} times. Provide more context to make it unique."
                )))
            }
        }

        let new_content = content.replacen(&p.old_text, &p.new_text, 1);
        std::fs::write(&file_path, new_content).map_err(|e| fs_error("write", &p.path, e))?;
        let summary = format!(
            "replaced {} bytes with {} bytes",
            p.old_text.len(),
            p.new_text.len()
        );
        self.scope.record_edit(&p.path, &summary).await;
        Ok(ToolOutput::ok(format!("Successfully edited {}", p.path)))
    }
}

// ---------------------------------------------------------------------------
// ListDirTool
// ---------------------------------------------------------------------------

pub struct ListDirTool {
    scope: FsScope,
}

impl ListDirTool {
    pub fn new(scope: FsScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a directory."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: PathParams = parse_params(self.name(), params)?;
        let dir_path = self.scope.resolve(&p.path)?;
        if dir_path.is_file() {
            return Err(ToolError::execution(format!("Not a directory: {}", p.path)));
        }

        let read_dir = std::fs::read_dir(&dir_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                ToolError::execution(format!("Directory not found: {}", p.path))
            }
            _ => fs_error("list", &p.path, e),
        })?;
        let mut items: Vec<_> = read_dir.flatten().collect();
        items.sort_by_key(|e| e.file_name());

        let entries: Vec<String> = items
            .iter()
            .map(|item| {
                let name = item.file_name().to_string_lossy().to_string();
                let prefix = if item.path().is_dir() {
                    "[dir]  "
                } else {
                    "[file] "
                };
                format!("{prefix}{name}")
            })
            .collect();

        if entries.is_empty() {
            Ok(ToolOutput::ok(format!("Directory {} is empty", p.path)))
        } else {
            Ok(ToolOutput::ok(entries.join("\n")))
        }
    }
}
