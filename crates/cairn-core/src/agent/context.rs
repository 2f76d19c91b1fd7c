use std::path::{Path, PathBuf};

/// Bootstrap files loaded into the system prompt.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "CAIRN.md", "CONVENTIONS.md"];

/// Builds the system prompt for LLM calls.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    workspace: PathBuf,
    /// Optional override for the identity section (used by subagents).
    preamble_override: Option<String>,
}

impl ContextBuilder {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            preamble_override: None,
        }
    }

    /// Create a ContextBuilder with a custom preamble (for subagents).
    pub fn with_preamble(workspace: &Path, preamble: String) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            preamble_override: Some(preamble),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Build the full system prompt from identity, bootstrap files and the
    /// session memory summary.
    pub fn build_system_prompt(&self, memory_summary: &str) -> String {
        let mut parts = Vec::new();

        match &self.preamble_override {
            Some(preamble) => parts.push(preamble.clone()),
            None => {
                parts.push(self.get_identity());
                let bootstrap = self.load_bootstrap_files();
                if !bootstrap.is_empty() {
                    parts.push(bootstrap);
                }
            }
        }

        if !memory_summary.trim().is_empty() {
            parts.push(format!("# Session Memory\n\n{memory_summary}"));
        }

        parts.join("\n\n---\n\n")
    }

    fn get_identity(&self) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let tz = chrono::Local::now().format("%Z");
        let workspace_path = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone())
            .display()
            .to_string();
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;

        format!(
            r#"# Cairn

You are Cairn, an autonomous coding agent. You have access to tools that allow you to:
- Read, write, and edit files
- Execute shell commands
- Track goals and a task graph for the session
- Remember user preferences, facts, decisions and project context
- Delegate bounded sub-tasks to subagents that run concurrently

## Current Time
{now} ({tz})

## Runtime
{os} {arch}, Rust

## Workspace
Your workspace is at: {workspace_path}

## Working Style
Break large requests into tasks with the 'task' tool, then use action 'next' to pick
what to work on. Independent tasks can be handed to subagents with 'spawn_agent' and
collected with 'wait_agent'. When several tool calls do not depend on each other, wrap
them in one 'parallel' call.
When the user states a preference or corrects you, record it with 'remember'.

Always be accurate and concise. When the work is done, reply with a short summary of
what changed and how it was verified."#
        )
    }

    fn load_bootstrap_files(&self) -> String {
        let mut parts = Vec::new();

        for filename in BOOTSTRAP_FILES {
            let file_path = self.workspace.join(filename);
            if file_path.exists() {
                if let Ok(content) = std::fs::read_to_string(&file_path) {
                    parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }

        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_bootstrap_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Run cargo fmt before committing.").unwrap();

        let prompt = ContextBuilder::new(dir.path()).build_system_prompt("");
        assert!(prompt.starts_with("# Cairn"));
        assert!(prompt.contains("## AGENTS.md"));
        assert!(prompt.contains("cargo fmt"));
        assert!(!prompt.contains("# Session Memory"));
    }

    #[test]
    fn test_preamble_override_keeps_memory_section() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "ignored").unwrap();

        let ctx = ContextBuilder::with_preamble(dir.path(), "You are a worker.".into());
        let prompt = ctx.build_system_prompt("## Current Goal\nship it");
        assert!(prompt.starts_with("You are a worker."));
        assert!(!prompt.contains("AGENTS.md"));
        assert!(prompt.contains("# Session Memory\n\n## Current Goal"));
    }
}
