use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use super::{parse_params, schema_of, Tool, ToolContext, ToolOutput};
use crate::error::ToolError;
use crate::memory::SharedMemory;

const MAX_OUTPUT_LEN: usize = 10_000;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecParams {
    /// The shell command to execute
    pub command: String,
    /// Optional working directory for the command
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Shell command execution with a wall-clock timeout and safety guards.
pub struct ExecTool {
    timeout: Duration,
    working_dir: PathBuf,
    deny_patterns: Vec<Regex>,
    restrict_to_workspace: bool,
    posix_path_re: Option<Regex>,
    memory: Option<SharedMemory>,
}

impl ExecTool {
    pub fn new(working_dir: PathBuf, timeout_secs: u64, restrict_to_workspace: bool) -> Self {
        let deny_patterns: Vec<Regex> = [
            r"\brm\s+-[rf]{1,2}\b",
            r"\b(format|mkfs|diskpart)\b",
            r"\bdd\s+if=",
            r">\s*/dev/sd",
            r"\b(shutdown|reboot|poweroff)\b",
            r":\(\)\s*\{.*\};\s*:",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            timeout: Duration::from_secs(timeout_secs),
            working_dir,
            deny_patterns,
            restrict_to_workspace,
            posix_path_re: Regex::new(r#"(?:^|[\s|>])(/[^\s"'>]+)"#).ok(),
            memory: None,
        }
    }

    pub fn with_memory(mut self, memory: SharedMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    fn guard_command(&self, command: &str, cwd: &Path) -> Option<String> {
        let lower = command.to_lowercase();
        if self.deny_patterns.iter().any(|re| re.is_match(&lower)) {
            return Some("Command blocked by safety guard (dangerous pattern detected)".into());
        }

        if self.restrict_to_workspace {
            if command.contains("../") || command.contains("..\\") {
                return Some("Command blocked by safety guard (path traversal detected)".into());
            }

            let cwd_resolved = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
            if let Some(re) = &self.posix_path_re {
                for cap in re.captures_iter(command) {
                    let Some(m) = cap.get(1) else { continue };
                    let p = Path::new(m.as_str());
                    let resolved = p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
                    if !resolved.starts_with(&cwd_resolved) {
                        return Some(
                            "Command blocked by safety guard (path outside working dir)".into(),
                        );
                    }
                }
            }
        }

        None
    }

    async fn record(&self, command: &str, exit_code: Option<i32>, failure: Option<&str>) {
        if let Some(memory) = &self.memory {
            let mut m = memory.lock().await;
            m.record_command(command, exit_code);
            if let Some(msg) = failure {
                m.record_error(msg);
            }
        }
    }
}

fn truncate_output(text: String) -> String {
    if text.len() <= MAX_OUTPUT_LEN {
        return text;
    }
    let mut end = MAX_OUTPUT_LEN;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n... (truncated, {} more chars)",
        &text[..end],
        text.len() - end
    )
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. A non-zero exit code is reported as a failure."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ExecParams>()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: ExecParams = parse_params(self.name(), params)?;
        let cwd = p
            .working_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_dir.clone());

        if let Some(reason) = self.guard_command(&p.command, &cwd) {
            return Err(ToolError::Execution(reason));
        }

        debug!("exec [{}]: {}", ctx.caller, p.command);
        let result = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&p.command)
                .current_dir(&cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::execution(format!("Error executing command: {e}")));
            }
            Err(_) => {
                let msg = format!(
                    "Command timed out after {} seconds",
                    self.timeout.as_secs()
                );
                self.record(&p.command, None, Some(&msg)).await;
                return Err(ToolError::Execution(msg));
            }
        };

        let mut parts = Vec::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            parts.push(format!("STDERR:\n{stderr}"));
        }
        let code = output.status.code();

        if !output.status.success() {
            parts.push(format!("Exit code: {}", code.unwrap_or(-1)));
            let text = truncate_output(parts.join("\n"));
            let summary = format!("`{}` exited with {}", p.command, code.unwrap_or(-1));
            self.record(&p.command, code, Some(&summary)).await;
            return Err(ToolError::Execution(text));
        }

        self.record(&p.command, code, None).await;
        let text = if parts.is_empty() {
            "(no output)".to_string()
        } else {
            parts.join("\n")
        };
        Ok(ToolOutput::ok(truncate_output(text)).with_metadata(json!({ "exitCode": code })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use cairn_config::MemoryConfig;

    fn make_tool(dir: &Path, restrict: bool) -> ExecTool {
        ExecTool::new(dir.to_path_buf(), 10, restrict)
    }

    fn ctx() -> ToolContext {
        ToolContext::default()
    }

    #[test]
    fn test_guard_allows_safe_commands() {
        let dir = tempfile::tempdir().unwrap();
        let tool = make_tool(dir.path(), false);
        assert!(tool.guard_command("echo hello", dir.path()).is_none());
        assert!(tool.guard_command("cat /etc/hostname", dir.path()).is_none());
    }

    #[test]
    fn test_guard_blocks_dangerous_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let tool = make_tool(dir.path(), false);
        for cmd in [
            "rm -rf /",
            "rm -f important.db",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
            ":() { :|:& }; :",
        ] {
            let reason = tool.guard_command(cmd, dir.path());
            assert!(reason.unwrap().contains("blocked"), "{cmd}");
        }
    }

    #[test]
    fn test_guard_restricted_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let tool = make_tool(dir.path(), true);
        let reason = tool.guard_command("cat ../../../etc/passwd", dir.path());
        assert!(reason.unwrap().contains("path traversal"));
        let reason = tool.guard_command("cat /etc/passwd", dir.path());
        assert!(reason.unwrap().contains("outside working dir"));

        let unrestricted = make_tool(dir.path(), false);
        assert!(unrestricted.guard_command("cat ../x", dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_exec_records_command() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryStore::new(MemoryConfig::default()).shared();
        let tool = make_tool(dir.path(), false).with_memory(memory.clone());

        let out = tool
            .execute(json!({"command": "echo hello"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out.to_message().trim(), "hello");
        assert_eq!(out.metadata.unwrap()["exitCode"], 0);

        let m = memory.lock().await;
        let history = &m.working_state().command_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_exec_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let tool = make_tool(dir.path(), false);
        let out = tool
            .execute(json!({"command": "echo err >&2"}), &ctx())
            .await
            .unwrap();
        assert!(out.to_message().contains("STDERR:\nerr"));
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryStore::new(MemoryConfig::default()).shared();
        let tool = make_tool(dir.path(), false).with_memory(memory.clone());
        let err = tool
            .execute(json!({"command": "echo partial; exit 42"}), &ctx())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("partial"));
        assert!(msg.contains("Exit code: 42"));
        assert_eq!(memory.lock().await.unresolved_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_exec_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = make_tool(dir.path(), false);
        let out = tool.execute(json!({"command": "true"}), &ctx()).await.unwrap();
        assert_eq!(out.to_message(), "(no output)");
    }

    #[tokio::test]
    async fn test_exec_timeout_is_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf(), 1, false);
        let err = tool
            .execute(json!({"command": "sleep 10"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out after 1 seconds"));
    }

    #[test]
    fn test_truncate_output_respects_char_boundary() {
        let text = "é".repeat(MAX_OUTPUT_LEN);
        let out = truncate_output(text);
        assert!(out.contains("truncated"));
    }
}
