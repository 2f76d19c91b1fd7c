use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::agent::brief::{BriefOptions, MemoryBrief};
use crate::agent::subagent::{SpawnRequest, SubAgentManager, SubAgentResult, SubAgentStatus};
use crate::error::ToolError;
use crate::memory::{SharedMemory, TaskStatus, TaskUpdate};
use crate::tools::{parse_params, schema_of, Tool, ToolContext, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpawnParams {
    /// Short label for the subagent, e.g. 'fix-tests'
    pub name: String,
    /// Complete, self-contained description of the work
    pub task: String,
    /// Replaces the default worker instructions
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Iteration ceiling for the subagent
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Task from the task graph this agent works on; its context is included in the brief
    #[serde(default)]
    pub task_id: Option<String>,
    /// Files the subagent should look at first
    #[serde(default)]
    pub files: Vec<String>,
    /// Block until the subagent finishes and return its result (default false)
    #[serde(default)]
    pub wait: bool,
}

fn render_result(id: &str, result: &SubAgentResult) -> String {
    let mut text = if result.success {
        format!("[{id}] completed in {} iteration(s)\n{}", result.iterations, result.output)
    } else {
        format!(
            "[{id}] failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        )
    };
    if !result.tools_used.is_empty() {
        text.push_str(&format!("\nTools used: {}", result.tools_used.join(", ")));
    }
    text
}

/// Start a subagent seeded with a brief of the current session.
pub struct SpawnAgentTool {
    manager: SubAgentManager,
    memory: SharedMemory,
}

impl SpawnAgentTool {
    pub fn new(manager: SubAgentManager, memory: SharedMemory) -> Self {
        Self { manager, memory }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to work on a bounded task concurrently. It gets file and shell tools \
         plus a brief of the session (goal, preferences, task context) and returns an agent id. \
         Collect the result later with wait_agent, or pass wait=true to block."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SpawnParams>()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: SpawnParams = parse_params(self.name(), params)?;

        let brief = {
            let mut m = self.memory.lock().await;
            if let Some(task_id) = p.task_id.as_deref() {
                let waiting = match m.get_task(task_id) {
                    Some(task) => task.status == TaskStatus::Waiting,
                    None => return Err(ToolError::execution(format!("Task not found: {task_id}"))),
                };
                if waiting {
                    m.update_task(task_id, TaskUpdate::status(TaskStatus::Active));
                }
            }
            MemoryBrief::from_store(
                &m,
                &BriefOptions {
                    task_id: p.task_id.clone(),
                    files: p.files.clone(),
                    ..Default::default()
                },
            )
        };

        let request = SpawnRequest {
            name: p.name.clone(),
            task: p.task,
            system_prompt: p.system_prompt,
            max_iterations: p.max_iterations,
            task_id: p.task_id,
            brief,
        };
        let id = self.manager.spawn(request);
        info!("[{}] spawned subagent {id} ({})", ctx.caller, p.name);

        if !p.wait {
            let status = self.manager.get_status(&id);
            return Ok(ToolOutput::ok(format!(
                "Subagent '{}' spawned (ID: {id}, {}). Use wait_agent to collect its result.",
                p.name,
                status.as_str()
            ))
            .with_metadata(json!({ "agentId": id })));
        }

        let result = self
            .manager
            .wait(&id)
            .await
            .map_err(|e| ToolError::execution(e.to_string()))?;
        let output = ToolOutput {
            success: result.success,
            output: result.success.then(|| render_result(&id, &result)),
            error: (!result.success).then(|| render_result(&id, &result)),
            metadata: Some(json!({ "agentId": id })),
        };
        Ok(output)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WaitParams {
    /// One agent to wait for
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Several agents to wait for
    #[serde(default)]
    pub agent_ids: Vec<String>,
}

/// Block until one or more subagents finish and return their results.
pub struct WaitAgentTool {
    manager: SubAgentManager,
}

impl WaitAgentTool {
    pub fn new(manager: SubAgentManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for WaitAgentTool {
    fn name(&self) -> &str {
        "wait_agent"
    }

    fn description(&self) -> &str {
        "Wait for subagents to finish and return their results. Give agent_id for one agent \
         or agent_ids for several; results come back in the order given."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WaitParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: WaitParams = parse_params(self.name(), params)?;
        let mut ids = p.agent_ids;
        if let Some(id) = p.agent_id {
            if !ids.contains(&id) {
                ids.insert(0, id);
            }
        }
        if ids.is_empty() {
            return Err(ToolError::InvalidParams {
                tool: "wait_agent".into(),
                errors: vec!["agent_id or agent_ids is required".into()],
            });
        }

        let results = self
            .manager
            .wait_all(&ids)
            .await
            .map_err(|e| ToolError::execution(e.to_string()))?;

        let sections: Vec<String> = ids
            .iter()
            .filter_map(|id| results.get(id).map(|r| render_result(id, r)))
            .collect();
        let failed = results.values().filter(|r| !r.success).count();
        let summary: Value = ids
            .iter()
            .filter_map(|id| results.get(id).map(|r| (id.clone(), json!(r.success))))
            .collect::<serde_json::Map<_, _>>()
            .into();
        Ok(ToolOutput::ok(sections.join("\n\n"))
            .with_metadata(json!({ "success": summary, "failed": failed })))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StatusParams {
    /// Agent to inspect; omit for the whole pool
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Report the status of one subagent or of the whole pool.
pub struct AgentStatusTool {
    manager: SubAgentManager,
}

impl AgentStatusTool {
    pub fn new(manager: SubAgentManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for AgentStatusTool {
    fn name(&self) -> &str {
        "agent_status"
    }

    fn description(&self) -> &str {
        "Show the status of a subagent (queued, running, completed, failed) or, without an id, \
         the pool's running and queued agents."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<StatusParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: StatusParams = parse_params(self.name(), params)?;

        if let Some(id) = p.agent_id {
            let status = self.manager.get_status(&id);
            if status == SubAgentStatus::NotFound {
                return Err(ToolError::execution(format!("subagent not found: {id}")));
            }
            let mut text = format!("[{id}] {}", status.as_str());
            if let Some(result) = self.manager.get_result(&id) {
                text.push('\n');
                text.push_str(&render_result(&id, &result));
            }
            return Ok(ToolOutput::ok(text).with_metadata(json!({ "status": status })));
        }

        let queue = self.manager.get_queue_status();
        let mut lines = vec![format!(
            "Pool: {} running, {} queued, {} completed, {} failed (max {})",
            queue.running,
            queue.queued,
            queue.completed,
            queue.failed,
            self.manager.max_concurrent()
        )];
        for record in self.manager.list_active() {
            lines.push(format!(
                "- [{}] {} ({}): {}",
                record.id,
                record.name,
                record.status.as_str(),
                record.task
            ));
        }
        Ok(ToolOutput::ok(lines.join("\n")).with_metadata(json!(queue)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::agent::r#loop::LoopEvent;
    use crate::agent::subagent::SubAgentRunner;
    use crate::memory::{MemoryStore, NewTask};
    use cairn_config::MemoryConfig;

    /// Echoes the brief back so tests can see what the subagent was told.
    struct BriefEcho;

    #[async_trait]
    impl SubAgentRunner for BriefEcho {
        async fn run(
            &self,
            _agent_id: &str,
            request: &SpawnRequest,
            _progress: mpsc::UnboundedSender<LoopEvent>,
        ) -> SubAgentResult {
            SubAgentResult {
                success: request.task != "fail",
                output: request.brief.to_system_prompt(&request.task),
                error: (request.task == "fail").then(|| "could not".to_string()),
                iterations: 2,
                tools_used: vec!["exec".into()],
            }
        }
    }

    fn setup() -> (SubAgentManager, SharedMemory) {
        let manager = SubAgentManager::new(Arc::new(BriefEcho), 2);
        let memory = MemoryStore::new(MemoryConfig::default()).shared();
        (manager, memory)
    }

    #[tokio::test]
    async fn test_spawn_and_wait_returns_brief_output() {
        let (manager, memory) = setup();
        let task_id = memory.lock().await.add_task(NewTask::new("write lexer")).id;
        let spawn = SpawnAgentTool::new(manager.clone(), memory.clone());

        let out = spawn
            .execute(
                json!({"name": "lexer", "task": "do it", "task_id": task_id, "wait": true}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(out.success);
        let text = out.to_message();
        assert!(text.contains("completed in 2 iteration(s)"));
        assert!(text.contains("write lexer"));
        assert!(text.contains("Tools used: exec"));

        let status = memory.lock().await.get_task(&task_id).unwrap().status;
        assert_eq!(status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn test_background_spawn_then_wait_agent() {
        let (manager, memory) = setup();
        let spawn = SpawnAgentTool::new(manager.clone(), memory);
        let wait = WaitAgentTool::new(manager.clone());

        let mut ids = Vec::new();
        for (name, task) in [("ok", "work"), ("bad", "fail")] {
            let out = spawn
                .execute(json!({"name": name, "task": task}), &ToolContext::default())
                .await
                .unwrap();
            ids.push(out.metadata.unwrap()["agentId"].as_str().unwrap().to_string());
        }

        let out = wait
            .execute(json!({"agent_ids": ids}), &ToolContext::default())
            .await
            .unwrap();
        let text = out.to_message();
        assert!(text.find("completed").unwrap() < text.find("failed: could not").unwrap());
        assert_eq!(out.metadata.unwrap()["failed"], 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_tool_failures() {
        let (manager, memory) = setup();
        let wait = WaitAgentTool::new(manager.clone());
        let err = wait
            .execute(json!({"agent_id": "agent-nope"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "subagent not found: agent-nope");

        let status = AgentStatusTool::new(manager.clone());
        assert!(status
            .execute(json!({"agent_id": "agent-nope"}), &ToolContext::default())
            .await
            .is_err());

        let spawn = SpawnAgentTool::new(manager, memory);
        let err = spawn
            .execute(
                json!({"name": "x", "task": "y", "task_id": "task-missing"}),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Task not found: task-missing");
    }

    #[tokio::test]
    async fn test_pool_status_lists_counts() {
        let (manager, memory) = setup();
        let spawn = SpawnAgentTool::new(manager.clone(), memory);
        spawn
            .execute(json!({"name": "a", "task": "work", "wait": true}), &ToolContext::default())
            .await
            .unwrap();
        let out = AgentStatusTool::new(manager)
            .execute(json!({}), &ToolContext::default())
            .await
            .unwrap();
        assert!(out.to_message().starts_with("Pool: 0 running, 0 queued, 1 completed, 0 failed (max 2)"));
    }
}
