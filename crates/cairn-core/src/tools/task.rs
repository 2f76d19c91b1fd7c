use std::collections::HashSet;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::memory::{
    Complexity, MemoryStore, NewTask, SharedMemory, Task, TaskPriority, TaskStatus, TaskUpdate,
};
use crate::scheduler::{get_next_tasks, NextTaskOptions};
use crate::tools::{parse_params, schema_of, Tool, ToolContext, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Add,
    Update,
    Breakdown,
    List,
    Next,
    SetCurrent,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SubtaskSpec {
    pub description: String,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskParams {
    /// The action to perform
    pub action: TaskAction,
    /// Task description (required for 'add')
    #[serde(default)]
    pub description: Option<String>,
    /// Task id (required for 'update', 'breakdown' and 'set_current')
    #[serde(default)]
    pub task_id: Option<String>,
    /// Parent task id (for 'add')
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Ids of tasks that must complete first (for 'add' or 'update')
    #[serde(default)]
    pub depends_on: Option<Vec<String>>,
    /// active, blocked, waiting, completed or abandoned (for 'add', 'update', or to filter 'list')
    #[serde(default)]
    pub status: Option<String>,
    /// critical, high, medium or low
    #[serde(default)]
    pub priority: Option<String>,
    /// Estimated complexity: simple, moderate or complex
    #[serde(default)]
    pub complexity: Option<String>,
    /// Complexity observed once the work is done (for 'update')
    #[serde(default)]
    pub actual_complexity: Option<String>,
    /// What the task is waiting on (for 'update' with status 'blocked')
    #[serde(default)]
    pub blocked_by: Option<String>,
    /// Summary of the outcome (for 'update' with status 'completed')
    #[serde(default)]
    pub completion_message: Option<String>,
    #[serde(default)]
    pub related_files: Option<Vec<String>>,
    /// Child tasks to create (for 'breakdown')
    #[serde(default)]
    pub subtasks: Option<Vec<SubtaskSpec>>,
    /// Maximum number of tasks to return with include_parallel (for 'next', default 1)
    #[serde(default)]
    pub max_tasks: Option<usize>,
    /// Return mutually independent tasks that can run in parallel (for 'next')
    #[serde(default)]
    pub include_parallel: Option<bool>,
}

fn missing(field: &str, action: &str) -> ToolError {
    ToolError::InvalidParams {
        tool: "task".into(),
        errors: vec![format!("{field}: required for '{action}'")],
    }
}

fn invalid(field: &str, value: &str) -> ToolError {
    ToolError::InvalidParams {
        tool: "task".into(),
        errors: vec![format!("{field}: unrecognised value '{value}'")],
    }
}

fn parse_status(s: &str) -> Result<TaskStatus, ToolError> {
    TaskStatus::parse(s).ok_or_else(|| invalid("status", s))
}

fn parse_priority(s: &str) -> Result<TaskPriority, ToolError> {
    TaskPriority::parse(s).ok_or_else(|| invalid("priority", s))
}

fn parse_complexity(field: &str, s: &str) -> Result<Complexity, ToolError> {
    Complexity::parse(s).ok_or_else(|| invalid(field, s))
}

fn task_line(task: &Task) -> String {
    let mut line = format!(
        "[{}] ({}) {}",
        task.id,
        task.status.as_str(),
        task.description
    );
    if !task.depends_on.is_empty() {
        line.push_str(&format!("  deps: {}", task.depends_on.join(", ")));
    }
    if let Some(b) = &task.blocked_by {
        line.push_str(&format!("  blocked by: {b}"));
    }
    line
}

fn render_tree(
    store: &MemoryStore,
    task: &Task,
    depth: usize,
    seen: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    if !seen.insert(task.id.clone()) {
        return;
    }
    out.push(format!("{}{}", "  ".repeat(depth), task_line(task)));
    for child in store.children_of(&task.id) {
        render_tree(store, child, depth + 1, seen, out);
    }
}

/// Session task graph operations, including ready-task selection.
pub struct TaskTool {
    memory: SharedMemory,
}

impl TaskTool {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }

    async fn handle_add(&self, p: TaskParams) -> Result<ToolOutput, ToolError> {
        let description = p.description.ok_or_else(|| missing("description", "add"))?;
        let mut new = NewTask::new(description);
        new.parent_id = p.parent_id;
        new.depends_on = p.depends_on.unwrap_or_default();
        new.related_files = p.related_files.unwrap_or_default();
        if let Some(s) = p.status.as_deref() {
            new.status = Some(parse_status(s)?);
        }
        if let Some(s) = p.priority.as_deref() {
            new.priority = parse_priority(s)?;
        }
        if let Some(s) = p.complexity.as_deref() {
            new.estimated_complexity = Some(parse_complexity("complexity", s)?);
        }

        let mut m = self.memory.lock().await;
        if let Some(pid) = new.parent_id.as_deref() {
            if m.get_task(pid).is_none() {
                return Err(ToolError::execution(format!("Parent task not found: {pid}")));
            }
        }
        let task = m.add_task(new);
        Ok(ToolOutput::ok(format!("Added task {}", task_line(&task)))
            .with_metadata(json!({ "taskId": task.id })))
    }

    async fn handle_update(&self, p: TaskParams) -> Result<ToolOutput, ToolError> {
        let id = p.task_id.ok_or_else(|| missing("task_id", "update"))?;
        let update = TaskUpdate {
            status: p.status.as_deref().map(parse_status).transpose()?,
            description: p.description,
            priority: p.priority.as_deref().map(parse_priority).transpose()?,
            depends_on: p.depends_on,
            estimated_complexity: p
                .complexity
                .as_deref()
                .map(|s| parse_complexity("complexity", s))
                .transpose()?,
            actual_complexity: p
                .actual_complexity
                .as_deref()
                .map(|s| parse_complexity("actual_complexity", s))
                .transpose()?,
            blocked_by: p.blocked_by,
            completion_message: p.completion_message,
            related_files: p.related_files,
        };
        let mut m = self.memory.lock().await;
        match m.update_task(&id, update) {
            Some(task) => Ok(ToolOutput::ok(format!("Updated task {}", task_line(&task)))),
            None => Err(ToolError::execution(format!("Task not found: {id}"))),
        }
    }

    async fn handle_breakdown(&self, p: TaskParams) -> Result<ToolOutput, ToolError> {
        let id = p.task_id.ok_or_else(|| missing("task_id", "breakdown"))?;
        let specs = p.subtasks.unwrap_or_default();
        if specs.is_empty() {
            return Err(missing("subtasks", "breakdown"));
        }
        let mut children = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut new = NewTask::new(spec.description);
            new.depends_on = spec.depends_on.unwrap_or_default();
            if let Some(c) = spec.complexity.as_deref() {
                new.estimated_complexity = Some(parse_complexity("complexity", c)?);
            }
            children.push(new);
        }

        let mut m = self.memory.lock().await;
        let created = m
            .break_down_task(&id, children)
            .ok_or_else(|| ToolError::execution(format!("Task not found: {id}")))?;
        let lines: Vec<String> = created.iter().map(|t| format!("  {}", task_line(t))).collect();
        let ids: Vec<&str> = created.iter().map(|t| t.id.as_str()).collect();
        Ok(ToolOutput::ok(format!(
            "Broke {id} into {} subtasks:\n{}",
            created.len(),
            lines.join("\n")
        ))
        .with_metadata(json!({ "taskIds": ids })))
    }

    async fn handle_list(&self, p: TaskParams) -> Result<ToolOutput, ToolError> {
        let filter = p.status.as_deref().map(parse_status).transpose()?;
        let m = self.memory.lock().await;
        if m.tasks().is_empty() {
            return Ok(ToolOutput::ok("No tasks."));
        }

        let mut out = Vec::new();
        if let Some(status) = filter {
            out.extend(
                m.tasks()
                    .iter()
                    .filter(|t| t.status == status)
                    .map(task_line),
            );
        } else {
            let mut seen = HashSet::new();
            let roots: Vec<&Task> = m
                .tasks()
                .iter()
                .filter(|t| {
                    t.parent_id
                        .as_deref()
                        .map_or(true, |pid| m.get_task(pid).is_none())
                })
                .collect();
            for root in roots {
                render_tree(&m, root, 0, &mut seen, &mut out);
            }
        }
        if out.is_empty() {
            return Ok(ToolOutput::ok("No matching tasks."));
        }
        Ok(ToolOutput::ok(out.join("\n")))
    }

    async fn handle_next(&self, p: TaskParams) -> Result<ToolOutput, ToolError> {
        let defaults = NextTaskOptions::default();
        let opts = NextTaskOptions {
            max_tasks: p.max_tasks.unwrap_or(defaults.max_tasks),
            include_parallel: p.include_parallel.unwrap_or(defaults.include_parallel),
        };
        let m = self.memory.lock().await;
        let result = get_next_tasks(m.tasks(), opts);
        let text = serde_json::to_string_pretty(&result)
            .map_err(|e| ToolError::execution(format!("failed to render tasks: {e}")))?;
        Ok(ToolOutput::ok(text))
    }

    async fn handle_set_current(&self, p: TaskParams) -> Result<ToolOutput, ToolError> {
        let id = p.task_id.ok_or_else(|| missing("task_id", "set_current"))?;
        let mut m = self.memory.lock().await;
        if !m.set_current_task(Some(&id)) {
            return Err(ToolError::execution(format!("Task not found: {id}")));
        }
        let waiting = m
            .get_task(&id)
            .is_some_and(|t| t.status == TaskStatus::Waiting);
        if waiting {
            m.update_task(&id, TaskUpdate::status(TaskStatus::Active));
        }
        Ok(ToolOutput::ok(format!("Current task set to {id}")))
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Manage the session task graph. Actions: add, update (status, complexity, completion), \
         breakdown (split a task into subtasks), list, next (pick ready work; set \
         include_parallel to get independent tasks for subagents), set_current."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<TaskParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: TaskParams = parse_params(self.name(), params)?;
        match p.action {
            TaskAction::Add => self.handle_add(p).await,
            TaskAction::Update => self.handle_update(p).await,
            TaskAction::Breakdown => self.handle_breakdown(p).await,
            TaskAction::List => self.handle_list(p).await,
            TaskAction::Next => self.handle_next(p).await,
            TaskAction::SetCurrent => self.handle_set_current(p).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_config::MemoryConfig;

    fn setup() -> (TaskTool, SharedMemory) {
        let memory = MemoryStore::new(MemoryConfig::default()).shared();
        (TaskTool::new(memory.clone()), memory)
    }

    async fn run(tool: &TaskTool, params: Value) -> Result<ToolOutput, ToolError> {
        tool.execute(params, &ToolContext::default()).await
    }

    fn task_id(out: &ToolOutput) -> String {
        out.metadata.as_ref().unwrap()["taskId"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_add_and_list_tree() {
        let (tool, _) = setup();
        let root = run(&tool, json!({"action": "add", "description": "ship parser", "status": "active"}))
            .await
            .unwrap();
        let root_id = task_id(&root);
        run(
            &tool,
            json!({"action": "add", "description": "lexer", "parent_id": root_id, "complexity": "complex"}),
        )
        .await
        .unwrap();

        let out = run(&tool, json!({"action": "list"})).await.unwrap();
        let text = out.to_message();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("(active) ship parser"));
        assert!(lines[1].starts_with("  ["));
        assert!(lines[1].contains("lexer"));
    }

    #[tokio::test]
    async fn test_add_requires_description() {
        let (tool, _) = setup();
        let err = run(&tool, json!({"action": "add"})).await.unwrap_err();
        assert!(err.to_string().contains("description: required for 'add'"));
    }

    #[tokio::test]
    async fn test_add_rejects_unknown_parent_and_bad_enum() {
        let (tool, _) = setup();
        let err = run(&tool, json!({"action": "add", "description": "x", "parent_id": "task-nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Parent task not found"));

        let err = run(&tool, json!({"action": "add", "description": "x", "priority": "urgent"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn test_breakdown_then_next_parallel() {
        let (tool, memory) = setup();
        let root = task_id(
            &run(&tool, json!({"action": "add", "description": "root", "status": "active"}))
                .await
                .unwrap(),
        );
        let out = run(
            &tool,
            json!({"action": "breakdown", "task_id": root, "subtasks": [
                {"description": "a", "complexity": "simple"},
                {"description": "b", "complexity": "complex"}
            ]}),
        )
        .await
        .unwrap();
        assert!(out.to_message().contains("into 2 subtasks"));

        let out = run(
            &tool,
            json!({"action": "next", "max_tasks": 2, "include_parallel": true}),
        )
        .await
        .unwrap();
        let parsed: Value = serde_json::from_str(&out.to_message()).unwrap();
        let ready = parsed["ready_tasks"].as_array().unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0]["description"], "b");
        assert!(!memory.lock().await.get_task(&root).unwrap().is_dependency_leaf);
    }

    #[tokio::test]
    async fn test_update_unknown_task_fails() {
        let (tool, _) = setup();
        let err = run(&tool, json!({"action": "update", "task_id": "task-x", "status": "completed"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Task not found: task-x");
    }

    #[tokio::test]
    async fn test_complete_via_update_and_next_reports_done() {
        let (tool, _) = setup();
        let id = task_id(&run(&tool, json!({"action": "add", "description": "only"})).await.unwrap());
        run(
            &tool,
            json!({"action": "update", "task_id": id, "status": "done", "completion_message": "ok"}),
        )
        .await
        .unwrap();
        let out = run(&tool, json!({"action": "next"})).await.unwrap();
        let parsed: Value = serde_json::from_str(&out.to_message()).unwrap();
        assert_eq!(parsed["message"], "All tasks are complete.");
    }

    #[tokio::test]
    async fn test_set_current_activates_waiting_task() {
        let (tool, memory) = setup();
        let id = task_id(&run(&tool, json!({"action": "add", "description": "w"})).await.unwrap());
        run(&tool, json!({"action": "set_current", "task_id": id}))
            .await
            .unwrap();
        let m = memory.lock().await;
        assert_eq!(m.active_task().unwrap().id, id);
        assert_eq!(m.get_task(&id).unwrap().status, TaskStatus::Active);
    }

    #[test]
    fn test_schema_exposes_action_enum() {
        let schema = schema_of::<TaskParams>();
        let actions = schema["properties"]["action"]["enum"].as_array().unwrap();
        assert!(actions.contains(&json!("set_current")));
        assert_eq!(schema["required"], json!(["action"]));
    }
}
