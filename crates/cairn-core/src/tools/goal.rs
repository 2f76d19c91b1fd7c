use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::memory::{GoalStatus, SharedMemory};
use crate::tools::{parse_params, schema_of, Tool, ToolContext, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GoalAction {
    Set,
    Complete,
    Show,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GoalParams {
    pub action: GoalAction,
    /// Goal description (required for 'set')
    #[serde(default)]
    pub description: Option<String>,
    /// Parent goal id; omit for a top-level goal (for 'set')
    #[serde(default)]
    pub parent_goal_id: Option<String>,
    /// Goal to complete; defaults to the current goal (for 'complete')
    #[serde(default)]
    pub goal_id: Option<String>,
}

/// Hierarchical session goals.
pub struct GoalTool {
    memory: SharedMemory,
}

impl GoalTool {
    pub fn new(memory: SharedMemory) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for GoalTool {
    fn name(&self) -> &str {
        "goal"
    }

    fn description(&self) -> &str {
        "Track what the session is trying to achieve. 'set' starts a goal (replacing the active \
         goal at the same level), 'complete' closes one, 'show' prints the goal path."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<GoalParams>()
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let p: GoalParams = parse_params(self.name(), params)?;
        let mut m = self.memory.lock().await;
        match p.action {
            GoalAction::Set => {
                let description = p.description.ok_or_else(|| ToolError::InvalidParams {
                    tool: "goal".into(),
                    errors: vec!["description: required for 'set'".into()],
                })?;
                if let Some(pid) = p.parent_goal_id.as_deref() {
                    if !m.goals().iter().any(|g| g.id == pid) {
                        return Err(ToolError::execution(format!("Goal not found: {pid}")));
                    }
                }
                let goal = m.set_goal(&description, p.parent_goal_id.as_deref());
                Ok(ToolOutput::ok(format!(
                    "Goal set [{}] (depth {}): {}",
                    goal.id, goal.depth, goal.description
                ))
                .with_metadata(json!({ "goalId": goal.id })))
            }
            GoalAction::Complete => {
                let id = match p.goal_id {
                    Some(id) => id,
                    None => m
                        .current_goal()
                        .map(|g| g.id.clone())
                        .ok_or_else(|| ToolError::execution("No active goal to complete"))?,
                };
                if !m.complete_goal(&id) {
                    return Err(ToolError::execution(format!("Goal not found: {id}")));
                }
                Ok(ToolOutput::ok(format!("Goal {id} completed")))
            }
            GoalAction::Show => {
                let path = m.goal_path();
                if path.is_empty() {
                    let done = m
                        .goals()
                        .iter()
                        .filter(|g| g.status == GoalStatus::Completed)
                        .count();
                    return Ok(ToolOutput::ok(format!(
                        "No active goal ({done} completed)."
                    )));
                }
                let lines: Vec<String> = path
                    .iter()
                    .map(|g| format!("{}[{}] {}", "  ".repeat(g.depth as usize), g.id, g.description))
                    .collect();
                Ok(ToolOutput::ok(lines.join("\n")))
            }
        }
    }
}
