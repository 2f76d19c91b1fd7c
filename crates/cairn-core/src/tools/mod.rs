pub mod filesystem;
pub mod goal;
pub mod remember;
pub mod shell;
pub mod spawn;
pub mod task;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::llm::ToolSchema;
use crate::memory::SharedMemory;

use crate::agent::subagent::SubAgentManager;

use filesystem::{EditFileTool, FsScope, ListDirTool, ReadFileTool, WriteFileTool};
use goal::GoalTool;
use remember::RememberTool;
use shell::ExecTool;
use spawn::{AgentStatusTool, SpawnAgentTool, WaitAgentTool};
use task::TaskTool;

/// Name of the pseudo-tool the loop expands into a concurrent batch.
pub const PARALLEL_TOOL: &str = "parallel";

/// Result of one tool invocation as seen by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Text placed in the tool-result message.
    pub fn to_message(&self) -> String {
        if self.success {
            self.output.clone().unwrap_or_default()
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("tool failed"))
        }
    }
}

impl From<ToolError> for ToolOutput {
    fn from(err: ToolError) -> Self {
        ToolOutput::failure(err.to_string())
    }
}

/// Per-call context handed to every tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// `main` for the top-level loop, otherwise the subagent id.
    pub caller: String,
    pub call_id: String,
}

impl ToolContext {
    pub fn new(caller: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            call_id: call_id.into(),
        }
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new("main", "")
    }
}

/// Trait for tools callable by the agent loop.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// JSON schema for a parameter struct, with subschemas inlined.
pub fn schema_of<T: JsonSchema>() -> Value {
    let root = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    let mut value = serde_json::to_value(root).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.remove("definitions");
        obj.entry("type")
            .or_insert_with(|| Value::String("object".into()));
    }
    value
}

/// Deserialize validated parameters into the tool's typed struct.
pub fn parse_params<T: DeserializeOwned>(tool: &str, params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParams {
        tool: tool.to_string(),
        errors: vec![e.to_string()],
    })
}

/// Registry of available tools plus the allowlist deciding which are offered.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    /// `None` permits every registered tool; `Some(empty)` permits none.
    allowlist: Option<HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowlist(mut self, allowlist: Option<Vec<String>>) -> Self {
        self.allowlist = allowlist.map(|names| names.into_iter().collect());
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn is_permitted(&self, name: &str) -> bool {
        match &self.allowlist {
            None => true,
            Some(allowed) => allowed.contains(name),
        }
    }

    /// Names of registered tools that pass the allowlist.
    pub fn permitted_names(&self) -> Vec<&str> {
        self.tools
            .keys()
            .map(|k| k.as_str())
            .filter(|n| self.is_permitted(n))
            .collect()
    }

    /// Schemas of the permitted tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .values()
            .filter(|t| self.is_permitted(t.name()))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Look up, permission-check and validate before running the tool.
    pub async fn try_execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        if !self.is_permitted(name) {
            return Err(ToolError::NotPermitted(name.to_string()));
        }
        let errors = validate_params(&params, &tool.parameters_schema());
        if !errors.is_empty() {
            return Err(ToolError::InvalidParams {
                tool: name.to_string(),
                errors,
            });
        }
        tool.execute(params, ctx).await
    }

    /// Like `try_execute`, with every error folded into a failed `ToolOutput`.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        self.try_execute(name, params, ctx)
            .await
            .unwrap_or_else(ToolOutput::from)
    }
}

/// Register the file and shell tools rooted at `workspace`.
///
/// With `memory`, file accesses, edits and commands are recorded into that
/// store's working state. Subagent registries are built without it.
pub fn register_workspace_tools(
    registry: &mut ToolRegistry,
    workspace: &Path,
    config: &cairn_config::ToolsConfig,
    memory: Option<SharedMemory>,
) {
    let allowed_dir = config
        .restrict_to_workspace
        .then(|| workspace.to_path_buf());
    let mut scope = FsScope::new(Some(workspace.to_path_buf()), allowed_dir);
    let mut exec = ExecTool::new(
        workspace.to_path_buf(),
        config.exec.timeout_secs,
        config.restrict_to_workspace,
    );
    if let Some(memory) = memory {
        scope = scope.with_memory(memory.clone());
        exec = exec.with_memory(memory);
    }
    registry.register(ReadFileTool::new(scope.clone()));
    registry.register(WriteFileTool::new(scope.clone()));
    registry.register(EditFileTool::new(scope.clone()));
    registry.register(ListDirTool::new(scope));
    registry.register(exec);
}

/// Register the task, goal, remember and subagent tools for a top-level session.
pub fn register_session_tools(
    registry: &mut ToolRegistry,
    memory: SharedMemory,
    subagents: SubAgentManager,
) {
    registry.register(TaskTool::new(memory.clone()));
    registry.register(GoalTool::new(memory.clone()));
    registry.register(RememberTool::new(memory.clone()));
    registry.register(SpawnAgentTool::new(subagents.clone(), memory));
    registry.register(WaitAgentTool::new(subagents.clone()));
    registry.register(AgentStatusTool::new(subagents));
}

/// Validate tool parameters against a JSON schema.
/// Returns a list of validation error strings (empty if valid).
fn validate_params(params: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_value(params, schema, "", &mut errors);
    errors
}

fn type_matches(val: &Value, expected: &str) -> bool {
    match expected {
        "object" => val.is_object(),
        "array" => val.is_array(),
        "string" => val.is_string(),
        "integer" => val.is_i64() || val.is_u64(),
        "number" => val.is_number(),
        "boolean" => val.is_boolean(),
        "null" => val.is_null(),
        _ => true,
    }
}

fn validate_value(val: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let display_path = if path.is_empty() { "root" } else { path };

    // Either a single type name or a list such as ["string", "null"].
    match schema.get("type") {
        Some(Value::String(expected)) => {
            if !type_matches(val, expected) {
                errors.push(format!("{display_path}: expected type '{expected}'"));
                return;
            }
        }
        Some(Value::Array(options)) => {
            let names: Vec<&str> = options.iter().filter_map(|t| t.as_str()).collect();
            if !names.iter().any(|t| type_matches(val, t)) {
                errors.push(format!(
                    "{display_path}: expected one of types {}",
                    names.join(", ")
                ));
                return;
            }
        }
        _ => {}
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(val) {
            errors.push(format!("{display_path}: value not in allowed enum"));
        }
    }

    if let Some(n) = val.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                errors.push(format!("{display_path}: value {n} < minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                errors.push(format!("{display_path}: value {n} > maximum {max}"));
            }
        }
    }

    if let Some(s) = val.as_str() {
        if let Some(min_len) = schema.get("minLength").and_then(|m| m.as_u64()) {
            if (s.len() as u64) < min_len {
                errors.push(format!(
                    "{display_path}: string length {} < minLength {min_len}",
                    s.len()
                ));
            }
        }
        if let Some(max_len) = schema.get("maxLength").and_then(|m| m.as_u64()) {
            if (s.len() as u64) > max_len {
                errors.push(format!(
                    "{display_path}: string length {} > maxLength {max_len}",
                    s.len()
                ));
            }
        }
    }

    if let Some(obj) = val.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for req in required {
                if let Some(field) = req.as_str() {
                    if !obj.contains_key(field) {
                        let field_path = if path.is_empty() {
                            field.to_string()
                        } else {
                            format!("{path}.{field}")
                        };
                        errors.push(format!("{field_path}: required field missing"));
                    }
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop_schema) in props {
                if let Some(prop_val) = obj.get(key) {
                    let prop_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    validate_value(prop_val, prop_schema, &prop_path, errors);
                }
            }
        }
    }

    if let Some(arr) = val.as_array() {
        if let Some(items_schema) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{display_path}[{i}]");
                validate_value(item, items_schema, &item_path, errors);
            }
        }
    }
}
