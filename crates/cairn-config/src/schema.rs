use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
    pub subagents: SubagentsConfig,
    pub memory: MemoryConfig,
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    /// Named model tiers. Must contain at least a "default" entry.
    /// Example tiers: "default", "subagent".
    pub models: HashMap<String, ModelRef>,
}

/// Reference to a provider + model combination for a named tier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub workspace: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Turn ceiling for the top-level loop. `null` means unbounded.
    pub max_tool_iterations: Option<usize>,
    /// Estimated-token budget for the conversation history sent to the model.
    pub context_window_tokens: usize,
    /// Use the streaming chat endpoint and accumulate deltas.
    pub stream: bool,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.cairn/workspace".into(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: Some(40),
            context_window_tokens: 120_000,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub ollama: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub deepseek: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub restrict_to_workspace: bool,
    pub exec: ExecToolConfig,
    /// Tools offered to the top-level agent. `null` = all, `[]` = none.
    pub allowlist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecToolConfig {
    pub timeout_secs: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentsConfig {
    /// Ceiling on simultaneously running subagents.
    pub max_concurrent: usize,
    /// Default turn ceiling for a subagent when the spawn request sets none.
    pub max_iterations: usize,
    /// Tools offered to subagents. `null` = the full subagent tool set.
    pub allowlist: Option<Vec<String>>,
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_iterations: 15,
            allowlist: None,
        }
    }
}

/// Confidence decay and working-state bounds for the session memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Confidence lost per hour by a preference without reinforcement.
    pub preference_decay_rate: f64,
    pub user_fact_decay_rate: f64,
    pub exploratory_decay_rate: f64,
    pub min_confidence: f64,
    pub reinforcement_boost: f64,
    /// Categories that never decay.
    pub stable_categories: Vec<String>,
    /// Categories decayed at `exploratory_decay_rate`.
    pub exploratory_categories: Vec<String>,
    pub max_active_files: usize,
    pub max_recent_errors: usize,
    pub max_history: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            preference_decay_rate: 0.01,
            user_fact_decay_rate: 0.005,
            exploratory_decay_rate: 0.05,
            min_confidence: 0.1,
            reinforcement_boost: 0.1,
            stable_categories: vec!["identity".into(), "language".into(), "style".into()],
            exploratory_categories: vec!["exploratory".into(), "hypothesis".into()],
            max_active_files: 20,
            max_recent_errors: 10,
            max_history: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceConfig {
    pub enabled: bool,
    /// Explicit trace file. Defaults to `<workspace>/traces/<session>.jsonl`.
    pub path: Option<String>,
}
