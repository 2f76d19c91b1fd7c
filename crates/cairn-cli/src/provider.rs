//! rig-core backed implementation of the core `LlmClient` interface.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use cairn_config::{Config, ProviderConfig};
use cairn_core::error::LlmError;
use cairn_core::llm::{ChatMessage, ChatResponse, FinishReason, LlmClient, Role, ToolCall, ToolSchema};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::completion::{CompletionModel, CompletionRequest, Message, ToolDefinition};
use rig::message::{AssistantContent, Text, ToolResult, ToolResultContent, UserContent};
use rig::providers::{anthropic, deepseek, ollama, openai, openrouter};
use rig::OneOrMany;

const VALID_PROVIDERS: &str = "anthropic, openai, ollama, openrouter, deepseek";

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(provider_cfg: &Option<ProviderConfig>, env_var: &str) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

fn api_base(provider_cfg: &Option<ProviderConfig>) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_base.clone())
        .filter(|b| !b.is_empty())
}

fn missing_key(provider: &str, field: &str, env_var: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{provider} provider selected but no API key found. \
         Set providers.{field}.apiKey in config.json or {env_var} env var."
    )
}

/// Create a completion model for a specific provider + model combination.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &Config,
) -> Result<CompletionModelHandle<'static>> {
    if provider.is_empty() {
        anyhow::bail!("No provider configured.\nValid providers: {VALID_PROVIDERS}");
    }
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    let providers = &config.providers;
    match provider {
        "anthropic" => {
            let key = resolve_api_key(&providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| missing_key("Anthropic", "anthropic", "ANTHROPIC_API_KEY"))?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }
        "openai" => {
            let key = resolve_api_key(&providers.openai, "OPENAI_API_KEY")
                .ok_or_else(|| missing_key("OpenAI", "openai", "OPENAI_API_KEY"))?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = api_base(&providers.openai) {
                builder = builder.base_url(base);
                info!("Using OpenAI provider with custom base: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(
                client.completion_model(model_name),
            )))
        }
        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = api_base(&providers.ollama) {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(
                client.completion_model(model_name),
            )))
        }
        "openrouter" => {
            let key = resolve_api_key(&providers.openrouter, "OPENROUTER_API_KEY")
                .ok_or_else(|| missing_key("OpenRouter", "openrouter", "OPENROUTER_API_KEY"))?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            info!("Using OpenRouter provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(
                client.completion_model(model_name),
            )))
        }
        "deepseek" => {
            let key = resolve_api_key(&providers.deepseek, "DEEPSEEK_API_KEY")
                .ok_or_else(|| missing_key("DeepSeek", "deepseek", "DEEPSEEK_API_KEY"))?;
            let client: deepseek::Client = deepseek::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create DeepSeek client: {e}"))?;
            info!("Using DeepSeek provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(
                client.completion_model(model_name),
            )))
        }
        other => {
            anyhow::bail!("Unknown provider '{other}'. Valid providers: {VALID_PROVIDERS}");
        }
    }
}

/// A chat client bound to one model tier from `agents.models`.
#[allow(deprecated)]
pub struct RigClient {
    model: CompletionModelHandle<'static>,
    model_name: String,
    temperature: f64,
    max_tokens: u64,
}

#[allow(deprecated)]
impl RigClient {
    /// Build the client for `tier`. Unknown tiers fall back to "default".
    pub fn from_config(config: &Config, tier: &str) -> Result<Self> {
        let models = &config.agents.models;
        if !models.contains_key("default") {
            anyhow::bail!(
                "No models configured. Set agents.models in config.json with at least a \"default\" entry.\n\
                 Example:\n  \
                 \"models\": {{ \"default\": {{ \"provider\": \"ollama\", \"model\": \"llama3\" }} }}"
            );
        }
        let (tier, model_ref) = match models.get(tier) {
            Some(r) => (tier, r),
            None => ("default", &models["default"]),
        };
        let model = create_model_for(&model_ref.provider, &model_ref.model, config)
            .map_err(|e| anyhow::anyhow!("Failed to create model for tier '{tier}': {e}"))?;
        info!("Model tier '{tier}': {} / {}", model_ref.provider, model_ref.model);
        Ok(Self {
            model,
            model_name: model_ref.model.clone(),
            temperature: f64::from(config.agents.defaults.temperature),
            max_tokens: u64::from(config.agents.defaults.max_tokens),
        })
    }
}

fn text(text: impl Into<String>) -> Text {
    Text { text: text.into() }
}

fn user_text(content: impl Into<String>) -> Message {
    Message::User {
        content: OneOrMany::one(UserContent::Text(text(content))),
    }
}

fn rig_tool_call(call: &ToolCall) -> Result<AssistantContent, LlmError> {
    let value = serde_json::json!({
        "id": call.id,
        "function": { "name": call.name, "arguments": call.arguments },
    });
    serde_json::from_value(value)
        .map(AssistantContent::ToolCall)
        .map_err(|e| LlmError::Transport(format!("cannot encode tool call {}: {e}", call.name)))
}

/// Split a provider-neutral transcript into a preamble and rig chat history.
///
/// The leading system message becomes the preamble. Later system messages
/// are passed as user text, and runs of tool results are grouped into one
/// user turn.
fn to_rig_history(messages: &[ChatMessage]) -> Result<(Option<String>, Vec<Message>), LlmError> {
    let mut rest = messages;
    let mut preamble = None;
    if let Some((first, tail)) = messages.split_first() {
        if first.role == Role::System {
            preamble = Some(first.content.clone());
            rest = tail;
        }
    }

    let mut history = Vec::with_capacity(rest.len());
    let mut pending_results: Vec<UserContent> = Vec::new();
    for msg in rest {
        if msg.role != Role::Tool && !pending_results.is_empty() {
            let results = std::mem::take(&mut pending_results);
            if let Ok(content) = OneOrMany::many(results) {
                history.push(Message::User { content });
            }
        }
        match msg.role {
            Role::System => history.push(user_text(format!("[system] {}", msg.content))),
            Role::User => history.push(user_text(msg.content.clone())),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(AssistantContent::Text(text(msg.content.clone())));
                }
                for call in &msg.tool_calls {
                    parts.push(rig_tool_call(call)?);
                }
                let content = OneOrMany::many(parts)
                    .unwrap_or_else(|_| OneOrMany::one(AssistantContent::Text(text(""))));
                history.push(Message::Assistant { id: None, content });
            }
            Role::Tool => pending_results.push(UserContent::ToolResult(ToolResult {
                id: msg.tool_call_id.clone().unwrap_or_default(),
                call_id: None,
                content: OneOrMany::one(ToolResultContent::Text(text(msg.content.clone()))),
            })),
        }
    }
    if let Ok(content) = OneOrMany::many(pending_results) {
        history.push(Message::User { content });
    }
    Ok((preamble, history))
}

#[allow(deprecated)]
#[async_trait]
impl LlmClient for RigClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, LlmError> {
        let (preamble, history) = to_rig_history(messages)?;
        debug!(
            "LLM request [{}]: {} messages, {} tools",
            self.model_name,
            history.len(),
            tools.len()
        );
        let tool_defs = tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();

        let request = CompletionRequest {
            preamble,
            chat_history: OneOrMany::many(history).unwrap_or_else(|_| OneOrMany::one(user_text(""))),
            documents: Vec::new(),
            tools: tool_defs,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            tool_choice: None,
            additional_params: None,
        };

        let response = self
            .model
            .completion(request)
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in response.choice.iter() {
            match part {
                AssistantContent::Text(t) => content.push_str(&t.text),
                AssistantContent::ToolCall(tc) => tool_calls.push(ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                }),
                AssistantContent::Reasoning(r) => {
                    debug!("Model reasoning: {}", r.reasoning.join(" "));
                }
                _ => {}
            }
        }
        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        Ok(ChatResponse {
            content,
            tool_calls,
            finish_reason,
            usage: None,
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
