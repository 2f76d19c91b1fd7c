//! Provider-neutral chat interface consumed by the agent loop.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: &str, name: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            name: Some(name.to_string()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    ToolCalls,
    Length,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub finish_reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            finish_reason: FinishReason::ToolCalls,
            ..Default::default()
        }
    }

    /// Blank finalization: no text and no tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Fragment of a tool call within a stream. Fragments sharing `index` belong to one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LlmError>> + Send>>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, LlmError>;

    /// Streaming variant. The default issues one `chat` call and replays it as deltas.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<DeltaStream, LlmError> {
        let response = self.chat(messages, tools).await?;
        Ok(Box::pin(futures::stream::iter(
            response_to_deltas(response).into_iter().map(Ok),
        )))
    }

    /// Model identifier for logs and traces.
    fn model_name(&self) -> &str {
        "unknown"
    }
}

fn response_to_deltas(response: ChatResponse) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    if !response.content.is_empty() {
        deltas.push(StreamDelta {
            content: Some(response.content),
            ..Default::default()
        });
    }
    for (index, call) in response.tool_calls.into_iter().enumerate() {
        deltas.push(StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments: Some(call.arguments.to_string()),
            }],
            ..Default::default()
        });
    }
    deltas.push(StreamDelta {
        finish_reason: Some(response.finish_reason),
        ..Default::default()
    });
    deltas
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulate a delta stream into the shape of a non-streaming response.
pub async fn collect_stream(mut stream: DeltaStream) -> Result<ChatResponse, LlmError> {
    let mut content = String::new();
    let mut calls: BTreeMap<usize, PartialCall> = BTreeMap::new();
    let mut finish_reason = None;

    while let Some(delta) = stream.next().await {
        let delta = delta?;
        if let Some(text) = delta.content {
            content.push_str(&text);
        }
        for fragment in delta.tool_calls {
            let entry = calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                entry.id = id;
            }
            if let Some(name) = fragment.name {
                entry.name.push_str(&name);
            }
            if let Some(args) = fragment.arguments {
                entry.arguments.push_str(&args);
            }
        }
        if delta.finish_reason.is_some() {
            finish_reason = delta.finish_reason;
        }
    }

    let mut tool_calls = Vec::with_capacity(calls.len());
    for (index, call) in calls {
        if call.name.is_empty() {
            return Err(LlmError::Stream(format!("tool call {index} has no name")));
        }
        let arguments = if call.arguments.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.arguments).map_err(|e| {
                LlmError::Stream(format!("tool call '{}' arguments: {e}", call.name))
            })?
        };
        let id = if call.id.is_empty() {
            format!("call_{index}")
        } else {
            call.id
        };
        tool_calls.push(ToolCall {
            id,
            name: call.name,
            arguments,
        });
    }

    let finish_reason = finish_reason.unwrap_or(if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolCalls
    });

    Ok(ChatResponse {
        content,
        tool_calls,
        finish_reason,
        usage: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(ChatResponse);

    #[async_trait]
    impl LlmClient for Fixed {
        async fn chat(&self, _: &[ChatMessage], _: &[ToolSchema]) -> Result<ChatResponse, LlmError> {
            Ok(self.0.clone())
        }
    }

    fn stream_of(deltas: Vec<StreamDelta>) -> DeltaStream {
        Box::pin(futures::stream::iter(deltas.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn test_collect_merges_fragments_by_index() {
        let deltas = vec![
            StreamDelta {
                content: Some("Looking ".into()),
                ..Default::default()
            },
            StreamDelta {
                content: Some("now.".into()),
                tool_calls: vec![ToolCallDelta {
                    index: 1,
                    id: Some("b".into()),
                    name: Some("list_dir".into()),
                    arguments: Some("{\"path\":".into()),
                }],
                ..Default::default()
            },
            StreamDelta {
                tool_calls: vec![
                    ToolCallDelta {
                        index: 0,
                        id: Some("a".into()),
                        name: Some("read_file".into()),
                        arguments: Some("{\"path\":\"x.rs\"}".into()),
                    },
                    ToolCallDelta {
                        index: 1,
                        arguments: Some("\"src\"}".into()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            StreamDelta {
                finish_reason: Some(FinishReason::ToolCalls),
                ..Default::default()
            },
        ];

        let resp = collect_stream(stream_of(deltas)).await.unwrap();
        assert_eq!(resp.content, "Looking now.");
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.len(), 2);
        assert_eq!(resp.tool_calls[0].name, "read_file");
        assert_eq!(resp.tool_calls[1].arguments, json!({"path": "src"}));
    }

    #[tokio::test]
    async fn test_collect_rejects_broken_arguments() {
        let deltas = vec![StreamDelta {
            tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some("a".into()),
                name: Some("exec".into()),
                arguments: Some("{\"command\": ".into()),
            }],
            ..Default::default()
        }];
        let err = collect_stream(stream_of(deltas)).await.unwrap_err();
        assert!(matches!(err, LlmError::Stream(_)));
    }

    #[tokio::test]
    async fn test_default_stream_replays_chat() {
        let original = ChatResponse {
            content: "hi".into(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "goal".into(),
                arguments: json!({"action": "show"}),
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: None,
        };
        let client = Fixed(original.clone());
        let stream = client.chat_stream(&[], &[]).await.unwrap();
        let collected = collect_stream(stream).await.unwrap();
        assert_eq!(collected, original);
    }

    #[test]
    fn test_empty_response_detection() {
        assert!(ChatResponse::text("  ").is_empty());
        assert!(!ChatResponse::text("done").is_empty());
    }
}
