use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::conversation::ConversationManager;
use crate::error::{AgentError, ToolError};
use crate::llm::{collect_stream, ChatMessage, ChatResponse, LlmClient, ToolCall, ToolSchema};
use crate::tools::{parse_params, schema_of, ToolContext, ToolOutput, ToolRegistry, PARALLEL_TOOL};
use crate::trace::{TraceEvent, TraceWriter};

const MAX_CONSECUTIVE_ERRORS: usize = 3;
const PREVIEW_LEN: usize = 200;

const EMPTY_RESPONSE_NOTICE: &str = "The previous assistant turn was an empty response with no \
    tool calls. Continue from the tool results above: make further tool calls if needed, \
    otherwise give the final answer.";

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn preview(s: &str) -> String {
    if s.len() > PREVIEW_LEN {
        let end = floor_char_boundary(s, PREVIEW_LEN);
        format!("{}... ({} chars)", &s[..end], s.len())
    } else {
        s.to_string()
    }
}

/// Progress surfaced by a running loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    AssistantMessage {
        content: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        success: bool,
        output: String,
    },
    Diagnostic {
        message: String,
    },
    Finished {
        status: LoopStatus,
        response: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// The model gave a final answer.
    Completed,
    /// The iteration ceiling was reached; the response is partial.
    IterationLimit,
    /// Every tool call failed for several iterations in a row.
    ToolFailures,
}

impl LoopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStatus::Completed => "completed",
            LoopStatus::IterationLimit => "iteration_limit",
            LoopStatus::ToolFailures => "tool_failures",
        }
    }
}

/// What one `process_user_message` call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    pub response: String,
    /// Turns counted against the iteration ceiling.
    pub iterations: usize,
    /// Every LLM request, the empty-response retry included.
    pub model_turns: usize,
    pub tools_used: Vec<String>,
    pub tool_errors: usize,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ParallelCall {
    /// Name of the tool to run
    pub tool: String,
    /// Parameters for that tool
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ParallelParams {
    /// Independent tool calls to run concurrently; results come back in this order
    pub calls: Vec<ParallelCall>,
}

/// Result of executing one model-issued tool call.
struct CallResult {
    message: String,
    /// At least one underlying tool succeeded.
    any_success: bool,
    failures: usize,
    tools: Vec<String>,
}

/// The LLM <> tool control loop for one agent thread.
pub struct AgenticLoop {
    client: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    conversation: ConversationManager,
    /// `None` runs until the model stops.
    max_iterations: Option<usize>,
    stream: bool,
    caller: String,
    events: Option<mpsc::UnboundedSender<LoopEvent>>,
    trace: Option<Arc<TraceWriter>>,
}

impl AgenticLoop {
    pub fn new(
        client: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        conversation: ConversationManager,
    ) -> Self {
        Self {
            client,
            tools,
            conversation,
            max_iterations: None,
            stream: false,
            caller: "main".to_string(),
            events: None,
            trace: None,
        }
    }

    pub fn with_max_iterations(mut self, max: Option<usize>) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Name passed to tools as `ToolContext::caller`.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_trace(mut self, trace: Arc<TraceWriter>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn conversation(&self) -> &ConversationManager {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut ConversationManager {
        &mut self.conversation
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn trace(&self, event: TraceEvent) {
        if let Some(trace) = &self.trace {
            trace.record(&event);
        }
    }

    fn diagnostic(&self, message: &str) {
        self.trace(TraceEvent::Diagnostic {
            timestamp: Utc::now(),
            message: message.to_string(),
        });
        self.emit(LoopEvent::Diagnostic {
            message: message.to_string(),
        });
    }

    fn max_label(&self) -> String {
        self.max_iterations
            .map_or_else(|| "-".to_string(), |m| m.to_string())
    }

    /// Tool schemas offered to the model, `parallel` included when permitted.
    fn offered_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = self.tools.schemas();
        if !schemas.is_empty() && self.tools.is_permitted(PARALLEL_TOOL) {
            schemas.push(ToolSchema {
                name: PARALLEL_TOOL.to_string(),
                description: "Run several independent tool calls concurrently. Results are \
                              returned in the order given."
                    .to_string(),
                parameters: schema_of::<ParallelParams>(),
            });
        }
        schemas
    }

    async fn request(&self, schemas: &[ToolSchema]) -> Result<ChatResponse, AgentError> {
        let messages = self.conversation.build_messages().await;
        let response = if self.stream {
            let stream = self.client.chat_stream(&messages, schemas).await?;
            collect_stream(stream).await?
        } else {
            self.client.chat(&messages, schemas).await?
        };
        Ok(response)
    }

    /// Drive the conversation from a new user message until the model stops,
    /// the iteration ceiling is hit, or tool calls keep failing.
    pub async fn process_user_message(&mut self, text: &str) -> Result<LoopOutcome, AgentError> {
        self.conversation.push_user(text);
        self.trace(TraceEvent::UserMessage {
            timestamp: Utc::now(),
            content: text.to_string(),
        });

        let schemas = self.offered_schemas();
        let mut iterations = 0usize;
        let mut model_turns = 0usize;
        let mut tools_used = Vec::new();
        let mut tool_errors = 0usize;
        let mut consecutive_errors = 0usize;
        let mut after_tool_calls = false;
        let mut retried_empty = false;

        let (status, response) = loop {
            // A retry re-issues the same turn and does not count as a new iteration.
            let is_retry = after_tool_calls && retried_empty;
            if let Some(max) = self.max_iterations {
                if !is_retry && iterations >= max {
                    warn!("Agent loop reached max iterations ({max}) without final response");
                    let partial = self.conversation.last_assistant_text().map_or_else(
                        || "I've been working on this but reached the maximum number of iterations.".to_string(),
                        |text| format!("{text}\n\n(Stopped after reaching the maximum of {max} iterations.)"),
                    );
                    break (LoopStatus::IterationLimit, partial);
                }
            }

            if !is_retry {
                iterations += 1;
            }
            model_turns += 1;

            debug!(
                "LLM request [{iterations}/{}]: {} history messages, {} tools",
                self.max_label(),
                self.conversation.len(),
                schemas.len()
            );
            let llm_start = std::time::Instant::now();
            let response = match self.request(&schemas).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("LLM request failed: {e}");
                    self.diagnostic(&format!("LLM request failed: {e}"));
                    self.trace(TraceEvent::SessionEnd {
                        timestamp: Utc::now(),
                        iterations,
                        status: "failed".to_string(),
                    });
                    return Err(e);
                }
            };
            let llm_elapsed = llm_start.elapsed();

            self.trace(TraceEvent::ModelResponse {
                timestamp: Utc::now(),
                iteration: iterations,
                content: response.content.clone(),
                tool_calls: response.tool_calls.len(),
            });

            if response.tool_calls.is_empty() {
                if response.is_empty() && after_tool_calls && !retried_empty {
                    warn!("Model returned an empty response after tool calls, retrying once");
                    self.diagnostic("Model returned an empty response after tool calls; retrying the turn");
                    self.conversation.push(ChatMessage::system(EMPTY_RESPONSE_NOTICE));
                    retried_empty = true;
                    continue;
                }

                let mut text = response.content;
                if text.trim().is_empty() {
                    text = "I've completed processing but have no response to give.".into();
                }
                debug!(
                    "LLM response [{iterations}/{}]: text ({} chars) in {:.1}s",
                    self.max_label(),
                    text.len(),
                    llm_elapsed.as_secs_f64()
                );
                self.conversation.push(ChatMessage::assistant(&text));
                self.emit(LoopEvent::AssistantMessage {
                    content: text.clone(),
                });
                break (LoopStatus::Completed, text);
            }

            debug!(
                "LLM response [{iterations}/{}]: {} tool call(s) in {:.1}s",
                self.max_label(),
                response.tool_calls.len(),
                llm_elapsed.as_secs_f64()
            );
            after_tool_calls = true;
            retried_empty = false;

            if !response.content.trim().is_empty() {
                self.emit(LoopEvent::AssistantMessage {
                    content: response.content.clone(),
                });
            }
            self.conversation.push(ChatMessage::assistant_with_tools(
                &response.content,
                response.tool_calls.clone(),
            ));

            // Turns are strictly sequential: every result is appended before the next request.
            let mut iteration_has_success = false;
            let mut last_error = String::new();
            for call in &response.tool_calls {
                info!(
                    "Tool call [{iterations}/{}]: {}({})",
                    self.max_label(),
                    call.name,
                    preview(&call.arguments.to_string())
                );
                self.emit(LoopEvent::ToolCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                self.trace(TraceEvent::ToolCall {
                    timestamp: Utc::now(),
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });

                let result = self.execute_call(call).await;
                debug!("Tool result [{}]: {}", call.name, preview(&result.message));

                tools_used.extend(result.tools.iter().cloned());
                tool_errors += result.failures;
                if result.any_success {
                    iteration_has_success = true;
                } else {
                    last_error.clone_from(&result.message);
                }

                self.emit(LoopEvent::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    success: result.failures == 0,
                    output: result.message.clone(),
                });
                self.trace(TraceEvent::ToolResult {
                    timestamp: Utc::now(),
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    success: result.failures == 0,
                    output: result.message.clone(),
                });
                self.conversation
                    .push(ChatMessage::tool_result(&call.id, &call.name, result.message));
            }

            if iteration_has_success {
                consecutive_errors = 0;
            } else {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    warn!(
                        "Circuit breaker: {consecutive_errors} consecutive iterations with all tool calls failing"
                    );
                    let text = format!(
                        "I'm having trouble using a tool correctly and had to stop retrying. \
                         Last error: {last_error}"
                    );
                    self.conversation.push(ChatMessage::assistant(&text));
                    break (LoopStatus::ToolFailures, text);
                }
            }
        };

        info!(
            "Agent loop finished ({}) after {iterations} iteration(s), {model_turns} model turn(s), {} tool call(s)",
            status.as_str(),
            tools_used.len()
        );
        self.emit(LoopEvent::Finished {
            status,
            response: response.clone(),
        });
        self.trace(TraceEvent::SessionEnd {
            timestamp: Utc::now(),
            iterations,
            status: status.as_str().to_string(),
        });

        Ok(LoopOutcome {
            status,
            response,
            iterations,
            model_turns,
            tools_used,
            tool_errors,
        })
    }

    async fn execute_call(&self, call: &ToolCall) -> CallResult {
        if call.name == PARALLEL_TOOL && self.tools.is_permitted(PARALLEL_TOOL) {
            return self.execute_parallel(call).await;
        }
        let ctx = ToolContext::new(&self.caller, &call.id);
        let output = self
            .tools
            .execute(&call.name, call.arguments.clone(), &ctx)
            .await;
        CallResult {
            any_success: output.success,
            failures: usize::from(!output.success),
            message: output.to_message(),
            tools: vec![call.name.clone()],
        }
    }

    /// Run every member of a `parallel` call concurrently and join the
    /// results back together in call order.
    async fn execute_parallel(&self, call: &ToolCall) -> CallResult {
        let params: ParallelParams = match parse_params(PARALLEL_TOOL, call.arguments.clone()) {
            Ok(p) => p,
            Err(e) => {
                return CallResult {
                    message: ToolOutput::from(e).to_message(),
                    any_success: false,
                    failures: 1,
                    tools: vec![PARALLEL_TOOL.to_string()],
                }
            }
        };
        if params.calls.is_empty() {
            let err = ToolError::InvalidParams {
                tool: PARALLEL_TOOL.to_string(),
                errors: vec!["calls: at least one call is required".into()],
            };
            return CallResult {
                message: ToolOutput::from(err).to_message(),
                any_success: false,
                failures: 1,
                tools: vec![PARALLEL_TOOL.to_string()],
            };
        }

        debug!("Parallel batch of {} call(s)", params.calls.len());
        let futures = params.calls.iter().enumerate().map(|(i, member)| {
            let ctx = ToolContext::new(&self.caller, format!("{}#{}", call.id, i + 1));
            async move {
                if member.tool == PARALLEL_TOOL {
                    return ToolOutput::failure("parallel calls cannot be nested");
                }
                self.tools
                    .execute(&member.tool, member.parameters.clone(), &ctx)
                    .await
            }
        });
        // join_all yields outputs in input order regardless of completion order.
        let outputs = join_all(futures).await;

        let mut sections = Vec::with_capacity(outputs.len());
        let mut failures = 0;
        for (i, (member, output)) in params.calls.iter().zip(&outputs).enumerate() {
            if !output.success {
                failures += 1;
            }
            sections.push(format!("[{}] {}\n{}", i + 1, member.tool, output.to_message()));
        }

        CallResult {
            message: sections.join("\n\n"),
            any_success: failures < outputs.len(),
            failures,
            tools: params.calls.iter().map(|c| c.tool.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::agent::context::ContextBuilder;
    use crate::error::LlmError;
    use crate::llm::{DeltaStream, Role, StreamDelta, ToolCallDelta};
    use crate::memory::MemoryStore;
    use crate::tools::Tool;
    use cairn_config::MemoryConfig;

    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
        offered: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(Ok).collect()),
                requests: Mutex::new(Vec::new()),
                offered: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::from([Err(LlmError::Transport("503".into()))])),
                requests: Mutex::new(Vec::new()),
                offered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolSchema],
        ) -> Result<ChatResponse, LlmError> {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.offered
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.name.clone()).collect());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ChatResponse::text("(script exhausted)")))
        }
    }

    /// Echoes its `text` parameter after `delay_ms`.
    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "delay_ms": {"type": "integer"}
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            let delay = params["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let text = params["text"].as_str().unwrap_or_default();
            if text == "fail" {
                return Err(ToolError::execution("echo failed"));
            }
            Ok(ToolOutput::ok(text))
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    fn build(client: Arc<ScriptedClient>, allowlist: Option<Vec<String>>) -> AgenticLoop {
        let memory = MemoryStore::new(MemoryConfig::default()).shared();
        let context = ContextBuilder::with_preamble(Path::new("."), "test agent".into());
        let conversation = ConversationManager::new(memory, context, 100_000);
        let mut tools = ToolRegistry::new().with_allowlist(allowlist);
        tools.register(EchoTool);
        AgenticLoop::new(client, tools, conversation)
    }

    #[tokio::test]
    async fn test_plain_answer_completes() {
        let client = ScriptedClient::new(vec![ChatResponse::text("hello")]);
        let mut agent = build(client.clone(), None);
        let outcome = agent.process_user_message("hi").await.unwrap();
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.response, "hello");
        assert_eq!(outcome.model_turns, 1);
        assert_eq!(agent.conversation().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_response_after_tool_call_is_retried_once() {
        let client = ScriptedClient::new(vec![
            ChatResponse::with_tool_calls(vec![call("c1", "echo", json!({"text": "a"}))]),
            ChatResponse::text(""),
            ChatResponse::text("final answer"),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut agent = build(client.clone(), None).with_events(tx);

        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.response, "final answer");
        assert_eq!(outcome.model_turns, 3);
        assert_eq!(outcome.iterations, 2);

        let mut diagnostics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LoopEvent::Diagnostic { message } = event {
                diagnostics.push(message);
            }
        }
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].contains("empty response"));

        let third = &client.requests.lock().unwrap()[2];
        let last = third.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.contains("empty response"));
    }

    #[tokio::test]
    async fn test_second_empty_response_is_not_retried() {
        let client = ScriptedClient::new(vec![
            ChatResponse::with_tool_calls(vec![call("c1", "echo", json!({"text": "a"}))]),
            ChatResponse::text(""),
            ChatResponse::text("  "),
            ChatResponse::text("never reached"),
        ]);
        let mut agent = build(client, None);
        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.model_turns, 3);
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert!(outcome.response.contains("no response"));
    }

    #[tokio::test]
    async fn test_tool_error_is_fed_back() {
        let client = ScriptedClient::new(vec![
            ChatResponse::with_tool_calls(vec![call("c1", "echo", json!({"wrong": 1}))]),
            ChatResponse::text("fixed"),
        ]);
        let mut agent = build(client.clone(), None);
        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.tool_errors, 1);
        assert_eq!(outcome.response, "fixed");

        let second = &client.requests.lock().unwrap()[1];
        let tool_msg = second.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("Error: invalid parameters for tool 'echo'"));
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_parallel_results_keep_call_order() {
        let client = ScriptedClient::new(vec![
            ChatResponse::with_tool_calls(vec![call(
                "p1",
                PARALLEL_TOOL,
                json!({"calls": [
                    {"tool": "echo", "parameters": {"text": "slow", "delay_ms": 80}},
                    {"tool": "echo", "parameters": {"text": "fast"}},
                    {"tool": "echo", "parameters": {"text": "fail"}}
                ]}),
            )]),
            ChatResponse::text("done"),
        ]);
        let mut agent = build(client.clone(), None);
        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.tools_used, vec!["echo", "echo", "echo"]);
        assert_eq!(outcome.tool_errors, 1);

        let second = &client.requests.lock().unwrap()[1];
        let tool_msg = second.iter().find(|m| m.role == Role::Tool).unwrap();
        let slow = tool_msg.content.find("slow").unwrap();
        let fast = tool_msg.content.find("fast").unwrap();
        assert!(slow < fast);
        assert!(tool_msg.content.contains("[3] echo\nError: echo failed"));
    }

    #[tokio::test]
    async fn test_iteration_limit_reports_partial() {
        let looping: Vec<ChatResponse> = (0..5)
            .map(|i| ChatResponse {
                content: format!("step {i}"),
                ..ChatResponse::with_tool_calls(vec![call(&format!("c{i}"), "echo", json!({"text": "x"}))])
            })
            .collect();
        let client = ScriptedClient::new(looping);
        let mut agent = build(client, None).with_max_iterations(Some(2));
        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.status, LoopStatus::IterationLimit);
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.response.starts_with("step 1"));
    }

    #[tokio::test]
    async fn test_circuit_breaker_after_repeated_failures() {
        let failing: Vec<ChatResponse> = (0..5)
            .map(|i| ChatResponse::with_tool_calls(vec![call(&format!("c{i}"), "echo", json!({"text": "fail"}))]))
            .collect();
        let client = ScriptedClient::new(failing);
        let mut agent = build(client, None);
        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.status, LoopStatus::ToolFailures);
        assert_eq!(outcome.model_turns, MAX_CONSECUTIVE_ERRORS);
        assert!(outcome.response.contains("echo failed"));
    }

    #[tokio::test]
    async fn test_transport_error_fails_loop() {
        let mut agent = build(ScriptedClient::failing(), None);
        let err = agent.process_user_message("go").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_allowlist_controls_offered_schemas() {
        let client = ScriptedClient::new(vec![ChatResponse::text("a")]);
        let mut agent = build(client.clone(), None);
        agent.process_user_message("go").await.unwrap();
        assert_eq!(client.offered.lock().unwrap()[0], vec!["echo", PARALLEL_TOOL]);

        let client = ScriptedClient::new(vec![ChatResponse::text("a")]);
        let mut agent = build(client.clone(), Some(vec![]));
        agent.process_user_message("go").await.unwrap();
        assert!(client.offered.lock().unwrap()[0].is_empty());

        let client = ScriptedClient::new(vec![ChatResponse::text("a")]);
        let mut agent = build(client.clone(), Some(vec!["echo".into()]));
        agent.process_user_message("go").await.unwrap();
        assert_eq!(client.offered.lock().unwrap()[0], vec!["echo"]);
    }

    struct StreamingClient;

    #[async_trait]
    impl LlmClient for StreamingClient {
        async fn chat(&self, _: &[ChatMessage], _: &[ToolSchema]) -> Result<ChatResponse, LlmError> {
            Err(LlmError::Transport("chat should not be called".into()))
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            _: &[ToolSchema],
        ) -> Result<DeltaStream, LlmError> {
            let answered = messages.iter().any(|m| m.role == Role::Tool);
            let deltas: Vec<Result<StreamDelta, LlmError>> = if answered {
                vec![Ok(StreamDelta {
                    content: Some("streamed".into()),
                    ..Default::default()
                })]
            } else {
                vec![
                    Ok(StreamDelta {
                        tool_calls: vec![ToolCallDelta {
                            index: 0,
                            id: Some("s1".into()),
                            name: Some("echo".into()),
                            arguments: Some("{\"text\":".into()),
                        }],
                        ..Default::default()
                    }),
                    Ok(StreamDelta {
                        tool_calls: vec![ToolCallDelta {
                            index: 0,
                            arguments: Some("\"hi\"}".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                ]
            };
            Ok(Box::pin(futures::stream::iter(deltas)))
        }
    }

    #[tokio::test]
    async fn test_streaming_mode_collects_deltas() {
        let memory = MemoryStore::new(MemoryConfig::default()).shared();
        let context = ContextBuilder::with_preamble(Path::new("."), "test".into());
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let mut agent = AgenticLoop::new(
            Arc::new(StreamingClient),
            tools,
            ConversationManager::new(memory, context, 10_000),
        )
        .with_streaming(true);
        let outcome = agent.process_user_message("go").await.unwrap();
        assert_eq!(outcome.response, "streamed");
        assert_eq!(outcome.tools_used, vec!["echo"]);
        assert_eq!(outcome.tool_errors, 0);
    }
}
