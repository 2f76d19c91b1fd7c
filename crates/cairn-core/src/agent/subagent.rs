use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::agent::brief::MemoryBrief;
use crate::agent::context::ContextBuilder;
use crate::agent::conversation::ConversationManager;
use crate::agent::r#loop::{AgenticLoop, LoopEvent, LoopStatus};
use crate::error::SubAgentError;
use crate::llm::LlmClient;
use crate::memory::MemoryStore;
use crate::tools::ToolRegistry;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    NotFound,
    Queued,
    Running,
    Completed,
    Failed,
}

impl SubAgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentStatus::NotFound => "not_found",
            SubAgentStatus::Queued => "queued",
            SubAgentStatus::Running => "running",
            SubAgentStatus::Completed => "completed",
            SubAgentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubAgentStatus::Completed | SubAgentStatus::Failed)
    }
}

/// What a subagent should do and what it knows about the parent session.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub name: String,
    pub task: String,
    /// Replaces the default worker preamble.
    pub system_prompt: Option<String>,
    pub max_iterations: Option<usize>,
    /// Parent task this agent works on, for bookkeeping.
    pub task_id: Option<String>,
    pub brief: MemoryBrief,
}

impl SpawnRequest {
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_brief(mut self, brief: MemoryBrief) -> Self {
        self.brief = brief;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iterations: usize,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

impl SubAgentResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            iterations: 0,
            tools_used: Vec::new(),
        }
    }
}

/// One subagent as tracked by the pool. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentRecord {
    pub id: String,
    pub name: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: SubAgentStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SubAgentResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStatus {
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentEventKind {
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
}

/// Progress message published to every subscriber of the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentEvent {
    pub agent_id: String,
    pub kind: SubAgentEventKind,
    pub payload: Value,
}

/// Runs one subagent to completion.
///
/// Loop events sent on `progress` are republished as `Progress` events.
#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    async fn run(
        &self,
        agent_id: &str,
        request: &SpawnRequest,
        progress: mpsc::UnboundedSender<LoopEvent>,
    ) -> SubAgentResult;
}

/// Default runner: an isolated `AgenticLoop` seeded with the request's brief.
pub struct LoopRunner {
    client: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    workspace: PathBuf,
    memory_config: cairn_config::MemoryConfig,
    token_budget: usize,
    default_max_iterations: usize,
    stream: bool,
}

impl LoopRunner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        workspace: &Path,
        config: &cairn_config::Config,
    ) -> Self {
        Self {
            client,
            tools,
            workspace: workspace.to_path_buf(),
            memory_config: config.memory.clone(),
            token_budget: config.agents.defaults.context_window_tokens,
            default_max_iterations: config.subagents.max_iterations,
            stream: config.agents.defaults.stream,
        }
    }

    fn worker_prompt(&self) -> String {
        format!(
            "You are a focused background worker agent (subagent). \
             Your workspace is: {}\n\n\
             IMPORTANT RULES:\n\
             - Stay focused ONLY on your assigned task\n\
             - Do NOT start conversations or ask questions\n\
             - Do NOT work on anything besides your task\n\
             - Be concise but thorough in your work\n\
             - When done, provide a clear summary of what you accomplished",
            self.workspace.display()
        )
    }
}

#[async_trait]
impl SubAgentRunner for LoopRunner {
    async fn run(
        &self,
        agent_id: &str,
        request: &SpawnRequest,
        progress: mpsc::UnboundedSender<LoopEvent>,
    ) -> SubAgentResult {
        let base = match &request.system_prompt {
            Some(prompt) => format!(
                "{prompt}\n\nYou are working as a background agent on a specific task.\n\
                 Your workspace is: {}\n\
                 When done, provide a clear summary of what you accomplished.",
                self.workspace.display()
            ),
            None => self.worker_prompt(),
        };
        let context =
            ContextBuilder::with_preamble(&self.workspace, request.brief.to_system_prompt(&base));
        // The subagent gets its own store; the parent is only visible through the brief.
        let memory = MemoryStore::new(self.memory_config.clone()).shared();
        let conversation = ConversationManager::new(memory, context, self.token_budget);

        let max = request.max_iterations.unwrap_or(self.default_max_iterations);
        let mut agent = AgenticLoop::new(self.client.clone(), self.tools.clone(), conversation)
            .with_max_iterations(Some(max))
            .with_streaming(self.stream)
            .with_caller(agent_id)
            .with_events(progress);

        match agent.process_user_message(&request.task).await {
            Ok(outcome) => {
                let failed = outcome.status == LoopStatus::ToolFailures;
                SubAgentResult {
                    success: !failed,
                    error: failed.then(|| outcome.response.clone()),
                    output: outcome.response,
                    iterations: outcome.iterations,
                    tools_used: outcome.tools_used,
                }
            }
            Err(e) => SubAgentResult::failed(e.to_string()),
        }
    }
}

#[derive(Default)]
struct PoolState {
    records: HashMap<String, SubAgentRecord>,
    /// Spawn order, for listings.
    order: Vec<String>,
    queue: VecDeque<String>,
    /// Requests waiting for a free slot.
    pending: HashMap<String, SpawnRequest>,
    running: usize,
    done: HashMap<String, watch::Sender<bool>>,
}

impl PoolState {
    /// Mark `id` running and hand back its request.
    fn admit(&mut self, id: &str) -> Option<SpawnRequest> {
        let request = self.pending.remove(id)?;
        if let Some(record) = self.records.get_mut(id) {
            record.status = SubAgentStatus::Running;
        }
        self.running += 1;
        Some(request)
    }
}

struct Inner {
    state: Mutex<PoolState>,
    runner: Arc<dyn SubAgentRunner>,
    max_concurrent: usize,
    events: broadcast::Sender<SubAgentEvent>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, agent_id: &str, kind: SubAgentEventKind, payload: Value) {
        // No subscribers is fine.
        let _ = self.events.send(SubAgentEvent {
            agent_id: agent_id.to_string(),
            kind,
            payload,
        });
    }
}

/// Bounded pool of concurrently running subagents with a FIFO admission queue.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct SubAgentManager {
    inner: Arc<Inner>,
}

impl SubAgentManager {
    pub fn new(runner: Arc<dyn SubAgentRunner>, max_concurrent: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PoolState::default()),
                runner,
                max_concurrent: max_concurrent.max(1),
                events,
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Receive progress events for every agent spawned after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SubAgentEvent> {
        self.inner.events.subscribe()
    }

    /// Register a new subagent and return its id immediately. The agent starts
    /// now if a slot is free, otherwise it waits in the queue.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, request: SpawnRequest) -> String {
        let id = format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let name = if request.name.is_empty() {
            id.clone()
        } else {
            request.name.clone()
        };

        let start = {
            let mut state = self.inner.lock();
            state.records.insert(
                id.clone(),
                SubAgentRecord {
                    id: id.clone(),
                    name: name.clone(),
                    task: request.task.clone(),
                    system_prompt: request.system_prompt.clone(),
                    max_iterations: request.max_iterations,
                    task_id: request.task_id.clone(),
                    status: SubAgentStatus::Queued,
                    start_time: Utc::now(),
                    end_time: None,
                    result: None,
                },
            );
            state.order.push(id.clone());
            let (tx, _) = watch::channel(false);
            state.done.insert(id.clone(), tx);
            state.pending.insert(id.clone(), request);

            if state.running < self.inner.max_concurrent && state.queue.is_empty() {
                state.admit(&id)
            } else {
                state.queue.push_back(id.clone());
                None
            }
        };

        match start {
            Some(request) => {
                info!("Spawning subagent {id} ({name})");
                Self::launch(self.inner.clone(), id.clone(), request);
            }
            None => {
                info!("Subagent {id} ({name}) queued, pool is full");
                self.inner
                    .publish(&id, SubAgentEventKind::Queued, json!({ "name": name }));
            }
        }
        id
    }

    fn launch(inner: Arc<Inner>, id: String, request: SpawnRequest) {
        inner.publish(
            &id,
            SubAgentEventKind::Started,
            json!({ "name": request.name, "task": request.task }),
        );

        tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<LoopEvent>();
            let forward_inner = inner.clone();
            let forward_id = id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = progress_rx.recv().await {
                    let payload = serde_json::to_value(&event).unwrap_or(Value::Null);
                    forward_inner.publish(&forward_id, SubAgentEventKind::Progress, payload);
                }
            });

            // Run in its own task so a panicking runner only fails this agent.
            let runner = inner.runner.clone();
            let run_id = id.clone();
            let handle =
                tokio::spawn(async move { runner.run(&run_id, &request, progress_tx).await });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Subagent {id} aborted: {e}");
                    SubAgentResult::failed(format!("subagent task aborted: {e}"))
                }
            };
            let _ = forwarder.await;

            if let Some((next_id, next_request)) = Self::finish(&inner, &id, result) {
                info!("Promoting queued subagent {next_id}");
                Self::launch(inner, next_id, next_request);
            }
        });
    }

    /// Record the terminal result and promote the next queued agent under one lock.
    fn finish(
        inner: &Inner,
        id: &str,
        result: SubAgentResult,
    ) -> Option<(String, SpawnRequest)> {
        let kind = if result.success {
            SubAgentEventKind::Completed
        } else {
            SubAgentEventKind::Failed
        };
        let payload = json!({
            "success": result.success,
            "iterations": result.iterations,
            "error": result.error,
        });

        let next = {
            let mut state = inner.lock();
            if let Some(record) = state.records.get_mut(id) {
                record.status = if result.success {
                    SubAgentStatus::Completed
                } else {
                    SubAgentStatus::Failed
                };
                record.end_time = Some(Utc::now());
                record.result = Some(result);
            }
            state.running = state.running.saturating_sub(1);

            let mut next = None;
            while let Some(candidate) = state.queue.pop_front() {
                if let Some(request) = state.admit(&candidate) {
                    next = Some((candidate, request));
                    break;
                }
            }

            // Publish before waking waiters so they observe the terminal event.
            inner.publish(id, kind, payload);
            if let Some(tx) = state.done.get(id) {
                tx.send_replace(true);
            }
            next
        };

        debug!("Subagent {id} finished");
        next
    }

    /// Wait for one agent to reach a terminal state.
    pub async fn wait(&self, agent_id: &str) -> Result<SubAgentResult, SubAgentError> {
        let mut rx = {
            let state = self.inner.lock();
            let record = state
                .records
                .get(agent_id)
                .ok_or_else(|| SubAgentError::NotFound(agent_id.to_string()))?;
            if let Some(result) = &record.result {
                return Ok(result.clone());
            }
            state
                .done
                .get(agent_id)
                .map(|tx| tx.subscribe())
                .ok_or_else(|| SubAgentError::NotFound(agent_id.to_string()))?
        };

        if rx.wait_for(|done| *done).await.is_err() {
            warn!("Completion channel for {agent_id} closed early");
        }
        Ok(self
            .get_result(agent_id)
            .unwrap_or_else(|| SubAgentResult::failed("subagent ended without a result")))
    }

    /// Wait for every listed agent. Fails up front if any id is unknown.
    pub async fn wait_all(
        &self,
        agent_ids: &[String],
    ) -> Result<HashMap<String, SubAgentResult>, SubAgentError> {
        {
            let state = self.inner.lock();
            if let Some(unknown) = agent_ids.iter().find(|id| !state.records.contains_key(*id)) {
                return Err(SubAgentError::NotFound(unknown.clone()));
            }
        }
        let results = join_all(agent_ids.iter().map(|id| self.wait(id))).await;
        agent_ids
            .iter()
            .cloned()
            .zip(results)
            .map(|(id, r)| r.map(|result| (id, result)))
            .collect()
    }

    pub fn get_status(&self, agent_id: &str) -> SubAgentStatus {
        self.inner
            .lock()
            .records
            .get(agent_id)
            .map_or(SubAgentStatus::NotFound, |r| r.status)
    }

    pub fn get_result(&self, agent_id: &str) -> Option<SubAgentResult> {
        self.inner
            .lock()
            .records
            .get(agent_id)
            .and_then(|r| r.result.clone())
    }

    pub fn get_record(&self, agent_id: &str) -> Option<SubAgentRecord> {
        self.inner.lock().records.get(agent_id).cloned()
    }

    /// Queued and running agents, in spawn order.
    pub fn list_active(&self) -> Vec<SubAgentRecord> {
        self.list_where(|s| !s.is_terminal())
    }

    /// Completed and failed agents, in spawn order.
    pub fn list_completed(&self) -> Vec<SubAgentRecord> {
        self.list_where(|s| s.is_terminal())
    }

    fn list_where(&self, keep: impl Fn(SubAgentStatus) -> bool) -> Vec<SubAgentRecord> {
        let state = self.inner.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| keep(r.status))
            .cloned()
            .collect()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let state = self.inner.lock();
        let mut status = QueueStatus {
            running: state.running,
            queued: state.queue.len(),
            ..Default::default()
        };
        for record in state.records.values() {
            match record.status {
                SubAgentStatus::Completed => status.completed += 1,
                SubAgentStatus::Failed => status.failed += 1,
                _ => {}
            }
        }
        status
    }
}
