use tracing::debug;

use crate::agent::context::ContextBuilder;
use crate::llm::{ChatMessage, Role};
use crate::memory::SharedMemory;

/// Flat per-message overhead added to the character estimate.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Rough token estimate: four characters per token plus a small overhead.
pub fn estimate_tokens(msg: &ChatMessage) -> usize {
    let mut chars = msg.content.len();
    for call in &msg.tool_calls {
        chars += call.name.len() + call.arguments.to_string().len();
    }
    chars.div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
}

/// Message history and token budget for one agent thread.
///
/// The system prompt is not stored in the history; it is rendered on every
/// request so that it reflects the current state of the wrapped memory.
pub struct ConversationManager {
    memory: SharedMemory,
    context: ContextBuilder,
    history: Vec<ChatMessage>,
    token_budget: usize,
}

impl ConversationManager {
    pub fn new(memory: SharedMemory, context: ContextBuilder, token_budget: usize) -> Self {
        Self {
            memory,
            context,
            history: Vec::new(),
            token_budget,
        }
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn context(&self) -> &ContextBuilder {
        &self.context
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    pub fn push(&mut self, msg: ChatMessage) {
        self.history.push(msg);
    }

    pub fn push_user(&mut self, text: &str) {
        self.history.push(ChatMessage::user(text));
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Content of the last assistant message, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }

    /// The system prompt followed by as much recent history as fits the budget.
    pub async fn build_messages(&self) -> Vec<ChatMessage> {
        let summary = self.memory.lock().await.summary();
        let system = ChatMessage::system(self.context.build_system_prompt(&summary));
        let remaining = self.token_budget.saturating_sub(estimate_tokens(&system));

        let start = self.window_start(remaining);
        if start > 0 {
            debug!(
                "Trimmed {start} of {} history messages to fit {} tokens",
                self.history.len(),
                self.token_budget
            );
        }

        let mut messages = Vec::with_capacity(self.history.len() - start + 1);
        messages.push(system);
        messages.extend_from_slice(&self.history[start..]);
        messages
    }

    /// Index of the first history message to send.
    ///
    /// The window always begins at a user message so that tool results are never
    /// separated from the assistant turn that requested them, and the latest user
    /// turn is kept even when it alone exceeds the budget.
    fn window_start(&self, budget: usize) -> usize {
        let Some(last_user) = self.history.iter().rposition(|m| m.role == Role::User) else {
            return 0;
        };

        let mut used = 0;
        let mut fit_from = self.history.len();
        for (i, msg) in self.history.iter().enumerate().rev() {
            used += estimate_tokens(msg);
            if used > budget {
                break;
            }
            fit_from = i;
        }

        self.history
            .iter()
            .enumerate()
            .skip(fit_from)
            .find(|(_, m)| m.role == Role::User)
            .map_or(last_user, |(i, _)| i)
    }
}
