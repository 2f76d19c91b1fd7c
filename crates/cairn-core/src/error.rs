use thiserror::Error;

/// Failure talking to the model provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("malformed stream: {0}")]
    Stream(String),
}

/// Failure of one tool invocation. Always fed back to the model as a failed result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool '{0}' is not permitted in this context")]
    NotPermitted(String),
    #[error("invalid parameters for tool '{tool}': {}", errors.join("; "))]
    InvalidParams { tool: String, errors: Vec<String> },
    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    pub fn execution(msg: impl Into<String>) -> Self {
        ToolError::Execution(msg.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubAgentError {
    #[error("subagent not found: {0}")]
    NotFound(String),
}

/// Failure that ends an agent loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
}
