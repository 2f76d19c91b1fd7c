pub mod agent;
pub mod error;
pub mod llm;
pub mod memory;
pub mod scheduler;
pub mod tools;
pub mod trace;

// Re-export key types
pub use agent::{AgenticLoop, ConversationManager, SubAgentManager};
pub use error::{AgentError, LlmError, SubAgentError, ToolError};
pub use llm::{ChatMessage, ChatResponse, LlmClient};
pub use memory::{MemoryStore, SharedMemory};
pub use scheduler::{get_next_tasks, NextTaskOptions, NextTasksResult};
pub use tools::ToolRegistry;
