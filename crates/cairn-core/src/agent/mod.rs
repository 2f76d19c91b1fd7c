pub mod brief;
pub mod context;
pub mod conversation;
pub mod r#loop;
pub mod subagent;

pub use brief::{BriefOptions, MemoryBrief};
pub use context::ContextBuilder;
pub use conversation::ConversationManager;
pub use r#loop::{AgenticLoop, LoopEvent, LoopOutcome, LoopStatus};
pub use subagent::{
    LoopRunner, QueueStatus, SpawnRequest, SubAgentEvent, SubAgentManager, SubAgentResult,
    SubAgentRunner, SubAgentStatus,
};
