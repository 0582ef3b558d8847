//! 认知层：推理器、上下文、防循环守卫与 Agent 主循环

pub mod context;
pub mod guard;
pub mod loop_;
pub mod reasoner;

pub use context::{AgentContext, Observation};
pub use loop_::{AgentDeps, AgentLoop, AgentOutcome, AgentSettings};
pub use reasoner::{parse_proposal, LlmReasoner, Proposal, Reasoner, ToolCall};
