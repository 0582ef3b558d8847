//! 错误类型与恢复动作
//!
//! 各层各自一个 thiserror 枚举：Store / Tool / Reasoner / Agent / Startup。
//! 与 RecoveryEngine 配合：Agent 循环根据错误决定 Feedback / RetryAfter / Abort。

use std::time::Duration;

use thiserror::Error;

use crate::core::{Fingerprint, TaskId, TaskStatus};

/// Task Store 错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// 插入的任务 id 已存在；已有记录保持不变
    #[error("Task already exists: {0}")]
    AlreadyExists(TaskId),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// 后端不可达或执行失败，可重试
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// 工具执行错误；Clone 以便同一个失败原样分发给所有订阅者
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool {tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("Tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool execution panicked: {0}")]
    Panicked(String),

    #[error("Cancelled")]
    Cancelled,
}

impl ToolError {
    /// 结构化错误类别（写入 Attempt.reason 与上下文反馈）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown-tool",
            Self::InvalidArguments { .. } => "invalid-arguments",
            Self::Timeout { .. } => "timeout",
            Self::Failed { .. } => "failed",
            Self::Panicked(_) => "panicked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::UnknownTool(_) | Self::InvalidArguments { .. })
    }
}

/// 外部推理器错误：Transient 可重试，Permanent 直接终止
#[derive(Error, Debug, Clone)]
pub enum ReasonerError {
    #[error("Transient reasoner failure: {0}")]
    Transient(String),

    #[error("Reasoner rejected request: {0}")]
    Permanent(String),

    /// 回复无法解析为动作，作为反馈写回上下文
    #[error("Malformed reasoner reply: {0}")]
    Malformed(String),
}

/// Agent 循环终止原因
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Reasoner unavailable after {attempts} attempts: {last}")]
    ReasonerUnavailable { attempts: u32, last: String },

    #[error("Reasoner error: {0}")]
    Reasoner(String),

    #[error("Action {fingerprint} repeated {repeats} times without new information")]
    RepeatedActionLimit {
        fingerprint: Fingerprint,
        repeats: usize,
    },

    #[error("Iteration limit ({0}) reached")]
    IterationLimit(u32),

    #[error("Cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AgentError {
    /// 写入 TaskResult.reason 的稳定短语
    pub fn reason(&self) -> String {
        match self {
            Self::ReasonerUnavailable { .. } => "reasoner-unavailable".to_string(),
            Self::Reasoner(msg) => format!("reasoner-error: {msg}"),
            Self::RepeatedActionLimit { .. } => "repeated-action-limit".to_string(),
            Self::IterationLimit(_) => "iteration-limit".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::Store(e) => format!("store-error: {e}"),
        }
    }
}

/// Orchestrator 启动失败
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Task store unreachable: {0}")]
    StoreUnreachable(#[source] StoreError),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Orchestrator 对外操作错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task {0} still has a live worker")]
    TaskBusy(TaskId),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug)]
pub enum RecoveryAction {
    /// 把结构化错误写回上下文，继续下一轮
    Feedback(String),
    /// 等待后重试同一调用
    RetryAfter(Duration),
    /// 终止当前任务
    Abort(AgentError),
}
