//! 错误恢复引擎
//!
//! 根据错误类型返回 RecoveryAction，供 Agent 循环决定是反馈、退避重试还是终止。
//! 推理器瞬时失败按 base、2×base、4×base 退避；重试用尽后以 ReasonerUnavailable 终止。
//! Task Store 后端错误使用同一套退避与上限，其余存储错误直接终止。

use std::time::Duration;

use serde_json::json;

use crate::core::{AgentError, RecoveryAction, ReasonerError, StoreError, ToolError};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    base_backoff: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
        }
    }

    /// 第 `retry` 次重试前的等待时间（从 0 开始）
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << retry.min(16))
    }

    /// `retries_done`：该次思考已经做过的重试次数
    pub fn handle_reasoner(&self, err: &ReasonerError, retries_done: u32) -> RecoveryAction {
        match err {
            ReasonerError::Transient(msg) => {
                if retries_done < self.max_retries {
                    RecoveryAction::RetryAfter(self.backoff(retries_done))
                } else {
                    RecoveryAction::Abort(AgentError::ReasonerUnavailable {
                        attempts: retries_done + 1,
                        last: msg.clone(),
                    })
                }
            }
            ReasonerError::Malformed(raw) => RecoveryAction::Feedback(
                json!({
                    "error": "malformed-proposal",
                    "message": raw,
                    "expected": "{\"tool\": \"name\", \"args\": {...}} or {\"complete\": true}",
                })
                .to_string(),
            ),
            ReasonerError::Permanent(msg) => RecoveryAction::Abort(AgentError::Reasoner(msg.clone())),
        }
    }

    /// 只有 Backend 错误值得重试；NotFound / InvalidTransition 等重试也不会变
    pub fn handle_store(&self, err: StoreError, retries_done: u32) -> RecoveryAction {
        match err {
            StoreError::Backend(_) if retries_done < self.max_retries => {
                RecoveryAction::RetryAfter(self.backoff(retries_done))
            }
            other => RecoveryAction::Abort(AgentError::Store(other)),
        }
    }

    /// 工具错误都是可继续的（写回上下文），只有取消会终止
    pub fn handle_tool(&self, err: &ToolError) -> RecoveryAction {
        match err {
            ToolError::Cancelled => RecoveryAction::Abort(AgentError::Cancelled),
            ToolError::Timeout { tool, secs } => RecoveryAction::Feedback(
                json!({
                    "error": err.kind(),
                    "tool": tool,
                    "message": format!("command did not finish within {secs}s"),
                })
                .to_string(),
            ),
            other => RecoveryAction::Feedback(
                json!({
                    "error": other.kind(),
                    "message": other.to_string(),
                })
                .to_string(),
            ),
        }
    }
}
