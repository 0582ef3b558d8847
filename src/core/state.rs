//! Agent 循环阶段
//!
//! Initializing → Thinking → Acting → Thinking → … → {Completing | Failed | Cancelled}

use serde::Serialize;

use crate::core::TaskStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AgentPhase {
    Initializing,
    Thinking,
    Acting,
    Completing,
    Failed,
    Cancelled,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completing | Self::Failed | Self::Cancelled)
    }

    /// 终态阶段对应的 Task 状态
    pub fn task_status(self) -> Option<TaskStatus> {
        match self {
            Self::Completing => Some(TaskStatus::Completed),
            Self::Failed => Some(TaskStatus::Failed),
            Self::Cancelled => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}
