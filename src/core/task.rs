//! 任务与尝试记录：Task / Attempt / 状态机
//!
//! Task 状态只能单向前进（Pending → Running → 终态），唯一例外是运维触发的重试（Running → Pending）。
//! 非空的 assigned_worker 只允许出现在 Running 状态。
//! Attempt 只追加、不修改，既是审计记录，也是 Agent 防循环的依据。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Fingerprint, StoreError};

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(raw).map(Self)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 工作者身份（一个 Orchestrator 进程一个）
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 生成带前缀的唯一身份，如 `orchestrator-3f2a…`
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 等待认领
    Pending,
    /// 已被某个工作者认领并运行中
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// 正向迁移规则；Running → Pending 只能走 `Task::reset_for_retry`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务指令：目标、作用对象与约束（对核心不透明）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub goal: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub constraints: serde_json::Value,
}

impl Directive {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            target: None,
            constraints: serde_json::Value::Null,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_constraints(mut self, constraints: serde_json::Value) -> Self {
        self.constraints = constraints;
        self
    }
}

/// 任务结果（终态时写入）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub summary: Option<String>,
    /// 失败 / 取消原因，如 `repeated-action-limit`、`shutdown-timeout`
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub iterations: u32,
}

impl TaskResult {
    pub fn completed(summary: Option<String>, iterations: u32) -> Self {
        Self {
            summary,
            reason: None,
            iterations,
        }
    }

    pub fn failed(reason: impl Into<String>, iterations: u32) -> Self {
        Self {
            summary: None,
            reason: Some(reason.into()),
            iterations,
        }
    }

    pub fn cancelled(reason: impl Into<String>, iterations: u32) -> Self {
        Self::failed(reason, iterations)
    }
}

/// 工作单元；parent_id 构成子任务树，scan_id 指向树根
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub scan_id: TaskId,
    pub status: TaskStatus,
    pub directive: Directive,
    pub assigned_worker: Option<WorkerId>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 新建根任务（一次 scan），scan_id 即自身 id
    pub fn root(directive: Directive) -> Self {
        let id = TaskId::new();
        let now = Utc::now();
        Self {
            id,
            parent_id: None,
            scan_id: id,
            status: TaskStatus::Pending,
            directive,
            assigned_worker: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 新建子任务，继承父任务的 scan_id
    pub fn child_of(parent: &Task, directive: Directive) -> Self {
        let mut task = Self::root(directive);
        task.parent_id = Some(parent.id);
        task.scan_id = parent.scan_id;
        task
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending → Running，并记录认领者
    pub fn claim(&mut self, worker: &WorkerId) -> Result<(), StoreError> {
        self.check(TaskStatus::Running)?;
        self.status = TaskStatus::Running;
        self.assigned_worker = Some(worker.clone());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 按状态机迁移；终态不可再变。离开 Running 时清空 assigned_worker
    pub fn transition(
        &mut self,
        next: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<(), StoreError> {
        self.check(next)?;
        self.status = next;
        if next != TaskStatus::Running {
            self.assigned_worker = None;
        }
        if result.is_some() {
            self.result = result;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 运维重试：Running → Pending
    pub fn reset_for_retry(&mut self) -> Result<(), StoreError> {
        if self.status != TaskStatus::Running {
            return Err(StoreError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.assigned_worker = None;
        self.result = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn check(&self, next: TaskStatus) -> Result<(), StoreError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            })
        }
    }
}

/// 尝试结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// 未真正执行（参数校验失败、被取消等）
    Skipped,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Skipped => "Skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Success" => Some(Self::Success),
            "Failure" => Some(Self::Failure),
            "Skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// 一次命令执行的审计记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub task_id: TaskId,
    pub fingerprint: Fingerprint,
    pub tool: String,
    pub target: Option<String>,
    pub outcome: AttemptOutcome,
    pub reason: String,
    /// 观察结果摘要的哈希；用于判断这次尝试是否带来了新信息
    pub observation_digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(
        task_id: TaskId,
        fingerprint: Fingerprint,
        tool: impl Into<String>,
        target: Option<String>,
        outcome: AttemptOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            fingerprint,
            tool: tool.into(),
            target,
            outcome,
            reason: reason.into(),
            observation_digest: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_observation(mut self, digest: impl Into<String>) -> Self {
        self.observation_digest = Some(digest.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_sets_worker_and_running() {
        let mut task = Task::root(Directive::new("scan"));
        let worker = WorkerId::new("w1");
        task.claim(&worker).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_worker, Some(worker));
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut task = Task::root(Directive::new("scan"));
        task.claim(&WorkerId::new("w1")).unwrap();
        task.transition(TaskStatus::Completed, Some(TaskResult::completed(None, 1)))
            .unwrap();
        assert!(task.assigned_worker.is_none());

        let err = task
            .transition(TaskStatus::Failed, Some(TaskResult::failed("late", 1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap().reason, None);
    }

    #[test]
    fn test_retry_only_from_running() {
        let mut task = Task::root(Directive::new("scan"));
        assert!(task.reset_for_retry().is_err());
        task.claim(&WorkerId::new("w1")).unwrap();
        task.reset_for_retry().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_worker.is_none());
    }

    #[test]
    fn test_child_inherits_scan() {
        let root = Task::root(Directive::new("scan"));
        let child = Task::child_of(&root, Directive::new("sub"));
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.scan_id, root.id);
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn test_status_round_trip_names() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
    }
}
