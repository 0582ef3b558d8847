//! Task Store：任务与尝试记录的持久化边界
//!
//! 认领是原子的条件更新（Pending → Running 且 assigned_worker = 认领者），两个认领者不会同时赢得同一任务。
//! 状态迁移规则统一由 `Task` 实现，存储层只负责原子地应用。

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::core::{Attempt, StoreError, Task, TaskId, TaskResult, TaskStatus, WorkerId};

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 连通性检查（Orchestrator 启动时调用）
    async fn ping(&self) -> Result<(), StoreError>;

    /// id 已存在时返回 `StoreError::AlreadyExists`，已有记录保持不变
    async fn insert_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError>;

    /// 按状态列出任务；None 表示全部，按创建时间升序
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError>;

    /// 原子认领至多 `limit` 个 Pending 任务（最早创建的优先）
    async fn claim_pending(&self, limit: usize, worker: &WorkerId) -> Result<Vec<Task>, StoreError>;

    /// 状态迁移；终态任务返回 InvalidTransition
    async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<Task, StoreError>;

    /// 运维重试：Running → Pending
    async fn retry_task(&self, task_id: TaskId) -> Result<Task, StoreError>;

    async fn append_attempt(&self, attempt: Attempt) -> Result<(), StoreError>;

    /// 某任务的全部尝试，按创建顺序
    async fn get_attempts(&self, task_id: TaskId) -> Result<Vec<Attempt>, StoreError>;

    /// 根任务及其全部后代（传递闭包）
    async fn descendants(&self, root: TaskId) -> Result<Vec<Task>, StoreError>;
}
