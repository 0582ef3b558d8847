//! 内存版 Task Store（测试与 `memory` 后端）

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::{Attempt, StoreError, Task, TaskId, TaskResult, TaskStatus, WorkerId};
use crate::store::TaskStore;

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    /// 插入顺序，claim 时按此顺序挑选
    order: Vec<TaskId>,
    children: HashMap<TaskId, Vec<TaskId>>,
    attempts: HashMap<TaskId, Vec<Attempt>>,
}

/// 所有写操作在同一把写锁内完成，认领天然原子
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        if let Some(parent) = task.parent_id {
            state.children.entry(parent).or_default().push(task.id);
        }
        state.order.push(task.id);
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.state
            .read()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::NotFound(task_id))
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn claim_pending(&self, limit: usize, worker: &WorkerId) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.state.write().await;
        let candidates: Vec<TaskId> = state
            .order
            .iter()
            .filter(|id| {
                state
                    .tasks
                    .get(id)
                    .map(|t| t.status == TaskStatus::Pending)
                    .unwrap_or(false)
            })
            .take(limit)
            .copied()
            .collect();

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.claim(worker)?;
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        task.transition(status, result)?;
        Ok(task.clone())
    }

    async fn retry_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        task.reset_for_retry()?;
        Ok(task.clone())
    }

    async fn append_attempt(&self, attempt: Attempt) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.tasks.contains_key(&attempt.task_id) {
            return Err(StoreError::NotFound(attempt.task_id));
        }
        state.attempts.entry(attempt.task_id).or_default().push(attempt);
        Ok(())
    }

    async fn get_attempts(&self, task_id: TaskId) -> Result<Vec<Attempt>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .attempts
            .get(&task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn descendants(&self, root: TaskId) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        let root_task = state.tasks.get(&root).ok_or(StoreError::NotFound(root))?;
        let mut out = vec![root_task.clone()];
        let mut queue: VecDeque<TaskId> = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            for child in state.children.get(&id).into_iter().flatten() {
                if let Some(task) = state.tasks.get(child) {
                    out.push(task.clone());
                    queue.push_back(*child);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttemptOutcome, Directive, Fingerprint};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = Arc::new(InMemoryTaskStore::new());
        for i in 0..10 {
            store
                .insert_task(Task::root(Directive::new(format!("goal {i}"))))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_pending(5, &WorkerId::new(format!("w{w}")))
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.extend(h.await.unwrap().into_iter().map(|t| t.id));
        }
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let store = InMemoryTaskStore::new();
        let first = Task::root(Directive::new("first"));
        let first_id = first.id;
        store.insert_task(first).await.unwrap();
        store.insert_task(Task::root(Directive::new("second"))).await.unwrap();

        let claimed = store.claim_pending(1, &WorkerId::new("w")).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first_id);
        assert_eq!(claimed[0].assigned_worker, Some(WorkerId::new("w")));
    }

    #[tokio::test]
    async fn test_terminal_update_rejected() {
        let store = InMemoryTaskStore::new();
        let task = Task::root(Directive::new("g"));
        let id = task.id;
        store.insert_task(task).await.unwrap();
        store.claim_pending(1, &WorkerId::new("w")).await.unwrap();
        store
            .update_status(id, TaskStatus::Cancelled, Some(TaskResult::cancelled("stop", 0)))
            .await
            .unwrap();
        let err = store
            .update_status(id, TaskStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get_task(id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_insert_keeps_terminal_task() {
        let store = InMemoryTaskStore::new();
        let task = Task::root(Directive::new("g"));
        let id = task.id;
        store.insert_task(task.clone()).await.unwrap();
        store.claim_pending(1, &WorkerId::new("w")).await.unwrap();
        store
            .update_status(id, TaskStatus::Completed, Some(TaskResult::completed(None, 1)))
            .await
            .unwrap();

        let err = store.insert_task(task).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(dup) if dup == id));
        assert_eq!(store.get_task(id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(store.list_tasks(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_descendants_transitive() {
        let store = InMemoryTaskStore::new();
        let root = Task::root(Directive::new("root"));
        let child = Task::child_of(&root, Directive::new("child"));
        let grandchild = Task::child_of(&child, Directive::new("grandchild"));
        let other = Task::root(Directive::new("other"));
        let root_id = root.id;
        store.insert_task(root).await.unwrap();
        store.insert_task(child).await.unwrap();
        store.insert_task(grandchild).await.unwrap();
        store.insert_task(other).await.unwrap();

        let tree = store.descendants(root_id).await.unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree.iter().all(|t| t.scan_id == root_id));
    }

    #[tokio::test]
    async fn test_attempts_are_ordered() {
        let store = InMemoryTaskStore::new();
        let task = Task::root(Directive::new("g"));
        let id = task.id;
        store.insert_task(task).await.unwrap();
        for i in 0..3 {
            let fp = Fingerprint::compute("echo", &serde_json::json!({"i": i}), None);
            store
                .append_attempt(Attempt::new(id, fp, "echo", None, AttemptOutcome::Success, format!("{i}")))
                .await
                .unwrap();
        }
        let reasons: Vec<String> = store
            .get_attempts(id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.reason)
            .collect();
        assert_eq!(reasons, vec!["0", "1", "2"]);
    }
}
