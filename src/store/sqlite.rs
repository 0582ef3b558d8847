//! SQLite 版 Task Store（sqlx，异步）
//!
//! - `tasks`：任务表，directive / result 以 JSON 文本存储，时间为毫秒时间戳
//! - `attempts`：尝试记录，只追加
//!
//! 认领使用单条 `UPDATE … RETURNING`，状态迁移使用带旧状态条件的 UPDATE（乐观并发）。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::{
    Attempt, AttemptOutcome, Fingerprint, StoreError, Task, TaskId, TaskResult, TaskStatus,
    WorkerId,
};
use crate::store::TaskStore;

const TASK_COLUMNS: &str = "id, parent_id, scan_id, status, directive, assigned_worker, result, created_at, updated_at";

/// 条件更新冲突时的重读次数
const MAX_CAS_RETRIES: usize = 5;

pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// 打开（必要时创建）数据库文件
    pub async fn connect(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 进程内存数据库（单连接，否则每个连接各有一份库）
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                scan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                directive TEXT NOT NULL,
                assigned_worker TEXT,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS attempts (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                tool TEXT NOT NULL,
                target TEXT,
                outcome TEXT NOT NULL,
                reason TEXT NOT NULL,
                observation_digest TEXT,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;
        task_from_row(&row)
    }

    /// 读取 → 在内存中按状态机修改 → 以旧状态为条件写回；被并发修改时重读
    async fn apply<F>(&self, task_id: TaskId, change: F) -> Result<Task, StoreError>
    where
        F: Fn(&mut Task) -> Result<(), StoreError> + Send + Sync,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut task = self.fetch_task(task_id).await?;
            let prev = task.status;
            change(&mut task)?;

            let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;
            let affected = sqlx::query(
                "UPDATE tasks SET status = ?, assigned_worker = ?, result = ?, updated_at = ?
                 WHERE id = ? AND status = ?",
            )
            .bind(task.status.as_str())
            .bind(task.assigned_worker.as_ref().map(|w| w.as_str().to_string()))
            .bind(result_json)
            .bind(task.updated_at.timestamp_millis())
            .bind(task_id.to_string())
            .bind(prev.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if affected == 1 {
                return Ok(task);
            }
            tracing::debug!(task_id = %task_id, "Concurrent status change, re-reading task");
        }
        Err(StoreError::Backend(format!(
            "task {task_id} kept changing under update"
        )))
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        let directive = serde_json::to_string(&task.directive)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO tasks
             (id, parent_id, scan_id, status, directive, assigned_worker, result, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id.to_string())
        .bind(task.parent_id.map(|p| p.to_string()))
        .bind(task.scan_id.to_string())
        .bind(task.status.as_str())
        .bind(directive)
        .bind(task.assigned_worker.as_ref().map(|w| w.as_str().to_string()))
        .bind(result)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::AlreadyExists(task.id),
            other => other.into(),
        })?;
        Ok(())
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.fetch_task(task_id).await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let rows = match status {
            Some(s) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at ASC, rowid ASC"
                );
                sqlx::query(&sql).bind(s.as_str()).fetch_all(&self.pool).await?
            }
            None => {
                let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, rowid ASC");
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    async fn claim_pending(&self, limit: usize, worker: &WorkerId) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE tasks SET status = 'Running', assigned_worker = ?, updated_at = ?
             WHERE id IN (
                 SELECT id FROM tasks WHERE status = 'Pending'
                 ORDER BY created_at ASC, rowid ASC LIMIT ?
             ) AND status = 'Pending'
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(worker.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = rows.iter().map(task_from_row).collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<Task, StoreError> {
        self.apply(task_id, |task| task.transition(status, result.clone()))
            .await
    }

    async fn retry_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.apply(task_id, |task| task.reset_for_retry()).await
    }

    async fn append_attempt(&self, attempt: Attempt) -> Result<(), StoreError> {
        // 外键语义：任务必须存在
        self.fetch_task(attempt.task_id).await?;
        sqlx::query(
            "INSERT INTO attempts
             (id, task_id, fingerprint, tool, target, outcome, reason, observation_digest, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.id.to_string())
        .bind(attempt.task_id.to_string())
        .bind(attempt.fingerprint.as_str())
        .bind(&attempt.tool)
        .bind(&attempt.target)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.reason)
        .bind(&attempt.observation_digest)
        .bind(attempt.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attempts(&self, task_id: TaskId) -> Result<Vec<Attempt>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, task_id, fingerprint, tool, target, outcome, reason, observation_digest, created_at
             FROM attempts WHERE task_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn descendants(&self, root: TaskId) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            "WITH RECURSIVE tree(id) AS (
                 SELECT id FROM tasks WHERE id = ?
                 UNION ALL
                 SELECT t.id FROM tasks t JOIN tree ON t.parent_id = tree.id
             )
             SELECT {TASK_COLUMNS} FROM tasks WHERE id IN (SELECT id FROM tree)
             ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(root.to_string())
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(root));
        }
        rows.iter().map(task_from_row).collect()
    }
}

fn parse_id(raw: &str) -> Result<TaskId, StoreError> {
    TaskId::parse(raw).map_err(|e| StoreError::Serialization(format!("bad task id {raw}: {e}")))
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Serialization(format!("bad timestamp {ms}")))
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status {status_raw}")))?;
    let directive: String = row.try_get("directive")?;
    let result: Option<String> = row.try_get("result")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;

    Ok(Task {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        parent_id: parent_id.as_deref().map(parse_id).transpose()?,
        scan_id: parse_id(&row.try_get::<String, _>("scan_id")?)?,
        status,
        directive: serde_json::from_str(&directive)?,
        assigned_worker: row
            .try_get::<Option<String>, _>("assigned_worker")?
            .map(WorkerId::new),
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        created_at: parse_millis(row.try_get("created_at")?)?,
        updated_at: parse_millis(row.try_get("updated_at")?)?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<Attempt, StoreError> {
    let id: String = row.try_get("id")?;
    let outcome_raw: String = row.try_get("outcome")?;
    Ok(Attempt {
        id: uuid::Uuid::parse_str(&id)
            .map_err(|e| StoreError::Serialization(format!("bad attempt id {id}: {e}")))?,
        task_id: parse_id(&row.try_get::<String, _>("task_id")?)?,
        fingerprint: Fingerprint::from_raw(row.try_get::<String, _>("fingerprint")?),
        tool: row.try_get("tool")?,
        target: row.try_get("target")?,
        outcome: AttemptOutcome::parse(&outcome_raw)
            .ok_or_else(|| StoreError::Serialization(format!("unknown outcome {outcome_raw}")))?,
        reason: row.try_get("reason")?,
        observation_digest: row.try_get("observation_digest")?,
        created_at: parse_millis(row.try_get("created_at")?)?,
    })
}
