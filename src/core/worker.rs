//! WorkerHandle：Orchestrator 对每个存活 Agent 循环的记账
//!
//! 认领任务时创建，Agent 循环到达终态（或被强制放弃）时销毁；只存在于进程内存中。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::core::{Task, TaskId};

pub struct WorkerHandle {
    pub task_id: TaskId,
    pub scan_id: TaskId,
    cancel: CancellationToken,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    live: Arc<AtomicBool>,
    /// Agent 循环本身所在的任务
    run: AbortHandle,
    /// 监督任务；停机时被取走等待
    supervisor: Option<JoinHandle<()>>,
}

/// 供状态查询的只读摘要
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub task_id: TaskId,
    pub scan_id: TaskId,
    pub started_at: DateTime<Utc>,
    pub running_ms: u64,
    pub cancel_requested: bool,
}

impl WorkerHandle {
    pub fn new(
        task: &Task,
        cancel: CancellationToken,
        live: Arc<AtomicBool>,
        run: AbortHandle,
        supervisor: JoinHandle<()>,
    ) -> Self {
        Self {
            task_id: task.id,
            scan_id: task.scan_id,
            cancel,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            live,
            run,
            supervisor: Some(supervisor),
        }
    }

    /// 协作式取消：Agent 循环在下一个挂起点观察到
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// 强制终止 Agent 循环（停机宽限期耗尽后）
    pub fn abort(&self) {
        self.run.abort();
    }

    pub fn take_supervisor(&mut self) -> Option<JoinHandle<()>> {
        self.supervisor.take()
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            task_id: self.task_id,
            scan_id: self.scan_id,
            started_at: self.started_wall,
            running_ms: self.started_at.elapsed().as_millis() as u64,
            cancel_requested: self.cancel.is_cancelled(),
        }
    }
}
