//! Orchestrator：轮询认领、并发上限、工作者监督与停机
//!
//! 轮询循环是单个顺序执行的定时任务：每轮按空闲槽位数从 Task Store 原子认领 Pending 任务，
//! 为每个认领到的任务启动一个 Agent 循环并登记 WorkerHandle。并发上限由信号量统一控制。
//!
//! 工作者内的错误或 panic 被监督层捕获并转为任务 Failed，不会影响轮询循环或其他工作者；
//! 轮询时的存储错误只记录日志并退避后重试。
//! 每轮成功轮询后顺带做维护：清理 Hive Mind 中过期的缓存结果，忘掉已经全部收尾的取消记录。

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::worker::{WorkerHandle, WorkerSummary};
use crate::core::{
    Directive, HiveEvent, HiveMind, OrchestratorError, StartupError, StoreError, Task, TaskId,
    TaskResult, TaskStatus, WorkerId,
};
use crate::react::{AgentDeps, AgentLoop};
use crate::store::TaskStore;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    /// 同时存活的工作者上限
    pub max_concurrency: usize,
    /// 轮询遇到存储错误后的等待时间
    pub store_backoff: Duration,
    /// 停机时等待工作者收尾的宽限期
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_concurrency: 5,
            store_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// stop() 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// 宽限期内自行结束的工作者
    pub finished: usize,
    /// 宽限期耗尽被放弃（任务标记 shutdown-timeout）的工作者
    pub abandoned: usize,
}

/// 可廉价克隆的句柄，内部共享同一个状态
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    deps: AgentDeps,
    settings: OrchestratorSettings,
    worker_id: WorkerId,
    workers: Mutex<HashMap<TaskId, WorkerHandle>>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    wake: Notify,
    /// 被 stop_scan 取消的子树：键为 stop_scan 的根，值为当时子树内的任务 id
    cancelled: Mutex<HashMap<TaskId, HashSet<TaskId>>>,
    poll: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(deps: AgentDeps, settings: OrchestratorSettings) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                worker_id: WorkerId::generate("orchestrator"),
                workers: Mutex::new(HashMap::new()),
                slots,
                shutdown: CancellationToken::new(),
                wake: Notify::new(),
                cancelled: Mutex::new(HashMap::new()),
                poll: AsyncMutex::new(None),
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker_id
    }

    pub fn hive(&self) -> &Arc<HiveMind> {
        &self.inner.deps.hive
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.deps.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// 启动轮询循环；重复调用无副作用。存储不可达时返回 StoreUnreachable
    pub async fn start(&self) -> Result<(), StartupError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StartupError::ShuttingDown);
        }
        let mut poll = self.inner.poll.lock().await;
        if poll.is_some() {
            return Ok(());
        }
        self.inner
            .deps
            .store
            .ping()
            .await
            .map_err(StartupError::StoreUnreachable)?;

        let inner = Arc::clone(&self.inner);
        *poll = Some(tokio::spawn(inner.poll_loop()));
        tracing::info!(
            worker = %self.inner.worker_id,
            max_concurrency = self.inner.settings.max_concurrency,
            poll_interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
            "Orchestrator started"
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.poll.lock().await.is_some() && !self.inner.shutdown.is_cancelled()
    }

    /// 取消所有工作者，等待其在宽限期内到达终态；超时者标记 shutdown-timeout 并强制终止
    pub async fn stop(&self) -> StopReport {
        self.inner.shutdown.cancel();
        let poll = self.inner.poll.lock().await.take();
        if let Some(handle) = poll {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Poll loop ended abnormally");
            }
        }

        let pending: Vec<(TaskId, JoinHandle<()>)> = {
            let mut workers = self.inner.lock_workers();
            workers
                .iter_mut()
                .filter_map(|(id, h)| h.take_supervisor().map(|j| (*id, j)))
                .collect()
        };
        if !pending.is_empty() {
            tracing::info!(
                workers = pending.len(),
                grace_secs = self.inner.settings.shutdown_grace.as_secs(),
                "Waiting for workers to stop"
            );
        }

        let deadline = tokio::time::Instant::now() + self.inner.settings.shutdown_grace;
        let mut report = StopReport::default();
        for (task_id, mut supervisor) in pending {
            match tokio::time::timeout_at(deadline, &mut supervisor).await {
                Ok(_) => report.finished += 1,
                Err(_) => {
                    tracing::warn!(task_id = %task_id, "Worker did not stop within grace period, abandoning");
                    self.inner.fail_task(task_id, "shutdown-timeout").await;
                    if let Some(handle) = self.inner.lock_workers().remove(&task_id) {
                        handle.abort();
                    }
                    supervisor.abort();
                    report.abandoned += 1;
                }
            }
        }
        tracing::info!(finished = report.finished, abandoned = report.abandoned, "Orchestrator stopped");
        report
    }

    /// 插入根任务并确保轮询循环会认领它；立即返回
    pub async fn start_scan(&self, directive: Directive) -> Result<TaskId, OrchestratorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StartupError::ShuttingDown.into());
        }
        let task = Task::root(directive);
        let scan_id = task.id;
        self.inner.deps.store.insert_task(task).await?;
        self.start().await?;
        self.inner.wake.notify_one();
        tracing::info!(scan_id = %scan_id, "Scan submitted");
        Ok(scan_id)
    }

    /// 取消根任务及其全部后代：存活工作者收到取消信号，尚未运行的任务直接置为 Cancelled。
    /// 返回受影响的任务数
    pub async fn stop_scan(&self, scan_id: TaskId) -> Result<usize, OrchestratorError> {
        let tree = self.inner.deps.store.descendants(scan_id).await?;
        self.inner
            .lock_cancelled()
            .entry(scan_id)
            .or_default()
            .extend(tree.iter().map(|t| t.id));

        let mut orphans = Vec::new();
        let mut affected = 0;
        {
            let workers = self.inner.lock_workers();
            for task in &tree {
                if let Some(handle) = workers.get(&task.id) {
                    handle.cancel();
                    affected += 1;
                } else if !task.is_terminal() {
                    orphans.push(task.id);
                }
            }
        }

        for task_id in orphans {
            if self.inner.cancel_task(task_id, "scan-cancelled").await {
                affected += 1;
            }
        }
        tracing::info!(scan_id = %scan_id, affected, "Scan stop requested");
        Ok(affected)
    }

    /// 运维重试：把没有存活工作者的 Running 任务放回 Pending
    pub async fn retry_task(&self, task_id: TaskId) -> Result<Task, OrchestratorError> {
        let busy = self
            .inner
            .lock_workers()
            .get(&task_id)
            .map(|h| h.is_live())
            .unwrap_or(false);
        if busy {
            return Err(OrchestratorError::TaskBusy(task_id));
        }
        let task = self.inner.deps.store.retry_task(task_id).await?;
        for ids in self.inner.lock_cancelled().values_mut() {
            ids.remove(&task_id);
        }
        self.inner.wake.notify_one();
        tracing::info!(task_id = %task_id, "Task reset to Pending by operator");
        Ok(task)
    }

    pub fn live_workers(&self) -> Vec<WorkerSummary> {
        let mut out: Vec<_> = self
            .inner
            .lock_workers()
            .values()
            .filter(|h| h.is_live())
            .map(|h| h.summary())
            .collect();
        out.sort_by_key(|w| w.started_at);
        out
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock_workers().len()
    }

    /// 立即触发一轮轮询
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }
}

impl Inner {
    fn lock_workers(&self) -> MutexGuard<'_, HashMap<TaskId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_cancelled(&self) -> MutexGuard<'_, HashMap<TaskId, HashSet<TaskId>>> {
        self.cancelled.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_cancelled(&self, task: &Task) -> bool {
        let cancelled = self.lock_cancelled();
        cancelled.contains_key(&task.scan_id)
            || cancelled.values().any(|ids| {
                ids.contains(&task.id) || task.parent_id.map(|p| ids.contains(&p)).unwrap_or(false)
            })
    }

    /// 子树全部终态且没有存活工作者后，不会再有新任务需要拦截，移除对应的取消记录。
    /// 返回移除的子树数
    async fn prune_cancelled(&self) -> usize {
        let roots: Vec<TaskId> = self.lock_cancelled().keys().copied().collect();
        let mut pruned = 0;
        for root in roots {
            let tree = match self.deps.store.descendants(root).await {
                Ok(tree) => tree,
                Err(e) => {
                    tracing::debug!(scan_id = %root, error = %e, "Could not inspect cancelled scan");
                    continue;
                }
            };
            let settled = tree.iter().all(Task::is_terminal) && {
                let workers = self.lock_workers();
                tree.iter().all(|t| !workers.contains_key(&t.id))
            };
            if settled {
                self.lock_cancelled().remove(&root);
                pruned += 1;
            }
        }
        pruned
    }

    /// 每轮成功轮询后的维护
    async fn housekeeping(&self) {
        let purged = self.deps.hive.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Dropped expired hive results");
        }
        let pruned = self.prune_cancelled().await;
        if pruned > 0 {
            tracing::debug!(pruned, "Forgot settled scan cancellations");
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let delay = match self.tick().await {
                Ok(claimed) => {
                    if claimed > 0 {
                        tracing::debug!(claimed, live = self.lock_workers().len(), "Claimed tasks");
                    }
                    self.housekeeping().await;
                    self.settings.poll_interval
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_ms = self.settings.store_backoff.as_millis() as u64,
                        "Task store error during polling, backing off"
                    );
                    self.settings.store_backoff
                }
            };
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("Poll loop stopped");
    }

    /// 一轮轮询：按空闲槽位认领，返回认领数
    async fn tick(self: &Arc<Self>) -> Result<usize, StoreError> {
        let free = self.slots.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let claimed = self.deps.store.claim_pending(free, &self.worker_id).await?;
        let count = claimed.len();
        for task in claimed {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => self.launch(task, permit).await,
                Err(_) => {
                    // 只有轮询循环会占用槽位，正常不会走到这里
                    tracing::warn!(task_id = %task.id, "No free worker slot, releasing claim");
                    if let Err(e) = self.deps.store.retry_task(task.id).await {
                        tracing::error!(task_id = %task.id, error = %e, "Failed to release claim");
                    }
                }
            }
        }
        Ok(count)
    }

    async fn launch(self: &Arc<Self>, task: Task, permit: OwnedSemaphorePermit) {
        if self.is_cancelled(&task) {
            tracing::info!(task_id = %task.id, scan_id = %task.scan_id, "Claimed task belongs to a cancelled scan");
            self.cancel_task(task.id, "scan-cancelled").await;
            return;
        }

        self.deps.events.emit(HiveEvent::TaskClaimed {
            task_id: task.id,
            scan_id: task.scan_id,
            worker: self.worker_id.clone(),
        });

        let task_id = task.id;
        let cancel = self.shutdown.child_token();
        let agent_id = WorkerId::new(format!("{}/{}", self.worker_id, task_id));
        let agent = AgentLoop::new(self.deps.clone(), task.clone(), agent_id, cancel.clone());
        let live = Arc::new(AtomicBool::new(true));

        {
            let mut workers = self.lock_workers();
            let run = tokio::spawn(agent.run());
            let abort = run.abort_handle();
            let supervisor = tokio::spawn(Arc::clone(self).supervise(task_id, run, live.clone(), permit));
            workers.insert(task_id, WorkerHandle::new(&task, cancel.clone(), live, abort, supervisor));
        }

        // stop_scan 可能在登记前已遍历过工作者表
        if self.is_cancelled(&task) {
            cancel.cancel();
        }
        tracing::info!(task_id = %task_id, scan_id = %task.scan_id, "Worker spawned");
    }

    /// 监督边界：工作者的错误和 panic 都在这里转为任务 Failed
    async fn supervise(
        self: Arc<Self>,
        task_id: TaskId,
        run: JoinHandle<Result<crate::react::AgentOutcome, crate::core::AgentError>>,
        live: Arc<AtomicBool>,
        _permit: OwnedSemaphorePermit,
    ) {
        match run.await {
            Ok(Ok(outcome)) => {
                tracing::debug!(task_id = %task_id, status = %outcome.status, "Worker finished");
            }
            Ok(Err(e)) => {
                tracing::error!(task_id = %task_id, error = %e, "Worker returned an error");
                self.fail_task(task_id, format!("worker-error: {e}")).await;
            }
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                tracing::error!(task_id = %task_id, panic = %message, "Worker panicked");
                self.fail_task(task_id, format!("worker-panic: {message}")).await;
            }
            Err(_) => {
                tracing::warn!(task_id = %task_id, "Worker aborted");
                self.fail_task(task_id, "worker-aborted").await;
            }
        }
        live.store(false, Ordering::Release);
        // 先移除记账再释放槽位，保证存活数不超过上限
        self.lock_workers().remove(&task_id);
    }

    async fn fail_task(&self, task_id: TaskId, reason: impl Into<String>) {
        self.finalize(task_id, TaskStatus::Failed, TaskResult::failed(reason, 0))
            .await;
    }

    async fn cancel_task(&self, task_id: TaskId, reason: &str) -> bool {
        self.finalize(task_id, TaskStatus::Cancelled, TaskResult::cancelled(reason, 0))
            .await
    }

    /// 由 Orchestrator 直接写终态；任务已是终态时静默忽略
    async fn finalize(&self, task_id: TaskId, status: TaskStatus, result: TaskResult) -> bool {
        let reason = result.reason.clone();
        match self.deps.store.update_status(task_id, status, Some(result)).await {
            Ok(_) => {
                tracing::info!(task_id = %task_id, status = %status, reason = ?reason, "Task finalized by orchestrator");
                self.deps.events.emit(HiveEvent::TaskTerminal {
                    task_id,
                    status,
                    reason,
                });
                true
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(task_id = %task_id, current = %from, "Task already terminal");
                false
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to finalize task");
                false
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
