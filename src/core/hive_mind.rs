//! Hive Mind：按命令指纹去重的同步层
//!
//! 对任意 fingerprint，无论多少并发调用者，底层命令至多运行一次，所有调用者看到同一个结果：
//! - 有未过期的 Completed 记录：直接返回缓存结果
//! - 有 Running 记录：订阅并等待同一个结果（不占用工作者槽位）
//! - 否则：新建 Running 记录，由调用者拥有；run_lock 在检查重复之前取得，并在整个运行期间持有
//!
//! 失败结果不缓存：Execution 被移除，之后的重试会重新运行命令。
//! 执行表只在查找 / 插入时短暂加锁，从不跨越命令运行。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::{Fingerprint, ToolError, WorkerId};
use crate::tools::ToolOutput;

type Resolution = Result<Arc<ToolOutput>, ToolError>;

/// Execution 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
}

/// 调用者拿到结果的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Origin {
    /// 本调用者发起了真正的运行
    Executed,
    /// 加入了他人正在进行的运行
    Joined,
    /// 命中缓存
    Cached,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Joined => "joined",
            Self::Cached => "cached",
        }
    }
}

/// 共享结果：所有调用者持有同一个 Arc
#[derive(Debug, Clone)]
pub struct SharedOutcome {
    pub output: Arc<ToolOutput>,
    pub origin: Origin,
}

/// Execution 的只读视图
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub fingerprint: Fingerprint,
    pub owner: WorkerId,
    pub state: ExecutionState,
    pub age_ms: u64,
    pub subscribers: usize,
}

#[derive(Debug, Clone)]
pub struct HiveMindSettings {
    /// 缓存结果有效期
    pub result_ttl: Duration,
}

impl Default for HiveMindSettings {
    fn default() -> Self {
        Self {
            result_ttl: Duration::from_secs(900),
        }
    }
}

struct Execution {
    owner: WorkerId,
    state: ExecutionState,
    started_at: Instant,
    finished_at: Option<Instant>,
    result: Option<Arc<ToolOutput>>,
    done_tx: watch::Sender<Option<Resolution>>,
}

/// 每个 fingerprint 一个槽位
struct Slot {
    run_lock: Arc<AsyncMutex<()>>,
    execution: Option<Execution>,
}

enum Decision {
    Cached(Arc<ToolOutput>),
    Join(watch::Receiver<Option<Resolution>>),
    Run {
        rx: watch::Receiver<Option<Resolution>>,
        guard: OwnedMutexGuard<()>,
    },
}

/// 去重执行器；显式构造后注入 Orchestrator 与每个 Agent 循环
pub struct HiveMind {
    table: Arc<Mutex<HashMap<Fingerprint, Slot>>>,
    settings: HiveMindSettings,
    runs_started: Arc<AtomicU64>,
}

impl HiveMind {
    pub fn new(settings: HiveMindSettings) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            settings,
            runs_started: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 执行（或加入 / 复用）fingerprint 对应的命令
    ///
    /// 取消只影响本调用者：放弃订阅返回 `ToolError::Cancelled`，运行本身继续，其他订阅者照常拿到结果。
    pub async fn execute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        owner: &WorkerId,
        cancel: &CancellationToken,
        run_fn: F,
    ) -> Result<SharedOutcome, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let decision = self.decide(fingerprint, owner)?;
        let (mut rx, origin) = match decision {
            Decision::Cached(output) => {
                tracing::debug!(fingerprint = fingerprint.short(), "Hive cache hit");
                return Ok(SharedOutcome {
                    output,
                    origin: Origin::Cached,
                });
            }
            Decision::Join(rx) => {
                tracing::debug!(fingerprint = fingerprint.short(), "Joining in-flight execution");
                (rx, Origin::Joined)
            }
            Decision::Run { rx, guard } => {
                self.runs_started.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = fingerprint.short(), owner = %owner, "Starting exclusive execution");
                self.spawn_driver(fingerprint.clone(), guard, run_fn());
                (rx, Origin::Executed)
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // 丢弃 rx 即退订，不影响运行与其他订阅者
                Err(ToolError::Cancelled)
            }
            res = rx.wait_for(|v| v.is_some()) => match res {
                Ok(value) => match &*value {
                    Some(Ok(output)) => Ok(SharedOutcome { output: output.clone(), origin }),
                    Some(Err(e)) => Err(e.clone()),
                    None => Err(ToolError::Panicked("execution resolved without a result".to_string())),
                },
                Err(_) => Err(ToolError::Panicked("execution abandoned".to_string())),
            },
        }
    }

    /// 在执行表锁内完成「检查 + 认领」，保证两个调用者不会同时看到「无执行」
    fn decide(&self, fingerprint: &Fingerprint, owner: &WorkerId) -> Result<Decision, ToolError> {
        let mut table = lock(&self.table);
        let slot = table.entry(fingerprint.clone()).or_insert_with(|| Slot {
            run_lock: Arc::new(AsyncMutex::new(())),
            execution: None,
        });

        if let Some(exec) = &slot.execution {
            match exec.state {
                ExecutionState::Completed if self.is_fresh(exec) => {
                    if let Some(output) = &exec.result {
                        return Ok(Decision::Cached(output.clone()));
                    }
                }
                ExecutionState::Running => return Ok(Decision::Join(exec.done_tx.subscribe())),
                _ => {}
            }
        }

        // 非 Running 时无人持有 run_lock：驱动任务在发布结果前已释放它
        let guard = slot.run_lock.clone().try_lock_owned().map_err(|_| {
            tracing::error!(fingerprint = fingerprint.short(), "run lock held without a running execution");
            ToolError::Failed {
                tool: String::new(),
                message: "execution slot busy".to_string(),
            }
        })?;

        let (done_tx, rx) = watch::channel(None);
        slot.execution = Some(Execution {
            owner: owner.clone(),
            state: ExecutionState::Running,
            started_at: Instant::now(),
            finished_at: None,
            result: None,
            done_tx,
        });
        Ok(Decision::Run { rx, guard })
    }

    /// 驱动任务独立于发起者运行：发起者被取消时，其他订阅者仍能拿到结果
    fn spawn_driver<Fut>(&self, fingerprint: Fingerprint, guard: OwnedMutexGuard<()>, run: Fut)
    where
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            // 命令在独立任务中运行，panic 不会波及驱动任务
            let resolution: Resolution = match tokio::spawn(run).await {
                Ok(Ok(output)) => Ok(Arc::new(output)),
                Ok(Err(e)) => Err(e),
                Err(join) => Err(ToolError::Panicked(join.to_string())),
            };
            drop(guard);

            let mut table = lock(&table);
            let Some(slot) = table.get_mut(&fingerprint) else {
                return;
            };
            let Some(exec) = slot.execution.as_mut() else {
                return;
            };
            let failed = match &resolution {
                Ok(output) => {
                    exec.state = ExecutionState::Completed;
                    exec.result = Some(output.clone());
                    false
                }
                Err(e) => {
                    tracing::debug!(fingerprint = fingerprint.short(), error = %e, "Execution failed, not cached");
                    exec.state = ExecutionState::Failed;
                    true
                }
            };
            exec.finished_at = Some(Instant::now());
            exec.done_tx.send_replace(Some(resolution));
            if failed {
                table.remove(&fingerprint);
            }
        });
    }

    fn is_fresh(&self, exec: &Execution) -> bool {
        exec.finished_at
            .map(|t| t.elapsed() <= self.settings.result_ttl)
            .unwrap_or(false)
    }

    /// 丢弃已完成的缓存结果；运行中的执行不受影响
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut table = lock(&self.table);
        let completed = table
            .get(fingerprint)
            .and_then(|s| s.execution.as_ref())
            .map(|e| e.state == ExecutionState::Completed)
            .unwrap_or(false);
        if completed {
            table.remove(fingerprint);
        }
        completed
    }

    /// 清理过期缓存，返回清理条数
    pub fn purge_expired(&self) -> usize {
        let mut table = lock(&self.table);
        let before = table.len();
        let ttl = self.settings.result_ttl;
        table.retain(|_, slot| match &slot.execution {
            Some(exec) if exec.state == ExecutionState::Running => true,
            Some(exec) => exec.finished_at.map(|t| t.elapsed() <= ttl).unwrap_or(false),
            None => false,
        });
        before - table.len()
    }

    pub fn snapshot(&self, fingerprint: &Fingerprint) -> Option<ExecutionSnapshot> {
        let table = lock(&self.table);
        let exec = table.get(fingerprint)?.execution.as_ref()?;
        Some(ExecutionSnapshot {
            fingerprint: fingerprint.clone(),
            owner: exec.owner.clone(),
            state: exec.state,
            age_ms: exec.started_at.elapsed().as_millis() as u64,
            subscribers: exec.done_tx.receiver_count(),
        })
    }

    /// 执行表中的条目数（含已完成的缓存结果）
    pub fn tracked(&self) -> usize {
        lock(&self.table).len()
    }

    /// 正在运行的执行数
    pub fn in_flight(&self) -> usize {
        lock(&self.table)
            .values()
            .filter(|s| {
                s.execution
                    .as_ref()
                    .map(|e| e.state == ExecutionState::Running)
                    .unwrap_or(false)
            })
            .count()
    }

    /// 累计真正发起的运行次数
    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }
}

impl Default for HiveMind {
    fn default() -> Self {
        Self::new(HiveMindSettings::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
