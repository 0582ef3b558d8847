//! 集成测试公用：可计数的 scan 工具、脚本化推理器、可注入故障的存储

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::core::{
    Attempt, EventSink, ReasonerError, StoreError, Task, TaskId, TaskResult, TaskStatus, WorkerId,
};
use hive::react::{AgentContext, Proposal, Reasoner, ToolCall};
use hive::store::{InMemoryTaskStore, TaskStore};
use hive::tools::schema::schema_value;
use hive::tools::{Tool, ToolOutput, ToolRegistry, ToolSpec};
use hive::{HiveBuilder, Orchestrator};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

/// 记录真实执行次数与同时执行的峰值
#[derive(Default)]
pub struct RunCounter {
    pub runs: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl RunCounter {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(self))
    }
}

struct ActiveGuard(Arc<RunCounter>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ScanArgs {
    /// 扫描目标
    target: String,
    #[serde(default)]
    #[allow(dead_code)]
    ports: Option<String>,
}

/// 模拟端口扫描：固定耗时，每次真实执行都记入 RunCounter
pub struct ScanTool {
    counter: Arc<RunCounter>,
    delay: Duration,
}

impl ScanTool {
    pub fn new(counter: Arc<RunCounter>, delay: Duration) -> Self {
        Self { counter, delay }
    }
}

#[async_trait]
impl Tool for ScanTool {
    fn name(&self) -> &str {
        "scan"
    }

    fn description(&self) -> &str {
        "Scan a host for open ports"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ScanArgs>()
    }

    async fn run(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ScanArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let _guard = self.counter.enter();
        tokio::time::sleep(self.delay).await;
        Ok(ToolOutput::ok(format!("{}: 22/tcp open, 80/tcp open", args.target)))
    }
}

pub fn scan_registry(counter: Arc<RunCounter>, delay: Duration) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(ScanTool::new(counter, delay));
    tools
}

pub fn scan(target: &str) -> Proposal {
    Proposal::Action(ToolCall {
        tool: "scan".to_string(),
        args: json!({ "target": target, "ports": "1-1000" }),
    })
}

pub fn complete() -> Proposal {
    Proposal::Complete {
        summary: Some("done".to_string()),
    }
}

/// 以闭包决定下一步的推理器
pub struct FnReasoner<F>(pub F);

#[async_trait]
impl<F> Reasoner for FnReasoner<F>
where
    F: Fn(&AgentContext) -> Proposal + Send + Sync,
{
    async fn propose(
        &self,
        context: &AgentContext,
        _tools: &[ToolSpec],
    ) -> Result<Proposal, ReasonerError> {
        Ok((self.0)(context))
    }
}

/// 先扫描 directive.target（缺省 10.0.0.5），有了一次尝试后完成
pub fn scan_once_reasoner() -> Arc<dyn Reasoner> {
    Arc::new(FnReasoner(|ctx: &AgentContext| {
        if ctx.attempts.is_empty() {
            scan(ctx.directive.target.as_deref().unwrap_or("10.0.0.5"))
        } else {
            complete()
        }
    }))
}

/// 包装内存存储，可注入：ping 失败、前 N 次认领 / 读取尝试记录失败、读取尝试记录变慢
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryTaskStore,
    pub ping_down: AtomicBool,
    pub failing_claims: AtomicUsize,
    pub claim_calls: AtomicUsize,
    pub failing_attempt_reads: AtomicUsize,
    attempts_delay: Option<Duration>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_claims(self, n: usize) -> Self {
        self.failing_claims.store(n, Ordering::SeqCst);
        self
    }

    /// 前 n 次 get_attempts 返回后端错误
    pub fn with_failing_attempt_reads(self, n: usize) -> Self {
        self.failing_attempt_reads.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_slow_attempts(mut self, delay: Duration) -> Self {
        self.attempts_delay = Some(delay);
        self
    }

    fn outage() -> StoreError {
        StoreError::Backend("connection refused".to_string())
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.ping_down.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.ping().await
    }

    async fn insert_task(&self, task: Task) -> Result<(), StoreError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.inner.get_task(task_id).await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks(status).await
    }

    async fn claim_pending(&self, limit: usize, worker: &WorkerId) -> Result<Vec<Task>, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::outage());
        }
        self.inner.claim_pending(limit, worker).await
    }

    async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<Task, StoreError> {
        self.inner.update_status(task_id, status, result).await
    }

    async fn retry_task(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.inner.retry_task(task_id).await
    }

    async fn append_attempt(&self, attempt: Attempt) -> Result<(), StoreError> {
        self.inner.append_attempt(attempt).await
    }

    async fn get_attempts(&self, task_id: TaskId) -> Result<Vec<Attempt>, StoreError> {
        if let Some(delay) = self.attempts_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_attempt_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::outage());
        }
        self.inner.get_attempts(task_id).await
    }

    async fn descendants(&self, root: TaskId) -> Result<Vec<Task>, StoreError> {
        self.inner.descendants(root).await
    }
}

/// 毫秒级轮询与退避，便于测试快速收敛
pub fn fast_config(max_concurrency: usize) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.orchestrator.poll_interval_ms = 10;
    cfg.orchestrator.max_concurrency = max_concurrency;
    cfg.orchestrator.store_backoff_ms = 20;
    cfg.orchestrator.shutdown_grace_secs = 2;
    cfg.agent.reasoner_backoff_ms = 1;
    cfg.agent.tool_timeout_secs = 10;
    cfg
}

pub async fn orchestrator(
    cfg: AppConfig,
    store: Arc<dyn TaskStore>,
    reasoner: Arc<dyn Reasoner>,
    tools: ToolRegistry,
) -> Orchestrator {
    HiveBuilder::new(cfg)
        .with_store(store)
        .with_reasoner(reasoner)
        .with_tools(tools)
        .build()
        .await
        .unwrap()
}

pub async fn orchestrator_with_events(
    cfg: AppConfig,
    reasoner: Arc<dyn Reasoner>,
    tools: ToolRegistry,
    events: Arc<dyn EventSink>,
) -> Orchestrator {
    HiveBuilder::new(cfg)
        .with_store(Arc::new(InMemoryTaskStore::new()))
        .with_reasoner(reasoner)
        .with_tools(tools)
        .with_events(events)
        .build()
        .await
        .unwrap()
}

pub async fn wait_terminal(orch: &Orchestrator, id: TaskId) -> Task {
    for _ in 0..500 {
        let task = orch.store().get_task(id).await.unwrap();
        if task.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached a terminal state");
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
