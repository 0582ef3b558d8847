//! 宿主进程的关闭处理
//!
//! ShutdownManager 把 Ctrl+C / SIGTERM 转成一个取消信号并记下原因；
//! ShutdownCoordinator 按注册顺序执行清理任务（先停 Orchestrator），
//! 每个清理任务有独立超时，单个失败或超时不影响后面的任务。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：第一次触发的原因被保留
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// 等待关闭信号，返回触发原因
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| ShutdownReason::FatalError("unknown".to_string()))
    }

    /// 安装 Ctrl+C 与（unix 下）SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM, shutting down");
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!(error = %e, "Could not install SIGTERM handler"),
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// 单个清理任务的超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Box::new(task));
    }

    /// 依次执行全部清理任务，返回失败或超时的任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        tracing::info!(tasks = self.tasks.len(), "Running cleanup tasks");
        let mut failed = Vec::new();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "Cleanup finished"),
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Cleanup failed");
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(
                        task = name,
                        timeout_secs = self.timeout.as_secs(),
                        "Cleanup timed out"
                    );
                    failed.push(name);
                }
            }
        }
        failed
    }
}

/// 停止 Orchestrator：取消所有工作者并等待其在宽限期内收尾
pub struct OrchestratorCleanup {
    orchestrator: Orchestrator,
}

impl OrchestratorCleanup {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for OrchestratorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let report = self.orchestrator.stop().await;
        if report.abandoned > 0 {
            anyhow::bail!("{} workers abandoned after grace period", report.abandoned);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "orchestrator"
    }
}
