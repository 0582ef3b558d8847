//! Hive 宿主进程
//!
//! 入口：加载配置、初始化日志、组装 Orchestrator 并启动轮询；命令行给出目标时立即提交一次 scan。
//! Ctrl+C / SIGTERM 时停止 Orchestrator 并执行清理任务。
//!
//! 用法：`hive [--config PATH] [--target TARGET] [GOAL...]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive::config::{load_config, AppConfig};
use hive::core::{
    HiveBuilder, OrchestratorCleanup, ShutdownCoordinator, ShutdownManager,
};
use hive::Directive;

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about = "Multi-agent recon orchestrator with shared command execution", long_about = None)]
struct Cli {
    /// 配置文件路径（缺省时读取 config/default.toml 与 HIVE__ 环境变量）
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 首个 scan 的目标（主机、网段或 URL）
    #[arg(short, long)]
    target: Option<String>,

    /// 首个 scan 的目标描述；为空时只启动轮询
    goal: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let args = Cli::parse();

    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let grace_secs = cfg.orchestrator.shutdown_grace_secs;

    let orchestrator = HiveBuilder::new(cfg)
        .build()
        .await
        .context("Failed to assemble orchestrator")?;
    orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;

    if !args.goal.is_empty() {
        let mut directive = Directive::new(args.goal.join(" "));
        if let Some(target) = args.target {
            directive = directive.with_target(target);
        }
        let scan_id = orchestrator
            .start_scan(directive)
            .await
            .context("Failed to submit scan")?;
        tracing::info!(scan_id = %scan_id, "Scan started");
    }

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let mut coordinator =
        ShutdownCoordinator::new().with_timeout(Duration::from_secs(grace_secs + 5));
    coordinator.register(OrchestratorCleanup::new(orchestrator.clone()));

    let reason = manager.wait_for_shutdown().await;
    tracing::info!(reason = ?reason, "Shutdown requested");
    let failed = coordinator.run_cleanup().await;
    if !failed.is_empty() {
        anyhow::bail!("cleanup failed: {}", failed.join(", "));
    }
    Ok(())
}
