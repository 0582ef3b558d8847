//! 工具调用器（Tool Invoker）
//!
//! 对每次调用施加超时，超时直接丢弃 future（工具需保证可被中断），失败时转为 ToolError；
//! 每次调用输出一行结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::tools::{ToolCatalog, ToolOutput};

/// 执行一个具名命令并返回结构化结果；可能长时间阻塞
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn run(&self, tool: &str, args: Value, timeout: Duration) -> Result<ToolOutput, ToolError>;
}

/// 基于 ToolCatalog 的调用器
pub struct RegistryInvoker {
    catalog: Arc<ToolCatalog>,
}

impl RegistryInvoker {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }
}

#[async_trait]
impl ToolInvoker for RegistryInvoker {
    async fn run(&self, tool_name: &str, args: Value, limit: Duration) -> Result<ToolOutput, ToolError> {
        let tool = self
            .catalog
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = timeout(limit, tool.run(args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(out)) if out.success => (true, "ok"),
            Ok(Ok(_)) => (false, "failed"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(message)) => Err(ToolError::Failed {
                tool: tool_name.to_string(),
                message,
            }),
            Err(_) => Err(ToolError::Timeout {
                tool: tool_name.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
