//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词）；禁止 rm -rf、chmod 777 等子串。
//! 子进程设置 kill_on_drop：调用方超时丢弃 future 时进程随之被终止。

use std::collections::HashSet;
use std::process::Stdio;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::tools::{schema::schema_value, Tool, ToolOutput};

/// 禁止的子串（即使命令名在白名单中）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 输出截断上限（字符）
const MAX_OUTPUT_CHARS: usize = 64 * 1024;

#[derive(Debug, Deserialize, JsonSchema)]
struct ShellArgs {
    /// 要执行的命令（首词必须在白名单中）
    command: String,
    /// 命令作用的目标（主机、URL、路径）
    #[serde(default)]
    target: Option<String>,
}

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: HashSet<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self { allowed_commands }
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > MAX_OUTPUT_CHARS {
        let head: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
        format!("{}\n...[truncated]", head)
    } else {
        text.to_string()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted external command. Args: {\"command\": \"...\", \"target\": \"optional\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<ShellArgs>()
    }

    async fn run(&self, args: Value) -> Result<ToolOutput, String> {
        let args: ShellArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        let command = args.command.trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, target = ?args.target, "shell tool run");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();

        if !output.status.success() {
            return Ok(ToolOutput::failure(format!(
                "Exit {:?}\nstderr: {}",
                exit_code,
                stderr.trim()
            ))
            .with_data("exit_code", json!(exit_code)));
        }
        Ok(ToolOutput::ok(stdout)
            .with_data("exit_code", json!(exit_code))
            .with_data("stderr", json!(stderr)))
    }
}
