//! Echo 工具（诊断用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema::schema_value, Tool, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 回显的文本
    text: String,
    #[serde(default)]
    #[allow(dead_code)]
    target: Option<String>,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (diagnostics). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<EchoArgs>()
    }

    async fn run(&self, args: Value) -> Result<ToolOutput, String> {
        let args: EchoArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        Ok(ToolOutput::ok(args.text))
    }
}
