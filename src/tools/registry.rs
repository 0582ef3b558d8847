//! 工具注册表与目录
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / run），启动时注册进 ToolRegistry，
//! 然后 freeze 成只读的 ToolCatalog：未知工具名与参数 schema 不符都在校验阶段拒绝，而不是运行时查找失败。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ToolError;

/// 工具执行的结构化结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: Map::new(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            data: Map::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// 工具 trait：名称、描述（供推理器理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限制
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 命令的作用目标，参与 fingerprint 计算
    fn target(&self, args: &Value) -> Option<String> {
        args.get("target")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// 执行工具；Err 表示工具自身无法完成
    async fn run(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 推理器可见的工具描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 启动期的可变注册表
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice, keeping the last one");
        }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 编译每个工具的参数 schema，得到只读目录
    pub fn freeze(self) -> ToolCatalog {
        let entries = self
            .tools
            .into_iter()
            .map(|(name, tool)| {
                let schema = tool.parameters_schema();
                let validator = match jsonschema::validator_for(&schema) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(tool = %name, "Invalid parameter schema, skipping validation: {}", e);
                        None
                    }
                };
                (
                    name,
                    CatalogEntry {
                        tool,
                        schema,
                        validator,
                    },
                )
            })
            .collect();
        ToolCatalog { entries }
    }
}

struct CatalogEntry {
    tool: Arc<dyn Tool>,
    schema: Value,
    validator: Option<jsonschema::Validator>,
}

/// 只读工具目录：启动后不再变化，按 Arc 共享
pub struct ToolCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries.get(name).map(|e| e.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .entries
            .iter()
            .map(|(name, entry)| ToolSpec {
                name: name.clone(),
                description: entry.tool.description().to_string(),
                parameters: entry.schema.clone(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// 校验工具名与参数
    pub fn validate(&self, name: &str, args: &Value) -> Result<(), ToolError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        if let Some(validator) = &entry.validator {
            let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
            if !errors.is_empty() {
                return Err(ToolError::InvalidArguments {
                    tool: name.to_string(),
                    message: errors.join("; "),
                });
            }
        }
        Ok(())
    }

    /// 工具声明的目标；未知工具返回 None
    pub fn target(&self, name: &str, args: &Value) -> Option<String> {
        self.entries.get(name).and_then(|e| e.tool.target(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use serde_json::json;

    fn catalog() -> ToolCatalog {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.freeze()
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let err = catalog().validate("nmap", &json!({})).unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nmap".to_string()));
    }

    #[test]
    fn test_schema_violation_rejected() {
        let err = catalog().validate("echo", &json!({"text": 42})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn test_valid_args_pass() {
        assert!(catalog().validate("echo", &json!({"text": "hi"})).is_ok());
    }

    #[test]
    fn test_specs_sorted_and_described() {
        let specs = catalog().specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
        assert!(specs[0].parameters.is_object());
    }
}
