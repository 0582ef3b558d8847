//! JSON Schema 生成（schemars）
//!
//! 工具参数 schema 由类型化的参数结构体生成；推理器回复格式的 schema 拼入 prompt，减少格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 推理器回复格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ProposalFormat {
    /// 要调用的工具名；与 complete / delegate 互斥
    pub tool: Option<String>,
    /// 工具参数，依工具不同而不同
    pub args: Option<serde_json::Map<String, Value>>,
    /// 为 true 时表示任务已完成
    pub complete: Option<bool>,
    /// 完成时的总结
    pub summary: Option<String>,
    /// 拆分出的子任务
    pub delegate: Option<DelegateFormat>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct DelegateFormat {
    pub goal: String,
    pub target: Option<String>,
}

/// 类型 T 的 JSON Schema；序列化失败时退化为「任意对象」
pub fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 回复格式 Schema 字符串，可拼入 system prompt
pub fn proposal_schema_json() -> String {
    let schema = schema_for!(ProposalFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
