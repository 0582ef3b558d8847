//! Mock LLM 客户端（用于测试与无 API 的本地运行）
//!
//! 不调用任何工具，直接宣告完成，summary 回显最后一条 User 消息的首行。

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.lines().next())
            .unwrap_or("(no input)");

        let reply = serde_json::json!({
            "complete": true,
            "summary": format!("Mock: {last_user}"),
        });
        Ok(reply.to_string())
    }
}
