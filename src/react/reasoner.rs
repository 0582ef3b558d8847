//! 推理器：根据上下文提出下一步动作
//!
//! LlmReasoner 调用 LLM 并解析回复；回复中的 JSON 可以是纯 JSON，也可以包在 ```json 代码块里：
//! - `{"tool": "shell", "args": {...}}`：执行命令
//! - `{"complete": true, "summary": "..."}`：任务完成
//! - `{"delegate": {"goal": "...", "target": "..."}}`：拆分子任务

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Directive, ReasonerError};
use crate::llm::{LlmClient, Message};
use crate::react::AgentContext;
use crate::tools::{proposal_schema_json, ToolSpec};

/// 推理器提出的命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 推理器的一次提议
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Action(ToolCall),
    Complete { summary: Option<String> },
    Delegate(Directive),
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn propose(
        &self,
        context: &AgentContext,
        tools: &[ToolSpec],
    ) -> Result<Proposal, ReasonerError>;
}

#[derive(Deserialize)]
struct RawProposal {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    complete: Option<bool>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    delegate: Option<Directive>,
}

/// 从 LLM 文本中提取并解析提议
pub fn parse_proposal(output: &str) -> Result<Proposal, ReasonerError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start <= end {
            &trimmed[start..=end]
        } else {
            return Err(ReasonerError::Malformed(truncate(trimmed)));
        }
    } else {
        return Err(ReasonerError::Malformed(truncate(trimmed)));
    };

    let raw: RawProposal = serde_json::from_str(json_str)
        .map_err(|e| ReasonerError::Malformed(format!("{e}: {}", truncate(json_str))))?;

    if raw.complete == Some(true) {
        return Ok(Proposal::Complete {
            summary: raw.summary,
        });
    }
    if let Some(directive) = raw.delegate {
        return Ok(Proposal::Delegate(directive));
    }
    match raw.tool {
        Some(tool) if !tool.trim().is_empty() => Ok(Proposal::Action(ToolCall {
            tool: tool.trim().to_string(),
            args: raw.args.unwrap_or_else(|| Value::Object(Default::default())),
        })),
        _ => Err(ReasonerError::Malformed(format!(
            "no tool, completion or delegation in: {}",
            truncate(json_str)
        ))),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > 300 {
        format!("{}...", s.chars().take(300).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 基于 LLM 的推理器
pub struct LlmReasoner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmReasoner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::with_system_prompt(llm, DEFAULT_SYSTEM_PROMPT)
    }

    pub fn with_system_prompt(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn render_system(&self, tools: &[ToolSpec]) -> String {
        let mut out = self.system_prompt.clone();
        out.push_str("\n\nAvailable tools:\n");
        for spec in tools {
            out.push_str(&format!(
                "- {}: {}\n  parameters: {}\n",
                spec.name, spec.description, spec.parameters
            ));
        }
        out.push_str("\nReply with exactly one JSON object matching this schema:\n");
        out.push_str(&proposal_schema_json());
        out
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are one worker in a team of autonomous agents. \
Pick the single next command that moves the goal forward, split off a sub-task with \
\"delegate\", or declare the task complete. Do not repeat a command whose result you already have.";

#[async_trait]
impl Reasoner for LlmReasoner {
    async fn propose(
        &self,
        context: &AgentContext,
        tools: &[ToolSpec],
    ) -> Result<Proposal, ReasonerError> {
        let messages = vec![
            Message::system(self.render_system(tools)),
            Message::user(context.summary()),
        ];
        let reply = self.llm.complete(&messages).await?;
        parse_proposal(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskId;
    use crate::llm::{LlmError, MockLlmClient};
    use serde_json::json;

    #[test]
    fn test_parse_action() {
        let p = parse_proposal(r#"{"tool": "echo", "args": {"text": "hi"}}"#).unwrap();
        assert_eq!(
            p,
            Proposal::Action(ToolCall {
                tool: "echo".into(),
                args: json!({"text": "hi"}),
            })
        );
    }

    #[test]
    fn test_parse_fenced_complete() {
        let raw = "Done.\n```json\n{\"complete\": true, \"summary\": \"all ports mapped\"}\n```";
        let p = parse_proposal(raw).unwrap();
        assert_eq!(
            p,
            Proposal::Complete {
                summary: Some("all ports mapped".into())
            }
        );
    }

    #[test]
    fn test_parse_delegate() {
        let p = parse_proposal(r#"{"delegate": {"goal": "enumerate web", "target": "10.0.0.5:80"}}"#)
            .unwrap();
        match p {
            Proposal::Delegate(d) => {
                assert_eq!(d.goal, "enumerate web");
                assert_eq!(d.target.as_deref(), Some("10.0.0.5:80"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_proposal("I think we should scan"),
            Err(ReasonerError::Malformed(_))
        ));
        assert!(matches!(
            parse_proposal(r#"{"tool": ""}"#),
            Err(ReasonerError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_llm_reasoner_with_mock() {
        let reasoner = LlmReasoner::new(Arc::new(MockLlmClient));
        let ctx = AgentContext::new(TaskId::new(), Directive::new("scan"), 4);
        let p = reasoner.propose(&ctx, &[]).await.unwrap();
        assert!(matches!(p, Proposal::Complete { .. }));
    }

    struct FlakyLlm;

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            Err(LlmError::Network("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_network_error_is_transient() {
        let reasoner = LlmReasoner::new(Arc::new(FlakyLlm));
        let ctx = AgentContext::new(TaskId::new(), Directive::new("scan"), 4);
        let err = reasoner.propose(&ctx, &[]).await.unwrap_err();
        assert!(matches!(err, ReasonerError::Transient(_)));
    }
}
