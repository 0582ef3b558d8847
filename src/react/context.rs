//! Agent 上下文：指令、历史尝试、最近观察与反馈
//!
//! 每轮 Think 前由 Agent 循环重建 attempts（来自 Task Store），observations 与 feedback 在内存中累积，
//! 只保留最近 `max_observations` 条，避免 prompt 无限增长。

use std::collections::VecDeque;

use crate::core::{Attempt, Directive, TaskId};

/// 单条观察：某次命令的输出摘要，或一条结构化反馈
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Output { tool: String, origin: String, text: String },
    Feedback(String),
}

/// 推理器所见的上下文
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub task_id: TaskId,
    pub directive: Directive,
    pub iteration: u32,
    pub attempts: Vec<Attempt>,
    observations: VecDeque<Observation>,
    max_observations: usize,
}

/// 单条输出写入上下文时的最大字符数
const OUTPUT_PREVIEW_CHARS: usize = 2000;

impl AgentContext {
    pub fn new(task_id: TaskId, directive: Directive, max_observations: usize) -> Self {
        Self {
            task_id,
            directive,
            iteration: 0,
            attempts: Vec::new(),
            observations: VecDeque::new(),
            max_observations: max_observations.max(1),
        }
    }

    pub fn observe_output(&mut self, tool: &str, origin: &str, text: &str) {
        self.push(Observation::Output {
            tool: tool.to_string(),
            origin: origin.to_string(),
            text: truncate(text, OUTPUT_PREVIEW_CHARS),
        });
    }

    pub fn feedback(&mut self, message: impl Into<String>) {
        self.push(Observation::Feedback(message.into()));
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }

    fn push(&mut self, obs: Observation) {
        if self.observations.len() >= self.max_observations {
            self.observations.pop_front();
        }
        self.observations.push_back(obs);
    }

    /// 渲染为文本摘要，作为推理器的 user 消息
    pub fn summary(&self) -> String {
        let mut out = format!("Goal: {}\n", self.directive.goal);
        if let Some(target) = &self.directive.target {
            out.push_str(&format!("Target: {target}\n"));
        }
        if !self.directive.constraints.is_null() {
            out.push_str(&format!("Constraints: {}\n", self.directive.constraints));
        }
        out.push_str(&format!("Iteration: {}\n", self.iteration));

        if !self.attempts.is_empty() {
            out.push_str("\nPrevious attempts:\n");
            for a in &self.attempts {
                out.push_str(&format!(
                    "- {} [{}] target={} -> {}: {}\n",
                    a.tool,
                    a.fingerprint.short(),
                    a.target.as_deref().unwrap_or("-"),
                    a.outcome.as_str(),
                    a.reason
                ));
            }
        }

        if !self.observations.is_empty() {
            out.push_str("\nRecent observations:\n");
            for obs in &self.observations {
                match obs {
                    Observation::Output { tool, origin, text } => {
                        out.push_str(&format!("[{tool} ({origin})]\n{text}\n"));
                    }
                    Observation::Feedback(msg) => out.push_str(&format!("[feedback] {msg}\n")),
                }
            }
        }
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
