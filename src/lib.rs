//! Hive - 多智能体任务调度与命令去重核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、Hive Mind 去重、编排器、错误恢复、停机
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化（仅宿主进程调用）
//! - **react**: 推理器、上下文、防循环守卫与 Agent 主循环
//! - **store**: Task Store（内存 / SQLite）
//! - **tools**: 工具注册、参数校验、调用器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;

pub use crate::core::{Directive, HiveBuilder, HiveMind, Orchestrator, TaskId, TaskStatus};
