//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_CONCURRENCY=8`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{HiveMindSettings, OrchestratorSettings};
use crate::react::AgentSettings;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub agent: AgentSection,
    pub hive_mind: HiveMindSection,
    pub store: StoreSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
}

/// [orchestrator] 段：轮询间隔、并发上限、存储退避、停机宽限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub poll_interval_ms: u64,
    pub max_concurrency: usize,
    pub store_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_concurrency: 5,
            store_backoff_ms: 5000,
            shutdown_grace_secs: 30,
        }
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    /// 同一命令在无新信息时的尝试次数超过该值即终止任务
    pub repeat_threshold: usize,
    pub tool_timeout_secs: u64,
    pub reasoner_retries: u32,
    /// 首次退避，之后每次翻倍
    pub reasoner_backoff_ms: u64,
    pub max_context_observations: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            repeat_threshold: 3,
            tool_timeout_secs: 300,
            reasoner_retries: 3,
            reasoner_backoff_ms: 1000,
            max_context_observations: 12,
        }
    }
}

/// [hive_mind] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HiveMindSection {
    /// 缓存结果有效期（秒）
    pub result_ttl_secs: u64,
}

impl Default for HiveMindSection {
    fn default() -> Self {
        Self {
            result_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [store] 段：后端选择与 SQLite 文件路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("hive.db"),
        }
    }
}

/// [llm] 段：OpenAI 兼容端点；API Key 从 `api_key_env` 指定的环境变量读取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    pub shell: ShellSection,
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["echo", "ls", "cat", "grep", "head", "tail", "wc", "dig", "ping"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(cfg: &AppConfig) -> Self {
        let o = &cfg.orchestrator;
        Self {
            poll_interval: Duration::from_millis(o.poll_interval_ms.max(1)),
            max_concurrency: o.max_concurrency.max(1),
            store_backoff: Duration::from_millis(o.store_backoff_ms),
            shutdown_grace: Duration::from_secs(o.shutdown_grace_secs),
        }
    }
}

impl From<&AppConfig> for AgentSettings {
    fn from(cfg: &AppConfig) -> Self {
        let a = &cfg.agent;
        Self {
            max_iterations: a.max_iterations.max(1),
            repeat_threshold: a.repeat_threshold.max(1),
            tool_timeout: Duration::from_secs(a.tool_timeout_secs.max(1)),
            max_context_observations: a.max_context_observations,
        }
    }
}

impl From<&AppConfig> for HiveMindSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            result_ttl: Duration::from_secs(cfg.hive_mind.result_ttl_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
