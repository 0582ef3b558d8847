//! 构建器：从 AppConfig 组装 Orchestrator 的全部协作者
//!
//! 宿主进程与集成测试共用同一套初始化逻辑；任何一个协作者都可以被显式替换。

use std::sync::Arc;

use crate::config::{AppConfig, StoreBackend};
use crate::core::{
    EventSink, HiveMind, HiveMindSettings, Orchestrator, OrchestratorSettings, RecoveryEngine,
    StoreError, TracingEventSink,
};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::react::{AgentDeps, AgentSettings, LlmReasoner, Reasoner};
use crate::store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
use crate::tools::{EchoTool, RegistryInvoker, ShellTool, ToolCatalog, ToolInvoker, ToolRegistry};

pub struct HiveBuilder {
    config: AppConfig,
    store: Option<Arc<dyn TaskStore>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    invoker: Option<Arc<dyn ToolInvoker>>,
    events: Option<Arc<dyn EventSink>>,
    registry: Option<ToolRegistry>,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            reasoner: None,
            invoker: None,
            events: None,
            registry: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// 替换调用器（工具目录仍用于校验）
    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 内置工具：echo、shell（白名单来自配置）
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(ShellTool::new(
            self.config.tools.shell.allowed_commands.clone(),
        ));
        tools
    }

    /// 有 API Key 时用 OpenAI 兼容端点，否则退回 Mock
    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        let llm = &self.config.llm;
        match std::env::var(&llm.api_key_env) {
            Ok(key) if !key.is_empty() => {
                tracing::info!(model = %llm.model, "Using OpenAI-compatible LLM");
                Arc::new(OpenAiClient::new(llm.base_url.as_deref(), &llm.model, Some(&key)))
            }
            _ => {
                tracing::warn!(env = %llm.api_key_env, "No API key set, using Mock LLM");
                Arc::new(MockLlmClient)
            }
        }
    }

    pub async fn build_store(&self) -> Result<Arc<dyn TaskStore>, StoreError> {
        match self.config.store.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
            StoreBackend::Sqlite => {
                tracing::info!(path = %self.config.store.path.display(), "Opening SQLite task store");
                Ok(Arc::new(SqliteTaskStore::connect(&self.config.store.path).await?))
            }
        }
    }

    pub async fn build(mut self) -> Result<Orchestrator, StoreError> {
        let store: Arc<dyn TaskStore> = match self.store.take() {
            Some(s) => s,
            None => self.build_store().await?,
        };
        let reasoner: Arc<dyn Reasoner> = match self.reasoner.take() {
            Some(r) => r,
            None => Arc::new(LlmReasoner::new(self.build_llm())),
        };
        let registry = match self.registry.take() {
            Some(r) => r,
            None => self.build_tool_registry(),
        };
        let catalog: Arc<ToolCatalog> = Arc::new(registry.freeze());
        let invoker = self
            .invoker
            .take()
            .unwrap_or_else(|| Arc::new(RegistryInvoker::new(catalog.clone())));
        let events = self
            .events
            .take()
            .unwrap_or_else(|| Arc::new(TracingEventSink));

        let cfg = &self.config;
        let recovery = RecoveryEngine::new(
            cfg.agent.reasoner_retries,
            std::time::Duration::from_millis(cfg.agent.reasoner_backoff_ms),
        );
        let deps = AgentDeps {
            store,
            hive: Arc::new(HiveMind::new(HiveMindSettings::from(cfg))),
            catalog,
            invoker,
            reasoner,
            events,
            recovery,
            settings: AgentSettings::from(cfg),
        };
        tracing::info!(tools = ?deps.catalog.tool_names(), "Hive assembled");
        Ok(Orchestrator::new(deps, OrchestratorSettings::from(cfg)))
    }
}
