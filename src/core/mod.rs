//! 核心层：任务模型、错误与恢复、Hive Mind 去重、事件出口、编排与停机

pub mod builder;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod hive_mind;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod task;
pub mod worker;

pub use builder::HiveBuilder;
pub use error::{
    AgentError, OrchestratorError, ReasonerError, RecoveryAction, StartupError, StoreError,
    ToolError,
};
pub use events::{BroadcastEventSink, EventSink, HiveEvent, NullEventSink, TracingEventSink};
pub use fingerprint::Fingerprint;
pub use hive_mind::{
    ExecutionSnapshot, ExecutionState, HiveMind, HiveMindSettings, Origin, SharedOutcome,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings, StopReport};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    OrchestratorCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use state::AgentPhase;
pub use task::{
    Attempt, AttemptOutcome, Directive, Task, TaskId, TaskResult, TaskStatus, WorkerId,
};
pub use worker::{WorkerHandle, WorkerSummary};
