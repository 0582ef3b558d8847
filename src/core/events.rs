//! 事件出口（Event Sink）
//!
//! 任务认领、命令开始、命令完成/失败、任务终态时发送事件。emit 永不阻塞调用方，
//! 投递失败只记录日志，不影响任务进度。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::{Fingerprint, TaskId, TaskStatus, WorkerId};

/// 核心事件（可序列化为 JSON 供宿主转发）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HiveEvent {
    TaskClaimed {
        task_id: TaskId,
        scan_id: TaskId,
        worker: WorkerId,
    },
    CommandStarted {
        task_id: TaskId,
        tool: String,
        fingerprint: Fingerprint,
    },
    CommandCompleted {
        task_id: TaskId,
        tool: String,
        fingerprint: Fingerprint,
        /// executed / joined / cached
        origin: String,
    },
    CommandFailed {
        task_id: TaskId,
        tool: String,
        fingerprint: Fingerprint,
        error: String,
    },
    TaskTerminal {
        task_id: TaskId,
        status: TaskStatus,
        reason: Option<String>,
    },
}

impl HiveEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskClaimed { .. } => "task_claimed",
            Self::CommandStarted { .. } => "command_started",
            Self::CommandCompleted { .. } => "command_completed",
            Self::CommandFailed { .. } => "command_failed",
            Self::TaskTerminal { .. } => "task_terminal",
        }
    }

    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TaskClaimed { task_id, .. }
            | Self::CommandStarted { task_id, .. }
            | Self::CommandCompleted { task_id, .. }
            | Self::CommandFailed { task_id, .. }
            | Self::TaskTerminal { task_id, .. } => *task_id,
        }
    }
}

/// 事件出口：实现必须是即发即忘的
pub trait EventSink: Send + Sync {
    fn emit(&self, event: HiveEvent);
}

/// 广播总线：多个订阅者各自接收；无订阅者时丢弃
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<HiveEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HiveEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: HiveEvent) {
        let kind = event.event_type();
        if self.sender.send(event).is_err() {
            tracing::debug!(event = kind, "No subscribers listening to event");
        }
    }
}

/// 把事件写入日志
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: HiveEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(event = event.event_type(), payload = %json, "hive event"),
            Err(e) => tracing::warn!(event = event.event_type(), "Failed to serialize event: {}", e),
        }
    }
}

#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: HiveEvent) {}
}
