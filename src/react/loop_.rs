//! Agent 主循环（每个被认领的任务一个）
//!
//! Think -> Validate -> Guard -> Act (Hive Mind) -> Record -> 下一轮；
//! 推理器瞬时失败按退避重试，校验失败与工具错误写回上下文继续，重复动作 / 迭代上限 / 取消终止任务。
//! 取消是协作式的：每轮开头以及每个阻塞调用（推理器、Hive Mind、退避等待）都与取消信号竞争。
//! Task Store 的后端错误同样按退避重试，重试用尽后任务以 store-error 失败。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::fingerprint::digest;
use crate::core::{
    AgentError, AgentPhase, Attempt, AttemptOutcome, Directive, EventSink, Fingerprint, HiveEvent,
    HiveMind, RecoveryAction, RecoveryEngine, StoreError, Task, TaskId, TaskResult, TaskStatus,
    ToolError, WorkerId,
};
use crate::react::{guard, AgentContext, Proposal, Reasoner, ToolCall};
use crate::store::TaskStore;
use crate::tools::{ToolCatalog, ToolInvoker, ToolSpec};

/// Agent 循环参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// 迭代上限，到达后任务以 iteration-limit 失败
    pub max_iterations: u32,
    /// 无新信息时同一 fingerprint 的尝试次数超过该值，下一次提出即终止任务
    pub repeat_threshold: usize,
    pub tool_timeout: Duration,
    pub max_context_observations: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            repeat_threshold: 3,
            tool_timeout: Duration::from_secs(300),
            max_context_observations: 12,
        }
    }
}

/// Agent 循环的全部协作者；显式注入，没有全局状态
#[derive(Clone)]
pub struct AgentDeps {
    pub store: Arc<dyn TaskStore>,
    pub hive: Arc<HiveMind>,
    pub catalog: Arc<ToolCatalog>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub reasoner: Arc<dyn Reasoner>,
    pub events: Arc<dyn EventSink>,
    pub recovery: RecoveryEngine,
    pub settings: AgentSettings,
}

/// 循环结束时任务的实际终态
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
}

pub struct AgentLoop {
    deps: AgentDeps,
    task: Task,
    worker: WorkerId,
    cancel: CancellationToken,
    phase: AgentPhase,
    specs: Vec<ToolSpec>,
}

impl AgentLoop {
    pub fn new(deps: AgentDeps, task: Task, worker: WorkerId, cancel: CancellationToken) -> Self {
        let specs = deps.catalog.specs();
        Self {
            deps,
            task,
            worker,
            cancel,
            phase: AgentPhase::Initializing,
            specs,
        }
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// 运行到终态并写回 Task Store
    pub async fn run(mut self) -> Result<AgentOutcome, AgentError> {
        let mut ctx = AgentContext::new(
            self.task.id,
            self.task.directive.clone(),
            self.deps.settings.max_context_observations,
        );
        tracing::info!(task_id = %self.task.id, worker = %self.worker, goal = %self.task.directive.goal, "Agent loop started");

        let verdict = self.drive(&mut ctx).await;
        let iterations = ctx.iteration;
        let (phase, result) = match verdict {
            Ok(summary) => (
                AgentPhase::Completing,
                TaskResult::completed(summary, iterations),
            ),
            Err(AgentError::Cancelled) => (
                AgentPhase::Cancelled,
                TaskResult::cancelled("cancelled", iterations),
            ),
            Err(e) => {
                tracing::warn!(task_id = %self.task.id, error = %e, "Agent loop failed");
                (AgentPhase::Failed, TaskResult::failed(e.reason(), iterations))
            }
        };
        self.phase = phase;
        let status = phase.task_status().unwrap_or(TaskStatus::Failed);
        self.finish(status, result).await
    }

    async fn finish(&self, status: TaskStatus, result: TaskResult) -> Result<AgentOutcome, AgentError> {
        let task_id = self.task.id;
        let stored = result.clone();
        // 终态必须写回：这里的退避不响应任务取消
        let keep_going = CancellationToken::new();
        match self
            .with_store("update_status", &keep_going, move |store| {
                let stored = stored.clone();
                async move { store.update_status(task_id, status, Some(stored)).await }
            })
            .await
        {
            Ok(task) => {
                tracing::info!(task_id = %task_id, status = %status, reason = ?result.reason, "Task reached terminal state");
                self.deps.events.emit(HiveEvent::TaskTerminal {
                    task_id,
                    status,
                    reason: result.reason.clone(),
                });
                Ok(AgentOutcome {
                    task_id,
                    status: task.status,
                    result: task.result,
                })
            }
            // 已被别处（如停机超时）置为终态：以存储中的状态为准
            Err(AgentError::Store(StoreError::InvalidTransition { from, .. })) => {
                tracing::debug!(task_id = %task_id, current = %from, "Task already terminal, keeping stored state");
                let task = self
                    .with_store("get_task", &keep_going, move |store| async move { store.get_task(task_id).await })
                    .await?;
                Ok(AgentOutcome {
                    task_id,
                    status: task.status,
                    result: task.result,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// 调用 Task Store，后端错误按 RecoveryEngine 退避重试；退避等待可被取消打断
    async fn with_store<T, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(Arc<dyn TaskStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        loop {
            let err = match call(self.deps.store.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let message = err.to_string();
            match self.deps.recovery.handle_store(err, retries) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(
                        task_id = %self.task.id,
                        op,
                        error = %message,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Task store call failed, backing off"
                    );
                    retries += 1;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::Abort(e) => return Err(e),
                RecoveryAction::Feedback(msg) => return Err(AgentError::Store(StoreError::Backend(msg))),
            }
        }
    }

    /// Ok(summary) 表示推理器宣告完成
    async fn drive(&mut self, ctx: &mut AgentContext) -> Result<Option<String>, AgentError> {
        let max = self.deps.settings.max_iterations;
        loop {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if ctx.iteration >= max {
                return Err(AgentError::IterationLimit(max));
            }
            ctx.iteration += 1;
            let task_id = self.task.id;
            ctx.attempts = self
                .with_store("get_attempts", &self.cancel, move |store| async move { store.get_attempts(task_id).await })
                .await?;

            self.phase = AgentPhase::Thinking;
            let Some(proposal) = self.think(ctx).await? else {
                continue;
            };

            match proposal {
                Proposal::Complete { summary } => return Ok(summary),
                Proposal::Delegate(directive) => self.delegate(ctx, directive).await?,
                Proposal::Action(call) => self.act(ctx, call).await?,
            }
        }
    }

    /// None 表示回复格式错误，反馈已写入上下文
    async fn think(&self, ctx: &mut AgentContext) -> Result<Option<Proposal>, AgentError> {
        let mut retries = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.deps.reasoner.propose(ctx, &self.specs) => r,
            };
            let err = match result {
                Ok(p) => return Ok(Some(p)),
                Err(e) => e,
            };
            match self.deps.recovery.handle_reasoner(&err, retries) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(
                        task_id = %self.task.id,
                        error = %err,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Reasoner call failed, backing off"
                    );
                    retries += 1;
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::Feedback(msg) => {
                    tracing::debug!(task_id = %self.task.id, "Malformed proposal fed back to context");
                    ctx.feedback(msg);
                    return Ok(None);
                }
                RecoveryAction::Abort(e) => return Err(e),
            }
        }
    }

    fn check_repeats(&self, ctx: &AgentContext, fingerprint: &Fingerprint) -> Result<(), AgentError> {
        let threshold = self.deps.settings.repeat_threshold;
        if guard::trips(&ctx.attempts, fingerprint, threshold) {
            return Err(AgentError::RepeatedActionLimit {
                fingerprint: fingerprint.clone(),
                repeats: guard::stale_repeats(&ctx.attempts, fingerprint),
            });
        }
        Ok(())
    }

    async fn record(&self, attempt: Attempt) -> Result<(), AgentError> {
        self.with_store("append_attempt", &self.cancel, move |store| {
            let attempt = attempt.clone();
            async move { store.append_attempt(attempt).await }
        })
        .await
    }

    async fn act(&mut self, ctx: &mut AgentContext, call: ToolCall) -> Result<(), AgentError> {
        let task_id = self.task.id;
        let target = self
            .deps
            .catalog
            .target(&call.tool, &call.args)
            .or_else(|| self.task.directive.target.clone());
        let fingerprint = Fingerprint::compute(&call.tool, &call.args, target.as_deref());
        self.check_repeats(ctx, &fingerprint)?;

        if let Err(e) = self.deps.catalog.validate(&call.tool, &call.args) {
            let message = feedback_text(self.deps.recovery.handle_tool(&e))?;
            tracing::debug!(task_id = %task_id, tool = %call.tool, error = %e, "Proposal rejected by validation");
            self.record(
                Attempt::new(task_id, fingerprint, &call.tool, target, AttemptOutcome::Skipped, e.to_string())
                    .with_observation(digest(&message)),
            )
            .await?;
            ctx.feedback(message);
            return Ok(());
        }

        self.phase = AgentPhase::Acting;
        self.deps.events.emit(HiveEvent::CommandStarted {
            task_id,
            tool: call.tool.clone(),
            fingerprint: fingerprint.clone(),
        });

        let invoker = self.deps.invoker.clone();
        let tool = call.tool.clone();
        let args = call.args.clone();
        let limit = self.deps.settings.tool_timeout;
        let outcome = self
            .deps
            .hive
            .execute(&fingerprint, &self.worker, &self.cancel, move || async move {
                let out = invoker.run(&tool, args, limit).await?;
                if out.success {
                    Ok(out)
                } else {
                    let message = out.error.clone().unwrap_or_else(|| out.output.clone());
                    Err(ToolError::Failed { tool, message })
                }
            })
            .await;

        match outcome {
            Ok(shared) => {
                let observed = observation_text(&shared.output.output, &shared.output.data);
                let origin = shared.origin.as_str();
                self.record(
                    Attempt::new(task_id, fingerprint.clone(), &call.tool, target, AttemptOutcome::Success, origin)
                        .with_observation(digest(&observed)),
                )
                .await?;
                ctx.observe_output(&call.tool, origin, &observed);
                self.deps.events.emit(HiveEvent::CommandCompleted {
                    task_id,
                    tool: call.tool,
                    fingerprint,
                    origin: origin.to_string(),
                });
                Ok(())
            }
            Err(ToolError::Cancelled) => {
                self.record(Attempt::new(
                    task_id,
                    fingerprint,
                    &call.tool,
                    target,
                    AttemptOutcome::Skipped,
                    "cancelled",
                ))
                .await?;
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                tracing::info!(task_id = %task_id, tool = %call.tool, fingerprint = fingerprint.short(), error = %e, "Command failed");
                let message = feedback_text(self.deps.recovery.handle_tool(&e))?;
                self.record(
                    Attempt::new(
                        task_id,
                        fingerprint.clone(),
                        &call.tool,
                        target,
                        AttemptOutcome::Failure,
                        format!("{}: {}", e.kind(), e),
                    )
                    .with_observation(digest(&message)),
                )
                .await?;
                ctx.feedback(message);
                self.deps.events.emit(HiveEvent::CommandFailed {
                    task_id,
                    tool: call.tool,
                    fingerprint,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    /// 拆分子任务：插入 Pending 子任务，由轮询循环认领
    async fn delegate(&mut self, ctx: &mut AgentContext, directive: Directive) -> Result<(), AgentError> {
        let args = serde_json::to_value(&directive).unwrap_or(Value::Null);
        let fingerprint = Fingerprint::compute("delegate", &args, directive.target.as_deref());
        self.check_repeats(ctx, &fingerprint)?;

        let goal = directive.goal.clone();
        let target = directive.target.clone();
        let child = Task::child_of(&self.task, directive);
        let child_id = child.id;
        let inserted = self
            .with_store("insert_task", &self.cancel, move |store| {
                let child = child.clone();
                async move { store.insert_task(child).await }
            })
            .await;
        match inserted {
            Ok(()) => {}
            // 子任务 id 是新生成的：已存在只可能是前一次失败重试前其实已经写入
            Err(AgentError::Store(StoreError::AlreadyExists(id))) if id == child_id => {}
            Err(e) => return Err(e),
        }
        tracing::info!(task_id = %self.task.id, child_id = %child_id, goal = %goal, "Delegated sub-task");

        self.record(
            Attempt::new(
                self.task.id,
                fingerprint,
                "delegate",
                target,
                AttemptOutcome::Success,
                format!("delegated {child_id}"),
            )
            .with_observation(digest(&args.to_string())),
        )
        .await?;
        ctx.feedback(format!("delegated sub-task {child_id}: {goal}"));
        Ok(())
    }
}

fn feedback_text(action: RecoveryAction) -> Result<String, AgentError> {
    match action {
        RecoveryAction::Feedback(msg) => Ok(msg),
        RecoveryAction::Abort(e) => Err(e),
        RecoveryAction::RetryAfter(_) => Ok(String::new()),
    }
}

/// 输出文本 + 结构化数据，决定观察摘要
fn observation_text(output: &str, data: &serde_json::Map<String, Value>) -> String {
    if data.is_empty() {
        output.to_string()
    } else {
        format!("{output}\n{}", Value::Object(data.clone()))
    }
}
