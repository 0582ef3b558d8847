//! Orchestrator 集成测试：认领、并发上限、去重、级联取消、监督与停机

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use hive::core::{
    AttemptOutcome, BroadcastEventSink, Directive, StartupError, Task, TaskStatus, WorkerId,
};
use hive::react::{AgentContext, Proposal};
use hive::store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};

#[tokio::test]
async fn test_two_agents_share_one_scan_execution() {
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(2),
        Arc::new(InMemoryTaskStore::new()),
        scan_once_reasoner(),
        scan_registry(counter.clone(), Duration::from_millis(300)),
    )
    .await;

    let a = orch.start_scan(Directive::new("recon a").with_target("10.0.0.5")).await.unwrap();
    let b = orch.start_scan(Directive::new("recon b").with_target("10.0.0.5")).await.unwrap();

    assert_eq!(wait_terminal(&orch, a).await.status, TaskStatus::Completed);
    assert_eq!(wait_terminal(&orch, b).await.status, TaskStatus::Completed);
    assert_eq!(counter.runs(), 1);

    let first = orch.store().get_attempts(a).await.unwrap();
    let second = orch.store().get_attempts(b).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].fingerprint, second[0].fingerprint);
    assert_eq!(first[0].outcome, AttemptOutcome::Success);
    assert_eq!(second[0].outcome, AttemptOutcome::Success);

    let origins = [first[0].reason.as_str(), second[0].reason.as_str()];
    assert_eq!(origins.iter().filter(|o| **o == "executed").count(), 1);
    assert!(origins.iter().all(|o| ["executed", "joined", "cached"].contains(o)));

    assert_eq!(orch.stop().await.abandoned, 0);
}

#[tokio::test]
async fn test_live_workers_never_exceed_ceiling() {
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(2),
        Arc::new(InMemoryTaskStore::new()),
        scan_once_reasoner(),
        scan_registry(counter.clone(), Duration::from_millis(100)),
    )
    .await;

    let mut ids = Vec::new();
    for i in 0..6 {
        let directive = Directive::new(format!("scan host {i}")).with_target(format!("10.0.1.{i}"));
        ids.push(orch.start_scan(directive).await.unwrap());
    }

    let mut peak = 0;
    for _ in 0..500 {
        peak = peak.max(orch.live_count());
        let mut done = 0;
        for id in &ids {
            if orch.store().get_task(*id).await.unwrap().is_terminal() {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for id in &ids {
        assert_eq!(wait_terminal(&orch, *id).await.status, TaskStatus::Completed);
    }
    assert!(peak <= 2, "observed {peak} live workers");
    assert!(counter.max_active() <= 2);
    assert_eq!(counter.runs(), 6);
    orch.stop().await;
}

#[tokio::test]
async fn test_stop_scan_cancels_whole_tree() {
    let counter = Arc::new(RunCounter::default());
    let reasoner = Arc::new(FnReasoner(|ctx: &AgentContext| -> Proposal {
        if ctx.directive.goal == "root" {
            match ctx.attempts.len() {
                0 => Proposal::Delegate(Directive::new("child a").with_target("10.0.2.1")),
                1 => Proposal::Delegate(Directive::new("child b").with_target("10.0.2.2")),
                _ => scan("10.0.2.0"),
            }
        } else {
            scan(ctx.directive.target.as_deref().unwrap_or("10.0.2.9"))
        }
    }));
    let orch = orchestrator(
        fast_config(4),
        Arc::new(InMemoryTaskStore::new()),
        reasoner,
        scan_registry(counter.clone(), Duration::from_secs(3)),
    )
    .await;

    let root = orch.start_scan(Directive::new("root")).await.unwrap();
    wait_until(|| counter.active() == 3).await;

    let affected = orch.stop_scan(root).await.unwrap();
    assert_eq!(affected, 3);

    let tree = orch.store().descendants(root).await.unwrap();
    assert_eq!(tree.len(), 3);
    for task in &tree {
        let task = wait_terminal(&orch, task.id).await;
        assert_eq!(task.status, TaskStatus::Cancelled, "task {}", task.id);
    }

    let runs = counter.runs();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.runs(), runs);
    wait_until(|| orch.live_count() == 0).await;
    orch.stop().await;
}

#[tokio::test]
async fn test_stop_scan_cancels_pending_children() {
    let counter = Arc::new(RunCounter::default());
    let store = Arc::new(InMemoryTaskStore::new());
    let orch = orchestrator(
        fast_config(1),
        store.clone(),
        scan_once_reasoner(),
        scan_registry(counter, Duration::from_millis(10)),
    )
    .await;

    // 轮询循环未启动，子任务停留在 Pending
    let root = Task::root(Directive::new("root"));
    let child = Task::child_of(&root, Directive::new("child"));
    let (root_id, child_id) = (root.id, child.id);
    store.insert_task(root).await.unwrap();
    store.insert_task(child).await.unwrap();

    assert_eq!(orch.stop_scan(root_id).await.unwrap(), 2);
    for id in [root_id, child_id] {
        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.result.unwrap().reason.as_deref(), Some("scan-cancelled"));
    }
}

#[tokio::test]
async fn test_worker_panic_is_isolated() {
    let counter = Arc::new(RunCounter::default());
    let reasoner = Arc::new(FnReasoner(|ctx: &AgentContext| -> Proposal {
        if ctx.directive.goal == "explode" {
            panic!("reasoner blew up");
        }
        if ctx.attempts.is_empty() {
            scan(ctx.directive.target.as_deref().unwrap_or("10.0.3.1"))
        } else {
            complete()
        }
    }));
    let orch = orchestrator(
        fast_config(2),
        Arc::new(InMemoryTaskStore::new()),
        reasoner,
        scan_registry(counter, Duration::from_millis(20)),
    )
    .await;

    let bad = orch.start_scan(Directive::new("explode")).await.unwrap();
    let good = orch.start_scan(Directive::new("fine").with_target("10.0.3.2")).await.unwrap();

    let bad = wait_terminal(&orch, bad).await;
    assert_eq!(bad.status, TaskStatus::Failed);
    let reason = bad.result.unwrap().reason.unwrap();
    assert!(reason.starts_with("worker-panic"), "reason: {reason}");
    assert!(reason.contains("reasoner blew up"));

    assert_eq!(wait_terminal(&orch, good).await.status, TaskStatus::Completed);

    // 轮询循环仍在工作
    let later = orch.start_scan(Directive::new("later").with_target("10.0.3.3")).await.unwrap();
    assert_eq!(wait_terminal(&orch, later).await.status, TaskStatus::Completed);
    orch.stop().await;
}

#[tokio::test]
async fn test_repeated_command_fails_task() {
    let counter = Arc::new(RunCounter::default());
    let reasoner = Arc::new(FnReasoner(|_: &AgentContext| scan("10.0.4.1")));
    let orch = orchestrator(
        fast_config(1),
        Arc::new(InMemoryTaskStore::new()),
        reasoner,
        scan_registry(counter.clone(), Duration::from_millis(10)),
    )
    .await;

    let id = orch.start_scan(Directive::new("loop forever")).await.unwrap();
    let task = wait_terminal(&orch, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.result.unwrap().reason.as_deref(), Some("repeated-action-limit"));
    // 之后的重复都命中缓存
    assert_eq!(counter.runs(), 1);
    orch.stop().await;
}

#[tokio::test]
async fn test_start_fails_when_store_unreachable() {
    let store = FlakyStore::new();
    store.ping_down.store(true, Ordering::SeqCst);
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(1),
        Arc::new(store),
        scan_once_reasoner(),
        scan_registry(counter, Duration::from_millis(10)),
    )
    .await;

    assert!(matches!(orch.start().await, Err(StartupError::StoreUnreachable(_))));
    assert!(!orch.is_running().await);
}

#[tokio::test]
async fn test_poll_loop_survives_store_errors() {
    let store = Arc::new(FlakyStore::new().with_failing_claims(3));
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(1),
        store.clone(),
        scan_once_reasoner(),
        scan_registry(counter, Duration::from_millis(10)),
    )
    .await;

    let id = orch.start_scan(Directive::new("eventually")).await.unwrap();
    assert_eq!(wait_terminal(&orch, id).await.status, TaskStatus::Completed);
    assert!(store.claim_calls.load(Ordering::SeqCst) >= 4);
    orch.stop().await;
}

#[tokio::test]
async fn test_store_hiccup_does_not_fail_task() {
    let store = Arc::new(FlakyStore::new().with_failing_attempt_reads(2));
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(1),
        store.clone(),
        scan_once_reasoner(),
        scan_registry(counter.clone(), Duration::from_millis(10)),
    )
    .await;

    let id = orch.start_scan(Directive::new("blip").with_target("10.0.0.9")).await.unwrap();
    let task = wait_terminal(&orch, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(store.failing_attempt_reads.load(Ordering::SeqCst), 0);
    assert_eq!(counter.runs(), 1);
    orch.stop().await;
}

#[tokio::test]
async fn test_expired_results_are_purged_while_running() {
    let counter = Arc::new(RunCounter::default());
    let mut cfg = fast_config(1);
    cfg.hive_mind.result_ttl_secs = 0;
    let orch = orchestrator(
        cfg,
        Arc::new(InMemoryTaskStore::new()),
        scan_once_reasoner(),
        scan_registry(counter.clone(), Duration::from_millis(10)),
    )
    .await;

    let id = orch.start_scan(Directive::new("short lived").with_target("10.0.7.1")).await.unwrap();
    assert_eq!(wait_terminal(&orch, id).await.status, TaskStatus::Completed);
    assert_eq!(counter.runs(), 1);
    wait_until(|| orch.hive().tracked() == 0).await;
    orch.stop().await;
}

#[tokio::test]
async fn test_stop_abandons_stragglers() {
    let store = Arc::new(FlakyStore::new().with_slow_attempts(Duration::from_secs(5)));
    let counter = Arc::new(RunCounter::default());
    let mut cfg = fast_config(1);
    cfg.orchestrator.shutdown_grace_secs = 0;
    let orch = orchestrator(
        cfg,
        store.clone(),
        scan_once_reasoner(),
        scan_registry(counter, Duration::from_millis(10)),
    )
    .await;

    let id = orch.start_scan(Directive::new("stuck")).await.unwrap();
    wait_until(|| orch.live_count() == 1).await;

    let report = orch.stop().await;
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.finished, 0);
    assert_eq!(orch.live_count(), 0);

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.result.unwrap().reason.as_deref(), Some("shutdown-timeout"));
}

#[tokio::test]
async fn test_operator_retry_recovers_orphaned_task() {
    let store = Arc::new(InMemoryTaskStore::new());
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(1),
        store.clone(),
        scan_once_reasoner(),
        scan_registry(counter, Duration::from_millis(10)),
    )
    .await;

    // 被已退出的进程认领后遗留的 Running 任务
    let task = Task::root(Directive::new("orphan"));
    let id = task.id;
    store.insert_task(task).await.unwrap();
    store.claim_pending(1, &WorkerId::new("dead-worker")).await.unwrap();
    assert_eq!(store.get_task(id).await.unwrap().status, TaskStatus::Running);

    let reset = orch.retry_task(id).await.unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert!(reset.assigned_worker.is_none());

    orch.start().await.unwrap();
    assert_eq!(wait_terminal(&orch, id).await.status, TaskStatus::Completed);
    orch.stop().await;
}

#[tokio::test]
async fn test_events_follow_task_lifecycle() {
    let sink = Arc::new(BroadcastEventSink::new(64));
    let mut rx = sink.subscribe();
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator_with_events(
        fast_config(1),
        scan_once_reasoner(),
        scan_registry(counter, Duration::from_millis(10)),
        sink,
    )
    .await;

    let id = orch.start_scan(Directive::new("watch me")).await.unwrap();
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task_id(), id);
        let kind = event.event_type();
        seen.push(kind);
        if kind == "task_terminal" {
            break;
        }
    }
    assert_eq!(
        seen,
        vec!["task_claimed", "command_started", "command_completed", "task_terminal"]
    );
    orch.stop().await;
}

#[tokio::test]
async fn test_scan_on_sqlite_store() {
    let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
    let counter = Arc::new(RunCounter::default());
    let orch = orchestrator(
        fast_config(2),
        store.clone(),
        scan_once_reasoner(),
        scan_registry(counter.clone(), Duration::from_millis(10)),
    )
    .await;

    let a = orch.start_scan(Directive::new("db a").with_target("10.0.5.1")).await.unwrap();
    let b = orch.start_scan(Directive::new("db b").with_target("10.0.5.2")).await.unwrap();
    for id in [a, b] {
        let task = wait_terminal(&orch, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(store.get_attempts(id).await.unwrap().len(), 1);
    }

    let completed = store.list_tasks(Some(TaskStatus::Completed)).await.unwrap();
    let ids: HashSet<_> = completed.iter().map(|t| t.id).collect();
    assert!(ids.contains(&a) && ids.contains(&b));
    assert_eq!(counter.runs(), 2);
    orch.stop().await;
}
