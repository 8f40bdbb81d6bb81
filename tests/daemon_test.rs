//! Scheduler loop driven end to end through the daemon handle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use agent_daemon::builders::DaemonBuilder;
use agent_daemon::config::DaemonConfig;
use agent_daemon::core::{CancelOutcome, DaemonEvent, EventKind, NewTask, TaskStatus};
use agent_daemon::infra::store::{InMemoryTaskStore, TaskStore};
use agent_daemon::runtime::{Daemon, DaemonHandle};
use agent_daemon::util::clock::now;
use chrono::TimeDelta;
use common::{Script, ScriptedExecutor};
use futures::StreamExt;

fn daemon_with(exec: Arc<ScriptedExecutor>) -> (Daemon, Arc<dyn TaskStore>) {
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let config = DaemonConfig {
        check_interval_secs: 300,
        ..DaemonConfig::default()
    };
    let daemon = DaemonBuilder::new(config)
        .with_store(Arc::clone(&store))
        .with_executor(exec)
        .build()
        .unwrap();
    (daemon, store)
}

async fn wait_for_status(handle: &DaemonHandle, id: i64, status: TaskStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = handle.detail(id).unwrap().unwrap().task.status;
            if current == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status}"));
}

#[tokio::test]
async fn wake_launches_higher_priority_first() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Complete("done")));
    let (daemon, _store) = daemon_with(Arc::clone(&exec));
    let handle = daemon.handle();
    let a = handle.submit(NewTask::new("A").with_priority(1), false).unwrap().id;
    let b = handle.submit(NewTask::new("B").with_priority(5), false).unwrap().id;

    let mut events = Box::pin(handle.event_stream());
    let (handle, scheduler) = daemon.start();
    handle.wake();

    let mut seen: Vec<DaemonEvent> = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            let done = matches!(event.kind, EventKind::CycleEnd { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(seen[0].kind.name(), "connected");
    let starts: Vec<_> = seen
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TaskStart { task_id, cycle_id, .. } => Some((*task_id, *cycle_id)),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].0, b);
    assert_eq!(starts[1].0, a);
    assert_eq!(starts[0].1, starts[1].1, "both tasks should run in one cycle");

    handle.shutdown();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn loop_sleeps_until_nearest_due_task() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Complete("done")));
    let (daemon, _store) = daemon_with(exec);
    let handle = daemon.handle();
    let t0 = now();
    handle
        .submit(NewTask::new("soon").with_due_at(t0 + TimeDelta::seconds(10)), false)
        .unwrap();
    handle
        .submit(NewTask::new("later").with_due_at(t0 + TimeDelta::seconds(600)), false)
        .unwrap();

    let (handle, scheduler) = daemon.start();
    let mut watch = handle.scheduler().watch();
    let snapshot = watch
        .wait_for(|s| s.next_wake_at.is_some())
        .await
        .unwrap()
        .clone();
    let sleep = snapshot.next_wake_at.unwrap() - t0;
    assert!(
        sleep > TimeDelta::seconds(8) && sleep <= TimeDelta::seconds(11),
        "slept {sleep}"
    );

    handle.shutdown();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn earlier_task_shortens_current_sleep() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Complete("done")));
    let (daemon, _store) = daemon_with(exec);
    let (handle, scheduler) = daemon.start();
    let mut watch = handle.scheduler().watch();
    watch.wait_for(|s| s.next_wake_at.is_some()).await.unwrap();
    let first = handle.scheduler().snapshot().next_wake_at.unwrap();
    assert!(first - now() > TimeDelta::seconds(250));

    let due = now() + TimeDelta::seconds(5);
    handle
        .submit(NewTask::new("sooner").with_due_at(due), false)
        .unwrap();
    let resized = tokio::time::timeout(
        Duration::from_secs(2),
        watch.wait_for(|s| s.next_wake_at.is_some_and(|at| at < first)),
    )
    .await
    .unwrap()
    .unwrap()
    .next_wake_at
    .unwrap();
    assert!((resized - due).num_milliseconds().abs() < 1000);

    handle.shutdown();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_stops_a_running_task() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Hang));
    let (daemon, store) = daemon_with(exec);
    let (handle, scheduler) = daemon.start();
    let id = handle.submit(NewTask::new("forever"), true).unwrap().id;

    let mut watch = handle.scheduler().watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        watch.wait_for(|s| s.running_task_ids().contains(&id)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(handle.status().unwrap().running_task_ids, vec![id]);

    assert_eq!(handle.cancel(id).unwrap(), CancelOutcome::Signalled);
    wait_for_status(&handle, id, TaskStatus::Cancelled).await;
    assert!(store.get(id).unwrap().unwrap().cancel_requested);
    assert_eq!(
        handle.cancel(id).unwrap(),
        CancelOutcome::NotCancellable(TaskStatus::Cancelled)
    );

    handle.shutdown();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_pending_task_never_runs() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Complete("done")));
    let (daemon, _store) = daemon_with(Arc::clone(&exec));
    let handle = daemon.handle();
    let id = handle
        .submit(NewTask::new("skip me").with_due_at(now() + TimeDelta::hours(1)), false)
        .unwrap()
        .id;
    assert_eq!(handle.cancel(id).unwrap(), CancelOutcome::Cancelled);

    let (handle, scheduler) = daemon.start();
    handle.wake();
    let mut watch = handle.scheduler().watch();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| s.cycles_completed >= 1))
        .await
        .unwrap()
        .unwrap();
    assert!(exec.started().is_empty());
    assert_eq!(handle.status().unwrap().counts[&TaskStatus::Cancelled], 1);

    handle.shutdown();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn report_endpoints_write_once() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Complete("done")));
    let (daemon, _store) = daemon_with(exec);
    let handle = daemon.handle();
    let id = handle
        .submit(NewTask::new("manual").with_due_at(now() + TimeDelta::hours(1)), false)
        .unwrap()
        .id;

    assert!(handle.report_complete(id, "did it by hand").unwrap());
    assert!(!handle.report_fail(id, "too late").unwrap());
    assert!(handle.report_complete(9_999, "ghost").is_err());
    let detail = handle.detail(id).unwrap().unwrap();
    assert_eq!(detail.task.result.as_deref(), Some("did it by hand"));
}

#[tokio::test]
async fn reporting_a_pending_recurring_task_creates_its_successor() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Complete("done")));
    let (daemon, store) = daemon_with(exec);
    let handle = daemon.handle();
    let id = handle
        .submit(
            NewTask::new("weekly review")
                .with_rule("every_2h")
                .with_due_at(now() + TimeDelta::hours(1)),
            false,
        )
        .unwrap()
        .id;

    assert!(handle.report_complete(id, "reviewed early").unwrap());
    let successor = store.get(id).unwrap().unwrap().successor_id.expect("no successor");
    let next = store.get(successor).unwrap().unwrap();
    assert_eq!(next.status, TaskStatus::Pending);
    assert_eq!(next.recurring_rule.map(|r| r.to_string()).as_deref(), Some("every_2h"));

    // A late duplicate report neither writes nor spawns a second successor.
    assert!(!handle.report_fail(id, "late").unwrap());
    assert_eq!(handle.scheduled().unwrap().len(), 1);
}

#[tokio::test]
async fn execute_now_runs_one_task_without_a_cycle() {
    let exec = Arc::new(ScriptedExecutor::new(Script::Sleep(Duration::from_millis(200))));
    let (daemon, _store) = daemon_with(Arc::clone(&exec));
    let handle = daemon.handle();
    let later = now() + TimeDelta::hours(1);
    let target = handle.submit(NewTask::new("target").with_due_at(later), false).unwrap().id;
    let other = handle.submit(NewTask::new("other").with_due_at(later), false).unwrap().id;
    let (handle, scheduler) = daemon.start();

    let task = handle.execute_now(target).unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(matches!(
        handle.execute_now(target),
        Err(agent_daemon::DaemonError::InvalidTask(_) | agent_daemon::DaemonError::ClaimConflict(_))
    ));

    let mut watch = handle.scheduler().watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        watch.wait_for(|s| s.running_task_ids() == vec![target]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(handle.running()[0].title, "target");

    wait_for_status(&handle, target, TaskStatus::Completed).await;
    assert_eq!(exec.started(), vec!["target".to_string()]);
    assert_eq!(handle.detail(other).unwrap().unwrap().task.status, TaskStatus::Pending);
    assert_eq!(handle.status().unwrap().cycles_completed, 0);

    handle.shutdown();
    scheduler.await.unwrap().unwrap();
}
