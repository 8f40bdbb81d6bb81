//! Benchmarks for task storage and cycle throughput.
//!
//! Benchmarks cover:
//! - Inserting tasks into the SQLite and in-memory stores
//! - Reading the due list at different backlog sizes
//! - Claim and complete round trips
//! - A full cycle over a batch of instantly completing tasks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use agent_daemon::core::{
    AgentExecutor, CycleConfig, CycleExecutor, DaemonError, EventBroadcaster, ExecutionOutcome,
    ExecutionRequest, ExecutorRegistry, NewTask, ProgressSink, WakeReason,
};
use agent_daemon::infra::store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
use agent_daemon::util::clock::now;

use async_trait::async_trait;
use chrono::TimeDelta;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

struct InstantAgent;

#[async_trait]
impl AgentExecutor for InstantAgent {
    fn name(&self) -> &str {
        "instant"
    }

    async fn execute(
        &self,
        _request: ExecutionRequest,
        progress: ProgressSink,
    ) -> Result<ExecutionOutcome, DaemonError> {
        progress.agent_text("done");
        Ok(ExecutionOutcome::Completed {
            result: "ok".into(),
        })
    }
}

fn new_task(i: u64) -> NewTask {
    let task = NewTask::new(format!("task {i}"))
        .with_description("benchmark payload")
        .with_priority(i32::try_from(i % 10).unwrap_or_default());
    if i % 3 == 0 {
        task.with_due_at(now() + TimeDelta::hours(1))
    } else {
        task
    }
}

fn stores() -> Vec<(&'static str, Arc<dyn TaskStore>)> {
    vec![
        ("memory", Arc::new(InMemoryTaskStore::new())),
        ("sqlite", Arc::new(SqliteTaskStore::open_in_memory().unwrap())),
    ]
}

fn filled(backend: &str, size: u64) -> Arc<dyn TaskStore> {
    let store: Arc<dyn TaskStore> = match backend {
        "memory" => Arc::new(InMemoryTaskStore::new()),
        _ => Arc::new(SqliteTaskStore::open_in_memory().unwrap()),
    };
    for i in 0..size {
        store.add(new_task(i)).unwrap();
    }
    store
}

// ============================================================================
// Store Benchmarks
// ============================================================================

fn bench_store_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_add");
    group.throughput(Throughput::Elements(1));
    for (name, store) in stores() {
        let mut i = 0;
        group.bench_function(name, |b| {
            b.iter(|| {
                i += 1;
                black_box(store.add(new_task(i)).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_store_list_due(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_list_due");
    for backend in ["memory", "sqlite"] {
        for size in [100_u64, 1_000, 5_000] {
            let store = filled(backend, size);
            group.throughput(Throughput::Elements(size));
            group.bench_with_input(BenchmarkId::new(backend, size), &size, |b, _| {
                b.iter(|| black_box(store.list_due(now()).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_claim_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_claim_complete");
    for (name, store) in stores() {
        group.bench_function(name, |b| {
            b.iter(|| {
                let id = store.add(NewTask::new("claim me")).unwrap();
                assert!(store.claim(id).unwrap());
                black_box(store.complete(id, "ok").unwrap());
            });
        });
    }
    group.finish();
}

// ============================================================================
// Cycle Benchmarks
// ============================================================================

fn bench_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cycle_run");
    for size in [10_u64, 100] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
                for i in 0..size {
                    store.add(NewTask::new(format!("task {i}"))).unwrap();
                }
                let cycle = CycleExecutor::new(
                    Arc::clone(&store),
                    ExecutorRegistry::single(Arc::new(InstantAgent)),
                    EventBroadcaster::new(16),
                    CycleConfig {
                        max_concurrent_tasks: 8,
                        ..CycleConfig::default()
                    },
                );
                let (tx, _rx) = mpsc::unbounded_channel();
                black_box(
                    cycle
                        .run(WakeReason::Manual, &tx, &CancellationToken::new())
                        .await
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_store_add,
    bench_store_list_due,
    bench_claim_complete,
    bench_cycle
);
criterion_main!(benches);
