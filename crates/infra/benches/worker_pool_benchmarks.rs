use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use budget_core::Context;
use budget_infra::WorkerPoolConfig;
use budget_infra::workers::{Job, WorkerPool, processor_fn};
use serde_json::json;

const JOBS: usize = 1_000;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("benchmark runtime")
}

async fn drive(workers: usize, jobs: usize) -> usize {
    let pool = WorkerPool::new(
        processor_fn(|job: Job| async move { Ok(job.payload) }),
        WorkerPoolConfig::default().with_workers(workers),
    );
    let mut results = pool.results().expect("fresh pool");
    pool.start().expect("fresh pool");

    let drain = tokio::spawn(async move {
        let mut count = 0;
        while results.recv().await.is_some() {
            count += 1;
        }
        count
    });

    let ctx = Context::with_timeout(std::time::Duration::from_secs(60));
    for n in 0..jobs {
        let _ = pool.submit(&ctx, Job::new("bench.echo", json!(n))).await;
    }
    pool.stop().await;
    drain.await.unwrap_or_default()
}

fn bench_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("worker_pool_throughput");
    group.throughput(Throughput::Elements(JOBS as u64));

    for workers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter(|| black_box(rt.block_on(drive(workers, JOBS))));
        });
    }

    group.finish();
}

fn bench_registry_routing(c: &mut Criterion) {
    use budget_infra::workers::{Processor, ProcessorRegistry};

    let rt = runtime();
    let registry = ProcessorRegistry::new()
        .with("budget.recalculate", processor_fn(|_job: Job| async { Ok(json!(1)) }))
        .with("report.*", processor_fn(|_job: Job| async { Ok(json!(2)) }))
        .with("*", processor_fn(|_job: Job| async { Ok(json!(3)) }));
    let jobs = [
        Job::new("budget.recalculate", json!({})),
        Job::new("report.monthly", json!({})),
        Job::new("other", json!({})),
    ];

    c.bench_function("processor_registry_route", |b| {
        b.iter(|| {
            rt.block_on(async {
                for job in &jobs {
                    black_box(registry.process(job).await.ok());
                }
            })
        });
    });
}

criterion_group!(benches, bench_throughput, bench_registry_routing);
criterion_main!(benches);
