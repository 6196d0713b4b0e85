use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use carpipe_core::{ActorId, RetryPolicy, TaskId, TraceContext};
use carpipe_infra::command_dispatcher::PipelineCommands;
use carpipe_infra::dlq::InMemoryDeadLetters;
use carpipe_infra::idempotency::InMemoryIdempotencyStore;
use carpipe_infra::integrations::IntegrationRegistry;
use carpipe_infra::jobs::{InMemoryJobQueue, JobKind, JobQueue, NewJob};
use carpipe_infra::pipeline::{InMemoryPipelineStates, InMemoryTaskOutputs, InMemoryTaskRegistry};
use carpipe_infra::reliability::{JobHandler, ReliabilityHandler, WorkError};
use carpipe_infra::workers::PipelineWorker;

fn bench_claim_ack_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_ack_throughput");

    for depth in [1usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_claim_ack", depth), depth, |b, &depth| {
            b.iter(|| {
                let queue = InMemoryJobQueue::new();
                for _ in 0..depth {
                    queue.enqueue(NewJob::advance(&TaskId::generate())).unwrap();
                }
                while let Some(job) = queue.claim_next().unwrap() {
                    queue.mark_succeeded(black_box(&job.job_id)).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_reliability_handler(c: &mut Criterion) {
    let mut group = c.benchmark_group("reliability_handler");
    group.throughput(Throughput::Elements(1));

    let noop = |_: &carpipe_infra::jobs::Job, _: &TraceContext| -> Result<(), WorkError> { Ok(()) };

    group.bench_function("process_effectful_job", |b| {
        let queue = InMemoryJobQueue::arc();
        let handler = ReliabilityHandler::new(
            queue.clone(),
            InMemoryIdempotencyStore::arc(),
            InMemoryDeadLetters::arc(),
            RetryPolicy::default(),
        );
        let mut n = 0u64;

        b.iter(|| {
            n += 1;
            queue
                .enqueue(NewJob::new(JobKind::Photos, "card", n.to_string()))
                .unwrap();
            let claimed = queue.claim_next().unwrap().unwrap();
            black_box(handler.process(&claimed, &noop as &dyn JobHandler).unwrap());
        });
    });

    group.finish();
}

fn bench_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_pipeline");
    group.throughput(Throughput::Elements(5));

    group.bench_function("create_and_drain_task", |b| {
        let queue = InMemoryJobQueue::arc();
        let commands = PipelineCommands::new(
            InMemoryPipelineStates::arc(),
            InMemoryTaskOutputs::arc(),
            InMemoryTaskRegistry::arc(),
            queue.clone(),
            IntegrationRegistry::succeeding(),
        );
        let worker = PipelineWorker::new(
            commands.clone(),
            ReliabilityHandler::new(
                queue,
                InMemoryIdempotencyStore::arc(),
                InMemoryDeadLetters::arc(),
                RetryPolicy::default(),
            ),
        );
        let actor = ActorId::new("bench").unwrap();
        let mut n = 0u64;

        b.iter(|| {
            n += 1;
            commands
                .create_task(&actor, &format!("listing-{n}"), &TraceContext::new())
                .unwrap();
            black_box(worker.run_until_idle().unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_ack_throughput,
    bench_reliability_handler,
    bench_full_pipeline
);
criterion_main!(benches);
