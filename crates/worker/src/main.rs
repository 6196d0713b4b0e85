use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Map};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use carpipe_core::{IntegrationResult, PipelineStage, TaskId, TraceContext};
use carpipe_infra::command_dispatcher::PipelineCommands;
use carpipe_infra::config::WorkerConfig;
use carpipe_infra::db::{ensure_schema, Db};
use carpipe_infra::dlq::{DeadLetterWriter, FileDeadLetterWriter, InMemoryDeadLetters};
use carpipe_infra::idempotency::{
    IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
use carpipe_infra::integrations::IntegrationRegistry;
use carpipe_infra::jobs::{InMemoryJobQueue, JobQueue, PostgresJobQueue};
use carpipe_infra::pipeline::{
    InMemoryPipelineStates, InMemoryTaskOutputs, InMemoryTaskRegistry, PipelineStateRepository,
    PostgresPipelineStateRepository, PostgresTaskOutputStore, PostgresTaskRegistry, TaskOutputStore,
    TaskRegistry,
};
use carpipe_infra::reliability::ReliabilityHandler;
use carpipe_infra::workers::{PipelineWorker, PipelineWorkerConfig};
use carpipe_observability::LogFormat;

struct Stores {
    queue: Arc<dyn JobQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    states: Arc<dyn PipelineStateRepository>,
    outputs: Arc<dyn TaskOutputStore>,
    tasks: Arc<dyn TaskRegistry>,
}

fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let format: LogFormat = config
        .log_format
        .parse()
        .map_err(anyhow::Error::msg)
        .context("invalid LOG_FORMAT")?;
    carpipe_observability::init(format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let stores = match &config.database_url {
        Some(url) => postgres_stores(&config, url, &runtime)?,
        None => {
            warn!("DATABASE_URL not set; using in-memory stores");
            in_memory_stores(&config)
        }
    };

    let dlq: Arc<dyn DeadLetterWriter> = match &config.dlq_path {
        Some(path) => Arc::new(FileDeadLetterWriter::new(path)),
        None => {
            warn!("CARPIPE_DLQ_PATH not set; dead letters are kept in memory only");
            InMemoryDeadLetters::arc()
        }
    };

    let commands = PipelineCommands::new(
        stores.states,
        stores.outputs,
        stores.tasks,
        stores.queue.clone(),
        pass_through_integrations(),
    );
    let reliability =
        ReliabilityHandler::new(stores.queue, stores.idempotency, dlq, config.retry_policy())
            .with_heartbeat_interval(config.heartbeat_interval());
    let worker = PipelineWorker::new(commands, reliability);

    let handles = (0..config.workers)
        .map(|i| {
            worker
                .clone()
                .spawn(
                    PipelineWorkerConfig::default()
                        .with_name(format!("carpipe-worker-{i}"))
                        .with_poll_interval(config.poll_interval),
                )
                .context("failed to spawn worker thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    info!(workers = config.workers, "carpipe worker running");
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;

    info!("shutting down");
    for handle in handles {
        let stats = handle.stats();
        handle.shutdown();
        info!(?stats, "worker stopped");
    }
    Ok(())
}

fn postgres_stores(
    config: &WorkerConfig,
    url: &str,
    runtime: &tokio::runtime::Runtime,
) -> anyhow::Result<Stores> {
    let pool = runtime
        .block_on(async {
            let pool = PgPoolOptions::new()
                .max_connections(
                    u32::try_from(config.workers)
                        .unwrap_or(u32::MAX)
                        .saturating_add(2),
                )
                .connect(url)
                .await?;
            ensure_schema(&pool).await?;
            Ok::<_, sqlx::Error>(pool)
        })
        .context("failed to prepare Postgres")?;
    info!("connected to Postgres");

    let db = Db::new(pool, runtime.handle().clone());
    Ok(Stores {
        queue: Arc::new(
            PostgresJobQueue::new(db.clone())
                .with_policy(config.retry_policy())
                .with_lease(config.lease()),
        ),
        idempotency: Arc::new(
            PostgresIdempotencyStore::new(db.clone()).with_in_flight_ttl(config.in_flight_ttl()),
        ),
        states: Arc::new(PostgresPipelineStateRepository::new(db.clone())),
        outputs: Arc::new(PostgresTaskOutputStore::new(db.clone())),
        tasks: Arc::new(PostgresTaskRegistry::new(db)),
    })
}

fn in_memory_stores(config: &WorkerConfig) -> Stores {
    Stores {
        queue: Arc::new(
            InMemoryJobQueue::new()
                .with_policy(config.retry_policy())
                .with_lease(config.lease()),
        ),
        idempotency: Arc::new(
            InMemoryIdempotencyStore::new().with_in_flight_ttl(config.in_flight_ttl()),
        ),
        states: InMemoryPipelineStates::arc(),
        outputs: InMemoryTaskOutputs::arc(),
        tasks: InMemoryTaskRegistry::arc(),
    }
}

/// Stages without an external adapter wired in succeed and record which
/// stage ran.
fn pass_through_integrations() -> IntegrationRegistry {
    PipelineStage::ALL
        .into_iter()
        .fold(IntegrationRegistry::new(), |registry, stage| {
            registry.with(stage, move |task_id: &TaskId, trace: &TraceContext| {
                info!(
                    task_id = %task_id,
                    stage = %stage,
                    trace_id = %trace,
                    "pass-through integration"
                );
                let mut payload = Map::new();
                payload.insert("stage".to_string(), json!(stage.as_str()));
                payload.insert("adapter".to_string(), json!("pass_through"));
                IntegrationResult::succeeded(payload)
            })
        })
}
