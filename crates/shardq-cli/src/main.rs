use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use shardq_core::app::{EngineBuilder, PartitionScope, PartitionStatus};
use shardq_core::config::EngineConfig;
use shardq_core::domain::{
    ExecResult, NewTask, ReindexPayload, StateCounts, TaskError, TaskKind, TaskPayload,
};
use shardq_core::observability::{LogFormat, init_logging};
use shardq_core::partition::PartitionScheme;
use shardq_core::worker::{Handler, TaskContext};

#[derive(Debug, Parser)]
#[command(name = "shardq", about = "Partitioned task queue demo runner")]
struct Cli {
    /// JSON config file; defaults apply to anything it leaves out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueues sample reindex tasks and runs until the queue drains.
    Run {
        #[arg(long, default_value_t = 20)]
        tasks: u32,

        /// Each task fails this many times before succeeding.
        #[arg(long, default_value_t = 1)]
        fail_first: u32,

        #[arg(long, default_value_t = 2)]
        dispatchers: usize,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Prints the effective config as JSON.
    Config,
}

/// Fails the first `fail_first` attempts of every task.
struct SampleReindex {
    fail_first: u32,
    executed: Arc<AtomicU32>,
}

#[async_trait]
impl Handler<ReindexPayload> for SampleReindex {
    async fn handle(&self, payload: &ReindexPayload, ctx: &TaskContext) -> ExecResult {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if ctx.attempt <= self.fail_first {
            return Err(TaskError::recoverable(format!(
                "intentional failure on attempt {}",
                ctx.attempt
            )));
        }
        info!(index = %payload.index, task = %ctx.task_id, "reindexed");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Report {
    executions: u32,
    totals: StateCounts,
    partitions: Vec<PartitionStatus>,
}

/// One retry more than the planned failures, so every sample task succeeds.
fn sample_task(n: u32, fail_first: u32) -> NewTask {
    NewTask::new(format!("ns-{n}"), TaskPayload::reindex(format!("index-{n}")))
        .retries(fail_first.saturating_add(1))
        .natural_key(format!("demo:{n}"))
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn run(
    config: EngineConfig,
    tasks: u32,
    fail_first: u32,
    dispatchers: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let executed = Arc::new(AtomicU32::new(0));
    let poll_interval = config.dispatcher.poll_interval();
    let engine = EngineBuilder::new(config)
        .register::<ReindexPayload, _>(SampleReindex {
            fail_first,
            executed: Arc::clone(&executed),
        })?
        .expect_kinds(&[TaskKind::Reindex])
        .build()?;
    if !matches!(engine.router().scheme(), PartitionScheme::Hash { .. }) {
        bail!("the demo only enqueues into hash-partitioned tables");
    }

    let created = engine.initialize().await?;
    info!(partitions = created.len(), "partitions ready");

    let producer = engine.producer();
    for n in 0..tasks {
        producer.enqueue(sample_task(n, fail_first)).await?;
    }
    info!(tasks, "sample tasks enqueued");

    let group = engine.spawn_workers(dispatchers, PartitionScope::All);
    let status = engine.status();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if status.totals().await?.is_drained() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            group.shutdown_and_join().await;
            bail!("queue not drained after {}s", timeout.as_secs());
        }
        tokio::time::sleep(poll_interval).await;
    }
    group.shutdown_and_join().await;

    let report = Report {
        executions: executed.load(Ordering::Relaxed),
        totals: status.totals().await?,
        partitions: status.partition_counts().await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.into());
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run {
            tasks,
            fail_first,
            dispatchers,
            timeout_secs,
        } => {
            run(
                config,
                tasks,
                fail_first,
                dispatchers,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
