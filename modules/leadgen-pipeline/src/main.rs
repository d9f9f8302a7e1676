use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use leadgen_common::{Config, PipelinePolicy, SourceType};
use leadgen_pipeline::adapters::{GatewayEnrichment, GatewayFetcher};
use leadgen_pipeline::clock::{Clock, SystemClock};
use leadgen_pipeline::queue::WorkQueue;
use leadgen_pipeline::scheduling::{Scheduler, TickStatus};
use leadgen_pipeline::store::PgStore;
use leadgen_pipeline::traits::EnrichmentProvider;
use leadgen_pipeline::{views, DispatchStatus, PipelineDeps, WorkerPool};
use source_client::GatewayClient;

/// A dispatch unanswered for this long is treated as timed out.
const STUCK_AFTER_MINUTES: i64 = 15;

#[derive(Parser)]
#[command(name = "leadgen", about = "Scrape, score, enrich and publish local business leads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Dispatch queued work for one source until interrupted
    Work {
        /// Source type column value, e.g. google_maps
        #[arg(long)]
        source: SourceType,
        /// Drain once and exit
        #[arg(long)]
        once: bool,
    },
    /// Run the scheduling loop
    Schedule {
        /// Also drain each schedule's work in-process, using its concurrency bounds
        #[arg(long)]
        dispatch: bool,
    },
    /// Print queue health, rate limit and schedule status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let policy = PipelinePolicy::load(config.policy_path.as_deref())?;
    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Migrate => {
            store.migrate().await?;
            info!("Migrations applied");
        }
        Command::Work { source, once } => {
            let deps = build_deps(&config, store, clock, policy)?;
            run_worker(&deps, &config, source, once).await?;
        }
        Command::Schedule { dispatch } => {
            let cancel = cancel_on_ctrl_c();
            if dispatch {
                let deps = build_deps(&config, store, clock, policy)?;
                run_dispatching_scheduler(&deps, &config, cancel).await?;
            } else {
                let queue = Arc::new(WorkQueue::new(store.clone(), clock.clone(), policy.retry.clone()));
                let scheduler = Scheduler::new(store.clone(), store.clone(), store, queue, clock);
                scheduler
                    .run(
                        config.scheduler_tick,
                        chrono::Duration::minutes(STUCK_AFTER_MINUTES),
                        cancel,
                    )
                    .await?;
            }
        }
        Command::Status => {
            let report = views::status_report(
                store.as_ref(),
                store.as_ref(),
                store.as_ref(),
                clock.now(),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("leadgen=info,leadgen_pipeline=info"))?;
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing in-flight work");
            flag.store(true, Ordering::Relaxed);
        }
    });
    cancel
}

fn build_deps(
    config: &Config,
    store: Arc<PgStore>,
    clock: Arc<dyn Clock>,
    policy: PipelinePolicy,
) -> Result<PipelineDeps> {
    let source_url = config
        .source_gateway_url
        .as_deref()
        .context("SOURCE_GATEWAY_URL is required to dispatch work")?;
    let source_client = Arc::new(GatewayClient::new(
        source_url,
        config.source_gateway_token.clone(),
        config.fetch_timeout,
    )?);

    let mut providers: Vec<Arc<dyn EnrichmentProvider>> = Vec::new();
    if let Some(url) = config.enrichment_gateway_url.as_deref() {
        let client = Arc::new(GatewayClient::new(
            url,
            config.source_gateway_token.clone(),
            config.fetch_timeout,
        )?);
        providers.push(Arc::new(GatewayEnrichment::new(client, "gateway")));
    } else {
        warn!("ENRICHMENT_GATEWAY_URL not set, leads will carry raw data only");
    }

    Ok(PipelineDeps::builder()
        .raw_records(store.clone())
        .leads(store.clone())
        .profiles(store.clone())
        .work_items(store.clone())
        .buckets(store.clone())
        .schedules(store.clone())
        .targets(store)
        .fetcher(Arc::new(GatewayFetcher::new(source_client)))
        .providers(providers)
        .clock(clock)
        .policy(policy)
        .fetch_timeout(config.fetch_timeout)
        .build())
}

async fn run_worker(
    deps: &PipelineDeps,
    config: &Config,
    source: SourceType,
    once: bool,
) -> Result<()> {
    let queue = Arc::new(deps.queue());
    let limiter = Arc::new(deps.rate_limiter());
    let cancel = cancel_on_ctrl_c();
    let pool = WorkerPool::with_cancel(Arc::new(deps.worker(queue, limiter)), cancel.clone());

    info!(source_type = %source, concurrency = config.worker_concurrency, "Worker started");
    loop {
        let drained = pool
            .drain(source, config.worker_concurrency, Duration::ZERO)
            .await;
        if once {
            drained?;
            break;
        }
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let reports = drained.unwrap_or_else(|e| {
            error!(source_type = %source, error = %e, "Drain failed");
            Vec::new()
        });
        let pause = reports
            .iter()
            .filter(|r| r.status == DispatchStatus::RateLimited)
            .filter_map(|r| r.retry_after_ms)
            .max()
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or(config.worker_idle);
        tokio::time::sleep(pause).await;
    }
    info!(source_type = %source, "Worker stopped");
    Ok(())
}

/// Tick, then drain whatever each schedule enqueued under that schedule's
/// concurrency and pacing.
async fn run_dispatching_scheduler(
    deps: &PipelineDeps,
    config: &Config,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let queue = Arc::new(deps.queue());
    let limiter = Arc::new(deps.rate_limiter());
    let scheduler = deps.scheduler(queue.clone());
    let pool = WorkerPool::with_cancel(Arc::new(deps.worker(queue.clone(), limiter)), cancel.clone());

    while !cancel.load(Ordering::Relaxed) {
        let reports = scheduler.tick_all().await.unwrap_or_else(|e| {
            error!(error = %e, "Scheduler tick failed");
            Vec::new()
        });
        for report in reports {
            if report.status != TickStatus::Ran || report.enqueued == 0 {
                continue;
            }
            let drained = pool
                .drain(
                    report.source_type,
                    report.max_concurrent as usize,
                    Duration::from_millis(report.delay_between_requests_ms),
                )
                .await;
            if let Err(e) = drained {
                error!(schedule_id = %report.schedule_id, error = %e, "Drain after schedule run failed");
            }
        }
        if let Err(e) = queue
            .reclaim_stuck(chrono::Duration::minutes(STUCK_AFTER_MINUTES))
            .await
        {
            error!(error = %e, "Reclaiming stuck work items failed");
        }
        if let Err(e) = queue.requeue_due().await {
            error!(error = %e, "Requeueing due work items failed");
        }
        tokio::time::sleep(config.scheduler_tick).await;
    }
    Ok(())
}
