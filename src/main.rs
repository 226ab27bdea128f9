use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use jobexec_lite::scheduler::job::{job_types, Job};
use jobexec_lite::scheduler::priority::{CreationContext, VariablePriority};
use jobexec_lite::scheduler::retry::RetryCycle;
use jobexec_lite::shutdown::install_shutdown_handler;
use jobexec_lite::store::{categories, JobStore, MemoryJobStore};
use jobexec_lite::worker::{ExecutionContext, HandlerFailure, JobHandler};
use jobexec_lite::{SchedulerConfig, SchedulerNode};

#[derive(Parser, Debug)]
#[command(name = "jobexec-lite")]
#[command(version)]
#[command(about = "Asynchronous job executor for a process engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run several nodes against one in-memory store and report the outcome
    Simulate(SimulateArgs),
}

// =============================================================================
// Simulation Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of nodes competing for jobs
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Number of jobs created before the nodes start
    #[arg(long, default_value = "100")]
    jobs: usize,

    /// Concurrent executions per node
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Jobs claimed per acquisition cycle
    #[arg(long, default_value = "3")]
    max_jobs_per_acquisition: usize,

    /// Probability that a single execution fails (0.0 - 1.0)
    #[arg(long, default_value = "0.1")]
    failure_rate: f64,

    /// Upper bound of simulated work per execution, in milliseconds
    #[arg(long, default_value = "20")]
    work_ms: u64,

    /// Priorities are drawn uniformly from 0..=max_priority
    #[arg(long, default_value = "10")]
    max_priority: i64,

    /// Lock lease duration in milliseconds
    #[arg(long, default_value = "30000")]
    lease_ms: u64,

    /// Minimum wait between acquisition cycles in milliseconds
    #[arg(long, default_value = "10")]
    interval_min_ms: u64,

    /// Maximum wait between idle acquisition cycles in milliseconds
    #[arg(long, default_value = "200")]
    interval_max_ms: u64,

    /// Retry time cycle, e.g. "R3/PT0S" or "PT0S,PT1S"
    #[arg(long, default_value = "R3/PT0S")]
    retry_cycle: String,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeReport {
    lock_owner: String,
    executions: u64,
    failures: u64,
}

#[derive(Serialize)]
struct SimulationReport {
    jobs_created: usize,
    elapsed_ms: u128,
    finished: bool,
    nodes: Vec<NodeReport>,
    statistics: BTreeMap<String, u64>,
}

// =============================================================================
// Simulated Handler
// =============================================================================

#[derive(Default)]
struct ExecutionCounters {
    executions: AtomicU64,
    failures: AtomicU64,
}

struct SimulatedHandler {
    failure_rate: f64,
    max_work: Duration,
    counters: Arc<ExecutionCounters>,
}

#[async_trait]
impl JobHandler for SimulatedHandler {
    async fn execute(&self, job: &Job, _ctx: &mut ExecutionContext) -> Result<(), HandlerFailure> {
        let (work, fail) = {
            let mut rng = rand::thread_rng();
            let work_ms = rng.gen_range(0..=self.max_work.as_millis() as u64);
            (
                Duration::from_millis(work_ms),
                rng.gen_bool(self.failure_rate),
            )
        };
        tokio::time::sleep(work).await;

        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        if fail {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(HandlerFailure::new(format!(
                "simulated failure of job {} (priority {})",
                job.id, job.priority
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Simulation
// =============================================================================

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        return Err("--failure-rate must be between 0.0 and 1.0".into());
    }
    let retry_cycle: RetryCycle = args.retry_cycle.parse()?;

    let store = Arc::new(MemoryJobStore::new());
    let shutdown = install_shutdown_handler()?;

    let mut nodes = Vec::with_capacity(args.nodes);
    let mut counters = Vec::with_capacity(args.nodes);
    for i in 1..=args.nodes.max(1) {
        let config = SchedulerConfig::new(format!("node-{}", i))
            .with_max_concurrent_executions(args.workers)
            .with_max_jobs_per_acquisition(args.max_jobs_per_acquisition)
            .with_lock_lease_duration(Duration::from_millis(args.lease_ms))
            .with_acquisition_interval(
                Duration::from_millis(args.interval_min_ms),
                Duration::from_millis(args.interval_max_ms),
            )
            .with_retry_cycle(retry_cycle.clone());

        let node_counters = Arc::new(ExecutionCounters::default());
        let handler = SimulatedHandler {
            failure_rate: args.failure_rate,
            max_work: Duration::from_millis(args.work_ms),
            counters: node_counters.clone(),
        };
        let node = SchedulerNode::new(config, store.clone())?
            .with_priority_resolver(Arc::new(VariablePriority::new("priority")))
            .with_handler(job_types::ASYNC_CONTINUATION, handler);
        nodes.push(node);
        counters.push(node_counters);
    }

    let management = nodes[0].management();
    for _ in 0..args.jobs {
        let priority = rand::thread_rng().gen_range(0..=args.max_priority.max(0));
        let context = CreationContext::new().variable("priority", priority);
        management
            .create_job(job_types::ASYNC_CONTINUATION, context)
            .await?;
    }
    tracing::info!(jobs = args.jobs, nodes = nodes.len(), "Jobs created, starting nodes");

    let lock_owners: Vec<String> = nodes.iter().map(|n| n.config().lock_owner.clone()).collect();
    let nodes_token = shutdown.child_token();
    let handles: Vec<_> = nodes
        .into_iter()
        .map(|node| node.start(nodes_token.clone()))
        .collect();

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.timeout_secs);
    let finished = loop {
        let stats = store.statistics(chrono::Utc::now()).await?;
        // Only dead jobs left means everything else completed.
        if stats.get(categories::JOBS) == stats.get(categories::DEAD_JOBS) {
            break true;
        }
        if Instant::now() >= deadline || shutdown.is_cancelled() {
            break false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let elapsed = started.elapsed();

    nodes_token.cancel();
    for handle in handles {
        handle.await?;
    }

    let report = SimulationReport {
        jobs_created: args.jobs,
        elapsed_ms: elapsed.as_millis(),
        finished,
        nodes: lock_owners
            .into_iter()
            .zip(counters)
            .map(|(lock_owner, c)| NodeReport {
                lock_owner,
                executions: c.executions.load(Ordering::Relaxed),
                failures: c.failures.load(Ordering::Relaxed),
            })
            .collect(),
        statistics: management.statistics().await?,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!(
        "Simulation {} after {} ms ({} jobs)",
        if report.finished { "finished" } else { "timed out" },
        report.elapsed_ms,
        report.jobs_created
    );
    println!();
    println!("{:<12} {:>12} {:>10}", "NODE", "EXECUTIONS", "FAILURES");
    println!("{}", "-".repeat(36));
    for node in &report.nodes {
        println!(
            "{:<12} {:>12} {:>10}",
            node.lock_owner, node.executions, node.failures
        );
    }
    println!();
    println!("{:<18} {:>8}", "CATEGORY", "COUNT");
    println!("{}", "-".repeat(27));
    for (category, count) in &report.statistics {
        println!("{:<18} {:>8}", category, count);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(args) => run_simulation(args).await,
    }
}
