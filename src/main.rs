use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use netmeter::config::{AgentConfig, LoggingConfig};
use netmeter::probes::http_download::DownloadDefinition;
use netmeter::probes::packet_trains::PacketTrainDefinition;
use netmeter::probes::{self, ProbeKind};
use netmeter::scheduler::{Parameters, Scheduler, SchedulerStorage, TestDefinition, Timing};
use netmeter::{AgentContext, RunMode};

#[derive(Parser)]
#[command(
    name = "netmeter",
    about = "Unattended network-quality measurement agent",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $NETMETER_CONFIG, then /etc/netmeter/netmeter.toml)
    #[arg(long, global = true, env = "NETMETER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent loop until interrupted
    Run,

    /// Run one HTTP download bandwidth measurement now
    Download {
        /// http:// URL of a large object
        #[arg(long)]
        url: String,

        /// Parallel TCP streams (1-6)
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Target duration in milliseconds (2000-45000)
        #[arg(long, default_value = "10000")]
        target_time_ms: u64,

        /// Do not randomise the request target
        #[arg(long)]
        cache_test: bool,
    },

    /// Send UDP packet trains to a dispersion server now
    PacketTrains {
        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        #[arg(long, default_value = "1000")]
        packet_size: usize,

        #[arg(long, default_value = "48")]
        train_length: u16,

        #[arg(long, default_value = "10")]
        iterations: u16,
    },

    /// Manage scheduled tests
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List pending tests
    List,

    /// Add a test definition
    Add {
        /// Probe kind: http_download or packet_trains
        #[arg(long)]
        probe: ProbeKind,

        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Run every N seconds
        #[arg(long, conflicts_with_all = ["at", "cron"])]
        every: Option<u64>,

        /// First periodic run (RFC 3339, default now)
        #[arg(long, requires = "every")]
        start: Option<DateTime<Utc>>,

        /// Last periodic run (RFC 3339)
        #[arg(long, requires = "every")]
        end: Option<DateTime<Utc>>,

        /// Run at this instant (RFC 3339); repeatable
        #[arg(long, conflicts_with = "cron")]
        at: Vec<DateTime<Utc>>,

        /// Cron expression with seconds field
        #[arg(long)]
        cron: Option<String>,
    },

    /// Remove a test definition
    Remove {
        id: Uuid,
    },

    /// Preview what will run in the next N hours
    DryRun {
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path),
        None => Ok(AgentConfig::load_or_default()),
    }
}

/// Cancel the context's shutdown token on Ctrl-C.
fn shutdown_on_ctrl_c(ctx: &AgentContext) {
    let token = ctx.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
}

/// Run a single immediate test through the scheduler and executor.
async fn run_once(config: AgentConfig, definition: TestDefinition) -> Result<AgentContext> {
    probes::validate_parameters(&definition)?;
    let mut ctx = AgentContext::ephemeral(config);
    ctx.scheduler.enqueue(definition, Utc::now())?;
    shutdown_on_ctrl_c(&ctx);
    netmeter::run(&mut ctx, RunMode::UntilIdle).await;
    Ok(ctx)
}

/// Scheduler over the configured storage directory.  Always write-through:
/// schedule edits must reach disk before the process exits.
fn open_scheduler(config: &AgentConfig) -> Result<Scheduler> {
    let storage = SchedulerStorage::open(&config.scheduler.storage_dir, true)?;
    let definitions = storage.load();
    let mut scheduler = Scheduler::with_storage(storage);
    scheduler.restore(definitions, Utc::now());
    Ok(scheduler)
}

fn timing_from_args(
    every: Option<u64>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    at: Vec<DateTime<Utc>>,
    cron: Option<String>,
) -> Result<Timing> {
    if let Some(secs) = every {
        let mut timing = Timing::periodic(
            start.unwrap_or_else(Utc::now),
            std::time::Duration::from_secs(secs),
        );
        if let Timing::Periodic { end: bound, .. } = &mut timing {
            *bound = end;
        }
        return Ok(timing);
    }
    if let Some(expr) = cron {
        return Ok(Timing::calendar(&expr)?);
    }
    if !at.is_empty() {
        return Ok(Timing::scheduled(at));
    }
    Ok(Timing::Immediate)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run => {
            tracing::info!(
                scheduler_dir = %config.scheduler.storage_dir.display(),
                reports_dir = %config.reports.storage_dir.display(),
                "starting netmeter agent"
            );
            let mut ctx = AgentContext::from_config(config)?;
            ctx.restore_pending();
            shutdown_on_ctrl_c(&ctx);
            netmeter::run(&mut ctx, RunMode::Forever).await;
        }
        Commands::Download {
            url,
            threads,
            target_time_ms,
            cache_test,
        } => {
            let definition = DownloadDefinition {
                threads,
                target_time_ms,
                cache_test,
                ..DownloadDefinition::new(url)
            };
            let test = TestDefinition::new(
                ProbeKind::HttpDownload,
                Timing::Immediate,
                TestDefinition::parameters_from(&definition),
            );
            let id = test.id;
            let ctx = run_once(config, test).await?;
            match ctx.reports.get(&id) {
                Some(report) => println!("{}", serde_json::to_string_pretty(report)?),
                None => bail!("download produced no result (see log for the reason)"),
            }
        }
        Commands::PacketTrains {
            host,
            port,
            packet_size,
            train_length,
            iterations,
        } => {
            let definition = PacketTrainDefinition {
                host,
                port,
                packet_size_bytes: packet_size,
                train_length,
                iteration_count: iterations,
            };
            let target = definition.target();
            let test = TestDefinition::new(
                ProbeKind::PacketTrains,
                Timing::Immediate,
                TestDefinition::parameters_from(&definition),
            );
            let ctx = run_once(config, test).await?;
            match ctx.executor.state() {
                netmeter::executor::RunState::Finished => {
                    println!("Packet trains sent to {}.", target)
                }
                state => bail!("packet trains {} (see log for the reason)", state),
            }
        }
        Commands::Schedule { action } => match action {
            ScheduleAction::List => {
                let scheduler = open_scheduler(&config)?;
                if scheduler.is_empty() {
                    println!("No tests scheduled.");
                } else {
                    println!("{:<36} | {:<13} | {:<25} | Timing", "ID", "Probe", "Next run");
                    println!("{:-<36}-|-{:-<13}-|-{:-<25}-|-{:-<20}", "", "", "", "");
                    for test in scheduler.tests() {
                        let due = scheduler
                            .due_instant(&test.id)
                            .map(|d| d.to_rfc3339())
                            .unwrap_or_default();
                        println!("{:<36} | {:<13} | {:<25} | {}", test.id, test.probe, due, test.timing);
                    }
                }
            }
            ScheduleAction::Add {
                probe,
                params,
                every,
                start,
                end,
                at,
                cron,
            } => {
                let parameters: Parameters =
                    serde_json::from_str(&params).context("--params must be a JSON object")?;
                let timing = timing_from_args(every, start, end, at, cron)?;
                let test = TestDefinition::new(probe, timing, parameters);
                probes::validate_parameters(&test)?;

                let mut scheduler = open_scheduler(&config)?;
                let id = test.id;
                match scheduler.enqueue(test, Utc::now())? {
                    Some(due) => println!("Test {} added, first run at {}.", id, due.to_rfc3339()),
                    None => println!("Test {} has no future run; not added.", id),
                }
            }
            ScheduleAction::Remove { id } => {
                let mut scheduler = open_scheduler(&config)?;
                if scheduler.cancel(&id) {
                    println!("Test {} removed.", id);
                } else {
                    bail!("no scheduled test with id {}", id);
                }
            }
            ScheduleAction::DryRun { hours } => {
                let scheduler = open_scheduler(&config)?;
                let horizon = i64::try_from(hours)
                    .ok()
                    .and_then(chrono::Duration::try_hours)
                    .context("--hours is out of range")?;
                let preview = scheduler.preview(Utc::now(), horizon);
                if preview.is_empty() {
                    println!("No runs scheduled in next {} hours.", hours);
                } else {
                    println!("Upcoming runs (next {} hours):", hours);
                    for (at, id, probe) in preview {
                        println!("{} : {} ({})", at.to_rfc3339(), id, probe);
                    }
                }
            }
        },
    }

    Ok(())
}
