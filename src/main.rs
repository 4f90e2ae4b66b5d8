use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use pacer::config::PacerConfig;
use pacer::limiter::{Policy, PolicyKind, RateLimited};
use pacer::schedule::{Scheduler, TokioScheduler};
use pacer::sim::{self, Edge, Trace};

/// Debounce and throttle calls, on a virtual clock or live from stdin.
#[derive(Parser, Debug)]
#[command(name = "pacer", version, about)]
struct Cli {
    /// YAML configuration file with named policies
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the policies defined in the configuration
    Policies,
    /// Replay a trace of call times on a virtual clock
    Simulate {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Comma-separated call times in milliseconds, e.g. 0,50,80
        #[arg(long, conflicts_with = "random")]
        at: Option<String>,

        /// Generate this many calls with random gaps
        #[arg(long)]
        random: Option<usize>,

        /// Largest gap between generated calls
        #[arg(long, default_value_t = 50)]
        max_gap_ms: u64,

        /// Seed for generated traces
        #[arg(long, default_value_t = 1)]
        seed: u64,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
    /// Treat each stdin line as a call and print the runs as they happen
    Live {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Drop a pending call on exit instead of running it
        #[arg(long)]
        discard_pending: bool,
    },
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// Named policy from the configuration
    #[arg(long, conflicts_with_all = ["kind", "delay_ms", "immediate"])]
    policy: Option<String>,

    /// Policy kind: debounce, debounce_immediate, throttle, throttle_trailing
    #[arg(long)]
    kind: Option<PolicyKind>,

    /// Delay or interval in milliseconds
    #[arg(long)]
    delay_ms: Option<f64>,

    /// Run on the leading edge (debounce_immediate only)
    #[arg(long)]
    immediate: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PacerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PacerConfig::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, cli.json_logs || config.logging.json)?;
    log_config_source(cli.config.as_deref(), &config);

    match cli.command {
        Command::Policies => list_policies(&config),
        Command::Simulate {
            policy,
            at,
            random,
            max_gap_ms,
            seed,
            output,
        } => {
            let policy = resolve_policy(&config, &policy)?;
            let trace = match (at, random) {
                (Some(list), _) => Trace::parse(&list)?,
                (None, Some(count)) => Trace::random(count, max_gap_ms, seed),
                (None, None) => bail!("either --at or --random is required"),
            };
            run_simulation(policy, &trace, output)
        }
        Command::Live {
            policy,
            discard_pending,
        } => {
            let policy = resolve_policy(&config, &policy)?;
            run_live(policy, discard_pending).await
        }
    }
}

fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level '{}'", level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Report where the configuration came from. Call after `init_tracing`.
fn log_config_source(path: Option<&Path>, config: &PacerConfig) {
    match path {
        Some(path) => info!(
            path = %path.display(),
            policies = config.policies.len(),
            "Configuration loaded"
        ),
        None => debug!("No configuration file, using defaults"),
    }
}

fn resolve_policy(config: &PacerConfig, args: &PolicyArgs) -> anyhow::Result<Policy> {
    if let Some(name) = &args.policy {
        return Ok(config.policy(name)?);
    }

    let (Some(kind), Some(delay_ms)) = (args.kind, args.delay_ms) else {
        bail!("give --policy <name>, or --kind with --delay-ms");
    };
    Ok(Policy::from_millis(kind, delay_ms, args.immediate)?)
}

fn list_policies(config: &PacerConfig) -> anyhow::Result<()> {
    if config.policies.is_empty() {
        println!("no policies configured");
        return Ok(());
    }

    for name in config.policies.keys() {
        println!("{:<16} {}", name, config.policy(name)?);
    }
    Ok(())
}

fn run_simulation(policy: Policy, trace: &Trace, output: OutputFormat) -> anyhow::Result<()> {
    let report = sim::simulate(policy, trace)?;

    if let OutputFormat::Json = output {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("policy: {}", report.policy);
    println!("calls:");
    for (index, (at, outcome)) in report.calls.iter().zip(&report.outcomes).enumerate() {
        println!("  t={:<8} #{:<4} {}", format!("{}ms", at), index, outcome);
    }
    println!("executions:");
    for execution in &report.executions {
        let edge = match execution.edge {
            Edge::Leading => "leading",
            Edge::Trailing => "trailing",
        };
        println!(
            "  t={:<8} {:<9} data from #{}",
            format!("{}ms", execution.at_ms),
            edge,
            execution.call_index
        );
    }
    println!(
        "{} calls, {} runs ({} deferred), {} dropped, {} suppressed",
        report.stats.calls,
        report.stats.invocations,
        report.stats.deferred_invocations,
        report.stats.dropped,
        report.stats.suppressed
    );
    Ok(())
}

async fn run_live(policy: Policy, discard_pending: bool) -> anyhow::Result<()> {
    let scheduler = Arc::new(TokioScheduler::new()?);
    let clock = Arc::clone(&scheduler);

    let wrapper: RateLimited<usize, String> = RateLimited::new(
        policy,
        move |line_no: usize, line: String| {
            println!("[{:.1?}] line {}: {}", clock.now(), line_no, line);
            Ok(())
        },
        scheduler.clone(),
    );

    info!(policy = %policy, "Reading calls from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        line_no += 1;
                        let outcome = wrapper.call(line_no, line)?;
                        debug!(line = line_no, outcome = %outcome, "Call filtered");
                    }
                    None => {
                        info!("End of input");
                        break;
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }

    if discard_pending {
        if wrapper.cancel() {
            warn!("Discarded pending call");
        }
    } else {
        wrapper.flush()?;
    }
    wrapper.destroy();

    let stats = wrapper.stats();
    info!(
        calls = stats.calls,
        invocations = stats.invocations,
        dropped = stats.dropped,
        "Stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
