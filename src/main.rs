/*!
 * Keel CLI - narrated resilience scenarios
 *
 * Each subcommand drives one mechanism against a simulated dependency and
 * reports what happened. Configuration comes from an optional TOML file;
 * command-line flags override it.
 */

use clap::{Parser, Subcommand, ValueEnum};
use keel::{
    config::KeelConfig,
    demo::{self, LevelOptions},
    error::{KeelError, Result, EXIT_PARTIAL, EXIT_SUCCESS},
    logging,
    simulate::{FailureMode, UnreliableService},
    sink::JsonLinesSink,
};
use keel_core_resilience::{DeadLetterSink, SharedDeadLetterQueue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "keel")]
#[command(version, about = "Retry, circuit breaking, dead-lettering and load leveling, narrated", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Write logs to a file as JSON instead of stderr
    #[arg(long = "log-file", value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Append dead-letter entries to this file as JSON lines
    #[arg(long = "dead-letter-file", value_name = "FILE", global = true)]
    dead_letter_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a flaky service through the retry executor
    Retry {
        /// Calls that fail before the service recovers
        #[arg(long, default_value = "2")]
        failures: u32,

        /// How the service fails
        #[arg(long, value_enum, default_value = "transient")]
        error: ErrorArg,

        /// Override [retry] max_attempts
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Override [retry] attempt_timeout_ms
        #[arg(long)]
        attempt_timeout_ms: Option<u64>,

        /// Name used in logs and dead-letter entries
        #[arg(long, default_value = "payment-service")]
        service: String,
    },

    /// Walk a circuit breaker through open, half-open and closed
    Breaker {
        /// Calls that fail before the service recovers
        #[arg(long, default_value = "3")]
        failures: u32,

        /// Override [retry.circuit_breaker] open_timeout_ms
        #[arg(long)]
        cooldown_ms: Option<u64>,
    },

    /// Burst tasks into the admission queue and level them
    Level {
        /// Tasks to submit in one burst
        #[arg(long, default_value = "50")]
        tasks: usize,

        /// Share of task attempts that fail (0.0 - 1.0)
        #[arg(long, default_value = "0.1")]
        failure_rate: f64,

        /// Time each task spends in the handler
        #[arg(long, default_value = "50")]
        work_ms: u64,

        /// Seed for reproducible failures
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ErrorArg {
    Transient,
    Timeout,
    Http500,
    Http404,
    Permanent,
}

impl From<ErrorArg> for FailureMode {
    fn from(arg: ErrorArg) -> Self {
        match arg {
            ErrorArg::Transient => FailureMode::Transient,
            ErrorArg::Timeout => FailureMode::Timeout,
            ErrorArg::Http500 => FailureMode::Http500,
            ErrorArg::Http404 => FailureMode::Http404,
            ErrorArg::Permanent => FailureMode::Permanent,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => KeelConfig::from_file(path)?,
        None => KeelConfig::default(),
    };

    // Command-line flags win over the file
    config.logging.verbose |= cli.verbose;
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    if cli.dead_letter_file.is_some() {
        config.dead_letter.file = cli.dead_letter_file.clone();
    }

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(EXIT_SUCCESS);
    }

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let sink = build_sink(&config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Retry {
                failures,
                error,
                max_attempts,
                attempt_timeout_ms,
                service,
            } => {
                let mut settings = config.retry.clone();
                if let Some(max_attempts) = max_attempts {
                    settings.max_attempts = max_attempts;
                }
                if let Some(ms) = attempt_timeout_ms {
                    settings.attempt_timeout_ms = ms;
                }
                let service = UnreliableService::new(service, failures, error.into());
                handle_retry(settings.to_retry_config(), sink, service).await
            }
            Commands::Breaker {
                failures,
                cooldown_ms,
            } => {
                let mut breaker = config.retry.circuit_breaker.to_breaker_config();
                if let Some(ms) = cooldown_ms {
                    breaker.open_timeout = Duration::from_millis(ms);
                }
                let service =
                    UnreliableService::new("inventory-service", failures, FailureMode::Http500);
                handle_breaker(breaker, service).await
            }
            Commands::Level {
                tasks,
                failure_rate,
                work_ms,
                seed,
            } => {
                let options = LevelOptions {
                    tasks,
                    failure_rate,
                    work: Duration::from_millis(work_ms),
                    seed,
                };
                handle_level(config.leveling.clone(), sink, &options).await
            }
            Commands::Config => Ok(EXIT_SUCCESS),
        }
    })
}

/// File sink when a dead-letter file is configured, in-memory queue otherwise
fn build_sink(config: &KeelConfig) -> Result<Arc<dyn DeadLetterSink>> {
    match config.dead_letter.file {
        Some(ref path) => {
            info!("🪦 Dead letters appended to {}", path.display());
            Ok(Arc::new(JsonLinesSink::open(path)?))
        }
        None => Ok(Arc::new(SharedDeadLetterQueue::new(
            config.dead_letter.capacity,
        ))),
    }
}

async fn handle_retry(
    retry: keel_core_resilience::RetryConfig,
    sink: Arc<dyn DeadLetterSink>,
    service: UnreliableService,
) -> Result<i32> {
    let report = demo::run_retry(retry, sink, service).await?;

    println!("Service:   {}", report.service);
    for record in &report.status.metrics.recent_attempts {
        let outcome = match record.error {
            Some(ref e) => format!("failed: {}", e),
            None => "ok".to_string(),
        };
        println!(
            "  attempt {} after {:>6}ms  ({}ms)  {}",
            record.attempt,
            record.delay_before.as_millis(),
            record.elapsed.as_millis(),
            outcome
        );
    }
    println!("Circuit:   {}", report.status.circuit.state);
    println!("Metrics:   {}", report.status.metrics.summary());
    if let Some(stats) = report.status.dead_letters {
        println!(
            "Dead letters: {} held, {} received",
            stats.current_count, stats.total_received
        );
    }

    match report.result {
        Ok(message) => {
            println!("✅ {}", message);
            Ok(EXIT_SUCCESS)
        }
        Err(e) => Err(KeelError::Resilience(e)),
    }
}

async fn handle_breaker(
    breaker: keel_core_resilience::CircuitBreakerConfig,
    service: UnreliableService,
) -> Result<i32> {
    let report = demo::run_breaker(breaker, service).await?;

    for step in &report.steps {
        println!("  call {:>2}  [{:<9}]  {}", step.call, step.state_after, step.outcome);
    }
    println!("Transitions:");
    for transition in &report.transitions {
        println!("  {} -> {}", transition.from, transition.to);
    }
    println!("Final state: {}", report.final_state);

    Ok(EXIT_SUCCESS)
}

async fn handle_level(
    policy: keel_leveler::LevelingPolicy,
    sink: Arc<dyn DeadLetterSink>,
    options: &LevelOptions,
) -> Result<i32> {
    let status = demo::run_level(policy, sink, options).await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("{}", status.summary());

    if status.stats.failed > 0 {
        Ok(EXIT_PARTIAL)
    } else {
        Ok(EXIT_SUCCESS)
    }
}
