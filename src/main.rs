use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use patrol::config::{LogFormat, LoggingConfig, PatrolConfig};
use patrol::storage::{CheckKey, HistoryStore, SortOrder};

#[derive(Parser)]
#[command(
    name = "patrol",
    about = "Container-backed health checks with history and notifications",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the check scheduler until interrupted
    Run {
        /// Path to the config file
        #[arg(short, long)]
        config: PathBuf,

        /// Number of checks to run concurrently (default: logical cores)
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Validate a config file and list the checks it declares
    Validate {
        /// Path to the config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show the latest status of every check
    Status {
        /// Path to the config file
        #[arg(short, long)]
        config: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show recent history of one check
    History {
        /// Path to the config file
        #[arg(short, long)]
        config: PathBuf,

        /// Service name
        #[arg(long)]
        service: String,

        /// Check name
        #[arg(long)]
        check: String,

        /// Number of records to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, concurrency } => {
            let cfg = PatrolConfig::load(&config)?;
            init_tracing(&cfg.logging);
            tracing::info!(config = %config.display(), "Starting patrol");
            patrol::serve(&cfg, concurrency).await?;
        }
        Commands::Validate { config } => {
            let cfg = PatrolConfig::load(&config)?;
            let checks = cfg.checks()?;
            println!("{:<15} | {:<20} | {:<8} | {:<10} | Image", "Service", "Check", "Type", "Interval");
            println!("{:-<15}-|-{:-<20}-|-{:-<8}-|-{:-<10}-|-{:-<25}", "", "", "", "", "");
            for check in &checks {
                println!(
                    "{:<15} | {:<20} | {:<8} | {:<10} | {}",
                    check.service,
                    check.name,
                    check.check_type,
                    format!("{}s", check.interval.num_milliseconds() as f64 / 1000.0),
                    check.image
                );
            }
            println!("\n{} checks OK ({})", checks.len(), config.display());
        }
        Commands::Status { config, json } => {
            let cfg = PatrolConfig::load(&config)?;
            init_tracing(&LoggingConfig {
                level: "warn".to_string(),
                ..cfg.logging.clone()
            });
            let history = patrol::open_history(&cfg)?;
            let checks = cfg.checks()?;
            let (overall, statuses) = patrol::current_status(&history, &checks).await?;

            if json {
                let rows: Vec<_> = statuses
                    .iter()
                    .map(|s| {
                        let latest = match &s.state {
                            patrol::checker::state::CheckState::Record(r) => Some(r),
                            patrol::checker::state::CheckState::NoHistory => None,
                        };
                        serde_json::json!({
                            "service": s.check.service,
                            "check": s.check.name,
                            "status": s.state.label(),
                            "last_run": latest.map(|r| r.created_at.to_rfc3339()),
                            "metric": latest.and_then(|r| r.metric),
                        })
                    })
                    .collect();
                let out = serde_json::json!({ "overall": overall, "checks": rows });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("\nOverall: {}\n", overall.to_string().to_uppercase());
                println!("{:<15} | {:<20} | {:<13} | Last run", "Service", "Check", "Status");
                println!("{:-<15}-|-{:-<20}-|-{:-<13}-|-{:-<25}", "", "", "", "");
                for s in &statuses {
                    let last_run = match &s.state {
                        patrol::checker::state::CheckState::Record(r) => r.created_at.to_rfc3339(),
                        patrol::checker::state::CheckState::NoHistory => "never".to_string(),
                    };
                    println!(
                        "{:<15} | {:<20} | {:<13} | {}",
                        s.check.service,
                        s.check.name,
                        s.state.label(),
                        last_run
                    );
                }
                println!();
            }
        }
        Commands::History {
            config,
            service,
            check,
            limit,
        } => {
            let cfg = PatrolConfig::load(&config)?;
            init_tracing(&LoggingConfig {
                level: "warn".to_string(),
                ..cfg.logging.clone()
            });
            let history = patrol::open_history(&cfg)?;
            let key = CheckKey::new(service, check);
            let records = history.find_range(&key, SortOrder::Descending, limit).await?;

            if records.is_empty() {
                println!("No history for {}.", key);
            } else {
                println!("{:<25} | {:<13} | {:>9} | {:<12} | Error", "Time", "Status", "Duration", "Metric");
                println!("{:-<25}-|-{:-<13}-|-{:->9}-|-{:-<12}-|-{:-<20}", "", "", "", "", "");
                for r in records {
                    let metric = match (r.metric, &r.metric_unit) {
                        (Some(v), Some(unit)) => format!("{v} {unit}"),
                        (Some(v), None) => v.to_string(),
                        _ => "-".to_string(),
                    };
                    println!(
                        "{:<25} | {:<13} | {:>7}ms | {:<12} | {}",
                        r.created_at.to_rfc3339(),
                        r.status,
                        r.duration_ms,
                        metric,
                        r.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}
