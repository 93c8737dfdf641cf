//! Leakhunt - Repeated-Execution Resource Leak Hunter
//!
//! Command-line entry point: runs the built-in faucet suite, optionally
//! under leak checking, and prints per-test statuses plus a summary.

use clap::{Parser, Subcommand};
use leakhunt_core::{
    demo, global_allocation_tracker,
    report::{self, write_status_line, write_terminal_summary},
    CountingAllocator, LeakChecker, LeakConfig, Summary,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::{self, EnvFilter};

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

#[derive(Parser)]
#[command(name = "leakhunt")]
#[command(about = "Find slow resource leaks by running tests repeatedly", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Hunt leaks: warm-up and tracked repetitions, optional reflog file
    #[arg(short = 'R', long = "leaks", value_name = "STAB:RUN[:REFLOG]")]
    leaks: Option<String>,

    /// Configuration file (defaults to ./leakhunt.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Only run tests whose node id matches this pattern
    #[arg(short = 'k', value_name = "PATTERN")]
    select: Option<String>,

    /// Print one JSON report per line instead of the terminal summary
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in faucet suite (default)
    Demo,

    /// Print the effective configuration as TOML
    ShowConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let level = level.as_str().to_lowercase();
    let filter = EnvFilter::new(format!("leakhunt={},leakhunt_core={}", level, level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Leakhunt v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = LeakConfig::load(cli.config.as_deref())?;
    if let Some(token) = &cli.leaks {
        config.apply_token(token)?;
    }

    match cli.command.unwrap_or(Commands::Demo) {
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo => {
            let mut session = demo::faucet_suite();
            if let Some(pattern) = &cli.select {
                let deselected = session.select(pattern)?;
                info!(deselected, "Applied -k selection");
            }

            let mut checker = match cli.leaks {
                Some(_) => Some(LeakChecker::activate(config)?),
                None => None,
            };
            let reports = session.run(checker.as_mut());
            if checker.is_some() {
                global_allocation_tracker().log_statistics();
            }

            let summary = Summary::from_reports(&reports)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            if cli.json {
                for rep in &reports {
                    writeln!(out, "{}", rep.to_json()?)?;
                }
            } else {
                let color = report::stdout_is_terminal();
                for rep in reports.iter().filter(|r| report::TestStatus::is_reported(r)) {
                    write_status_line(&mut out, rep, color)?;
                }
                write_terminal_summary(&mut out, &summary, color)?;
            }
            out.flush()?;
            drop(out);

            std::process::exit(summary.exit_code());
        }
    }
}
