use chrono::NaiveDate;
use clap::Parser;
use dv2cw::cli::run::{CliError, RunArgs};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dv2cw")]
#[command(about = "Ship new server.log entries to CloudWatch Logs", long_about = None)]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Take a non-blocking exclusive lock on this file first
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Log date (YYYY-MM-DD) for time-only timestamps and the stream name
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Reprocess the file from its first line, skipping this many events
    #[arg(long, default_value_t = 0)]
    skip: u64,

    /// Print a starter configuration and exit
    #[arg(long)]
    print_config: bool,

    /// List the zone names accepted by source.timestamp.timezone and exit
    #[arg(long)]
    list_timezones: bool,

    #[arg(required_unless_present_any = ["print_config", "list_timezones"])]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout is reserved for the dry-run sink
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dv2cw=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(4)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if cli.print_config {
        print!("{}", dv2cw::config::generate::generate_starter_config());
        return ExitCode::SUCCESS;
    }

    if cli.list_timezones {
        for name in dv2cw::config::available_timezones() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    let Some(log_file) = cli.log_file else {
        eprintln!("dv2cw: missing <LOG_FILE>");
        return ExitCode::from(4);
    };

    let args = RunArgs {
        log_file,
        config: cli.config,
        lock_file: cli.lock_file,
        date: cli.date,
        skip: cli.skip,
    };

    match dv2cw::cli::run::run(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(CliError::LockHeld(path)) => {
            tracing::debug!(lock = %path.display(), "Another run is in progress, exiting");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("dv2cw: {}", single_line(&e.to_string()));
            ExitCode::from(e.exit_code())
        }
    }
}

fn single_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}
