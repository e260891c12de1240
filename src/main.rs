mod commands;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use innkeep::config::Config;

#[derive(Parser, Debug)]
#[command(name = "innkeep")]
#[command(about = "Offline resilience layer for the booking client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/innkeep/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log at debug level unless RUST_LOG says otherwise
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Start offline without probing the backend
  #[arg(long, global = true)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Install, activate and keep the background workers running until Ctrl-C
  Run,

  /// Send one request through the interceptor and print the response
  Fetch {
    /// Absolute URL or path relative to the backend
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Extra header as `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },

  /// Fetch assets into the static partition (default: the configured list)
  Precache { urls: Vec<String> },

  /// Remove expired entries and enforce partition sizes
  Sweep,

  /// Show storage usage per the configured quota
  Quota,

  /// Inspect and manage queued writes
  Queue {
    #[command(subcommand)]
    action: QueueCommand,
  },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
  /// List queued writes
  List,
  /// Replay pending writes now
  Drain,
  /// Requeue a failed write
  Retry { id: String },
  /// Drop a failed write
  Dismiss { id: String },
}

fn init_tracing(verbose: bool, config: &Config) -> Option<WorkerGuard> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=innkeep=debug)
  let default_level = if verbose { "debug" } else { "warn" };
  let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

  let (file_layer, guard) = match config.data_dir() {
    Ok(dir) if config.log_to_file => {
      let appender = tracing_appender::rolling::daily(dir.join("logs"), "innkeep.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    _ => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr).with_filter(filter()))
    .with(file_layer)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Held until exit so buffered log lines are flushed
  let _log_guard = init_tracing(args.verbose, &config);

  commands::execute(args.command, config, args.offline).await
}
