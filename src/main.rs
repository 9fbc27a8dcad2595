mod app;
mod config;
mod event;
mod pricing;
mod remote;
mod sync;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "storesync")]
#[command(about = "Optimistic, debounced cart and catalog sync for a storefront API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overriding the config file
  #[arg(short, long)]
  backend: Option<String>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: app::Command,
}

/// Log filter directives, e.g. `storesync=debug`
const LOG_ENV: &str = "STORESYNC_LOG";

fn init_tracing(log_file: Option<&Path>) -> Result<WorkerGuard> {
  let filter =
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("storesync=info"));

  let (writer, guard) = match log_file {
    Some(path) => {
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(log_file.is_none())
    .with_target(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override backend if specified on command line
  if let Some(backend) = args.backend {
    config.backend.url = backend;
  }

  let mut app = app::App::new(&config)?;
  app.run(args.command, &mut std::io::stdout()).await?;

  Ok(())
}
