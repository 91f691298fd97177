mod app;
mod cache;
mod clients;
mod commands;
mod config;
mod error;
mod logging;
mod monitor;
mod push;
mod server;
mod store;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "portaria-offline")]
#[command(about = "Offline capture and sync for the gatehouse portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./portaria.yaml, then $XDG_CONFIG_HOME/portaria-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so the file log is flushed on exit
  let _log_guard = logging::init(&config::Config::data_dir()?)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  commands::execute(args.command, config).await
}
