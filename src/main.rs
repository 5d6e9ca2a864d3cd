mod cli;
mod dispatcher;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use std::io::IsTerminal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dispatcher::Context;
use tradebook::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for tables and JSON
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color && std::io::stderr().is_terminal())
        .init();

    if cli.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let config = Config::load()?;
    debug!("Using data directory {:?}", config.data_dir);

    let ctx = Context {
        config,
        json: cli.json,
    };
    dispatcher::dispatch(cli.command, &ctx)
}
