mod cli;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let fallback = if verbose { "info,odesim_core=debug,odesim=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = config::load(cli.config.as_deref())?;
    if let Some(scheme) = cli.scheme {
        config.engine.scheme = scheme;
    }
    if let Some(step) = cli.step {
        anyhow::ensure!(step.is_finite() && step > 0.0, "--step must be positive, got {step}");
        config.engine.model_step = step;
    }
    if let Some(seed) = cli.seed {
        config.engine.inputs.seed = seed;
    }

    commands::dispatch(cli.cmd, config)
}
