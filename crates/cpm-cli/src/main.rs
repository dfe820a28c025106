use anyhow::Result;
use clap::Parser;

mod app;
mod args;
mod cmd;
mod config;
mod output;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = args::Cli::parse();
    output::init(cli.json);

    let code = cmd::dispatch(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
