use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = novelshelf::cli::Cli::parse();
    novelshelf::logging::init(cli.global.verbose).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    let config = novelshelf::config::Config::load(
        cli.global.config.as_deref(),
        &cli.global.overrides(),
    )
    .context("load config")?;
    tracing::debug!(?config, "resolved config");

    let shelf = novelshelf::commands::Shelf::open(config).context("open shelf")?;
    novelshelf::commands::run(&shelf, cli.command).await
}
