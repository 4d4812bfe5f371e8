use clap::Parser;
use leaseq::{cli::Cli, config::Config};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    leaseq::init_tracing()?;

    let cli = Cli::parse();
    let config = Config::load()?;

    leaseq::cli::run(cli, config).await
}
