#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use clap::Parser;

use broker_server::config::{Cli, Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Start(args) => {
            let config = Arc::new(Config::load(&args)?);
            broker_server::logger::init(&config.log)?;
            broker_server::startup(config).await
        }
        command => broker_server::cli::execute(command).await,
    }
}
