use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use service::Service;

mod auth;
mod config;
mod conversion;
mod gateway;
mod http_objects;
mod key_mapper;
mod middleware;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::ServerConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    let tracing_guards = setup_tracing(&config)?;
    let result = start_gateway(config).await;
    tracing_guards.shutdown();
    result
}

#[::tracing::instrument(skip(config), fields(env = %config.env))]
async fn start_gateway(config: config::ServerConfig) -> anyhow::Result<()> {
    let service = Service::new(config).context("failed to create service")?;
    ::tracing::info!(instance_id = service.instance_id(), "starting storage gateway");
    service.start().await.context("failed to start service")
}
