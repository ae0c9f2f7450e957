use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = cli::Cli::parse();
    let mut config = chatrelay_common::GlobalConfig::from_env()?;
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }
    if args.proxy.is_some() {
        config.proxy = args.proxy;
    }

    let runtime = Arc::new(chatrelay_core::Runtime::from_config(&config)?);
    let app = chatrelay_core::build_router(runtime);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(event = "listening", addr = %config.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
