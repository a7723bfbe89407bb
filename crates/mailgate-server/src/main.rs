mod app;
mod config;
mod core;
mod rest;

use std::sync::Arc;

use anyhow::Result;
use mailgate_helpers::{logging, shutdown};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use app::AppState;
use config::Config;
use core::orchestrator::Orchestrator;
use rest::HttpTicketingClient;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    logging::init_logging("mailgate_server=info,async_imap=warn,tokio=warn", "MAILGATE_LOG", "mailgate-server");

    if let Err(err) = run().await {
        error!("mailgate-server exited with error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    let ticketing: Arc<dyn rest::TicketingClient> = Arc::new(HttpTicketingClient::new(config.rest.clone())?);

    let shutdown = CancellationToken::new();
    let state = AppState { ticketing: ticketing.clone(), shutdown: shutdown.clone() };

    info!(servers = config.servers.len(), "mailgate-server starting");

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));

    let mut orchestrator = Orchestrator::new(config, state.ticketing.clone(), state.shutdown.clone());
    orchestrator.run().await;

    info!("mailgate-server stopped");
    Ok(())
}
