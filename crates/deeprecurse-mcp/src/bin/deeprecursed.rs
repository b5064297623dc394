use std::io;
use std::sync::Arc;

use deeprecurse_mcp::config::Transport;
use deeprecurse_mcp::{GatewayConfig, McpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "deeprecurse_mcp=info,deeprecurse_sandbox=info,deeprecurse_store=info,warn";

#[tokio::main]
async fn main() -> io::Result<()> {
    // Logs go to stderr; stdout belongs to the stdio transport.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = GatewayConfig::from_env().map_err(invalid_input)?;
    let store = config.build_store().map_err(invalid_input)?;
    let backend = config.build_backend().map_err(invalid_input)?;
    info!(
        store = store.name(),
        backend = %config.sandbox.endpoint(),
        "deeprecurse gateway starting"
    );

    let server = McpServer::new(store, backend).with_mcp_path(config.mcp_path.clone());
    match config.transport {
        Transport::Stdio => server.serve_stdio().await,
        Transport::Http => {
            let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
            Arc::new(server).serve_http(listener).await
        }
    }
}

fn invalid_input(err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}
