//! Server bootstrap.

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::routes::build_app;
use crate::state::AppState;

/// Build the router and parse the listen address.
pub fn create_server(
    state: Arc<AppState>,
) -> Result<(Router, SocketAddr), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = state.config.listen_addr.parse()?;
    Ok((build_app(state), addr))
}

/// Run the API server until the task is cancelled.
pub async fn run_server(
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (router, addr) = create_server(state)?;
    tracing::info!("MallQuest API listening on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Start the server in the background and return the bound address;
/// used by tests and the interactive CLI.
pub async fn start_background_server(
    state: Arc<AppState>,
) -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
    let (router, addr) = create_server(state)?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(error = %err, "server error");
        }
    });
    Ok(actual_addr)
}
