//! HTTP + WebSocket transport.
//!
//! Thin layer over the coordinator: tenant resolution from the request
//! host, bearer-token authentication, the §6.1 route table, and the
//! per-session push socket.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod ws;

pub use error::{ApiError, ApiResult};
pub use routes::build_app;
pub use server::{run_server, start_background_server};
pub use state::{ApiConfig, AppState};
