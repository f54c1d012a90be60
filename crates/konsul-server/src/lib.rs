//! HTTP/WS/SSE/DNS transports over `konsul-core`'s coordinator.

pub mod auth;
pub mod dns;
pub mod error_response;
pub mod http;
pub mod logging;
pub mod rate_limit_middleware;
pub mod state;
pub mod watch;
