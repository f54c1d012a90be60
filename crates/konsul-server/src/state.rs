//! Shared application state handed to every handler via `web::Data`.

use std::sync::Arc;

use konsul_config::KonsulConfig;
use konsul_core::Coordinator;

use crate::auth::TokenStore;
use crate::watch::ClientWatchLimiter;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<KonsulConfig>,
    pub tokens: Arc<TokenStore>,
    pub watch_limiter: Arc<ClientWatchLimiter>,
}
