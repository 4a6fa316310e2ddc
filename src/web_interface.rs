// Web Interface module root
use std::sync::Arc;

use crate::session_management::ConnectionOrchestrator;
use crate::storage::Storage;

pub mod auth;
pub mod live_channel;
pub mod routes;
pub mod types;
pub mod web_server;

// Re-export commonly used items
pub use auth::{AuthGate, Unauthorized, SESSION_COOKIE};
pub use live_channel::live_route;
pub use web_server::{handle_rejection, WebServer};

/// Shared dependencies cloned into every route.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ConnectionOrchestrator,
    pub storage: Arc<dyn Storage>,
    pub auth: Arc<AuthGate>,
}

impl AppState {
    pub fn new(orchestrator: ConnectionOrchestrator, auth: Arc<AuthGate>) -> Self {
        Self {
            storage: orchestrator.storage().clone(),
            orchestrator,
            auth,
        }
    }
}
