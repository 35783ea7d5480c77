//! Application state shared by request handlers.

use std::sync::Arc;

use chairlift_ingest::IngressGateway;

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Publishes accepted rides to the queue.
    pub gateway: Arc<IngressGateway>,
}

impl AppState {
    pub fn new(gateway: Arc<IngressGateway>) -> Self {
        Self { gateway }
    }
}
