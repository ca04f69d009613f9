//! Application state

use std::sync::Arc;

use kiln_core::HostBridge;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Session or fallback responder behind the host bridge contract
    pub bridge: Arc<dyn HostBridge>,
}

impl AppState {
    pub fn new(bridge: impl HostBridge + 'static) -> Self {
        Self {
            bridge: Arc::new(bridge),
        }
    }

    /// Run a blocking bridge call off the async workers.
    pub async fn run<T, F>(&self, f: F) -> Result<T, tokio::task::JoinError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn HostBridge) -> T + Send + 'static,
    {
        let bridge = Arc::clone(&self.bridge);
        tokio::task::spawn_blocking(move || f(bridge.as_ref())).await
    }
}
