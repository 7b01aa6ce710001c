//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::router::HostResolver;
use crate::tunnel::{ClientManager, ManagerOptions};

/// Shared application state for the broker.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Registry of live tunnels.
    pub manager: ClientManager,
    /// Maps `Host` headers to tunnel ids.
    pub resolver: HostResolver,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let manager = ClientManager::new(ManagerOptions::from_config(&config));
        let resolver = HostResolver::new(config.server.domain.as_deref());
        Self {
            config: Arc::new(config),
            manager,
            resolver,
            start_time: Instant::now(),
        }
    }

    /// URL scheme handed to tunnel clients.
    pub fn scheme(&self) -> &'static str {
        if self.config.server.secure {
            "https"
        } else {
            "http"
        }
    }
}
