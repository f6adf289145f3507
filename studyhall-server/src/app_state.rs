use std::sync::Arc;

use sqlx::PgPool;

use crate::realtime::{Broadcaster, ConnectionRegistry, PresenceTracker};
use shared::config::server::Config;

/// State shared across all routes. The registry and presence tracker
/// live here for the process lifetime; the pool is optional so the
/// router can be built (and health endpoints served) before the
/// database is reachable.
#[derive(Clone)]
pub struct AppState {
    pub(crate) pool: Option<PgPool>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) presence: Arc<PresenceTracker>,
}

impl AppState {
    pub fn new(config: &Config, pool: Option<PgPool>) -> Self {
        Self {
            pool,
            registry: ConnectionRegistry::new(&config.realtime),
            presence: Arc::new(PresenceTracker::new(&config.presence)),
        }
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.registry.clone())
    }
}
