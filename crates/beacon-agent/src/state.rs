use std::sync::Arc;

use crate::config::AgentConfig;
use crate::db::AgentDb;
use crate::sync::CoordinatorClient;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: AgentDb,
    pub config: Arc<AgentConfig>,
    pub coordinator: CoordinatorClient,
}

impl AppStateInner {
    pub fn new(db: AgentDb, config: AgentConfig) -> AppState {
        let config = Arc::new(config);
        let coordinator = CoordinatorClient::new(config.clone());
        Arc::new(Self {
            db,
            config,
            coordinator,
        })
    }
}
