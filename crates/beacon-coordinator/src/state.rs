use std::sync::Arc;

use tokio::sync::Semaphore;

use beacon_db::Database;

use crate::config::CoordinatorConfig;
use crate::routes::pairing::PairingAttempts;
use crate::services::agent_client::AgentClient;
use crate::services::broker::EventBroker;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub config: CoordinatorConfig,
    pub broker: EventBroker,
    pub agents: AgentClient,
    pub pairing_attempts: PairingAttempts,
    /// Process-wide bound on concurrent federated-search fan-out tasks.
    pub search_limiter: Arc<Semaphore>,
}

impl AppStateInner {
    pub fn new(db: Database, config: CoordinatorConfig) -> AppState {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        Arc::new(Self {
            db,
            config,
            broker: EventBroker::new(),
            agents: AgentClient::new(),
            pairing_attempts: PairingAttempts::new(),
            search_limiter: Arc::new(Semaphore::new(workers)),
        })
    }
}
