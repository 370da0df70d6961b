//! Application state shared across routes

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::game::MatchRegistry;
use crate::matchmaking::MatchmakingLobby;
use crate::store::{MatchStore, MemoryStore, RestClient, RestStore};
use crate::tournament::TournamentOrchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn MatchStore>,
    pub registry: Arc<MatchRegistry>,
    pub lobby: Arc<MatchmakingLobby>,
    pub orchestrator: Arc<TournamentOrchestrator>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn MatchStore> = match &config.store_url {
            Some(url) => {
                info!(store_url = %url, "Persisting results through the web application");
                let client = RestClient::new(url.clone(), config.store_api_key.clone().unwrap_or_default());
                Arc::new(RestStore::new(client))
            }
            None => {
                info!("STORE_URL not set, keeping results in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_store(config, store)
    }

    /// Wire every service around an explicit store
    pub fn with_store(config: Config, store: Arc<dyn MatchStore>) -> Self {
        let config = Arc::new(config);

        // Initialize match registry
        let registry = MatchRegistry::new(Arc::clone(&store), config.game.clone());

        let lobby = Arc::new(MatchmakingLobby::new(Arc::clone(&registry)));
        let orchestrator = TournamentOrchestrator::new(Arc::clone(&registry), Arc::clone(&store));

        Self {
            config,
            store,
            registry,
            lobby,
            orchestrator,
        }
    }
}
