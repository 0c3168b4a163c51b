use std::sync::Arc;

use crate::{
    audit::AuditLog,
    blocklist::Blocklist,
    cache::{Cache, MemoryCache},
    database::Database,
    defense::ClientDefense,
    env::Environment,
    error::Result,
    parameters::ParameterStore,
    session::SessionStore,
};

#[derive(Clone)]
pub struct AppState {
    pub env: Arc<Environment>,
    pub cache: Arc<dyn Cache>,
    pub database: Database,
    pub parameters: ParameterStore,
    pub audit: AuditLog,
    pub blocklist: Blocklist,
    pub defense: ClientDefense,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(env: Environment, cache: Arc<dyn Cache>, database: Database) -> Self {
        let parameters = ParameterStore::new(cache.clone(), database.clone());
        let audit = AuditLog::new(database.clone(), parameters.clone());
        let blocklist = Blocklist::new(database.clone(), cache.clone(), parameters.clone());
        let defense = ClientDefense::new(
            cache.clone(),
            parameters.clone(),
            audit.clone(),
            blocklist.clone(),
            env.routes.clone(),
        );

        Self {
            env: Arc::new(env),
            sessions: SessionStore::new(cache.clone()),
            cache,
            database,
            parameters,
            audit,
            blocklist,
            defense,
        }
    }

    /// Self-contained state over an in-process cache and an in-memory
    /// database, with default parameters seeded.
    pub async fn in_memory(env: Environment) -> Result<Self> {
        let database = Database::in_memory().await?;
        let state = Self::new(env, Arc::new(MemoryCache::new()), database);
        state.parameters.seed_defaults().await?;
        Ok(state)
    }
}
