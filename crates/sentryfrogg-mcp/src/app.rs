use sentryfrogg_conn::{ApiManager, PgManager, SecretResolver, SshManager, VaultClient};
use sentryfrogg_engine::{PipelineEngine, RunbookEngine};
use sentryfrogg_store::{Store, StoreError};

// ── Application wiring ───────────────────────────────────────────
//
// Everything shared process-wide: the stores plus one manager per
// substrate. Managers register invalidation hooks on the profile store
// at construction, so profile upsert/delete evicts pools and sessions.

#[derive(Clone)]
pub struct App {
    pub store: Store,
    pub resolver: SecretResolver,
    pub vault: VaultClient,
    pub pg: PgManager,
    pub ssh: SshManager,
    pub api: ApiManager,
    pub runbooks: RunbookEngine,
    pub pipelines: PipelineEngine,
}

impl App {
    pub fn new(store: Store) -> Self {
        let vault = VaultClient::new(store.profiles.clone());
        let resolver = SecretResolver::new(store.profiles.clone(), vault.clone());
        let pg = PgManager::new(store.profiles.clone(), resolver.clone());
        let ssh = SshManager::new(store.profiles.clone(), resolver.clone());
        let api = ApiManager::new(store.profiles.clone(), resolver.clone(), store.cache.clone());
        let runbooks = RunbookEngine::new(store.state.clone());
        let pipelines = PipelineEngine::new(
            pg.clone(),
            ssh.clone(),
            api.clone(),
            store.audit.clone(),
        );
        Self {
            store,
            resolver,
            vault,
            pg,
            ssh,
            api,
            runbooks,
            pipelines,
        }
    }

    /// Open every store under the default base directory and wire managers.
    pub fn open() -> Result<Self, StoreError> {
        Ok(Self::new(Store::open()?))
    }
}
