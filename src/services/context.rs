// Service context
//
// One struct wiring every collaborator: registry, engine provider, stores,
// build manager, query service and the perf sink. Transports construct one
// of these (or the process-default) instead of reaching for globals, which
// keeps the singletons a thin default wiring.

use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;

use crate::build_store::BuildStore;
use crate::build_manager::BuildManager;
use crate::config::ServiceConfig;
use crate::engine::provider::{EngineFactory, EngineProvider, ManifestEngineFactory};
use crate::environment::EnvironmentRegistry;
use crate::errors::ApiError;
use crate::perf::PerfLogger;
use crate::query_store::QueryStore;
use crate::services::query_service::QueryService;

pub struct ServiceContext {
    pub config: ServiceConfig,
    pub registry: Arc<EnvironmentRegistry>,
    pub engine_provider: Arc<EngineProvider>,
    pub query_service: Arc<QueryService>,
    pub build_manager: Arc<BuildManager>,
    pub perf: PerfLogger,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    /// Default wiring over a loaded registry.
    pub fn new(registry: Arc<EnvironmentRegistry>, config: ServiceConfig) -> Self {
        Self::with_engine_factory(registry, config, Arc::new(ManifestEngineFactory))
    }

    pub fn with_engine_factory(
        registry: Arc<EnvironmentRegistry>,
        config: ServiceConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let perf = PerfLogger::new(config.perf_log_path.clone());
        let engine_provider = Arc::new(EngineProvider::new(registry.clone(), factory));
        let query_store = Arc::new(QueryStore::new(config.query_ttl));
        let query_service = Arc::new(QueryService::new(
            query_store,
            engine_provider.clone(),
            perf.clone(),
            config.query_max_limit,
            config.query_async_workers,
        ));
        let build_store = Arc::new(BuildStore::new());
        let build_manager = Arc::new(BuildManager::new(
            build_store,
            registry.clone(),
            engine_provider.clone(),
            &config,
        ));
        Self {
            config,
            registry,
            engine_provider,
            query_service,
            build_manager,
            perf,
        }
    }

    /// Wire a context from an explicit config file and env-derived knobs.
    pub fn from_config_path(path: &Path) -> Result<Self, ApiError> {
        let registry = Arc::new(EnvironmentRegistry::load(path)?);
        Ok(Self::new(registry, ServiceConfig::from_env()))
    }
}

static DEFAULT_CONTEXT: OnceCell<ServiceContext> = OnceCell::new();

/// Process-default context, built lazily from the default environments file
/// and environment variables. Load failures are returned, not cached.
pub fn default_context() -> Result<&'static ServiceContext, ApiError> {
    DEFAULT_CONTEXT.get_or_try_init(|| {
        let path = std::env::var(crate::environment::ENV_CONFIG_PATH)
            .unwrap_or_else(|_| "environments.yml".to_string());
        ServiceContext::from_config_path(Path::new(&path))
    })
}
