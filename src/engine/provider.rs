// Per-project engine cache
//
// Lazily constructs heavyweight engines keyed by project id and swaps them
// atomically on rebuild. Readers take an Arc; an in-flight query keeps the
// pre-swap engine alive until its handle drops.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::sql_client::{AdapterProfile, ProfilesSqlClient};
use super::Engine;
use crate::environment::{EnvironmentConfig, EnvironmentRegistry};
use crate::errors::ApiError;
use crate::manifest::load_manifest;

/// Constructs an engine for an environment. Construction failures must not
/// leave anything behind; the provider installs the result all-or-nothing.
pub trait EngineFactory: Send + Sync {
    fn build(&self, env: &EnvironmentConfig) -> Result<Arc<Engine>, ApiError>;
}

/// Default factory: parse the on-disk semantic manifest (with artifact
/// fallback) and attach a credentials-only SQL client resolved from the
/// environment's profiles directory.
pub struct ManifestEngineFactory;

impl EngineFactory for ManifestEngineFactory {
    fn build(&self, env: &EnvironmentConfig) -> Result<Arc<Engine>, ApiError> {
        let manifest = load_manifest(env)?;
        let profile = AdapterProfile::from_profiles_dir(&env.profiles_dir)?;
        info!(
            project_id = %env.project_id,
            adapter = %profile.adapter_type,
            "constructed engine"
        );
        Ok(Arc::new(Engine::new(
            manifest,
            Arc::new(ProfilesSqlClient::new(profile)),
        )))
    }
}

pub struct EngineProvider {
    registry: Arc<EnvironmentRegistry>,
    factory: Arc<dyn EngineFactory>,
    cache: RwLock<HashMap<String, Arc<Engine>>>,
}

impl EngineProvider {
    pub fn new(registry: Arc<EnvironmentRegistry>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            registry,
            factory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached read first, then a double-checked insertion under the write
    /// lock so concurrent first requests build the engine once.
    pub fn get_engine(&self, project_id: &str) -> Result<Arc<Engine>, ApiError> {
        if let Some(engine) = self.cache.read().get(project_id) {
            return Ok(engine.clone());
        }
        let env = self.registry.get(project_id)?;
        let mut cache = self.cache.write();
        if let Some(engine) = cache.get(project_id) {
            return Ok(engine.clone());
        }
        let engine = self.factory.build(&env)?;
        cache.insert(project_id.to_string(), engine.clone());
        Ok(engine)
    }

    /// Rebuild the engine for a project. Without `force` an existing entry
    /// is kept; with `force` it is evicted before construction, so a failed
    /// rebuild leaves the slot empty for the next lazy `get_engine`.
    pub fn rebuild_engine(&self, project_id: &str, force: bool) -> Result<Arc<Engine>, ApiError> {
        let env = self.registry.get(project_id)?;
        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(project_id) {
            if !force {
                return Ok(existing.clone());
            }
            cache.remove(project_id);
        }
        let engine = self.factory.build(&env)?;
        cache.insert(project_id.to_string(), engine.clone());
        info!(project_id, force, "engine installed");
        Ok(engine)
    }

    pub fn cached_project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
