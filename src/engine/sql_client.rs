// Warehouse SQL client seam
//
// The engine executes planned SQL through this trait. The default
// implementation resolves the adapter type and database from the dbt
// profiles file so the SQL normalizer has real credentials to work with;
// actual warehouse drivers (and test doubles) plug in behind the trait.

use async_trait::async_trait;
use serde_json::json;
use serde_yaml::Value;
use std::path::Path;

use super::EngineError;
use crate::errors::{ApiError, ErrorCode};
use crate::types::DataTable;

#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Adapter backend identifier, e.g. `postgres` or `snowflake`.
    fn adapter_type(&self) -> &str;

    /// Database the adapter credentials point at, when known.
    fn database(&self) -> Option<&str>;

    async fn execute(&self, sql: &str) -> Result<DataTable, EngineError>;
}

/// Adapter identity parsed from `profiles.yml`.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterProfile {
    pub adapter_type: String,
    pub database: Option<String>,
}

impl AdapterProfile {
    /// Read the active output of the first profile in `<dir>/profiles.yml`.
    pub fn from_profiles_dir(profiles_dir: &Path) -> Result<Self, ApiError> {
        let path = profiles_dir.join("profiles.yml");
        let raw = std::fs::read_to_string(&path).map_err(|err| {
            ApiError::new(
                ErrorCode::EngineInitFailed,
                format!("failed to read {}: {err}", path.display()),
                500,
            )
        })?;
        let doc: Value = serde_yaml::from_str(&raw).map_err(|err| {
            ApiError::new(ErrorCode::EngineInitFailed, "profiles.yml failed to parse", 500)
                .with_details(json!({"error": err.to_string()}))
        })?;
        Self::from_document(&doc).ok_or_else(|| {
            ApiError::new(
                ErrorCode::EngineInitFailed,
                format!("no usable output found in {}", path.display()),
                500,
            )
        })
    }

    fn from_document(doc: &Value) -> Option<Self> {
        let mapping = doc.as_mapping()?;
        let profile = mapping.iter().find_map(|(key, value)| {
            if key.as_str() == Some("config") {
                return None;
            }
            value.get("outputs").is_some().then_some(value)
        })?;
        let outputs = profile.get("outputs")?.as_mapping()?;
        let target = profile
            .get("target")
            .and_then(Value::as_str)
            .and_then(|target| outputs.get(Value::from(target)))
            .or_else(|| outputs.iter().next().map(|(_, value)| value))?;
        let adapter_type = target.get("type")?.as_str()?.to_string();
        let database = target
            .get("database")
            .or_else(|| target.get("dbname"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            adapter_type,
            database,
        })
    }
}

/// Credentials-only client: carries adapter identity but has no warehouse
/// connection attached. Executing through it is an execution-class error.
#[derive(Debug, Clone)]
pub struct ProfilesSqlClient {
    profile: AdapterProfile,
}

impl ProfilesSqlClient {
    pub fn new(profile: AdapterProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl SqlClient for ProfilesSqlClient {
    fn adapter_type(&self) -> &str {
        &self.profile.adapter_type
    }

    fn database(&self) -> Option<&str> {
        self.profile.database.as_deref()
    }

    async fn execute(&self, _sql: &str) -> Result<DataTable, EngineError> {
        Err(EngineError::Execution(format!(
            "no warehouse connection attached for adapter type '{}'",
            self.profile.adapter_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const PROFILES: &str = concat!(
        "config:\n",
        "  send_anonymous_usage_stats: false\n",
        "jaffle_shop:\n",
        "  target: dev\n",
        "  outputs:\n",
        "    dev:\n",
        "      type: postgres\n",
        "      host: localhost\n",
        "      dbname: analytics\n",
        "    prod:\n",
        "      type: snowflake\n",
        "      database: PROD_DB\n",
    );

    #[test]
    fn parses_active_target() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("profiles.yml"), PROFILES).unwrap();
        let profile = AdapterProfile::from_profiles_dir(dir.path()).unwrap();
        assert_eq!(profile.adapter_type, "postgres");
        assert_eq!(profile.database.as_deref(), Some("analytics"));
    }

    #[test]
    fn missing_profiles_is_engine_init_failed() {
        let dir = TempDir::new().unwrap();
        let err = AdapterProfile::from_profiles_dir(dir.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineInitFailed);
    }

    #[tokio::test]
    async fn unattached_client_fails_execution() {
        let client = ProfilesSqlClient::new(AdapterProfile {
            adapter_type: "postgres".to_string(),
            database: None,
        });
        let err = client.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));
    }
}
