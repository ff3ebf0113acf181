// Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use metricflowd::{
    CellValue, ColumnKind, DataTable, Engine, EngineError, EngineFactory, EnvironmentConfig,
    EnvironmentRegistry, SemanticManifest, ServiceConfig, ServiceContext, SqlClient,
};

pub const MANIFEST_JSON: &str = r#"{
    "semantic_models": [
        {
            "name": "orders",
            "description": "Order fact table",
            "node_relation": {
                "relation_name": "\"analytics\".\"public\".\"orders\""
            },
            "entities": [
                {"name": "order", "type": "primary", "expr": "order_id"},
                {"name": "customer", "type": "foreign", "expr": "customer_id"}
            ],
            "dimensions": [
                {"name": "region", "type": "categorical"},
                {
                    "name": "order_date",
                    "type": "time",
                    "expr": "ordered_at",
                    "type_params": {"time_granularity": "day"}
                }
            ],
            "measures": [
                {"name": "order_total", "agg": "sum", "expr": "amount"}
            ]
        }
    ],
    "metrics": [
        {
            "name": "revenue",
            "type": "simple",
            "label": "Revenue",
            "type_params": {"measure": {"name": "order_total"}}
        }
    ]
}"#;

/// SQL client double with a canned table, optional latency and optional
/// failure.
pub struct StaticSqlClient {
    pub table: DataTable,
    pub adapter: String,
    pub database: Option<String>,
    pub delay: Option<Duration>,
    pub fail_with: Option<String>,
}

impl Default for StaticSqlClient {
    fn default() -> Self {
        Self {
            table: sample_table(),
            adapter: "postgres".to_string(),
            database: Some("analytics".to_string()),
            delay: None,
            fail_with: None,
        }
    }
}

#[async_trait]
impl SqlClient for StaticSqlClient {
    fn adapter_type(&self) -> &str {
        &self.adapter
    }

    fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    async fn execute(&self, _sql: &str) -> Result<DataTable, EngineError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.fail_with {
            return Err(EngineError::Execution(message.clone()));
        }
        Ok(self.table.clone())
    }
}

pub fn sample_table() -> DataTable {
    DataTable {
        columns: vec![
            ("order_date__day".to_string(), ColumnKind::Timestamp),
            ("revenue".to_string(), ColumnKind::Decimal),
        ],
        rows: vec![vec![
            CellValue::Date(chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
            CellValue::Decimal("123.45".to_string()),
        ]],
    }
}

pub struct StaticEngineFactory {
    pub client: Arc<dyn SqlClient>,
}

impl EngineFactory for StaticEngineFactory {
    fn build(&self, _env: &EnvironmentConfig) -> Result<Arc<Engine>, metricflowd::ApiError> {
        let manifest = SemanticManifest::from_json(MANIFEST_JSON).expect("fixture manifest parses");
        Ok(Arc::new(Engine::new(manifest, self.client.clone())))
    }
}

pub fn write_environments(dir: &Path, project_id: &str) -> std::path::PathBuf {
    let project_dir = dir.join(project_id);
    std::fs::create_dir_all(&project_dir).unwrap();
    let config_path = dir.join("environments.yml");
    std::fs::write(
        &config_path,
        format!(
            "environments:\n  - project_id: {project_id}\n    project_dir: {}\n    tokens: [secret]\n",
            project_dir.display()
        ),
    )
    .unwrap();
    config_path
}

/// Context wired with the static engine factory and the given SQL client.
pub fn test_context(dir: &Path, client: Arc<dyn SqlClient>, config: ServiceConfig) -> ServiceContext {
    let config_path = write_environments(dir, "p1");
    let registry = Arc::new(EnvironmentRegistry::load(&config_path).unwrap());
    ServiceContext::with_engine_factory(registry, config, Arc::new(StaticEngineFactory { client }))
}
