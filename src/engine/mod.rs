// Semantic engine
//
// An Engine couples a parsed semantic manifest with a warehouse SQL client.
// It turns prepared metric requests into SQL (explain) and materialized
// tables (query). Engines are owned by the EngineProvider; request handlers
// hold an Arc that stays valid across a rebuild swap.

pub mod planner;
pub mod provider;
pub mod sql_client;

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::engine::planner::QueryPlanner;
use crate::engine::sql_client::SqlClient;
use crate::manifest::SemanticManifest;
use crate::types::{CellValue, ColumnKind, DataTable};
use chrono::{DateTime, Utc};

/// Engine failure classes, mapped to the API error taxonomy by the query
/// service.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("query execution failed: {0}")]
    Execution(String),
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Prepared request handed to the engine. All normalization happened in the
/// query service; names here are final (`name__grain`, `-descending`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineQueryRequest {
    /// Correlation id; equals the service-assigned query id.
    pub request_id: Option<String>,
    pub metric_names: Vec<String>,
    pub group_by_names: Vec<String>,
    pub where_constraints: Vec<String>,
    pub order_by_names: Vec<String>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineQueryResult {
    pub sql: String,
    pub table: DataTable,
    pub warnings: Option<Vec<String>>,
}

pub struct Engine {
    manifest: SemanticManifest,
    sql_client: Arc<dyn SqlClient>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("manifest", &self.manifest)
            .field("sql_client", &"<dyn SqlClient>")
            .finish()
    }
}

impl Engine {
    pub fn new(manifest: SemanticManifest, sql_client: Arc<dyn SqlClient>) -> Self {
        Self {
            manifest,
            sql_client,
        }
    }

    pub fn manifest(&self) -> &SemanticManifest {
        &self.manifest
    }

    pub fn sql_client(&self) -> &Arc<dyn SqlClient> {
        &self.sql_client
    }

    pub fn adapter_type(&self) -> &str {
        self.sql_client.adapter_type()
    }

    pub fn database(&self) -> Option<&str> {
        self.sql_client.database()
    }

    /// Entity names exposed by the manifest; the legal metric-filter
    /// group_by targets.
    pub fn entity_names(&self) -> HashSet<String> {
        self.manifest.entity_names()
    }

    /// Plan a request without executing it.
    pub fn explain(&self, request: &EngineQueryRequest) -> Result<String, EngineError> {
        let sql = QueryPlanner::new(&self.manifest).plan(request)?;
        debug!(
            request_id = request.request_id.as_deref().unwrap_or("-"),
            "planned query"
        );
        Ok(sql)
    }

    /// Plan and execute a request against the warehouse.
    pub async fn query(
        &self,
        request: &EngineQueryRequest,
    ) -> Result<EngineQueryResult, EngineError> {
        let sql = self.explain(request)?;
        let table = self.sql_client.execute(&sql).await?;
        Ok(EngineQueryResult {
            sql,
            table,
            warnings: None,
        })
    }

    /// Distinct values of a dimension, optionally constrained to a time
    /// window on the dimension's semantic model.
    pub async fn dimension_values(
        &self,
        dimension: &str,
        _metric_names: &[String],
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, EngineError> {
        let (model, resolved) = self.manifest.find_dimension(dimension).ok_or_else(|| {
            EngineError::InvalidQuery(format!("unknown dimension '{dimension}'"))
        })?;
        let relation = model.node_relation.qualified_name().ok_or_else(|| {
            EngineError::InvalidQuery(format!(
                "semantic model '{}' has no warehouse relation",
                model.name
            ))
        })?;
        let mut sql = format!(
            "SELECT DISTINCT {} AS {dimension}\nFROM {relation}",
            resolved.sql_expr()
        );
        let time_expr = model
            .dimensions
            .iter()
            .find(|candidate| candidate.is_time())
            .map(|candidate| candidate.sql_expr().to_string());
        if let (Some(time_expr), true) = (&time_expr, start_time.is_some() || end_time.is_some()) {
            let mut bounds = Vec::new();
            if let Some(start) = start_time {
                bounds.push(format!("{time_expr} >= '{}'", start.format("%Y-%m-%d %H:%M:%S")));
            }
            if let Some(end) = end_time {
                bounds.push(format!("{time_expr} <= '{}'", end.format("%Y-%m-%d %H:%M:%S")));
            }
            sql.push_str(&format!("\nWHERE {}", bounds.join(" AND ")));
        }
        sql.push_str("\nORDER BY 1");
        let table = self.sql_client.execute(&sql).await?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.first())
            .map(cell_to_string)
            .collect())
    }
}

fn cell_to_string(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => String::new(),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Int(n) => n.to_string(),
        CellValue::Float(f) => f.to_string(),
        CellValue::Decimal(s) | CellValue::Text(s) => s.clone(),
        CellValue::Timestamp(dt) => dt.to_rfc3339(),
        CellValue::Date(d) => d.to_string(),
    }
}

/// Column kind helper for SQL clients assembling tables by hand.
pub fn column(name: &str, kind: ColumnKind) -> (String, ColumnKind) {
    (name.to_string(), kind)
}
