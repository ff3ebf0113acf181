// Query service
//
// Prepares metric query requests (normalization and validation run once, up
// front, so errors surface synchronously even for async execution),
// dispatches them inline or onto the bounded async pool, and serves stored
// results until TTL expiry. Engine failures are mapped onto the API error
// taxonomy here; the async path instead records them on the stored query.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::provider::EngineProvider;
use crate::engine::{Engine, EngineError, EngineQueryRequest, EngineQueryResult};
use crate::errors::{ApiError, ErrorBody, ErrorCode};
use crate::filters::{filters_to_where, Filters};
use crate::perf::PerfLogger;
use crate::perf_ctx;
use crate::query_store::{QueryStore, StoredQuery};
use crate::result_encoder::encode_rows_and_columns;
use crate::services::sql_normalizer::normalize_sql_for_adapter;
use crate::types::{QueryResultDto, QueryStatus, TimeGranularity, ValidationOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricInput {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupByInput {
    pub name: String,
    pub grain: Option<TimeGranularity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByInput {
    pub descending: bool,
    pub metric: Option<MetricInput>,
    pub group_by: Option<GroupByInput>,
}

pub(crate) fn normalize_group_by(group_by: &GroupByInput) -> String {
    match group_by.grain {
        Some(grain) => format!("{}__{}", group_by.name, grain.as_suffix()),
        None => group_by.name.clone(),
    }
}

fn normalize_order_by(order_by: &OrderByInput) -> Result<String, ApiError> {
    let target = match (&order_by.metric, &order_by.group_by) {
        (Some(_), Some(_)) => {
            return Err(ApiError::validation(
                "orderBy may name either a metric or a groupBy, not both",
            ));
        }
        (None, None) => {
            return Err(ApiError::validation(
                "orderBy must name a metric or a groupBy",
            ));
        }
        (Some(metric), None) => metric.name.clone(),
        (None, Some(group_by)) => normalize_group_by(group_by),
    };
    if order_by.descending {
        Ok(format!("-{target}"))
    } else {
        Ok(target)
    }
}

struct PreparedQuery {
    engine: Arc<Engine>,
    request: EngineQueryRequest,
    where_constraints: Vec<String>,
    group_by_names: Vec<String>,
    order_by_names: Vec<String>,
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<QueryStore>,
    engine_provider: Arc<EngineProvider>,
    perf: PerfLogger,
    max_limit: u64,
    worker_permits: Arc<Semaphore>,
}

impl QueryService {
    pub fn new(
        store: Arc<QueryStore>,
        engine_provider: Arc<EngineProvider>,
        perf: PerfLogger,
        max_limit: u64,
        async_workers: usize,
    ) -> Self {
        Self {
            store,
            engine_provider,
            perf,
            max_limit,
            worker_permits: Arc::new(Semaphore::new(async_workers.max(1))),
        }
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    fn prepare(
        &self,
        project_id: &str,
        metrics: &[MetricInput],
        group_by: &[GroupByInput],
        filters: Option<&Filters>,
        order_by: &[OrderByInput],
        limit: Option<u64>,
        request_id: Option<&str>,
    ) -> Result<PreparedQuery, ApiError> {
        let metric_names: Vec<String> = metrics.iter().map(|metric| metric.name.clone()).collect();
        let group_by_names: Vec<String> = group_by.iter().map(normalize_group_by).collect();
        let order_by_names: Vec<String> = order_by
            .iter()
            .map(normalize_order_by)
            .collect::<Result<_, _>>()?;

        let engine = self.engine_provider.get_engine(project_id)?;
        let entity_names = engine.entity_names();
        let where_constraints = filters_to_where(
            filters,
            &group_by_names,
            (!entity_names.is_empty()).then_some(&entity_names),
        )?;

        let request = EngineQueryRequest {
            request_id: request_id.map(str::to_string),
            metric_names,
            group_by_names: group_by_names.clone(),
            where_constraints: where_constraints.clone(),
            order_by_names: order_by_names.clone(),
            limit: limit.map(|limit| limit.min(self.max_limit)),
        };
        Ok(PreparedQuery {
            engine,
            request,
            where_constraints,
            group_by_names,
            order_by_names,
        })
    }

    /// Create a query and either run it inline or hand it to the async
    /// pool. Returns the query id; async callers poll `get_query_result`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_query(
        &self,
        project_id: &str,
        metrics: &[MetricInput],
        group_by: &[GroupByInput],
        filters: Option<&Filters>,
        order_by: &[OrderByInput],
        limit: Option<u64>,
        async_run: bool,
    ) -> Result<String, ApiError> {
        let query_id = Uuid::new_v4().to_string();
        let perf = self.perf.span(
            "query_service:create_query",
            perf_ctx! {
                "query_id" => query_id.clone(),
                "metrics" => metrics.len(),
                "group_by" => group_by.len(),
                "async" => async_run,
            },
        );

        let prepared = match self.prepare(
            project_id,
            metrics,
            group_by,
            filters,
            order_by,
            limit,
            Some(&query_id),
        ) {
            Ok(prepared) => prepared,
            Err(err) => {
                perf.finish(perf_ctx! {"status" => "ERROR", "error" => err.to_string()});
                return Err(err);
            }
        };

        let mut stored = StoredQuery::new(
            &query_id,
            project_id,
            if async_run {
                QueryStatus::Pending
            } else {
                QueryStatus::Running
            },
        );
        stored.request_payload = Some(json!({
            "metrics": prepared.request.metric_names,
            "group_by": prepared.group_by_names,
            "where": prepared.where_constraints,
            "order_by": prepared.order_by_names,
            "limit": limit,
        }));
        self.store.set(stored);

        if async_run {
            let service = self.clone();
            let project_id = project_id.to_string();
            let worker_query_id = query_id.clone();
            let request = prepared.request.clone();
            tokio::spawn(async move {
                let _permit = service
                    .worker_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("query worker semaphore is never closed");
                service.run_query(&project_id, &worker_query_id, request).await;
            });
            perf.finish(perf_ctx! {"status" => "PENDING"});
            return Ok(query_id);
        }

        match prepared.engine.query(&prepared.request).await {
            Ok(result) => {
                self.record_success(&query_id, &prepared.engine, result);
                perf.finish(perf_ctx! {"status" => "SUCCESSFUL"});
                Ok(query_id)
            }
            Err(engine_err) => {
                let err = map_engine_error(&engine_err, ErrorCode::QueryExecutionFailed);
                self.store.update(&query_id, |stored| {
                    stored.status = QueryStatus::Failed;
                    stored.error = Some(engine_err.to_string());
                });
                perf.finish(perf_ctx! {"status" => "ERROR", "error" => err.to_string()});
                Err(err)
            }
        }
    }

    /// Async worker body. Nothing escapes: every failure lands in the
    /// stored query's error field with a FAILED status.
    async fn run_query(&self, project_id: &str, query_id: &str, request: EngineQueryRequest) {
        let perf = self.perf.span(
            "query_service:run_query",
            perf_ctx! {"query_id" => query_id, "async" => true},
        );
        self.store.update(query_id, |stored| {
            stored.status = QueryStatus::Running;
        });

        let engine = match self.engine_provider.get_engine(project_id) {
            Ok(engine) => engine,
            Err(err) => {
                error!(query_id, "engine unavailable for async query: {err}");
                self.store.update(query_id, |stored| {
                    stored.status = QueryStatus::Failed;
                    stored.error = Some(err.message.clone());
                });
                perf.finish(perf_ctx! {"status" => "FAILED", "error" => err.to_string()});
                return;
            }
        };
        match engine.query(&request).await {
            Ok(result) => {
                self.record_success(query_id, &engine, result);
                perf.finish(perf_ctx! {"status" => "SUCCESSFUL"});
            }
            Err(err) => {
                self.store.update(query_id, |stored| {
                    stored.status = QueryStatus::Failed;
                    stored.error = Some(err.to_string());
                });
                perf.finish(perf_ctx! {"status" => "FAILED", "error" => err.to_string()});
            }
        }
    }

    fn record_success(&self, query_id: &str, engine: &Engine, result: EngineQueryResult) {
        let sql = normalize_sql_for_adapter(Some(result.sql), engine);
        let (columns, rows) = encode_rows_and_columns(&result.table);
        self.store.update(query_id, |stored| {
            stored.status = QueryStatus::Successful;
            stored.sql = sql.clone();
            stored.columns = Some(columns.clone());
            stored.rows = Some(rows.clone());
            stored.warnings = result.warnings.clone();
            stored.total_pages = Some(1);
            stored.error = None;
        });
        info!(query_id, "query completed");
    }

    pub fn get_query_result(
        &self,
        project_id: &str,
        query_id: &str,
    ) -> Result<QueryResultDto, ApiError> {
        let (stored, expired) = self.store.get(query_id);
        if expired {
            return Err(ApiError::new(
                ErrorCode::QueryExpired,
                format!("queryId={query_id} has expired"),
                410,
            ));
        }
        let stored = match stored {
            Some(stored) if stored.project_id == project_id => stored,
            _ => {
                return Err(ApiError::new(
                    ErrorCode::QueryNotFound,
                    format!("queryId={query_id} not found"),
                    404,
                ));
            }
        };
        if !stored.status.is_terminal() {
            return Ok(QueryResultDto {
                status: stored.status,
                sql: stored.sql,
                columns: None,
                rows: None,
                warnings: None,
                total_pages: Some(1),
                error: stored.error,
            });
        }
        Ok(stored.to_result())
    }

    /// Compile the request to SQL without executing it.
    pub fn compile_sql(
        &self,
        project_id: &str,
        metrics: &[MetricInput],
        group_by: &[GroupByInput],
        filters: Option<&Filters>,
        order_by: &[OrderByInput],
        limit: Option<u64>,
    ) -> Result<String, ApiError> {
        let perf = self.perf.span(
            "query_service:compile_sql",
            perf_ctx! {"metrics" => metrics.len(), "group_by" => group_by.len()},
        );
        let prepared =
            match self.prepare(project_id, metrics, group_by, filters, order_by, limit, None) {
                Ok(prepared) => prepared,
                Err(err) => {
                    perf.finish(perf_ctx! {"status" => "ERROR", "error" => err.to_string()});
                    return Err(err);
                }
            };
        match prepared.engine.explain(&prepared.request) {
            Ok(sql) => {
                let sql = normalize_sql_for_adapter(Some(sql), &prepared.engine)
                    .unwrap_or_default();
                perf.finish(perf_ctx! {"status" => "SUCCESSFUL", "sql_length" => sql.len()});
                Ok(sql)
            }
            Err(err) => {
                let api_err = map_engine_error(&err, ErrorCode::QueryCompileFailed);
                perf.finish(perf_ctx! {"status" => "ERROR", "error" => api_err.to_string()});
                Err(api_err)
            }
        }
    }

    /// Run preparation only, reporting problems instead of failing.
    pub fn validate_query(
        &self,
        project_id: &str,
        metrics: &[MetricInput],
        group_by: &[GroupByInput],
        filters: Option<&Filters>,
        order_by: &[OrderByInput],
        limit: Option<u64>,
    ) -> ValidationOutcome {
        match self.prepare(project_id, metrics, group_by, filters, order_by, limit, None) {
            Ok(_) => ValidationOutcome {
                errors: Vec::new(),
                warnings: Vec::new(),
            },
            Err(err) => ValidationOutcome {
                errors: vec![ErrorBody {
                    code: err.code,
                    message: err.message,
                    details: err.details,
                }],
                warnings: Vec::new(),
            },
        }
    }

    pub async fn get_dimension_values(
        &self,
        project_id: &str,
        dimension: &str,
        metrics: &[String],
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ApiError> {
        let engine = self.engine_provider.get_engine(project_id)?;
        engine
            .dimension_values(dimension, metrics, start_time, end_time)
            .await
            .map_err(|err| map_engine_error(&err, ErrorCode::QueryExecutionFailed))
    }
}

/// Map an engine failure onto the API taxonomy. Execution-class failures
/// use `execution_code` so compile paths report QUERY_COMPILE_FAILED.
fn map_engine_error(err: &EngineError, execution_code: ErrorCode) -> ApiError {
    match err {
        EngineError::UnknownMetric(_) => {
            ApiError::new(ErrorCode::MetricNotFound, err.to_string(), 404)
        }
        EngineError::InvalidQuery(_) => ApiError::validation(err.to_string()),
        EngineError::Execution(_) | EngineError::Internal(_) => {
            ApiError::new(execution_code, err.to_string(), 500)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_normalization_appends_grain() {
        let plain = GroupByInput {
            name: "region".to_string(),
            grain: None,
        };
        assert_eq!(normalize_group_by(&plain), "region");
        let grained = GroupByInput {
            name: "order_date".to_string(),
            grain: Some(TimeGranularity::Day),
        };
        assert_eq!(normalize_group_by(&grained), "order_date__day");
    }

    #[test]
    fn order_by_requires_exactly_one_target() {
        let metric = MetricInput {
            name: "revenue".to_string(),
        };
        let group_by = GroupByInput {
            name: "region".to_string(),
            grain: None,
        };

        let both = OrderByInput {
            descending: false,
            metric: Some(metric.clone()),
            group_by: Some(group_by.clone()),
        };
        assert_eq!(
            normalize_order_by(&both).unwrap_err().code,
            ErrorCode::ValidationError
        );

        let neither = OrderByInput {
            descending: false,
            metric: None,
            group_by: None,
        };
        assert_eq!(
            normalize_order_by(&neither).unwrap_err().code,
            ErrorCode::ValidationError
        );

        let descending_metric = OrderByInput {
            descending: true,
            metric: Some(metric),
            group_by: None,
        };
        assert_eq!(normalize_order_by(&descending_metric).unwrap(), "-revenue");

        let ascending_group = OrderByInput {
            descending: false,
            metric: None,
            group_by: Some(group_by),
        };
        assert_eq!(normalize_order_by(&ascending_group).unwrap(), "region");
    }

    #[test]
    fn engine_errors_map_to_api_taxonomy() {
        let unknown = map_engine_error(
            &EngineError::UnknownMetric("margin".to_string()),
            ErrorCode::QueryExecutionFailed,
        );
        assert_eq!(unknown.code, ErrorCode::MetricNotFound);
        assert_eq!(unknown.status, 404);

        let invalid = map_engine_error(
            &EngineError::InvalidQuery("bad".to_string()),
            ErrorCode::QueryExecutionFailed,
        );
        assert_eq!(invalid.code, ErrorCode::ValidationError);
        assert_eq!(invalid.status, 422);

        let execution = map_engine_error(
            &EngineError::Execution("boom".to_string()),
            ErrorCode::QueryExecutionFailed,
        );
        assert_eq!(execution.code, ErrorCode::QueryExecutionFailed);

        let compile = map_engine_error(
            &EngineError::Internal("boom".to_string()),
            ErrorCode::QueryCompileFailed,
        );
        assert_eq!(compile.code, ErrorCode::QueryCompileFailed);
        assert_eq!(compile.status, 500);
    }
}
