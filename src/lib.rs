// metricflowd - multi-tenant semantic-layer metric query and build service
// Root library module

pub mod auth;
pub mod build_manager;
pub mod build_store;
pub mod config;
pub mod engine;
pub mod environment;
pub mod errors;
pub mod filters;
pub mod infra;
pub mod manifest;
pub mod observability;
pub mod perf;
pub mod query_store;
pub mod result_encoder;
pub mod services;
pub mod types;

// Re-export key types
pub use observability::{init_logging, init_logging_with_level};

pub use errors::{ApiError, ErrorBody, ErrorCode, ResponseEnvelope};

pub use types::{
    BuildStatus, CellValue, ColumnDto, ColumnKind, DataTable, DimensionDto, DimensionKind,
    FieldType, MetricDto, MetricKind, QueryResultDto, QueryStatus, RowDto, SemanticModelDetailDto,
    SemanticModelDto, TimeGranularity, ValidationOutcome,
};

pub use config::ServiceConfig;
pub use environment::{get_environment, EnvironmentConfig, EnvironmentRegistry};

pub use filters::{
    filters_to_where, filters_to_where_at, format_value, FilterGroup, FilterGroupItem, FilterRule,
    FilterSettings, FilterTarget, FilterValue, Filters,
};

pub use engine::provider::{EngineFactory, EngineProvider, ManifestEngineFactory};
pub use engine::sql_client::{AdapterProfile, ProfilesSqlClient, SqlClient};
pub use engine::{Engine, EngineError, EngineQueryRequest, EngineQueryResult};
pub use manifest::{load_manifest, SemanticManifest};

pub use build_manager::BuildManager;
pub use build_store::{BuildPersistence, BuildRecord, BuildStore};
pub use query_store::{QueryPersistence, QueryStore, StoredQuery};

pub use result_encoder::encode_rows_and_columns;

pub use auth::authorize_project;
pub use perf::{PerfLogger, PerfSpan};

pub use services::{
    default_context, list_dimensions, list_metrics, list_semantic_models, metrics_for_dimensions,
    normalize_sql_for_adapter, GroupByInput, MetricInput, OrderByInput, QueryService,
    ServiceContext,
};
