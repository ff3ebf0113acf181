// Services layer - business logic behind the transport surface
//
// The transport (HTTP/GraphQL) is an external collaborator; everything it
// calls lives here so alternative surfaces stay in feature parity.

pub mod catalog;
pub mod context;
pub mod query_service;
pub mod sql_normalizer;

pub use catalog::{
    list_dimensions, list_metrics, list_semantic_models, metrics_for_dimensions,
    QUERYABLE_GRANULARITIES,
};
pub use context::{default_context, ServiceContext};
pub use query_service::{GroupByInput, MetricInput, OrderByInput, QueryService};
pub use sql_normalizer::normalize_sql_for_adapter;
