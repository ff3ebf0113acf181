// Metadata catalog
//
// Read-only listings over the engine's semantic manifest: metrics with
// their dimensions, dimensions on their own, and semantic models with the
// metrics and dimensions they expose. Ordering is stable and duplicates are
// collapsed first-wins.

use std::collections::BTreeMap;

use crate::engine::Engine;
use crate::errors::{ApiError, ErrorCode};
use crate::manifest::{ManifestDimension, ManifestMetric, SemanticModel};
use crate::services::query_service::{normalize_group_by, GroupByInput};
use crate::types::{
    DimensionDto, DimensionKind, MetricDto, MetricKind, MetricSummaryDto, SemanticModelDetailDto,
    SemanticModelDto, TimeGranularity,
};

/// Grains a time dimension may be queried at through the service.
pub const QUERYABLE_GRANULARITIES: [TimeGranularity; 5] = [
    TimeGranularity::Day,
    TimeGranularity::Week,
    TimeGranularity::Month,
    TimeGranularity::Quarter,
    TimeGranularity::Year,
];

const METRIC_TIME: &str = "metric_time";
const METRIC_TIME_LABEL: &str = "Date";

fn metric_time_model() -> SemanticModelDto {
    SemanticModelDto {
        name: "time_spine".to_string(),
        label: Some("Time spine".to_string()),
        description: Some("Shared date spine for metric_time".to_string()),
    }
}

fn metric_kind(metric: &ManifestMetric) -> MetricKind {
    match metric
        .metric_type
        .as_deref()
        .unwrap_or("simple")
        .to_ascii_lowercase()
        .as_str()
    {
        "ratio" => MetricKind::Ratio,
        "cumulative" => MetricKind::Cumulative,
        "derived" => MetricKind::Derived,
        "conversion" => MetricKind::Conversion,
        _ => MetricKind::Simple,
    }
}

fn model_dto(model: &SemanticModel) -> SemanticModelDto {
    SemanticModelDto {
        name: model.name.clone(),
        label: model.label.clone(),
        description: model.description.clone(),
    }
}

fn dimension_dto(dimension: &ManifestDimension, model: &SemanticModel) -> DimensionDto {
    let kind = if dimension.is_time() {
        DimensionKind::Time
    } else {
        DimensionKind::Categorical
    };
    let mut label = dimension.label.clone();
    let mut semantic_model = Some(model_dto(model));
    if dimension.name == METRIC_TIME {
        label = label.or_else(|| Some(METRIC_TIME_LABEL.to_string()));
        semantic_model = semantic_model.or_else(|| Some(metric_time_model()));
    }
    DimensionDto {
        name: dimension.name.clone(),
        description: dimension.description.clone(),
        label,
        kind,
        queryable_granularities: if kind == DimensionKind::Time {
            QUERYABLE_GRANULARITIES.to_vec()
        } else {
            Vec::new()
        },
        semantic_model,
    }
}

fn dedupe_dimensions(dimensions: Vec<DimensionDto>) -> Vec<DimensionDto> {
    let mut seen = std::collections::HashSet::new();
    dimensions
        .into_iter()
        .filter(|dimension| seen.insert(dimension.name.clone()))
        .collect()
}

fn metric_dto(engine: &Engine, metric: &ManifestMetric) -> MetricDto {
    let manifest = engine.manifest();
    let model = manifest.model_for_metric(metric);
    let dimensions = model
        .map(|model| {
            dedupe_dimensions(
                model
                    .dimensions
                    .iter()
                    .map(|dimension| dimension_dto(dimension, model))
                    .collect(),
            )
        })
        .unwrap_or_default();
    MetricDto {
        name: metric.name.clone(),
        description: metric.description.clone(),
        label: metric.label.clone(),
        kind: metric_kind(metric),
        queryable_granularities: QUERYABLE_GRANULARITIES.to_vec(),
        dimensions,
        semantic_models: model.map(|model| vec![model_dto(model)]).unwrap_or_default(),
    }
}

pub fn list_metrics(engine: &Engine) -> Vec<MetricDto> {
    engine
        .manifest()
        .metrics
        .iter()
        .map(|metric| metric_dto(engine, metric))
        .collect()
}

/// Dimensions across all models, or only those reachable from the given
/// metrics. An unknown metric name is a METRIC_NOT_FOUND.
pub fn list_dimensions(
    engine: &Engine,
    metric_names: Option<&[String]>,
) -> Result<Vec<DimensionDto>, ApiError> {
    let manifest = engine.manifest();
    let mut dimensions = Vec::new();
    match metric_names {
        None => {
            for model in &manifest.semantic_models {
                dimensions.extend(
                    model
                        .dimensions
                        .iter()
                        .map(|dimension| dimension_dto(dimension, model)),
                );
            }
        }
        Some(names) => {
            for name in names {
                let metric = manifest.metric(name).ok_or_else(|| {
                    ApiError::new(
                        ErrorCode::MetricNotFound,
                        format!("unknown metric: {name}"),
                        404,
                    )
                })?;
                if let Some(model) = manifest.model_for_metric(metric) {
                    dimensions.extend(
                        model
                            .dimensions
                            .iter()
                            .map(|dimension| dimension_dto(dimension, model)),
                    );
                }
            }
        }
    }
    Ok(dedupe_dimensions(dimensions))
}

/// Semantic models with the metrics and dimensions they expose, sorted by
/// model name.
pub fn list_semantic_models(engine: &Engine) -> Vec<SemanticModelDetailDto> {
    let manifest = engine.manifest();
    let mut details: BTreeMap<String, SemanticModelDetailDto> = BTreeMap::new();
    for model in &manifest.semantic_models {
        details.insert(
            model.name.clone(),
            SemanticModelDetailDto {
                name: model.name.clone(),
                label: model.label.clone(),
                description: model.description.clone(),
                metrics: Vec::new(),
                dimensions: dedupe_dimensions(
                    model
                        .dimensions
                        .iter()
                        .map(|dimension| dimension_dto(dimension, model))
                        .collect(),
                ),
            },
        );
    }
    for metric in &manifest.metrics {
        let Some(model) = manifest.model_for_metric(metric) else {
            continue;
        };
        if let Some(detail) = details.get_mut(&model.name) {
            if !detail.metrics.iter().any(|existing| existing.name == metric.name) {
                detail.metrics.push(MetricSummaryDto {
                    name: metric.name.clone(),
                    description: metric.description.clone(),
                    label: metric.label.clone(),
                    kind: metric_kind(metric),
                });
            }
        }
    }
    details.into_values().collect()
}

/// Metrics queryable with every one of the requested dimensions. A grained
/// request matches only time dimensions; an empty request matches all.
pub fn metrics_for_dimensions(engine: &Engine, dimensions: &[GroupByInput]) -> Vec<MetricDto> {
    if dimensions.is_empty() {
        return list_metrics(engine);
    }
    let manifest = engine.manifest();
    manifest
        .metrics
        .iter()
        .filter(|metric| {
            let Some(model) = manifest.model_for_metric(metric) else {
                return false;
            };
            dimensions.iter().all(|requested| {
                model.dimensions.iter().any(|candidate| {
                    if requested.grain.is_some() {
                        // a normalized name__grain column also matches directly
                        (candidate.name == requested.name && candidate.is_time())
                            || candidate.name == normalize_group_by(requested)
                    } else {
                        candidate.name == requested.name
                    }
                })
            })
        })
        .map(|metric| metric_dto(engine, metric))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sql_client::SqlClient;
    use crate::engine::EngineError;
    use crate::manifest::SemanticManifest;
    use crate::types::DataTable;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct StubClient;

    #[async_trait]
    impl SqlClient for StubClient {
        fn adapter_type(&self) -> &str {
            "postgres"
        }
        fn database(&self) -> Option<&str> {
            None
        }
        async fn execute(&self, _sql: &str) -> Result<DataTable, EngineError> {
            Ok(DataTable::default())
        }
    }

    fn engine() -> Engine {
        let manifest = SemanticManifest::from_json(crate::manifest::SAMPLE_MANIFEST).unwrap();
        Engine::new(manifest, Arc::new(StubClient))
    }

    #[test]
    fn list_metrics_includes_model_dimensions() {
        let engine = engine();
        let metrics = list_metrics(&engine);
        assert_eq!(metrics.len(), 2);
        let revenue = &metrics[0];
        assert_eq!(revenue.name, "revenue");
        assert_eq!(revenue.kind, MetricKind::Simple);
        assert_eq!(revenue.semantic_models[0].name, "orders");
        let names: Vec<&str> = revenue.dimensions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["region", "order_date"]);
        let order_date = &revenue.dimensions[1];
        assert_eq!(order_date.kind, DimensionKind::Time);
        assert_eq!(order_date.queryable_granularities.len(), 5);
    }

    #[test]
    fn list_dimensions_filters_by_metric() {
        let engine = engine();
        let all = list_dimensions(&engine, None).unwrap();
        assert_eq!(all.len(), 2);
        let filtered =
            list_dimensions(&engine, Some(&["revenue".to_string()])).unwrap();
        assert_eq!(filtered.len(), 2);
        let err = list_dimensions(&engine, Some(&["margin".to_string()])).unwrap_err();
        assert_eq!(err.code, ErrorCode::MetricNotFound);
    }

    #[test]
    fn list_semantic_models_groups_metrics() {
        let engine = engine();
        let models = list_semantic_models(&engine);
        assert_eq!(models.len(), 1);
        let orders = &models[0];
        assert_eq!(orders.name, "orders");
        let metric_names: Vec<&str> = orders.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(metric_names, vec!["revenue", "orders_total"]);
    }

    #[test]
    fn metrics_for_dimensions_matches_grained_requests() {
        let engine = engine();
        let all = metrics_for_dimensions(&engine, &[]);
        assert_eq!(all.len(), 2);

        let by_region = metrics_for_dimensions(
            &engine,
            &[GroupByInput {
                name: "region".to_string(),
                grain: None,
            }],
        );
        assert_eq!(by_region.len(), 2);

        let by_day = metrics_for_dimensions(
            &engine,
            &[GroupByInput {
                name: "order_date".to_string(),
                grain: Some(TimeGranularity::Day),
            }],
        );
        assert_eq!(by_day.len(), 2);

        let grained_categorical = metrics_for_dimensions(
            &engine,
            &[GroupByInput {
                name: "region".to_string(),
                grain: Some(TimeGranularity::Day),
            }],
        );
        assert!(grained_categorical.is_empty());

        let unknown = metrics_for_dimensions(
            &engine,
            &[GroupByInput {
                name: "warehouse".to_string(),
                grain: None,
            }],
        );
        assert!(unknown.is_empty());
    }
}
