// Semantic manifest model
//
// Serde model of the compiled semantic manifest artifact: semantic models
// (warehouse relation, entities, dimensions, measures) and metrics. The
// lookup built on top is what the engine consults for entity names, metric
// resolution and catalog listings.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::environment::EnvironmentConfig;
use crate::errors::{ApiError, ErrorCode};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticManifest {
    #[serde(default)]
    pub semantic_models: Vec<SemanticModel>,
    #[serde(default)]
    pub metrics: Vec<ManifestMetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticModel {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub node_relation: NodeRelation,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub dimensions: Vec<ManifestDimension>,
    #[serde(default)]
    pub measures: Vec<Measure>,
}

/// Warehouse relation a semantic model reads from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRelation {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub relation_name: Option<String>,
}

impl NodeRelation {
    /// Fully qualified relation, preferring the precomputed name.
    pub fn qualified_name(&self) -> Option<String> {
        if let Some(name) = &self.relation_name {
            return Some(name.clone());
        }
        let alias = self.alias.as_deref()?;
        let mut parts = Vec::new();
        if let Some(database) = &self.database {
            parts.push(database.as_str());
        }
        if let Some(schema) = &self.schema_name {
            parts.push(schema.as_str());
        }
        parts.push(alias);
        Some(parts.join("."))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDimension {
    pub name: String,
    #[serde(rename = "type", default)]
    pub dimension_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub type_params: Option<DimensionTypeParams>,
}

impl ManifestDimension {
    pub fn is_time(&self) -> bool {
        self.dimension_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("time"))
    }

    /// Column expression behind the dimension, defaulting to its name.
    pub fn sql_expr(&self) -> &str {
        self.expr.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionTypeParams {
    #[serde(default)]
    pub time_granularity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    #[serde(default)]
    pub agg: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

impl Measure {
    pub fn sql_expr(&self) -> &str {
        self.expr.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetric {
    pub name: String,
    #[serde(rename = "type", default)]
    pub metric_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub type_params: Option<MetricTypeParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricTypeParams {
    #[serde(default)]
    pub measure: Option<MeasureReference>,
    #[serde(default)]
    pub numerator: Option<MeasureReference>,
    #[serde(default)]
    pub denominator: Option<MeasureReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureReference {
    pub name: String,
}

impl SemanticManifest {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn metric(&self, name: &str) -> Option<&ManifestMetric> {
        self.metrics.iter().find(|metric| metric.name == name)
    }

    /// All entity names across semantic models; the legal targets of a
    /// metric-rule group_by.
    pub fn entity_names(&self) -> HashSet<String> {
        self.semantic_models
            .iter()
            .flat_map(|model| model.entities.iter().map(|entity| entity.name.clone()))
            .collect()
    }

    pub fn model_for_measure(&self, measure_name: &str) -> Option<(&SemanticModel, &Measure)> {
        self.semantic_models.iter().find_map(|model| {
            model
                .measures
                .iter()
                .find(|measure| measure.name == measure_name)
                .map(|measure| (model, measure))
        })
    }

    /// Semantic model backing a metric, resolved through its input measure.
    pub fn model_for_metric(&self, metric: &ManifestMetric) -> Option<&SemanticModel> {
        let measure = metric.type_params.as_ref()?.measure.as_ref()?;
        self.model_for_measure(&measure.name).map(|(model, _)| model)
    }

    pub fn find_dimension(&self, name: &str) -> Option<(&SemanticModel, &ManifestDimension)> {
        self.semantic_models.iter().find_map(|model| {
            model
                .dimensions
                .iter()
                .find(|dimension| dimension.name == name)
                .map(|dimension| (model, dimension))
        })
    }
}

/// Load the manifest for an environment.
///
/// The configured semantic-manifest file is preferred; when it is absent the
/// dbt artifact manifest is probed for an embedded `semantic_manifest`
/// object before giving up with MANIFEST_NOT_FOUND.
pub fn load_manifest(env: &EnvironmentConfig) -> Result<SemanticManifest, ApiError> {
    let path = &env.semantic_manifest_path;
    if path.exists() {
        debug!(path = %path.display(), "parsing semantic manifest");
        return parse_manifest_file(path);
    }
    let artifact_path = env.project_dir.join("target").join("manifest.json");
    if artifact_path.exists() {
        debug!(path = %artifact_path.display(), "falling back to dbt artifact manifest");
        return parse_embedded_manifest(&artifact_path);
    }
    Err(ApiError::new(
        ErrorCode::ManifestNotFound,
        format!("semantic manifest not found: {}", path.display()),
        500,
    ))
}

fn parse_manifest_file(path: &Path) -> Result<SemanticManifest, ApiError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ApiError::new(
            ErrorCode::ManifestInvalid,
            format!("failed to read semantic manifest: {err}"),
            500,
        )
    })?;
    SemanticManifest::from_json(&raw).map_err(|err| {
        ApiError::new(ErrorCode::ManifestInvalid, "semantic manifest failed to parse", 500)
            .with_details(json!({"error": err.to_string()}))
    })
}

fn parse_embedded_manifest(path: &Path) -> Result<SemanticManifest, ApiError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        ApiError::new(
            ErrorCode::ManifestInvalid,
            format!("failed to read artifact manifest: {err}"),
            500,
        )
    })?;
    let doc: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
        ApiError::new(ErrorCode::ManifestInvalid, "artifact manifest failed to parse", 500)
            .with_details(json!({"error": err.to_string()}))
    })?;
    let embedded = doc.get("semantic_manifest").cloned().ok_or_else(|| {
        ApiError::new(
            ErrorCode::ManifestNotFound,
            format!("artifact manifest has no semantic_manifest: {}", path.display()),
            500,
        )
    })?;
    serde_json::from_value(embedded).map_err(|err| {
        ApiError::new(ErrorCode::ManifestInvalid, "embedded semantic manifest is invalid", 500)
            .with_details(json!({"error": err.to_string()}))
    })
}

/// Fixture manifest shared by engine and service tests.
#[cfg(test)]
pub(crate) const SAMPLE_MANIFEST: &str = r#"{
        "semantic_models": [
            {
                "name": "orders",
                "description": "Order fact table",
                "node_relation": {
                    "alias": "orders",
                    "schema_name": "public",
                    "database": "analytics",
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
                    {"name": "order_total", "agg": "sum", "expr": "amount"},
                    {"name": "order_count", "agg": "count", "expr": "1"}
                ]
            }
        ],
        "metrics": [
            {
                "name": "revenue",
                "type": "simple",
                "label": "Revenue",
                "type_params": {"measure": {"name": "order_total"}}
            },
            {
                "name": "orders_total",
                "type": "simple",
                "type_params": {"measure": {"name": "order_count"}}
            }
        ]
    }"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn env_with_dir(dir: &TempDir) -> EnvironmentConfig {
        EnvironmentConfig {
            project_id: "p1".to_string(),
            name: None,
            project_dir: dir.path().to_path_buf(),
            profiles_dir: dir.path().to_path_buf(),
            semantic_manifest_path: dir.path().join("target/semantic_manifest.json"),
            repo_url: None,
            default_ref: None,
            tokens: vec!["t".to_string()],
        }
    }

    #[test]
    fn parses_models_metrics_and_entities() {
        let manifest = SemanticManifest::from_json(SAMPLE_MANIFEST).unwrap();
        assert_eq!(manifest.semantic_models.len(), 1);
        assert_eq!(manifest.metrics.len(), 2);
        let entities = manifest.entity_names();
        assert!(entities.contains("order"));
        assert!(entities.contains("customer"));

        let metric = manifest.metric("revenue").unwrap();
        let model = manifest.model_for_metric(metric).unwrap();
        assert_eq!(model.name, "orders");
        let (_, dimension) = manifest.find_dimension("order_date").unwrap();
        assert!(dimension.is_time());
        assert_eq!(dimension.sql_expr(), "ordered_at");
    }

    #[test]
    fn qualified_name_prefers_relation_name() {
        let manifest = SemanticManifest::from_json(SAMPLE_MANIFEST).unwrap();
        let relation = &manifest.semantic_models[0].node_relation;
        assert_eq!(
            relation.qualified_name().unwrap(),
            "\"analytics\".\"public\".\"orders\""
        );
        let assembled = NodeRelation {
            alias: Some("orders".to_string()),
            schema_name: Some("public".to_string()),
            database: None,
            relation_name: None,
        };
        assert_eq!(assembled.qualified_name().unwrap(), "public.orders");
    }

    #[test]
    fn load_prefers_semantic_manifest_file() {
        let dir = TempDir::new().unwrap();
        let env = env_with_dir(&dir);
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(&env.semantic_manifest_path, SAMPLE_MANIFEST).unwrap();
        let manifest = load_manifest(&env).unwrap();
        assert_eq!(manifest.metrics.len(), 2);
    }

    #[test]
    fn load_falls_back_to_embedded_artifact() {
        let dir = TempDir::new().unwrap();
        let env = env_with_dir(&dir);
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        let artifact = format!("{{\"nodes\": {{}}, \"semantic_manifest\": {SAMPLE_MANIFEST}}}");
        std::fs::write(dir.path().join("target/manifest.json"), artifact).unwrap();
        let manifest = load_manifest(&env).unwrap();
        assert_eq!(manifest.semantic_models[0].name, "orders");
    }

    #[test]
    fn missing_everything_is_manifest_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load_manifest(&env_with_dir(&dir)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ManifestNotFound);
    }

    #[test]
    fn unparseable_manifest_is_manifest_invalid() {
        let dir = TempDir::new().unwrap();
        let env = env_with_dir(&dir);
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(&env.semantic_manifest_path, "{not json").unwrap();
        let err = load_manifest(&env).unwrap_err();
        assert_eq!(err.code, ErrorCode::ManifestInvalid);
        assert!(err.details.is_some());
    }
}
