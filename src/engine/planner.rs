// Metric query planner
//
// Lowers a prepared engine request into warehouse SQL against the semantic
// manifest: simple metrics become aggregates over their backing measure,
// grouped by the requested dimensions (time dimensions truncated to their
// grain). WHERE fragments arrive as template strings from the filter
// compiler; dimension templates are rendered into WHERE, metric templates
// into HAVING.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{EngineError, EngineQueryRequest};
use crate::manifest::{ManifestDimension, SemanticManifest, SemanticModel};
use crate::types::TimeGranularity;

static DIMENSION_TEMPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*Dimension\('([^']*)'\)\s*\}\}").expect("valid dimension template regex")
});
static TIME_DIMENSION_TEMPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*TimeDimension\('([^']*)',\s*'([^']*)'\)\s*\}\}")
        .expect("valid time dimension template regex")
});
static METRIC_TEMPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*Metric\('([^']*)',\s*group_by=\[[^\]]*\]\)\s*\}\}")
        .expect("valid metric template regex")
});

pub struct QueryPlanner<'a> {
    manifest: &'a SemanticManifest,
}

struct SelectedMetric<'a> {
    name: &'a str,
    aggregate: String,
}

struct SelectedGroupBy<'a> {
    alias: String,
    dimension: &'a ManifestDimension,
    grain: Option<TimeGranularity>,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(manifest: &'a SemanticManifest) -> Self {
        Self { manifest }
    }

    /// Plan one request into a SQL statement.
    pub fn plan(&self, request: &EngineQueryRequest) -> Result<String, EngineError> {
        if request.metric_names.is_empty() {
            return Err(EngineError::InvalidQuery(
                "at least one metric is required".to_string(),
            ));
        }

        let mut model: Option<&SemanticModel> = None;
        let mut metrics: Vec<SelectedMetric> = Vec::new();
        for name in &request.metric_names {
            let metric = self
                .manifest
                .metric(name)
                .ok_or_else(|| EngineError::UnknownMetric(name.clone()))?;
            if !metric
                .metric_type
                .as_deref()
                .unwrap_or("simple")
                .eq_ignore_ascii_case("simple")
            {
                return Err(EngineError::InvalidQuery(format!(
                    "metric '{name}' is not a simple metric"
                )));
            }
            let measure_name = metric
                .type_params
                .as_ref()
                .and_then(|params| params.measure.as_ref())
                .map(|measure| measure.name.as_str())
                .ok_or_else(|| {
                    EngineError::InvalidQuery(format!("metric '{name}' has no input measure"))
                })?;
            let (measure_model, measure) =
                self.manifest.model_for_measure(measure_name).ok_or_else(|| {
                    EngineError::InvalidQuery(format!(
                        "measure '{measure_name}' of metric '{name}' is not defined"
                    ))
                })?;
            match model {
                None => model = Some(measure_model),
                Some(existing) if std::ptr::eq(existing, measure_model) => {}
                Some(existing) => {
                    return Err(EngineError::InvalidQuery(format!(
                        "metrics span semantic models '{}' and '{}'",
                        existing.name, measure_model.name
                    )));
                }
            }
            metrics.push(SelectedMetric {
                name,
                aggregate: aggregate_sql(measure.agg.as_deref(), measure.sql_expr())?,
            });
        }
        let model = model.expect("at least one metric resolved");

        let mut group_bys: Vec<SelectedGroupBy> = Vec::new();
        for name in &request.group_by_names {
            group_bys.push(self.resolve_group_by(model, name)?);
        }

        let mut select_items: Vec<String> = Vec::new();
        for group_by in &group_bys {
            select_items.push(format!(
                "{} AS {}",
                dimension_sql(group_by.dimension, group_by.grain),
                group_by.alias
            ));
        }
        for metric in &metrics {
            select_items.push(format!("{} AS {}", metric.aggregate, metric.name));
        }

        let relation = model.node_relation.qualified_name().ok_or_else(|| {
            EngineError::InvalidQuery(format!(
                "semantic model '{}' has no warehouse relation",
                model.name
            ))
        })?;

        let (where_clauses, having_clauses) =
            self.render_constraints(model, &request.where_constraints)?;

        let mut sql = format!("SELECT\n  {}\nFROM {relation}", select_items.join(",\n  "));
        if !where_clauses.is_empty() {
            sql.push_str(&format!("\nWHERE {}", where_clauses.join(" AND ")));
        }
        if !group_bys.is_empty() {
            let positions: Vec<String> = (1..=group_bys.len()).map(|i| i.to_string()).collect();
            sql.push_str(&format!("\nGROUP BY {}", positions.join(", ")));
        }
        if !having_clauses.is_empty() {
            sql.push_str(&format!("\nHAVING {}", having_clauses.join(" AND ")));
        }
        if !request.order_by_names.is_empty() {
            let order_items = self.resolve_order_by(request, &metrics, &group_bys)?;
            sql.push_str(&format!("\nORDER BY {}", order_items.join(", ")));
        }
        if let Some(limit) = request.limit {
            sql.push_str(&format!("\nLIMIT {limit}"));
        }
        Ok(sql)
    }

    fn resolve_group_by(
        &self,
        model: &'a SemanticModel,
        name: &str,
    ) -> Result<SelectedGroupBy<'a>, EngineError> {
        let (base, grain) = match name.rsplit_once("__") {
            Some((base, suffix)) => match TimeGranularity::parse(suffix) {
                Some(grain) => (base, Some(grain)),
                None => (name, None),
            },
            None => (name, None),
        };
        let dimension = model
            .dimensions
            .iter()
            .find(|dimension| dimension.name == base)
            .ok_or_else(|| {
                EngineError::InvalidQuery(format!(
                    "unknown dimension '{base}' for semantic model '{}'",
                    model.name
                ))
            })?;
        if grain.is_some() && !dimension.is_time() {
            return Err(EngineError::InvalidQuery(format!(
                "dimension '{base}' does not support a time grain"
            )));
        }
        Ok(SelectedGroupBy {
            alias: name.to_string(),
            dimension,
            grain,
        })
    }

    fn resolve_order_by(
        &self,
        request: &EngineQueryRequest,
        metrics: &[SelectedMetric],
        group_bys: &[SelectedGroupBy],
    ) -> Result<Vec<String>, EngineError> {
        let mut items = Vec::new();
        for raw in &request.order_by_names {
            let (name, descending) = match raw.strip_prefix('-') {
                Some(name) => (name, true),
                None => (raw.as_str(), false),
            };
            let known = metrics.iter().any(|metric| metric.name == name)
                || group_bys.iter().any(|group_by| group_by.alias == name);
            if !known {
                return Err(EngineError::InvalidQuery(format!(
                    "orderBy target '{name}' is not part of the query"
                )));
            }
            items.push(if descending {
                format!("{name} DESC")
            } else {
                name.to_string()
            });
        }
        Ok(items)
    }

    /// Split rendered constraint fragments into WHERE and HAVING clauses.
    /// A fragment referencing any metric template aggregates, so the whole
    /// fragment moves to HAVING.
    fn render_constraints(
        &self,
        model: &SemanticModel,
        constraints: &[String],
    ) -> Result<(Vec<String>, Vec<String>), EngineError> {
        let mut where_clauses = Vec::new();
        let mut having_clauses = Vec::new();
        for constraint in constraints {
            let rendered = self.render_templates(model, constraint)?;
            if METRIC_TEMPLATE.is_match(constraint) {
                having_clauses.push(rendered);
            } else {
                where_clauses.push(rendered);
            }
        }
        Ok((where_clauses, having_clauses))
    }

    fn render_templates(
        &self,
        model: &SemanticModel,
        fragment: &str,
    ) -> Result<String, EngineError> {
        let mut failure: Option<EngineError> = None;
        let lookup_dimension = |name: &str| -> Option<&ManifestDimension> {
            model
                .dimensions
                .iter()
                .find(|dimension| dimension.name == name)
                .or_else(|| self.manifest.find_dimension(name).map(|(_, dim)| dim))
        };

        let rendered = DIMENSION_TEMPLATE.replace_all(fragment, |caps: &Captures| {
            let name = &caps[1];
            match lookup_dimension(name) {
                Some(dimension) => dimension.sql_expr().to_string(),
                None => {
                    failure = Some(EngineError::InvalidQuery(format!(
                        "unknown dimension '{name}' in filter"
                    )));
                    String::new()
                }
            }
        });
        let rendered = TIME_DIMENSION_TEMPLATE.replace_all(&rendered, |caps: &Captures| {
            let name = &caps[1];
            let grain = &caps[2];
            match lookup_dimension(name) {
                Some(dimension) => {
                    format!("DATE_TRUNC('{grain}', {})", dimension.sql_expr())
                }
                None => {
                    failure = Some(EngineError::InvalidQuery(format!(
                        "unknown time dimension '{name}' in filter"
                    )));
                    String::new()
                }
            }
        });
        let rendered = METRIC_TEMPLATE.replace_all(&rendered, |caps: &Captures| {
            let name = &caps[1];
            let resolved = self.manifest.metric(name).and_then(|metric| {
                let measure = metric.type_params.as_ref()?.measure.as_ref()?;
                let (_, measure) = self.manifest.model_for_measure(&measure.name)?;
                aggregate_sql(measure.agg.as_deref(), measure.sql_expr()).ok()
            });
            match resolved {
                Some(aggregate) => aggregate,
                None => {
                    failure = Some(EngineError::InvalidQuery(format!(
                        "unknown metric '{name}' in filter"
                    )));
                    String::new()
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(rendered.into_owned()),
        }
    }
}

fn dimension_sql(dimension: &ManifestDimension, grain: Option<TimeGranularity>) -> String {
    match grain {
        Some(grain) => format!("DATE_TRUNC('{}', {})", grain.as_suffix(), dimension.sql_expr()),
        None => dimension.sql_expr().to_string(),
    }
}

fn aggregate_sql(agg: Option<&str>, expr: &str) -> Result<String, EngineError> {
    let agg = agg.unwrap_or("sum").to_ascii_lowercase();
    let sql = match agg.as_str() {
        "sum" => format!("SUM({expr})"),
        "min" => format!("MIN({expr})"),
        "max" => format!("MAX({expr})"),
        "avg" | "average" => format!("AVG({expr})"),
        "count" => format!("COUNT({expr})"),
        "count_distinct" => format!("COUNT(DISTINCT {expr})"),
        "sum_boolean" => format!("SUM(CASE WHEN {expr} THEN 1 ELSE 0 END)"),
        other => {
            return Err(EngineError::InvalidQuery(format!(
                "unsupported aggregation '{other}'"
            )));
        }
    };
    Ok(sql)
}
