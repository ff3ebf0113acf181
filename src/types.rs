// Cross-cutting DTOs and enums
//
// Wire-facing types are serde structs with camelCase field names so the
// transport layer can serialize them unchanged. The tabular result types at
// the bottom are the engine-side input to the result encoder.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time grains a time dimension can be queried at, finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeGranularity {
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGranularity {
    pub const ALL: [TimeGranularity; 11] = [
        TimeGranularity::Nanosecond,
        TimeGranularity::Microsecond,
        TimeGranularity::Millisecond,
        TimeGranularity::Second,
        TimeGranularity::Minute,
        TimeGranularity::Hour,
        TimeGranularity::Day,
        TimeGranularity::Week,
        TimeGranularity::Month,
        TimeGranularity::Quarter,
        TimeGranularity::Year,
    ];

    /// Lowercase form used in `name__grain` suffixes and filter settings.
    pub fn as_suffix(&self) -> &'static str {
        match self {
            TimeGranularity::Nanosecond => "nanosecond",
            TimeGranularity::Microsecond => "microsecond",
            TimeGranularity::Millisecond => "millisecond",
            TimeGranularity::Second => "second",
            TimeGranularity::Minute => "minute",
            TimeGranularity::Hour => "hour",
            TimeGranularity::Day => "day",
            TimeGranularity::Week => "week",
            TimeGranularity::Month => "month",
            TimeGranularity::Quarter => "quarter",
            TimeGranularity::Year => "year",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|grain| grain.as_suffix() == lowered)
    }
}

impl fmt::Display for TimeGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_suffix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DimensionKind {
    Categorical,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Simple,
    Ratio,
    Cumulative,
    Derived,
    Conversion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Pending,
    Running,
    Compiled,
    Successful,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Successful | QueryStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticModelDto {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDto {
    pub name: String,
    pub description: Option<String>,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub kind: DimensionKind,
    pub queryable_granularities: Vec<TimeGranularity>,
    pub semantic_model: Option<SemanticModelDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDto {
    pub name: String,
    pub description: Option<String>,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub queryable_granularities: Vec<TimeGranularity>,
    pub dimensions: Vec<DimensionDto>,
    pub semantic_models: Vec<SemanticModelDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummaryDto {
    pub name: String,
    pub description: Option<String>,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub kind: MetricKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticModelDetailDto {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub metrics: Vec<MetricSummaryDto>,
    pub dimensions: Vec<DimensionDto>,
}

/// Column type as surfaced to clients, inferred by the result encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Date,
    Timestamp,
    Number,
    Boolean,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDto {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

pub type RowDto = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResultDto {
    pub status: QueryStatus,
    pub sql: Option<String>,
    pub columns: Option<Vec<ColumnDto>>,
    pub rows: Option<Vec<RowDto>>,
    pub warnings: Option<Vec<String>>,
    pub total_pages: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub errors: Vec<crate::errors::ErrorBody>,
    pub warnings: Vec<String>,
}

/// Warehouse-side column type, before client-facing inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Timestamp,
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
}

/// One cell of a warehouse result.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Fixed-point value carried as its decimal string form.
    Decimal(String),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

/// Tabular result handed back by a SQL client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub columns: Vec<(String, ColumnKind)>,
    pub rows: Vec<Vec<CellValue>>,
}

impl DataTable {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_round_trips_through_suffix() {
        for grain in TimeGranularity::ALL {
            assert_eq!(TimeGranularity::parse(grain.as_suffix()), Some(grain));
        }
        assert_eq!(TimeGranularity::parse("DAY"), Some(TimeGranularity::Day));
        assert_eq!(TimeGranularity::parse("fortnight"), None);
    }

    #[test]
    fn query_status_terminal_states() {
        assert!(QueryStatus::Successful.is_terminal());
        assert!(QueryStatus::Failed.is_terminal());
        assert!(!QueryStatus::Pending.is_terminal());
        assert!(!QueryStatus::Running.is_terminal());
        assert!(!QueryStatus::Compiled.is_terminal());
    }

    #[test]
    fn result_dto_uses_camel_case_total_pages() {
        let dto = QueryResultDto {
            status: QueryStatus::Successful,
            sql: Some("SELECT 1".to_string()),
            columns: Some(vec![]),
            rows: Some(vec![]),
            warnings: None,
            total_pages: Some(1),
            error: None,
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["totalPages"], 1);
        assert_eq!(json["status"], "SUCCESSFUL");
    }

    #[test]
    fn field_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FieldType::Timestamp).unwrap(),
            "\"timestamp\""
        );
    }
}
