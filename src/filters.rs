// Filter compiler
//
// Lowers the recursive filter AST into WHERE-clause fragments consumable by
// the semantic engine. Target expressions are emitted as engine templates
// ({{ Dimension(..) }}, {{ TimeDimension(.., grain) }}, {{ Metric(..) }});
// relative-time operators are resolved to concrete UTC windows at compile
// time. All input malformations surface as VALIDATION_ERROR with enough
// details to locate the offending rule.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::warn;

use crate::errors::ApiError;
use crate::types::TimeGranularity;

const RELATIVE_OPERATORS: [&str; 4] = [
    "inThePast",
    "inTheNext",
    "inTheCurrent",
    "notInTheCurrent",
];

/// Monday, matching the warehouse week convention.
const WEEK_START_OFFSET: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTarget {
    #[serde(rename = "fieldId", alias = "field_id")]
    pub field_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(rename = "unitOfTime", alias = "unit_of_time", default)]
    pub unit_of_time: Option<String>,
    #[serde(default)]
    pub completed: Option<bool>,
    #[serde(rename = "groupBy", alias = "group_by", default)]
    pub group_by: Option<Vec<String>>,
}

/// A literal filter value. String-typed wire values stay strings; the
/// date/datetime variants exist for callers constructing rules in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: String,
    pub target: FilterTarget,
    pub operator: String,
    #[serde(default)]
    pub values: Option<Vec<FilterValue>>,
    #[serde(default)]
    pub settings: Option<FilterSettings>,
    #[serde(default)]
    pub disabled: bool,
}

/// Either a leaf rule or a nested group. The exactly-one-of invariant is
/// carried by the sum type itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterGroupItem {
    Rule(FilterRule),
    Group(FilterGroup),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "and", alias = "and_items", default)]
    pub and_items: Option<Vec<FilterGroupItem>>,
    #[serde(rename = "or", alias = "or_items", default)]
    pub or_items: Option<Vec<FilterGroupItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub dimensions: Option<FilterGroup>,
    #[serde(default)]
    pub metrics: Option<FilterGroup>,
    #[serde(rename = "tableCalculations", alias = "table_calculations", default)]
    pub table_calculations: Option<FilterGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetDomain {
    Dimension,
    Metric,
    TableCalculation,
}

/// Compile a filter tree into WHERE fragments.
///
/// Returns `[]` when nothing contributes a clause, otherwise exactly one
/// string with the top-level domain clauses parenthesized and AND-joined.
pub fn filters_to_where(
    filters: Option<&Filters>,
    group_by_names: &[String],
    entity_names: Option<&HashSet<String>>,
) -> Result<Vec<String>, ApiError> {
    filters_to_where_at(filters, group_by_names, entity_names, Utc::now())
}

/// Compile with an explicit `now`, so relative-time windows are testable.
pub fn filters_to_where_at(
    filters: Option<&Filters>,
    group_by_names: &[String],
    entity_names: Option<&HashSet<String>>,
    now: DateTime<Utc>,
) -> Result<Vec<String>, ApiError> {
    let Some(filters) = filters else {
        return Ok(Vec::new());
    };
    let compiler = Compiler {
        group_by_names,
        entity_names,
        now,
    };
    let mut clauses = Vec::new();
    for (group, domain) in [
        (filters.dimensions.as_ref(), TargetDomain::Dimension),
        (filters.metrics.as_ref(), TargetDomain::Metric),
        (
            filters.table_calculations.as_ref(),
            TargetDomain::TableCalculation,
        ),
    ] {
        if let Some(clause) = compiler.group_sql(group, domain)? {
            clauses.push(clause);
        }
    }
    if clauses.is_empty() {
        return Ok(Vec::new());
    }
    let joined = clauses
        .iter()
        .map(|clause| format!("({clause})"))
        .collect::<Vec<_>>()
        .join(" AND ");
    Ok(vec![joined])
}

struct Compiler<'a> {
    group_by_names: &'a [String],
    entity_names: Option<&'a HashSet<String>>,
    now: DateTime<Utc>,
}

impl Compiler<'_> {
    fn group_sql(
        &self,
        group: Option<&FilterGroup>,
        domain: TargetDomain,
    ) -> Result<Option<String>, ApiError> {
        let Some(group) = group else {
            return Ok(None);
        };
        let (items, joiner) = resolve_group_items(group)?;
        let mut parts = Vec::new();
        for item in items {
            let part = match item {
                FilterGroupItem::Rule(rule) => self.rule_sql(rule, domain)?,
                FilterGroupItem::Group(nested) => self.group_sql(Some(nested), domain)?,
            };
            if let Some(part) = part {
                parts.push(part);
            }
        }
        Ok(match parts.len() {
            0 => None,
            1 => Some(parts.remove(0)),
            _ => Some(
                parts
                    .iter()
                    .map(|part| format!("({part})"))
                    .collect::<Vec<_>>()
                    .join(&format!(" {joiner} ")),
            ),
        })
    }

    fn rule_sql(&self, rule: &FilterRule, domain: TargetDomain) -> Result<Option<String>, ApiError> {
        if rule.disabled {
            return Ok(None);
        }
        if domain == TargetDomain::TableCalculation {
            return Ok(None);
        }
        let group_by_override = rule
            .settings
            .as_ref()
            .and_then(|settings| settings.group_by.as_deref())
            .filter(|names| !names.is_empty());
        if domain == TargetDomain::Metric {
            let Some(override_names) = group_by_override else {
                warn!(
                    rule_id = %rule.id,
                    field_id = %rule.target.field_id,
                    "metrics filter ignored: missing settings.groupBy"
                );
                return Ok(None);
            };
            self.validate_metric_group_by(override_names, &rule.id)?;
        }
        let expr = self.target_expression(&rule.target.field_id, domain, group_by_override)?;
        let values = rule.values.as_deref().unwrap_or(&[]);
        let sql = if RELATIVE_OPERATORS.contains(&rule.operator.as_str()) {
            self.relative_time_sql(&expr, &rule.operator, values, rule.settings.as_ref())?
        } else {
            operator_sql(&expr, &rule.operator, values)?
        };
        Ok(Some(sql))
    }

    fn validate_metric_group_by(&self, names: &[String], rule_id: &str) -> Result<(), ApiError> {
        let Some(entity_names) = self.entity_names else {
            return Ok(());
        };
        let invalid: Vec<&String> = names
            .iter()
            .filter(|name| !entity_names.contains(name.as_str()))
            .collect();
        if invalid.is_empty() {
            return Ok(());
        }
        let mut allowed: Vec<&String> = entity_names.iter().collect();
        allowed.sort();
        Err(
            ApiError::validation("metrics filter settings.groupBy must name entities")
                .with_details(json!({
                    "invalid": invalid,
                    "allowed": allowed,
                    "ruleId": rule_id,
                })),
        )
    }

    fn target_expression(
        &self,
        field_id: &str,
        domain: TargetDomain,
        group_by_override: Option<&[String]>,
    ) -> Result<String, ApiError> {
        if domain == TargetDomain::Metric {
            let names = group_by_override.unwrap_or(self.group_by_names);
            if names.is_empty() {
                return Err(ApiError::validation("metrics filters require a groupBy"));
            }
            let items = names
                .iter()
                .map(|name| format!("'{}'", escape_identifier(name)))
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(format!(
                "{{{{ Metric('{}', group_by=[{items}]) }}}}",
                escape_identifier(field_id)
            ));
        }
        if let Some((base, grain)) = split_time_grain(field_id) {
            return Ok(format!(
                "{{{{ TimeDimension('{}', '{grain}') }}}}",
                escape_identifier(base)
            ));
        }
        Ok(format!(
            "{{{{ Dimension('{}') }}}}",
            escape_identifier(field_id)
        ))
    }

    fn relative_time_sql(
        &self,
        expr: &str,
        operator: &str,
        values: &[FilterValue],
        settings: Option<&FilterSettings>,
    ) -> Result<String, ApiError> {
        let unit = normalize_unit(settings.and_then(|s| s.unit_of_time.as_deref()))?;
        match operator {
            "inThePast" => {
                let count = normalize_count(values)?;
                let start = shift_time(self.now, -count, unit);
                Ok(range_sql(expr, start, self.now, unit))
            }
            "inTheNext" => {
                let count = normalize_count(values)?;
                let end = shift_time(self.now, count, unit);
                Ok(range_sql(expr, self.now, end, unit))
            }
            "inTheCurrent" => {
                let (start, end) = current_period_range(self.now, unit);
                Ok(range_sql(expr, start, end, unit))
            }
            "notInTheCurrent" => {
                let (start, end) = current_period_range(self.now, unit);
                Ok(format!(
                    "({expr} < {} OR {expr} > {})",
                    format_time(start, unit),
                    format_time(end, unit)
                ))
            }
            other => Err(ApiError::validation(format!("unsupported operator: {other}"))),
        }
    }
}

fn resolve_group_items(
    group: &FilterGroup,
) -> Result<(&[FilterGroupItem], &'static str), ApiError> {
    let and_items = group.and_items.as_deref().unwrap_or(&[]);
    let or_items = group.or_items.as_deref().unwrap_or(&[]);
    if !and_items.is_empty() && !or_items.is_empty() {
        return Err(ApiError::validation(format!(
            "FilterGroup({}) cannot carry both and/or items",
            group.id
        )));
    }
    if !or_items.is_empty() {
        Ok((or_items, "OR"))
    } else {
        Ok((and_items, "AND"))
    }
}

fn operator_sql(expr: &str, operator: &str, values: &[FilterValue]) -> Result<String, ApiError> {
    match operator {
        "equals" => equals_sql(expr, values, false),
        "notEquals" => equals_sql(expr, values, true),
        "include" => like_sql(expr, values, true, Wildcard::Both),
        "doesNotInclude" => like_sql(expr, values, false, Wildcard::Both),
        "startsWith" => like_sql(expr, values, true, Wildcard::Right),
        "endsWith" => like_sql(expr, values, true, Wildcard::Left),
        "isNull" => Ok(format!("{expr} IS NULL")),
        "notNull" => Ok(format!("{expr} IS NOT NULL")),
        "greaterThan" => compare_sql(expr, ">", values),
        "greaterThanOrEqual" => compare_sql(expr, ">=", values),
        "lessThan" => compare_sql(expr, "<", values),
        "lessThanOrEqual" => compare_sql(expr, "<=", values),
        "inBetween" => between_sql(expr, values, false),
        "notInBetween" => between_sql(expr, values, true),
        other => Err(ApiError::validation(format!("unsupported operator: {other}"))),
    }
}

fn equals_sql(expr: &str, values: &[FilterValue], negate: bool) -> Result<String, ApiError> {
    let operator = if negate { "notEquals" } else { "equals" };
    match values {
        [] => Err(missing_values_error(operator)),
        [single] if !negate => Ok(format!("{expr} = {}", format_value(single))),
        [single] => Ok(format!(
            "({expr} != {} OR {expr} IS NULL)",
            format_value(single)
        )),
        many if !negate => Ok(format!("{expr} IN ({})", format_values(many))),
        many => Ok(format!(
            "({expr} NOT IN ({}) OR {expr} IS NULL)",
            format_values(many)
        )),
    }
}

fn compare_sql(expr: &str, op: &str, values: &[FilterValue]) -> Result<String, ApiError> {
    let first = values.first().ok_or_else(|| missing_values_error(op))?;
    Ok(format!("{expr} {op} {}", format_value(first)))
}

fn between_sql(expr: &str, values: &[FilterValue], negate: bool) -> Result<String, ApiError> {
    if values.len() < 2 {
        return Err(missing_values_error("inBetween"));
    }
    let left = format_value(&values[0]);
    let right = format_value(&values[1]);
    if negate {
        Ok(format!("({expr} < {left} OR {expr} > {right})"))
    } else {
        Ok(format!("({expr} >= {left} AND {expr} <= {right})"))
    }
}

#[derive(Debug, Clone, Copy)]
enum Wildcard {
    Both,
    Left,
    Right,
}

fn like_sql(
    expr: &str,
    values: &[FilterValue],
    include: bool,
    wildcard: Wildcard,
) -> Result<String, ApiError> {
    if values.is_empty() {
        return Err(missing_values_error("like"));
    }
    let op = if include { "LIKE" } else { "NOT LIKE" };
    let clauses: Vec<String> = values
        .iter()
        .map(|value| {
            let raw = as_string(value);
            let pattern = match wildcard {
                Wildcard::Both => format!("%{raw}%"),
                Wildcard::Left => format!("%{raw}"),
                Wildcard::Right => format!("{raw}%"),
            };
            format!("{expr} {op} {}", format_value(&FilterValue::Text(pattern)))
        })
        .collect();
    if clauses.len() == 1 {
        return Ok(clauses.into_iter().next().unwrap());
    }
    let joiner = if include { " OR " } else { " AND " };
    Ok(format!("({})", clauses.join(joiner)))
}

fn split_time_grain(field_id: &str) -> Option<(&str, &'static str)> {
    let (base, suffix) = field_id.rsplit_once("__")?;
    let grain = TimeGranularity::parse(suffix)?;
    Some((base, grain.as_suffix()))
}

fn normalize_unit(unit: Option<&str>) -> Result<TimeGranularity, ApiError> {
    let Some(raw) = unit.filter(|raw| !raw.is_empty()) else {
        return Ok(TimeGranularity::Day);
    };
    let mut lowered = raw.to_ascii_lowercase();
    if lowered.ends_with('s') {
        lowered.pop();
    }
    TimeGranularity::parse(&lowered)
        .ok_or_else(|| ApiError::validation(format!("unsupported unitOfTime: {raw}")))
}

fn normalize_count(values: &[FilterValue]) -> Result<i64, ApiError> {
    let first = values
        .first()
        .ok_or_else(|| missing_values_error("relativeTime"))?;
    let count = match first {
        FilterValue::Int(value) => Some(*value),
        FilterValue::Float(value) => Some(*value as i64),
        FilterValue::Text(value) => value.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::validation("relativeTime values must be integers"))?;
    if count <= 0 {
        return Err(ApiError::validation(
            "relativeTime values must be greater than 0",
        ));
    }
    Ok(count)
}

fn range_sql(expr: &str, start: DateTime<Utc>, end: DateTime<Utc>, unit: TimeGranularity) -> String {
    format!(
        "({expr} >= {} AND {expr} <= {})",
        format_time(start, unit),
        format_time(end, unit)
    )
}

fn shift_time(now: DateTime<Utc>, count: i64, unit: TimeGranularity) -> DateTime<Utc> {
    match unit {
        TimeGranularity::Second => now + Duration::seconds(count),
        TimeGranularity::Minute => now + Duration::minutes(count),
        TimeGranularity::Hour => now + Duration::hours(count),
        TimeGranularity::Day => now + Duration::days(count),
        TimeGranularity::Week => now + Duration::weeks(count),
        TimeGranularity::Month => add_months(now, count),
        TimeGranularity::Quarter => add_months(now, count * 3),
        TimeGranularity::Year => add_months(now, count * 12),
        // Sub-second shifts are below the emitted precision.
        _ => now,
    }
}

/// Calendar-aware month addition with day clamping to the target month's
/// last valid day.
fn add_months(dt: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    let month_index = dt.year() as i64 * 12 + dt.month0() as i64 + months;
    let year = month_index.div_euclid(12) as i32;
    let month = month_index.rem_euclid(12) as u32 + 1;
    let day = dt.day().min(days_in_month(year, month));
    Utc.with_ymd_and_hms(
        year,
        month,
        day,
        dt.hour(),
        dt.minute(),
        dt.second(),
    )
    .single()
    .unwrap_or(dt)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid next month start");
    next.signed_duration_since(first).num_days() as u32
}

fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
        .single()
        .expect("valid midnight")
}

fn current_period_range(now: DateTime<Utc>, unit: TimeGranularity) -> (DateTime<Utc>, DateTime<Utc>) {
    let second = Duration::seconds(1);
    match unit {
        TimeGranularity::Day => {
            let start = start_of_day(now);
            (start, start + Duration::days(1) - second)
        }
        TimeGranularity::Week => {
            let weekday = now.weekday().num_days_from_monday() as i64;
            let start = start_of_day(now) - Duration::days((weekday - WEEK_START_OFFSET).rem_euclid(7));
            (start, start + Duration::days(7) - second)
        }
        TimeGranularity::Month => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .single()
                .expect("valid month start");
            (start, add_months(start, 1) - second)
        }
        TimeGranularity::Quarter => {
            let quarter_start_month = (now.month0() / 3) * 3 + 1;
            let start = Utc
                .with_ymd_and_hms(now.year(), quarter_start_month, 1, 0, 0, 0)
                .single()
                .expect("valid quarter start");
            (start, add_months(start, 3) - second)
        }
        TimeGranularity::Year => {
            let start = Utc
                .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
                .single()
                .expect("valid year start");
            (start, add_months(start, 12) - second)
        }
        TimeGranularity::Hour => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
                .single()
                .expect("valid hour start");
            (start, start + Duration::hours(1) - second)
        }
        TimeGranularity::Minute => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), now.minute(), 0)
                .single()
                .expect("valid minute start");
            (start, start + Duration::minutes(1) - second)
        }
        // Second and finer all truncate to the current second; the window
        // degenerates to a single instant at the emitted precision.
        _ => {
            let start = now - Duration::nanoseconds(now.timestamp_subsec_nanos() as i64);
            (start, start)
        }
    }
}

fn format_time(dt: DateTime<Utc>, unit: TimeGranularity) -> String {
    match unit {
        TimeGranularity::Nanosecond
        | TimeGranularity::Microsecond
        | TimeGranularity::Millisecond
        | TimeGranularity::Second
        | TimeGranularity::Minute
        | TimeGranularity::Hour => format_value(&FilterValue::DateTime(dt)),
        _ => format_value(&FilterValue::Date(dt.date_naive())),
    }
}

pub(crate) fn format_values(values: &[FilterValue]) -> String {
    values
        .iter()
        .map(format_value)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format a literal for embedding in a WHERE fragment.
pub fn format_value(value: &FilterValue) -> String {
    match value {
        FilterValue::Null => "NULL".to_string(),
        FilterValue::Bool(true) => "TRUE".to_string(),
        FilterValue::Bool(false) => "FALSE".to_string(),
        FilterValue::Int(n) => n.to_string(),
        FilterValue::Float(f) => f.to_string(),
        FilterValue::Text(s) => format!("'{}'", escape_string(s)),
        FilterValue::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        FilterValue::DateTime(dt) => {
            format!("'{}'", dt.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S"))
        }
    }
}

fn as_string(value: &FilterValue) -> String {
    match value {
        FilterValue::Text(s) => s.clone(),
        FilterValue::Int(n) => n.to_string(),
        FilterValue::Float(f) => f.to_string(),
        FilterValue::Bool(b) => b.to_string(),
        FilterValue::Null => String::new(),
        FilterValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        FilterValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

fn escape_string(value: &str) -> String {
    value.replace('\'', "''")
}

fn escape_identifier(value: &str) -> String {
    value.replace('\'', "''")
}

fn missing_values_error(operator: &str) -> ApiError {
    ApiError::validation(format!("operator {operator} is missing values"))
}
