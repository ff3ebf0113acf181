// Result encoder
//
// Turns a warehouse table into the columns/rows wire shape. Column types
// are inferred from the warehouse kind plus the column name: a timestamp
// column carrying a date-grain suffix is surfaced as a date, with values
// serialized as ISO dates instead of timestamps.

use serde_json::Value;

use crate::types::{CellValue, ColumnDto, ColumnKind, DataTable, FieldType, RowDto};

const DATE_GRAIN_SUFFIXES: [&str; 5] = ["__day", "__week", "__month", "__quarter", "__year"];

fn field_type(column_name: &str, kind: ColumnKind) -> FieldType {
    match kind {
        ColumnKind::Timestamp => {
            if DATE_GRAIN_SUFFIXES
                .iter()
                .any(|suffix| column_name.ends_with(suffix))
            {
                FieldType::Date
            } else {
                FieldType::Timestamp
            }
        }
        ColumnKind::Integer | ColumnKind::Float | ColumnKind::Decimal => FieldType::Number,
        ColumnKind::Boolean => FieldType::Boolean,
        ColumnKind::Text => FieldType::String,
    }
}

fn serialize_value(value: &CellValue, field_type: FieldType) -> Value {
    match value {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Int(n) => Value::from(*n),
        CellValue::Float(f) => Value::from(*f),
        // decimals are cast to double on the wire
        CellValue::Decimal(s) => s
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(s.clone())),
        CellValue::Text(s) => Value::String(s.clone()),
        CellValue::Timestamp(dt) => {
            if field_type == FieldType::Date {
                Value::String(dt.date_naive().to_string())
            } else {
                Value::String(dt.to_rfc3339())
            }
        }
        CellValue::Date(d) => Value::String(d.to_string()),
    }
}

/// Encode a table into `columns = [{name, type}]` and `rows = [{name: value}]`.
pub fn encode_rows_and_columns(table: &DataTable) -> (Vec<ColumnDto>, Vec<RowDto>) {
    let mut columns = Vec::with_capacity(table.columns.len());
    let mut field_types = Vec::with_capacity(table.columns.len());
    for (name, kind) in &table.columns {
        let inferred = field_type(name, *kind);
        field_types.push(inferred);
        columns.push(ColumnDto {
            name: name.clone(),
            field_type: inferred,
        });
    }

    let mut rows = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let mut record = RowDto::new();
        for ((column, inferred), value) in columns.iter().zip(&field_types).zip(row) {
            record.insert(column.name.clone(), serialize_value(value, *inferred));
        }
        rows.push(record);
    }
    (columns, rows)
}
