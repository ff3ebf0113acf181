// Adapter-aware SQL normalization
//
// Postgres does not accept database.schema.table references, so planned SQL
// gets its three-part identifiers rewritten to two-part when the engine's
// adapter is postgres. Matching the credentials database exactly is
// preferred; a generic three-part rewrite is the fallback. Regex-based, so
// string literals and comments are not fully protected.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::engine::Engine;

static THREE_PART_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]+"\."([^"]+)"\."([^"]+)""#).expect("valid quoted regex"));
static THREE_PART_UNQUOTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b")
        .expect("valid unquoted regex")
});

/// Rewrite `sql` for the engine's adapter. A no-op for every adapter except
/// postgres; idempotent on already-normalized input.
pub fn normalize_sql_for_adapter(sql: Option<String>, engine: &Engine) -> Option<String> {
    let sql = sql?;
    if engine.adapter_type() != "postgres" {
        return Some(sql);
    }
    Some(strip_database_qualifier(&sql, engine.database()))
}

pub(crate) fn strip_database_qualifier(sql: &str, database: Option<&str>) -> String {
    if let Some(database) = database {
        let quoted = Regex::new(&format!(
            r#""{}"\."([^"]+)"\."([^"]+)""#,
            regex::escape(database)
        ))
        .expect("valid database-quoted regex");
        let unquoted = Regex::new(&format!(
            r"\b{}\.([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b",
            regex::escape(database)
        ))
        .expect("valid database-unquoted regex");
        let rewritten = quoted.replace_all(sql, "\"$1\".\"$2\"");
        let rewritten = unquoted.replace_all(&rewritten, "$1.$2");
        if rewritten != sql {
            return rewritten.into_owned();
        }
    }
    // No credentials match; fall back to the generic three-part rewrite.
    let rewritten = THREE_PART_QUOTED.replace_all(sql, "\"$1\".\"$2\"");
    THREE_PART_UNQUOTED
        .replace_all(&rewritten, "$2.$3")
        .into_owned()
}
