// Perf span sink
//
// Newline-delimited JSON entries appended to METRICFLOW_PERF_LOG_PATH.
// Best-effort: write failures must never fail the request, so every I/O
// error is swallowed.

use chrono::Utc;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Handle for recording perf spans. Cheap to clone; `None` path disables
/// the sink entirely while keeping span creation free of branches at the
/// call sites.
#[derive(Debug, Clone)]
pub struct PerfLogger {
    path: Option<Arc<PathBuf>>,
}

impl PerfLogger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path: path.map(Arc::new),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Open a span. `context` keys are merged into the emitted entry.
    pub fn span(&self, label: &str, context: Map<String, Value>) -> PerfSpan {
        PerfSpan {
            logger: self.clone(),
            label: label.to_string(),
            start: Instant::now(),
            context,
        }
    }

    fn write_entry(&self, entry: &Map<String, Value>) {
        let Some(path) = &self.path else {
            return;
        };
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(_) => return,
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .and_then(|mut file| writeln!(file, "{line}"));
        let _ = result;
    }
}

#[must_use = "finish() emits the entry"]
pub struct PerfSpan {
    logger: PerfLogger,
    label: String,
    start: Instant,
    context: Map<String, Value>,
}

impl PerfSpan {
    /// Emit the entry with elapsed milliseconds and any extra fields.
    pub fn finish(self, extra: Map<String, Value>) {
        let mut entry = Map::new();
        entry.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        entry.insert("label".to_string(), Value::String(self.label));
        entry.insert(
            "duration_ms".to_string(),
            Value::from(self.start.elapsed().as_millis() as u64),
        );
        for (key, value) in self.context {
            entry.insert(key, value);
        }
        for (key, value) in extra {
            entry.insert(key, value);
        }
        self.logger.write_entry(&entry);
    }
}

/// Shorthand for building span context maps.
#[macro_export]
macro_rules! perf_ctx {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), serde_json::Value::from($value));)*
        map
    }};
}
