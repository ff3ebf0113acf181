// Environment registry
//
// Parses the environments YAML file into per-project configuration and
// caches it process-wide. Reload requires a process restart.

use once_cell::sync::OnceCell;
use serde_json::json;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{ApiError, ErrorCode};

pub const ENV_CONFIG_PATH: &str = "ENVIRONMENTS_CONFIG";
pub const ENV_BASE_DIR: &str = "ENVIRONMENTS_BASE_DIR";
const DEFAULT_CONFIG_FILE: &str = "environments.yml";

/// Immutable per-project configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentConfig {
    pub project_id: String,
    pub name: Option<String>,
    /// Git working tree of the project.
    pub project_dir: PathBuf,
    /// Warehouse profiles directory, defaults to `project_dir`.
    pub profiles_dir: PathBuf,
    /// Compiled artifact path, defaults to `<project_dir>/target/semantic_manifest.json`.
    pub semantic_manifest_path: PathBuf,
    pub repo_url: Option<String>,
    pub default_ref: Option<String>,
    /// Tokens allowed to access this project.
    pub tokens: Vec<String>,
}

#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, Arc<EnvironmentConfig>>,
}

impl EnvironmentRegistry {
    /// Load the registry from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ApiError> {
        if !path.exists() {
            return Err(ApiError::new(
                ErrorCode::ConfigNotFound,
                format!("environments config file not found: {}", path.display()),
                500,
            ));
        }
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ApiError::new(
                ErrorCode::ConfigInvalid,
                format!("failed to read environments config: {err}"),
                500,
            )
        })?;
        let doc: Value = serde_yaml::from_str(&raw).map_err(|err| {
            ApiError::new(ErrorCode::ConfigInvalid, "environments config failed to parse", 500)
                .with_details(json!({"error": err.to_string()}))
        })?;

        let entries = match doc.get("environments") {
            None | Some(Value::Null) => &[] as &[Value],
            Some(Value::Sequence(items)) => items.as_slice(),
            Some(_) => {
                return Err(ApiError::new(
                    ErrorCode::ConfigInvalid,
                    "environments must be a list",
                    500,
                ));
            }
        };

        let base_dir = resolve_base_dir(path.parent().unwrap_or_else(|| Path::new(".")));
        let mut environments = HashMap::new();
        for entry in entries {
            let Some(env) = parse_entry(entry, &base_dir) else {
                continue;
            };
            debug!(project_id = %env.project_id, "loaded environment");
            environments.insert(env.project_id.clone(), Arc::new(env));
        }
        Ok(Self { environments })
    }

    pub fn get(&self, project_id: &str) -> Result<Arc<EnvironmentConfig>, ApiError> {
        self.environments.get(project_id).cloned().ok_or_else(|| {
            ApiError::new(
                ErrorCode::EnvironmentNotFound,
                format!("no environment configured for projectId={project_id}"),
                404,
            )
        })
    }

    pub fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.environments.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn parse_entry(entry: &Value, base_dir: &Path) -> Option<EnvironmentConfig> {
    let mapping = entry.as_mapping()?;
    let field = |names: &[&str]| -> Option<Value> {
        names
            .iter()
            .find_map(|name| mapping.get(Value::from(*name)).cloned())
    };
    let scalar = |names: &[&str]| -> Option<String> {
        field(names).and_then(|value| coerce_string(&value))
    };

    let project_id = scalar(&["project_id", "projectId", "id"])
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())?;
    let Some(project_dir) = scalar(&["project_dir"]).map(|dir| resolve_path(base_dir, &dir)) else {
        warn!(project_id = %project_id, "skipping environment without project_dir");
        return None;
    };
    let profiles_dir = scalar(&["profiles_dir"])
        .map(|dir| resolve_path(base_dir, &dir))
        .unwrap_or_else(|| project_dir.clone());
    let semantic_manifest_path = scalar(&["semantic_manifest_path"])
        .map(|p| resolve_path(base_dir, &p))
        .unwrap_or_else(|| project_dir.join("target").join("semantic_manifest.json"));

    let tokens = match field(&["tokens"]) {
        Some(Value::Sequence(items)) => items.iter().filter_map(coerce_string).collect(),
        Some(value) => coerce_string(&value).map(|t| vec![t]).unwrap_or_default(),
        None => Vec::new(),
    };

    Some(EnvironmentConfig {
        project_id,
        name: scalar(&["name"]),
        project_dir,
        profiles_dir,
        semantic_manifest_path,
        repo_url: scalar(&["repo", "repo_url", "git"]),
        default_ref: scalar(&["default_ref", "branch", "defaultRef"]),
        tokens,
    })
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        candidate
    } else {
        base_dir.join(candidate)
    }
}

fn resolve_base_dir(config_dir: &Path) -> PathBuf {
    match std::env::var(ENV_BASE_DIR) {
        Ok(raw) if !raw.is_empty() => resolve_path(config_dir, &raw),
        _ => config_dir.to_path_buf(),
    }
}

fn default_config_path() -> PathBuf {
    match std::env::var(ENV_CONFIG_PATH) {
        Ok(raw) if !raw.is_empty() => PathBuf::from(raw),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

static REGISTRY: OnceCell<EnvironmentRegistry> = OnceCell::new();

/// Process-wide accessor. The registry is loaded on first use; a load
/// failure is not cached so a later call can retry.
pub fn get_environment(project_id: &str) -> Result<Arc<EnvironmentConfig>, ApiError> {
    let registry = REGISTRY.get_or_try_init(|| EnvironmentRegistry::load(&default_config_path()))?;
    registry.get(project_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("environments.yml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_entry_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "environments:\n  - project_id: jaffle\n    project_dir: repos/jaffle\n    tokens: secret\n",
        );
        let registry = EnvironmentRegistry::load(&path).unwrap();
        let env = registry.get("jaffle").unwrap();
        assert_eq!(env.project_dir, dir.path().join("repos/jaffle"));
        assert_eq!(env.profiles_dir, env.project_dir);
        assert_eq!(
            env.semantic_manifest_path,
            dir.path().join("repos/jaffle/target/semantic_manifest.json")
        );
        // scalar token coerced to a one-element list
        assert_eq!(env.tokens, vec!["secret".to_string()]);
        assert!(env.repo_url.is_none());
    }

    #[test]
    fn recognizes_key_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            concat!(
                "environments:\n",
                "  - projectId: alpha\n",
                "    project_dir: /srv/alpha\n",
                "    git: https://example.com/alpha.git\n",
                "    branch: main\n",
                "    tokens: [t1, t2]\n",
                "  - id: '42'\n",
                "    project_dir: /srv/beta\n",
                "    repo_url: https://example.com/beta.git\n",
                "    defaultRef: release\n",
            ),
        );
        let registry = EnvironmentRegistry::load(&path).unwrap();
        let alpha = registry.get("alpha").unwrap();
        assert_eq!(alpha.repo_url.as_deref(), Some("https://example.com/alpha.git"));
        assert_eq!(alpha.default_ref.as_deref(), Some("main"));
        assert_eq!(alpha.tokens.len(), 2);
        let beta = registry.get("42").unwrap();
        assert_eq!(beta.default_ref.as_deref(), Some("release"));
    }

    #[test]
    fn skips_entries_missing_required_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            concat!(
                "environments:\n",
                "  - name: no-id\n",
                "    project_dir: /srv/x\n",
                "  - project_id: no-dir\n",
                "  - project_id: ok\n",
                "    project_dir: /srv/ok\n",
            ),
        );
        let registry = EnvironmentRegistry::load(&path).unwrap();
        assert_eq!(registry.project_ids(), vec!["ok".to_string()]);
        let err = registry.get("no-dir").unwrap_err();
        assert_eq!(err.code, ErrorCode::EnvironmentNotFound);
        assert_eq!(err.status, 404);
    }

    #[test]
    fn missing_file_is_config_not_found() {
        let err = EnvironmentRegistry::load(Path::new("/nonexistent/environments.yml")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigNotFound);
    }

    #[test]
    fn malformed_yaml_is_config_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "environments: [not yaml");
        let err = EnvironmentRegistry::load(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
        assert!(err.details.is_some());
    }

    #[test]
    fn non_list_environments_is_config_invalid() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "environments:\n  project_id: nope\n");
        let err = EnvironmentRegistry::load(&path).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
    }

    #[test]
    fn absolute_paths_are_kept_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            concat!(
                "environments:\n",
                "  - project_id: abs\n",
                "    project_dir: /srv/abs\n",
                "    profiles_dir: /etc/profiles\n",
                "    semantic_manifest_path: /artifacts/manifest.json\n",
            ),
        );
        let registry = EnvironmentRegistry::load(&path).unwrap();
        let env = registry.get("abs").unwrap();
        assert_eq!(env.project_dir, PathBuf::from("/srv/abs"));
        assert_eq!(env.profiles_dir, PathBuf::from("/etc/profiles"));
        assert_eq!(env.semantic_manifest_path, PathBuf::from("/artifacts/manifest.json"));
    }
}
