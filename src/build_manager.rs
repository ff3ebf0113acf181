// Build manager
//
// Serializes long-running rebuilds per project and installs the fresh
// engine on success. One worker task per trigger; concurrency is throttled
// by a per-project non-blocking lock whose entries live for the process
// lifetime, so at most one build runs per project at any time.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::build_store::{BuildRecord, BuildStore};
use crate::config::ServiceConfig;
use crate::engine::provider::EngineProvider;
use crate::environment::EnvironmentRegistry;
use crate::errors::{ApiError, ErrorCode};
use crate::infra::{CommandError, CommandRunner, GitClient, GitError};
use crate::types::BuildStatus;

const BUILD_CMD_HINT_FILE: &str = ".metricflow_build_cmd";
const LOCKED_MESSAGE: &str = "Another build is running for this project";

#[derive(Clone)]
pub struct BuildManager {
    store: Arc<BuildStore>,
    registry: Arc<EnvironmentRegistry>,
    engine_provider: Arc<EngineProvider>,
    git: GitClient,
    runner: CommandRunner,
    build_timeout: Duration,
    log_tail_lines: usize,
    build_cmd_override: Option<Vec<String>>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Terminal failure of a build worker, with whatever log tail was captured.
struct BuildFailure {
    message: String,
    log_tail: Option<String>,
}

impl BuildManager {
    pub fn new(
        store: Arc<BuildStore>,
        registry: Arc<EnvironmentRegistry>,
        engine_provider: Arc<EngineProvider>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            engine_provider,
            git: GitClient::default(),
            runner: CommandRunner,
            build_timeout: config.build_timeout,
            log_tail_lines: config.build_log_tail_lines,
            build_cmd_override: config.build_cmd_override.clone(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<BuildStore> {
        &self.store
    }

    /// Kick off a build worker and return its id immediately. The record is
    /// persisted in PENDING before the worker spawns so a status lookup can
    /// never miss.
    pub fn trigger_build(
        &self,
        project_id: &str,
        git_ref: Option<String>,
        force_recompile: bool,
    ) -> String {
        let build_id = Uuid::new_v4().to_string();
        let mut record = BuildRecord::pending(&build_id, project_id);
        record.git_ref = git_ref.clone();
        self.store.set(record);

        let manager = self.clone();
        let project_id = project_id.to_string();
        let worker_build_id = build_id.clone();
        tokio::spawn(async move {
            manager
                .run_build(&project_id, &worker_build_id, git_ref, force_recompile)
                .await;
        });
        info!(%build_id, "build enqueued");
        build_id
    }

    pub fn get_build_status(&self, build_id: &str) -> Result<BuildRecord, ApiError> {
        self.store.get(build_id).ok_or_else(|| {
            ApiError::new(
                ErrorCode::ConfigNotFound,
                format!("buildId={build_id} not found"),
                404,
            )
        })
    }

    /// Lock objects are created on first use and never removed, so the
    /// lookup/acquire race cannot hand two workers different locks.
    fn project_lock(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn run_build(
        &self,
        project_id: &str,
        build_id: &str,
        git_ref: Option<String>,
        force_recompile: bool,
    ) {
        let lock = self.project_lock(project_id);
        let Ok(_guard) = lock.try_lock_owned() else {
            self.store.update(build_id, |record| {
                record.status = BuildStatus::Failed;
                record.finished_at = Some(Utc::now());
                record.errors = vec![LOCKED_MESSAGE.to_string()];
            });
            warn!(build_id, project_id, "build rejected: project already building");
            return;
        };

        self.store.update(build_id, |record| {
            record.status = BuildStatus::Running;
            record.started_at = Some(Utc::now());
        });
        info!(build_id, project_id, "build started");

        match self
            .execute_build(project_id, build_id, git_ref, force_recompile)
            .await
        {
            Ok(()) => {
                info!(build_id, project_id, "build succeeded");
            }
            Err(failure) => {
                self.store.update(build_id, |record| {
                    record.status = BuildStatus::Failed;
                    record.finished_at = Some(Utc::now());
                    record.errors = vec![failure.message.clone()];
                    if failure.log_tail.is_some() {
                        record.log_tail = failure.log_tail.clone();
                    }
                });
                warn!(build_id, project_id, "build failed");
            }
        }
    }

    async fn execute_build(
        &self,
        project_id: &str,
        build_id: &str,
        git_ref: Option<String>,
        force_recompile: bool,
    ) -> Result<(), BuildFailure> {
        let env = self.registry.get(project_id).map_err(|err| BuildFailure {
            message: err.message.clone(),
            log_tail: None,
        })?;
        let effective_ref = git_ref.or_else(|| env.default_ref.clone());
        self.store.update(build_id, |record| {
            record.git_ref = effective_ref.clone();
        });

        let sync_result = async {
            self.git
                .ensure_repo(
                    &env.project_dir,
                    env.repo_url.as_deref(),
                    effective_ref.as_deref(),
                )
                .await?;
            self.git
                .safe_update(&env.project_dir, effective_ref.as_deref())
                .await
        }
        .await;
        if let Err(err) = sync_result {
            return Err(match err {
                GitError::Command(command_err) => BuildFailure {
                    message: format!("git pull failed: {command_err}"),
                    log_tail: Some(self.log_tail(command_err.output())),
                },
                GitError::Config(api_err) => BuildFailure {
                    message: api_err.message,
                    log_tail: None,
                },
            });
        }

        let log_tail = match self.compile(&env.project_dir, &env.profiles_dir).await {
            Ok(output) => self.log_tail(&output),
            Err(err) => {
                let log_tail = (!err.output().is_empty()).then(|| self.log_tail(err.output()));
                return Err(BuildFailure {
                    message: format!("compile failed: {err}"),
                    log_tail,
                });
            }
        };

        let commit = self.git.head_commit(&env.project_dir).await;
        self.engine_provider
            .rebuild_engine(project_id, force_recompile)
            .map_err(|err| BuildFailure {
                message: format!("engine rebuild failed: {err}"),
                log_tail: Some(log_tail.clone()),
            })?;

        self.store.update(build_id, |record| {
            record.status = BuildStatus::Succeeded;
            record.finished_at = Some(Utc::now());
            record.errors = Vec::new();
            record.warnings = Vec::new();
            record.commit = commit.clone();
            record.log_tail = Some(log_tail.clone());
        });
        Ok(())
    }

    /// Produce the semantic manifest. The environment override wins over an
    /// on-disk hint file; the default is the two-stage deps+build pipeline.
    async fn compile(&self, project_dir: &Path, profiles_dir: &Path) -> Result<Vec<u8>, CommandError> {
        let custom = self
            .build_cmd_override
            .clone()
            .or_else(|| read_hint_command(project_dir));
        if let Some(cmd) = custom {
            info!(command = %cmd.join(" "), "compile command");
            let result = self.runner.run(&cmd, project_dir, self.build_timeout).await?;
            return Ok(result.output);
        }

        let project = project_dir.to_string_lossy().to_string();
        let profiles = profiles_dir.to_string_lossy().to_string();
        let stage = |verb: &str| -> Vec<String> {
            vec![
                "dbt".to_string(),
                verb.to_string(),
                "--project-dir".to_string(),
                project.clone(),
                "--profiles-dir".to_string(),
                profiles.clone(),
            ]
        };
        let deps_cmd = stage("deps");
        let build_cmd = stage("build");
        info!(
            command = %format!("{} && {}", deps_cmd.join(" "), build_cmd.join(" ")),
            "compile command"
        );
        let mut output = self
            .runner
            .run(&deps_cmd, project_dir, self.build_timeout)
            .await?
            .output;
        output.push(b'\n');
        output.extend(
            self.runner
                .run(&build_cmd, project_dir, self.build_timeout)
                .await?
                .output,
        );
        Ok(output)
    }

    fn log_tail(&self, output: &[u8]) -> String {
        let text = String::from_utf8_lossy(output);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(self.log_tail_lines);
        lines[start..].join("\n")
    }
}

fn read_hint_command(project_dir: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(project_dir.join(BUILD_CMD_HINT_FILE)).ok()?;
    let tokens: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    (!tokens.is_empty()).then_some(tokens)
}
