// Git working-tree operations
//
// Shells out to the git CLI so failures carry the process output the build
// record wants in its log tail.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::command::{CommandError, CommandRunner};
use crate::errors::{ApiError, ErrorCode};

/// Fixed ceiling for git subprocesses; the compile step has its own
/// configurable timeout.
const GIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Config(#[from] ApiError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Default, Clone)]
pub struct GitClient {
    runner: CommandRunner,
}

impl GitClient {
    fn is_repo(project_dir: &Path) -> bool {
        project_dir.join(".git").exists()
    }

    async fn git(&self, project_dir: &Path, args: &[&str]) -> Result<Vec<u8>, CommandError> {
        let mut cmd = vec!["git".to_string()];
        cmd.extend(args.iter().map(|s| s.to_string()));
        let result = self.runner.run(&cmd, project_dir, GIT_TIMEOUT).await?;
        Ok(result.output)
    }

    /// Clone the repository when the working tree does not exist yet.
    pub async fn ensure_repo(
        &self,
        project_dir: &Path,
        repo_url: Option<&str>,
        git_ref: Option<&str>,
    ) -> Result<(), GitError> {
        if Self::is_repo(project_dir) {
            return Ok(());
        }
        let Some(repo_url) = repo_url else {
            return Err(ApiError::new(
                ErrorCode::ConfigInvalid,
                format!(
                    "project_dir={} is not a git repository and no repo url is configured",
                    project_dir.display()
                ),
                500,
            )
            .into());
        };
        std::fs::create_dir_all(project_dir).map_err(|err| {
            GitError::Config(ApiError::new(
                ErrorCode::ConfigInvalid,
                format!("failed to create {}: {err}", project_dir.display()),
                500,
            ))
        })?;
        let mut args = vec!["clone"];
        if let Some(git_ref) = git_ref {
            args.extend(["--branch", git_ref]);
        }
        let target = project_dir.to_string_lossy().to_string();
        args.extend([repo_url, target.as_str()]);
        debug!(repo_url, "cloning repository");
        self.git(project_dir, &args).await?;
        Ok(())
    }

    /// Bring the working tree to the remote state of `git_ref`: fetch,
    /// checkout, hard-reset and clean. Without a ref, plain pull.
    pub async fn safe_update(
        &self,
        project_dir: &Path,
        git_ref: Option<&str>,
    ) -> Result<(), GitError> {
        if !Self::is_repo(project_dir) {
            return Err(ApiError::new(
                ErrorCode::ConfigInvalid,
                format!("project_dir={} is not a git repository", project_dir.display()),
                500,
            )
            .into());
        }
        match git_ref {
            Some(git_ref) => {
                self.git(project_dir, &["fetch", "--all", "--prune"]).await?;
                self.git(project_dir, &["checkout", git_ref]).await?;
                let origin_ref = format!("origin/{git_ref}");
                self.git(project_dir, &["reset", "--hard", &origin_ref])
                    .await?;
                self.git(project_dir, &["clean", "-fd"]).await?;
            }
            None => {
                self.git(project_dir, &["pull"]).await?;
            }
        }
        Ok(())
    }

    /// Current HEAD commit, or None when it cannot be resolved. A missing
    /// commit does not fail the build.
    pub async fn head_commit(&self, project_dir: &Path) -> Option<String> {
        match self.git(project_dir, &["rev-parse", "HEAD"]).await {
            Ok(output) => {
                let commit = String::from_utf8_lossy(&output).trim().to_string();
                (!commit.is_empty()).then_some(commit)
            }
            Err(err) => {
                warn!(project_dir = %project_dir.display(), "failed to resolve HEAD: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo(dir: &Path) {
        let runner = CommandRunner;
        for args in [
            vec!["git", "init", "-q"],
            vec!["git", "config", "user.email", "test@example.com"],
            vec!["git", "config", "user.name", "Test"],
            vec!["git", "commit", "--allow-empty", "-q", "-m", "init"],
        ] {
            let cmd: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            runner
                .run(&cmd, dir, Duration::from_secs(30))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn ensure_repo_is_a_noop_for_existing_repos() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        let client = GitClient::default();
        client.ensure_repo(dir.path(), None, None).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_repo_without_url_is_config_invalid() {
        let dir = TempDir::new().unwrap();
        let client = GitClient::default();
        let err = client
            .ensure_repo(&dir.path().join("missing"), None, None)
            .await
            .unwrap_err();
        match err {
            GitError::Config(api) => assert_eq!(api.code, ErrorCode::ConfigInvalid),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn safe_update_requires_a_repo() {
        let dir = TempDir::new().unwrap();
        let client = GitClient::default();
        let err = client.safe_update(dir.path(), None).await.unwrap_err();
        assert!(matches!(err, GitError::Config(_)));
    }

    #[tokio::test]
    async fn head_commit_resolves_after_init() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        let client = GitClient::default();
        let commit = client.head_commit(dir.path()).await.unwrap();
        assert_eq!(commit.len(), 40);
    }

    #[tokio::test]
    async fn head_commit_failure_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let client = GitClient::default();
        assert!(client.head_commit(dir.path()).await.is_none());
    }
}
