use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("git {command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Runs the `git` CLI against one working tree.
#[derive(Debug, Clone)]
pub struct Git {
    repo: PathBuf,
}

impl Git {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub async fn pull(&self) -> Result<(), GitError> {
        self.run(["pull", "--ff-only"]).await.map(drop)
    }

    /// Stages additions, modifications and deletions under `paths`.
    pub async fn add_all(&self, paths: &[&Path]) -> Result<(), GitError> {
        let mut args: Vec<OsString> = vec!["add".into(), "-A".into(), "--".into()];
        args.extend(paths.iter().map(|p| p.as_os_str().to_owned()));
        self.run(args).await.map(drop)
    }

    pub async fn has_staged_changes(&self) -> Result<bool, GitError> {
        let output = self
            .command(["diff", "--cached", "--quiet"])
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                command: "diff --cached --quiet".into(),
                source,
            })?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            code => Err(GitError::Failed {
                command: "diff --cached --quiet".into(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    pub async fn commit(&self, message: &str) -> Result<(), GitError> {
        self.run(["commit", "-m", message]).await.map(drop)
    }

    pub async fn push(&self) -> Result<(), GitError> {
        self.run(["push"]).await.map(drop)
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut command = Command::new("git");
        command
            .arg("-C")
            .arg(&self.repo)
            .args(args.into_iter().map(Into::into));
        command
    }

    async fn run<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        let shown = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!("git {}", shown);

        let output = self
            .command(args)
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                command: shown.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::Failed {
                command: shown,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
