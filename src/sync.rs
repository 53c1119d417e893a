use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::fetch::Fetcher;
use crate::git::{Git, GitError};
use crate::pipeline::{Mirror, MirrorError, MirrorOutcome};
use crate::publish::Publisher;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mirror failed: {0}")]
    Mirror(#[from] MirrorError),
    #[error("failed to stage changes: {0}")]
    Stage(#[source] GitError),
    #[error("failed to commit: {0}")]
    Commit(#[source] GitError),
    #[error("site published locally but push failed: {0}")]
    Push(#[source] GitError),
}

impl SyncError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Mirror(e) => e.exit_code(),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub push: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { push: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Spider-only run; the working tree was not touched.
    Probed,
    /// Nothing differed from the last commit.
    Unchanged,
    Committed { message: String, pushed: bool },
}

pub fn commit_message(now: DateTime<Utc>) -> String {
    format!("Update mirror: {} UTC", now.format("%Y-%m-%d %H:%M:%S"))
}

/// Pull, mirror, stage, and commit and push only when something changed.
pub async fn run<F: Fetcher, P: Publisher>(
    git: &Git,
    mirror: &Mirror<F, P>,
    options: SyncOptions,
) -> Result<SyncOutcome, SyncError> {
    if let Err(e) = git.pull().await {
        tracing::warn!("Pull failed, continuing with local checkout: {}", e);
    }

    if mirror.run().await? == MirrorOutcome::Probed {
        return Ok(SyncOutcome::Probed);
    }

    git.add_all(&[mirror.output_dir()])
        .await
        .map_err(SyncError::Stage)?;

    if !git.has_staged_changes().await.map_err(SyncError::Stage)? {
        tracing::info!("No changes to commit");
        return Ok(SyncOutcome::Unchanged);
    }

    let message = commit_message(Utc::now());
    git.commit(&message).await.map_err(SyncError::Commit)?;
    tracing::info!("Committed: {}", message);

    if options.push {
        git.push().await.map_err(SyncError::Push)?;
        tracing::info!("Pushed to remote");
    }

    Ok(SyncOutcome::Committed {
        message,
        pushed: options.push,
    })
}
