use std::path::Path;
use thiserror::Error;

use crate::config::MirrorConfig;
use crate::fetch::{FetchError, Fetcher};
use crate::publish::{self, PublishError, Publisher};
use crate::rewrite::{RewriteReport, Rewriter};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to prepare staging directory: {0}")]
    Staging(#[source] PublishError),
    #[error("failed to replace output directory: {0}")]
    Publish(#[source] PublishError),
    #[error("failed to create spider scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
}

impl MirrorError {
    /// Process exit code for this failure. Fetch tool exits pass through.
    pub fn exit_code(&self) -> u8 {
        match self {
            MirrorError::Fetch(e) => u8::try_from(e.exit_code()).ok().filter(|c| *c != 0).unwrap_or(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Spider-only run; nothing was written.
    Probed,
    Published { report: RewriteReport },
}

/// One fetch, rewrite and publish cycle.
pub struct Mirror<F, P> {
    config: MirrorConfig,
    fetcher: F,
    publisher: P,
    rewriter: Rewriter,
}

impl<F: Fetcher, P: Publisher> Mirror<F, P> {
    pub fn new(config: MirrorConfig, fetcher: F, publisher: P) -> Self {
        let rewriter = Rewriter::new(&config.url, config.image_hosts.clone());
        Self {
            config,
            fetcher,
            publisher,
            rewriter,
        }
    }

    pub fn with_rewriter(mut self, rewriter: Rewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub async fn run(&self) -> Result<MirrorOutcome, MirrorError> {
        let config = &self.config;
        tracing::info!("Output directory: {}", config.output_dir.display());
        tracing::info!("Temporary directory: {}", config.staging_dir.display());

        if config.spider {
            tracing::info!("Running spider check for {}", config.url);
            self.probe().await?;
            return Ok(MirrorOutcome::Probed);
        }

        tracing::info!("Running spider check before mirroring {}", config.url);
        if let Err(e) = self.probe().await {
            tracing::error!("Skipping mirroring because spider check failed; keeping existing output");
            return Err(e.into());
        }

        if let Err(e) =
            publish::prepare_staging(&config.staging_dir, &config.output_dir, config.clean)
        {
            publish::discard_staging(&config.staging_dir);
            return Err(MirrorError::Staging(e));
        }

        if let Err(e) = self.fetcher.mirror(&config.url, &config.staging_dir).await {
            tracing::error!("Mirror failed: {}", e);
            publish::discard_staging(&config.staging_dir);
            return Err(e.into());
        }

        let report = self.rewriter.rewrite_tree(&config.staging_dir).await;

        if let Err(e) = self
            .publisher
            .publish(&config.staging_dir, &config.output_dir)
        {
            publish::discard_staging(&config.staging_dir);
            return Err(MirrorError::Publish(e));
        }

        tracing::info!("Published {}", config.output_dir.display());
        Ok(MirrorOutcome::Published { report })
    }

    /// Spider into a throwaway directory; the staging directory may hold a previous run.
    async fn probe(&self) -> Result<(), MirrorError> {
        let scratch = tempfile::Builder::new()
            .prefix("site-mirror-spider")
            .tempdir()
            .map_err(MirrorError::Scratch)?;
        self.fetcher.probe(&self.config.url, scratch.path()).await?;
        Ok(())
    }
}
