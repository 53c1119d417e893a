use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use url::Url;

use crate::config::{Exclusions, MirrorConfig};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(
        "wget not found; install wget or place it at tools/mingw64/bin/wget.exe under the project root"
    )]
    NotFound,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("fetch tool exited with code {code}")]
    Exit { code: i32 },
    #[error("fetch tool was terminated by a signal")]
    Killed,
}

impl FetchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FetchError::Exit { code } => *code,
            _ => 1,
        }
    }
}

/// Something that can probe a site and mirror it into a directory.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Checks reachability. Anything written goes to `scratch`, which the caller discards.
    async fn probe(&self, url: &Url, scratch: &Path) -> Result<(), FetchError>;

    /// Downloads the site and its page requisites into `staging`.
    async fn mirror(&self, url: &Url, staging: &Path) -> Result<(), FetchError>;
}

/// Drives an external `wget` binary.
#[derive(Debug, Clone)]
pub struct Wget {
    program: PathBuf,
    exclusions: Exclusions,
}

impl Wget {
    pub fn new(program: PathBuf, exclusions: Exclusions) -> Self {
        Self {
            program,
            exclusions,
        }
    }

    pub fn from_config(config: &MirrorConfig) -> Result<Self, FetchError> {
        let program = match &config.wget {
            Some(path) => path.clone(),
            None => find_wget(&config.root)?,
        };
        Ok(Self::new(program, config.exclusions.clone()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn build_args(&self, url: &Url, dir: &Path, spider: bool) -> Vec<String> {
        let mut args = vec![
            "--mirror".to_string(),
            "--convert-links".to_string(),
            "--adjust-extension".to_string(),
            "--page-requisites".to_string(),
            "--no-parent".to_string(),
            "--restrict-file-names=windows".to_string(),
            format!("--reject-regex={}", self.exclusions.as_str()),
            "-P".to_string(),
            dir.display().to_string(),
            "-nH".to_string(),
        ];
        if spider {
            args.push("--spider".to_string());
        }
        args.push(url.to_string());
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<(), FetchError> {
        tracing::info!("Running: {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FetchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err)));

        let status = child.wait().await.map_err(|source| FetchError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        for task in [stdout, stderr].into_iter().flatten() {
            let _ = task.await;
        }

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(FetchError::Exit { code }),
            None => Err(FetchError::Killed),
        }
    }
}

#[async_trait]
impl Fetcher for Wget {
    async fn probe(&self, url: &Url, scratch: &Path) -> Result<(), FetchError> {
        self.run(self.build_args(url, scratch, true))
            .await
            .inspect_err(|e| tracing::error!("Spider check failed: {}", e))
    }

    async fn mirror(&self, url: &Url, staging: &Path) -> Result<(), FetchError> {
        self.run(self.build_args(url, staging, false)).await
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: "wget", "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading fetch tool output: {}", e);
                break;
            }
        }
    }
}

pub fn bundled_wget_path(root: &Path) -> PathBuf {
    root.join("tools").join("mingw64").join("bin").join("wget.exe")
}

/// Windows prefers the bundled binary; everything else prefers `PATH`.
pub fn find_wget(root: &Path) -> Result<PathBuf, FetchError> {
    let bundled = bundled_wget_path(root);
    let system = which::which("wget").ok();

    let candidates = if cfg!(windows) {
        [Some(bundled).filter(|p| p.exists()), system]
    } else {
        [system, Some(bundled).filter(|p| p.exists())]
    };

    candidates
        .into_iter()
        .flatten()
        .next()
        .ok_or(FetchError::NotFound)
}
