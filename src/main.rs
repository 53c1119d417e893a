use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use site_mirror::config::{self, FileConfig, MirrorConfig, Overrides};
use site_mirror::git::Git;
use site_mirror::sync::{self, SyncOptions, SyncOutcome};
use site_mirror::{Mirror, MirrorOutcome, RenamePublisher, Wget, telemetry};

/// Mirror a website into a local static site directory.
#[derive(Debug, Parser)]
#[command(name = "site-mirror", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    mirror: MirrorArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pull, mirror, then commit and push the output if it changed.
    Sync {
        #[command(flatten)]
        mirror: MirrorArgs,

        /// Repository holding the published output.
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Commit without pushing.
        #[arg(long)]
        no_push: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct MirrorArgs {
    /// Root URL to mirror [default: https://typecho.org/]
    #[arg(long)]
    url: Option<String>,

    /// Directory, relative to the working directory, for the mirrored site [default: site]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Start from an empty temporary directory (default).
    #[arg(long, conflicts_with = "no_clean")]
    clean: bool,

    /// Seed the temporary directory from the existing output before mirroring.
    #[arg(long)]
    no_clean: bool,

    /// Only check links with wget's spider mode; download nothing.
    #[arg(long)]
    spider: bool,

    /// JSON file with defaults for the options above.
    #[arg(long)]
    config: Option<PathBuf>,

    /// wget executable to use instead of searching for one.
    #[arg(long)]
    wget: Option<PathBuf>,

    /// Only localise images from these hosts (repeatable). All external hosts when omitted.
    #[arg(long = "image-host")]
    image_hosts: Vec<String>,
}

impl MirrorArgs {
    fn resolve(self) -> Result<MirrorConfig> {
        let root = std::env::current_dir().context("cannot determine working directory")?;
        let file = match &self.config {
            Some(path) => config::load(path)?,
            None => FileConfig::default(),
        };
        let clean = match (self.clean, self.no_clean) {
            (_, true) => Some(false),
            (true, _) => Some(true),
            _ => None,
        };
        let overrides = Overrides {
            url: self.url,
            output_dir: self.output_dir,
            clean,
            spider: self.spider,
            image_hosts: self.image_hosts,
            wget: self.wget,
        };
        Ok(MirrorConfig::resolve(&root, file, overrides)?)
    }
}

fn build_mirror(args: MirrorArgs) -> Result<Mirror<Wget, RenamePublisher>> {
    let config = args.resolve()?;
    let wget = Wget::from_config(&config)?;
    tracing::info!("Using wget at: {}", wget.program().display());
    Ok(Mirror::new(config, wget, RenamePublisher))
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = telemetry::init() {
        eprintln!("logging unavailable: {e}");
    }
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Command::Sync {
            mirror,
            repo,
            no_push,
        }) => run_sync(mirror, repo, no_push).await,
        None => run_mirror(cli.mirror).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_mirror(args: MirrorArgs) -> Result<ExitCode> {
    let mirror = build_mirror(args)?;
    match mirror.run().await {
        Ok(MirrorOutcome::Probed) => tracing::info!("Spider check passed"),
        Ok(MirrorOutcome::Published { .. }) => tracing::info!("Mirror finished"),
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(ExitCode::from(e.exit_code()));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_sync(args: MirrorArgs, repo: PathBuf, no_push: bool) -> Result<ExitCode> {
    let mirror = build_mirror(args)?;
    let git = Git::new(repo);
    let options = SyncOptions { push: !no_push };

    match sync::run(&git, &mirror, options).await {
        Ok(SyncOutcome::Probed) => tracing::info!("Spider check passed; nothing to commit"),
        Ok(SyncOutcome::Unchanged) => tracing::info!("Nothing changed"),
        Ok(SyncOutcome::Committed { message, pushed }) => {
            tracing::info!("Committed \"{}\" (pushed: {})", message, pushed)
        }
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(ExitCode::from(e.exit_code()));
        }
    }
    Ok(ExitCode::SUCCESS)
}
