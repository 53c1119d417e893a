use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

pub const DEFAULT_URL: &str = "https://typecho.org/";
pub const DEFAULT_OUTPUT_DIR: &str = "site";
pub const REJECT_REGEX: &str = r"/(admin|login|register|action|feed)/|/comment/?(\?|$)";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("unsupported url {0}: only http(s) urls with a host can be mirrored")]
    UnsupportedScheme(String),
    #[error("output directory {0} must stay under the project root")]
    OutputEscapesRoot(PathBuf),
    #[error("invalid exclusion pattern: {0}")]
    InvalidExclusion(#[from] regex::Error),
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Values read from an optional JSON config file. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FileConfig {
    pub url: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub reject_regex: Option<String>,
    pub image_hosts: Option<Vec<String>>,
    pub wget: Option<PathBuf>,
}

pub fn load(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: FileConfig = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config)
}

/// Overrides collected from the command line.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub url: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub clean: Option<bool>,
    pub spider: bool,
    pub image_hosts: Vec<String>,
    pub wget: Option<PathBuf>,
}

/// Path patterns the crawler must never follow.
#[derive(Debug, Clone)]
pub struct Exclusions {
    pattern: Regex,
}

impl Exclusions {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Matches against the whole URL, the way wget applies `--reject-regex`.
    pub fn is_excluded(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

impl Default for Exclusions {
    fn default() -> Self {
        Self {
            pattern: Regex::new(REJECT_REGEX).expect("default reject regex is valid"),
        }
    }
}

/// Settings for a single mirror run.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub root: PathBuf,
    pub url: Url,
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub clean: bool,
    pub spider: bool,
    pub exclusions: Exclusions,
    pub image_hosts: Vec<String>,
    pub wget: Option<PathBuf>,
}

impl MirrorConfig {
    /// Builds the run configuration. CLI overrides win over the file, the file over defaults.
    pub fn resolve(
        root: &Path,
        file: FileConfig,
        overrides: Overrides,
    ) -> Result<Self, ConfigError> {
        let url = overrides
            .url
            .or(file.url)
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let url = parse_url(&url)?;

        let output_dir = overrides
            .output_dir
            .or(file.output_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let output_dir = resolve_output_dir(root, &output_dir)?;
        let staging_dir = sibling_dir(&output_dir, "tmp");

        let exclusions = match file.reject_regex {
            Some(pattern) => Exclusions::new(&pattern)?,
            None => Exclusions::default(),
        };

        let image_hosts = if overrides.image_hosts.is_empty() {
            file.image_hosts.unwrap_or_default()
        } else {
            overrides.image_hosts
        };

        Ok(Self {
            root: root.to_path_buf(),
            url,
            output_dir,
            staging_dir,
            clean: overrides.clean.unwrap_or(true),
            spider: overrides.spider,
            exclusions,
            image_hosts,
            wget: overrides.wget.or(file.wget),
        })
    }

    /// A config with defaults for everything but the URL and output location.
    pub fn new(root: &Path, url: &str, output_dir: &Path) -> Result<Self, ConfigError> {
        Self::resolve(
            root,
            FileConfig::default(),
            Overrides {
                url: Some(url.to_string()),
                output_dir: Some(output_dir.to_path_buf()),
                ..Default::default()
            },
        )
    }
}

pub fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::UnsupportedScheme(raw.to_string()));
    }
    Ok(url)
}

/// Resolves `output_dir` against `root` without touching the filesystem.
pub fn resolve_output_dir(root: &Path, output_dir: &Path) -> Result<PathBuf, ConfigError> {
    let root = normalize(root);
    let target = normalize(&root.join(output_dir));
    if target == root || !target.starts_with(&root) {
        return Err(ConfigError::OutputEscapesRoot(output_dir.to_path_buf()));
    }
    Ok(target)
}

/// `site` -> `site_<suffix>`, next to the original.
pub fn sibling_dir(dir: &Path, suffix: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.with_file_name(format!("{name}_{suffix}"))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
