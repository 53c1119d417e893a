#![allow(dead_code)]

use async_trait::async_trait;
use site_mirror::config::MirrorConfig;
use site_mirror::fetch::{FetchError, Fetcher};
use site_mirror::rewrite::Rewriter;
use site_mirror::{Mirror, RenamePublisher};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;
use walkdir::WalkDir;

pub const SITE_URL: &str = "https://blog.example/";

/// Stands in for wget: writes a fixed set of pages into the staging directory.
pub struct FakeSite {
    pub pages: Vec<(String, String)>,
    /// Every scratch directory handed to `probe`.
    pub scratches: std::sync::Mutex<Vec<PathBuf>>,
    pub reachable: bool,
    pub fail_mirror: bool,
    pub probes: AtomicUsize,
    pub mirrors: AtomicUsize,
}

impl FakeSite {
    pub fn new(pages: Vec<(&str, String)>) -> Self {
        Self {
            pages: pages.into_iter().map(|(p, b)| (p.to_string(), b)).collect(),
            scratches: Default::default(),
            reachable: true,
            fail_mirror: false,
            probes: AtomicUsize::new(0),
            mirrors: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn failing(pages: Vec<(&str, String)>) -> Self {
        Self {
            fail_mirror: true,
            ..Self::new(pages)
        }
    }
}

#[async_trait]
impl Fetcher for FakeSite {
    async fn probe(&self, _url: &Url, scratch: &Path) -> Result<(), FetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.scratches.lock().unwrap().push(scratch.to_path_buf());
        // wget --spider leaves an empty host directory behind
        fs::create_dir_all(scratch.join("blog.example")).unwrap();
        if self.reachable {
            Ok(())
        } else {
            Err(FetchError::Exit { code: 4 })
        }
    }

    async fn mirror(&self, _url: &Url, staging: &Path) -> Result<(), FetchError> {
        self.mirrors.fetch_add(1, Ordering::SeqCst);
        for (path, body) in &self.pages {
            let target = staging.join(path);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::write(target, body).unwrap();
            if self.fail_mirror {
                return Err(FetchError::Exit { code: 8 });
            }
        }
        Ok(())
    }
}

pub fn config(root: &Path) -> MirrorConfig {
    MirrorConfig::new(root, SITE_URL, Path::new("site")).unwrap()
}

pub fn mirror(config: MirrorConfig, site: FakeSite) -> Mirror<FakeSite, RenamePublisher> {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let rewriter = Rewriter::new(&config.url, config.image_hosts.clone()).with_client(client);
    Mirror::new(config, site, RenamePublisher).with_rewriter(rewriter)
}

pub fn write(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Relative path -> contents for every file under `root`.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Three pages linking to each other and to one image on `image_base`.
pub fn blog_pages(image_base: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "index.html",
            concat!(
                r#"<html><body><a href="https://blog.example/archives/1/">First</a>"#,
                r#"<a href="https://blog.example/archives/2/">Second</a></body></html>"#,
            )
            .to_string(),
        ),
        (
            "archives/1/index.html",
            format!(
                r#"<html><body><a href="https://blog.example/">Home</a><img alt="cat" src="{image_base}/img/cat.png"></body></html>"#
            ),
        ),
        (
            "archives/2/index.html",
            format!(
                r#"<html><body><a href="//blog.example/archives/1/#comments">Prev</a><div style="background: url('{image_base}/img/cat.png')"></div></body></html>"#
            ),
        ),
    ]
}
