use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use regex::{Captures, Regex};
use reqwest::Client;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use walkdir::WalkDir;

pub const EXTERNAL_ASSETS_DIR: &str = "external_assets";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

static CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"charset\s*=\s*["']?([A-Za-z0-9_\-]+)"#).unwrap());

static IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(<img\b[^>]*?\ssrc\s*=\s*["'])(https?://[^"']+)(["'])"#).unwrap()
});

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(url\(\s*["']?)(https?://[^"'()\s]+)(["']?\s*\))"#).unwrap()
});

static IMG_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img[src]").unwrap());

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("rewritten {path} is not representable in {encoding}")]
    Encode {
        path: PathBuf,
        encoding: &'static str,
    },
    #[error("download of {url} failed: {source}")]
    Download { url: String, source: reqwest::Error },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RewriteReport {
    pub scanned: usize,
    pub rewritten: usize,
    pub failed: usize,
    pub downloaded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Html,
    Css,
    Script,
}

impl FileKind {
    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "html" | "htm" => Some(Self::Html),
            "css" => Some(Self::Css),
            "js" => Some(Self::Script),
            _ => None,
        }
    }
}

/// Turns a downloaded site into a self-contained tree.
///
/// References to the mirrored host become relative paths to the local copy,
/// and images served from other hosts are downloaded into
/// [`EXTERNAL_ASSETS_DIR`] and referenced relatively.
pub struct Rewriter {
    host: String,
    own_link: Regex,
    image_hosts: Vec<String>,
    client: Client,
}

impl Rewriter {
    pub fn new(base: &Url, image_hosts: Vec<String>) -> Self {
        let host = base.host_str().unwrap_or_default().to_ascii_lowercase();
        let authority = match base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        let own_link = Regex::new(&format!(
            r#"(?i)(?:https?:)?//{}(?P<path>/[^\s"'<>()\\]*)?"#,
            regex::escape(&authority)
        ))
        .unwrap();
        let client = Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            host,
            own_link,
            image_hosts: image_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            client,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Rewrites every HTML, CSS and JS file under `root`. A failure on one
    /// file is logged and leaves that file as it was.
    pub async fn rewrite_tree(&self, root: &Path) -> RewriteReport {
        let mut report = RewriteReport::default();
        let mut assets = AssetCache::new(root.join(EXTERNAL_ASSETS_DIR), self.client.clone());

        let mut files: Vec<(PathBuf, FileKind)> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| FileKind::of(e.path()).map(|kind| (e.into_path(), kind)))
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, kind) in files {
            report.scanned += 1;
            match self.rewrite_file(root, &path, kind, &mut assets).await {
                Ok(true) => {
                    tracing::debug!("Rewrote {}", path.display());
                    report.rewritten += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Leaving {} unchanged: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }

        report.downloaded = assets.downloaded;
        tracing::info!(
            "Rewrite finished: {} scanned, {} rewritten, {} failed, {} images downloaded",
            report.scanned,
            report.rewritten,
            report.failed,
            report.downloaded
        );
        report
    }

    async fn rewrite_file(
        &self,
        root: &Path,
        path: &Path,
        kind: FileKind,
        assets: &mut AssetCache,
    ) -> Result<bool, RewriteError> {
        let bytes = fs::read(path).map_err(|source| RewriteError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let (original, encoding) = decode(&bytes);
        let dir = path.parent().unwrap_or(root);

        let mut text = self.rewrite_own_links(root, dir, &original);
        if kind == FileKind::Html {
            text = self.localise_img_sources(dir, &text, assets).await;
        }
        if kind != FileKind::Script {
            text = self.localise_css_urls(dir, &text, assets).await;
        }

        if text == original {
            return Ok(false);
        }

        let (encoded, _, unmappable) = encoding.encode(&text);
        if unmappable {
            return Err(RewriteError::Encode {
                path: path.to_path_buf(),
                encoding: encoding.name(),
            });
        }
        write_replacing(path, &encoded)?;
        Ok(true)
    }

    /// Replaces absolute references to the mirrored host with relative paths,
    /// for every reference that has a local file behind it.
    pub fn rewrite_own_links(&self, root: &Path, dir: &Path, text: &str) -> String {
        self.own_link
            .replace_all(text, |caps: &Captures| {
                let whole = &caps[0];
                let end = caps.get(0).map(|m| m.end()).unwrap_or_default();
                if caps.name("path").is_none() && continues_host(text, end) {
                    return whole.to_string();
                }

                let reference = caps.name("path").map(|m| m.as_str()).unwrap_or("/");
                let (location, fragment) = match reference.split_once('#') {
                    Some((loc, frag)) => (loc, Some(frag)),
                    None => (reference, None),
                };

                match find_local(root, location) {
                    Some(local) => {
                        let mut relative = relative_path(dir, &local);
                        if let Some(fragment) = fragment {
                            relative.push('#');
                            relative.push_str(fragment);
                        }
                        relative
                    }
                    None => whole.to_string(),
                }
            })
            .into_owned()
    }

    fn is_external_image_host(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        if host == self.host {
            return false;
        }
        self.image_hosts.is_empty()
            || self
                .image_hosts
                .iter()
                .any(|h| host == *h || host.ends_with(&format!(".{h}")))
    }

    async fn localise_img_sources(&self, dir: &Path, text: &str, assets: &mut AssetCache) -> String {
        let rewritable: HashSet<String> = IMG_SRC
            .captures_iter(text)
            .map(|caps| caps[2].replace("&amp;", "&"))
            .collect();
        let sources: Vec<String> = {
            let document = Html::parse_document(text);
            document
                .select(&IMG_SELECTOR)
                .filter_map(|img| img.value().attr("src"))
                .filter(|src| rewritable.contains(*src))
                .filter(|src| self.is_external_image_host(src))
                .map(str::to_string)
                .collect()
        };
        if sources.is_empty() {
            return text.to_string();
        }

        let local = assets.localise_all(sources).await;
        IMG_SRC
            .replace_all(text, |caps: &Captures| {
                let src = caps[2].replace("&amp;", "&");
                match local.get(&src) {
                    Some(path) => format!("{}{}{}", &caps[1], relative_path(dir, path), &caps[3]),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Stylesheet `url()` references are only localised when they point at an
    /// image: a listed image host, or an image file extension. `@import`
    /// targets are stylesheets and always stay remote.
    fn is_css_image(&self, text: &str, start: usize, url: &str) -> bool {
        if follows_import(text, start) || !self.is_external_image_host(url) {
            return false;
        }
        !self.image_hosts.is_empty() || has_image_extension(url)
    }

    async fn localise_css_urls(&self, dir: &Path, text: &str, assets: &mut AssetCache) -> String {
        let sources: Vec<String> = CSS_URL
            .captures_iter(text)
            .filter_map(|caps| {
                let start = caps.get(0).map(|m| m.start()).unwrap_or_default();
                let src = caps[2].replace("&amp;", "&");
                self.is_css_image(text, start, &src).then_some(src)
            })
            .collect();
        if sources.is_empty() {
            return text.to_string();
        }

        let local = assets.localise_all(sources).await;
        CSS_URL
            .replace_all(text, |caps: &Captures| {
                let start = caps.get(0).map(|m| m.start()).unwrap_or_default();
                let src = caps[2].replace("&amp;", "&");
                match local.get(&src) {
                    Some(path) if !follows_import(text, start) => {
                        format!("{}{}{}", &caps[1], relative_path(dir, path), &caps[3])
                    }
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// Downloads external assets once per run.
struct AssetCache {
    dir: PathBuf,
    client: Client,
    resolved: HashMap<String, PathBuf>,
    failed: HashSet<String>,
    downloaded: usize,
}

impl AssetCache {
    fn new(dir: PathBuf, client: Client) -> Self {
        Self {
            dir,
            client,
            resolved: HashMap::new(),
            failed: HashSet::new(),
            downloaded: 0,
        }
    }

    async fn localise_all(&mut self, urls: Vec<String>) -> HashMap<String, PathBuf> {
        let mut local = HashMap::new();
        for url in urls {
            if local.contains_key(&url) {
                continue;
            }
            if let Some(path) = self.localise(&url).await {
                local.insert(url, path);
            }
        }
        local
    }

    async fn localise(&mut self, url: &str) -> Option<PathBuf> {
        if let Some(path) = self.resolved.get(url) {
            return Some(path.clone());
        }
        if self.failed.contains(url) {
            return None;
        }

        let dest = self.dir.join(hashed_filename(url, ".img"));
        if !dest.exists() {
            if let Err(e) = self.download(url, &dest).await {
                tracing::warn!("Keeping remote reference: {}", e);
                self.failed.insert(url.to_string());
                return None;
            }
            tracing::debug!("Downloaded {} -> {}", url, dest.display());
            self.downloaded += 1;
        }

        self.resolved.insert(url.to_string(), dest.clone());
        Some(dest)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), RewriteError> {
        let to_download = |source| RewriteError::Download {
            url: url.to_string(),
            source,
        };
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(to_download)?
            .bytes()
            .await
            .map_err(to_download)?;

        fs::create_dir_all(&self.dir).map_err(|source| RewriteError::Write {
            path: self.dir.clone(),
            source,
        })?;
        write_replacing(dest, &bytes)
    }
}

/// Decodes a document, honouring a declared charset and falling back to detection.
pub fn decode(bytes: &[u8]) -> (String, &'static Encoding) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_string(), UTF_8);
    }

    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]);
    if let Some(encoding) = CHARSET
        .captures(&head)
        .and_then(|cap| Encoding::for_label(cap[1].as_bytes()))
    {
        let (text, _, _) = encoding.decode(bytes);
        return (text.into_owned(), encoding);
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);
    let (text, _, _) = encoding.decode(bytes);
    (text.into_owned(), encoding)
}

/// `<sha256 of url><extension>`; `default_ext` when the URL path has none.
pub fn hashed_filename(url: &str, default_ext: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let ext = Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(|e| format!(".{}", e.to_ascii_lowercase()))
        })
        .unwrap_or_else(|| default_ext.to_string());
    format!("{digest}{ext}")
}

/// Relative reference from directory `from` to file `to`, with `/` separators.
pub fn relative_path(from: &Path, to: &Path) -> String {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut parts: Vec<String> = Vec::new();
    parts.extend(std::iter::repeat_n("..".to_string(), from.len() - common));
    parts.extend(
        to[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "avif", "bmp", "ico",
];

fn has_image_extension(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .unwrap_or(false)
}

fn follows_import(text: &str, start: usize) -> bool {
    let before = text[..start].trim_end();
    before
        .len()
        .checked_sub(7)
        .and_then(|at| before.get(at..))
        .is_some_and(|tail| tail.eq_ignore_ascii_case("@import"))
}

fn continues_host(text: &str, end: usize) -> bool {
    text[end..]
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '@'))
}

/// Finds the file a site path was saved as, trying the names the crawler
/// produces for directory indexes, adjusted extensions and query strings.
fn find_local(root: &Path, location: &str) -> Option<PathBuf> {
    let (path, query) = match location.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (location, None),
    };

    let mut names: Vec<String> = Vec::new();
    let mut variants = vec![(path.to_string(), query.map(str::to_string))];
    if let Ok(decoded) = urlencoding::decode(path) {
        let decoded_query = query.and_then(|q| urlencoding::decode(q).ok().map(|q| q.into_owned()));
        variants.push((decoded.into_owned(), decoded_query));
    }

    for (path, query) in variants {
        let mut name = path.trim_start_matches('/').to_string();
        if let Some(query) = query {
            name.push('@');
            name.push_str(&query);
        }
        if name.is_empty() || name.ends_with('/') {
            names.push(format!("{name}index.html"));
            continue;
        }
        names.push(name.clone());
        if !name.ends_with(".html") {
            names.push(format!("{name}.html"));
        }
        names.push(format!("{name}/index.html"));
    }

    names
        .into_iter()
        .map(PathBuf::from)
        .filter(|name| name.components().all(|c| matches!(c, Component::Normal(_))))
        .map(|name| root.join(name))
        .find(|candidate| candidate.is_file())
}

fn write_replacing(path: &Path, contents: &[u8]) -> Result<(), RewriteError> {
    let to_write = |source| RewriteError::Write {
        path: path.to_path_buf(),
        source,
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{name}.rewrite"));
    fs::write(&temp, contents).map_err(to_write)?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        to_write(e)
    })
}
