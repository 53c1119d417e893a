use site_mirror::config::{Exclusions, REJECT_REGEX};
use site_mirror::fetch::{Fetcher, Wget};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn page(server: &MockServer, at: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/html"))
        .mount(server)
        .await;
}

async fn requested_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.url.path().to_string())
        .collect()
}

#[tokio::test]
async fn wget_never_requests_excluded_paths() {
    let Ok(program) = which::which("wget") else {
        return;
    };

    let server = MockServer::start().await;
    page(
        &server,
        "/",
        r#"<html><body>
            <a href="/archives/1/">Post</a>
            <a href="/admin/login.php">Log in</a>
            <a href="/feed/">RSS</a>
        </body></html>"#,
    )
    .await;
    page(
        &server,
        "/archives/1/",
        r#"<html><body><a href="/archives/1/comment">Reply</a></body></html>"#,
    )
    .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let staging = tempfile::tempdir().unwrap();
    let wget = Wget::new(program, Exclusions::default());
    let url = Url::parse(&format!("{}/", server.uri())).unwrap();
    // wget exits non-zero for the 404s; only the requests matter here
    let _ = wget.mirror(&url, staging.path()).await;

    let paths = requested_paths(&server).await;
    assert!(paths.iter().any(|p| p == "/archives/1/"), "crawl did not follow links: {paths:?}");
    for excluded in ["/admin/login.php", "/feed/", "/archives/1/comment"] {
        assert!(!paths.iter().any(|p| p == excluded), "{excluded} was requested: {paths:?}");
    }
    assert!(staging.path().join("archives/1/index.html").exists());
    assert!(!staging.path().join("admin").exists());
    assert!(Exclusions::default().is_excluded(&format!("{}/admin/login.php", server.uri())));
    assert_eq!(Exclusions::default().as_str(), REJECT_REGEX);
}

#[tokio::test]
async fn wget_applies_exclusions_to_the_whole_url() {
    let Ok(program) = which::which("wget") else {
        return;
    };

    let server = MockServer::start().await;
    page(
        &server,
        "/",
        r#"<html><body><a href="/index.php/action/login">Log in</a><a href="/about.html">About</a></body></html>"#,
    )
    .await;
    page(&server, "/about.html", "<html><body>about</body></html>").await;

    let anchored = format!("^{}/index\\.php/action/", regex::escape(&server.uri()));
    let exclusions = Exclusions::new(&anchored).unwrap();
    assert!(exclusions.is_excluded(&format!("{}/index.php/action/login", server.uri())));

    let staging = tempfile::tempdir().unwrap();
    let wget = Wget::new(program, exclusions);
    let url = Url::parse(&format!("{}/", server.uri())).unwrap();
    let _ = wget.mirror(&url, staging.path()).await;

    let paths = requested_paths(&server).await;
    assert!(paths.iter().any(|p| p == "/about.html"), "crawl did not follow links: {paths:?}");
    assert!(!paths.iter().any(|p| p.starts_with("/index.php/action/")), "{paths:?}");
}
