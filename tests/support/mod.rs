//! Mock MindTouch library served by wiremock.

#![allow(dead_code)]

use mindtouch_zim::config::{Config, RunConfig};
use serde_json::json;
use std::path::Path;
use wiremock::matchers::{header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "test-token";

/// Bytes served for image assets; any non-empty body works.
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\nrock";
pub const LOGO: &[u8] = b"\x89PNG\r\n\x1a\nlogo";

pub struct MockLibrary {
    pub server: MockServer,
}

impl MockLibrary {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Home page with the API token and a branding logo at /logo.png.
    pub async fn home(&self) {
        let html = format!(
            r#"<!DOCTYPE html><html><head>
            <script id="mt-global-settings" type="application/json">{{"apiToken":"{}"}}</script>
            </head><body><div class="LTBranding"><img src="/logo.png"></div></body></html>"#,
            TOKEN
        );
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html"))
            .mount(&self.server)
            .await;
        self.file("/logo.png", LOGO, "image/png").await;
    }

    /// Home page naming a screen stylesheet at /styles/screen.css, which is served
    /// with `screen_css`, plus one inline style block.
    pub async fn home_with_styles(&self, screen_css: &str, inline_css: &str) {
        let html = format!(
            r#"<!DOCTYPE html><html><head>
            <script id="mt-global-settings" type="application/json">{{"apiToken":"{}"}}</script>
            <link rel="stylesheet" media="screen" href="/styles/screen.css">
            <style type="text/css">{}</style>
            </head><body></body></html>"#,
            TOKEN, inline_css
        );
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html"))
            .mount(&self.server)
            .await;
        self.file("/styles/screen.css", screen_css.as_bytes(), "text/css").await;
    }

    pub async fn page_info(&self, id: &str, title: &str, page_path: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/@api/deki/pages/{}", id)))
            .and(header("x-deki-token", TOKEN))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@id": id,
                "title": title,
                "path": {"@seo": "true", "#text": page_path},
            })))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Subpage listing of `parent`, all entries on one listing page.
    pub async fn children(&self, parent: &str, children: &[(&str, &str, &str)]) {
        let entries: Vec<_> = children
            .iter()
            .map(|(id, title, page_path)| json!({"@id": id, "title": title, "path": {"#text": page_path}}))
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/@api/deki/pages/{}/subpages", parent)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@count": entries.len().to_string(),
                "@totalcount": entries.len().to_string(),
                "page.subpage": entries,
            })))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Every listing without a specific mock is empty.
    pub async fn leaves(&self) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/@api/deki/pages/[^/]+/subpages$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@count": "0",
                "@totalcount": "0",
                "page.subpage": "",
            })))
            .with_priority(10)
            .mount(&self.server)
            .await;
    }

    pub async fn contents(&self, id: &str, markup: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/@api/deki/pages/{}/contents", id)))
            .and(query_param("mode", "view"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "body": [markup, {}] })))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Every page without specific contents gets a short paragraph.
    pub async fn default_contents(&self) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/@api/deki/pages/[^/]+/contents$"))
            .and(query_param("mode", "view"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "body": "<p>ok</p>" })))
            .with_priority(10)
            .mount(&self.server)
            .await;
    }

    pub async fn status(&self, request_path: &str, status: u16) {
        Mock::given(method("GET"))
            .and(path(request_path))
            .respond_with(ResponseTemplate::new(status))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    pub async fn file(&self, request_path: &str, bytes: &[u8], content_type: &str) {
        Mock::given(method("GET"))
            .and(path(request_path))
            .respond_with(ResponseTemplate::new(200).set_body_raw(bytes.to_vec(), content_type))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }
}

/// Settings for a fast run against `library`, writing into `output_dir`.
pub fn settings(library: &MockLibrary, output_dir: &Path) -> Config {
    Config {
        library_slug: Some("geo".to_string()),
        library_url: Some(library.uri()),
        name: Some("libretexts.org_en_geo".to_string()),
        title: Some("Geosciences".to_string()),
        root_page_id: Some("28207".to_string()),
        output_dir: Some(output_dir.to_path_buf()),
        file_name_template: Some("{clean_slug}_{name}".to_string()),
        retry_count: Some(2),
        backoff_base_secs: Some(0),
        backoff_max_secs: Some(0),
        timeout_secs: Some(5),
        ..Config::default()
    }
}

pub fn resolve(config: Config) -> RunConfig {
    RunConfig::resolve(config).expect("valid settings")
}
