//! URL resolution for rewriting: known library pages, download links and asset placeholders.

use crate::rewrite::RewriteError;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Prefix of the temporary asset paths written by the rewriter.
pub const PENDING_PREFIX: &str = "content/_pending/";

/// Extensions of links that point at a file rather than a page.
const DOWNLOAD_EXTENSIONS: &[&str] = &[
    "pdf", "zip", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "csv", "epub",
    "mp3", "mp4", "ipynb",
];

/// Deterministic placeholder path for an asset URL: first 16 hex chars of its SHA-256.
pub fn placeholder_for(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex = hex::encode(digest);
    format!("{}{}", PENDING_PREFIX, &hex[..16])
}

/// Pages of the library that links may point to, keyed by their normalized URL path.
#[derive(Debug, Clone)]
pub struct KnownPages {
    base: Url,
    by_key: HashMap<String, String>,
}

impl KnownPages {
    /// Index `paths` (archive paths such as `Bookshelves/Geology`) below `library_url`.
    pub fn new<I, S>(library_url: &str, paths: I) -> Result<Self, RewriteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let base = Url::parse(&format!("{}/", library_url.trim_end_matches('/'))).map_err(|e| {
            RewriteError::LibraryUrl {
                url: library_url.to_string(),
                reason: e.to_string(),
            }
        })?;
        let mut by_key = HashMap::new();
        for path in paths {
            let path = path.as_ref();
            if let Some(url) = join_path(&base, path) {
                by_key.insert(key_of(&url), path.to_string());
            }
        }
        Ok(Self { base, by_key })
    }

    /// Live URL of a page, used as the base for its relative references.
    pub fn page_url(&self, path: &str) -> Url {
        join_path(&self.base, path).unwrap_or_else(|| self.base.clone())
    }

    /// Archive path of the page `url` points to, if it is a known page of this library.
    pub fn lookup(&self, url: &Url) -> Option<&str> {
        if !self.same_site(url) {
            return None;
        }
        self.by_key.get(&key_of(url)).map(String::as_str)
    }

    /// Whether `url` is a file hosted by the library (attachment API or a file extension).
    pub fn is_download(&self, url: &Url) -> bool {
        if !self.same_site(url) {
            return false;
        }
        let path = url.path();
        if path.contains("/@api/deki/files/") {
            return true;
        }
        path.rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| DOWNLOAD_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }

    fn same_site(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https") && url.host_str() == self.base.host_str()
    }
}

/// Append a page path to the library base. Page paths may contain `:` in their first
/// segment, which [Url::join] would read as a scheme.
fn join_path(base: &Url, path: &str) -> Option<Url> {
    Url::parse(&format!("{}{}", base, path.trim_start_matches('/'))).ok()
}

/// Path with every segment percent-decoded, so `01%3A_Rocks` and `01:_Rocks` agree.
fn key_of(url: &Url) -> String {
    url.path()
        .trim_matches('/')
        .split('/')
        .map(|segment| match urlencoding::decode(segment) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// How a reference is treated, based on its raw attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Fragment, mail, script, data and already rewritten references.
    Untouched,
    /// An http(s) URL, resolved against the page.
    Absolute(Url),
}

/// Resolve a raw `href`/`src` against `base`. Archive-relative and non-web targets stay as they are.
pub fn resolve(base: &Url, raw: &str) -> Target {
    let value = raw.trim();
    if value.is_empty() || value.starts_with('#') || value.starts_with("content/") {
        return Target::Untouched;
    }
    let lower = value.to_ascii_lowercase();
    if ["mailto:", "javascript:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return Target::Untouched;
    }
    match base.join(value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Target::Absolute(url),
        _ => Target::Untouched,
    }
}
