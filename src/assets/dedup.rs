//! Content-addressed asset store shared by all asset workers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Directory of deduplicated assets inside the archive.
pub const ASSETS_DIR: &str = "content/assets/";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Digest used as the dedup key. Hex encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    pub fn digest(self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Blake3 => blake3::hash(bytes).to_hex().to_string(),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(format!(
                "Unknown hash algorithm: {} (use sha256 or blake3)",
                other
            )),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

/// One stored binary. Exactly one exists per hash.
#[derive(Debug)]
struct Asset {
    bytes: Vec<u8>,
    /// Every source URL that produced these bytes, with the type it was served as.
    sources: BTreeMap<String, Option<String>>,
    refcount: usize,
}

impl Asset {
    /// Type and URL that decide the archive path: the smallest URL with a known type,
    /// else the smallest URL. Independent of insertion order.
    fn canonical(&self) -> (Option<&str>, &str) {
        if let Some((url, ct)) = self
            .sources
            .iter()
            .find_map(|(url, ct)| ct.as_deref().map(|ct| (url, ct)))
        {
            return (Some(ct), url);
        }
        let url = self.sources.keys().next().map(String::as_str).unwrap_or_default();
        (None, url)
    }

    fn path(&self, hash: &str) -> String {
        let (content_type, url) = self.canonical();
        asset_path(hash, content_type, url)
    }
}

/// Snapshot of one asset, ready for the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub hash: String,
    pub path: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Number of distinct source URLs that resolved to these bytes.
    pub refcount: usize,
}

/// Outcome of [DedupStore::insert].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New,
    /// Bytes were already stored under this hash; the new copy was discarded.
    Existing,
}

/// Hash → asset map. Inserts for the same hash are serialized by the map's entry lock;
/// unrelated hashes proceed in parallel.
#[derive(Debug, Default)]
pub struct DedupStore {
    assets: DashMap<String, Asset>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bytes` under `hash`, or bump the reference count of the existing asset.
    pub fn insert(
        &self,
        hash: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        source_url: &str,
    ) -> Inserted {
        match self.assets.entry(hash.to_string()) {
            Entry::Occupied(mut entry) => {
                let asset = entry.get_mut();
                asset.refcount += 1;
                let known = asset.sources.entry(source_url.to_string()).or_default();
                if known.is_none() {
                    *known = content_type;
                }
                Inserted::Existing
            }
            Entry::Vacant(entry) => {
                let mut sources = BTreeMap::new();
                sources.insert(source_url.to_string(), content_type);
                entry.insert(Asset {
                    bytes,
                    sources,
                    refcount: 1,
                });
                Inserted::New
            }
        }
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn refcount(&self, hash: &str) -> Option<usize> {
        self.assets.get(hash).map(|a| a.refcount)
    }

    /// Archive path of the asset stored under `hash`.
    pub fn final_path(&self, hash: &str) -> Option<String> {
        self.assets.get(hash).map(|a| a.path(hash))
    }

    /// Drain the store into archive-ready assets sorted by path.
    pub fn into_sorted(self) -> Vec<StoredAsset> {
        let mut out: Vec<StoredAsset> = self
            .assets
            .into_iter()
            .map(|(hash, a)| StoredAsset {
                path: a.path(&hash),
                content_type: a
                    .canonical()
                    .0
                    .unwrap_or(FALLBACK_CONTENT_TYPE)
                    .to_string(),
                hash,
                bytes: a.bytes,
                refcount: a.refcount,
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}

/// `content/assets/{hash}{ext}`; the extension comes from the content type, else the URL.
pub fn asset_path(hash: &str, content_type: Option<&str>, url: &str) -> String {
    let ext = content_type
        .and_then(extension_for_type)
        .map(str::to_string)
        .or_else(|| extension_from_url(url))
        .unwrap_or_default();
    format!("{}{}{}", ASSETS_DIR, hash, ext)
}

fn extension_for_type(content_type: &str) -> Option<&'static str> {
    let ext = match content_type {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/gif" => ".gif",
        "image/svg+xml" => ".svg",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        "image/bmp" => ".bmp",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/ogg" => ".ogv",
        "audio/mpeg" => ".mp3",
        "audio/ogg" => ".ogg",
        "audio/wav" | "audio/x-wav" => ".wav",
        "text/vtt" => ".vtt",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        _ => return None,
    };
    Some(ext)
}

fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// Content type guessed from a URL, for servers that do not declare one.
pub fn guess_content_type(url: &str) -> Option<&'static str> {
    let ext = extension_from_url(url)?;
    let ct = match ext.as_str() {
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".webp" => "image/webp",
        ".mp4" => "video/mp4",
        ".webm" => "video/webm",
        ".mp3" => "audio/mpeg",
        ".pdf" => "application/pdf",
        ".zip" => "application/zip",
        _ => return None,
    };
    Some(ct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hash_algorithms_are_hex_and_distinct() {
        let sha = HashAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let b3 = HashAlgorithm::Blake3.digest(b"abc");
        assert_eq!(b3.len(), 64);
        assert_ne!(sha, b3);
        assert_eq!("BLAKE3".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Blake3));
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn same_hash_is_stored_once() {
        let store = DedupStore::new();
        let h = HashAlgorithm::Sha256.digest(b"png-bytes");
        assert_eq!(
            store.insert(&h, b"png-bytes".to_vec(), Some("image/png".into()), "https://b/x.png"),
            Inserted::New
        );
        assert_eq!(
            store.insert(&h, b"png-bytes".to_vec(), None, "https://a/y.png"),
            Inserted::Existing
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.refcount(&h), Some(2));
        assert_eq!(store.final_path(&h), Some(format!("content/assets/{}.png", h)));
    }

    #[test]
    fn canonical_type_follows_smallest_url() {
        let store = DedupStore::new();
        store.insert("h", b"x".to_vec(), Some("image/jpeg".into()), "https://z/a");
        store.insert("h", b"x".to_vec(), Some("image/png".into()), "https://a/a");
        let assets = store.into_sorted();
        assert_eq!(assets[0].content_type, "image/png");
        assert_eq!(assets[0].path, "content/assets/h.png");
    }

    #[test]
    fn path_does_not_depend_on_arrival_order() {
        let arrivals = [
            ("https://x/a", None),
            ("https://x/b", Some("image/png")),
            ("https://x/c", Some("image/jpeg")),
        ];
        let orders: [[usize; 3]; 4] = [[0, 1, 2], [0, 2, 1], [2, 1, 0], [1, 2, 0]];
        let results: Vec<_> = orders
            .iter()
            .map(|order| {
                let store = DedupStore::new();
                for &i in order {
                    let (url, ct) = arrivals[i];
                    store.insert("h", b"x".to_vec(), ct.map(String::from), url);
                }
                let path = store.final_path("h");
                (path, store.into_sorted()[0].content_type.clone())
            })
            .collect();
        for result in &results {
            assert_eq!(result.0.as_deref(), Some("content/assets/h.png"));
            assert_eq!(result.1, "image/png");
        }
    }

    #[test]
    fn untyped_asset_uses_smallest_url_extension() {
        let store = DedupStore::new();
        store.insert("h", b"x".to_vec(), None, "https://x/b.gif");
        store.insert("h", b"x".to_vec(), None, "https://x/a.svg");
        let assets = store.into_sorted();
        assert_eq!(assets[0].path, "content/assets/h.svg");
        assert_eq!(assets[0].content_type, "application/octet-stream");
    }

    #[test]
    fn concurrent_inserts_agree_on_one_asset() {
        let store = Arc::new(DedupStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.insert("same", vec![1, 2, 3], None, &format!("https://h/{}.bin", i))
                })
            })
            .collect();
        let news = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|r| *r == Inserted::New)
            .count();
        assert_eq!(news, 1);
        assert_eq!(store.refcount("same"), Some(8));
    }

    #[test]
    fn paths_fall_back_to_url_extension() {
        assert_eq!(asset_path("h", None, "https://x/a/File.JPEG?x=1"), "content/assets/h.jpeg");
        assert_eq!(asset_path("h", Some("application/x-weird"), "https://x/a/noext"), "content/assets/h");
        assert_eq!(guess_content_type("https://x/a.svg"), Some("image/svg+xml"));
    }
}
