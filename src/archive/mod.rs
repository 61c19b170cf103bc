//! Archive Assembler: writes pages, assets, redirects, the manifest and metadata to an
//! [ArchiveSink] in one deterministic pass.
//!
//! Content and redirect entries are sorted by path and written first. The manifest and
//! the metadata entries follow in a fixed order, so the manifest is only written once
//! every entry it lists is in the container.

pub mod container;

pub use container::ZipContainer;

use crate::assets::{StoredAsset, MISSING_ASSET_PATH, MISSING_ASSET_SVG};
use crate::model::{LibraryManifest, Page, PageContent, PageContentPayload};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Manifest entry read by the preview application.
pub const MANIFEST_PATH: &str = "content/shared.json";
/// Library logo entry.
pub const LOGO_PATH: &str = "content/logo.png";
/// Site stylesheets: the screen and print sheets and the home page's inline styles.
pub const SCREEN_CSS_PATH: &str = "content/screen.css";
pub const PRINT_CSS_PATH: &str = "content/print.css";
pub const INLINE_CSS_PATH: &str = "content/inline.css";

/// Archive path of a page's content payload.
pub fn page_entry_path(id: &str) -> String {
    format!("content/page_content_{}.json", id)
}

/// Errors from the assembler and container sinks.
///
/// Maps to CLI exit code 3.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Cannot write archive: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive container: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entry {path} was added twice.")]
    DuplicateEntry { path: String },

    #[error("Archive is already finalized; cannot add {path}.")]
    Finalized { path: String },

    #[error("Manifest lists page {page}, which has no content entry.")]
    ManifestMismatch { page: String },

    #[error("Page {page} has content but is missing from the manifest.")]
    UnlistedPage { page: String },
}

/// Payload of an archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    Content { mime_type: String, data: Vec<u8> },
    Redirect { target: String },
    Metadata { value: String },
}

/// The unit written to a sink. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub title: String,
    pub body: EntryBody,
}

impl ArchiveEntry {
    pub fn content(path: impl Into<String>, title: impl Into<String>, mime_type: &str, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            title: title.into(),
            body: EntryBody::Content {
                mime_type: mime_type.to_string(),
                data,
            },
        }
    }

    pub fn redirect(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            title: String::new(),
            body: EntryBody::Redirect {
                target: target.into(),
            },
        }
    }

    pub fn metadata(name: &str, value: impl Into<String>) -> Self {
        Self {
            path: format!("M/{}", name),
            title: String::new(),
            body: EntryBody::Metadata {
                value: value.into(),
            },
        }
    }
}

/// Append-only archive writer. Entries are written in call order; `finalize` seals it.
pub trait ArchiveSink {
    fn add_entry(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError>;

    /// Seal the archive. No entry may be added afterwards.
    fn finalize(&mut self) -> Result<(), ArchiveError>;
}

/// Sink that keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Vec<ArchiveEntry>,
    paths: HashSet<String>,
    finalized: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

impl ArchiveSink for MemorySink {
    fn add_entry(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError> {
        if self.finalized {
            return Err(ArchiveError::Finalized { path: entry.path });
        }
        if !self.paths.insert(entry.path.clone()) {
            return Err(ArchiveError::DuplicateEntry { path: entry.path });
        }
        self.entries.push(entry);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ArchiveError> {
        self.finalized = true;
        Ok(())
    }
}

/// Archive-level metadata, written as `M/*` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub name: String,
    pub title: String,
    pub creator: String,
    pub publisher: String,
    pub description: String,
    pub long_description: Option<String>,
    pub language: String,
    pub tags: Vec<String>,
    pub scraper: String,
    /// Only written when set; a wall-clock date would make builds differ.
    pub date: Option<String>,
}

impl ArchiveMetadata {
    fn entries(&self) -> Vec<ArchiveEntry> {
        let mut out = vec![
            ArchiveEntry::metadata("Name", &self.name),
            ArchiveEntry::metadata("Title", &self.title),
            ArchiveEntry::metadata("Creator", &self.creator),
            ArchiveEntry::metadata("Publisher", &self.publisher),
            ArchiveEntry::metadata("Description", &self.description),
        ];
        if let Some(long) = &self.long_description {
            out.push(ArchiveEntry::metadata("LongDescription", long));
        }
        out.push(ArchiveEntry::metadata("Language", &self.language));
        out.push(ArchiveEntry::metadata("Tags", self.tags.join(";")));
        out.push(ArchiveEntry::metadata("Scraper", &self.scraper));
        if let Some(date) = &self.date {
            out.push(ArchiveEntry::metadata("Date", date));
        }
        out
    }
}

/// Library logo bytes and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logo {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// A rewritten stylesheet and its archive path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stylesheet {
    pub path: String,
    pub css: String,
}

/// Everything that goes into one archive.
#[derive(Debug, Clone, Default)]
pub struct AssemblyInput {
    /// Completed pages with their final content, in any order.
    pub pages: Vec<(Page, PageContent)>,
    pub assets: Vec<StoredAsset>,
    pub manifest: Option<LibraryManifest>,
    pub logo: Option<Logo>,
    pub stylesheets: Vec<Stylesheet>,
    /// Write [MISSING_ASSET_PATH]; set when at least one asset failed.
    pub missing_asset_placeholder: bool,
    /// Paths redirecting to the root page.
    pub root_aliases: Vec<String>,
    /// Path redirecting to the logo.
    pub favicon_alias: Option<String>,
    pub metadata: ArchiveMetadata,
}

/// Counts of what was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub pages: usize,
    pub assets: usize,
    pub redirects: usize,
    pub entries: usize,
}

/// Write `input` to `sink` and finalize it.
///
/// Fails before writing anything if the manifest and the page set disagree.
pub fn assemble(sink: &mut dyn ArchiveSink, input: AssemblyInput) -> Result<AssemblyReport, ArchiveError> {
    let AssemblyInput {
        pages,
        assets,
        manifest,
        logo,
        stylesheets,
        missing_asset_placeholder,
        root_aliases,
        favicon_alias,
        metadata,
    } = input;

    let page_ids: HashSet<&str> = pages.iter().map(|(p, _)| p.id.as_str()).collect();
    if let Some(manifest) = &manifest {
        let listed: HashSet<&str> = manifest.pages.iter().map(|p| p.id.as_str()).collect();
        if let Some(missing) = manifest.pages.iter().find(|p| !page_ids.contains(p.id.as_str())) {
            return Err(ArchiveError::ManifestMismatch {
                page: missing.id.clone(),
            });
        }
        if let Some((page, _)) = pages.iter().find(|(p, _)| !listed.contains(p.id.as_str())) {
            return Err(ArchiveError::UnlistedPage {
                page: page.id.clone(),
            });
        }
    }

    let mut report = AssemblyReport::default();
    let mut entries = Vec::with_capacity(pages.len() + assets.len() + root_aliases.len() + 3);
    let mut root_target = None;
    for (page, content) in &pages {
        let data = serde_json::to_vec(&PageContentPayload {
            html_body: content.html_body.clone(),
        })
        .map_err(|source| ArchiveError::Serialize {
            what: format!("page {}", page.id),
            source,
        })?;
        let path = page_entry_path(&page.id);
        if page.parent.is_none() {
            root_target = Some(path.clone());
        }
        entries.push(ArchiveEntry::content(path, &page.title, "application/json", data));
        report.pages += 1;
    }
    for asset in assets {
        entries.push(ArchiveEntry::content(
            asset.path,
            String::new(),
            &asset.content_type,
            asset.bytes,
        ));
        report.assets += 1;
    }
    for sheet in stylesheets {
        entries.push(ArchiveEntry::content(sheet.path, "", "text/css", sheet.css.into_bytes()));
    }
    if missing_asset_placeholder {
        entries.push(ArchiveEntry::content(
            MISSING_ASSET_PATH,
            "",
            "image/svg+xml",
            MISSING_ASSET_SVG.as_bytes().to_vec(),
        ));
    }
    if let Some(logo) = logo {
        entries.push(ArchiveEntry::content(LOGO_PATH, "", &logo.mime_type, logo.data));
        if let Some(alias) = favicon_alias.filter(|a| !a.is_empty()) {
            entries.push(ArchiveEntry::redirect(alias, LOGO_PATH));
            report.redirects += 1;
        }
    }
    if let Some(target) = &root_target {
        for alias in root_aliases.into_iter().filter(|a| !a.is_empty()) {
            entries.push(ArchiveEntry::redirect(alias, target.clone()));
            report.redirects += 1;
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    if let Some(pair) = entries.windows(2).find(|w| w[0].path == w[1].path) {
        return Err(ArchiveError::DuplicateEntry {
            path: pair[0].path.clone(),
        });
    }
    for entry in entries {
        debug!(path = %entry.path, "writing entry");
        sink.add_entry(entry)?;
        report.entries += 1;
    }

    if let Some(manifest) = &manifest {
        let data = serde_json::to_vec(manifest).map_err(|source| ArchiveError::Serialize {
            what: "manifest".to_string(),
            source,
        })?;
        sink.add_entry(ArchiveEntry::content(MANIFEST_PATH, "", "application/json", data))?;
        report.entries += 1;
    }
    for entry in metadata.entries() {
        sink.add_entry(entry)?;
        report.entries += 1;
    }
    sink.finalize()?;
    info!(
        pages = report.pages,
        assets = report.assets,
        redirects = report.redirects,
        entries = report.entries,
        "archive finalized"
    );
    Ok(report)
}
