//! Deterministic container file.
//!
//! Entries are packed into a zip layout with fixed timestamps and permissions; already
//! compressed media is stored, text is deflated. Redirects and entry types go into a
//! trailing `_index.json`. The file is written next to its target under a temporary
//! name and only renamed into place by [ZipContainer::finalize], so an unfinished or
//! aborted build never replaces an existing archive.

use crate::archive::{ArchiveEntry, ArchiveError, ArchiveSink, EntryBody};
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Name of the entry listing every archive entry with its type.
pub const INDEX_ENTRY: &str = "_index.json";

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum IndexEntry {
    Content {
        path: String,
        title: String,
        mime: String,
    },
    Redirect {
        path: String,
        target: String,
    },
    Metadata {
        path: String,
    },
}

/// [ArchiveSink] writing a zip-layout container file.
pub struct ZipContainer {
    target: PathBuf,
    zip: Option<ZipWriter<NamedTempFile>>,
    index: Vec<IndexEntry>,
    paths: HashSet<String>,
}

impl ZipContainer {
    /// Start a container that will be published at `target` on finalize.
    pub fn create(target: &Path) -> Result<Self, ArchiveError> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|source| ArchiveError::Io {
            path: dir.clone(),
            source,
        })?;
        let temp = tempfile::Builder::new()
            .prefix(".mindtouch-zim-")
            .suffix(".part")
            .tempfile_in(&dir)
            .map_err(|source| ArchiveError::Io {
                path: dir.clone(),
                source,
            })?;
        debug!(target = %target.display(), temp = %temp.path().display(), "container started");
        Ok(Self {
            target: target.to_path_buf(),
            zip: Some(ZipWriter::new(temp)),
            index: Vec::new(),
            paths: HashSet::new(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn options(mime_type: &str) -> SimpleFileOptions {
        let method = if is_compressible(mime_type) {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        SimpleFileOptions::default()
            .compression_method(method)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644)
    }

    fn write_file(&mut self, path: &str, mime_type: &str, data: &[u8]) -> Result<(), ArchiveError> {
        let zip = self.zip.as_mut().ok_or_else(|| ArchiveError::Finalized {
            path: path.to_string(),
        })?;
        zip.start_file(path, Self::options(mime_type))?;
        zip.write_all(data).map_err(|source| ArchiveError::Io {
            path: PathBuf::from(path),
            source,
        })?;
        Ok(())
    }
}

fn is_compressible(mime_type: &str) -> bool {
    mime_type.starts_with("text/")
        || mime_type == "application/json"
        || mime_type == "image/svg+xml"
        || mime_type.ends_with("+xml")
}

impl ArchiveSink for ZipContainer {
    fn add_entry(&mut self, entry: ArchiveEntry) -> Result<(), ArchiveError> {
        if self.zip.is_none() {
            return Err(ArchiveError::Finalized { path: entry.path });
        }
        if entry.path == INDEX_ENTRY || !self.paths.insert(entry.path.clone()) {
            return Err(ArchiveError::DuplicateEntry { path: entry.path });
        }
        match entry.body {
            EntryBody::Content { mime_type, data } => {
                self.write_file(&entry.path, &mime_type, &data)?;
                self.index.push(IndexEntry::Content {
                    path: entry.path,
                    title: entry.title,
                    mime: mime_type,
                });
            }
            EntryBody::Metadata { value } => {
                self.write_file(&entry.path, "text/plain", value.as_bytes())?;
                self.index.push(IndexEntry::Metadata { path: entry.path });
            }
            EntryBody::Redirect { target } => {
                self.index.push(IndexEntry::Redirect {
                    path: entry.path,
                    target,
                });
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ArchiveError> {
        let index = serde_json::to_vec(&self.index).map_err(|source| ArchiveError::Serialize {
            what: "entry index".to_string(),
            source,
        })?;
        self.write_file(INDEX_ENTRY, "application/json", &index)?;
        let zip = self.zip.take().ok_or_else(|| ArchiveError::Finalized {
            path: INDEX_ENTRY.to_string(),
        })?;
        let temp = zip.finish()?;
        temp.as_file().sync_all().map_err(|source| ArchiveError::Io {
            path: temp.path().to_path_buf(),
            source,
        })?;
        temp.persist(&self.target).map_err(|e| ArchiveError::Io {
            path: self.target.clone(),
            source: e.error,
        })?;
        debug!(target = %self.target.display(), entries = self.index.len(), "container published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn build(target: &Path) -> Result<(), ArchiveError> {
        let mut c = ZipContainer::create(target)?;
        c.add_entry(ArchiveEntry::content("content/a.json", "A", "application/json", b"{}".to_vec()))?;
        c.add_entry(ArchiveEntry::content("content/assets/x.png", "", "image/png", vec![0, 1, 2]))?;
        c.add_entry(ArchiveEntry::redirect("index", "content/a.json"))?;
        c.add_entry(ArchiveEntry::metadata("Name", "geo"))?;
        c.finalize()
    }

    #[test]
    fn finalize_publishes_readable_archive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("geo.zim");
        build(&target)?;
        let mut archive = zip::ZipArchive::new(std::fs::File::open(&target)?)?;
        let mut name = String::new();
        archive.by_name("M/Name")?.read_to_string(&mut name)?;
        assert_eq!(name, "geo");
        let mut index = String::new();
        archive.by_name(INDEX_ENTRY)?.read_to_string(&mut index)?;
        let index: serde_json::Value = serde_json::from_str(&index)?;
        assert_eq!(index[2]["kind"], "redirect");
        assert_eq!(index[2]["target"], "content/a.json");
        // Only the published file remains; no temporary leftovers.
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn output_is_byte_identical_across_builds() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a.zim");
        let b = dir.path().join("b.zim");
        build(&a)?;
        build(&b)?;
        assert_eq!(std::fs::read(&a)?, std::fs::read(&b)?);
        Ok(())
    }

    #[test]
    fn dropped_container_leaves_no_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("geo.zim");
        {
            let mut c = ZipContainer::create(&target)?;
            c.add_entry(ArchiveEntry::metadata("Name", "geo"))?;
        }
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
