//! Canonical data model for an archived library.
//!
//! The discoverer produces a [PageTree], the rewriter turns each page into a
//! [PageContent] plus [AssetReference]s, and the assembler consumes all of them
//! together with the [LibraryManifest].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

/// Page identifier as returned by the remote API (opaque, unique within a library).
pub type PageId = String;

/// One page of the library tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: PageId,
    /// Archive-relative path, derived from the source path (no leading slash).
    pub path: String,
    pub title: String,
    /// `None` only for the root.
    pub parent: Option<PageId>,
    /// Position among siblings, as returned by the source (0-based).
    pub ordinal: u32,
}

/// Structural problems found while materializing the page tree. All are fatal for discovery.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("Root page {root} is not part of the discovered pages.")]
    MissingRoot { root: PageId },

    #[error("Page {page} claims parent {parent}, which is not in the tree.")]
    OrphanPage { page: PageId, parent: PageId },

    #[error("Page {page} is part of a parent cycle.")]
    Cycle { page: PageId },

    #[error("Page {page} has no parent but is not the root.")]
    ExtraRoot { page: PageId },

    #[error("Page {page} appears more than once in the tree.")]
    DuplicatePage { page: PageId },
}

/// A validated, rooted page tree. Pages are kept in pre-order (root first, siblings in source order).
#[derive(Debug, Clone)]
pub struct PageTree {
    root: PageId,
    pages: Vec<Page>,
    index: HashMap<PageId, usize>,
    children: HashMap<PageId, Vec<PageId>>,
}

impl PageTree {
    /// Build a tree from flat records and check its integrity before any further I/O.
    ///
    /// Rejects duplicate ids, pages whose parent is unknown, parent cycles and
    /// parentless pages other than the root. The root's own parent claim is ignored.
    pub fn from_records(root: &str, records: Vec<Page>) -> Result<Self, TreeError> {
        let mut by_id: HashMap<PageId, Page> = HashMap::with_capacity(records.len());
        let mut arrival: Vec<PageId> = Vec::with_capacity(records.len());
        for mut page in records {
            if page.id == root {
                page.parent = None;
            }
            if by_id.contains_key(&page.id) {
                return Err(TreeError::DuplicatePage { page: page.id });
            }
            arrival.push(page.id.clone());
            by_id.insert(page.id.clone(), page);
        }
        if !by_id.contains_key(root) {
            return Err(TreeError::MissingRoot {
                root: root.to_string(),
            });
        }

        // Every page must reach the root by following parents, without revisiting a page.
        let mut reaches_root: HashSet<&str> = HashSet::new();
        reaches_root.insert(root);
        for id in &arrival {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut chain: Vec<&str> = Vec::new();
            let mut current = id.as_str();
            while !reaches_root.contains(current) {
                if !seen.insert(current) {
                    return Err(TreeError::Cycle {
                        page: current.to_string(),
                    });
                }
                chain.push(current);
                let page = &by_id[current];
                match page.parent.as_deref() {
                    None => {
                        return Err(TreeError::ExtraRoot {
                            page: page.id.clone(),
                        })
                    }
                    Some(parent) if !by_id.contains_key(parent) => {
                        return Err(TreeError::OrphanPage {
                            page: page.id.clone(),
                            parent: parent.to_string(),
                        })
                    }
                    Some(parent) => current = parent,
                }
            }
            reaches_root.extend(chain);
        }

        let mut children: HashMap<PageId, Vec<PageId>> = HashMap::new();
        for id in &arrival {
            if let Some(parent) = by_id[id].parent.clone() {
                children.entry(parent).or_default().push(id.clone());
            }
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| {
                by_id[a]
                    .ordinal
                    .cmp(&by_id[b].ordinal)
                    .then_with(|| a.cmp(b))
            });
        }

        let mut pages = Vec::with_capacity(by_id.len());
        let mut stack = vec![root.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(kids) = children.get(&id) {
                stack.extend(kids.iter().rev().cloned());
            }
            if let Some(page) = by_id.remove(&id) {
                pages.push(page);
            }
        }
        let index = pages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();

        Ok(Self {
            root: root.to_string(),
            pages,
            index,
            children,
        })
    }

    pub fn root(&self) -> &Page {
        &self.pages[0]
    }

    pub fn root_id(&self) -> &str {
        &self.root
    }

    /// All pages in manifest order.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Page> {
        self.index.get(id).map(|&i| &self.pages[i])
    }

    /// Position of a page in manifest order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn children(&self, id: &str) -> &[PageId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The page itself followed by its ancestors up to the root.
    pub fn self_and_ancestors(&self, id: &str) -> Vec<&Page> {
        let mut out = Vec::new();
        let mut current = self.get(id);
        while let Some(page) = current {
            out.push(page);
            current = page.parent.as_deref().and_then(|p| self.get(p));
        }
        out
    }
}

/// Normalized markup of one page. Produced once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub page_id: PageId,
    pub html_body: String,
}

/// A binary referenced by a page or a site stylesheet, as discovered during rewriting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetReference {
    /// Absolute source URL.
    pub url: String,
    /// Referencing page, or the archive path of the referencing stylesheet.
    pub page_id: PageId,
}

/// One entry of the manifest page list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    pub id: PageId,
    pub path: String,
    pub title: String,
}

/// Manifest consumed by the preview application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryManifest {
    pub logo_path: String,
    pub root_page_path: String,
    pub library_online_url: String,
    pub pages: Vec<PageEntry>,
}

/// Per-page payload loaded on demand by the preview application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContentPayload {
    pub html_body: String,
}

/// Collects manifest entries as pages complete, in any order; [ManifestBuilder::build]
/// returns them in manifest (tree) order.
#[derive(Debug)]
pub struct ManifestBuilder {
    logo_path: String,
    root_page_path: String,
    library_online_url: String,
    entries: BTreeMap<usize, PageEntry>,
}

impl ManifestBuilder {
    pub fn new(logo_path: &str, root_page_path: &str, library_online_url: &str) -> Self {
        Self {
            logo_path: logo_path.to_string(),
            root_page_path: root_page_path.to_string(),
            library_online_url: library_online_url.to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Record a completed page at its manifest position.
    pub fn add(&mut self, position: usize, page: &Page) {
        self.entries.insert(
            position,
            PageEntry {
                id: page.id.clone(),
                path: page.path.clone(),
                title: page.title.clone(),
            },
        );
    }

    pub fn build(self) -> LibraryManifest {
        LibraryManifest {
            logo_path: self.logo_path,
            root_page_path: self.root_page_path,
            library_online_url: self.library_online_url,
            pages: self.entries.into_values().collect(),
        }
    }
}
