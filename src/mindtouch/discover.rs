//! Library Discoverer: resolve a root page and walk its subpage listings into a [PageTree].
//!
//! The walk is breadth-first, one tree level at a time. Listings of one level run
//! concurrently but are consumed in level order, so sibling order and the resulting
//! tree never depend on network timing.

use crate::mindtouch::error::{DiscoveryError, FetchError};
use crate::mindtouch::Library;
use crate::model::{Page, PageId, PageTree, TreeError};
use futures_util::stream::{self, StreamExt};
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// Tuning and callbacks for [discover].
pub struct DiscoveryOptions<'a> {
    /// Entries requested per listing call.
    pub page_size: u32,
    /// Listings fetched concurrently within one tree level.
    pub concurrency: usize,
    /// Called with the number of pages discovered so far after each level.
    pub progress: Option<&'a (dyn Fn(usize) + Sync)>,
}

impl Default for DiscoveryOptions<'_> {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: 4,
            progress: None,
        }
    }
}

/// Result of a discovery: the validated tree and the listings that had to be skipped.
#[derive(Debug)]
pub struct Discovery {
    pub tree: PageTree,
    /// Non-fatal listing failures; the subtrees below these pages are missing.
    pub skipped: Vec<DiscoveryError>,
}

/// API scalars come back either as JSON strings or numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(u64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Number(n) => n.to_string(),
        }
    }

    fn as_u64(&self) -> Option<u64> {
        match self {
            Scalar::Text(s) => s.trim().parse().ok(),
            Scalar::Number(n) => Some(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PathField {
    Plain(String),
    Node {
        #[serde(rename = "#text", default)]
        text: String,
    },
}

impl PathField {
    fn archive_path(&self) -> String {
        let raw = match self {
            PathField::Plain(s) => s,
            PathField::Node { text } => text,
        };
        raw.trim().trim_matches('/').to_string()
    }
}

/// `page.subpage` is one object, an array, or an empty string when there are none.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
    Empty(NoEntries),
}

/// The blank string sent in place of an empty listing.
#[derive(Debug)]
struct NoEntries;

impl<'de> Deserialize<'de> for NoEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            Ok(NoEntries)
        } else {
            Err(de::Error::invalid_value(Unexpected::Str(&s), &"an empty string"))
        }
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
            OneOrMany::Empty(NoEntries) => Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "@id")]
    id: Scalar,
    #[serde(default)]
    title: String,
    path: Option<PathField>,
}

#[derive(Debug, Deserialize)]
struct ParentRef {
    #[serde(rename = "@id")]
    id: Scalar,
}

#[derive(Debug, Deserialize)]
struct SubpageEntry {
    #[serde(rename = "@id")]
    id: Scalar,
    #[serde(default)]
    title: String,
    path: Option<PathField>,
    #[serde(rename = "page.parent")]
    parent: Option<ParentRef>,
}

#[derive(Debug, Deserialize)]
struct SubpageListing {
    #[serde(rename = "@totalcount")]
    total_count: Option<Scalar>,
    #[serde(rename = "page.subpage")]
    subpages: Option<OneOrMany<SubpageEntry>>,
}

/// One child as listed by the source, with the parent it claims.
#[derive(Debug)]
struct ListedChild {
    id: PageId,
    title: String,
    path: String,
    claimed_parent: Option<PageId>,
}

/// Resolve `root` (an id or the alias `home`) and return the complete tree below it.
///
/// Fails when the root cannot be resolved or listed, or when the source describes
/// something other than a single rooted tree. A failed listing below the root is
/// recorded in [Discovery::skipped] and the walk continues.
#[instrument(skip(library, options), fields(library = library.library_url()))]
pub async fn discover(
    library: &Library,
    root: &str,
    options: &DiscoveryOptions<'_>,
) -> Result<Discovery, DiscoveryError> {
    let info: PageInfo = library
        .api_json(&format!("/pages/{}", root), &[])
        .await
        .map_err(|source| DiscoveryError::RootUnresolved {
            root: root.to_string(),
            source,
        })?;
    let root_id = info.id.into_string();
    debug!(requested = root, %root_id, "root resolved");

    let mut records = vec![Page {
        id: root_id.clone(),
        path: info.path.map(|p| p.archive_path()).unwrap_or_default(),
        title: info.title,
        parent: None,
        ordinal: 0,
    }];
    // id -> parent as claimed by the source, for cycle detection on re-seen ids.
    let mut parents: HashMap<PageId, Option<PageId>> = HashMap::new();
    parents.insert(root_id.clone(), None);
    // Next ordinal per parent, counted against the parent a child claims.
    let mut next_ordinal: HashMap<PageId, u32> = HashMap::new();
    let mut skipped = Vec::new();
    let mut level = vec![root_id.clone()];
    let concurrency = options.concurrency.max(1);

    while !level.is_empty() {
        let listings: Vec<(PageId, Result<Vec<ListedChild>, FetchError>)> =
            stream::iter(level.drain(..))
                .map(|parent| async move {
                    let children = list_children(library, &parent, options.page_size).await;
                    (parent, children)
                })
                .buffered(concurrency)
                .collect()
                .await;

        let mut next = Vec::new();
        for (parent, listing) in listings {
            let children = match listing {
                Ok(children) => children,
                Err(source) if parent == root_id => {
                    return Err(DiscoveryError::RootUnresolved { root: parent, source })
                }
                Err(source) => {
                    let err = DiscoveryError::Listing { page: parent, source };
                    warn!(error = %err, "skipping subtree");
                    skipped.push(err);
                    continue;
                }
            };
            for child in children {
                if parents.contains_key(&child.id) {
                    let err = if is_ancestor(&parents, &child.id, &parent) {
                        TreeError::Cycle { page: child.id }
                    } else {
                        TreeError::DuplicatePage { page: child.id }
                    };
                    return Err(err.into());
                }
                let claimed = child.claimed_parent.unwrap_or_else(|| parent.clone());
                parents.insert(child.id.clone(), Some(claimed.clone()));
                let slot = next_ordinal.entry(claimed.clone()).or_insert(0);
                let ordinal = *slot;
                *slot += 1;
                next.push(child.id.clone());
                records.push(Page {
                    id: child.id,
                    path: child.path,
                    title: child.title,
                    parent: Some(claimed),
                    ordinal,
                });
            }
        }
        if let Some(progress) = options.progress {
            progress(records.len());
        }
        level = next;
    }

    let tree = PageTree::from_records(&root_id, records)?;
    info!(pages = tree.len(), skipped = skipped.len(), "discovery complete");
    Ok(Discovery { tree, skipped })
}

/// Whether `candidate` is `page` itself or one of its ancestors by claimed parents.
fn is_ancestor(parents: &HashMap<PageId, Option<PageId>>, candidate: &str, page: &str) -> bool {
    let mut current = Some(page.to_string());
    let mut steps = 0;
    while let Some(id) = current {
        if id == candidate {
            return true;
        }
        steps += 1;
        if steps > parents.len() {
            return false;
        }
        current = parents.get(&id).cloned().flatten();
    }
    false
}

/// Request every listing page of `parent`'s subpages, following offsets to the total count.
async fn list_children(
    library: &Library,
    parent: &str,
    page_size: u32,
) -> Result<Vec<ListedChild>, FetchError> {
    let page_size = page_size.max(1);
    let sub_path = format!("/pages/{}/subpages", parent);
    let mut children = Vec::new();
    let mut offset: u64 = 0;
    loop {
        let listing: SubpageListing = library
            .api_json(
                &sub_path,
                &[
                    ("limit", page_size.to_string()),
                    ("offset", offset.to_string()),
                ],
            )
            .await?;
        let total = listing.total_count.as_ref().and_then(Scalar::as_u64);
        let entries = listing
            .subpages
            .map(OneOrMany::into_vec)
            .unwrap_or_default();
        if entries.is_empty() {
            break;
        }
        let returned = entries.len() as u64;
        children.extend(entries.into_iter().map(|e| ListedChild {
            id: e.id.into_string(),
            title: e.title,
            path: e.path.map(|p| p.archive_path()).unwrap_or_default(),
            claimed_parent: e.parent.map(|p| p.id.into_string()),
        }));
        offset += returned;
        match total {
            Some(total) if offset >= total => break,
            None if returned < u64::from(page_size) => break,
            _ => {}
        }
    }
    debug!(parent, children = children.len(), "listed");
    Ok(children)
}
