//! Optional page selection applied to the discovered tree before fetching.

use crate::model::{Page, PageTree};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

/// Selects pages by title and id. A page is selected when it matches every given
/// criterion; selected pages pull in their ancestors so navigation stays intact.
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    title_include: Option<Regex>,
    id_include: Option<HashSet<String>>,
    title_exclude: Option<Regex>,
}

impl ContentFilter {
    /// Title patterns are case-insensitive regexes searched anywhere in the title.
    pub fn new(
        title_include: Option<&str>,
        id_include: Option<&[String]>,
        title_exclude: Option<&str>,
    ) -> Result<Self, regex::Error> {
        let compile = |pattern: &str| RegexBuilder::new(pattern).case_insensitive(true).build();
        Ok(Self {
            title_include: title_include.map(compile).transpose()?,
            id_include: id_include
                .map(|ids| {
                    ids.iter()
                        .map(|id| id.trim().to_string())
                        .filter(|id| !id.is_empty())
                        .collect::<HashSet<_>>()
                })
                .filter(|ids| !ids.is_empty()),
            title_exclude: title_exclude.map(compile).transpose()?,
        })
    }

    /// True when the filter selects everything.
    pub fn is_noop(&self) -> bool {
        self.title_include.is_none() && self.id_include.is_none() && self.title_exclude.is_none()
    }

    fn matches(&self, page: &Page) -> bool {
        self.title_include
            .as_ref()
            .map_or(true, |re| re.is_match(&page.title))
            && self
                .id_include
                .as_ref()
                .map_or(true, |ids| ids.contains(&page.id))
            && self
                .title_exclude
                .as_ref()
                .map_or(true, |re| !re.is_match(&page.title))
    }

    /// Selected pages in tree order. The root is always first.
    pub fn select<'t>(&self, tree: &'t PageTree) -> Vec<&'t Page> {
        if self.is_noop() {
            return tree.pages().iter().collect();
        }
        let mut keep: HashSet<&str> = HashSet::new();
        keep.insert(tree.root_id());
        for page in tree.pages().iter().filter(|p| self.matches(p)) {
            for ancestor in tree.self_and_ancestors(&page.id) {
                keep.insert(ancestor.id.as_str());
            }
        }
        tree.pages()
            .iter()
            .filter(|p| keep.contains(p.id.as_str()))
            .collect()
    }
}
