//! Content Rewriter: turns raw page markup into archive-ready markup and the list of
//! assets it references.
//!
//! Markup is parsed leniently, reduced to an owned [RewriteNode] tree with source chrome
//! removed, and rewritten by small pure rules. Asset references, including `url()` in
//! `<style>` blocks and `style` attributes, become placeholder paths (see
//! [placeholder_for]) until the asset pipeline has assigned final paths; the coordinator
//! then substitutes them on the tree with [substitute_placeholders].

pub mod css;
pub mod node;
pub mod urls;

pub use node::{serialize, RewriteNode};
pub use urls::{placeholder_for, KnownPages, PENDING_PREFIX};

use crate::model::{AssetReference, Page, PageContent, PageId};
use reqwest::Url;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use urls::Target;

/// Elements removed with their subtree: site navigation, banners, edit controls and scripts.
const CHROME_SELECTOR: &str = "nav, header, footer, script, noscript, form, button, link, meta, \
     .mt-edit-section, .mt-section-edit, .mt-page-edit, .mt-quick-edit, .mt-dialog, \
     .mt-content-footer, .mt-author-container, #mt-tags, .elm-social-share";

/// Elements whose `src` is an embedded asset.
const ASSET_SRC_ELEMENTS: &[&str] = &["img", "video", "audio", "source", "track", "embed"];

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("Invalid library URL {url}: {reason}")]
    LibraryUrl { url: String, reason: String },
}

/// Non-fatal findings while rewriting one page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteWarning {
    /// Markup needed repair; the repaired form was used.
    #[error("Page {page_id}: malformed markup repaired ({count} parse error(s), first: {first})")]
    MalformedContent {
        page_id: PageId,
        count: usize,
        first: String,
    },
}

/// Everything the rewriter produces for one page.
#[derive(Debug, Clone)]
pub struct RewriteOutput {
    pub content: PageContent,
    /// Rewritten tree `content` was serialized from, still holding placeholders.
    pub nodes: Vec<RewriteNode>,
    /// Distinct asset URLs in document order.
    pub assets: Vec<AssetReference>,
    pub warnings: Vec<RewriteWarning>,
}

/// Stateless page rewriter for one library. Shared by all page workers.
#[derive(Debug)]
pub struct Rewriter {
    chrome: Selector,
    known: KnownPages,
}

/// Inputs every rule may look at.
struct RuleContext<'a> {
    page_url: Url,
    known: &'a KnownPages,
}

/// New attribute list of an element, plus the asset URLs the rule found.
struct ElementRewrite {
    attrs: Vec<(String, String)>,
    assets: Vec<String>,
}

impl Rewriter {
    pub fn new(known: KnownPages) -> Result<Self, RewriteError> {
        let chrome = Selector::parse(CHROME_SELECTOR).map_err(|e| RewriteError::Selector {
            selector: CHROME_SELECTOR.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { chrome, known })
    }

    /// Rewrite the markup of `page`. Same input, same output.
    pub fn rewrite(&self, page: &Page, markup: &str) -> RewriteOutput {
        let fragment = Html::parse_fragment(markup);
        let mut warnings = Vec::new();
        if let Some(first) = fragment.errors.first() {
            warnings.push(RewriteWarning::MalformedContent {
                page_id: page.id.clone(),
                count: fragment.errors.len(),
                first: first.to_string(),
            });
        }
        let nodes = node::convert_children(fragment.root_element(), &|el| {
            !self.chrome.matches(el)
        });

        let ctx = RuleContext {
            page_url: self.known.page_url(&page.path),
            known: &self.known,
        };
        let mut found = Vec::new();
        let nodes = rewrite_nodes(nodes, &ctx, &mut found);

        let mut seen = HashSet::new();
        let assets = found
            .into_iter()
            .filter(|url| seen.insert(url.clone()))
            .map(|url| AssetReference {
                url,
                page_id: page.id.clone(),
            })
            .collect();
        RewriteOutput {
            content: PageContent {
                page_id: page.id.clone(),
                html_body: node::serialize(&nodes),
            },
            nodes,
            assets,
            warnings,
        }
    }
}

fn rewrite_nodes(
    nodes: Vec<RewriteNode>,
    ctx: &RuleContext<'_>,
    found: &mut Vec<String>,
) -> Vec<RewriteNode> {
    nodes
        .into_iter()
        .filter_map(|node| match node {
            RewriteNode::Comment(_) => None,
            RewriteNode::Text(_) => Some(node),
            RewriteNode::Element {
                name,
                attrs,
                children,
            } => {
                let rewritten = rewrite_element(&name, attrs, ctx);
                found.extend(rewritten.assets);
                let children = if name == "style" {
                    children
                        .into_iter()
                        .map(|child| match child {
                            RewriteNode::Text(text) => {
                                RewriteNode::Text(css::rewrite_urls(&text, &ctx.page_url, found))
                            }
                            other => other,
                        })
                        .collect()
                } else {
                    rewrite_nodes(children, ctx, found)
                };
                Some(RewriteNode::Element {
                    name,
                    attrs: rewritten.attrs,
                    children,
                })
            }
        })
        .collect()
}

fn rewrite_element(name: &str, attrs: Vec<(String, String)>, ctx: &RuleContext<'_>) -> ElementRewrite {
    let mut assets = Vec::new();
    let attrs = attrs
        .into_iter()
        .filter(|(k, _)| k != "srcset" && k != "sizes")
        .map(|(k, v)| {
            let new_value = match (name, k.as_str()) {
                ("a" | "area", "href") => rewrite_link(&v, ctx, &mut assets),
                (tag, "src") if ASSET_SRC_ELEMENTS.contains(&tag) => rewrite_asset(&v, ctx, &mut assets),
                ("video", "poster") => rewrite_asset(&v, ctx, &mut assets),
                (_, "style") => Some(css::rewrite_urls(&v, &ctx.page_url, &mut assets)),
                _ => None,
            };
            (k, new_value.unwrap_or(v))
        })
        .collect();
    ElementRewrite { attrs, assets }
}

/// Known page → `#/{path}`, library file → asset placeholder, anything else → absolute URL.
fn rewrite_link(raw: &str, ctx: &RuleContext<'_>, assets: &mut Vec<String>) -> Option<String> {
    let Target::Absolute(url) = urls::resolve(&ctx.page_url, raw) else {
        return None;
    };
    if let Some(path) = ctx.known.lookup(&url) {
        return Some(format!("#/{}", path));
    }
    if ctx.known.is_download(&url) {
        return rewrite_asset_url(url, assets);
    }
    Some(url.to_string())
}

fn rewrite_asset(raw: &str, ctx: &RuleContext<'_>, assets: &mut Vec<String>) -> Option<String> {
    match urls::resolve(&ctx.page_url, raw) {
        Target::Absolute(url) => rewrite_asset_url(url, assets),
        Target::Untouched => None,
    }
}

fn rewrite_asset_url(mut url: Url, assets: &mut Vec<String>) -> Option<String> {
    url.set_fragment(None);
    let url = url.to_string();
    let placeholder = placeholder_for(&url);
    assets.push(url);
    Some(placeholder)
}

/// Replace asset placeholders in attribute values and inline CSS by their final path,
/// or by `missing` when a placeholder has no entry in `resolved`. Text is left alone.
pub fn substitute_placeholders(
    nodes: &mut [RewriteNode],
    resolved: &HashMap<String, String>,
    missing: &str,
) {
    let resolve = |placeholder: &str| -> String {
        resolved
            .get(placeholder)
            .map_or(missing, String::as_str)
            .to_string()
    };
    substitute_in(nodes, &resolve);
}

fn substitute_in(nodes: &mut [RewriteNode], resolve: &dyn Fn(&str) -> String) {
    for node in nodes {
        let RewriteNode::Element {
            name,
            attrs,
            children,
        } = node
        else {
            continue;
        };
        for (key, value) in attrs.iter_mut() {
            if key == "style" {
                *value = css::substitute(value, resolve);
            } else if value.starts_with(PENDING_PREFIX) {
                *value = resolve(value);
            }
        }
        if name == "style" {
            for child in children.iter_mut() {
                if let RewriteNode::Text(text) = child {
                    *text = css::substitute(text, resolve);
                }
            }
        } else {
            substitute_in(children, resolve);
        }
    }
}
