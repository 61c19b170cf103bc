//! Owned node tree the rewrite rules operate on, plus conversion from a parsed
//! fragment and serialization back to markup.

use scraper::node::Node;
use scraper::ElementRef;
use std::fmt::Write;

/// The three node kinds page bodies are reduced to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteNode {
    Element {
        name: String,
        /// Sorted by attribute name.
        attrs: Vec<(String, String)>,
        children: Vec<RewriteNode>,
    },
    Text(String),
    Comment(String),
}

impl RewriteNode {
    pub fn element(name: &str, mut attrs: Vec<(String, String)>, children: Vec<RewriteNode>) -> Self {
        attrs.sort();
        RewriteNode::Element {
            name: name.to_string(),
            attrs,
            children,
        }
    }
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Convert the children of `parent`, dropping every element for which `keep` is false
/// together with its subtree. Doctypes and processing instructions are dropped.
pub fn convert_children(
    parent: ElementRef<'_>,
    keep: &dyn Fn(&ElementRef<'_>) -> bool,
) -> Vec<RewriteNode> {
    let mut out = Vec::new();
    for child in parent.children() {
        match child.value() {
            Node::Text(text) => out.push(RewriteNode::Text(String::from(&**text))),
            Node::Comment(comment) => out.push(RewriteNode::Comment(String::from(&**comment))),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    if keep(&el) {
                        let attrs = el
                            .value()
                            .attrs()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect();
                        let children = convert_children(el, keep);
                        out.push(RewriteNode::element(el.value().name(), attrs, children));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Serialize nodes back to HTML. Output only depends on the nodes.
pub fn serialize(nodes: &[RewriteNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(&mut out, node, false);
    }
    out
}

fn write_node(out: &mut String, node: &RewriteNode, raw_text: bool) {
    match node {
        RewriteNode::Text(text) if raw_text => out.push_str(text),
        RewriteNode::Text(text) => escape_into(out, text, false),
        RewriteNode::Comment(text) => {
            let _ = write!(out, "<!--{}-->", text);
        }
        RewriteNode::Element {
            name,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(name);
            for (k, v) in attrs {
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                escape_into(out, v, true);
                out.push('"');
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&name.as_str()) {
                return;
            }
            let raw = RAW_TEXT_ELEMENTS.contains(&name.as_str());
            for child in children {
                write_node(out, child, raw);
            }
            let _ = write!(out, "</{}>", name);
        }
    }
}

fn escape_into(out: &mut String, s: &str, attribute: bool) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    fn parse(markup: &str) -> Vec<RewriteNode> {
        let fragment = Html::parse_fragment(markup);
        convert_children(fragment.root_element(), &|_| true)
    }

    #[test]
    fn attributes_are_sorted_and_escaped() {
        let nodes = parse(r#"<p title="a &quot;b&quot;" class="x">1 &lt; 2 &amp; 3</p>"#);
        assert_eq!(
            serialize(&nodes),
            r#"<p class="x" title="a &quot;b&quot;">1 &lt; 2 &amp; 3</p>"#
        );
    }

    #[test]
    fn void_and_raw_text_elements() {
        let nodes = parse("<p>a<br>b<img src=\"x.png\"></p><style>p > a { color: red }</style>");
        assert_eq!(
            serialize(&nodes),
            "<p>a<br>b<img src=\"x.png\"></p><style>p > a { color: red }</style>"
        );
    }

    #[test]
    fn filtered_elements_drop_their_subtree() {
        let fragment = Html::parse_fragment("<nav><a href=\"/\">home</a></nav><p>kept</p>");
        let nodes = convert_children(fragment.root_element(), &|el| el.value().name() != "nav");
        assert_eq!(serialize(&nodes), "<p>kept</p>");
    }

    #[test]
    fn serialization_is_stable_under_reparse() {
        let once = serialize(&parse("<ul><li>one<li>two</ul><p>x&nbsp;y"));
        let twice = serialize(&parse(&once));
        assert_eq!(once, twice);
    }
}
