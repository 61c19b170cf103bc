//! `url(...)` references in stylesheets, `<style>` blocks and `style` attributes.

use crate::rewrite::urls::{self, Target};
use crate::rewrite::PENDING_PREFIX;
use regex::{Captures, Regex};
use reqwest::Url;
use std::sync::LazyLock;

/// `url(x)`, `url('x')` or `url("x")`, case-insensitive.
#[allow(clippy::expect_used)]
static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#)
        .expect("CSS url() regex is valid")
});

fn value<'c>(caps: &'c Captures<'_>) -> &'c str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map_or("", |m| m.as_str())
}

/// Replace every web `url()` in `css` by an asset placeholder, resolving relative
/// references against `base`. Resolved URLs are appended to `assets` in order.
/// `data:` URIs, fragments and archive paths are left as they are.
pub fn rewrite_urls(css: &str, base: &Url, assets: &mut Vec<String>) -> String {
    CSS_URL
        .replace_all(css, |caps: &Captures<'_>| match urls::resolve(base, value(caps)) {
            Target::Absolute(mut url) => {
                url.set_fragment(None);
                let url = url.to_string();
                let placeholder = urls::placeholder_for(&url);
                assets.push(url);
                format!("url(\"{}\")", placeholder)
            }
            Target::Untouched => caps[0].to_string(),
        })
        .into_owned()
}

/// Swap placeholders inside `url()` for the path `resolve` returns.
pub fn substitute(css: &str, resolve: &dyn Fn(&str) -> String) -> String {
    CSS_URL
        .replace_all(css, |caps: &Captures<'_>| {
            let target = value(caps);
            if target.starts_with(PENDING_PREFIX) {
                format!("url(\"{}\")", resolve(target))
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}
