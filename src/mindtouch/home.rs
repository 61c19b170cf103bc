//! Library home page: the API token, the branding logo and the site stylesheets.

use crate::mindtouch::error::FetchError;
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Deserialize;

/// What the coordinator needs from the library home page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryHome {
    /// Value for the `x-deki-token` header of every API call.
    pub api_token: String,
    /// Absolute URL of the branding logo, when the page has one.
    pub logo_url: Option<String>,
    /// Absolute URL of the `media="screen"` stylesheet.
    pub screen_css_url: Option<String>,
    /// Absolute URL of the `media="print"` stylesheet.
    pub print_css_url: Option<String>,
    /// Non-empty `<style type="text/css">` blocks, in document order.
    pub inline_css: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GlobalSettings {
    #[serde(rename = "apiToken")]
    api_token: Option<String>,
}

fn parse_selector(sel: &str, url: &str) -> Result<Selector, FetchError> {
    Selector::parse(sel).map_err(|e| FetchError::InvalidResponse {
        url: url.to_string(),
        reason: format!("invalid selector {:?}: {}", sel, e),
    })
}

/// Extract the API token and logo URL from the home page markup served at `url`.
///
/// A missing token is an error; a missing logo is not.
pub fn parse_home(html: &str, url: &str) -> Result<LibraryHome, FetchError> {
    let doc = Html::parse_document(html);
    let invalid = |reason: &str| FetchError::InvalidResponse {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let settings_sel = parse_selector("script#mt-global-settings", url)?;
    let settings_text: String = doc
        .select(&settings_sel)
        .next()
        .ok_or_else(|| invalid("missing <script id=\"mt-global-settings\">"))?
        .text()
        .collect();
    let settings: GlobalSettings = serde_json::from_str(settings_text.trim())
        .map_err(|e| invalid(&format!("global settings are not valid JSON: {}", e)))?;
    let api_token = settings
        .api_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| invalid("global settings have no apiToken"))?;

    let logo_sel = parse_selector("div.LTBranding img[src]", url)?;
    let logo_url = doc
        .select(&logo_sel)
        .next()
        .and_then(|img| img.value().attr("src"))
        .and_then(|src| Url::parse(url).ok()?.join(src.trim()).ok())
        .map(String::from);

    let absolute = |href: &str| Url::parse(url).ok()?.join(href.trim()).ok().map(String::from);
    let stylesheet = |media: &str| -> Result<Option<String>, FetchError> {
        let sel = parse_selector(&format!(r#"link[rel="stylesheet"][media="{}"][href]"#, media), url)?;
        Ok(doc
            .select(&sel)
            .next()
            .and_then(|link| link.value().attr("href"))
            .and_then(|href| absolute(href)))
    };
    let screen_css_url = stylesheet("screen")?;
    let print_css_url = stylesheet("print")?;

    let style_sel = parse_selector(r#"style[type="text/css"]"#, url)?;
    let inline_css = doc
        .select(&style_sel)
        .map(|style| style.text().collect::<String>())
        .filter(|css| !css.trim().is_empty())
        .collect();

    Ok(LibraryHome {
        api_token,
        logo_url,
        screen_css_url,
        print_css_url,
        inline_css,
    })
}
