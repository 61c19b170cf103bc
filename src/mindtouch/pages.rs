//! Page Fetcher: raw markup of one page from the contents endpoint.

use crate::mindtouch::error::{FetchError, PageFetchError};
use crate::mindtouch::Library;
use crate::model::PageId;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Raw markup as served by the source, before any rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub id: PageId,
    pub markup: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentBody {
    Markup(String),
    Parts(Vec<serde_json::Value>),
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    body: ContentBody,
}

/// Fetch the rendered (`mode=view`) markup of page `id`.
///
/// Transient failures are retried by the client; whatever remains is permanent for
/// this run and tagged with the page id.
#[instrument(skip(library))]
pub async fn fetch_page(library: &Library, id: &str) -> Result<RawPage, PageFetchError> {
    let tag = |source: FetchError| PageFetchError {
        page_id: id.to_string(),
        source,
    };
    let fetched = library
        .api_get(
            &format!("/pages/{}/contents", id),
            &[("mode", "view".to_string())],
        )
        .await
        .map_err(tag)?;
    let markup = parse_contents(&fetched.body, &fetched.url).map_err(tag)?;
    debug!(bytes = markup.len(), "fetched page");
    Ok(RawPage {
        id: id.to_string(),
        markup,
    })
}

fn parse_contents(body: &[u8], url: &str) -> Result<String, FetchError> {
    let invalid = |reason: String| FetchError::InvalidResponse {
        url: url.to_string(),
        reason,
    };
    let response: ContentsResponse =
        serde_json::from_slice(body).map_err(|e| invalid(format!("unexpected JSON: {}", e)))?;
    match response.body {
        ContentBody::Markup(markup) => Ok(markup),
        ContentBody::Parts(parts) => match parts.into_iter().next() {
            Some(serde_json::Value::String(markup)) => Ok(markup),
            Some(_) => Err(invalid("first body element is not a string".to_string())),
            None => Err(invalid("body is an empty list".to_string())),
        },
    }
}
