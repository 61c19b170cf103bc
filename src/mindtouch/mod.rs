//! Remote side: the MindTouch "deki" API of one library. Shared client, token handling,
//! tree discovery and page fetching.

mod client;
pub mod discover;
mod error;
pub mod home;
pub mod pages;

pub use client::{Fetched, PoliteClient, PoliteClientBuilder, DEFAULT_RETRY_COUNT};
pub use discover::{discover, Discovery, DiscoveryOptions};
pub use error::{DiscoveryError, FetchError, PageFetchError};
pub use home::{parse_home, LibraryHome};
pub use pages::{fetch_page, RawPage};

use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

/// One remote library: its base URL, the API token and the shared HTTP client.
#[derive(Debug, Clone)]
pub struct Library {
    client: PoliteClient,
    library_url: String,
    token: String,
}

impl Library {
    /// Fetch the library home page, keep its API token, and return the parsed home.
    #[instrument(skip(client))]
    pub async fn connect(
        client: PoliteClient,
        library_url: &str,
    ) -> Result<(Self, LibraryHome), FetchError> {
        let library_url = normalize_base(library_url)?;
        let home_url = format!("{}/", library_url);
        let fetched = client.get_with_retry(&home_url, &[]).await?;
        let home = parse_home(&fetched.text(), &home_url)?;
        debug!(%library_url, logo = ?home.logo_url, "connected");
        let library = Self {
            client,
            library_url,
            token: home.api_token.clone(),
        };
        Ok((library, home))
    }

    /// Build a library handle from an already known token.
    pub fn with_token(
        client: PoliteClient,
        library_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            library_url: normalize_base(library_url)?,
            token: token.into(),
        })
    }

    /// Base URL without trailing slash, e.g. `https://geo.libretexts.org`.
    pub fn library_url(&self) -> &str {
        &self.library_url
    }

    pub fn client(&self) -> &PoliteClient {
        &self.client
    }

    /// Full URL of an API sub path such as `/pages/28207/contents`.
    pub fn api_url(&self, sub_path: &str) -> String {
        format!("{}/@api/deki{}", self.library_url, sub_path)
    }

    /// GET an API sub path with the token header and JSON output format.
    pub async fn api_get(
        &self,
        sub_path: &str,
        query: &[(&str, String)],
    ) -> Result<Fetched, FetchError> {
        let raw = self.api_url(sub_path);
        let mut url = Url::parse(&raw).map_err(|e| FetchError::InvalidUrl {
            input: raw.clone(),
            reason: e.to_string(),
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
            pairs.append_pair("dream.out.format", "json");
        }
        self.client
            .get_with_retry(url.as_str(), &[("x-deki-token", self.token.as_str())])
            .await
    }

    /// Like [Library::api_get], decoding the body as JSON.
    pub async fn api_json<T: DeserializeOwned>(
        &self,
        sub_path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let fetched = self.api_get(sub_path, query).await?;
        serde_json::from_slice(&fetched.body).map_err(|e| FetchError::InvalidResponse {
            url: fetched.url.clone(),
            reason: format!("unexpected JSON: {}", e),
        })
    }
}

fn normalize_base(library_url: &str) -> Result<String, FetchError> {
    let trimmed = library_url.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|e| FetchError::InvalidUrl {
        input: library_url.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(FetchError::InvalidUrl {
            input: library_url.to_string(),
            reason: "scheme must be http or https".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_joins_base_and_sub_path() -> Result<(), Box<dyn std::error::Error>> {
        let lib = Library::with_token(PoliteClient::new()?, "https://geo.libretexts.org/", "t")?;
        assert_eq!(lib.library_url(), "https://geo.libretexts.org");
        assert_eq!(
            lib.api_url("/pages/28207/contents"),
            "https://geo.libretexts.org/@api/deki/pages/28207/contents"
        );
        Ok(())
    }

    #[test]
    fn non_http_base_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let err = Library::with_token(PoliteClient::new()?, "ftp://geo.libretexts.org", "t");
        assert!(matches!(err, Err(FetchError::InvalidUrl { .. })));
        let err = Library::with_token(PoliteClient::new()?, "not a url", "t");
        assert!(matches!(err, Err(FetchError::InvalidUrl { .. })));
        Ok(())
    }
}
