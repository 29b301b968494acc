use crate::error::FetchError;
use crate::types::{ContentRecord, ContentType};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Which items a read may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFilter {
    /// Public consumers only ever see published items.
    PublishedOnly,
    All,
}

impl ContentFilter {
    fn query_value(&self) -> &'static str {
        match self {
            ContentFilter::PublishedOnly => "published",
            ContentFilter::All => "all",
        }
    }
}

/// Read access to the authoritative content store.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Admin-level listing of `{id, lastModified, status}` for every item,
    /// regardless of visibility.
    async fn fetch_snapshot(&self, content_type: ContentType)
        -> Result<Vec<ContentRecord>, FetchError>;

    async fn fetch_list(
        &self,
        content_type: ContentType,
        filter: ContentFilter,
    ) -> Result<Vec<Value>, FetchError>;

    /// `Ok(None)` when the item does not exist or is filtered out.
    async fn fetch_item(
        &self,
        content_type: ContentType,
        id: &str,
        filter: ContentFilter,
    ) -> Result<Option<Value>, FetchError>;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Talks to a REST content store laid out as `{base}/{type}` and
/// `{base}/{type}/{id}`, with a `status` query filter.
pub struct HttpContentSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContentSource {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        filter: ContentFilter,
    ) -> Result<Option<T>, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(&[("status", filter.query_value())])
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch_snapshot(
        &self,
        content_type: ContentType,
    ) -> Result<Vec<ContentRecord>, FetchError> {
        let url = format!("{}/{}", self.base_url, content_type);
        let records: Option<Vec<ContentRecord>> = self.get_json(&url, ContentFilter::All).await?;
        records.ok_or_else(|| FetchError::Unavailable(format!("{url} not found")))
    }

    async fn fetch_list(
        &self,
        content_type: ContentType,
        filter: ContentFilter,
    ) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}/{}", self.base_url, content_type);
        Ok(self.get_json(&url, filter).await?.unwrap_or_default())
    }

    async fn fetch_item(
        &self,
        content_type: ContentType,
        id: &str,
        filter: ContentFilter,
    ) -> Result<Option<Value>, FetchError> {
        let url = format!("{}/{}/{}", self.base_url, content_type, id);
        self.get_json(&url, filter).await
    }
}
