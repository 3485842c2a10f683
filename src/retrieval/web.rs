//! Reqwest-backed web-search provider.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{WebHit, WebSearch};
use crate::embedding::http::classify_status;
use crate::types::PipelineError;

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    title: String,
    url: String,
    #[serde(default)]
    snippet: String,
}

/// Keyword search client over a JSON search API.
///
/// The provider returns ranked results with no native phrase-boost guarantee;
/// topic filtering happens client-side in the retrieval engine.
#[derive(Clone)]
pub struct HttpWebSearch {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpWebSearch {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl WebSearch for HttpWebSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebHit>, PipelineError> {
        let mut request = self
            .client
            .get(self.endpoint.clone())
            .query(&[("q", query), ("count", &max_results.to_string())]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::transient("web_search", err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("web_search", status, &body));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::permanent("web_search", err.to_string()))?;
        Ok(parsed
            .results
            .into_iter()
            .take(max_results)
            .map(|item| WebHit {
                title: item.title,
                url: item.url,
                snippet: item.snippet,
            })
            .collect())
    }
}
