//! Reqwest-backed embedding provider speaking an OpenAI-style JSON API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::Embedder;
use crate::types::PipelineError;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
}

/// HTTP embedding client.
///
/// Failure classification follows HTTP status semantics: 429 and 5xx are
/// transient; other non-success statuses are permanent. Transport errors
/// (connect, timeout) are transient.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    dims: usize,
}

impl HttpEmbedder {
    pub fn new(endpoint: Url, model: impl Into<String>, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            model: model.into(),
            api_key: None,
            dims,
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
impl Embedder for HttpEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&EmbedRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::transient("embeddings", err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("embeddings", status, &body));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::permanent("embeddings", err.to_string()))?;
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Map an HTTP status to the pipeline error taxonomy: 429/5xx transient,
/// everything else permanent.
pub(crate) fn classify_status(
    service: &'static str,
    status: reqwest::StatusCode,
    body: &str,
) -> PipelineError {
    let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PipelineError::transient(service, message)
    } else {
        PipelineError::permanent(service, message)
    }
}
