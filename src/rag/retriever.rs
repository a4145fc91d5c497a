use crate::error::{RagError, Result};
use crate::rag::auth::Auth;
use crate::rag::parallel::QueryResultMap;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Passage text as returned by the knowledge base.
pub type Passage = String;

pub const DEFAULT_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub text: String,
    /// Location, score and anything else the backend attaches.
    pub metadata: Value,
}

/// A remote knowledge index.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// At most `k` results, in backend ranking order.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>>;
}

#[derive(Debug, Clone)]
pub struct KnowledgeBaseRetriever {
    base_url: String,
    kb_id: String,
    client: Client,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    retrieval_results: Vec<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    content: RawContent,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(alias = "Message")]
    message: Option<String>,
}

impl KnowledgeBaseRetriever {
    pub fn new(
        base_url: &str,
        kb_id: &str,
        auth: Auth,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            kb_id: kb_id.to_string(),
            client,
            auth,
        })
    }

    pub fn kb_id(&self) -> &str {
        &self.kb_id
    }
}

#[async_trait]
impl Retriever for KnowledgeBaseRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        let url = format!("{}/knowledgebases/{}/retrieve", self.base_url, self.kb_id);
        let body = json!({
            "retrievalQuery": { "text": query },
            "retrievalConfiguration": {
                "vectorSearchConfiguration": { "numberOfResults": k }
            }
        });

        let body = serde_json::to_vec(&body)?;
        let builder = self
            .client
            .post(&url)
            .header("content-type", "application/json");
        let builder = self
            .auth
            .authorize(builder, &url, &[("content-type", "application/json")], &body)
            .await?
            .body(body);

        debug!(kb_id = %self.kb_id, k, "Retrieving passages");

        let response = builder
            .send()
            .await
            .map_err(|e| RagError::retrieval(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ServiceError>(&text)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}: {}", status, text.trim()));
            error!(kb_id = %self.kb_id, %status, "Retrieval error: {}", message);
            return Err(RagError::retrieval(message));
        }

        let parsed: RetrieveResponse = response
            .json()
            .await
            .map_err(|e| RagError::retrieval(format!("unreadable retrieval response: {}", e)))?;

        Ok(parsed
            .retrieval_results
            .into_iter()
            .map(|r| RetrievalResult {
                text: r.content.text,
                metadata: Value::Object(r.rest),
            })
            .collect())
    }
}

/// Passage texts of one retrieval, in ranking order.
pub fn get_contexts(results: &[RetrievalResult]) -> Vec<Passage> {
    results.iter().map(|r| r.text.clone()).collect()
}

/// Flatten every successful entry of `results`. Passages of one query stay
/// contiguous; the order between queries is whatever the map yields.
/// Failed entries are logged and skipped.
pub fn get_multiple_contexts(results: &QueryResultMap) -> Vec<Passage> {
    let mut contexts = Vec::new();
    for (key, outcome) in results {
        match outcome {
            Ok(passages) => contexts.extend(passages.iter().cloned()),
            Err(message) => warn!(key = %key, "Skipping failed retrieval: {}", message),
        }
    }
    contexts
}
