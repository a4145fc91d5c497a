//! In-process stand-ins for the remote model and knowledge base.

use crate::error::{RagError, Result};
use crate::prompt::ModelRequest;
use crate::rag::client::{InferenceClient, TextStream};
use crate::rag::retriever::{RetrievalResult, Retriever};
use crate::rag::vendor::{StreamEvent, StreamMetadata};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Responder = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Stream(Vec<String>, Option<String>),
    Error(String),
}

/// Tracks how many calls are running at once.
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Scripted model. Queued replies are served first, then the responder
/// (if any); with neither, the call fails as a remote error.
#[derive(Default)]
pub struct MockInference {
    replies: Mutex<VecDeque<Reply>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ModelRequest>>,
    delay: Option<Duration>,
    gauge: Gauge,
}

impl MockInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call by applying `f` to the request's prompt text.
    pub fn with_responder(f: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Some(Box::new(f)),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_text(&self, text: &str) {
        self.push(Reply::Text(text.to_string()));
    }

    pub fn push_stream(&self, chunks: Vec<&str>, stop_reason: Option<&str>) {
        self.push(Reply::Stream(
            chunks.into_iter().map(str::to_string).collect(),
            stop_reason.map(str::to_string),
        ));
    }

    pub fn push_error(&self, message: &str) {
        self.push(Reply::Error(message.to_string()));
    }

    fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Prompt text of every request received so far, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r.prompt_text().unwrap_or_default().to_string())
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.gauge.peak()
    }

    async fn next_reply(&self, request: &ModelRequest) -> Result<Reply> {
        self.gauge.enter();
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.gauge.exit();

        let queued = self.replies.lock().unwrap().pop_front();
        match (queued, &self.responder) {
            (Some(reply), _) => Ok(reply),
            (None, Some(responder)) => {
                responder(request.prompt_text().unwrap_or_default()).map(Reply::Text)
            }
            (None, None) => Err(RagError::inference("no scripted response")),
        }
    }
}

#[async_trait]
impl InferenceClient for MockInference {
    async fn generate(&self, request: &ModelRequest) -> Result<String> {
        match self.next_reply(request).await? {
            Reply::Text(text) => Ok(text),
            Reply::Stream(chunks, _) => Ok(chunks.concat()),
            Reply::Error(message) => Err(RagError::inference(message)),
        }
    }

    async fn generate_stream(&self, request: &ModelRequest) -> Result<TextStream> {
        let (chunks, stop_reason) = match self.next_reply(request).await? {
            Reply::Text(text) => (vec![text], None),
            Reply::Stream(chunks, stop_reason) => (chunks, stop_reason),
            Reply::Error(message) => return Err(RagError::inference(message)),
        };

        let mut events: Vec<Result<StreamEvent>> =
            chunks.into_iter().map(|c| Ok(StreamEvent::Text(c))).collect();
        events.push(Ok(StreamEvent::Done(StreamMetadata {
            stop_reason,
            stop_sequence: None,
            output_tokens: None,
        })));
        Ok(stream::iter(events).boxed())
    }
}

/// Knowledge base that answers `k` synthetic passages per query, except
/// for queries scripted to fail.
#[derive(Debug, Default)]
pub struct MockRetriever {
    per_query: usize,
    failures: HashMap<String, String>,
    calls: Mutex<Vec<(String, usize)>>,
    delay: Option<Duration>,
    gauge: Gauge,
}

impl MockRetriever {
    pub fn new(per_query: usize) -> Self {
        Self {
            per_query,
            ..Self::default()
        }
    }

    pub fn fail_on(mut self, query: &str, message: &str) -> Self {
        self.failures.insert(query.to_string(), message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Passage text produced for the `index`th result of `query`.
    pub fn passage(query: &str, index: usize) -> String {
        format!("{} :: passage {}", query, index)
    }

    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.gauge.peak()
    }
}

#[async_trait]
impl Retriever for MockRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        self.gauge.enter();
        self.calls.lock().unwrap().push((query.to_string(), k));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.gauge.exit();

        if let Some(message) = self.failures.get(query) {
            return Err(RagError::retrieval(message.clone()));
        }

        Ok((0..self.per_query.min(k))
            .map(|i| RetrievalResult {
                text: Self::passage(query, i),
                metadata: Value::Null,
            })
            .collect())
    }
}
