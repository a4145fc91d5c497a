use crate::config::ModelConfig;
use crate::error::{RagError, Result};
use crate::prompt::{ModelRequest, RequestTemplate};
use crate::rag::auth::Auth;
use crate::rag::eventstream::{self, FrameDecoder, Message};
use crate::rag::vendor::{StreamEvent, StreamMetadata, VendorAdapter};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// One-shot sequence of stream events; ends after the transport closes.
pub type TextStream = BoxStream<'static, Result<StreamEvent>>;

/// A remote text-generation model.
///
/// Implementations hold no per-call state, so one instance can serve any
/// number of concurrent callers.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<String>;

    async fn generate_stream(&self, request: &ModelRequest) -> Result<TextStream>;
}

#[derive(Debug, Clone)]
pub struct BedrockClient {
    base_url: String,
    model_id: String,
    client: Client,
    adapter: Arc<dyn VendorAdapter>,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(alias = "Message")]
    message: Option<String>,
}

impl BedrockClient {
    pub fn new(
        base_url: &str,
        model_id: &str,
        adapter: Arc<dyn VendorAdapter>,
        auth: Auth,
        timeout: Duration,
    ) -> Result<Self> {
        // Per-read limit: a long stream stays alive while data keeps arriving.
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id: model_id.to_string(),
            client,
            adapter,
            auth,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn send(&self, path: &str, accept: &str, request: &ModelRequest) -> Result<reqwest::Response> {
        let url = format!("{}/model/{}/{}", self.base_url, self.model_id, path);

        let body = request.to_json()?;
        let headers = [("content-type", "application/json"), ("accept", accept)];

        let mut builder = self.client.post(&url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let builder = self
            .auth
            .authorize(builder, &url, &headers, &body)
            .await?
            .body(body);

        debug!(model_id = %self.model_id, %url, "Sending inference request");

        let response = builder.send().await.map_err(|e| {
            error!(model_id = %self.model_id, error = %e, "Inference request failed");
            RagError::inference(format!("request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = service_message(status, &body);
            error!(model_id = %self.model_id, %status, "A client error occurred: {}", message);
            return Err(RagError::inference(message));
        }

        Ok(response)
    }
}

#[async_trait]
impl InferenceClient for BedrockClient {
    async fn generate(&self, request: &ModelRequest) -> Result<String> {
        let response = self.send("invoke", "application/json", request).await?;

        let body: serde_json::Value = response.json().await.map_err(|e| {
            RagError::inference(format!("unreadable response from {}: {}", self.model_id, e))
        })?;

        self.adapter.extract_text(&body).ok_or_else(|| {
            RagError::inference(format!(
                "{} response has no text in the {} shape",
                self.model_id,
                self.adapter.name()
            ))
        })
    }

    async fn generate_stream(&self, request: &ModelRequest) -> Result<TextStream> {
        let response = self
            .send(
                "invoke-with-response-stream",
                "application/vnd.amazon.eventstream",
                request,
            )
            .await?;

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();

        Ok(decode_events(bytes, self.adapter.clone()))
    }
}

struct DecodeState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: FrameDecoder,
    adapter: Arc<dyn VendorAdapter>,
    done: bool,
}

fn decode_events(
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    adapter: Arc<dyn VendorAdapter>,
) -> TextStream {
    let state = DecodeState {
        bytes,
        decoder: FrameDecoder::new(),
        adapter,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        while !st.done {
            let frame = match st.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    match st.bytes.next().await {
                        Some(Ok(chunk)) => st.decoder.push(&chunk),
                        Some(Err(e)) => {
                            st.done = true;
                            let err = RagError::inference(format!("stream read failed: {}", e));
                            return Some((Err(err), st));
                        }
                        None => {
                            st.done = true;
                            if !st.decoder.is_empty() {
                                let err = RagError::inference("stream ended mid-frame");
                                return Some((Err(err), st));
                            }
                        }
                    }
                    continue;
                }
                Err(e) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
            };

            match eventstream::classify(&frame) {
                Ok(Message::Chunk(chunk)) => {
                    if let Some(event) = st.adapter.parse_chunk(&chunk) {
                        return Some((Ok(event), st));
                    }
                }
                Ok(Message::Exception { kind, message }) => {
                    error!(%kind, "A client error occurred: {}", message);
                    st.done = true;
                    return Some((Err(RagError::inference(format!("{}: {}", kind, message))), st));
                }
                Ok(Message::Other) => {}
                Err(e) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
            }
        }
        None
    })
    .boxed()
}

fn service_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ServiceError>(body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                format!("HTTP {}: {}", status, body.trim())
            }
        })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub metadata: Option<StreamMetadata>,
}

/// Concatenate every text event; the terminal metadata is kept aside.
pub async fn drain(mut stream: TextStream) -> Result<Completion> {
    let mut completion = Completion::default();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Text(text) => completion.text.push_str(&text),
            StreamEvent::Done(meta) => completion.metadata = Some(meta),
        }
    }
    Ok(completion)
}

/// A configured model: shared client, immutable request skeleton and the
/// vendor adapter chosen for it.
#[derive(Clone)]
pub struct ModelHandle {
    client: Arc<dyn InferenceClient>,
    adapter: Arc<dyn VendorAdapter>,
    template: RequestTemplate,
    stream: bool,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("adapter", &self.adapter.name())
            .field("stream", &self.stream)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        adapter: Arc<dyn VendorAdapter>,
        skeleton: serde_json::Value,
        stream: bool,
    ) -> Result<Self> {
        let template = RequestTemplate::new(skeleton, adapter.prompt_pointer())?;
        Ok(Self {
            client,
            adapter,
            template,
            stream,
        })
    }

    /// Build a handle backed by the HTTP client described in `config`.
    pub fn from_config(
        config: &ModelConfig,
        region: &str,
        timeout: Duration,
        auth: Auth,
    ) -> Result<Self> {
        let adapter = config.vendor()?.adapter();
        let client = BedrockClient::new(
            &config.endpoint(region),
            &config.model_id,
            adapter.clone(),
            auth,
            timeout,
        )?;
        info!(model_id = %config.model_id, vendor = adapter.name(), stream = config.stream, "Model ready");
        Self::new(Arc::new(client), adapter, config.body.clone(), config.stream)
    }

    pub fn adapter(&self) -> &dyn VendorAdapter {
        self.adapter.as_ref()
    }

    pub fn client(&self) -> Arc<dyn InferenceClient> {
        self.client.clone()
    }

    pub fn request(&self, prompt: &str) -> Result<ModelRequest> {
        self.template.build(prompt)
    }

    /// Whole-response call regardless of the configured stream flag.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let request = self.request(prompt)?;
        self.client.generate(&request).await
    }

    /// Call the model in its configured mode.
    pub async fn complete(&self, prompt: &str) -> Result<Completion> {
        let request = self.request(prompt)?;

        if !self.stream {
            let text = self.client.generate(&request).await?;
            return Ok(Completion { text, metadata: None });
        }

        let completion = drain(self.client.generate_stream(&request).await?).await?;
        if let Some(meta) = &completion.metadata {
            info!(
                stop_reason = meta.stop_reason.as_deref().unwrap_or("-"),
                stop_sequence = meta.stop_sequence.as_deref().unwrap_or("-"),
                output_tokens = meta.output_tokens.unwrap_or(0),
                "Stream finished"
            );
        }
        Ok(completion)
    }
}
