//! Per-vendor request and response shapes.
//!
//! One adapter per response schema. The adapter is chosen once, when a
//! model handle is built, and then reused for every call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// End-of-stream information reported by the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamMetadata {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Done(StreamMetadata),
}

pub trait VendorAdapter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// JSON pointer of the prompt text inside the request skeleton.
    fn prompt_pointer(&self) -> &'static str;

    fn extract_text(&self, body: &Value) -> Option<String>;

    /// Interpret one decoded stream chunk. Chunks that carry neither text
    /// nor terminal metadata map to `None`.
    fn parse_chunk(&self, chunk: &Value) -> Option<StreamEvent>;

    /// Text the model was primed with and therefore omits from its output.
    fn structured_output_prefix(&self) -> &'static str {
        ""
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Claude,
    Cohere,
}

impl Vendor {
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let id = model_id.to_lowercase();
        if id.contains("claude") {
            Some(Vendor::Claude)
        } else if id.contains("command-r") {
            Some(Vendor::Cohere)
        } else {
            None
        }
    }

    pub fn adapter(self) -> Arc<dyn VendorAdapter> {
        match self {
            Vendor::Claude => Arc::new(ClaudeAdapter),
            Vendor::Cohere => Arc::new(CohereAdapter),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Claude => write!(f, "claude"),
            Vendor::Cohere => write!(f, "cohere"),
        }
    }
}

impl std::str::FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" | "anthropic" => Ok(Vendor::Claude),
            "cohere" | "command-r" => Ok(Vendor::Cohere),
            _ => Err(format!("Unknown vendor: {}", s)),
        }
    }
}

/// Messages API: content blocks in, content blocks out.
#[derive(Debug, Clone, Copy)]
pub struct ClaudeAdapter;

impl VendorAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn prompt_pointer(&self) -> &'static str {
        "/messages/0/content/0/text"
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body["content"]
            .as_array()?
            .iter()
            .find(|block| block["type"] == "text")
            .and_then(|block| block["text"].as_str())
            .map(str::to_string)
    }

    fn parse_chunk(&self, chunk: &Value) -> Option<StreamEvent> {
        match chunk["type"].as_str()? {
            "content_block_delta" if chunk["delta"]["type"] == "text_delta" => chunk["delta"]
                ["text"]
                .as_str()
                .map(|t| StreamEvent::Text(t.to_string())),
            "message_delta" => Some(StreamEvent::Done(StreamMetadata {
                stop_reason: chunk["delta"]["stop_reason"].as_str().map(str::to_string),
                stop_sequence: chunk["delta"]["stop_sequence"].as_str().map(str::to_string),
                output_tokens: chunk["usage"]["output_tokens"].as_u64(),
            })),
            _ => None,
        }
    }

    // Claude skeletons prefill the assistant turn with "{".
    fn structured_output_prefix(&self) -> &'static str {
        "{"
    }
}

/// Single-message schema of the command-r family.
#[derive(Debug, Clone, Copy)]
pub struct CohereAdapter;

impl VendorAdapter for CohereAdapter {
    fn name(&self) -> &'static str {
        "cohere"
    }

    fn prompt_pointer(&self) -> &'static str {
        "/message"
    }

    fn extract_text(&self, body: &Value) -> Option<String> {
        body["text"].as_str().map(str::to_string)
    }

    fn parse_chunk(&self, chunk: &Value) -> Option<StreamEvent> {
        match chunk["event_type"].as_str()? {
            "text-generation" => chunk["text"]
                .as_str()
                .map(|t| StreamEvent::Text(t.to_string())),
            "stream-end" => Some(StreamEvent::Done(StreamMetadata {
                stop_reason: chunk["finish_reason"].as_str().map(str::to_string),
                stop_sequence: None,
                output_tokens: chunk["amazon-bedrock-invocationMetrics"]["outputTokenCount"]
                    .as_u64(),
            })),
            _ => None,
        }
    }
}
