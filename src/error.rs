use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Template has args {} but {} were input", fmt_set(.declared), fmt_set(.supplied))]
    TemplateMismatch {
        declared: BTreeSet<String>,
        supplied: BTreeSet<String>,
    },

    #[error("retrieval failed: {message}")]
    RemoteRetrieval { message: String },

    #[error("inference failed: {message}")]
    RemoteInference { message: String },

    #[error("malformed expansion output: {message}")]
    MalformedExpansionOutput { message: String },

    #[error("query expansion gave up after {attempts} attempts: {last_error}")]
    ExpansionExhausted { attempts: u32, last_error: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid model request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn inference(message: impl Into<String>) -> Self {
        Self::RemoteInference {
            message: message.into(),
        }
    }

    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::RemoteRetrieval {
            message: message.into(),
        }
    }
}

fn fmt_set(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        return "{}".to_string();
    }
    let joined = set.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
    format!("{{{}}}", joined)
}
