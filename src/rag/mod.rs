pub mod auth;
pub mod client;
pub mod eventstream;
pub mod expansion;
pub mod fanout;
pub mod mock;
pub mod parallel;
pub mod pipeline;
pub mod relevance;
pub mod retriever;
pub mod retry;
pub mod vendor;

pub use auth::{Auth, AuthMode, AuthResolver};
pub use client::{BedrockClient, Completion, InferenceClient, ModelHandle, TextStream};
pub use expansion::QueryExpander;
pub use parallel::{ParallelRetrieval, QueryResultMap};
pub use pipeline::{Answer, RagPipeline, Stage};
pub use relevance::{PromptContextPair, RelevanceFilter};
pub use retriever::{KnowledgeBaseRetriever, Passage, RetrievalResult, Retriever};
pub use vendor::{StreamEvent, StreamMetadata, Vendor, VendorAdapter};
