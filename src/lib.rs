pub mod cli;
pub mod config;
pub mod error;
pub mod prompt;
pub mod rag;

pub use config::Config;
pub use error::{RagError, Result};
