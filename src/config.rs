use crate::error::{RagError, Result};
use crate::rag::auth::{AuthMode, api_key_from_env};
use crate::rag::vendor::Vendor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub knowledge_base: KnowledgeBaseConfig,
    pub query: QueryConfig,
    pub generation: ModelConfig,
    #[serde(default)]
    pub expansion: Option<ExpansionConfig>,
    #[serde(default)]
    pub relevance: Option<RelevanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    pub kb_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_results")]
    pub results_per_query: usize,
    #[serde(default = "default_retrieval_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// The knowledge-base runtime does not accept bearer API keys.
    #[serde(default = "default_kb_auth")]
    pub auth: AuthMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub text: String,
}

/// One remote model: identity, call mode, prompt template and the vendor
/// request skeleton whose prompt slot holds `{prompt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub vendor: Option<Vendor>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthMode>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub template: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionConfig {
    #[serde(flatten)]
    pub model: ModelConfig,
    pub n_queries: usize,
    pub output_format: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceConfig {
    #[serde(flatten)]
    pub model: ModelConfig,
    #[serde(default)]
    pub enabled: bool,
    pub format_instructions: String,
    #[serde(default = "default_relevance_workers")]
    pub max_workers: usize,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_results() -> usize {
    crate::rag::retriever::DEFAULT_RESULTS
}

fn default_retrieval_workers() -> usize {
    crate::rag::parallel::DEFAULT_RETRIEVAL_WORKERS
}

fn default_relevance_workers() -> usize {
    crate::rag::relevance::DEFAULT_RELEVANCE_WORKERS
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_retries() -> u32 {
    3
}

fn default_kb_auth() -> AuthMode {
    AuthMode::Sigv4
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = directories::ProjectDirs::from("com", "local", "kbrag")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RagError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| RagError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let kb = &self.knowledge_base;
        if kb.results_per_query == 0 {
            return Err(RagError::Config("results_per_query must be at least 1".into()));
        }
        if kb.max_workers == 0 {
            return Err(RagError::Config("knowledge_base.max_workers must be at least 1".into()));
        }
        if kb.auth == AuthMode::Bearer {
            return Err(RagError::Config(
                "knowledge_base.auth cannot be bearer; use sigv4".into(),
            ));
        }

        self.generation.vendor()?;

        if let Some(expansion) = &self.expansion {
            expansion.model.vendor()?;
            if expansion.retries == 0 {
                return Err(RagError::Config("expansion.retries must be at least 1".into()));
            }
        }

        if let Some(relevance) = &self.relevance {
            relevance.model.vendor()?;
            if relevance.max_workers == 0 {
                return Err(RagError::Config("relevance.max_workers must be at least 1".into()));
            }
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.knowledge_base.timeout_secs)
    }

    /// Relevance settings when the stage should run: either switched on in
    /// the file or forced by `force`. Forcing without a `[relevance]`
    /// section is an error.
    pub fn relevance_stage(&self, force: bool) -> Result<Option<&RelevanceConfig>> {
        match &self.relevance {
            Some(r) if r.enabled || force => Ok(Some(r)),
            None if force => Err(RagError::Config(
                "relevance evaluation requested but no [relevance] section is configured".into(),
            )),
            _ => Ok(None),
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn endpoint(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| {
            format!("https://bedrock-agent-runtime.{}.amazonaws.com", self.region)
        })
    }
}

impl ModelConfig {
    /// Explicit vendor, or the one implied by the model id.
    pub fn vendor(&self) -> Result<Vendor> {
        self.vendor
            .or_else(|| Vendor::from_model_id(&self.model_id))
            .ok_or_else(|| {
                RagError::Config(format!(
                    "cannot infer vendor for model {}; set vendor explicitly",
                    self.model_id
                ))
            })
    }

    pub fn endpoint(&self, region: &str) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", region))
    }

    /// Explicit mode, else bearer when an API key is in the environment,
    /// else SigV4.
    pub fn auth_mode(&self) -> AuthMode {
        self.auth.unwrap_or_else(|| {
            if api_key_from_env(self.api_key_env.as_deref()).is_some() {
                AuthMode::Bearer
            } else {
                AuthMode::Sigv4
            }
        })
    }
}
