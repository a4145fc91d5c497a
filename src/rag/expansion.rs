use crate::error::{RagError, Result};
use crate::prompt::{Template, bindings};
use crate::rag::client::ModelHandle;
use crate::rag::retry::{MalformedOutputRetry, RetryDecision, RetryPolicy};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Key under which the user's own query always appears.
pub const SEED_KEY: &str = "query_0";

/// Asks a model for alternative phrasings of a query, as a JSON object of
/// `query_N -> text`.
#[derive(Clone)]
pub struct QueryExpander {
    model: ModelHandle,
    template: Template,
    output_format: String,
    policy: Arc<dyn RetryPolicy>,
}

impl std::fmt::Debug for QueryExpander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExpander")
            .field("model", &self.model)
            .field("max_attempts", &self.policy.max_attempts())
            .finish()
    }
}

impl QueryExpander {
    pub fn new(
        model: ModelHandle,
        template: Template,
        output_format: impl Into<String>,
        retries: u32,
    ) -> Self {
        Self::with_policy(
            model,
            template,
            output_format,
            Arc::new(MalformedOutputRetry::new(retries)),
        )
    }

    pub fn with_policy(
        model: ModelHandle,
        template: Template,
        output_format: impl Into<String>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            model,
            template,
            output_format: output_format.into(),
            policy,
        }
    }

    pub fn prompt(&self, seed: &str, n: usize) -> Result<String> {
        self.template.fill(&bindings([
            ("n_queries", n.to_string()),
            ("output_format", self.output_format.clone()),
            ("question", seed.to_string()),
        ]))
    }

    /// Expanded queries plus the seed under `query_0`.
    ///
    /// Malformed output is retried under the policy; running out of
    /// attempts is fatal. A remote error is fatal on the first occurrence.
    pub async fn expand(&self, seed: &str, n: usize) -> Result<HashMap<String, String>> {
        let prompt = self.prompt(seed, n)?;
        let prefix = self.model.adapter().structured_output_prefix();
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let completion = self.model.complete(&prompt).await?;
            let raw = format!("{}{}", prefix, completion.text);

            let err = match parse_expansion(&raw) {
                Ok(mut queries) => {
                    queries.insert(SEED_KEY.to_string(), seed.to_string());
                    info!(attempt, queries = queries.len(), "Query expansion succeeded");
                    return Ok(queries);
                }
                Err(e) => e,
            };

            match self.policy.decide(attempt, &err) {
                RetryDecision::Retry => {
                    warn!(
                        error = %err,
                        "Failed to decode JSON, retrying... (Attempt {}/{})",
                        attempt,
                        max_attempts
                    );
                }
                RetryDecision::GiveUp => {
                    return Err(match err {
                        RagError::MalformedExpansionOutput { message } => {
                            RagError::ExpansionExhausted {
                                attempts: attempt,
                                last_error: message,
                            }
                        }
                        other => other,
                    });
                }
            }
        }
    }
}

/// Parse a JSON object whose values are all strings.
pub fn parse_expansion(raw: &str) -> Result<HashMap<String, String>> {
    let malformed = |message: String| RagError::MalformedExpansionOutput { message };

    let object: serde_json::Map<String, Value> =
        serde_json::from_str(raw.trim()).map_err(|e| malformed(e.to_string()))?;

    object
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(text) => Ok((key, text)),
            other => Err(malformed(format!("{} is not a string: {}", key, other))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::mock::MockInference;
    use crate::rag::vendor::Vendor;
    use serde_json::json;

    const TEMPLATE: &str =
        "Write {n_queries} alternative queries for: {question}\nFormat: {output_format}";

    fn expander(mock: Arc<MockInference>, vendor: Vendor, retries: u32) -> QueryExpander {
        let skeleton = match vendor {
            Vendor::Claude => json!({
                "messages": [
                    {"role": "user", "content": [{"type": "text", "text": "{prompt}"}]},
                    {"role": "assistant", "content": [{"type": "text", "text": "{"}]}
                ]
            }),
            Vendor::Cohere => json!({"message": "{prompt}"}),
        };
        let model = ModelHandle::new(mock, vendor.adapter(), skeleton, false).unwrap();
        QueryExpander::new(model, Template::new(TEMPLATE), r#"{"query_1": "..."}"#, retries)
    }

    #[tokio::test]
    async fn test_seed_is_injected_as_query_0() {
        let mock = Arc::new(MockInference::new());
        mock.push_text(r#"{"query_1": "Define X", "query_2": "Explain X"}"#);

        let queries = expander(mock.clone(), Vendor::Cohere, 3)
            .expand("What is X?", 2)
            .await
            .unwrap();

        assert_eq!(queries.len(), 3);
        assert_eq!(queries[SEED_KEY], "What is X?");
        assert_eq!(queries["query_2"], "Explain X");
        assert_eq!(mock.prompts().len(), 1);
        assert!(mock.prompts()[0].contains("Write 2 alternative queries for: What is X?"));
    }

    #[tokio::test]
    async fn test_claude_output_gets_opening_brace() {
        let mock = Arc::new(MockInference::new());
        mock.push_text(r#""query_1": "Define X"}"#);

        let queries = expander(mock, Vendor::Claude, 1)
            .expand("What is X?", 1)
            .await
            .unwrap();

        assert_eq!(queries["query_1"], "Define X");
        assert_eq!(queries[SEED_KEY], "What is X?");
    }

    #[tokio::test]
    async fn test_model_query_0_is_overwritten() {
        let mock = Arc::new(MockInference::new());
        mock.push_text(r#"{"query_0": "hijacked"}"#);

        let queries = expander(mock, Vendor::Cohere, 1).expand("seed", 1).await.unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[SEED_KEY], "seed");
    }

    #[tokio::test]
    async fn test_empty_expansion_still_has_seed() {
        let mock = Arc::new(MockInference::new());
        mock.push_text("{}");

        let queries = expander(mock, Vendor::Cohere, 1).expand("seed", 0).await.unwrap();
        assert_eq!(queries, HashMap::from([(SEED_KEY.to_string(), "seed".to_string())]));
    }

    #[tokio::test]
    async fn test_recovers_after_malformed_output() {
        let mock = Arc::new(MockInference::new());
        mock.push_text("Sure! Here are your queries:");
        mock.push_text(r#"{"query_1": "Define X"}"#);

        let queries = expander(mock.clone(), Vendor::Cohere, 3)
            .expand("What is X?", 1)
            .await
            .unwrap();

        assert_eq!(queries["query_1"], "Define X");
        assert_eq!(mock.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_malformed_output_exhausts_retries() {
        let mock = Arc::new(MockInference::with_responder(|_| Ok("not json".to_string())));

        let err = expander(mock.clone(), Vendor::Cohere, 3)
            .expand("What is X?", 2)
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::ExpansionExhausted { attempts: 3, .. }));
        assert_eq!(mock.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_remote_error_is_not_retried() {
        let mock = Arc::new(MockInference::new());
        mock.push_error("AccessDeniedException: no model access");
        mock.push_text(r#"{"query_1": "never reached"}"#);

        let err = expander(mock.clone(), Vendor::Cohere, 3)
            .expand("q", 1)
            .await
            .unwrap_err();

        assert!(matches!(err, RagError::RemoteInference { .. }));
        assert_eq!(mock.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_template_mismatch_fails_before_calling_model() {
        let mock = Arc::new(MockInference::new());
        let model = ModelHandle::new(
            mock.clone(),
            Vendor::Cohere.adapter(),
            json!({"message": "{prompt}"}),
            false,
        )
        .unwrap();
        let expander = QueryExpander::new(model, Template::new("{question} {unknown}"), "", 3);

        let err = expander.expand("q", 1).await.unwrap_err();
        assert!(matches!(err, RagError::TemplateMismatch { .. }));
        assert!(mock.prompts().is_empty());
    }

    #[test]
    fn test_parse_expansion_rejects_non_string_values() {
        assert!(parse_expansion(r#"{"query_1": 3}"#).is_err());
        assert!(parse_expansion(r#"["query_1"]"#).is_err());
        assert!(parse_expansion("  {\"query_1\": \"a\"}\n").is_ok());
    }
}
