use crate::error::{RagError, Result};
use crate::prompt::{Template, bindings};
use crate::rag::client::ModelHandle;
use crate::rag::expansion::{QueryExpander, SEED_KEY};
use crate::rag::parallel::ParallelRetrieval;
use crate::rag::relevance::RelevanceFilter;
use crate::rag::retriever::{Passage, Retriever, get_contexts, get_multiple_contexts};
use crate::rag::vendor::StreamMetadata;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Expand,
    Retrieve,
    Filter,
    Assemble,
    Generate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Expand => write!(f, "expand"),
            Stage::Retrieve => write!(f, "retrieve"),
            Stage::Filter => write!(f, "filter"),
            Stage::Assemble => write!(f, "assemble"),
            Stage::Generate => write!(f, "generate"),
        }
    }
}

/// Everything one run produced. Nothing is kept once this is returned.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query: String,
    pub text: String,
    pub queries: HashMap<String, String>,
    pub passages: Vec<Passage>,
    pub prompt: String,
    pub metadata: Option<StreamMetadata>,
}

/// Expand -> Retrieve -> (Filter) -> Assemble -> Generate.
///
/// Without an expander the seed query is retrieved alone; without a
/// relevance filter the Filter stage is skipped.
pub struct RagPipeline {
    retriever: Arc<dyn Retriever>,
    retrieval: ParallelRetrieval,
    k: usize,
    expander: Option<(QueryExpander, usize)>,
    relevance: Option<RelevanceFilter>,
    generator: ModelHandle,
    template: Template,
}

impl RagPipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: ModelHandle,
        template: Template,
        k: usize,
        max_workers: usize,
    ) -> Self {
        Self {
            retrieval: ParallelRetrieval::new(retriever.clone(), max_workers, k),
            retriever,
            k,
            expander: None,
            relevance: None,
            generator,
            template,
        }
    }

    pub fn with_expansion(mut self, expander: QueryExpander, n_queries: usize) -> Self {
        self.expander = Some((expander, n_queries));
        self
    }

    pub fn with_relevance(mut self, filter: RelevanceFilter) -> Self {
        self.relevance = Some(filter);
        self
    }

    pub fn relevance_enabled(&self) -> bool {
        self.relevance.is_some()
    }

    pub fn retriever(&self) -> &dyn Retriever {
        self.retriever.as_ref()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub async fn expand(&self, query: &str) -> Result<HashMap<String, String>> {
        match &self.expander {
            Some((expander, n)) => expander
                .expand(query, *n)
                .await
                .map_err(|e| stage_failed(Stage::Expand, e)),
            None => Ok(HashMap::from([(SEED_KEY.to_string(), query.to_string())])),
        }
    }

    pub async fn run(&self, query: &str) -> Result<Answer> {
        let span = info_span!("rag_run", run_id = %Uuid::new_v4(), mode = "advanced");
        async {
            info!(stage = %Stage::Expand, "Expanding query");
            let queries = self.expand(query).await?;

            info!(stage = %Stage::Retrieve, queries = queries.len(), "Retrieving passages");
            let results = self.retrieval.retrieve_all(&queries).await;
            let mut passages = get_multiple_contexts(&results);
            if passages.is_empty() {
                warn!(stage = %Stage::Retrieve, "No passages retrieved for any query");
            }

            if let Some(filter) = &self.relevance {
                info!(stage = %Stage::Filter, passages = passages.len(), "Filtering passages");
                passages = filter
                    .filter_passages(&passages, query)
                    .await
                    .map_err(|e| stage_failed(Stage::Filter, e))?;
            }

            self.answer(query, queries, passages).await
        }
        .instrument(span)
        .await
    }

    /// Single retrieval for the seed query, no expansion and no filtering.
    /// A retrieval error ends the run.
    pub async fn run_naive(&self, query: &str) -> Result<Answer> {
        let span = info_span!("rag_run", run_id = %Uuid::new_v4(), mode = "naive");
        async {
            info!(stage = %Stage::Retrieve, "Retrieving passages");
            let results = self
                .retriever
                .retrieve(query, self.k)
                .await
                .map_err(|e| stage_failed(Stage::Retrieve, e))?;
            let queries = HashMap::from([(SEED_KEY.to_string(), query.to_string())]);

            self.answer(query, queries, get_contexts(&results)).await
        }
        .instrument(span)
        .await
    }

    pub fn assemble(&self, query: &str, passages: &[Passage]) -> Result<String> {
        self.template
            .fill(&bindings([
                ("contexts", format_contexts(passages)),
                ("query", query.to_string()),
            ]))
            .map_err(|e| stage_failed(Stage::Assemble, e))
    }

    async fn answer(
        &self,
        query: &str,
        queries: HashMap<String, String>,
        passages: Vec<Passage>,
    ) -> Result<Answer> {
        info!(stage = %Stage::Assemble, passages = passages.len(), "Assembling prompt");
        let prompt = self.assemble(query, &passages)?;

        info!(stage = %Stage::Generate, "Generating answer");
        let completion = self
            .generator
            .complete(&prompt)
            .await
            .map_err(|e| stage_failed(Stage::Generate, e))?;

        Ok(Answer {
            query: query.to_string(),
            text: completion.text,
            queries,
            passages,
            prompt,
            metadata: completion.metadata,
        })
    }
}

pub fn format_contexts(passages: &[Passage]) -> String {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[Context {}]:\n{}\n", i + 1, p))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn stage_failed(stage: Stage, err: RagError) -> RagError {
    error!(stage = %stage, error = %err, "Pipeline stage failed");
    err
}
