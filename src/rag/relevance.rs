use crate::error::Result;
use crate::prompt::{Template, bindings};
use crate::rag::client::ModelHandle;
use crate::rag::fanout::fan_out;
use crate::rag::retriever::Passage;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_RELEVANCE_WORKERS: usize = 10;

/// The only judge output that keeps a passage.
pub const RELEVANT: &str = "True";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptContextPair {
    pub prompt: String,
    pub context: Passage,
}

/// Binary LLM judge over retrieved passages. Fails closed: anything other
/// than an exact `"True"` drops the passage, including judge errors.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    judge: ModelHandle,
    template: Template,
    format_instructions: String,
    max_workers: usize,
}

impl RelevanceFilter {
    pub fn new(
        judge: ModelHandle,
        template: Template,
        format_instructions: impl Into<String>,
        max_workers: usize,
    ) -> Self {
        Self {
            judge,
            template,
            format_instructions: format_instructions.into(),
            max_workers,
        }
    }

    /// One judge prompt per passage, each paired with the passage it judges.
    pub fn create_prompts_for_relevance_eval(
        &self,
        passages: &[Passage],
        question: &str,
    ) -> Result<Vec<PromptContextPair>> {
        passages
            .iter()
            .map(|context| {
                let prompt = self.template.fill(&bindings([
                    ("context", context.clone()),
                    ("question", question.to_string()),
                    ("format_instructions", self.format_instructions.clone()),
                ]))?;
                Ok(PromptContextPair {
                    prompt,
                    context: context.clone(),
                })
            })
            .collect()
    }

    /// Survivors of the judgment, in no particular order.
    pub async fn filter(&self, pairs: Vec<PromptContextPair>) -> Vec<Passage> {
        let total = pairs.len();
        let items = pairs.into_iter().enumerate();

        let judged = fan_out(items, self.max_workers, |pair: PromptContextPair| {
            let judge = self.judge.clone();
            async move {
                let verdict = judge.generate(&pair.prompt).await?;
                Ok::<_, crate::error::RagError>((verdict, pair.context))
            }
        })
        .await;

        let mut kept = Vec::new();
        for (index, outcome) in judged {
            match outcome {
                Ok((verdict, context)) if verdict == RELEVANT => kept.push(context),
                Ok((verdict, _)) => {
                    debug!(index, verdict = %verdict, "Passage judged not relevant")
                }
                Err(e) => warn!(index, error = %e, "Relevance judgment failed, dropping passage"),
            }
        }

        info!(total, kept = kept.len(), "Relevance filtering finished");
        kept
    }

    /// Build the prompts and filter in one step.
    pub async fn filter_passages(&self, passages: &[Passage], question: &str) -> Result<Vec<Passage>> {
        let pairs = self.create_prompts_for_relevance_eval(passages, question)?;
        Ok(self.filter(pairs).await)
    }
}
