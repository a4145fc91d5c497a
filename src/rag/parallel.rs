use crate::rag::fanout::fan_out;
use crate::rag::retriever::{Passage, Retriever, get_contexts};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_RETRIEVAL_WORKERS: usize = 5;

/// Query key -> passages, or the stringified error for that query.
pub type QueryResultMap = HashMap<String, Result<Vec<Passage>, String>>;

/// Fans expanded queries out to one shared retriever.
#[derive(Clone)]
pub struct ParallelRetrieval {
    retriever: Arc<dyn Retriever>,
    max_workers: usize,
    k: usize,
}

impl ParallelRetrieval {
    pub fn new(retriever: Arc<dyn Retriever>, max_workers: usize, k: usize) -> Self {
        Self {
            retriever,
            max_workers,
            k,
        }
    }

    /// Never fails as a whole: a failing query only poisons its own entry.
    pub async fn retrieve_all(&self, queries: &HashMap<String, String>) -> QueryResultMap {
        let items = queries.iter().map(|(key, text)| (key.clone(), text.clone()));
        let k = self.k;

        let results = fan_out(items, self.max_workers, |text| {
            let retriever = self.retriever.clone();
            async move { retriever.retrieve(&text, k).await }
        })
        .await;

        let mut map = QueryResultMap::with_capacity(results.len());
        for (key, outcome) in results {
            let entry = match outcome {
                Ok(hits) => Ok(get_contexts(&hits)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Retrieval failed for query");
                    Err(e.to_string())
                }
            };
            map.insert(key, entry);
        }

        let failed = map.values().filter(|r| r.is_err()).count();
        info!(queries = map.len(), failed, "Parallel retrieval finished");
        map
    }
}
