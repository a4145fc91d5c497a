use kbrag::error::RagError;
use kbrag::prompt::Template;
use kbrag::rag::mock::{MockInference, MockRetriever};
use kbrag::rag::{ModelHandle, QueryExpander, RagPipeline, RelevanceFilter, Vendor};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

const ANSWER_TEMPLATE: &str = "Use the contexts below.\n{contexts}\n\nQuestion: {query}";
const EXPANSION_TEMPLATE: &str =
    "Give {n_queries} rephrasings of: {question}\nReply only with JSON like {output_format}";
const RELEVANCE_TEMPLATE: &str =
    "Is this relevant?\n{context}\nQuestion: {question}\n{format_instructions}";

fn claude_skeleton() -> serde_json::Value {
    json!({
        "anthropic_version": "bedrock-2023-05-31",
        "max_tokens": 1000,
        "messages": [
            {"role": "user", "content": [{"type": "text", "text": "{prompt}"}]}
        ]
    })
}

fn claude_expansion_skeleton() -> serde_json::Value {
    json!({
        "anthropic_version": "bedrock-2023-05-31",
        "max_tokens": 500,
        "messages": [
            {"role": "user", "content": [{"type": "text", "text": "{prompt}"}]},
            {"role": "assistant", "content": [{"type": "text", "text": "{"}]}
        ]
    })
}

struct Harness {
    expansion_llm: Arc<MockInference>,
    generation_llm: Arc<MockInference>,
    retriever: Arc<MockRetriever>,
}

impl Harness {
    fn new(retriever: MockRetriever) -> Self {
        Self {
            expansion_llm: Arc::new(MockInference::new()),
            generation_llm: Arc::new(MockInference::new()),
            retriever: Arc::new(retriever),
        }
    }

    fn pipeline(&self) -> RagPipeline {
        let generator = ModelHandle::new(
            self.generation_llm.clone(),
            Vendor::Claude.adapter(),
            claude_skeleton(),
            false,
        )
        .unwrap();
        let expansion_model = ModelHandle::new(
            self.expansion_llm.clone(),
            Vendor::Claude.adapter(),
            claude_expansion_skeleton(),
            false,
        )
        .unwrap();
        let expander = QueryExpander::new(
            expansion_model,
            Template::new(EXPANSION_TEMPLATE),
            r#"{"query_1": "..."}"#,
            3,
        );

        RagPipeline::new(
            self.retriever.clone(),
            generator,
            Template::new(ANSWER_TEMPLATE),
            5,
            5,
        )
        .with_expansion(expander, 2)
    }
}

#[tokio::test]
async fn test_end_to_end_without_relevance() {
    let harness = Harness::new(MockRetriever::new(2));
    // Claude output continues the prefilled "{".
    harness
        .expansion_llm
        .push_text(r#""query_1": "Define X", "query_2": "Explain X"}"#);
    harness.generation_llm.push_text("X is a thing.");

    let answer = harness.pipeline().run("What is X?").await.unwrap();

    assert_eq!(answer.text, "X is a thing.");
    assert_eq!(answer.queries.len(), 3);
    assert_eq!(answer.queries["query_0"], "What is X?");

    assert_eq!(answer.passages.len(), 6);
    for query in ["What is X?", "Define X", "Explain X"] {
        for i in 0..2 {
            let passage = MockRetriever::passage(query, i);
            assert!(answer.prompt.contains(&passage), "missing {passage}");
        }
    }
    assert!(answer.prompt.contains("Question: What is X?"));

    let requests = harness.generation_llm.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].prompt_text(), Some(answer.prompt.as_str()));
    assert_eq!(
        requests[0].body()["messages"][0]["content"][0]["text"],
        answer.prompt.as_str()
    );
    assert_eq!(requests[0].body()["max_tokens"], 1000);

    let retrieved: HashSet<String> = harness
        .retriever
        .calls()
        .into_iter()
        .map(|(q, _)| q)
        .collect();
    assert_eq!(
        retrieved,
        HashSet::from([
            "What is X?".to_string(),
            "Define X".to_string(),
            "Explain X".to_string()
        ])
    );
}

#[tokio::test]
async fn test_end_to_end_with_relevance_filter() {
    let harness = Harness::new(MockRetriever::new(2));
    harness
        .expansion_llm
        .push_text(r#""query_1": "Define X"}"#);
    harness.generation_llm.push_text("Filtered answer.");

    // Keep only passages retrieved for the expanded query.
    let judge_llm = Arc::new(MockInference::with_responder(|prompt| {
        Ok(if prompt.contains("Define X :: passage") {
            "True".to_string()
        } else {
            "False".to_string()
        })
    }));
    let judge = ModelHandle::new(judge_llm.clone(), Vendor::Claude.adapter(), claude_skeleton(), false)
        .unwrap();
    let filter = RelevanceFilter::new(
        judge,
        Template::new(RELEVANCE_TEMPLATE),
        "Answer strictly True or False.",
        10,
    );

    let pipeline = harness.pipeline().with_relevance(filter);
    let answer = pipeline.run("What is X?").await.unwrap();

    let kept: HashSet<_> = answer.passages.iter().cloned().collect();
    assert_eq!(
        kept,
        HashSet::from([
            MockRetriever::passage("Define X", 0),
            MockRetriever::passage("Define X", 1)
        ])
    );
    assert_eq!(judge_llm.prompts().len(), 4);
    assert!(!answer.prompt.contains(&MockRetriever::passage("What is X?", 0)));
    assert_eq!(answer.text, "Filtered answer.");
}

#[tokio::test]
async fn test_partial_retrieval_failure_still_answers() {
    let harness = Harness::new(MockRetriever::new(2).fail_on("Define X", "ThrottlingException"));
    harness
        .expansion_llm
        .push_text(r#""query_1": "Define X", "query_2": "Explain X"}"#);
    harness.generation_llm.push_text("Partial answer.");

    let answer = harness.pipeline().run("What is X?").await.unwrap();

    assert_eq!(answer.passages.len(), 4);
    assert!(!answer.prompt.contains("Define X :: passage"));
    assert_eq!(answer.text, "Partial answer.");
}

#[tokio::test]
async fn test_expansion_exhaustion_aborts_run() {
    let harness = Harness::new(MockRetriever::new(2));
    for _ in 0..3 {
        harness.expansion_llm.push_text("I cannot produce JSON today.");
    }

    let err = harness.pipeline().run("What is X?").await.unwrap_err();

    assert!(matches!(err, RagError::ExpansionExhausted { attempts: 3, .. }));
    assert_eq!(harness.expansion_llm.prompts().len(), 3);
    assert!(harness.retriever.calls().is_empty());
    assert!(harness.generation_llm.prompts().is_empty());
}

#[tokio::test]
async fn test_streaming_generation_reports_metadata() {
    let retriever = Arc::new(MockRetriever::new(1));
    let llm = Arc::new(MockInference::new());
    llm.push_stream(vec!["Streamed ", "answer."], Some("end_turn"));

    let generator =
        ModelHandle::new(llm.clone(), Vendor::Claude.adapter(), claude_skeleton(), true).unwrap();
    let pipeline = RagPipeline::new(retriever, generator, Template::new(ANSWER_TEMPLATE), 5, 5);

    let answer = pipeline.run_naive("What is X?").await.unwrap();

    assert_eq!(answer.text, "Streamed answer.");
    assert!(!answer.text.contains("end_turn"));
    assert_eq!(
        answer.metadata.and_then(|m| m.stop_reason).as_deref(),
        Some("end_turn")
    );
}
