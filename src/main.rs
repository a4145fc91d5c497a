use anyhow::{Context, Result};
use clap::Parser;
use kbrag::cli::{Cli, Commands};
use kbrag::config::Config;
use kbrag::prompt::Template;
use kbrag::config::ModelConfig;
use kbrag::rag::{
    Answer, AuthResolver, KnowledgeBaseRetriever, ModelHandle, QueryExpander, RagPipeline,
    RelevanceFilter, Retriever,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    if let Some(kb_id) = cli.kb_id {
        config.knowledge_base.kb_id = kb_id;
    }
    if let Some(region) = cli.region {
        config.knowledge_base.region = region;
    }

    match cli.command {
        Commands::Run { query, relevance_eval, json } => {
            handle_run(&config, query, relevance_eval, json).await?
        }
        Commands::Naive { query, json } => handle_naive(&config, query, json).await?,
        Commands::Expand { query, json } => handle_expand(&config, query, json).await?,
        Commands::Search { query, limit } => handle_search(&config, query, limit).await?,
    }

    Ok(())
}

async fn init_retriever(config: &Config, auth: &AuthResolver) -> Result<Arc<dyn Retriever>> {
    let kb = &config.knowledge_base;
    let auth = auth.resolve(kb.auth, None).await?;
    let retriever = KnowledgeBaseRetriever::new(&kb.endpoint(), &kb.kb_id, auth, config.timeout())?;
    tracing::info!("Using knowledge base {} in {}", kb.kb_id, kb.region);
    Ok(Arc::new(retriever))
}

async fn init_model(config: &Config, model: &ModelConfig, auth: &AuthResolver) -> Result<ModelHandle> {
    let auth = auth
        .resolve(model.auth_mode(), model.api_key_env.as_deref())
        .await
        .with_context(|| format!("no credentials for model {}", model.model_id))?;
    Ok(ModelHandle::from_config(model, &config.knowledge_base.region, config.timeout(), auth)?)
}

async fn init_expander(config: &Config, auth: &AuthResolver) -> Result<Option<(QueryExpander, usize)>> {
    let Some(expansion) = &config.expansion else {
        return Ok(None);
    };

    let model = init_model(config, &expansion.model, auth).await?;
    let expander = QueryExpander::new(
        model,
        Template::new(expansion.model.template.as_str()),
        expansion.output_format.as_str(),
        expansion.retries,
    );
    Ok(Some((expander, expansion.n_queries)))
}

async fn init_pipeline(config: &Config, relevance_eval: bool) -> Result<RagPipeline> {
    let auth = AuthResolver::new(config.knowledge_base.region.as_str());
    let generator = init_model(config, &config.generation, &auth).await?;

    let mut pipeline = RagPipeline::new(
        init_retriever(config, &auth).await?,
        generator,
        Template::new(config.generation.template.as_str()),
        config.knowledge_base.results_per_query,
        config.knowledge_base.max_workers,
    );

    if let Some((expander, n_queries)) = init_expander(config, &auth).await? {
        pipeline = pipeline.with_expansion(expander, n_queries);
    }

    if let Some(relevance) = config.relevance_stage(relevance_eval)? {
        let judge = init_model(config, &relevance.model, &auth).await?;
        pipeline = pipeline.with_relevance(RelevanceFilter::new(
            judge,
            Template::new(relevance.model.template.as_str()),
            relevance.format_instructions.as_str(),
            relevance.max_workers,
        ));
    }

    Ok(pipeline)
}

fn print_answer(answer: &Answer, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(answer)?);
    } else {
        println!("{}", answer.text);
    }
    Ok(())
}

async fn handle_run(config: &Config, query: Option<String>, relevance_eval: bool, json: bool) -> Result<()> {
    let query = query.unwrap_or_else(|| config.query.text.clone());
    let pipeline = init_pipeline(config, relevance_eval).await?;
    tracing::info!("Relevance evaluation: {}", pipeline.relevance_enabled());

    let answer = pipeline.run(&query).await.context("RAG pipeline failed")?;
    print_answer(&answer, json)
}

async fn handle_naive(config: &Config, query: Option<String>, json: bool) -> Result<()> {
    let query = query.unwrap_or_else(|| config.query.text.clone());
    let pipeline = init_pipeline(config, false).await?;

    let answer = pipeline.run_naive(&query).await.context("naive RAG failed")?;
    print_answer(&answer, json)
}

async fn handle_expand(config: &Config, query: Option<String>, json: bool) -> Result<()> {
    let query = query.unwrap_or_else(|| config.query.text.clone());
    let auth = AuthResolver::new(config.knowledge_base.region.as_str());
    let (expander, n_queries) = init_expander(config, &auth)
        .await?
        .context("no [expansion] section in the configuration")?;

    let queries = expander
        .expand(&query, n_queries)
        .await
        .context("query expansion failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&queries)?);
    } else {
        let mut keys: Vec<_> = queries.keys().collect();
        keys.sort();
        for key in keys {
            println!("{}: {}", key, queries[key]);
        }
    }

    Ok(())
}

async fn handle_search(config: &Config, query: Option<String>, limit: Option<usize>) -> Result<()> {
    let query = query.unwrap_or_else(|| config.query.text.clone());
    let limit = limit.unwrap_or(config.knowledge_base.results_per_query);
    let retriever = init_retriever(config, &AuthResolver::new(config.knowledge_base.region.as_str())).await?;

    let results = retriever.retrieve(&query, limit).await.context("retrieval failed")?;

    println!("Found {} results:\n", results.len());
    for (i, result) in results.iter().enumerate() {
        println!("--- Result {} ---", i + 1);
        println!("{}\n", result.text.chars().take(500).collect::<String>());
    }

    Ok(())
}
