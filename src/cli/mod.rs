use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kbrag")]
#[command(about = "Retrieval-augmented generation over a remote knowledge base", long_about = None)]
pub struct Cli {
    /// Knowledge base to retrieve from (overrides the config file)
    #[arg(long, global = true)]
    pub kb_id: Option<String>,
    /// Region of the knowledge base and models (overrides the config file)
    #[arg(long, global = true)]
    pub region: Option<String>,
    /// Config file; defaults to the platform config dir, then ./config.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Expand the query, retrieve in parallel, optionally filter, then answer
    Run {
        /// Question to answer instead of the configured one
        #[arg(short, long)]
        query: Option<String>,
        /// Judge every retrieved passage before answering
        #[arg(long)]
        relevance_eval: bool,
        #[arg(short, long)]
        json: bool,
    },
    /// Retrieve once for the query and answer
    Naive {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(short, long)]
        json: bool,
    },
    /// Print the expanded queries only
    Expand {
        #[arg(short, long)]
        query: Option<String>,
        #[arg(short, long)]
        json: bool,
    },
    /// Print retrieved passages only
    Search {
        #[arg(short, long)]
        query: Option<String>,
        /// Number of passages, at least 1
        #[arg(short, long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
        limit: Option<usize>,
    },
}
