use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "deltaflow")]
#[command(author, version, about = "Data-pipeline orchestration engine")]
pub struct Cli {
    /// Path to engine config file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a flow plan document
    Validate {
        /// Flow plans (.toml or .json)
        #[arg(required = true)]
        flows: PathBuf,
    },

    /// Run items through the flows with stand-in action workers
    Simulate {
        /// Flow plans (.toml or .json)
        #[arg(short, long, required = true)]
        flows: PathBuf,

        /// Data source to ingest into
        #[arg(short, long)]
        data_source: String,

        /// Files to ingest, one item each
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Metadata attached to every item, as key=value
        #[arg(short, long = "metadata", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective engine configuration
    Config,

    /// Display version information
    Version,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}
