mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands};
use deltaflow::simulate::{Simulation, SimulationReport};
use df_content::{Content, ContentStore, InMemoryContentStore};
use df_core::config::Config;
use df_model::Metadata;
use df_router::IngressRequest;
use df_rules::FlowPlans;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "deltaflow=debug,df_router=debug,df_rules=debug,df_model=debug".to_string()
        } else {
            "info".to_string()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default(cli.config.as_deref());

    match cli.command {
        Commands::Validate { flows } => validate_flows(&flows),
        Commands::Simulate {
            flows,
            data_source,
            inputs,
            metadata,
            json,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            let metadata: Metadata = metadata.into_iter().collect();
            rt.block_on(simulate(config, &flows, data_source, &inputs, metadata, json))
        }
        Commands::Config => {
            for warning in config.validate() {
                tracing::warn!("{warning}");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Version => {
            println!("deltaflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_flows(path: &Path) -> Result<FlowPlans> {
    let plans = FlowPlans::load(path)
        .with_context(|| format!("failed to read flow plans from {}", path.display()))?;
    plans
        .validate()
        .with_context(|| format!("invalid flow plans in {}", path.display()))?;
    Ok(plans)
}

fn validate_flows(path: &Path) -> Result<()> {
    println!("Validating flow plans: {}", path.display());
    let plans = load_flows(path)?;
    println!("✓ Flow plans are valid");
    for plan in &plans.plans {
        println!(
            "  {:<24} {:<18} {} action(s){}",
            plan.name,
            format!("{:?}", plan.flow_type),
            plan.actions.len(),
            if plan.enabled { "" } else { " (disabled)" }
        );
    }
    Ok(())
}

async fn simulate(
    config: Config,
    flows: &Path,
    data_source: String,
    inputs: &[std::path::PathBuf],
    metadata: Metadata,
    json: bool,
) -> Result<()> {
    let plans = load_flows(flows)?;
    let simulation = Simulation::new(plans, config);
    let store = InMemoryContentStore::new();

    for input in inputs {
        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("failed to read {}", input.display()))?;
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        let segment = store.put(Bytes::from(bytes)).await?;
        let content = Content::new(&name, df_content::content::DEFAULT_MEDIA_TYPE, vec![segment]);
        simulation
            .ingest(IngressRequest {
                data_source: data_source.clone(),
                name,
                content: vec![content],
                metadata: metadata.clone(),
            })
            .await
            .with_context(|| format!("failed to ingest {}", input.display()))?;
    }

    let report = simulation.run().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!(
        "Answered {} invocation(s), {} rejected",
        report.steps, report.rejected
    );
    for item in &report.items {
        println!("{} {} [{}]", item.did, item.name, item.stage);
        for flow in &item.flows {
            let actions: Vec<String> = flow
                .actions
                .iter()
                .map(|a| format!("{}:{}", a.name, a.state))
                .collect();
            println!(
                "  #{} {:<20} {:?} {}",
                flow.id,
                flow.name,
                flow.state,
                actions.join(" -> ")
            );
            if let Some(cause) = &flow.error_or_filter_cause {
                println!("      cause: {cause}");
            }
        }
    }
}
