//! CLI subcommand handlers.

use crate::Commands;
use crate::scenario::Scenario;
use std::path::Path;
use std::sync::Arc;
use triage_core::{InMemoryInventory, IncidentStore, Orchestrator, TriageConfig};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Run { scenario } => {
            let scenario = Scenario::load(&scenario)?;
            run_scenario(scenario, workspace).await
        }
        Commands::Demo => run_scenario(Scenario::demo(), workspace).await,
        Commands::Config => {
            let config = load(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn load(workspace: &Path) -> anyhow::Result<TriageConfig> {
    let config = triage_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.validate()?;
    Ok(config)
}

async fn run_scenario(scenario: Scenario, workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let store = IncidentStore::from_config(&config.store)?;
    let inventory = Arc::new(InMemoryInventory::new(scenario.depots.clone()));
    let orchestrator = Orchestrator::new(
        &config,
        Arc::new(store),
        scenario.registry(&config),
        inventory,
        scenario.dispatcher(&config),
    )?;

    let incident = orchestrator.report_incident(scenario.report()).await?;
    let summary = orchestrator.run_cycle(&incident.id).await?;
    let incident = orchestrator.incident(&incident.id).await?;
    println!("{}", serde_json::to_string_pretty(&incident)?);

    if let Some(cause) = &summary.failure {
        anyhow::bail!(
            "Incident {} failed during {}: {}",
            summary.incident_id,
            cause.stage,
            cause.message
        );
    }
    eprintln!(
        "Incident {} is {} after cycle {} (severity {})",
        summary.incident_id,
        summary.status,
        summary.cycle,
        summary
            .severity
            .map_or_else(|| "unassessed".to_string(), |s| s.to_string())
    );
    Ok(())
}
