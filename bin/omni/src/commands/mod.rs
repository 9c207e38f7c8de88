pub mod add;
pub mod cancel;
pub mod disable;
pub mod list;
pub mod plan;
pub mod resume;
pub mod run_cmd;
pub mod status;
pub mod transactions;
pub mod version;

use async_trait::async_trait;
use omni_acquisition::{AddOutcome, Orchestrator, TextGenerator, WorkflowStatus};
use omni_core::{Config, Error, Paths};
use std::sync::Arc;

/// Stands in for the model on commands that never reach the gateway,
/// so `status`/`list`/`run` work without provider credentials.
struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    async fn generate(&self, _prompt: &str) -> omni_core::Result<String> {
        Err(Error::Provider("no model is configured for this command".to_string()))
    }
}

/// Orchestrator wired to the configured provider.
pub fn open() -> anyhow::Result<Orchestrator> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    Ok(Orchestrator::from_config(paths, config)?)
}

/// Orchestrator for read-side and dispatch commands.
pub fn open_offline() -> anyhow::Result<Orchestrator> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    Ok(Orchestrator::new(paths, config, Arc::new(OfflineGenerator))?)
}

/// Print a finished workflow; errors out for outcomes that did not complete.
pub fn print_outcome(outcome: &AddOutcome) -> anyhow::Result<()> {
    let name = &outcome.capability_name;
    match &outcome.status {
        WorkflowStatus::PlanReady => {
            println!("✓ Plan for '{}' is ready (code synthesis is disabled)", name);
            println!("  Inspect it with: omni show-plan {}", name);
        }
        WorkflowStatus::Integrated { agent_version } => {
            println!("✓ '{}' integrated; agent is now v{}", name, agent_version);
            println!("  Try it: omni run {}", name);
        }
        WorkflowStatus::Failed { stage, reason } => {
            println!("✗ '{}' failed during {}: {}", name, stage, reason);
        }
        WorkflowStatus::RolledBack { reason } => {
            println!("✗ '{}' was rolled back: {}", name, reason);
        }
        WorkflowStatus::Cancelled => {
            println!("⚠ '{}' was cancelled", name);
        }
        WorkflowStatus::Rejected { reason } => {
            println!("✗ Request rejected: {}", reason);
        }
    }
    println!("  request {} · log entries {:?}", outcome.request_id, outcome.sequence_ids);

    match outcome.status {
        WorkflowStatus::PlanReady | WorkflowStatus::Integrated { .. } | WorkflowStatus::Cancelled => Ok(()),
        _ => anyhow::bail!("workflow for '{}' did not complete", name),
    }
}
