use omni_acquisition::{AddOutcome, Orchestrator};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// `omni add <name> "<description>"`; Ctrl-C cancels at the next stage boundary.
pub async fn run(name: &str, description: &str) -> anyhow::Result<()> {
    let orchestrator = Arc::new(super::open()?);
    println!("🧩 Acquiring '{}' ...", name);

    let task = {
        let orchestrator = orchestrator.clone();
        let name = name.to_string();
        let description = description.to_string();
        tokio::spawn(async move { orchestrator.add(&name, &description).await })
    };
    supervise(&orchestrator, name, task).await
}

/// `omni add_mcp_tool <tool_name> <mcp_config_json> "<description>"`.
pub async fn run_mcp_tool(tool_name: &str, mcp_config_json: &str, description: &str) -> anyhow::Result<()> {
    let orchestrator = Arc::new(super::open()?);
    println!("🧩 Planning MCP tool integration '{}' ...", tool_name);

    let task = {
        let orchestrator = orchestrator.clone();
        let name = tool_name.to_string();
        let config = mcp_config_json.to_string();
        let description = description.to_string();
        tokio::spawn(async move { orchestrator.add_mcp_tool(&name, &config, &description).await })
    };
    supervise(&orchestrator, tool_name, task).await
}

async fn supervise(
    orchestrator: &Orchestrator,
    name: &str,
    mut task: JoinHandle<omni_core::Result<AddOutcome>>,
) -> anyhow::Result<()> {
    let finished = tokio::select! {
        joined = &mut task => Some(joined??),
        _ = tokio::signal::ctrl_c() => None,
    };

    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            match orchestrator.cancel(name) {
                Ok(_) => println!("⏹ Cancelling '{}' ...", name),
                Err(e) => println!("⚠ {}; waiting for the workflow to finish", e),
            }
            task.await??
        }
    };

    super::print_outcome(&outcome)
}
