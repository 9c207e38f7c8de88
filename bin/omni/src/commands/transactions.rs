pub async fn run(capability: Option<&str>, from: Option<u64>, to: Option<u64>, json: bool) -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    let entries = orchestrator.transactions(capability, from, to)?;

    if json {
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }

    if entries.is_empty() {
        println!("(no transactions)");
        return Ok(());
    }
    for e in &entries {
        let icon = match e.outcome {
            omni_core::Outcome::Success => "✓",
            omni_core::Outcome::Failure => "✗",
            omni_core::Outcome::InProgress => "…",
            omni_core::Outcome::Cancelled => "⏹",
            omni_core::Outcome::RolledBack => "↩",
        };
        println!(
            "#{:<5} {} {} {:<16} {:<11} {:<11} v{} {}",
            e.sequence_id,
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            icon,
            e.capability_name,
            e.stage.to_string(),
            e.outcome.to_string(),
            e.agent_version,
            e.detail
        );
    }
    Ok(())
}
