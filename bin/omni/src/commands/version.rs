use omni_acquisition::FileVersioning;

pub async fn run() -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    println!("omni v{}", orchestrator.agent_version());
    println!("  binary: v{}", env!("CARGO_PKG_VERSION"));

    let history = FileVersioning::open(orchestrator.paths().version_file())?.history();
    if !history.is_empty() {
        println!();
        println!("History:");
        for record in &history {
            println!(
                "  {} v{} → v{}  +{}",
                record.at.format("%Y-%m-%d %H:%M"),
                record.from_version,
                record.to_version,
                record.capability_name
            );
        }
    }
    Ok(())
}
