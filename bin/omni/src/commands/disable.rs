pub async fn run(name: &str) -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    let ids = orchestrator.disable(name).await?;
    println!("✓ '{}' disabled (log entries {:?})", name, ids);
    Ok(())
}
