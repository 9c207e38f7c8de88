pub async fn run(name: &str) -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    let plan = orchestrator.plan(name)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
