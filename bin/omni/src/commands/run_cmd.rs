use omni_acquisition::parse_cli_args;
use serde_json::Value;

/// Invoke an acquired command with CLI arguments.
pub async fn run(name: &str, args: &[String]) -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    let result = orchestrator.run(name, &parse_cli_args(args)).await?;
    match result {
        Value::String(s) => println!("{}", s),
        Value::Null => {}
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}
