use omni_acquisition::BUILTIN_COMMANDS;

pub async fn run() -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    let entries = orchestrator.list().await;

    println!("Built-in commands: {}", BUILTIN_COMMANDS.join(", "));
    println!();
    println!("Acquired commands ({})", entries.len());
    for entry in &entries {
        let icon = match entry.status {
            omni_acquisition::RegistryStatus::Active => "✓",
            omni_acquisition::RegistryStatus::Disabled => "⏸",
            omni_acquisition::RegistryStatus::Incomplete => "⚠",
        };
        println!(
            "  {} {:<24} {:<10} entry {}() · since v{} · {}",
            icon,
            entry.capability_name,
            entry.status.to_string(),
            entry.dispatch_target.entry_function,
            entry.agent_version,
            entry.registered_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
