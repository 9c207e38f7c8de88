use omni_core::Replay;

fn print_replay(name: &str, replay: &Replay) {
    let versioned = if replay.versioned { " (versioned)" } else { "" };
    println!(
        "  {:<24} {:<22} request {} · last entry #{}{}",
        name,
        replay.state.to_string(),
        replay.request_id,
        replay.last_sequence_id,
        versioned
    );
}

pub async fn run(name: Option<&str>) -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;

    match name {
        Some(name) => match orchestrator.status(name)? {
            Some(replay) => {
                println!("Capability status");
                print_replay(name, &replay);
            }
            None => println!("✗ No workflow recorded for '{}'", name),
        },
        None => {
            let all = orchestrator.status_all()?;
            println!("Capabilities ({})", all.len());
            if all.is_empty() {
                println!("  (none yet; try: omni add <name> \"<description>\")");
            }
            for (name, replay) in &all {
                print_replay(name, replay);
            }
        }
    }

    println!();
    println!("Agent version: v{}", orchestrator.agent_version());
    println!("Home: {}", orchestrator.paths().base.display());
    Ok(())
}
