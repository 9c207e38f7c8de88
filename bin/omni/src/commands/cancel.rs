use omni_acquisition::CancelOutcome;

pub async fn run(name: &str) -> anyhow::Result<()> {
    let orchestrator = super::open_offline()?;
    match orchestrator.cancel(name)? {
        CancelOutcome::Signalled { request_id } => {
            println!("✓ Cancellation signalled for '{}' (request {})", name, request_id);
        }
        CancelOutcome::Recorded {
            request_id,
            sequence_id,
        } => {
            println!(
                "✓ Workflow for '{}' cancelled (request {}, log entry #{})",
                name, request_id, sequence_id
            );
        }
    }
    Ok(())
}
