use omni_acquisition::ResumeOutcome;

pub async fn run(name: &str) -> anyhow::Result<()> {
    let orchestrator = super::open()?;
    match orchestrator.resume(name).await? {
        ResumeOutcome::Resumed(outcome) => super::print_outcome(&outcome),
        ResumeOutcome::Nothing(state) => {
            println!("✓ Nothing to resume: '{}' is {}", name, state);
            Ok(())
        }
    }
}
