pub mod dispatch;
pub mod gateway;
pub mod integration;
pub mod locks;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod sandbox;
pub mod synthesizer;
pub mod validation;
pub mod versioning;

#[cfg(test)]
mod testing;

pub use dispatch::{invoke_module, parse_cli_args, run_capability};
pub use gateway::{
    AttemptFailure, AttemptObserver, ExpectedShape, Gateway, NoopObserver, ProviderGenerator, TextGenerator,
};
pub use integration::{IntegrationEngine, IntegrationReport, IntegrationResult, IntegrationStep};
pub use locks::{CapabilityGuard, CapabilityLocks, FileLock};
pub use orchestrator::{AddOutcome, CancelOutcome, Orchestrator, ResumeOutcome, WorkflowStatus};
pub use planner::{parse_plan, CapabilityPlanner};
pub use registry::{
    is_builtin_command, new_registry_handle, CommandRegistry, DispatchTarget, RegistryEntry, RegistryHandle,
    RegistryStatus, BUILTIN_COMMANDS,
};
pub use sandbox::Sandbox;
pub use synthesizer::{CodeSynthesizer, DeferredSynthesizer, GatewaySynthesizer};
pub use validation::ValidationRunner;
pub use versioning::{FileVersioning, VersionNotifier};
