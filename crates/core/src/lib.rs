pub mod capability;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod paths;
pub mod types;

pub use capability::{
    parse_mcp_config, validate_capability_name, CapabilityRequest, CheckKind, CliArgument, CliIntegration, Finding,
    FunctionSpec, Module, ParameterSpec, Plan, PlanKind, Scenario, SourceArtifact, ValidationResult,
};
pub use config::{Config, LockPolicy};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleState, Outcome, Replay, Stage, TmsEntry};
pub use paths::Paths;
pub use types::{ChatMessage, LLMResponse};
