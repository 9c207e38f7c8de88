use omni_core::{
    parse_mcp_config, CapabilityRequest, Config, Error, LifecycleState, Module, Outcome, Paths, Plan, Replay, Result,
    Stage, TmsEntry,
};
use omni_providers::create_provider;
use omni_storage::{ModuleStore, PlanStore, TransactionLog};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::run_capability;
use crate::gateway::{AttemptFailure, AttemptObserver, Gateway, ProviderGenerator, TextGenerator};
use crate::integration::{IntegrationEngine, IntegrationResult};
use crate::locks::CapabilityLocks;
use crate::planner::CapabilityPlanner;
use crate::registry::{new_registry_handle, CommandRegistry, RegistryEntry};
use crate::sandbox::Sandbox;
use crate::synthesizer::{CodeSynthesizer, DeferredSynthesizer, GatewaySynthesizer};
use crate::validation::ValidationRunner;
use crate::versioning::{FileVersioning, VersionNotifier};

/// How a workflow run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// Stopped at PLANNED because code synthesis is deferred.
    PlanReady,
    Integrated { agent_version: String },
    Failed { stage: Stage, reason: String },
    RolledBack { reason: String },
    Cancelled,
    /// Refused before any stage ran (bad name, name taken, name busy).
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub request_id: String,
    pub capability_name: String,
    pub status: WorkflowStatus,
    /// TMS entries written by this run, in order.
    pub sequence_ids: Vec<u64>,
}

#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    Resumed(AddOutcome),
    /// Nothing left to do; the replayed state is reported as-is.
    Nothing(LifecycleState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A running workflow in this process was told to stop at its next boundary.
    Signalled { request_id: String },
    /// A stalled workflow was closed with a cancelled entry.
    Recorded { request_id: String, sequence_id: u64 },
}

struct ActiveRun {
    request_id: String,
    token: CancellationToken,
    integrating: bool,
}

/// One workflow run: the request plus everything stages need to log against it.
struct Run {
    request: CapabilityRequest,
    token: CancellationToken,
    agent_version: String,
    ids: StdMutex<Vec<u64>>,
}

impl Run {
    fn push(&self, id: u64) {
        match self.ids.lock() {
            Ok(mut ids) => ids.push(id),
            Err(poisoned) => poisoned.into_inner().push(id),
        }
    }

    fn ids(&self) -> Vec<u64> {
        match self.ids.lock() {
            Ok(ids) => ids.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

enum Step {
    Plan,
    Code { round: u32, feedback: Option<String> },
    Validate { round: u32 },
    Integrate,
    Version { agent_version: String },
    Done(WorkflowStatus),
}

/// Writes every failed gateway attempt as an in-progress entry of `stage`.
struct StageObserver<'a> {
    tms: &'a TransactionLog,
    run: &'a Run,
    stage: Stage,
}

impl AttemptObserver for StageObserver<'_> {
    fn attempt_failed(&self, failure: &AttemptFailure) -> Result<()> {
        let id = self.tms.append(TmsEntry::new(
            &self.run.request.request_id,
            &self.run.request.name,
            self.stage,
            Outcome::InProgress,
            failure.to_string(),
            &self.run.agent_version,
        ))?;
        self.run.push(id);
        Ok(())
    }
}

/// Drives capability requests through planning, coding, validation,
/// integration and versioning, logging every transition before the next
/// stage begins.
pub struct Orchestrator {
    paths: Paths,
    config: Config,
    tms: Arc<TransactionLog>,
    plans: PlanStore,
    modules: ModuleStore,
    planner: CapabilityPlanner,
    synthesizer: Arc<dyn CodeSynthesizer>,
    validator: ValidationRunner,
    sandbox: Sandbox,
    integration: IntegrationEngine,
    versioning: Arc<dyn VersionNotifier>,
    locks: CapabilityLocks,
    active: StdMutex<HashMap<String, ActiveRun>>,
}

impl Orchestrator {
    pub fn new(paths: Paths, config: Config, generator: Arc<dyn TextGenerator>) -> Result<Self> {
        paths.ensure_dirs()?;
        let tms = Arc::new(TransactionLog::open(&paths)?);
        let registry = new_registry_handle(CommandRegistry::load(&paths.registry_file())?);
        let gateway = Arc::new(Gateway::new(generator, config.gateway.clone()));

        let synthesizer: Arc<dyn CodeSynthesizer> = if config.pipeline.synthesis_enabled {
            Arc::new(GatewaySynthesizer::new(gateway.clone()))
        } else {
            Arc::new(DeferredSynthesizer)
        };
        let versioning: Arc<dyn VersionNotifier> = Arc::new(FileVersioning::open(paths.version_file())?);
        let sandbox = Sandbox::new(config.sandbox.clone());

        info!(
            base = %paths.base.display(),
            synthesis = config.pipeline.synthesis_enabled,
            lock_policy = ?config.pipeline.lock_policy,
            "🧩 [acquire] orchestrator ready"
        );

        Ok(Self {
            plans: PlanStore::new(paths.clone()),
            modules: ModuleStore::new(paths.clone()),
            planner: CapabilityPlanner::new(gateway),
            synthesizer,
            validator: ValidationRunner::new(sandbox.clone()),
            integration: IntegrationEngine::new(tms.clone(), registry, paths.clone(), sandbox.clone()),
            sandbox,
            versioning,
            locks: CapabilityLocks::new(paths.locks_dir()),
            active: StdMutex::new(HashMap::new()),
            tms,
            paths,
            config,
        })
    }

    /// Build an orchestrator backed by the provider selected in `config`.
    pub fn from_config(paths: Paths, config: Config) -> Result<Self> {
        let provider = create_provider(&config)?;
        let generator = Arc::new(ProviderGenerator::new(provider));
        Self::new(paths, config, generator)
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn CodeSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_versioning(mut self, versioning: Arc<dyn VersionNotifier>) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn agent_version(&self) -> String {
        self.versioning.current_version()
    }

    // ---- request entry points -------------------------------------------

    /// Run a new `add <name> "<description>"` request to a terminal state.
    pub async fn add(&self, name: &str, description: &str) -> Result<AddOutcome> {
        self.admit(CapabilityRequest::new(name, description)).await
    }

    /// Run a new `add_mcp_tool <name> <mcp_config_json> "<description>"`
    /// request. The configuration must parse as a JSON object; otherwise the
    /// request is rejected before any stage runs.
    pub async fn add_mcp_tool(&self, name: &str, mcp_config_json: &str, description: &str) -> Result<AddOutcome> {
        match parse_mcp_config(mcp_config_json) {
            Ok(config) => self.admit(CapabilityRequest::mcp_tool(name, config, description)).await,
            Err(e) => {
                let request = CapabilityRequest::new(name, description);
                let raw = format!("add_mcp_tool {} {} \"{}\"", name, mcp_config_json, description);
                self.reject_raw(&request, &raw, &self.versioning.current_version(), e.to_string())
            }
        }
    }

    async fn admit(&self, request: CapabilityRequest) -> Result<AddOutcome> {
        let name = request.name.clone();
        let agent_version = self.versioning.current_version();

        if let Err(e) = request.validate() {
            return self.reject(&request, &agent_version, e.to_string());
        }

        let _guard = match self
            .locks
            .acquire_with_policy(&name, self.config.pipeline.lock_policy)
            .await
        {
            Ok(guard) => guard,
            Err(e @ Error::Busy(_)) => return self.reject(&request, &agent_version, e.to_string()),
            Err(e) => return Err(e),
        };

        if self.integration.registry().lock().await.contains(&name) {
            return self.reject(
                &request,
                &agent_version,
                format!("'{}' is already a registered command", name),
            );
        }
        if let Some(replay) = self.status(&name)? {
            if !replay.state.is_terminal() {
                return self.reject(
                    &request,
                    &agent_version,
                    format!("an unfinished workflow is {}; resume or cancel it first", replay.state),
                );
            }
        }

        let run = self.begin(request, agent_version);
        info!(capability = %name, request_id = %run.request.request_id, "🧩 [acquire] request accepted");
        let accepted = self.record(&run, Stage::Request, Outcome::InProgress, run.request.raw());
        let result = match accepted {
            Ok(_) => self.drive(&run, Step::Plan).await,
            Err(e) => Err(e),
        };
        self.finish(&run, result)
    }

    /// Continue the last workflow for `name` from its last durable stage.
    pub async fn resume(&self, name: &str) -> Result<ResumeOutcome> {
        let replay = self
            .status(name)?
            .ok_or_else(|| Error::NotFound(format!("no workflow recorded for '{}'", name)))?;
        let _guard = self.locks.try_acquire(name)?;
        // 拿到锁后重放一次，排除等待期间的变化
        let replay = self.status(name)?.unwrap_or(replay);
        info!(capability = %name, state = %replay.state, "🧩 [acquire] resuming");

        let step = match replay.state {
            LifecycleState::Requested | LifecycleState::Planning => Step::Plan,
            LifecycleState::Planned if self.synthesizer.is_deferred() => {
                return Ok(ResumeOutcome::Nothing(LifecycleState::Planned));
            }
            LifecycleState::Planned | LifecycleState::Coding => Step::Code { round: 1, feedback: None },
            LifecycleState::Coded | LifecycleState::Validating => Step::Validate { round: 1 },
            LifecycleState::Validated => Step::Integrate,
            LifecycleState::Integrating | LifecycleState::Failed(Stage::Integrating) => {
                return self.recover_integration(name, &replay).await;
            }
            LifecycleState::Integrated if !replay.versioned => Step::Version {
                agent_version: self.integrated_version(&replay.request_id)?,
            },
            state => return Ok(ResumeOutcome::Nothing(state)),
        };

        let request = self.recover_request(name, &replay.request_id)?;
        let run = self.begin(request, self.versioning.current_version());
        let result = self.drive(&run, step).await;
        self.finish(&run, result).map(ResumeOutcome::Resumed)
    }

    /// Replay the log for `name`.
    pub fn status(&self, name: &str) -> Result<Option<Replay>> {
        Ok(Replay::from_entries(&self.tms.query(name)?))
    }

    /// Replayed state of every capability that has log entries.
    pub fn status_all(&self) -> Result<BTreeMap<String, Replay>> {
        let mut grouped: BTreeMap<String, Vec<TmsEntry>> = BTreeMap::new();
        for entry in self.tms.all()? {
            grouped.entry(entry.capability_name.clone()).or_default().push(entry);
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(name, entries)| Replay::from_entries(&entries).map(|r| (name, r)))
            .collect())
    }

    /// Stop a workflow before it reaches INTEGRATING.
    ///
    /// A run in this process is signalled and stops at its next stage
    /// boundary (or mid gateway call). A run owned by another live process
    /// is refused with `Busy`. A workflow that is not running anywhere is
    /// closed with a cancelled entry.
    pub fn cancel(&self, name: &str) -> Result<CancelOutcome> {
        {
            let active = self.active_runs();
            if let Some(run) = active.get(name) {
                if run.integrating {
                    return Err(Error::Other(format!(
                        "'{}' is integrating; cancellation refused",
                        name
                    )));
                }
                run.token.cancel();
                info!(capability = %name, request_id = %run.request_id, "🧩 [acquire] cancellation signalled");
                return Ok(CancelOutcome::Signalled {
                    request_id: run.request_id.clone(),
                });
            }
        }

        // 先拿锁再重放：持锁者（其他进程）仍在推进时不能记 cancelled
        let _guard = self.locks.try_acquire(name)?;
        let replay = self
            .status(name)?
            .ok_or_else(|| Error::NotFound(format!("no workflow recorded for '{}'", name)))?;
        if replay.state == LifecycleState::Integrating {
            return Err(Error::Other(format!("'{}' is integrating; cancellation refused", name)));
        }
        if !replay.state.is_cancellable() {
            return Err(Error::Other(format!("nothing to cancel: '{}' is {}", name, replay.state)));
        }

        let sequence_id = self.tms.append(TmsEntry::new(
            &replay.request_id,
            name,
            stage_of(replay.state),
            Outcome::Cancelled,
            format!("cancelled by user while {}", replay.state),
            &self.versioning.current_version(),
        ))?;
        info!(capability = %name, request_id = %replay.request_id, "🧩 [acquire] stalled workflow cancelled");
        Ok(CancelOutcome::Recorded {
            request_id: replay.request_id,
            sequence_id,
        })
    }

    // ---- read-side helpers used by the CLI ------------------------------

    pub fn transactions(&self, capability: Option<&str>, from: Option<u64>, to: Option<u64>) -> Result<Vec<TmsEntry>> {
        let entries = match (from, to) {
            (None, None) => self.tms.all()?,
            (from, to) => self.tms.query_range(from.unwrap_or(0), to.unwrap_or(u64::MAX))?,
        };
        Ok(entries
            .into_iter()
            .filter(|e| capability.map(|c| e.capability_name == c).unwrap_or(true))
            .collect())
    }

    pub fn plan(&self, name: &str) -> Result<Plan> {
        self.plans.load(name)
    }

    pub async fn list(&self) -> Vec<RegistryEntry> {
        self.integration.registry().lock().await.list().into_iter().cloned().collect()
    }

    /// Dispatch an acquired command.
    pub async fn run(&self, name: &str, args: &[Value]) -> Result<Value> {
        let registry = self.integration.registry().lock().await.clone();
        let modules = ModuleStore::new(self.paths.clone());
        let sandbox = self.sandbox.clone();
        let name = name.to_string();
        let args = args.to_vec();
        tokio::task::spawn_blocking(move || run_capability(&registry, &modules, &sandbox, &name, &args))
            .await
            .map_err(|e| Error::Other(format!("dispatch task failed: {}", e)))?
    }

    pub async fn disable(&self, name: &str) -> Result<Vec<u64>> {
        let _guard = self.locks.try_acquire(name)?;
        self.integration.disable(name, &self.versioning.current_version()).await
    }

    // ---- workflow plumbing ----------------------------------------------

    fn active_runs(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn begin(&self, request: CapabilityRequest, agent_version: String) -> Run {
        let token = CancellationToken::new();
        self.active_runs().insert(
            request.name.clone(),
            ActiveRun {
                request_id: request.request_id.clone(),
                token: token.clone(),
                integrating: false,
            },
        );
        Run {
            request,
            token,
            agent_version,
            ids: StdMutex::new(Vec::new()),
        }
    }

    fn finish(&self, run: &Run, result: Result<WorkflowStatus>) -> Result<AddOutcome> {
        self.active_runs().remove(&run.request.name);
        match result {
            Ok(status) => {
                info!(
                    capability = %run.request.name,
                    request_id = %run.request.request_id,
                    status = ?status,
                    "🧩 [acquire] workflow finished"
                );
                Ok(AddOutcome {
                    request_id: run.request.request_id.clone(),
                    capability_name: run.request.name.clone(),
                    status,
                    sequence_ids: run.ids(),
                })
            }
            Err(e) => {
                error!(capability = %run.request.name, error = %e, "🧩 [acquire] workflow aborted");
                Err(e)
            }
        }
    }

    fn reject(&self, request: &CapabilityRequest, agent_version: &str, reason: String) -> Result<AddOutcome> {
        self.reject_raw(request, &request.raw(), agent_version, reason)
    }

    fn reject_raw(&self, request: &CapabilityRequest, raw: &str, agent_version: &str, reason: String) -> Result<AddOutcome> {
        let id = self.tms.append(TmsEntry::new(
            &request.request_id,
            &request.name,
            Stage::Request,
            Outcome::Failure,
            format!("{} (rejected: {})", raw, reason),
            agent_version,
        ))?;
        warn!(capability = %request.name, reason = %reason, "🧩 [acquire] request rejected");
        Ok(AddOutcome {
            request_id: request.request_id.clone(),
            capability_name: request.name.clone(),
            status: WorkflowStatus::Rejected { reason },
            sequence_ids: vec![id],
        })
    }

    fn record(&self, run: &Run, stage: Stage, outcome: Outcome, detail: impl Into<String>) -> Result<u64> {
        let id = self.tms.append(TmsEntry::new(
            &run.request.request_id,
            &run.request.name,
            stage,
            outcome,
            detail,
            &run.agent_version,
        ))?;
        run.push(id);
        Ok(id)
    }

    fn record_failure(&self, run: &Run, stage: Stage, reason: String) -> Result<Step> {
        self.record(run, stage, Outcome::Failure, reason.clone())?;
        warn!(capability = %run.request.name, stage = %stage, reason = %reason, "🧩 [acquire] stage failed");
        Ok(Step::Done(WorkflowStatus::Failed { stage, reason }))
    }

    fn record_cancel(&self, run: &Run, stage: Stage, detail: &str) -> Result<WorkflowStatus> {
        self.record(run, stage, Outcome::Cancelled, detail)?;
        info!(capability = %run.request.name, stage = %stage, "🧩 [acquire] workflow cancelled");
        Ok(WorkflowStatus::Cancelled)
    }

    async fn drive(&self, run: &Run, mut step: Step) -> Result<WorkflowStatus> {
        loop {
            let stage = match &step {
                Step::Done(status) => return Ok(status.clone()),
                Step::Plan => Stage::Planning,
                Step::Code { .. } => Stage::Coding,
                Step::Validate { .. } => Stage::Validating,
                Step::Integrate => Stage::Integrating,
                Step::Version { .. } => Stage::Versioning,
            };
            let cancellable = matches!(stage, Stage::Planning | Stage::Coding | Stage::Validating);
            if cancellable && run.token.is_cancelled() {
                return self.record_cancel(run, stage, "cancelled by user");
            }
            debug!(capability = %run.request.name, stage = %stage, "🧩 [acquire] entering stage");

            let next = match step {
                Step::Plan => self.plan_stage(run).await,
                Step::Code { round, feedback } => self.code_stage(run, round, feedback).await,
                Step::Validate { round } => self.validate_stage(run, round).await,
                Step::Integrate => self.integrate_stage(run).await,
                Step::Version { agent_version } => self.version_stage(run, &agent_version).await,
                Step::Done(status) => Ok(Step::Done(status)),
            };
            step = match next {
                Ok(next) => next,
                Err(Error::Cancelled(_)) if cancellable => {
                    return self.record_cancel(run, stage, "cancelled by user");
                }
                Err(e) => return Err(e),
            };
        }
    }

    async fn plan_stage(&self, run: &Run) -> Result<Step> {
        let name = run.request.name.as_str();
        self.record(run, Stage::Planning, Outcome::InProgress, "planning started")?;
        info!(capability = %name, "🧩 [acquire] planning started");

        let observer = StageObserver {
            tms: &self.tms,
            run,
            stage: Stage::Planning,
        };
        let plan = match self.planner.plan(&run.request, &observer, &run.token).await {
            Ok(plan) => plan,
            Err(e @ Error::Cancelled(_)) => return Err(e),
            Err(e) => {
                return self.record_failure(
                    run,
                    Stage::Planning,
                    format!("{}: {}; no code changes made", e.kind(), e),
                )
            }
        };

        if self.plans.exists(name) {
            self.record(run, Stage::Planning, Outcome::InProgress, "supersedes existing plan")?;
        }
        if let Err(e) = self.plans.save(&plan) {
            return self.record_failure(run, Stage::Planning, format!("{}: {}", e.kind(), e));
        }
        self.record(
            run,
            Stage::Planning,
            Outcome::Success,
            format!("plan saved with {} function(s)", plan.proposed_functions.len()),
        )?;

        if self.synthesizer.is_deferred() {
            info!(capability = %name, "🧩 [acquire] synthesis deferred, plan ready");
            return Ok(Step::Done(WorkflowStatus::PlanReady));
        }
        Ok(Step::Code {
            round: 1,
            feedback: None,
        })
    }

    async fn code_stage(&self, run: &Run, round: u32, feedback: Option<String>) -> Result<Step> {
        let name = run.request.name.as_str();
        self.record(run, Stage::Coding, Outcome::InProgress, format!("coding round {}", round))?;

        let plan = match self.plans.load(name) {
            Ok(plan) => plan,
            Err(e) => return self.record_failure(run, Stage::Coding, format!("{}: {}", e.kind(), e)),
        };
        let Some(entry) = plan.entry_function() else {
            return self.record_failure(run, Stage::Coding, "plan has no functions".to_string());
        };
        let mut module = Module::new(name, &entry.name);
        let observer = StageObserver {
            tms: &self.tms,
            run,
            stage: Stage::Coding,
        };

        let attempts = self.config.pipeline.max_function_retries + 1;
        for function in &plan.proposed_functions {
            let mut last_error = None;
            for attempt in 1..=attempts {
                if run.token.is_cancelled() {
                    return Err(Error::Cancelled("cancelled during coding".to_string()));
                }
                match self
                    .synthesizer
                    .synthesize_function(&plan, function, feedback.as_deref(), &observer, &run.token)
                    .await
                {
                    Ok(source) => {
                        module.set_artifact(&function.name, source);
                        last_error = None;
                        break;
                    }
                    Err(e @ Error::Cancelled(_)) => return Err(e),
                    Err(e) => {
                        self.record(
                            run,
                            Stage::Coding,
                            Outcome::InProgress,
                            format!(
                                "fn {} attempt {}/{} failed: {}: {}",
                                function.name,
                                attempt,
                                attempts,
                                e.kind(),
                                e
                            ),
                        )?;
                        last_error = Some(e);
                    }
                }
            }
            if let Some(e) = last_error {
                return self.record_failure(
                    run,
                    Stage::Coding,
                    format!("fn {}: {}: {}", function.name, e.kind(), e),
                );
            }
        }

        if !plan.testing_notes.is_empty() {
            module.scenarios = match self.synthesizer.synthesize_scenarios(&plan, &observer, &run.token).await {
                Ok(scenarios) => scenarios,
                Err(e @ Error::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(capability = %name, error = %e, "🧩 [acquire] no test scenarios");
                    Vec::new()
                }
            };
        }
        module.smoke = module
            .scenarios
            .iter()
            .find(|s| s.function == module.entry_point)
            .cloned();

        if let Err(e) = self.modules.stage(&module) {
            return self.record_failure(run, Stage::Coding, format!("{}: {}", e.kind(), e));
        }
        self.record(
            run,
            Stage::Coding,
            Outcome::Success,
            format!(
                "{} artifact(s), {} scenario(s) staged",
                module.source_artifacts.len(),
                module.scenarios.len()
            ),
        )?;
        Ok(Step::Validate { round })
    }

    async fn validate_stage(&self, run: &Run, round: u32) -> Result<Step> {
        let name = run.request.name.as_str();
        self.record(run, Stage::Validating, Outcome::InProgress, format!("validation round {}", round))?;

        let plan = match self.plans.load(name) {
            Ok(plan) => plan,
            Err(e) => return self.record_failure(run, Stage::Validating, format!("{}: {}", e.kind(), e)),
        };
        // 崩溃可能发生在提升之后、成功记录之前：此时只剩已提升的模块
        let staged = self.modules.has_staged(name);
        let loaded = if staged {
            self.modules.load_staged(name)
        } else {
            self.modules.load(name)
        };
        let module = match loaded {
            Ok(module) => module,
            Err(e) => return self.record_failure(run, Stage::Validating, format!("{}: {}", e.kind(), e)),
        };

        let validator = self.validator.clone();
        let (mut module, result) = tokio::task::spawn_blocking(move || {
            let result = validator.validate(&module, &plan);
            (module, result)
        })
        .await
        .map_err(|e| Error::Other(format!("validation task failed: {}", e)))?;

        if run.token.is_cancelled() {
            return Err(Error::Cancelled("cancelled during validation".to_string()));
        }

        if !result.passed {
            let summary = result.summary();
            self.record(run, Stage::Validating, Outcome::Failure, summary.clone())?;
            if round <= self.config.pipeline.max_synthesis_rounds {
                info!(capability = %name, round, "🧩 [acquire] validation failed, regenerating");
                return Ok(Step::Code {
                    round: round + 1,
                    feedback: Some(summary),
                });
            }
            warn!(capability = %name, round, "🧩 [acquire] validation failed, giving up");
            return Ok(Step::Done(WorkflowStatus::Failed {
                stage: Stage::Validating,
                reason: summary,
            }));
        }

        module.validation_result = Some(result);
        if staged {
            if let Err(e) = self.modules.promote(&module) {
                return self.record_failure(run, Stage::Validating, format!("{}: {}", e.kind(), e));
            }
        }
        self.record(run, Stage::Validating, Outcome::Success, "all checks passed")?;
        Ok(Step::Integrate)
    }

    /// Marks the run as integrating unless it was cancelled first; both
    /// happen under the active-run lock so `cancel` cannot slip in between.
    fn enter_integrating(&self, run: &Run) -> bool {
        let mut active = self.active_runs();
        if run.token.is_cancelled() {
            return false;
        }
        if let Some(entry) = active.get_mut(&run.request.name) {
            entry.integrating = true;
        }
        true
    }

    async fn integrate_stage(&self, run: &Run) -> Result<Step> {
        let name = run.request.name.as_str();
        if !self.enter_integrating(run) {
            return self
                .record_cancel(run, Stage::Validating, "cancelled before integration")
                .map(Step::Done);
        }

        let module = match self.modules.load(name) {
            Ok(module) => module,
            Err(e) => return self.record_failure(run, Stage::Integrating, format!("{}: {}", e.kind(), e)),
        };
        let report = self
            .integration
            .integrate(&run.request.request_id, &module, &run.agent_version)
            .await?;
        for id in &report.sequence_ids {
            run.push(*id);
        }

        match report.result {
            IntegrationResult::Integrated { .. } => Ok(Step::Version {
                agent_version: run.agent_version.clone(),
            }),
            IntegrationResult::RolledBack { step, reason } => Ok(Step::Done(WorkflowStatus::RolledBack {
                reason: format!("{} failed: {}", step, reason),
            })),
        }
    }

    async fn version_stage(&self, run: &Run, agent_version: &str) -> Result<Step> {
        let name = run.request.name.as_str();
        match self.versioning.capability_integrated(name, agent_version).await {
            Ok(next) => {
                self.record(
                    run,
                    Stage::Versioning,
                    Outcome::Success,
                    format!("agent version {} -> {}", agent_version, next),
                )?;
                Ok(Step::Done(WorkflowStatus::Integrated { agent_version: next }))
            }
            Err(e) => {
                // 能力已经生效；版本号下次 resume 时补发
                self.record(run, Stage::Versioning, Outcome::Failure, format!("{}: {}", e.kind(), e))?;
                warn!(capability = %name, error = %e, "🧩 [acquire] version bump failed");
                Ok(Step::Done(WorkflowStatus::Integrated {
                    agent_version: agent_version.to_string(),
                }))
            }
        }
    }

    async fn recover_integration(&self, name: &str, replay: &Replay) -> Result<ResumeOutcome> {
        let ids = self
            .integration
            .rollback(&replay.request_id, name, &self.versioning.current_version())
            .await?;
        Ok(ResumeOutcome::Resumed(AddOutcome {
            request_id: replay.request_id.clone(),
            capability_name: name.to_string(),
            status: WorkflowStatus::RolledBack {
                reason: "interrupted integration rolled back".to_string(),
            },
            sequence_ids: ids,
        }))
    }

    /// Rebuild the request from its logged raw command line. A line that
    /// cannot be parsed back is an error: planning from a guessed description
    /// would produce a plan for a different request.
    fn recover_request(&self, name: &str, request_id: &str) -> Result<CapabilityRequest> {
        let entries = self.tms.by_request(request_id)?;
        let logged = entries
            .iter()
            .find(|e| e.stage == Stage::Request && e.outcome == Outcome::InProgress)
            .ok_or_else(|| {
                Error::Storage(format!(
                    "cannot recover request {} for '{}': no request entry in the log",
                    request_id, name
                ))
            })?;
        let request = CapabilityRequest::from_raw(request_id, &logged.detail).ok_or_else(|| {
            Error::Storage(format!(
                "cannot recover request {} for '{}': unreadable request line (seq {})",
                request_id, name, logged.sequence_id
            ))
        })?;
        if request.name != name {
            return Err(Error::Storage(format!(
                "cannot recover request {}: logged for '{}', not '{}'",
                request_id, request.name, name
            )));
        }
        Ok(request)
    }

    /// The agent version the integration ran under; versioning is keyed by it.
    fn integrated_version(&self, request_id: &str) -> Result<String> {
        Ok(self
            .tms
            .by_request(request_id)?
            .into_iter()
            .rev()
            .find(|e| e.stage == Stage::Integrating && e.outcome == Outcome::Success)
            .map(|e| e.agent_version)
            .unwrap_or_else(|| self.versioning.current_version()))
    }
}

fn stage_of(state: LifecycleState) -> Stage {
    match state {
        LifecycleState::Requested | LifecycleState::Rejected => Stage::Request,
        LifecycleState::Planning | LifecycleState::Planned => Stage::Planning,
        LifecycleState::Coding | LifecycleState::Coded => Stage::Coding,
        LifecycleState::Validating | LifecycleState::Validated => Stage::Validating,
        LifecycleState::Integrating | LifecycleState::Integrated | LifecycleState::RolledBack => Stage::Integrating,
        LifecycleState::Disabled => Stage::Disabling,
        LifecycleState::Failed(stage) => stage,
        LifecycleState::Cancelled => Stage::Request,
    }
}
