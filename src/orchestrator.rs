//! Deploy driver: one provisioning run end to end.
//!
//! A run holds the stack's lease for its whole duration and walks a fixed
//! sequence of phases. Nothing is written to the durable store before
//! `PERSIST_RESULTS`; a failed apply only persists when the executor left a
//! changed state artifact behind, so the store never loses track of
//! infrastructure that was actually created.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::build::{BuildResolver, ResolveReport};
use crate::config::ConfigHasher;
use crate::document::Document;
use crate::error::{Result, StateError};
use crate::executor::{InfraExecutor, StepOutput};
use crate::providers::{plan_document, PlanContext, ProviderPlanner};
use crate::stack::{Stack, StackRepository, StackStatus};
use crate::state::{
    bundle_key, generate_holder_id, BundleStore, ProvisioningState, WorkspaceBundle,
    EXECUTION_STATE_FILE,
};
use crate::workspace::Workspace;

/// Phases of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    /// Loading the stored bundle.
    LoadState,
    /// Running the provider planners.
    Plan,
    /// Building container images.
    ResolveBuilds,
    /// Materializing the scratch workspace.
    WriteWorkspace,
    /// Running the executor.
    Apply,
    /// Uploading the workspace and updating the stack.
    PersistResults,
    /// Releasing the lease and the workspace.
    Cleanup,
    /// The run finished successfully.
    Succeeded,
    /// The run failed.
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadState => "LOAD_STATE",
            Self::Plan => "PLAN",
            Self::ResolveBuilds => "RESOLVE_BUILDS",
            Self::WriteWorkspace => "WRITE_WORKSPACE",
            Self::Apply => "APPLY",
            Self::PersistResults => "PERSIST_RESULTS",
            Self::Cleanup => "CLEANUP",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Kind of run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOperation {
    /// Plan, build and apply.
    Deploy,
    /// Tear down everything the stack created.
    Destroy,
    /// Plan only.
    Render,
}

/// Record of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Stack the run acted on.
    pub stack_id: String,
    /// Kind of run.
    pub operation: RunOperation,
    /// Phases entered, in order, ending with the terminal phase.
    pub phases: Vec<RunPhase>,
    /// True when no bundle existed before the run.
    pub first_run: bool,
    /// Build placeholders resolved during the run.
    pub builds: ResolveReport,
    /// Fingerprint of the document handed to the executor.
    pub document_hash: Option<String>,
    /// Whether the durable store was written.
    pub persisted: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal phase.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(stack_id: &str, operation: RunOperation) -> Self {
        Self {
            stack_id: stack_id.to_string(),
            operation,
            phases: Vec::new(),
            first_run: false,
            builds: ResolveReport::default(),
            document_hash: None,
            persisted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        info!("Stack {}: {phase}", self.stack_id);
        self.phases.push(phase);
    }

    fn finish(&mut self, phase: RunPhase) {
        self.enter(phase);
        self.finished_at = Some(Utc::now());
    }

    /// The terminal phase, if the run has finished.
    #[must_use]
    pub fn outcome(&self) -> Option<RunPhase> {
        self.phases
            .last()
            .copied()
            .filter(|p| matches!(p, RunPhase::Succeeded | RunPhase::Failed))
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome() == Some(RunPhase::Succeeded)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self
            .outcome()
            .map_or_else(|| String::from("RUNNING"), |p| p.to_string());
        write!(
            f,
            "{:?} {}: {outcome} ({} built, {} reused",
            self.operation,
            self.stack_id,
            self.builds.built.len(),
            self.builds.reused.len()
        )?;
        if let Some(hash) = &self.document_hash {
            write!(f, ", document {}", ConfigHasher::new().short_hash(hash))?;
        }
        write!(f, ")")
    }
}

/// Drives provisioning runs for stacks.
pub struct DeployDriver {
    stacks: Arc<dyn StackRepository>,
    store: Arc<dyn BundleStore>,
    planners: Vec<Arc<dyn ProviderPlanner>>,
    resolver: BuildResolver,
    executor: Arc<dyn InfraExecutor>,
    holder: String,
    hasher: ConfigHasher,
}

impl fmt::Debug for DeployDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployDriver")
            .field("store", &self.store.backend_type())
            .field(
                "planners",
                &self.planners.iter().map(|p| p.namespace()).collect::<Vec<_>>(),
            )
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl DeployDriver {
    /// Creates a driver. Planners run in the order given.
    #[must_use]
    pub fn new(
        stacks: Arc<dyn StackRepository>,
        store: Arc<dyn BundleStore>,
        planners: Vec<Arc<dyn ProviderPlanner>>,
        resolver: BuildResolver,
        executor: Arc<dyn InfraExecutor>,
    ) -> Self {
        Self {
            stacks,
            store,
            planners,
            resolver,
            executor,
            holder: generate_holder_id(),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the lease holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Provisions a stack: plan, build, apply, persist.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockedByOther`] if another run holds the stack,
    /// or the first error of the run. On failure the stack is marked `ERROR`.
    pub async fn deploy(&self, stack_id: &str) -> Result<RunReport> {
        let mut stack = self.stacks.require(stack_id).await?;
        let key = bundle_key(stack_id);
        let lease = self.store.acquire_lock(&key, &self.holder).await?;

        let mut report = RunReport::new(stack_id, RunOperation::Deploy);
        info!("Starting deploy of stack {stack_id}");

        stack.set_status(StackStatus::Starting);
        let outcome = match self.stacks.save(&stack).await {
            Ok(()) => self.run_deploy(&mut stack, &key, &mut report).await,
            Err(e) => Err(e),
        };

        report.enter(RunPhase::Cleanup);
        self.release(&key, &lease.lock_id).await;

        self.conclude(stack, report, outcome, StackStatus::Running).await
    }

    /// Tears down everything a stack created and marks it `DELETED`.
    ///
    /// The stack record is kept. A stack without a stored bundle has
    /// nothing to destroy and is marked deleted directly.
    ///
    /// # Errors
    ///
    /// Returns the first error of the run. On failure the stack is marked
    /// `ERROR` and its bundle is kept.
    pub async fn destroy(&self, stack_id: &str) -> Result<RunReport> {
        let mut stack = self.stacks.require(stack_id).await?;
        let key = bundle_key(stack_id);
        let lease = self.store.acquire_lock(&key, &self.holder).await?;

        let mut report = RunReport::new(stack_id, RunOperation::Destroy);
        info!("Starting teardown of stack {stack_id}");

        stack.set_status(StackStatus::Deleting);
        let outcome = match self.stacks.save(&stack).await {
            Ok(()) => self.run_destroy(&mut stack, &key, &mut report).await,
            Err(e) => Err(e),
        };

        report.enter(RunPhase::Cleanup);
        self.release(&key, &lease.lock_id).await;

        self.conclude(stack, report, outcome, StackStatus::Deleted).await
    }

    /// Plans a stack without building or applying.
    ///
    /// Build placeholders stay in the returned document. Nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack or its bundle cannot be read, or a
    /// planner fails.
    pub async fn render(&self, stack_id: &str) -> Result<Document> {
        StackRenderer::new(self.stacks.clone(), self.store.clone(), self.planners.clone())
            .render(stack_id)
            .await
    }

    async fn run_deploy(
        &self,
        stack: &mut Stack,
        key: &str,
        report: &mut RunReport,
    ) -> Result<()> {
        report.enter(RunPhase::LoadState);
        let (prior, mut state) = self.load_state(key, report).await?;

        report.enter(RunPhase::Plan);
        let mut document = self.plan(stack, &mut state).await?;

        report.enter(RunPhase::ResolveBuilds);
        report.builds = self
            .resolver
            .resolve(&stack.id, &mut document, &mut state)
            .await?;
        document.ensure_resolved()?;

        report.enter(RunPhase::WriteWorkspace);
        let workspace = Workspace::create()?;
        if let Some(bundle) = &prior {
            workspace.restore(bundle).await?;
        }
        workspace.write_document(&document).await?;
        workspace.write_state(&state).await?;
        report.document_hash = Some(self.hasher.hash_document(&document)?);

        report.enter(RunPhase::Apply);
        match self.executor.apply_all(workspace.path()).await {
            Ok(outputs) => log_outputs(&stack.id, &outputs),
            Err(e) => {
                self.salvage(stack, key, &workspace, prior.as_ref(), report).await;
                return Err(e);
            }
        }

        report.enter(RunPhase::PersistResults);
        let bundle = workspace.collect().await?;
        self.store.save(key, &bundle).await?;
        report.persisted = true;

        stack.execution_state = parse_execution_state(workspace.execution_state().await?)?;
        stack.applied_document = Some(document);
        Ok(())
    }

    async fn run_destroy(
        &self,
        stack: &mut Stack,
        key: &str,
        report: &mut RunReport,
    ) -> Result<()> {
        report.enter(RunPhase::LoadState);
        let (prior, _) = self.load_state(key, report).await?;
        let Some(prior) = prior else {
            info!("Stack {}: no stored bundle, nothing to destroy", stack.id);
            stack.execution_state = None;
            return Ok(());
        };

        report.enter(RunPhase::WriteWorkspace);
        let workspace = Workspace::create()?;
        workspace.restore(&prior).await?;

        report.enter(RunPhase::Apply);
        match self.executor.destroy_all(workspace.path()).await {
            Ok(outputs) => log_outputs(&stack.id, &outputs),
            Err(e) => {
                self.salvage(stack, key, &workspace, Some(&prior), report).await;
                return Err(e);
            }
        }

        report.enter(RunPhase::PersistResults);
        self.store.delete(key).await?;
        report.persisted = true;
        stack.execution_state = None;
        stack.applied_document = None;
        Ok(())
    }

    async fn load_state(
        &self,
        key: &str,
        report: &mut RunReport,
    ) -> Result<(Option<WorkspaceBundle>, ProvisioningState)> {
        load_state(self.store.as_ref(), key, report).await
    }

    async fn plan(&self, stack: &Stack, state: &mut ProvisioningState) -> Result<Document> {
        plan_stack(&self.planners, stack, state).await
    }

    /// Persists a failed run's workspace if the executor changed its state
    /// artifact; otherwise leaves the store untouched. The stack's execution
    /// state follows whatever was persisted.
    async fn salvage(
        &self,
        stack: &mut Stack,
        key: &str,
        workspace: &Workspace,
        prior: Option<&WorkspaceBundle>,
        report: &mut RunReport,
    ) {
        let bundle = match workspace.collect().await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!("Could not collect workspace after failure: {e}");
                return;
            }
        };

        let before = prior.and_then(|b| b.digest(EXECUTION_STATE_FILE));
        let after = bundle.digest(EXECUTION_STATE_FILE);
        if after.is_none() || after == before {
            debug!("Execution state unchanged, keeping stored bundle {key}");
            return;
        }

        warn!("Executor failed after changing execution state, persisting partial bundle {key}");
        if let Err(e) = self.store.save(key, &bundle).await {
            error!("Failed to persist partial bundle {key}: {e}");
            return;
        }
        report.persisted = true;

        match parse_execution_state(bundle.get(EXECUTION_STATE_FILE).map(<[u8]>::to_vec)) {
            Ok(state) => stack.execution_state = state,
            Err(e) => warn!("Stack {}: {e}", stack.id),
        }
    }

    async fn release(&self, key: &str, lock_id: &str) {
        if let Err(e) = self.store.release_lock(key, lock_id).await {
            warn!("Failed to release lease on {key}: {e}");
        }
    }

    async fn conclude(
        &self,
        mut stack: Stack,
        mut report: RunReport,
        outcome: Result<()>,
        success: StackStatus,
    ) -> Result<RunReport> {
        match outcome {
            Ok(()) => {
                stack.set_status(success);
                self.stacks.save(&stack).await?;
                report.finish(RunPhase::Succeeded);
                Ok(report)
            }
            Err(e) => {
                error!("Stack {} run failed: {e}", stack.id);
                stack.set_status(StackStatus::Error);
                if let Err(save_err) = self.stacks.save(&stack).await {
                    error!("Failed to record ERROR status for {}: {save_err}", stack.id);
                }
                report.finish(RunPhase::Failed);
                Err(e)
            }
        }
    }
}

/// Plans stacks against their stored provisioning state.
///
/// Needs no build service or executor, so it runs without registry or
/// executor credentials.
pub struct StackRenderer {
    stacks: Arc<dyn StackRepository>,
    store: Arc<dyn BundleStore>,
    planners: Vec<Arc<dyn ProviderPlanner>>,
}

impl fmt::Debug for StackRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackRenderer")
            .field("store", &self.store.backend_type())
            .field(
                "planners",
                &self.planners.iter().map(|p| p.namespace()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl StackRenderer {
    /// Creates a renderer.
    #[must_use]
    pub fn new(
        stacks: Arc<dyn StackRepository>,
        store: Arc<dyn BundleStore>,
        planners: Vec<Arc<dyn ProviderPlanner>>,
    ) -> Self {
        Self {
            stacks,
            store,
            planners,
        }
    }

    /// Plans a stack without building or applying.
    ///
    /// Build placeholders stay in the returned document. Nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack or its bundle cannot be read, or a
    /// planner fails.
    pub async fn render(&self, stack_id: &str) -> Result<Document> {
        let stack = self.stacks.require(stack_id).await?;
        let mut report = RunReport::new(stack_id, RunOperation::Render);

        report.enter(RunPhase::LoadState);
        let (_, mut state) = load_state(self.store.as_ref(), &bundle_key(stack_id), &mut report).await?;

        report.enter(RunPhase::Plan);
        let document = plan_stack(&self.planners, &stack, &mut state).await?;
        report.finish(RunPhase::Succeeded);
        debug!("{report}");
        Ok(document)
    }
}

async fn load_state(
    store: &dyn BundleStore,
    key: &str,
    report: &mut RunReport,
) -> Result<(Option<WorkspaceBundle>, ProvisioningState)> {
    match store.load(key).await? {
        Some(bundle) => {
            let state = bundle.provisioning_state()?;
            debug!(
                "Loaded bundle {key}: {} file(s), {} state entries",
                bundle.len(),
                state.len()
            );
            Ok((Some(bundle), state))
        }
        None => {
            info!("No bundle stored under {key}, treating as first run");
            report.first_run = true;
            Ok((None, ProvisioningState::new()))
        }
    }
}

async fn plan_stack(
    planners: &[Arc<dyn ProviderPlanner>],
    stack: &Stack,
    state: &mut ProvisioningState,
) -> Result<Document> {
    let ctx = PlanContext::new(&stack.id, &stack.project_id)
        .with_organization(stack.organization_id.clone());
    let desired = stack.desired_document()?;
    plan_document(planners, &ctx, &desired, state).await
}

fn log_outputs(stack_id: &str, outputs: &[StepOutput]) {
    for output in outputs {
        debug!("Stack {stack_id}: {} output:\n{}", output.step, output.stdout);
    }
}

fn parse_execution_state(bytes: Option<Vec<u8>>) -> Result<Option<serde_json::Value>> {
    bytes
        .map(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| {
                StateError::corrupted(format!("Executor wrote invalid {EXECUTION_STATE_FILE}: {e}"))
                    .into()
            })
        })
        .transpose()
}
