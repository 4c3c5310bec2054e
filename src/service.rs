//! The run state machine: creation, apply advancement, two-tier cancellation
//! and the rest of the public operation surface.
//!
//! All collaborators are constructor-injected. Public operations execute in
//! the caller's task and spawn nothing; the only long-lived concurrency is
//! the event subscriber behind [`RunService::watch_runs`].

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::deps::{
    AccessLevel, ActivityAction, ActivityRecorder, ArtifactKind, ArtifactStore, Authorizer,
    Caller, DataClient, EntityKind, EventBus, LimitChecker, ModuleResolver, ResolvedModule,
    RuleEvaluator, RunFilter, SecretManager, Transaction, VersionCatalog,
};
use crate::errors::{OrchestratorError, Result, ResultExt};
use crate::events::{RunEvent, RunWatchFilter, RunWatcher};
use crate::ingest::{self, PlanDiff};
use crate::models::{
    Apply, ApplyStatus, Job, JobKind, Plan, PlanStatus, RuleContext, Run, RunStage,
    RunStatus, RunVariableInput, Variable, VariableCategory, Workspace, new_id,
};
use crate::policy::PolicyGate;
use crate::trace::{SpanFactory, record_error};
use crate::transitions::RunStateWriter;
use crate::variables::VariableResolver;

/// Grace window between a graceful cancel and force-cancel eligibility.
pub const FORCE_CANCEL_WAIT_SECS: i64 = 60;

/// Trailing window for the run-creation resource limit.
const RUN_LIMIT_WINDOW_HOURS: i64 = 1;

#[derive(Clone, Debug, Default)]
pub struct CreateRunRequest {
    pub workspace_id: String,
    pub configuration_version_id: Option<String>,
    pub module_source: Option<String>,
    pub module_version: Option<String>,
    pub terraform_version: Option<String>,
    pub speculative: Option<bool>,
    pub is_destroy: bool,
    pub is_assessment: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub target_addresses: Vec<String>,
    pub variables: Vec<RunVariableInput>,
}

/// Collaborators wired into the service at construction time.
pub struct RunServiceDeps {
    pub db: Arc<dyn DataClient>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub secrets: Arc<dyn SecretManager>,
    pub authorizer: Arc<dyn Authorizer>,
    pub modules: Arc<dyn ModuleResolver>,
    pub rules: Arc<dyn RuleEvaluator>,
    pub limits: Arc<dyn LimitChecker>,
    pub versions: Arc<dyn VersionCatalog>,
    pub activity: Arc<dyn ActivityRecorder>,
    pub bus: Arc<dyn EventBus>,
    pub spans: Arc<dyn SpanFactory>,
}

pub struct RunService {
    db: Arc<dyn DataClient>,
    artifacts: Arc<dyn ArtifactStore>,
    authorizer: Arc<dyn Authorizer>,
    modules: Arc<dyn ModuleResolver>,
    activity: Arc<dyn ActivityRecorder>,
    writer: RunStateWriter,
    variables: VariableResolver,
    policy: PolicyGate,
    watcher: RunWatcher,
    spans: Arc<dyn SpanFactory>,
}

impl RunService {
    pub fn new(deps: RunServiceDeps) -> Self {
        let writer = RunStateWriter::new(deps.bus.clone());
        let variables = VariableResolver::new(
            deps.db.clone(),
            deps.artifacts.clone(),
            deps.secrets.clone(),
        );
        let policy = PolicyGate::new(deps.rules, deps.limits, deps.versions);
        let watcher = RunWatcher::new(deps.db.clone(), deps.bus, deps.authorizer.clone());
        Self {
            db: deps.db,
            artifacts: deps.artifacts,
            authorizer: deps.authorizer,
            modules: deps.modules,
            activity: deps.activity,
            writer,
            variables,
            policy,
            watcher,
            spans: deps.spans,
        }
    }

    async fn traced<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let span = self.spans.operation_span(operation);
        let result = fut.instrument(span.clone()).await;
        if let Err(err) = &result {
            record_error(&span, err);
        }
        result
    }

    // --- run creation -----------------------------------------------------

    pub async fn create_run(&self, caller: &Caller, request: CreateRunRequest) -> Result<Run> {
        self.traced("create_run", self.create_run_inner(caller, request))
            .await
    }

    async fn create_run_inner(&self, caller: &Caller, request: CreateRunRequest) -> Result<Run> {
        self.authorizer
            .require_workspace_access(caller, &request.workspace_id, AccessLevel::CreateRun)
            .await?;
        validate_create_request(&request)?;

        let workspace = self.fetch_workspace(&request.workspace_id).await?;
        let variables = self
            .variables
            .build_run_variables(&workspace, &request.variables)
            .await?;

        let mut module: Option<ResolvedModule> = None;
        if let Some(source) = &request.module_source {
            let resolved = self
                .modules
                .resolve(source, request.module_version.as_deref())
                .await
                .op_context("resolve module source")?;
            if resolved.restricted && !self.authorizer.can_use_module(caller, source).await? {
                return Err(OrchestratorError::forbidden(format!(
                    "caller may not use private module {source}"
                )));
            }
            module = Some(resolved);
        }

        let terraform_version = self
            .policy
            .resolve_terraform_version(request.terraform_version.as_deref(), &workspace)
            .await?;
        self.policy
            .check_destroy_allowed(&workspace, request.is_destroy)?;

        // Managed-identity rules run before any write and are not
        // re-validated against the transaction's outcome.
        let identities = self.db.list_managed_identities(&workspace.id).await?;
        let ctx = RuleContext {
            stage: RunStage::Plan,
            module_digest: module.as_ref().map(|m| m.digest.clone()),
            module_source: request.module_source.clone(),
            module_version: module.as_ref().map(|m| m.version.to_string()),
            state_version_id: workspace.current_state_version_id.clone(),
        };
        self.policy
            .evaluate_managed_identities(&identities, &ctx)
            .await?;

        let speculative = self
            .resolve_speculative(&request)
            .await?;

        let tx = self.db.begin().await?;
        let outcome = self
            .create_run_in_tx(
                &*tx,
                caller,
                &request,
                &workspace,
                module.as_ref(),
                &variables,
                terraform_version,
                speculative,
            )
            .await;
        match outcome {
            Ok(run) => {
                tx.commit().await.op_context("commit run creation")?;
                self.writer.announce_created(EntityKind::Run, &run).await;
                Ok(run)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn resolve_speculative(&self, request: &CreateRunRequest) -> Result<bool> {
        let Some(cv_id) = &request.configuration_version_id else {
            return Ok(request.speculative.unwrap_or(false));
        };
        let cv = self
            .db
            .get_configuration_version(cv_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("configuration version {cv_id} not found"))
            })?;
        if cv.workspace_id != request.workspace_id {
            return Err(OrchestratorError::invalid_input(format!(
                "configuration version {cv_id} does not belong to workspace {}",
                request.workspace_id
            )));
        }
        match request.speculative {
            // A speculative configuration version can never be overridden to
            // a non-speculative run.
            Some(false) if cv.speculative => Err(OrchestratorError::invalid_input(format!(
                "configuration version {cv_id} is speculative and cannot produce an apply stage"
            ))),
            Some(explicit) => Ok(explicit),
            None => Ok(cv.speculative),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_run_in_tx(
        &self,
        tx: &dyn Transaction,
        caller: &Caller,
        request: &CreateRunRequest,
        workspace: &Workspace,
        module: Option<&ResolvedModule>,
        variables: &[Variable],
        terraform_version: String,
        speculative: bool,
    ) -> Result<Run> {
        let plan = Plan::new(&workspace.id);
        tx.insert_plan(&plan).await?;

        let apply_id = if speculative {
            String::new()
        } else {
            let apply = Apply::new(&workspace.id);
            tx.insert_apply(&apply).await?;
            apply.id
        };

        let run = Run {
            id: new_id("run"),
            workspace_id: workspace.id.clone(),
            status: RunStatus::PlanQueued,
            plan_id: plan.id,
            apply_id,
            configuration_version_id: request.configuration_version_id.clone(),
            module_source: request.module_source.clone(),
            module_version: module.map(|m| m.version.to_string()),
            module_digest: module.map(|m| m.digest.clone()),
            terraform_version,
            is_destroy: request.is_destroy,
            is_assessment: request.is_assessment,
            refresh: request.refresh,
            refresh_only: request.refresh_only,
            target_addresses: request.target_addresses.clone(),
            comment: None,
            created_by: caller.id.clone(),
            created_at: Utc::now(),
            force_cancel_available_at: None,
            force_canceled: false,
            force_canceled_by: None,
        };
        tx.insert_run(&run).await?;

        // Insert-then-count: the rolling-window limit sees this run and the
        // rollback undoes the insert on violation.
        let since = Utc::now() - Duration::hours(RUN_LIMIT_WINDOW_HOURS);
        let count = tx.count_runs_since(&workspace.id, since).await?;
        self.policy.check_run_limit(count).await?;

        self.activity
            .record(
                &workspace.namespace_path,
                ActivityAction::Create,
                "run",
                &run.id,
            )
            .await?;

        let tags = self.resolve_job_tags(&workspace.namespace_path).await?;
        let job = Job::new(
            JobKind::Plan,
            &workspace.id,
            &run.id,
            workspace.max_job_duration,
            tags,
        );
        tx.insert_job(&job).await?;
        tx.create_log_stream(&job.id).await?;

        self.variables.save_run_variables(&run.id, variables).await?;
        Ok(run)
    }

    /// Walk ancestor namespaces from the workspace outward and use the first
    /// configured runner tag set.
    async fn resolve_job_tags(&self, namespace_path: &str) -> Result<Vec<String>> {
        let mut path = namespace_path;
        loop {
            if let Some(tags) = self.db.namespace_tags(path).await? {
                return Ok(tags);
            }
            match path.rfind('/') {
                Some(idx) => path = &path[..idx],
                None => return Ok(Vec::new()),
            }
        }
    }

    // --- derived run creation ---------------------------------------------

    /// Destroy run against the workspace's current configuration version.
    pub async fn create_destroy_run(&self, caller: &Caller, workspace_id: &str) -> Result<Run> {
        self.traced(
            "create_destroy_run",
            self.create_destroy_run_inner(caller, workspace_id),
        )
        .await
    }

    async fn create_destroy_run_inner(&self, caller: &Caller, workspace_id: &str) -> Result<Run> {
        // Authorize before any lookup so an unauthorized caller cannot
        // probe whether the workspace exists.
        self.authorizer
            .require_workspace_access(caller, workspace_id, AccessLevel::CreateRun)
            .await?;
        let workspace = self.fetch_workspace(workspace_id).await?;
        let cv_id = workspace.configuration_version_id.clone().ok_or_else(|| {
            OrchestratorError::invalid_input(format!(
                "workspace {workspace_id} has no current configuration version to destroy"
            ))
        })?;
        self.create_run_inner(
            caller,
            CreateRunRequest {
                workspace_id: workspace_id.to_string(),
                configuration_version_id: Some(cv_id),
                is_destroy: true,
                refresh: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Plan-only drift-detection run reusing the workspace's last-applied
    /// configuration. At most one assessment run may be in progress.
    pub async fn create_assessment_run(&self, caller: &Caller, workspace_id: &str) -> Result<Run> {
        self.traced(
            "create_assessment_run",
            self.create_assessment_run_inner(caller, workspace_id),
        )
        .await
    }

    async fn create_assessment_run_inner(
        &self,
        caller: &Caller,
        workspace_id: &str,
    ) -> Result<Run> {
        self.authorizer
            .require_workspace_access(caller, workspace_id, AccessLevel::CreateRun)
            .await?;
        let workspace = self.fetch_workspace(workspace_id).await?;
        let existing = self
            .db
            .list_runs(&RunFilter {
                workspace_id: Some(workspace_id.to_string()),
                assessment_only: true,
            })
            .await?;
        if existing.iter().any(|run| !run_finished(run.status)) {
            return Err(OrchestratorError::conflict(format!(
                "an assessment run is already in progress for workspace {workspace_id}"
            )));
        }
        let cv_id = workspace.configuration_version_id.clone().ok_or_else(|| {
            OrchestratorError::invalid_input(format!(
                "workspace {workspace_id} has no applied configuration to assess"
            ))
        })?;
        self.create_run_inner(
            caller,
            CreateRunRequest {
                workspace_id: workspace_id.to_string(),
                configuration_version_id: Some(cv_id),
                speculative: Some(true),
                is_assessment: true,
                refresh: true,
                ..Default::default()
            },
        )
        .await
    }

    // --- apply ------------------------------------------------------------

    pub async fn apply_run(
        &self,
        caller: &Caller,
        run_id: &str,
        comment: Option<String>,
    ) -> Result<Run> {
        self.traced("apply_run", self.apply_run_inner(caller, run_id, comment))
            .await
    }

    async fn apply_run_inner(
        &self,
        caller: &Caller,
        run_id: &str,
        comment: Option<String>,
    ) -> Result<Run> {
        let mut run = self.fetch_run(run_id).await?;
        self.authorizer
            .require_workspace_access(caller, &run.workspace_id, AccessLevel::ApplyRun)
            .await?;
        if run.apply_id.is_empty() {
            return Err(OrchestratorError::invalid_input(format!(
                "run {run_id} is speculative and has no apply stage"
            )));
        }
        let workspace = self.fetch_workspace(&run.workspace_id).await?;

        // Apply-stage rule evaluation is scoped by the resolved module; runs
        // without a module source skip it entirely.
        if run.module_source.is_some() {
            let identities = self.db.list_managed_identities(&workspace.id).await?;
            let ctx = RuleContext {
                stage: RunStage::Apply,
                module_digest: run.module_digest.clone(),
                module_source: run.module_source.clone(),
                module_version: run.module_version.clone(),
                state_version_id: workspace.current_state_version_id.clone(),
            };
            self.policy
                .evaluate_managed_identities(&identities, &ctx)
                .await?;
        }

        let mut apply = self.fetch_apply(&run.apply_id).await?;
        let tx = self.db.begin().await?;
        let outcome = async {
            apply.triggered_by = Some(caller.id.clone());
            apply.comment = comment;
            self.writer
                .transition_apply(&*tx, &mut apply, ApplyStatus::Queued)
                .await?;
            self.writer
                .transition_run(&*tx, &mut run, RunStatus::ApplyQueued)
                .await?;

            let tags = self.resolve_job_tags(&workspace.namespace_path).await?;
            let job = Job::new(
                JobKind::Apply,
                &workspace.id,
                &run.id,
                workspace.max_job_duration,
                tags,
            );
            tx.insert_job(&job).await?;
            tx.create_log_stream(&job.id).await?;

            self.activity
                .record(
                    &workspace.namespace_path,
                    ActivityAction::Update,
                    "run",
                    &run.id,
                )
                .await
        }
        .await;
        match outcome {
            Ok(()) => {
                tx.commit().await.op_context("commit apply run")?;
                Ok(run)
            }
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    // --- cancellation -----------------------------------------------------

    pub async fn cancel_run(&self, caller: &Caller, run_id: &str, force: bool) -> Result<Run> {
        self.traced("cancel_run", self.cancel_run_inner(caller, run_id, force))
            .await
    }

    async fn cancel_run_inner(&self, caller: &Caller, run_id: &str, force: bool) -> Result<Run> {
        let mut run = self.fetch_run(run_id).await?;
        self.authorizer
            .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
            .await?;

        if run.status.cancel_terminal() {
            return Err(OrchestratorError::invalid_input(format!(
                "run {run_id} cannot be canceled from status {:?}",
                run.status
            )));
        }

        let now = Utc::now();
        if force {
            let eligible = run
                .force_cancel_available_at
                .map(|at| now >= at)
                .unwrap_or(false);
            if !eligible {
                return Err(OrchestratorError::invalid_input(format!(
                    "run {run_id} is not eligible for forced cancel; request a graceful cancel \
                     and wait {FORCE_CANCEL_WAIT_SECS}s first"
                )));
            }
        }

        // Cancel whichever sub-resource currently owns forward progress.
        match run.status {
            RunStatus::Planned => {
                // Apply not yet queued: flip it directly, no job involved.
                if run.apply_id.is_empty() {
                    return Err(OrchestratorError::internal(format!(
                        "run {run_id} is planned but has no apply sub-resource"
                    )));
                }
                let mut apply = self.fetch_apply(&run.apply_id).await?;
                let tx = self.db.begin().await?;
                match self
                    .writer
                    .transition_apply(&*tx, &mut apply, ApplyStatus::Canceled)
                    .await
                {
                    Ok(()) => tx.commit().await.op_context("commit apply cancellation")?,
                    Err(err) => {
                        rollback(tx).await;
                        return Err(err);
                    }
                }
            }
            RunStatus::PlanQueued => {
                // Plan job not yet started: flip the plan directly.
                let mut plan = self.fetch_plan(&run.plan_id).await?;
                let tx = self.db.begin().await?;
                match self
                    .writer
                    .transition_plan(&*tx, &mut plan, PlanStatus::Canceled)
                    .await
                {
                    Ok(()) => tx.commit().await.op_context("commit plan cancellation")?,
                    Err(err) => {
                        rollback(tx).await;
                        return Err(err);
                    }
                }
            }
            _ => {
                self.cancel_active_run(caller, &mut run, force, now).await?;
            }
        }
        Ok(run)
    }

    /// A job is actively running: graceful cancellation signals it and arms
    /// the force-eligibility timestamp; forced cancellation flips the owning
    /// sub-resource without waiting for the worker.
    async fn cancel_active_run(
        &self,
        caller: &Caller,
        run: &mut Run,
        force: bool,
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let workspace = self.fetch_workspace(&run.workspace_id).await?;
        let tx = self.db.begin().await?;
        let outcome = async {
            let action = if force {
                run.force_canceled = true;
                run.force_canceled_by = Some(caller.id.clone());
                self.writer.persist_run(&*tx, run).await?;

                // The job row is left alone: the worker's process may keep
                // running until it independently notices.
                let job = self.latest_job(&*tx, &run.id).await?;
                match job.kind {
                    JobKind::Plan => {
                        let mut plan = self.fetch_plan(&run.plan_id).await?;
                        self.writer
                            .transition_plan(&*tx, &mut plan, PlanStatus::Canceled)
                            .await?;
                    }
                    JobKind::Apply => {
                        let mut apply = self.fetch_apply(&run.apply_id).await?;
                        self.writer
                            .transition_apply(&*tx, &mut apply, ApplyStatus::Canceled)
                            .await?;
                    }
                }
                ActivityAction::CancelForced
            } else {
                if run.force_cancel_available_at.is_none() {
                    run.force_cancel_available_at =
                        Some(now + Duration::seconds(FORCE_CANCEL_WAIT_SECS));
                }
                let mut job = self.latest_job(&*tx, &run.id).await?;
                job.cancel_requested = true;
                job.cancel_requested_at = Some(now);
                self.writer.persist_job(&*tx, &job).await?;
                self.writer.persist_run(&*tx, run).await?;
                ActivityAction::Cancel
            };
            self.activity
                .record(&workspace.namespace_path, action, "run", &run.id)
                .await
        }
        .await;
        match outcome {
            Ok(()) => tx.commit().await.op_context("commit run cancellation"),
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        }
    }

    async fn latest_job(&self, tx: &dyn Transaction, run_id: &str) -> Result<Job> {
        tx.latest_job_for_run(run_id).await?.ok_or_else(|| {
            OrchestratorError::internal(format!("run {run_id} has no associated job"))
        })
    }

    // --- fetch ------------------------------------------------------------

    pub async fn get_run(&self, caller: &Caller, run_id: &str) -> Result<Run> {
        self.traced("get_run", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::View)
                .await?;
            Ok(run)
        })
        .await
    }

    pub async fn get_runs(&self, caller: &Caller, filter: &RunFilter) -> Result<Vec<Run>> {
        self.traced("get_runs", async {
            if let Some(workspace_id) = &filter.workspace_id {
                self.authorizer
                    .require_workspace_access(caller, workspace_id, AccessLevel::View)
                    .await?;
                return self.db.list_runs(filter).await;
            }
            let runs = self.db.list_runs(filter).await?;
            if caller.admin {
                return Ok(runs);
            }
            let mut visible = Vec::with_capacity(runs.len());
            for run in runs {
                if self.db.get_run_visible(caller, &run.id).await?.is_some() {
                    visible.push(run);
                }
            }
            Ok(visible)
        })
        .await
    }

    // --- variables --------------------------------------------------------

    pub async fn get_run_variables(
        &self,
        caller: &Caller,
        run_id: &str,
        include_sensitive: bool,
    ) -> Result<Vec<Variable>> {
        self.traced("get_run_variables", async {
            let run = self.fetch_run(run_id).await?;
            let level = if include_sensitive {
                AccessLevel::CreateRun
            } else {
                AccessLevel::View
            };
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, level)
                .await?;
            self.variables
                .get_run_variables(&run.id, include_sensitive)
                .await
        })
        .await
    }

    pub async fn set_run_variables(
        &self,
        caller: &Caller,
        run_id: &str,
        variables: &[Variable],
    ) -> Result<()> {
        self.traced("set_run_variables", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
                .await?;
            self.variables.replace_run_variables(&run.id, variables).await
        })
        .await
    }

    /// Flag which variables were rendered into the generated configuration.
    pub async fn mark_variables_included(
        &self,
        caller: &Caller,
        run_id: &str,
        keys: &[(String, VariableCategory)],
    ) -> Result<()> {
        self.traced("mark_variables_included", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
                .await?;
            let mut variables = self.variables.get_run_variables(&run.id, false).await?;
            for variable in &mut variables {
                if keys
                    .iter()
                    .any(|(key, category)| key == &variable.key && *category == variable.category)
                {
                    variable.included_in_config = true;
                }
            }
            self.variables.replace_run_variables(&run.id, &variables).await
        })
        .await
    }

    // --- plan ingestion and status ----------------------------------------

    /// Ingest the computed diff reported by a plan worker: tally summary
    /// counters, persist diff and raw plan artifacts, record the diff size.
    pub async fn ingest_plan_data(
        &self,
        caller: &Caller,
        run_id: &str,
        diff: &PlanDiff,
        raw_plan: Vec<u8>,
    ) -> Result<Plan> {
        self.traced("ingest_plan_data", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
                .await?;
            let mut plan = self.fetch_plan(&run.plan_id).await?;

            let encoded = serde_json::to_vec(diff)
                .map_err(|err| anyhow::anyhow!("encode plan diff: {err}"))?;
            plan.summary = ingest::summarize(diff);
            plan.diff_size = encoded.len() as u64;

            self.artifacts
                .put(ArtifactKind::PlanDiff, run_id, encoded)
                .await
                .op_context("store plan diff")?;
            self.artifacts
                .put(ArtifactKind::RawPlan, run_id, raw_plan)
                .await
                .op_context("store raw plan")?;

            let tx = self.db.begin().await?;
            match self.writer.persist_plan(&*tx, &mut plan).await {
                Ok(()) => tx.commit().await.op_context("commit plan ingestion")?,
                Err(err) => {
                    rollback(tx).await;
                    return Err(err);
                }
            }
            Ok(plan)
        })
        .await
    }

    /// Worker-reported plan status change, propagated to the run.
    pub async fn update_plan_status(
        &self,
        caller: &Caller,
        run_id: &str,
        status: PlanStatus,
        error_message: Option<String>,
    ) -> Result<Run> {
        self.traced("update_plan_status", async {
            let mut run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
                .await?;
            let mut plan = self.fetch_plan(&run.plan_id).await?;

            let next_run = match status {
                PlanStatus::Running => Some(RunStatus::Planning),
                PlanStatus::Finished => {
                    if run.speculative() || !plan.summary.has_changes() {
                        Some(RunStatus::PlannedAndFinished)
                    } else {
                        Some(RunStatus::Planned)
                    }
                }
                PlanStatus::Errored => Some(RunStatus::Errored),
                PlanStatus::Canceled => Some(RunStatus::Canceled),
                PlanStatus::Queued | PlanStatus::Pending => None,
            };

            let tx = self.db.begin().await?;
            let outcome = async {
                if status == PlanStatus::Errored {
                    plan.error_message = error_message.clone();
                }
                self.writer.transition_plan(&*tx, &mut plan, status).await?;
                if let Some(next) = next_run {
                    self.writer.transition_run(&*tx, &mut run, next).await?;
                }
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => {
                    tx.commit().await.op_context("commit plan status update")?;
                    Ok(run)
                }
                Err(err) => {
                    rollback(tx).await;
                    Err(err)
                }
            }
        })
        .await
    }

    /// Worker-reported apply status change, propagated to the run.
    pub async fn update_apply_status(
        &self,
        caller: &Caller,
        run_id: &str,
        status: ApplyStatus,
        error_message: Option<String>,
    ) -> Result<Run> {
        self.traced("update_apply_status", async {
            let mut run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::ApplyRun)
                .await?;
            if run.apply_id.is_empty() {
                return Err(OrchestratorError::invalid_input(format!(
                    "run {run_id} has no apply stage"
                )));
            }
            let mut apply = self.fetch_apply(&run.apply_id).await?;

            let next_run = match status {
                ApplyStatus::Running => Some(RunStatus::Applying),
                ApplyStatus::Finished => Some(RunStatus::Applied),
                ApplyStatus::Errored => Some(RunStatus::Errored),
                ApplyStatus::Canceled => Some(RunStatus::Canceled),
                ApplyStatus::Created | ApplyStatus::Queued | ApplyStatus::Pending => None,
            };

            let tx = self.db.begin().await?;
            let outcome = async {
                if status == ApplyStatus::Errored {
                    apply.error_message = error_message.clone();
                }
                self.writer
                    .transition_apply(&*tx, &mut apply, status)
                    .await?;
                if let Some(next) = next_run {
                    self.writer.transition_run(&*tx, &mut run, next).await?;
                }
                Ok(())
            }
            .await;
            match outcome {
                Ok(()) => {
                    tx.commit().await.op_context("commit apply status update")?;
                    Ok(run)
                }
                Err(err) => {
                    rollback(tx).await;
                    Err(err)
                }
            }
        })
        .await
    }

    // --- plan artifacts ---------------------------------------------------

    pub async fn upload_plan_binary(
        &self,
        caller: &Caller,
        run_id: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        self.traced("upload_plan_binary", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
                .await?;
            self.artifacts
                .put(ArtifactKind::PlanCache, run_id, data)
                .await
        })
        .await
    }

    pub async fn download_plan_binary(&self, caller: &Caller, run_id: &str) -> Result<Vec<u8>> {
        self.traced("download_plan_binary", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::View)
                .await?;
            self.artifacts.get(ArtifactKind::PlanCache, run_id).await
        })
        .await
    }

    /// Store a diff document as-is, without re-tallying summary counters.
    pub async fn upload_diff(&self, caller: &Caller, run_id: &str, diff: &PlanDiff) -> Result<()> {
        self.traced("upload_diff", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::CreateRun)
                .await?;
            let encoded = serde_json::to_vec(diff)
                .map_err(|err| anyhow::anyhow!("encode plan diff: {err}"))?;
            self.artifacts
                .put(ArtifactKind::PlanDiff, run_id, encoded)
                .await
        })
        .await
    }

    pub async fn download_diff(&self, caller: &Caller, run_id: &str) -> Result<PlanDiff> {
        self.traced("download_diff", async {
            let run = self.fetch_run(run_id).await?;
            self.authorizer
                .require_workspace_access(caller, &run.workspace_id, AccessLevel::View)
                .await?;
            let blob = self.artifacts.get(ArtifactKind::PlanDiff, run_id).await?;
            serde_json::from_slice(&blob)
                .map_err(|err| anyhow::anyhow!("decode plan diff: {err}").into())
        })
        .await
    }

    // --- events -----------------------------------------------------------

    /// Subscribe to run-change events. The only operation that spawns a
    /// long-lived task.
    pub async fn watch_runs(
        &self,
        caller: &Caller,
        filter: RunWatchFilter,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RunEvent>> {
        self.traced("watch_runs", self.watcher.watch(caller, filter, cancel))
            .await
    }

    // --- helpers ----------------------------------------------------------

    async fn fetch_run(&self, run_id: &str) -> Result<Run> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("run {run_id} not found")))
    }

    async fn fetch_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.db.get_workspace(workspace_id).await?.ok_or_else(|| {
            OrchestratorError::not_found(format!("workspace {workspace_id} not found"))
        })
    }

    async fn fetch_plan(&self, plan_id: &str) -> Result<Plan> {
        self.db
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("plan {plan_id} not found")))
    }

    async fn fetch_apply(&self, apply_id: &str) -> Result<Apply> {
        self.db
            .get_apply(apply_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(format!("apply {apply_id} not found")))
    }
}

/// Rollback failures are logged, never surfaced.
async fn rollback(tx: Box<dyn Transaction>) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!("transaction rollback failed: {err}");
    }
}

fn run_finished(status: RunStatus) -> bool {
    matches!(
        status,
        RunStatus::PlannedAndFinished
            | RunStatus::Applied
            | RunStatus::Canceled
            | RunStatus::Errored
    )
}

fn validate_create_request(request: &CreateRunRequest) -> Result<()> {
    match (
        &request.configuration_version_id,
        &request.module_source,
    ) {
        (Some(_), Some(_)) => {
            return Err(OrchestratorError::invalid_input(
                "configuration version and module source are mutually exclusive",
            ));
        }
        (None, None) => {
            return Err(OrchestratorError::invalid_input(
                "either a configuration version or a module source is required",
            ));
        }
        _ => {}
    }
    if request.module_version.is_some() && request.module_source.is_none() {
        return Err(OrchestratorError::invalid_input(
            "module version requires a module source",
        ));
    }
    if let Some(version) = &request.module_version {
        semver::Version::parse(version).map_err(|err| {
            OrchestratorError::invalid_input(format!("invalid module version {version}: {err}"))
        })?;
    }
    if request.refresh_only && request.is_destroy {
        return Err(OrchestratorError::invalid_input(
            "a refresh-only run cannot also be a destroy run",
        ));
    }
    Ok(())
}
