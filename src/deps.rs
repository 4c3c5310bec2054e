//! Collaborator contracts consumed by the orchestration engine.
//!
//! All of these are constructor-injected trait objects so each one can be
//! substituted independently in tests. The engine owns none of the
//! implementations: persistence, object storage, secret handling, rule
//! evaluation and module resolution live in external services.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::models::{
    Apply, ConfigurationVersion, Job, ManagedIdentity, Plan, RuleContext, Run, SecretVersion,
    Variable, Workspace,
};

/// Identity of the (already authenticated) caller of a public operation.
#[derive(Clone, Debug)]
pub struct Caller {
    pub id: String,
    /// True for individual users, false for service accounts.
    pub user: bool,
    pub admin: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessLevel {
    View,
    CreateRun,
    ApplyRun,
}

/// Coarse-grained permission checks, performed by an external authorizer.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn require_workspace_access(
        &self,
        caller: &Caller,
        workspace_id: &str,
        level: AccessLevel,
    ) -> Result<()>;

    /// Whether the caller may use an access-restricted module.
    async fn can_use_module(&self, caller: &Caller, module_source: &str) -> Result<bool>;
}

#[derive(Clone, Debug, Default)]
pub struct RunFilter {
    pub workspace_id: Option<String>,
    pub assessment_only: bool,
}

/// Transactional CRUD surface over the control-plane store.
#[async_trait]
pub trait DataClient: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;
    /// Fetch a run constrained to what the caller may see; None when the run
    /// exists but is outside the caller's scope.
    async fn get_run_visible(&self, caller: &Caller, id: &str) -> Result<Option<Run>>;

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>>;
    async fn get_apply(&self, id: &str) -> Result<Option<Apply>>;
    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>>;
    async fn get_configuration_version(&self, id: &str) -> Result<Option<ConfigurationVersion>>;
    async fn list_managed_identities(&self, workspace_id: &str) -> Result<Vec<ManagedIdentity>>;

    /// Namespace-scoped variables for every ancestor of the workspace,
    /// sorted by namespace path in descending order (closest ancestor first).
    async fn list_namespace_variables(&self, namespace_path: &str) -> Result<Vec<Variable>>;

    /// Runner tag set configured directly on the named namespace, if any.
    async fn namespace_tags(&self, namespace_path: &str) -> Result<Option<Vec<String>>>;

    async fn get_secret_versions(&self, ids: &[String]) -> Result<Vec<SecretVersion>>;

    /// Most recent job for a run, used to target cancellation signals.
    async fn latest_job_for_run(&self, run_id: &str) -> Result<Option<Job>>;
}

/// One open transaction. All writes inside it become visible atomically at
/// commit; dropping without commit must leave no visible state change.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn insert_plan(&self, plan: &Plan) -> Result<()>;
    async fn insert_apply(&self, apply: &Apply) -> Result<()>;
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn update_run(&self, run: &Run) -> Result<()>;
    async fn update_plan(&self, plan: &Plan) -> Result<()>;
    async fn update_apply(&self, apply: &Apply) -> Result<()>;
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Allocate the log stream workers append job output to.
    async fn create_log_stream(&self, job_id: &str) -> Result<String>;

    /// Count of runs created for the workspace at or after `since`,
    /// including rows inserted earlier in this transaction.
    async fn count_runs_since(&self, workspace_id: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn latest_job_for_run(&self, run_id: &str) -> Result<Option<Job>>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RunVariables,
    PlanDiff,
    RawPlan,
    PlanCache,
}

/// Opaque binary storage addressed by run.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, kind: ArtifactKind, run_id: &str, data: Vec<u8>) -> Result<()>;
    async fn get(&self, kind: ArtifactKind, run_id: &str) -> Result<Vec<u8>>;
}

/// Decrypts a stored secret payload back to plaintext.
#[async_trait]
pub trait SecretManager: Send + Sync {
    async fn resolve(&self, key: &str, data: &[u8]) -> Result<String>;
}

/// Per-stage access rules attached to a managed identity. A failed rule
/// surfaces as a Forbidden error carrying the evaluator's reason.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, identity: &ManagedIdentity, ctx: &RuleContext) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct ResolvedModule {
    pub source: String,
    pub version: semver::Version,
    pub digest: String,
    /// True when the module's registry visibility is restricted.
    pub restricted: bool,
}

/// Narrow module-registry interface: parse a source string and resolve the
/// concrete version and content digest.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve(
        &self,
        source: &str,
        wanted_version: Option<&str>,
    ) -> Result<ResolvedModule>;
}

/// Compares a live count against a configured ceiling for a named limit.
/// Violations surface as InvalidInput.
#[async_trait]
pub trait LimitChecker: Send + Sync {
    async fn check(&self, limit_name: &str, value: u64) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityAction {
    Create,
    Update,
    Cancel,
    CancelForced,
}

/// Appends audit entries for namespace-scoped resources.
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record(
        &self,
        namespace_path: &str,
        action: ActivityAction,
        target_kind: &str,
        target_id: &str,
    ) -> Result<()>;
}

/// Terraform-version compatibility surface.
#[async_trait]
pub trait VersionCatalog: Send + Sync {
    async fn supported_versions(&self) -> Result<Vec<semver::Version>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    Created,
    Updated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Run,
    Plan,
    Apply,
    Job,
}

/// Raw row-change notification from the underlying store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub action: EventAction,
    pub payload: serde_json::Value,
}

pub type SubscriptionId = u64;

/// Generic create/update event bus fed by the data store's change
/// notifications. Subscribers receive raw events filtered by entity type.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(
        &self,
        entity: EntityKind,
        actions: &[EventAction],
    ) -> Result<(SubscriptionId, mpsc::Receiver<ChangeEvent>)>;

    async fn unsubscribe(&self, id: SubscriptionId);

    async fn publish(&self, event: ChangeEvent);
}
