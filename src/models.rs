//! Persisted rows and lifecycle enums for runs, plans, applies and jobs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Run lifecycle. Terminal states are final; a Run row is never deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    PlannedAndFinished,
    ApplyQueued,
    Applying,
    Applied,
    Canceled,
    Errored,
}

impl RunStatus {
    /// States in which cancellation is always rejected.
    pub fn cancel_terminal(self) -> bool {
        matches!(
            self,
            Self::PlannedAndFinished | Self::Applied | Self::Canceled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Queued,
    Pending,
    Running,
    Finished,
    Canceled,
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Created,
    Queued,
    Pending,
    Running,
    Finished,
    Canceled,
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Pending,
    Running,
    Finished,
    Failed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Plan,
    Apply,
}

/// One request to plan, and optionally apply, changes against a workspace.
///
/// Exactly one of `configuration_version_id` / `module_source` is set.
/// `apply_id` is empty when the run is speculative.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workspace_id: String,
    pub status: RunStatus,
    pub plan_id: String,
    pub apply_id: String,
    pub configuration_version_id: Option<String>,
    pub module_source: Option<String>,
    pub module_version: Option<String>,
    pub module_digest: Option<String>,
    pub terraform_version: String,
    pub is_destroy: bool,
    pub is_assessment: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub target_addresses: Vec<String>,
    pub comment: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub force_cancel_available_at: Option<DateTime<Utc>>,
    pub force_canceled: bool,
    pub force_canceled_by: Option<String>,
}

impl Run {
    pub fn speculative(&self) -> bool {
        self.apply_id.is_empty()
    }
}

/// Change-summary counters reported after plan ingestion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub resource_additions: u32,
    pub resource_changes: u32,
    pub resource_destructions: u32,
    pub resource_imports: u32,
    pub resource_drift: u32,
    pub output_additions: u32,
    pub output_changes: u32,
    pub output_destructions: u32,
}

impl PlanSummary {
    pub fn has_changes(&self) -> bool {
        self.resource_additions > 0
            || self.resource_changes > 0
            || self.resource_destructions > 0
            || self.resource_imports > 0
            || self.output_additions > 0
            || self.output_changes > 0
            || self.output_destructions > 0
    }
}

/// Read-only analysis sub-resource of a Run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub workspace_id: String,
    pub status: PlanStatus,
    pub summary: PlanSummary,
    pub error_message: Option<String>,
    pub diff_size: u64,
    pub version: u64,
}

impl Plan {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            id: new_id("plan"),
            workspace_id: workspace_id.into(),
            status: PlanStatus::Queued,
            summary: PlanSummary::default(),
            error_message: None,
            diff_size: 0,
            version: 0,
        }
    }
}

/// Mutating-execution sub-resource of a Run; absent for speculative runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Apply {
    pub id: String,
    pub workspace_id: String,
    pub status: ApplyStatus,
    pub error_message: Option<String>,
    pub comment: Option<String>,
    pub triggered_by: Option<String>,
    pub version: u64,
}

impl Apply {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            id: new_id("apply"),
            workspace_id: workspace_id.into(),
            status: ApplyStatus::Created,
            error_message: None,
            comment: None,
            triggered_by: None,
            version: 0,
        }
    }
}

/// Unit of work handed to an out-of-process worker. A fresh Job is created
/// each time a stage is queued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub workspace_id: String,
    pub run_id: String,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub max_duration: Duration,
    pub tags: Vec<String>,
    pub queued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        workspace_id: impl Into<String>,
        run_id: impl Into<String>,
        max_duration: Duration,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: new_id("job"),
            kind,
            workspace_id: workspace_id.into(),
            run_id: run_id.into(),
            status: JobStatus::Queued,
            cancel_requested: false,
            cancel_requested_at: None,
            max_duration,
            tags,
            queued_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableCategory {
    Terraform,
    Environment,
}

/// One resolved configuration value passed to a worker.
///
/// `value` is nulled whenever `sensitive` is set before the variable reaches
/// durable storage; `secret_version_id` is kept so a later caller with
/// sufficient permission can re-resolve the plaintext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub category: VariableCategory,
    pub value: Option<String>,
    pub hcl: bool,
    pub sensitive: bool,
    /// Originating namespace path; None for run-supplied values.
    pub namespace_path: Option<String>,
    pub secret_version_id: Option<String>,
    #[serde(default)]
    pub included_in_config: bool,
}

/// Caller-supplied variable override on run creation. Highest precedence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunVariableInput {
    pub key: String,
    pub category: VariableCategory,
    pub value: String,
    pub hcl: bool,
}

/// Stage a managed-identity access rule is evaluated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Plan,
    Apply,
}

/// Opaque bundle handed to the external rule evaluator, once per managed
/// identity attached to the workspace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleContext {
    pub stage: RunStage,
    pub module_digest: Option<String>,
    pub module_source: Option<String>,
    pub module_version: Option<String>,
    pub state_version_id: Option<String>,
}

/// Workspace read model, fetched through the data client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    /// Hierarchical group/workspace address, e.g. `group/subgroup/ws`.
    pub namespace_path: String,
    pub terraform_version: String,
    pub prevent_destroy_plan: bool,
    pub max_job_duration: Duration,
    pub current_state_version_id: Option<String>,
    pub configuration_version_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigurationVersion {
    pub id: String,
    pub workspace_id: String,
    pub speculative: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagedIdentity {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
}

/// Encrypted secret payload referenced by a sensitive variable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretVersion {
    pub id: String,
    pub key: String,
    pub data: Vec<u8>,
}
