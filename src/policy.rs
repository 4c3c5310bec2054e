//! Policy gating evaluated before any mutation: destroy prevention,
//! Terraform-version compatibility, resource limits and managed-identity
//! access rules.

use std::sync::Arc;

use crate::deps::{LimitChecker, RuleEvaluator, VersionCatalog};
use crate::errors::{OrchestratorError, Result, ResultExt};
use crate::models::{ManagedIdentity, RuleContext, Workspace};

/// Rolling-window ceiling on run creation, checked inside the create
/// transaction.
pub const LIMIT_RUNS_PER_WORKSPACE_PER_HOUR: &str = "runs_per_workspace_per_hour";

pub struct PolicyGate {
    rules: Arc<dyn RuleEvaluator>,
    limits: Arc<dyn LimitChecker>,
    versions: Arc<dyn VersionCatalog>,
}

impl PolicyGate {
    pub fn new(
        rules: Arc<dyn RuleEvaluator>,
        limits: Arc<dyn LimitChecker>,
        versions: Arc<dyn VersionCatalog>,
    ) -> Self {
        Self {
            rules,
            limits,
            versions,
        }
    }

    /// Reject destroy runs on workspaces that forbid them.
    pub fn check_destroy_allowed(&self, workspace: &Workspace, is_destroy: bool) -> Result<()> {
        if is_destroy && workspace.prevent_destroy_plan {
            return Err(OrchestratorError::invalid_input(format!(
                "workspace {} does not allow destroy plans",
                workspace.id
            )));
        }
        Ok(())
    }

    /// Resolve the Terraform version for a run: explicit override, else the
    /// workspace default, else the latest supported release. The result must
    /// parse as semver and appear in the supported catalog.
    pub async fn resolve_terraform_version(
        &self,
        requested: Option<&str>,
        workspace: &Workspace,
    ) -> Result<String> {
        let supported = self
            .versions
            .supported_versions()
            .await
            .op_context("list supported terraform versions")?;
        let requested = requested
            .map(str::to_string)
            .or_else(|| {
                let default = workspace.terraform_version.trim();
                (!default.is_empty()).then(|| default.to_string())
            });
        let version = match requested {
            Some(raw) => {
                let parsed = semver::Version::parse(&raw).map_err(|err| {
                    OrchestratorError::invalid_input(format!(
                        "invalid terraform version {raw}: {err}"
                    ))
                })?;
                if !supported.contains(&parsed) {
                    return Err(OrchestratorError::invalid_input(format!(
                        "terraform version {raw} is not supported"
                    )));
                }
                parsed
            }
            None => supported
                .into_iter()
                .max()
                .ok_or_else(|| OrchestratorError::internal("no supported terraform versions"))?,
        };
        Ok(version.to_string())
    }

    /// Check the rolling-window run count against the configured ceiling.
    pub async fn check_run_limit(&self, count: u64) -> Result<()> {
        self.limits
            .check(LIMIT_RUNS_PER_WORKSPACE_PER_HOUR, count)
            .await
    }

    /// Evaluate access rules for every managed identity attached to the
    /// workspace, sequentially, aborting on the first failure.
    pub async fn evaluate_managed_identities(
        &self,
        identities: &[ManagedIdentity],
        ctx: &RuleContext,
    ) -> Result<()> {
        for identity in identities {
            self.rules.evaluate(identity, ctx).await.map_err(|err| {
                err.context(format!("managed identity {} access rule", identity.name))
            })?;
        }
        Ok(())
    }
}
