//! Variable precedence merging and secret redaction.
//!
//! Run-supplied variables win over namespace-scoped ones; among namespace
//! variables the closest ancestor wins. Sensitive values are nulled before
//! anything reaches durable blob storage, keeping only the secret-version
//! pointer for later re-resolution.

use std::collections::HashMap;
use std::sync::Arc;

use crate::deps::{ArtifactKind, ArtifactStore, DataClient, SecretManager};
use crate::errors::{OrchestratorError, Result, ResultExt};
use crate::models::{RunVariableInput, Variable, VariableCategory, Workspace};

pub struct VariableResolver {
    db: Arc<dyn DataClient>,
    artifacts: Arc<dyn ArtifactStore>,
    secrets: Arc<dyn SecretManager>,
}

impl VariableResolver {
    pub fn new(
        db: Arc<dyn DataClient>,
        artifacts: Arc<dyn ArtifactStore>,
        secrets: Arc<dyn SecretManager>,
    ) -> Self {
        Self {
            db,
            artifacts,
            secrets,
        }
    }

    /// Merge run-supplied overrides with namespace-scoped variables for the
    /// workspace, resolving sensitive winners to plaintext.
    pub async fn build_run_variables(
        &self,
        workspace: &Workspace,
        explicit: &[RunVariableInput],
    ) -> Result<Vec<Variable>> {
        let namespace_vars = self
            .db
            .list_namespace_variables(&workspace.namespace_path)
            .await
            .op_context("list namespace variables")?;
        let mut merged = merge_variables(explicit, namespace_vars)?;
        self.resolve_sensitive(&mut merged).await?;
        Ok(merged)
    }

    /// Null sensitive values and persist the variable blob for the run.
    pub async fn save_run_variables(&self, run_id: &str, variables: &[Variable]) -> Result<()> {
        let redacted: Vec<Variable> = variables.iter().cloned().map(redact).collect();
        let blob = serde_json::to_vec(&redacted)
            .map_err(|err| anyhow::anyhow!("encode run variables: {err}"))?;
        self.artifacts
            .put(ArtifactKind::RunVariables, run_id, blob)
            .await
            .op_context("store run variables")
    }

    /// Read the persisted (redacted) variable blob, optionally re-hydrating
    /// sensitive values through the secret manager.
    pub async fn get_run_variables(
        &self,
        run_id: &str,
        include_sensitive: bool,
    ) -> Result<Vec<Variable>> {
        let blob = self
            .artifacts
            .get(ArtifactKind::RunVariables, run_id)
            .await
            .op_context("fetch run variables")?;
        let mut variables: Vec<Variable> = serde_json::from_slice(&blob)
            .map_err(|err| anyhow::anyhow!("decode run variables: {err}"))?;
        if include_sensitive {
            self.resolve_sensitive(&mut variables).await?;
        }
        Ok(variables)
    }

    /// Overwrite the stored variable blob (sensitive values are re-redacted).
    pub async fn replace_run_variables(&self, run_id: &str, variables: &[Variable]) -> Result<()> {
        self.save_run_variables(run_id, variables).await
    }

    async fn resolve_sensitive(&self, variables: &mut [Variable]) -> Result<()> {
        let ids: Vec<String> = variables
            .iter()
            .filter(|v| v.sensitive)
            .filter_map(|v| v.secret_version_id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let versions = self
            .db
            .get_secret_versions(&ids)
            .await
            .op_context("fetch secret versions")?;
        let by_id: HashMap<&str, _> = versions.iter().map(|v| (v.id.as_str(), v)).collect();
        for variable in variables.iter_mut().filter(|v| v.sensitive) {
            let Some(version_id) = variable.secret_version_id.as_deref() else {
                continue;
            };
            let version = by_id.get(version_id).ok_or_else(|| {
                OrchestratorError::not_found(format!(
                    "secret version {version_id} referenced by variable {} not found",
                    variable.key
                ))
            })?;
            let plaintext = self
                .secrets
                .resolve(&version.key, &version.data)
                .await
                .op_context("resolve sensitive variable")?;
            variable.value = Some(plaintext);
        }
        Ok(())
    }
}

/// Precedence merge keyed by (key, category). Explicit run-supplied values
/// are inserted first; namespace variables fill only vacant slots and are
/// expected sorted by namespace path descending (closest ancestor first).
pub fn merge_variables(
    explicit: &[RunVariableInput],
    mut namespace_vars: Vec<Variable>,
) -> Result<Vec<Variable>> {
    let mut slots: HashMap<(String, VariableCategory), Variable> = HashMap::new();
    for input in explicit {
        if input.category == VariableCategory::Environment && input.hcl {
            return Err(OrchestratorError::invalid_input(format!(
                "environment variable {} cannot request HCL interpretation",
                input.key
            )));
        }
        slots.insert(
            (input.key.clone(), input.category),
            Variable {
                key: input.key.clone(),
                category: input.category,
                value: Some(input.value.clone()),
                hcl: input.hcl,
                sensitive: false,
                namespace_path: None,
                secret_version_id: None,
                included_in_config: false,
            },
        );
    }

    // Defensive re-sort so closest ancestor wins even if the collaborator
    // returned rows unordered.
    namespace_vars.sort_by(|a, b| b.namespace_path.cmp(&a.namespace_path));
    for variable in namespace_vars {
        slots
            .entry((variable.key.clone(), variable.category))
            .or_insert(variable);
    }

    let mut merged: Vec<Variable> = slots.into_values().collect();
    merged.sort_by(|a, b| (&a.key, a.category as u8).cmp(&(&b.key, b.category as u8)));
    Ok(merged)
}

fn redact(mut variable: Variable) -> Variable {
    if variable.sensitive {
        variable.value = None;
    }
    variable
}
