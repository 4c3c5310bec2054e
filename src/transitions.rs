//! Legal status transitions and the run-state persistence collaborator.
//!
//! Every mutation of a Run/Plan/Apply/Job row after creation passes through
//! [`RunStateWriter`], which validates the transition against an explicit
//! table and emits a change event on the bus. Illegal transitions are
//! rejected uniformly here instead of being re-checked at each call site.

use std::sync::Arc;

use crate::deps::{ChangeEvent, EntityKind, EventAction, EventBus, Transaction};
use crate::errors::{OrchestratorError, Result};
use crate::models::{Apply, ApplyStatus, Job, Plan, PlanStatus, Run, RunStatus};

pub fn run_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Pending, PlanQueued)
            | (PlanQueued, Planning)
            | (PlanQueued, Canceled)
            | (PlanQueued, Errored)
            | (Planning, Planned)
            | (Planning, PlannedAndFinished)
            | (Planning, Canceled)
            | (Planning, Errored)
            | (Planned, ApplyQueued)
            | (Planned, PlannedAndFinished)
            | (Planned, Canceled)
            | (ApplyQueued, Applying)
            | (ApplyQueued, Canceled)
            | (ApplyQueued, Errored)
            | (Applying, Applied)
            | (Applying, Canceled)
            | (Applying, Errored)
    )
}

pub fn plan_transition_allowed(from: PlanStatus, to: PlanStatus) -> bool {
    use PlanStatus::*;
    matches!(
        (from, to),
        (Queued, Pending)
            | (Queued, Running)
            | (Queued, Canceled)
            | (Queued, Errored)
            | (Pending, Running)
            | (Pending, Canceled)
            | (Pending, Errored)
            | (Running, Finished)
            | (Running, Canceled)
            | (Running, Errored)
    )
}

pub fn apply_transition_allowed(from: ApplyStatus, to: ApplyStatus) -> bool {
    use ApplyStatus::*;
    matches!(
        (from, to),
        (Created, Queued)
            | (Created, Canceled)
            | (Queued, Pending)
            | (Queued, Running)
            | (Queued, Canceled)
            | (Queued, Errored)
            | (Pending, Running)
            | (Pending, Canceled)
            | (Pending, Errored)
            | (Running, Finished)
            | (Running, Canceled)
            | (Running, Errored)
    )
}

/// Single point of mutation for Run/Plan/Apply/Job rows after creation.
/// Job status itself is reported by workers out of band; the engine only
/// flags cancellation requests through [`RunStateWriter::persist_job`].
pub struct RunStateWriter {
    bus: Arc<dyn EventBus>,
}

impl RunStateWriter {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    async fn emit(&self, entity: EntityKind, action: EventAction, payload: &impl serde::Serialize) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(?entity, "failed to encode change event payload: {err}");
                return;
            }
        };
        self.bus
            .publish(ChangeEvent {
                entity,
                action,
                payload,
            })
            .await;
    }

    /// Announce a freshly committed row on the bus.
    pub async fn announce_created(&self, entity: EntityKind, payload: &impl serde::Serialize) {
        self.emit(entity, EventAction::Created, payload).await;
    }

    pub async fn transition_run(
        &self,
        tx: &dyn Transaction,
        run: &mut Run,
        next: RunStatus,
    ) -> Result<()> {
        if !run_transition_allowed(run.status, next) {
            return Err(OrchestratorError::invalid_input(format!(
                "illegal run transition {:?} -> {next:?} for run {}",
                run.status, run.id
            )));
        }
        run.status = next;
        tx.update_run(run).await?;
        self.emit(EntityKind::Run, EventAction::Updated, run).await;
        Ok(())
    }

    pub async fn transition_plan(
        &self,
        tx: &dyn Transaction,
        plan: &mut Plan,
        next: PlanStatus,
    ) -> Result<()> {
        if !plan_transition_allowed(plan.status, next) {
            return Err(OrchestratorError::invalid_input(format!(
                "illegal plan transition {:?} -> {next:?} for plan {}",
                plan.status, plan.id
            )));
        }
        plan.status = next;
        plan.version += 1;
        tx.update_plan(plan).await?;
        self.emit(EntityKind::Plan, EventAction::Updated, plan).await;
        Ok(())
    }

    pub async fn transition_apply(
        &self,
        tx: &dyn Transaction,
        apply: &mut Apply,
        next: ApplyStatus,
    ) -> Result<()> {
        if !apply_transition_allowed(apply.status, next) {
            return Err(OrchestratorError::invalid_input(format!(
                "illegal apply transition {:?} -> {next:?} for apply {}",
                apply.status, apply.id
            )));
        }
        apply.status = next;
        apply.version += 1;
        tx.update_apply(apply).await?;
        self.emit(EntityKind::Apply, EventAction::Updated, apply)
            .await;
        Ok(())
    }

    /// Persist non-status field changes on a run (force-cancel bookkeeping,
    /// comment updates). The status must be left untouched by the caller.
    pub async fn persist_run(&self, tx: &dyn Transaction, run: &Run) -> Result<()> {
        tx.update_run(run).await?;
        self.emit(EntityKind::Run, EventAction::Updated, run).await;
        Ok(())
    }

    pub async fn persist_plan(&self, tx: &dyn Transaction, plan: &mut Plan) -> Result<()> {
        plan.version += 1;
        tx.update_plan(plan).await?;
        self.emit(EntityKind::Plan, EventAction::Updated, plan).await;
        Ok(())
    }

    pub async fn persist_job(&self, tx: &dyn Transaction, job: &Job) -> Result<()> {
        tx.update_job(job).await?;
        self.emit(EntityKind::Job, EventAction::Updated, job).await;
        Ok(())
    }
}
