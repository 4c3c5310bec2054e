//! Per-subscriber run event filtering.
//!
//! Each subscription runs one dedicated delivery task over the generic
//! row-change bus. Raw payloads are never forwarded verbatim: the
//! authoritative Run row is re-fetched before delivery so partially-applied
//! writes and revoked access are filtered out.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::deps::{
    AccessLevel, Authorizer, Caller, ChangeEvent, DataClient, EntityKind, EventAction, EventBus,
};
use crate::errors::{OrchestratorError, Result};
use crate::models::Run;

#[derive(Clone, Debug, Default)]
pub struct RunWatchFilter {
    pub workspace_id: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RunEvent {
    pub action: EventAction,
    pub run: Run,
}

pub struct RunWatcher {
    db: Arc<dyn DataClient>,
    bus: Arc<dyn EventBus>,
    authorizer: Arc<dyn Authorizer>,
}

impl RunWatcher {
    pub fn new(
        db: Arc<dyn DataClient>,
        bus: Arc<dyn EventBus>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            db,
            bus,
            authorizer,
        }
    }

    /// Subscribe to run-change events. The returned receiver has capacity
    /// one: if the caller stops reading, delivery blocks until `cancel`
    /// fires, at which point the task exits and unsubscribes from the bus.
    pub async fn watch(
        &self,
        caller: &Caller,
        filter: RunWatchFilter,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RunEvent>> {
        if let Some(workspace_id) = &filter.workspace_id {
            self.authorizer
                .require_workspace_access(caller, workspace_id, AccessLevel::View)
                .await?;
        } else if !caller.user || caller.admin {
            return Err(OrchestratorError::forbidden(
                "unfiltered run subscriptions are limited to individual non-admin callers",
            ));
        }

        let (subscription, raw_rx) = self
            .bus
            .subscribe(EntityKind::Run, &[EventAction::Created, EventAction::Updated])
            .await?;
        let (out_tx, out_rx) = mpsc::channel(1);

        let db = self.db.clone();
        let bus = self.bus.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            deliver(db, caller, filter, raw_rx, out_tx, cancel).await;
            // Cleanup runs on every exit path of the delivery loop.
            bus.unsubscribe(subscription).await;
            tracing::debug!(subscription, "run event subscription closed");
        });
        Ok(out_rx)
    }
}

async fn deliver(
    db: Arc<dyn DataClient>,
    caller: Caller,
    filter: RunWatchFilter,
    mut raw_rx: mpsc::Receiver<ChangeEvent>,
    out_tx: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("run event subscriber canceled by caller");
                return;
            }
            event = raw_rx.recv() => match event {
                Some(event) => event,
                None => {
                    tracing::debug!("run event bus closed");
                    return;
                }
            },
        };

        // A malformed payload is one writer's bug, not a subscriber-fatal
        // condition; skip it and keep the stream alive.
        let run: Run = match serde_json::from_value(event.payload) {
            Ok(run) => run,
            Err(err) => {
                tracing::error!("undecodable run change event skipped: {err}");
                continue;
            }
        };
        if !matches(&filter, &run) {
            continue;
        }

        // Re-read the authoritative row; the raw payload may race with
        // partially-applied writes or exceed the caller's scope.
        let current = match db.get_run_visible(&caller, &run.id).await {
            Ok(Some(run)) => run,
            Ok(None) => continue,
            Err(err) => {
                tracing::error!(run_id = %run.id, "run refetch failed: {err}");
                return;
            }
        };

        let delivery = RunEvent {
            action: event.action,
            run: current,
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("run event subscriber canceled while delivering");
                return;
            }
            sent = out_tx.send(delivery) => {
                if sent.is_err() {
                    // Receiver dropped without canceling; nothing left to do.
                    return;
                }
            }
        }
    }
}

fn matches(filter: &RunWatchFilter, run: &Run) -> bool {
    if let Some(run_id) = &filter.run_id
        && run_id != &run.id
    {
        return false;
    }
    if let Some(workspace_id) = &filter.workspace_id
        && workspace_id != &run.workspace_id
    {
        return false;
    }
    true
}
