//! Plan ingestion: turns a computed diff from the external parser into plan
//! summary statistics and persisted artifacts.

use serde::{Deserialize, Serialize};

use crate::models::PlanSummary;

/// Change kind attached to each diff entry by the external parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    /// Replace orderings both count as an addition plus a destruction.
    DeleteThenCreate,
    CreateThenDelete,
    NoOp,
}

/// One ordered resource or output change in the normalized diff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffEntry {
    pub address: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub imported: bool,
    #[serde(default)]
    pub drifted: bool,
    #[serde(default)]
    pub unified_diff: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Normalized diff of ordered resource and output changes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanDiff {
    pub resources: Vec<DiffEntry>,
    pub outputs: Vec<DiffEntry>,
}

/// Aggregate change-type tallies for the plan summary.
pub fn summarize(diff: &PlanDiff) -> PlanSummary {
    let mut summary = PlanSummary::default();
    for entry in &diff.resources {
        tally(
            entry.kind,
            &mut summary.resource_additions,
            &mut summary.resource_changes,
            &mut summary.resource_destructions,
        );
        if entry.imported {
            summary.resource_imports += 1;
        }
        if entry.drifted {
            summary.resource_drift += 1;
        }
    }
    for entry in &diff.outputs {
        tally(
            entry.kind,
            &mut summary.output_additions,
            &mut summary.output_changes,
            &mut summary.output_destructions,
        );
    }
    summary
}

fn tally(kind: ChangeKind, additions: &mut u32, changes: &mut u32, destructions: &mut u32) {
    match kind {
        ChangeKind::Create => *additions += 1,
        ChangeKind::Update => *changes += 1,
        ChangeKind::Delete => *destructions += 1,
        ChangeKind::DeleteThenCreate | ChangeKind::CreateThenDelete => {
            *additions += 1;
            *destructions += 1;
        }
        ChangeKind::NoOp => {}
    }
}
