//! Stratoform run orchestration engine.
//!
//! The control-plane core that creates, advances and cancels runs against a
//! managed workspace, gates mutations behind policy checks, resolves and
//! redacts the variables handed to job workers, and republishes a filtered,
//! authorized stream of run-change events.
//!
//! Transport, persistence, object storage, secret encryption and the workers
//! themselves are external collaborators injected through the traits in
//! [`deps`].

pub mod deps;
pub mod errors;
pub mod events;
pub mod ingest;
pub mod models;
pub mod policy;
pub mod service;
pub mod trace;
pub mod transitions;
pub mod variables;

pub use deps::{Caller, RunFilter};
pub use errors::{ErrorKind, OrchestratorError, Result};
pub use events::{RunEvent, RunWatchFilter};
pub use models::{Apply, Job, Plan, Run, RunStatus, Variable};
pub use service::{CreateRunRequest, RunService, RunServiceDeps};
