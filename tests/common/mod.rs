//! In-memory fakes for the engine's injected collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use stratoform::deps::{
    AccessLevel, ActivityAction, ActivityRecorder, ArtifactKind, ArtifactStore, Authorizer,
    Caller, ChangeEvent, DataClient, EntityKind, EventAction, EventBus, LimitChecker,
    ModuleResolver, ResolvedModule, RuleEvaluator, RunFilter, SecretManager, SubscriptionId,
    Transaction, VersionCatalog,
};
use stratoform::errors::{OrchestratorError, Result};
use stratoform::models::{
    Apply, ConfigurationVersion, Job, ManagedIdentity, Plan, RuleContext, Run, SecretVersion,
    Variable, Workspace,
};
use stratoform::service::{RunService, RunServiceDeps};
use stratoform::trace::TracingSpanFactory;

#[derive(Default)]
pub struct StoreState {
    pub runs: HashMap<String, Run>,
    pub plans: HashMap<String, Plan>,
    pub applies: HashMap<String, Apply>,
    pub jobs: Vec<Job>,
    pub workspaces: HashMap<String, Workspace>,
    pub configuration_versions: HashMap<String, ConfigurationVersion>,
    pub managed_identities: Vec<ManagedIdentity>,
    pub namespace_variables: Vec<Variable>,
    pub namespace_tags: HashMap<String, Vec<String>>,
    pub secret_versions: HashMap<String, SecretVersion>,
    pub log_streams: Vec<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn with_state<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// JSON snapshot of every mutable row, for zero-write assertions.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "runs": state.runs.values().collect::<Vec<_>>(),
            "plans": state.plans.values().collect::<Vec<_>>(),
            "applies": state.applies.values().collect::<Vec<_>>(),
            "jobs": state.jobs,
        })
    }
}

enum PendingWrite {
    Run(Run),
    Plan(Plan),
    Apply(Apply),
    Job(Job),
    LogStream(String),
}

pub struct FakeTransaction {
    state: Arc<Mutex<StoreState>>,
    pending: Mutex<Vec<PendingWrite>>,
}

impl FakeTransaction {
    fn push(&self, write: PendingWrite) {
        self.pending.lock().unwrap().push(write);
    }
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.push(PendingWrite::Run(run.clone()));
        Ok(())
    }

    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        self.push(PendingWrite::Plan(plan.clone()));
        Ok(())
    }

    async fn insert_apply(&self, apply: &Apply) -> Result<()> {
        self.push(PendingWrite::Apply(apply.clone()));
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.push(PendingWrite::Job(job.clone()));
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<()> {
        self.push(PendingWrite::Run(run.clone()));
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> Result<()> {
        self.push(PendingWrite::Plan(plan.clone()));
        Ok(())
    }

    async fn update_apply(&self, apply: &Apply) -> Result<()> {
        self.push(PendingWrite::Apply(apply.clone()));
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.push(PendingWrite::Job(job.clone()));
        Ok(())
    }

    async fn create_log_stream(&self, job_id: &str) -> Result<String> {
        let stream = format!("logs/{job_id}");
        self.push(PendingWrite::LogStream(stream.clone()));
        Ok(stream)
    }

    async fn count_runs_since(&self, workspace_id: &str, since: DateTime<Utc>) -> Result<u64> {
        let committed = {
            let state = self.state.lock().unwrap();
            state
                .runs
                .values()
                .filter(|run| run.workspace_id == workspace_id && run.created_at >= since)
                .count() as u64
        };
        let pending = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|write| match write {
                PendingWrite::Run(run) => {
                    run.workspace_id == workspace_id && run.created_at >= since
                }
                _ => false,
            })
            .count() as u64;
        Ok(committed + pending)
    }

    async fn latest_job_for_run(&self, run_id: &str) -> Result<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(latest_job(&state, run_id))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for write in self.pending.lock().unwrap().drain(..) {
            match write {
                PendingWrite::Run(run) => {
                    state.runs.insert(run.id.clone(), run);
                }
                PendingWrite::Plan(plan) => {
                    state.plans.insert(plan.id.clone(), plan);
                }
                PendingWrite::Apply(apply) => {
                    state.applies.insert(apply.id.clone(), apply);
                }
                PendingWrite::Job(job) => {
                    if let Some(existing) =
                        state.jobs.iter_mut().find(|candidate| candidate.id == job.id)
                    {
                        *existing = job;
                    } else {
                        state.jobs.push(job);
                    }
                }
                PendingWrite::LogStream(stream) => state.log_streams.push(stream),
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.pending.lock().unwrap().clear();
        Ok(())
    }
}

fn latest_job(state: &StoreState, run_id: &str) -> Option<Job> {
    state
        .jobs
        .iter()
        .filter(|job| job.run_id == run_id)
        .max_by_key(|job| job.queued_at)
        .cloned()
}

#[async_trait]
impl DataClient for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(FakeTransaction {
            state: self.state.clone(),
            pending: Mutex::new(Vec::new()),
        }))
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.state.lock().unwrap().runs.get(id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .values()
            .filter(|run| {
                filter
                    .workspace_id
                    .as_ref()
                    .is_none_or(|ws| ws == &run.workspace_id)
                    && (!filter.assessment_only || run.is_assessment)
            })
            .cloned()
            .collect())
    }

    async fn get_run_visible(&self, caller: &Caller, id: &str) -> Result<Option<Run>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .get(id)
            .filter(|run| caller.admin || run.created_by == caller.id)
            .cloned())
    }

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        Ok(self.state.lock().unwrap().plans.get(id).cloned())
    }

    async fn get_apply(&self, id: &str) -> Result<Option<Apply>> {
        Ok(self.state.lock().unwrap().applies.get(id).cloned())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.state.lock().unwrap().workspaces.get(id).cloned())
    }

    async fn get_configuration_version(&self, id: &str) -> Result<Option<ConfigurationVersion>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .configuration_versions
            .get(id)
            .cloned())
    }

    async fn list_managed_identities(&self, workspace_id: &str) -> Result<Vec<ManagedIdentity>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .managed_identities
            .iter()
            .filter(|identity| identity.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn list_namespace_variables(&self, namespace_path: &str) -> Result<Vec<Variable>> {
        let mut variables: Vec<Variable> = self
            .state
            .lock()
            .unwrap()
            .namespace_variables
            .iter()
            .filter(|variable| {
                variable
                    .namespace_path
                    .as_deref()
                    .is_some_and(|path| namespace_path.starts_with(path) || path == namespace_path)
            })
            .cloned()
            .collect();
        variables.sort_by(|a, b| b.namespace_path.cmp(&a.namespace_path));
        Ok(variables)
    }

    async fn namespace_tags(&self, namespace_path: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .namespace_tags
            .get(namespace_path)
            .cloned())
    }

    async fn get_secret_versions(&self, ids: &[String]) -> Result<Vec<SecretVersion>> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| state.secret_versions.get(id).cloned())
            .collect())
    }

    async fn latest_job_for_run(&self, run_id: &str) -> Result<Option<Job>> {
        Ok(latest_job(&self.state.lock().unwrap(), run_id))
    }
}

#[derive(Default)]
pub struct InMemoryArtifacts {
    blobs: Mutex<HashMap<(ArtifactKind, String), Vec<u8>>>,
}

#[async_trait]
impl ArtifactStore for InMemoryArtifacts {
    async fn put(&self, kind: ArtifactKind, run_id: &str, data: Vec<u8>) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert((kind, run_id.to_string()), data);
        Ok(())
    }

    async fn get(&self, kind: ArtifactKind, run_id: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&(kind, run_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("artifact {kind:?} for run {run_id}"))
            })
    }
}

/// Decrypts by interpreting the stored payload as UTF-8.
pub struct PlainSecrets;

#[async_trait]
impl SecretManager for PlainSecrets {
    async fn resolve(&self, _key: &str, data: &[u8]) -> Result<String> {
        String::from_utf8(data.to_vec())
            .map_err(|err| anyhow::anyhow!("secret payload is not utf-8: {err}").into())
    }
}

#[derive(Default)]
pub struct RecordingRules {
    pub deny_reason: Mutex<Option<String>>,
    pub contexts: Mutex<Vec<RuleContext>>,
}

#[async_trait]
impl RuleEvaluator for RecordingRules {
    async fn evaluate(&self, _identity: &ManagedIdentity, ctx: &RuleContext) -> Result<()> {
        self.contexts.lock().unwrap().push(ctx.clone());
        match self.deny_reason.lock().unwrap().clone() {
            Some(reason) => Err(OrchestratorError::forbidden(reason)),
            None => Ok(()),
        }
    }
}

pub struct CeilingLimits {
    pub max: Mutex<u64>,
}

impl Default for CeilingLimits {
    fn default() -> Self {
        Self {
            max: Mutex::new(u64::MAX),
        }
    }
}

#[async_trait]
impl LimitChecker for CeilingLimits {
    async fn check(&self, limit_name: &str, value: u64) -> Result<()> {
        if value > *self.max.lock().unwrap() {
            return Err(OrchestratorError::invalid_input(format!(
                "limit {limit_name} exceeded: {value}"
            )));
        }
        Ok(())
    }
}

pub struct StaticVersions;

#[async_trait]
impl VersionCatalog for StaticVersions {
    async fn supported_versions(&self) -> Result<Vec<semver::Version>> {
        Ok(vec![
            semver::Version::parse("1.5.0").unwrap(),
            semver::Version::parse("1.6.2").unwrap(),
        ])
    }
}

#[derive(Default)]
pub struct RecordingActivity {
    pub entries: Mutex<Vec<(String, ActivityAction, String)>>,
}

#[async_trait]
impl ActivityRecorder for RecordingActivity {
    async fn record(
        &self,
        namespace_path: &str,
        action: ActivityAction,
        _target_kind: &str,
        target_id: &str,
    ) -> Result<()> {
        self.entries.lock().unwrap().push((
            namespace_path.to_string(),
            action,
            target_id.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct AllowAllAuthorizer {
    pub restricted_modules_denied: bool,
    pub workspace_access_denied: bool,
}

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn require_workspace_access(
        &self,
        _caller: &Caller,
        workspace_id: &str,
        _level: AccessLevel,
    ) -> Result<()> {
        if self.workspace_access_denied {
            return Err(OrchestratorError::forbidden(format!(
                "no access to workspace {workspace_id}"
            )));
        }
        Ok(())
    }

    async fn can_use_module(&self, _caller: &Caller, _module_source: &str) -> Result<bool> {
        Ok(!self.restricted_modules_denied)
    }
}

pub struct StaticModules {
    pub restricted: bool,
}

#[async_trait]
impl ModuleResolver for StaticModules {
    async fn resolve(
        &self,
        source: &str,
        wanted_version: Option<&str>,
    ) -> Result<ResolvedModule> {
        let version = wanted_version.unwrap_or("1.2.3");
        Ok(ResolvedModule {
            source: source.to_string(),
            version: semver::Version::parse(version)
                .map_err(|err| OrchestratorError::invalid_input(err.to_string()))?,
            digest: format!("sha256:{source}"),
            restricted: self.restricted,
        })
    }
}

struct BusSubscriber {
    entity: EntityKind,
    sender: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
pub struct InMemoryBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, BusSubscriber>>,
    pub unsubscribed: Mutex<Vec<SubscriptionId>>,
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn subscribe(
        &self,
        entity: EntityKind,
        _actions: &[EventAction],
    ) -> Result<(SubscriptionId, mpsc::Receiver<ChangeEvent>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, BusSubscriber { entity, sender: tx });
        Ok((id, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id);
        self.unsubscribed.lock().unwrap().push(id);
    }

    async fn publish(&self, event: ChangeEvent) {
        let senders: Vec<mpsc::Sender<ChangeEvent>> = self
            .subscribers
            .lock()
            .unwrap()
            .values()
            .filter(|sub| sub.entity == event.entity)
            .map(|sub| sub.sender.clone())
            .collect();
        for sender in senders {
            let _ = sender.send(event.clone()).await;
        }
    }
}

pub struct Harness {
    pub store: InMemoryStore,
    pub artifacts: Arc<InMemoryArtifacts>,
    pub rules: Arc<RecordingRules>,
    pub limits: Arc<CeilingLimits>,
    pub activity: Arc<RecordingActivity>,
    pub bus: Arc<InMemoryBus>,
    pub service: RunService,
}

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
});

pub fn harness() -> Harness {
    harness_with(StaticModules { restricted: false }, AllowAllAuthorizer::default())
}

pub fn harness_with(modules: StaticModules, authorizer: AllowAllAuthorizer) -> Harness {
    Lazy::force(&TRACING);
    let store = InMemoryStore::default();
    let artifacts = Arc::new(InMemoryArtifacts::default());
    let rules = Arc::new(RecordingRules::default());
    let limits = Arc::new(CeilingLimits::default());
    let activity = Arc::new(RecordingActivity::default());
    let bus = Arc::new(InMemoryBus::default());
    let service = RunService::new(RunServiceDeps {
        db: Arc::new(store.clone()),
        artifacts: artifacts.clone(),
        secrets: Arc::new(PlainSecrets),
        authorizer: Arc::new(authorizer),
        modules: Arc::new(modules),
        rules: rules.clone(),
        limits: limits.clone(),
        versions: Arc::new(StaticVersions),
        activity: activity.clone(),
        bus: bus.clone(),
        spans: Arc::new(TracingSpanFactory),
    });
    Harness {
        store,
        artifacts,
        rules,
        limits,
        activity,
        bus,
        service,
    }
}

pub fn caller(id: &str) -> Caller {
    Caller {
        id: id.to_string(),
        user: true,
        admin: false,
    }
}

pub fn seed_workspace(store: &InMemoryStore, id: &str) -> Workspace {
    let workspace = Workspace {
        id: id.to_string(),
        namespace_path: format!("group/{id}"),
        terraform_version: "1.6.2".to_string(),
        prevent_destroy_plan: false,
        max_job_duration: Duration::from_secs(3600),
        current_state_version_id: Some("sv-1".to_string()),
        configuration_version_id: Some("cv1".to_string()),
    };
    store.with_state(|state| {
        state
            .workspaces
            .insert(workspace.id.clone(), workspace.clone());
    });
    workspace
}

pub fn seed_configuration_version(
    store: &InMemoryStore,
    id: &str,
    workspace_id: &str,
    speculative: bool,
) -> ConfigurationVersion {
    let cv = ConfigurationVersion {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        speculative,
    };
    store.with_state(|state| {
        state.configuration_versions.insert(cv.id.clone(), cv.clone());
    });
    cv
}
