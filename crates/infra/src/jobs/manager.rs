//! Process-wide job manager: lifecycle, admission, dispatch and execution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, info_span, warn};

use entitle_core::JobId;
use entitle_messaging::MessageTransport;

use crate::settings::{ConflictPolicy, JobSettings};

use super::config::ConfigureJob;
use super::constraints::JobConstraint;
use super::context::JobExecutionContext;
use super::dispatcher::JobMessageDispatcher;
use super::error::{JobError, JobManagerError, JobMessageDispatchError};
use super::principal::{FixedPrincipal, PrincipalProvider};
use super::state::ManagerState;
use super::store::{JobStore, JobStoreError};
use super::types::{JobQuery, JobRecord, JobState};

/// Job logic run by a worker on behalf of a dispatched message.
///
/// Errors decide their own fate: [`JobError::terminal`] fails the job at once,
/// [`JobError::retryable`] re-queues it while retries remain.
pub trait AsyncJob: Send + Sync {
    fn run(&self, context: &mut JobExecutionContext<'_>) -> Result<(), JobError>;
}

impl<F> AsyncJob for F
where
    F: Fn(&mut JobExecutionContext<'_>) -> Result<(), JobError> + Send + Sync,
{
    fn run(&self, context: &mut JobExecutionContext<'_>) -> Result<(), JobError> {
        self(context)
    }
}

type Constraints = Vec<Arc<dyn JobConstraint>>;

struct Lifecycle {
    state: ManagerState,
    /// Queued jobs waiting for the manager to run before they are dispatched.
    held: Vec<JobId>,
}

/// Owns the manager lifecycle and drives every job through its states.
///
/// Lock order: `admission`, then `claims`, then `lifecycle`.
pub struct JobManager<T: MessageTransport> {
    lifecycle: Mutex<Lifecycle>,
    /// Constraint evaluation is serialized; the map holds deferred jobs' constraints.
    admission: Mutex<BTreeMap<JobId, Constraints>>,
    /// Serializes read-modify-write of records between workers and cancellation.
    claims: Mutex<()>,
    jobs: RwLock<HashMap<String, Arc<dyn AsyncJob>>>,
    store: Arc<dyn JobStore>,
    dispatcher: JobMessageDispatcher<T>,
    principal: Arc<dyn PrincipalProvider>,
    conflict_policy: ConflictPolicy,
    node_name: String,
}

impl<T: MessageTransport> JobManager<T> {
    pub fn new(dispatcher: JobMessageDispatcher<T>, store: Arc<dyn JobStore>) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: ManagerState::Created,
                held: Vec::new(),
            }),
            admission: Mutex::new(BTreeMap::new()),
            claims: Mutex::new(()),
            jobs: RwLock::new(HashMap::new()),
            store,
            dispatcher,
            principal: Arc::new(FixedPrincipal::system()),
            conflict_policy: ConflictPolicy::default(),
            node_name: "local".to_string(),
        }
    }

    /// Build a manager whose dispatcher and policies come from `settings`.
    pub fn from_settings(
        transport: T,
        store: Arc<dyn JobStore>,
        settings: &JobSettings,
    ) -> Result<Self, JobMessageDispatchError> {
        let dispatcher = JobMessageDispatcher::new(transport, settings.dispatch_address.clone())?;
        Ok(Self::new(dispatcher, store)
            .with_conflict_policy(settings.conflict_policy)
            .with_node_name(settings.node_name.clone()))
    }

    pub fn with_principal_provider(mut self, provider: Arc<dyn PrincipalProvider>) -> Self {
        self.principal = provider;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// Register the logic run for jobs with `job_key`, replacing any previous registration.
    pub fn register_job(&self, job_key: impl Into<String>, job: impl AsyncJob + 'static) {
        let job_key = job_key.into();
        debug!(job_key = %job_key, "registered job logic");
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_key, Arc::new(job));
    }

    /// Register a closure as job logic.
    pub fn register_fn<F>(&self, job_key: impl Into<String>, job: F)
    where
        F: Fn(&mut JobExecutionContext<'_>) -> Result<(), JobError> + Send + Sync + 'static,
    {
        self.register_job(job_key, job);
    }

    pub fn state(&self) -> ManagerState {
        self.lock_lifecycle().state
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &JobMessageDispatcher<T> {
        &self.dispatcher
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    // ---- lifecycle ----

    pub fn initialize(&self) -> Result<(), JobManagerError> {
        let previous = self.lock_lifecycle().state.transition_to(ManagerState::Initialized)?;
        info!(from = %previous, "job manager initialized");
        Ok(())
    }

    /// Start dispatching, including any jobs queued before the manager ran.
    pub fn start(&self) -> Result<(), JobManagerError> {
        self.enter_running("started")
    }

    /// Stop dispatching. Jobs queued meanwhile are held until [`resume`](Self::resume).
    pub fn suspend(&self) -> Result<(), JobManagerError> {
        let previous = self.lock_lifecycle().state.transition_to(ManagerState::Suspended)?;
        info!(from = %previous, "job manager suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), JobManagerError> {
        self.enter_running("resumed")
    }

    /// Stop for good and release every transport resource.
    pub fn shutdown(&self) -> Result<(), JobManagerError> {
        let held = {
            let mut lifecycle = self.lock_lifecycle();
            lifecycle.state.transition_to(ManagerState::Shutdown)?;
            std::mem::take(&mut lifecycle.held)
        };
        info!(held = held.len(), "job manager shutting down");
        self.dispatcher.shutdown()?;
        Ok(())
    }

    fn enter_running(&self, verb: &'static str) -> Result<(), JobManagerError> {
        let mut failed = 0;
        {
            let mut lifecycle = self.lock_lifecycle();
            let previous = lifecycle.state.transition_to(ManagerState::Running)?;
            let held = std::mem::take(&mut lifecycle.held);
            info!(from = %previous, held = held.len(), "job manager {verb}");

            for job_id in held {
                let Some(mut record) = self.store.get(job_id)? else {
                    continue;
                };
                if record.state() != JobState::Queued {
                    continue;
                }
                if let Err(err) = self.dispatch(&mut record) {
                    warn!(job_id = %job_id, error = %err, "failed to dispatch held job");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            self.process_waiting_jobs()?;
        }
        Ok(())
    }

    // ---- admission ----

    /// Admit a job.
    ///
    /// The returned record is `QUEUED` when admitted. A conflicting job is
    /// returned `ABORTED` or `WAITING` according to the conflict policy; that is
    /// an outcome, not an error.
    pub fn queue_job<C: ConfigureJob>(&self, config: &C) -> Result<JobRecord, JobManagerError> {
        let state = self.state();
        if !matches!(
            state,
            ManagerState::Initialized | ManagerState::Running | ManagerState::Suspended
        ) {
            return Err(JobManagerError::NotAccepting(state));
        }

        config.validate()?;
        let job_config = config.job_config();
        let mut record = JobRecord::from_config(job_config, self.principal.principal_name());

        // The record is persisted once, already in its admitted state, under the admission lock.
        let mut admission = self.lock_admission();
        let conflicts = self.evaluate_constraints(job_config.constraints(), &record)?;

        if !conflicts.is_empty() {
            let count = conflicts.len();
            record.set_conflicts(conflicts);
            match self.conflict_policy {
                ConflictPolicy::Abort => {
                    record.set_state(JobState::Aborted)?;
                    record.set_result(format!("aborted: conflicts with {count} job(s)"));
                    self.store.create(record.clone())?;
                    info!(job_id = %record.id(), job_key = record.job_key(), conflicts = count, "job aborted at admission");
                }
                ConflictPolicy::Defer => {
                    record.set_state(JobState::Waiting)?;
                    self.store.create(record.clone())?;
                    admission.insert(record.id(), job_config.constraints().to_vec());
                    info!(job_id = %record.id(), job_key = record.job_key(), conflicts = count, "job deferred");
                }
            }
            return Ok(record);
        }

        record.set_state(JobState::Queued)?;
        self.store.create(record.clone())?;
        info!(job_id = %record.id(), job_key = record.job_key(), principal = record.principal(), "job queued");
        if let Err(err) = self.route(&mut record) {
            self.admit_waiting(&mut admission)?;
            return Err(err);
        }
        Ok(record)
    }

    /// Re-evaluate deferred jobs, oldest first, queueing those no longer in conflict.
    ///
    /// Returns how many were admitted.
    pub fn process_waiting_jobs(&self) -> Result<usize, JobManagerError> {
        let mut admission = self.lock_admission();
        self.admit_waiting(&mut admission)
    }

    fn admit_waiting(&self, waiting: &mut BTreeMap<JobId, Constraints>) -> Result<usize, JobManagerError> {
        let mut admitted = 0;
        let ids: Vec<JobId> = waiting.keys().copied().collect();

        for job_id in ids {
            let record = self.store.get(job_id)?;
            let Some(mut record) = record.filter(|r| r.state() == JobState::Waiting) else {
                waiting.remove(&job_id);
                continue;
            };

            let conflicts = match waiting.get(&job_id) {
                Some(constraints) => self.evaluate_constraints(constraints, &record)?,
                None => continue,
            };

            if conflicts.is_empty() {
                waiting.remove(&job_id);
                record.set_conflicts(Vec::new());
                record.set_state(JobState::Queued)?;
                self.store.update(&record)?;
                info!(job_id = %job_id, job_key = record.job_key(), "deferred job admitted");
                admitted += 1;

                if let Err(err) = self.route(&mut record) {
                    warn!(job_id = %job_id, error = %err, "failed to dispatch admitted job");
                }
            } else if conflicts != record.conflicts() {
                record.set_conflicts(conflicts);
                self.store.update(&record)?;
            }
        }

        Ok(admitted)
    }

    fn evaluate_constraints(
        &self,
        constraints: &[Arc<dyn JobConstraint>],
        record: &JobRecord,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let mut conflicts = BTreeSet::new();
        for constraint in constraints {
            let found = constraint.test(self.store.as_ref(), record)?;
            if !found.is_empty() {
                debug!(
                    job_id = %record.id(),
                    constraint = %constraint.describe(),
                    conflicts = found.len(),
                    "constraint reported conflicts"
                );
            }
            conflicts.extend(found);
        }
        Ok(conflicts.into_iter().collect())
    }

    // ---- dispatch ----

    /// Dispatch now if running, otherwise hold until the manager runs.
    fn route(&self, record: &mut JobRecord) -> Result<(), JobManagerError> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state == ManagerState::Running {
            self.dispatch(record)
        } else {
            debug!(job_id = %record.id(), state = %lifecycle.state, "holding job until manager runs");
            lifecycle.held.push(record.id());
            Ok(())
        }
    }

    /// Post and commit the job's message. On failure the transaction is rolled
    /// back and the job is marked `FAILED`.
    fn dispatch(&self, record: &mut JobRecord) -> Result<(), JobManagerError> {
        let message = record.message();
        let sent = self
            .dispatcher
            .post_job_message(&message)
            .and_then(|()| self.dispatcher.commit());

        if let Err(err) = sent {
            if let Err(rollback) = self.dispatcher.rollback() {
                warn!(job_id = %record.id(), error = %rollback, "rollback after failed dispatch also failed");
            }
            record.set_state(JobState::Failed)?;
            record.set_result(format!("dispatch failed: {err}"));
            self.store.update(record)?;
            warn!(job_id = %record.id(), job_key = record.job_key(), error = %err, "job dispatch failed");
            return Err(err.into());
        }

        debug!(job_id = %record.id(), job_key = record.job_key(), "job dispatched");
        Ok(())
    }

    // ---- execution ----

    /// Run a dispatched job. Entry point for workers.
    ///
    /// Already-terminal (e.g. canceled) records are skipped. Job failures are
    /// recorded on the returned record rather than returned as errors.
    pub fn execute_job(&self, job_id: JobId) -> Result<JobRecord, JobManagerError> {
        let state = self.state();
        if state == ManagerState::Shutdown {
            return Err(JobManagerError::NotAccepting(state));
        }

        let (mut record, job) = {
            let claim = self.lock_claims();
            let mut record = self.store.get(job_id)?.ok_or(JobManagerError::UnknownJob(job_id))?;

            if record.state().is_terminal() {
                debug!(job_id = %job_id, state = %record.state(), "skipping job that already ended");
                return Ok(record);
            }
            if record.state() != JobState::Queued {
                return Err(JobError::InvalidJobState {
                    job_id,
                    from: record.state(),
                    to: JobState::Running,
                }
                .into());
            }

            let job = self
                .jobs
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(record.job_key())
                .cloned();
            let Some(job) = job else {
                let err = JobError::UnknownJobKey(record.job_key().to_string());
                record.set_state(JobState::Failed)?;
                record.set_result(err.to_string());
                self.store.update(&record)?;
                drop(claim);
                self.process_waiting_jobs()?;
                return Err(err.into());
            };

            record.begin_attempt(&self.node_name);
            record.set_state(JobState::Running)?;
            self.store.update(&record)?;
            (record, job)
        };

        let span = info_span!(
            "job",
            job_id = %record.id(),
            job_key = record.job_key(),
            correlation_id = %record.correlation_id(),
            attempt = record.attempts(),
            log_level = record.log_level().unwrap_or("default"),
        );
        let entered = span.enter();
        let details = record.logs_execution_details();
        if details {
            info!(principal = record.principal(), executor = %self.node_name, "job started");
        }

        let outcome = job.run(&mut JobExecutionContext::new(&mut record));

        match outcome {
            Ok(()) => {
                record.set_state(JobState::Finished)?;
                self.store.update(&record)?;
                if details {
                    info!(result = record.result().unwrap_or_default(), "job finished");
                }
            }
            Err(err) if !err.is_terminal() && record.retries_remaining() > 0 => {
                record.set_state(JobState::FailedWithRetry)?;
                record.set_result(err.to_string());
                record.consume_retry();
                self.store.update(&record)?;
                warn!(error = %err, retries_remaining = record.retries_remaining(), "job failed; retrying");

                record.set_state(JobState::Queued)?;
                self.store.update(&record)?;
                if let Err(err) = self.route(&mut record) {
                    drop(entered);
                    self.process_waiting_jobs()?;
                    return Err(err);
                }
                return Ok(record);
            }
            Err(err) => {
                record.set_state(JobState::Failed)?;
                record.set_result(err.to_string());
                self.store.update(&record)?;
                warn!(error = %err, disposition = ?err.disposition(), "job failed");
            }
        }

        drop(entered);
        self.process_waiting_jobs()?;
        Ok(record)
    }

    /// Withdraw a job that has not started running.
    pub fn cancel_job(&self, job_id: JobId) -> Result<JobRecord, JobManagerError> {
        let mut admission = self.lock_admission();

        let record = {
            let _claim = self.lock_claims();
            let mut record = self.store.get(job_id)?.ok_or(JobManagerError::UnknownJob(job_id))?;
            if !matches!(
                record.state(),
                JobState::Created | JobState::Waiting | JobState::Queued
            ) {
                return Err(JobManagerError::NotCancelable {
                    job_id,
                    state: record.state(),
                });
            }

            record.set_state(JobState::Canceled)?;
            record.set_result(format!("canceled by {}", self.principal.principal_name()));
            self.store.update(&record)?;
            self.lock_lifecycle().held.retain(|held| *held != job_id);
            record
        };

        admission.remove(&job_id);
        info!(job_id = %job_id, job_key = record.job_key(), "job canceled");
        self.admit_waiting(&mut admission)?;
        Ok(record)
    }

    // ---- queries ----

    pub fn get_job(&self, job_id: JobId) -> Result<JobRecord, JobManagerError> {
        self.store.get(job_id)?.ok_or(JobManagerError::UnknownJob(job_id))
    }

    pub fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobManagerError> {
        Ok(self.store.find_jobs(query)?)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_admission(&self) -> MutexGuard<'_, BTreeMap<JobId, Constraints>> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_claims(&self) -> MutexGuard<'_, ()> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: MessageTransport> std::fmt::Debug for JobManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("state", &self.state())
            .field("conflict_policy", &self.conflict_policy)
            .field("node_name", &self.node_name)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use entitle_messaging::{Delivery, InMemoryBroker, Subscription};

    use crate::jobs::config::{JobConfig, OwnerJobConfig};
    use crate::jobs::constraints::JobConstraints;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobMessage;

    const ADDRESS: &str = "job.dispatch";

    struct Harness {
        broker: InMemoryBroker,
        sub: Subscription<Delivery>,
        manager: JobManager<InMemoryBroker>,
    }

    fn harness(policy: ConflictPolicy) -> Harness {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe(ADDRESS);
        let dispatcher = JobMessageDispatcher::new(broker.clone(), ADDRESS).unwrap();
        let manager = JobManager::new(dispatcher, InMemoryJobStore::arc())
            .with_conflict_policy(policy)
            .with_node_name("node-a")
            .with_principal_provider(Arc::new(FixedPrincipal::new("alice")));
        Harness { broker, sub, manager }
    }

    fn running(policy: ConflictPolicy) -> Harness {
        let h = harness(policy);
        h.manager.initialize().unwrap();
        h.manager.start().unwrap();
        h
    }

    fn next_message(sub: &Subscription<Delivery>) -> Option<JobMessage> {
        let delivery = sub.try_recv().ok()?;
        Some(serde_json::from_str(delivery.message().body()).unwrap())
    }

    fn config(key: &str) -> JobConfig {
        JobConfig::for_job(key).unwrap()
    }

    #[test]
    fn illegal_lifecycle_move_leaves_state_untouched() {
        let h = harness(ConflictPolicy::Abort);

        let err = h.manager.start().unwrap_err();
        assert!(matches!(err, JobManagerError::State(e)
            if e.initial_state() == ManagerState::Created && e.intended_state() == ManagerState::Running));
        assert_eq!(h.manager.state(), ManagerState::Created);

        h.manager.initialize().unwrap();
        h.manager.start().unwrap();
        h.manager.suspend().unwrap();
        h.manager.resume().unwrap();
        h.manager.shutdown().unwrap();
        assert!(h.manager.resume().is_err());
        assert_eq!(h.manager.state(), ManagerState::Shutdown);
    }

    #[test]
    fn queue_requires_an_accepting_manager() {
        let h = harness(ConflictPolicy::Abort);
        assert!(matches!(
            h.manager.queue_job(&config("sync")),
            Err(JobManagerError::NotAccepting(ManagerState::Created))
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_anything_is_stored() {
        let h = running(ConflictPolicy::Abort);
        let owned = OwnerJobConfig::for_job("sync").unwrap();

        assert!(matches!(
            h.manager.queue_job(&owned),
            Err(JobManagerError::Validation(_))
        ));
        assert!(h.manager.find_jobs(&JobQuery::new()).unwrap().is_empty());
    }

    #[test]
    fn queued_job_is_dispatched_and_records_principal() {
        let h = running(ConflictPolicy::Abort);
        let record = h.manager.queue_job(&config("sync")).unwrap();

        assert_eq!(record.state(), JobState::Queued);
        assert_eq!(record.principal(), "alice");

        let message = next_message(&h.sub).unwrap();
        assert_eq!(message.job_id(), record.id());
        assert_eq!(message.job_key(), "sync");
    }

    #[test]
    fn jobs_queued_before_start_or_while_suspended_are_held() {
        let h = harness(ConflictPolicy::Abort);
        h.manager.initialize().unwrap();

        let first = h.manager.queue_job(&config("sync")).unwrap();
        assert!(next_message(&h.sub).is_none());
        h.manager.start().unwrap();
        assert_eq!(next_message(&h.sub).unwrap().job_id(), first.id());

        h.manager.suspend().unwrap();
        let second = h.manager.queue_job(&config("sync")).unwrap();
        assert!(next_message(&h.sub).is_none());
        h.manager.resume().unwrap();
        assert_eq!(next_message(&h.sub).unwrap().job_id(), second.id());
    }

    #[test]
    fn successful_job_finishes_with_its_result() {
        let h = running(ConflictPolicy::Abort);
        h.manager.register_fn("greet", |ctx| {
            let name = ctx.job_arguments().get_as_string("name")?.unwrap_or_default();
            ctx.set_job_result(format!("hello {name} from {}", ctx.principal_name()));
            Ok(())
        });

        let cfg = config("greet").set_job_argument("name", "bob").unwrap();
        let queued = h.manager.queue_job(&cfg).unwrap();
        let done = h.manager.execute_job(queued.id()).unwrap();

        assert_eq!(done.state(), JobState::Finished);
        assert_eq!(done.result(), Some("hello bob from alice"));
        assert_eq!(done.executor(), Some("node-a"));
        assert_eq!(done.attempts(), 1);
        assert!(done.end_time().is_some());
    }

    #[test]
    fn terminal_error_is_never_retried() {
        let h = running(ConflictPolicy::Abort);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        h.manager.register_fn("charge", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(JobError::terminal("card declined"))
        });

        let queued = h.manager.queue_job(&config("charge").set_retry_count(5)).unwrap();
        next_message(&h.sub).unwrap();
        let done = h.manager.execute_job(queued.id()).unwrap();

        assert_eq!(done.state(), JobState::Failed);
        assert_eq!(done.result(), Some("card declined"));
        assert_eq!(done.retries_remaining(), 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(next_message(&h.sub).is_none());
    }

    #[test]
    fn retryable_error_requeues_until_retries_run_out() {
        let h = running(ConflictPolicy::Abort);
        h.manager.register_fn("flaky", |_ctx| Err(JobError::retryable("db busy")));

        let queued = h.manager.queue_job(&config("flaky").set_retry_count(2)).unwrap();
        next_message(&h.sub).unwrap();

        let first = h.manager.execute_job(queued.id()).unwrap();
        assert_eq!(first.state(), JobState::Queued);
        assert_eq!(first.previous_state(), Some(JobState::FailedWithRetry));
        assert_eq!(first.retries_remaining(), 1);
        assert_eq!(next_message(&h.sub).unwrap().job_id(), queued.id());

        h.manager.execute_job(queued.id()).unwrap();
        next_message(&h.sub).unwrap();
        let last = h.manager.execute_job(queued.id()).unwrap();

        assert_eq!(last.state(), JobState::Failed);
        assert_eq!(last.attempts(), 3);
        assert_eq!(last.retries_remaining(), 0);
        assert!(next_message(&h.sub).is_none());
    }

    #[test]
    fn bad_argument_type_fails_terminally() {
        let h = running(ConflictPolicy::Abort);
        h.manager.register_fn("count", |ctx| {
            ctx.job_arguments().get_as_i32("n")?;
            Ok(())
        });

        let cfg = config("count")
            .set_job_argument("n", "not a number")
            .unwrap()
            .set_retry_count(3);
        let queued = h.manager.queue_job(&cfg).unwrap();
        let done = h.manager.execute_job(queued.id()).unwrap();

        assert_eq!(done.state(), JobState::Failed);
        assert_eq!(done.retries_remaining(), 3);
    }

    #[test]
    fn unregistered_job_key_fails_the_job() {
        let h = running(ConflictPolicy::Abort);
        let queued = h.manager.queue_job(&config("nobody_home")).unwrap();

        let err = h.manager.execute_job(queued.id()).unwrap_err();
        assert!(matches!(err, JobManagerError::Job(JobError::UnknownJobKey(ref k)) if k == "nobody_home"));
        assert_eq!(h.manager.get_job(queued.id()).unwrap().state(), JobState::Failed);
    }

    #[test]
    fn conflicting_job_is_aborted_under_abort_policy() {
        let h = running(ConflictPolicy::Abort);
        let unique = |owner: &str| {
            config("sync")
                .set_job_argument("owner", owner)
                .unwrap()
                .add_constraint(JobConstraints::unique_by_arguments(["owner"]))
        };

        let first = h.manager.queue_job(&unique("u1")).unwrap();
        let second = h.manager.queue_job(&unique("u1")).unwrap();
        let other = h.manager.queue_job(&unique("u2")).unwrap();

        assert_eq!(first.state(), JobState::Queued);
        assert_eq!(second.state(), JobState::Aborted);
        assert_eq!(second.conflicts(), &[first.id()]);
        assert_eq!(other.state(), JobState::Queued);
    }

    #[test]
    fn deferred_job_is_admitted_once_the_conflict_clears() {
        let h = running(ConflictPolicy::Defer);
        h.manager.register_fn("report", |_ctx| Ok(()));
        let throttled = || {
            config("report").add_constraint(JobConstraints::throttled_by_job_key("report", 1))
        };

        let first = h.manager.queue_job(&throttled()).unwrap();
        let second = h.manager.queue_job(&throttled()).unwrap();
        assert_eq!(second.state(), JobState::Waiting);
        assert_eq!(second.conflicts(), &[first.id()]);
        next_message(&h.sub).unwrap();
        assert!(next_message(&h.sub).is_none());

        h.manager.execute_job(first.id()).unwrap();

        let admitted = h.manager.get_job(second.id()).unwrap();
        assert_eq!(admitted.state(), JobState::Queued);
        assert!(admitted.conflicts().is_empty());
        assert_eq!(next_message(&h.sub).unwrap().job_id(), second.id());
    }

    #[test]
    fn deferred_duplicates_are_admitted_oldest_first() {
        let h = running(ConflictPolicy::Defer);
        h.manager.register_fn("sync", |_ctx| Ok(()));
        let unique = || {
            config("sync")
                .set_job_argument("owner", "u1")
                .unwrap()
                .add_constraint(JobConstraints::unique_by_arguments(["owner"]))
        };

        let x = h.manager.queue_job(&unique()).unwrap();
        let y = h.manager.queue_job(&unique()).unwrap();
        let z = h.manager.queue_job(&unique()).unwrap();
        assert_eq!(y.state(), JobState::Waiting);
        assert_eq!(z.state(), JobState::Waiting);
        assert_eq!(z.conflicts().len(), 2);
        assert!(z.conflicts().contains(&y.id()));
        assert_eq!(next_message(&h.sub).unwrap().job_id(), x.id());

        h.manager.execute_job(x.id()).unwrap();

        assert_eq!(h.manager.get_job(y.id()).unwrap().state(), JobState::Queued);
        let z_now = h.manager.get_job(z.id()).unwrap();
        assert_eq!(z_now.state(), JobState::Waiting);
        assert_eq!(z_now.conflicts(), &[y.id()]);
        assert_eq!(next_message(&h.sub).unwrap().job_id(), y.id());

        h.manager.execute_job(y.id()).unwrap();
        assert_eq!(h.manager.get_job(z.id()).unwrap().state(), JobState::Queued);
        assert_eq!(next_message(&h.sub).unwrap().job_id(), z.id());
    }

    #[test]
    fn constraint_error_leaves_no_record_behind() {
        let h = running(ConflictPolicy::Abort);
        let unique = config("sync")
            .set_job_argument("owner", "u1")
            .unwrap()
            .add_constraint(JobConstraints::unique_by_arguments(["owner"]));
        let broken = unique.clone().add_constraint(JobConstraints::custom("store_down", |_, _| {
            Err(JobStoreError::Storage("down".into()))
        }));

        assert!(matches!(
            h.manager.queue_job(&broken),
            Err(JobManagerError::Store(JobStoreError::Storage(_)))
        ));
        assert!(h.manager.find_jobs(&JobQuery::new()).unwrap().is_empty());

        let retried = h.manager.queue_job(&unique).unwrap();
        assert_eq!(retried.state(), JobState::Queued);
        assert!(retried.conflicts().is_empty());
    }

    #[test]
    fn failed_redispatch_releases_deferred_jobs() {
        let h = running(ConflictPolicy::Defer);
        h.manager.register_fn("report", |_ctx| Err(JobError::retryable("upstream busy")));
        let throttled = || {
            config("report")
                .set_retry_count(1)
                .add_constraint(JobConstraints::throttled_by_job_key("report", 1))
        };

        let first = h.manager.queue_job(&throttled()).unwrap();
        let second = h.manager.queue_job(&throttled()).unwrap();
        assert_eq!(second.state(), JobState::Waiting);
        next_message(&h.sub).unwrap();

        h.broker.refuse_sends(true);
        let err = h.manager.execute_job(first.id()).unwrap_err();
        assert!(matches!(err, JobManagerError::Dispatch(_)));
        assert_eq!(h.manager.get_job(first.id()).unwrap().state(), JobState::Failed);

        // Admitted once the slot was released; its own dispatch then hit the same refusal.
        let second = h.manager.get_job(second.id()).unwrap();
        assert_eq!(second.state(), JobState::Failed);
        assert_eq!(second.previous_state(), Some(JobState::Queued));
        assert!(second.result().unwrap().starts_with("dispatch failed"));
    }

    #[test]
    fn canceled_job_is_skipped_by_workers() {
        let h = running(ConflictPolicy::Abort);
        h.manager.register_fn("sync", |_ctx| panic!("canceled job must not run"));

        let queued = h.manager.queue_job(&config("sync")).unwrap();
        let canceled = h.manager.cancel_job(queued.id()).unwrap();
        assert_eq!(canceled.state(), JobState::Canceled);
        assert_eq!(canceled.result(), Some("canceled by alice"));

        let skipped = h.manager.execute_job(queued.id()).unwrap();
        assert_eq!(skipped.state(), JobState::Canceled);
    }

    #[test]
    fn finished_job_cannot_be_canceled() {
        let h = running(ConflictPolicy::Abort);
        h.manager.register_fn("sync", |_ctx| Ok(()));
        let queued = h.manager.queue_job(&config("sync")).unwrap();
        h.manager.execute_job(queued.id()).unwrap();

        assert!(matches!(
            h.manager.cancel_job(queued.id()),
            Err(JobManagerError::NotCancelable { state: JobState::Finished, .. })
        ));
    }

    #[test]
    fn failed_dispatch_marks_the_job_failed() {
        let h = running(ConflictPolicy::Abort);
        h.broker.refuse_sends(true);

        let err = h.manager.queue_job(&config("sync")).unwrap_err();
        assert!(matches!(err, JobManagerError::Dispatch(JobMessageDispatchError::Send { .. })));

        let jobs = h.manager.find_jobs(&JobQuery::new().with_job_key("sync")).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state(), JobState::Failed);
        assert!(jobs[0].result().unwrap().starts_with("dispatch failed"));
    }

    #[test]
    fn unknown_job_ids_are_reported() {
        let h = running(ConflictPolicy::Abort);
        let id = JobId::new();
        assert!(matches!(h.manager.get_job(id), Err(JobManagerError::UnknownJob(x)) if x == id));
        assert!(matches!(h.manager.execute_job(id), Err(JobManagerError::UnknownJob(_))));
    }

    #[test]
    fn shutdown_releases_dispatcher_sessions() {
        let h = running(ConflictPolicy::Abort);
        h.manager.queue_job(&config("sync")).unwrap();
        h.manager.shutdown().unwrap();

        assert_eq!(h.manager.dispatcher().tracked_threads(), 0);
        assert_eq!(h.broker.stats().sessions_closed, 1);
        assert!(matches!(
            h.manager.queue_job(&config("sync")),
            Err(JobManagerError::NotAccepting(ManagerState::Shutdown))
        ));
    }
}
