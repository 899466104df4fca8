//! End-to-end job flow over the in-memory broker: queue, dispatch, execute
//! on a worker thread, retry, defer and shut down.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use entitle_core::JobId;
use entitle_infra::jobs::{
    ConfigureJob, FixedPrincipal, InMemoryJobStore, JobConfig, JobConstraints, JobError,
    JobManager, JobQuery, JobState, JobWorker, JobWorkerConfig, ManagerState, OwnerJobConfig,
};
use entitle_infra::settings::{ConflictPolicy, JobSettings};
use entitle_messaging::InMemoryBroker;

const ADDRESS: &str = "entitle.jobs";

fn settings(policy: ConflictPolicy) -> JobSettings {
    JobSettings::new(ADDRESS)
        .with_conflict_policy(policy)
        .with_node_name("it-node")
        .with_worker_poll_interval(Duration::from_millis(20))
}

fn wait_for(manager: &JobManager<InMemoryBroker>, job_id: JobId, state: JobState) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = manager.get_job(job_id)?.state();
        if current == state {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("job {job_id} stuck in {current}, expected {state}");
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn jobs_flow_from_queue_to_worker_and_back() -> Result<()> {
    entitle_observability::init();

    let broker = InMemoryBroker::new();
    let settings = settings(ConflictPolicy::Defer);
    let subscription = broker.subscribe(&settings.dispatch_address);
    let manager = Arc::new(
        JobManager::from_settings(broker.clone(), InMemoryJobStore::arc(), &settings)?
            .with_principal_provider(Arc::new(FixedPrincipal::new("ops"))),
    );

    let flaky_runs = Arc::new(AtomicUsize::new(0));
    {
        let flaky_runs = flaky_runs.clone();
        manager.register_fn("refresh_grants", move |ctx| {
            if flaky_runs.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(JobError::retryable("directory unavailable"));
            }
            let owner = ctx.job_arguments().get_as_string("owner_key")?.unwrap_or_default();
            ctx.set_job_result_fmt(format_args!("refreshed grants for {owner}"));
            Ok(())
        });
    }
    manager.register_fn("revoke_access", |_ctx| Err(JobError::terminal("grant already removed")));

    manager.initialize()?;
    // Queued before start: held, then dispatched on start.
    let refresh = OwnerJobConfig::for_job("refresh_grants")?
        .set_owner("user-42")
        .set_retry_count(3)
        .log_execution_details(true)
        .add_constraint(JobConstraints::unique_by_arguments(["owner_key"]));
    let first = manager.queue_job(&refresh)?;
    assert_eq!(first.state(), JobState::Queued);

    // Same owner while the first is still held: deferred.
    let second = manager.queue_job(&refresh)?;
    assert_eq!(second.state(), JobState::Waiting);
    assert_eq!(second.conflicts(), &[first.id()]);

    let worker = JobWorker::spawn(
        JobWorkerConfig::from_settings(&settings).with_name("it-worker"),
        subscription,
        manager.clone(),
    )?;
    manager.start()?;

    let revoke = manager.queue_job(&JobConfig::for_job("revoke_access")?.set_retry_count(5))?;

    wait_for(&manager, first.id(), JobState::Finished)?;
    wait_for(&manager, second.id(), JobState::Finished)?;
    wait_for(&manager, revoke.id(), JobState::Failed)?;

    let first = manager.get_job(first.id())?;
    assert_eq!(first.attempts(), 2);
    assert_eq!(first.retries_remaining(), 2);
    assert_eq!(first.result(), Some("refreshed grants for user-42"));
    assert_eq!(first.principal(), "ops");
    assert_eq!(first.executor(), Some("it-node"));

    let revoke = manager.get_job(revoke.id())?;
    assert_eq!(revoke.attempts(), 1);
    assert_eq!(revoke.result(), Some("grant already removed"));

    let finished = manager.find_jobs(&JobQuery::new().with_states([JobState::Finished]))?;
    assert_eq!(finished.len(), 2);

    worker.shutdown();
    manager.shutdown()?;
    assert_eq!(manager.state(), ManagerState::Shutdown);
    assert_eq!(manager.dispatcher().tracked_threads(), 0);

    let stats = broker.stats();
    assert_eq!(stats.sessions_created, stats.sessions_closed);
    Ok(())
}

#[test]
fn missing_dispatch_address_fails_at_startup() {
    let err = JobSettings::from_lookup(|_| None).unwrap_err();
    assert!(err.to_string().contains("ENTITLE_JOBS_DISPATCH_ADDRESS"));
}

#[test]
fn abort_policy_refuses_duplicates_without_dispatching() -> Result<()> {
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe(ADDRESS);
    let manager = JobManager::from_settings(broker, InMemoryJobStore::arc(), &settings(ConflictPolicy::Abort))?;
    manager.initialize()?;
    manager.start()?;

    let cfg = JobConfig::for_job("export")?
        .set_job_argument("tenant", "acme")?
        .add_constraint(JobConstraints::unique_by_arguments(["tenant"]));
    let kept = manager.queue_job(&cfg)?;
    let refused = manager.queue_job(&cfg)?;

    assert_eq!(refused.state(), JobState::Aborted);
    assert_eq!(refused.conflicts(), &[kept.id()]);

    subscription.try_recv().context("first job should be dispatched")?;
    assert!(subscription.try_recv().is_err());
    Ok(())
}
