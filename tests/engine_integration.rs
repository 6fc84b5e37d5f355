//! End-to-end engine tests on an in-memory store with the real tokio
//! substrate: retries, concurrency ceilings, cancellation, state round-trips.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use uuid::Uuid;

use jobwell::error::JobError;
use jobwell::{
    ErrorDisposition, JobEngine, JobRecord, JobState, JobStatus, Runnable, RunnableRegistry,
    SchedulerConfig,
};
use jobwell::store::{JobStore, LibSqlStore};

/// Test runnable with scripted failures and instrumented callbacks.
struct Scripted {
    kind: String,
    max_active: usize,
    /// Number of initial attempts that fail.
    fail_first: u32,
    /// Attempt duration, to hold jobs in `running`.
    run_delay: Duration,
    disposition: ErrorDisposition,
    keep_succeeded: bool,
    keep_failed: bool,
    keep_cancelled: bool,
    panic_on_run: bool,
    runs: AtomicU32,
    concurrent: AtomicUsize,
    max_observed_concurrent: AtomicUsize,
    on_success_calls: AtomicU32,
    on_failure_calls: AtomicU32,
    on_error_calls: AtomicU32,
    on_cancellation_calls: AtomicU32,
}

impl Scripted {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            max_active: 10,
            fail_first: 0,
            run_delay: Duration::ZERO,
            disposition: ErrorDisposition::Retry,
            keep_succeeded: true,
            keep_failed: true,
            keep_cancelled: true,
            panic_on_run: false,
            runs: AtomicU32::new(0),
            concurrent: AtomicUsize::new(0),
            max_observed_concurrent: AtomicUsize::new(0),
            on_success_calls: AtomicU32::new(0),
            on_failure_calls: AtomicU32::new(0),
            on_error_calls: AtomicU32::new(0),
            on_cancellation_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Runnable for Scripted {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn maximum_active(&self) -> usize {
        self.max_active
    }

    async fn run(&self, job: &mut JobRecord, _execution_id: &str) -> Result<(), JobError> {
        let attempt = self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed_concurrent
            .fetch_max(now, Ordering::SeqCst);

        if !self.run_delay.is_zero() {
            sleep(self.run_delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        if self.panic_on_run {
            panic!("scripted panic");
        }
        if attempt < self.fail_first {
            job.state
                .insert("dirty".to_string(), format!("attempt-{attempt}"));
            return Err(JobError::attempt(format!("scripted failure {attempt}")));
        }
        job.state
            .insert("finished_attempt".to_string(), attempt.to_string());
        Ok(())
    }

    async fn on_success(&self, _job: &JobRecord) -> bool {
        self.on_success_calls.fetch_add(1, Ordering::SeqCst);
        self.keep_succeeded
    }

    async fn on_failure(&self, _job: &JobRecord, _error: &JobError) -> bool {
        self.on_failure_calls.fetch_add(1, Ordering::SeqCst);
        self.keep_failed
    }

    async fn on_cancellation(&self, _job: &JobRecord) -> bool {
        self.on_cancellation_calls.fetch_add(1, Ordering::SeqCst);
        self.keep_cancelled
    }

    async fn on_error(&self, _job: &JobRecord, _error: &JobError) -> ErrorDisposition {
        self.on_error_calls.fetch_add(1, Ordering::SeqCst);
        self.disposition
    }
}

struct Harness {
    engine: JobEngine,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn harness(runnables: Vec<Arc<Scripted>>) -> Harness {
    init_tracing();
    let store: Arc<dyn JobStore> = Arc::new(LibSqlStore::new_memory(4096).await.unwrap());
    let registry = Arc::new(RunnableRegistry::new());
    for runnable in runnables {
        registry.register(runnable).await.unwrap();
    }
    let config = SchedulerConfig {
        idle_delay: Duration::from_millis(50),
        ..SchedulerConfig::default()
    };
    let engine = JobEngine::new(config, store, registry);
    Harness { engine }
}

/// Poll until the job reaches a terminal status or is deleted.
async fn await_settled(engine: &JobEngine, id: Uuid) -> Option<JobRecord> {
    for _ in 0..300 {
        match engine.job(id).await.unwrap() {
            Some(job) if job.status.is_terminal() => return Some(job),
            Some(_) => sleep(Duration::from_millis(10)).await,
            None => return None,
        }
    }
    panic!("job {id} did not settle in time");
}

#[tokio::test]
async fn successful_job_persists_state_and_record() {
    let runnable = Arc::new(Scripted::new("greeter"));
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let mut state = JobState::new();
    state.insert("seed".to_string(), "value".to_string());
    let job = h.engine.create_job("greeter", "hello", 0, 0, state);
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();

    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(settled.state.get("seed").map(String::as_str), Some("value"));
    assert_eq!(
        settled.state.get("finished_attempt").map(String::as_str),
        Some("0")
    );
    assert_eq!(runnable.on_success_calls.load(Ordering::SeqCst), 1);
    assert!(settled.external_execution_id.is_some());
    assert!(settled.last_run_time.is_some());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn on_success_false_deletes_record() {
    let mut scripted = Scripted::new("ephemeral");
    scripted.keep_succeeded = false;
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let job = h.engine.create_job("ephemeral", "r", 0, 0, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();

    assert!(await_settled(&h.engine, queued[0].id).await.is_none());
    assert_eq!(runnable.on_success_calls.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn retry_then_terminal_failure() {
    // maximum_retries=1: the first failure routes to on_error, the second
    // (the (max+1)-th attempt overall) to on_failure, exactly once.
    let mut scripted = Scripted::new("flaky");
    scripted.fail_first = u32::MAX; // always fail
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let before = Utc::now();
    let job = h.engine.create_job("flaky", "r", 1, 200, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();
    let id = queued[0].id;

    let settled = await_settled(&h.engine, id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Failed);
    assert_eq!(settled.retry_number, 1);
    assert_eq!(runnable.runs.load(Ordering::SeqCst), 2);
    assert_eq!(runnable.on_error_calls.load(Ordering::SeqCst), 1);
    assert_eq!(runnable.on_failure_calls.load(Ordering::SeqCst), 1);
    // The retry respected the caller's interval.
    assert!(
        settled.scheduled_run_time >= before + chrono::Duration::milliseconds(200),
        "retry was scheduled too early"
    );
    // Failed attempts must not persist their state mutations.
    assert!(!settled.state.contains_key("dirty"));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn retry_number_never_exceeds_maximum() {
    let mut scripted = Scripted::new("bounded");
    scripted.fail_first = u32::MAX;
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let job = h.engine.create_job("bounded", "r", 2, 10, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();

    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Failed);
    assert_eq!(settled.retry_number, 2);
    assert_eq!(runnable.runs.load(Ordering::SeqCst), 3);
    assert_eq!(runnable.on_error_calls.load(Ordering::SeqCst), 2);
    assert_eq!(runnable.on_failure_calls.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn on_error_cancel_invokes_on_cancellation() {
    // The source system skipped on_cancellation when cancellation came from
    // on_error; both cancellation paths are deliberately symmetric here.
    let mut scripted = Scripted::new("quitter");
    scripted.fail_first = u32::MAX;
    scripted.disposition = ErrorDisposition::Cancel;
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let job = h.engine.create_job("quitter", "r", 5, 10, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();

    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Cancelled);
    assert_eq!(runnable.runs.load(Ordering::SeqCst), 1);
    assert_eq!(runnable.on_error_calls.load(Ordering::SeqCst), 1);
    assert_eq!(runnable.on_cancellation_calls.load(Ordering::SeqCst), 1);
    assert_eq!(runnable.on_failure_calls.load(Ordering::SeqCst), 0);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn concurrency_ceiling_holds_under_load() {
    let mut scripted = Scripted::new("serial");
    scripted.max_active = 1;
    scripted.run_delay = Duration::from_millis(80);
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let jobs: Vec<JobRecord> = (0..4)
        .map(|i| h.engine.create_job("serial", format!("job-{i}"), 0, 0, JobState::new()))
        .collect();
    let queued = h.engine.queue_jobs(jobs).await.unwrap();

    for job in &queued {
        let settled = await_settled(&h.engine, job.id).await.unwrap();
        assert_eq!(settled.status, JobStatus::Succeeded);
    }
    assert_eq!(runnable.max_observed_concurrent.load(Ordering::SeqCst), 1);
    assert_eq!(runnable.runs.load(Ordering::SeqCst), 4);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn mixed_kinds_throttle_independently() {
    let mut serial = Scripted::new("serial");
    serial.max_active = 1;
    serial.run_delay = Duration::from_millis(60);
    let serial = Arc::new(serial);
    let mut wide = Scripted::new("wide");
    wide.max_active = 4;
    wide.run_delay = Duration::from_millis(60);
    let wide = Arc::new(wide);
    let h = harness(vec![serial.clone(), wide.clone()]).await;
    h.engine.start().await;

    let mut jobs = Vec::new();
    for i in 0..3 {
        jobs.push(h.engine.create_job("serial", format!("s{i}"), 0, 0, JobState::new()));
        jobs.push(h.engine.create_job("wide", format!("w{i}"), 0, 0, JobState::new()));
    }
    let queued = h.engine.queue_jobs(jobs).await.unwrap();
    for job in &queued {
        await_settled(&h.engine, job.id).await.unwrap();
    }

    assert_eq!(serial.max_observed_concurrent.load(Ordering::SeqCst), 1);
    assert!(wide.max_observed_concurrent.load(Ordering::SeqCst) <= 4);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn cancel_queued_job_calls_on_cancellation_once() {
    let runnable = Arc::new(Scripted::new("idle"));
    let h = harness(vec![runnable.clone()]).await;
    // Engine deliberately not started: the job stays queued.

    let job = h.engine.create_job("idle", "r", 0, 0, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();
    let id = queued[0].id;

    h.engine.cancel_job(id).await.unwrap();
    assert_eq!(runnable.on_cancellation_calls.load(Ordering::SeqCst), 1);

    let job = h.engine.job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(runnable.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_queued_job_deletes_when_not_kept() {
    let mut scripted = Scripted::new("idle");
    scripted.keep_cancelled = false;
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;

    let job = h.engine.create_job("idle", "r", 0, 0, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();
    let id = queued[0].id;

    h.engine.cancel_job(id).await.unwrap();
    assert_eq!(runnable.on_cancellation_calls.load(Ordering::SeqCst), 1);
    assert!(h.engine.job(id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_running_job_settles_as_cancelled() {
    let mut scripted = Scripted::new("slow");
    scripted.run_delay = Duration::from_millis(200);
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let job = h.engine.create_job("slow", "r", 3, 10, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();
    let id = queued[0].id;

    // Wait until the attempt is actually running, then cancel.
    for _ in 0..100 {
        let job = h.engine.job(id).await.unwrap().unwrap();
        if job.status == JobStatus::Running {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    h.engine.cancel_job(id).await.unwrap();

    let settled = await_settled(&h.engine, id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Cancelled);
    assert_eq!(runnable.on_cancellation_calls.load(Ordering::SeqCst), 1);
    // Cancellation overrode the attempt outcome entirely.
    assert_eq!(runnable.on_success_calls.load(Ordering::SeqCst), 0);
    assert_eq!(runnable.on_error_calls.load(Ordering::SeqCst), 0);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn panicking_runnable_is_a_failed_attempt() {
    let mut scripted = Scripted::new("bomb");
    scripted.panic_on_run = true;
    let runnable = Arc::new(scripted);
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    let job = h.engine.create_job("bomb", "r", 0, 0, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();

    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Failed);
    assert_eq!(runnable.on_failure_calls.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn large_state_round_trips_through_execution() {
    let runnable = Arc::new(Scripted::new("bulky"));
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;

    // Big enough to span many storage chunks.
    let mut state = JobState::new();
    for i in 0..200 {
        state.insert(format!("key-{i:04}"), "v".repeat(100));
    }
    let expected = state.clone();

    let job = h.engine.create_job("bulky", "r", 0, 0, state);
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();

    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Succeeded);
    for (k, v) in &expected {
        assert_eq!(settled.state.get(k), Some(v));
    }

    h.engine.shutdown().await;
}

#[tokio::test]
async fn work_queued_before_start_is_picked_up() {
    let runnable = Arc::new(Scripted::new("late"));
    let h = harness(vec![runnable.clone()]).await;

    let job = h.engine.create_job("late", "r", 0, 0, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();
    assert_eq!(h.engine.pending_work().await.unwrap(), 1);

    // Survives "restart": the record is durable, the loop starts later.
    h.engine.start().await;
    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(h.engine.pending_work().await.unwrap(), 0);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn start_is_idempotent() {
    let runnable = Arc::new(Scripted::new("once"));
    let h = harness(vec![runnable.clone()]).await;
    h.engine.start().await;
    h.engine.start().await; // second call must be a no-op

    let job = h.engine.create_job("once", "r", 0, 0, JobState::new());
    let queued = h.engine.queue_jobs(vec![job]).await.unwrap();
    let settled = await_settled(&h.engine, queued[0].id).await.unwrap();
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(runnable.runs.load(Ordering::SeqCst), 1);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    let id = {
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlStore::new_local(&path, 4096).await.unwrap());
        let registry = Arc::new(RunnableRegistry::new());
        registry.register(Arc::new(Scripted::new("durable"))).await.unwrap();
        let engine = JobEngine::new(SchedulerConfig::default(), store, registry);
        let job = engine.create_job("durable", "r", 0, 0, JobState::new());
        engine.queue_jobs(vec![job]).await.unwrap()[0].id
    };

    // Reopen the same file: the queued record must still be there.
    let store: Arc<dyn JobStore> = Arc::new(LibSqlStore::new_local(&path, 4096).await.unwrap());
    let job = store.fetch_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
}
