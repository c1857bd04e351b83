//! In-memory broker and adapter doubles for pipeline and consumer tests

#![allow(dead_code)]

use async_trait::async_trait;
use bouncer_worker::{
    app_state::AppState,
    config::WorkerConfig,
    models::{
        callback::CallbackMessage,
        job::{BundleOutcome, ImportOutcome, Job, JobResult},
    },
    services::{
        broker::{dead_letter_key, Broker, BrokerError, Delivery},
        bundle::{AssetBundler, BundleError},
        import::{validate_result, ImportError, ImportStore},
        tool::{ConversionTool, ToolError},
    },
};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout_at, Instant};

pub const CALLBACK_QUEUE: &str = "callbackq";
pub const TASK_QUEUE: &str = "jobq";
pub const MODEL_QUEUE: &str = "modelq";

/// Worker configuration suitable for tests (no retry delay, short grace period)
pub fn test_config(extra: &[(&str, &str)]) -> WorkerConfig {
    let mut vars: Vec<(String, String)> = [
        ("BROKER_URL", "redis://localhost:6379"),
        ("BOUNCER_PATH", "/opt/bouncer/bin/bouncer_client"),
        ("DB_USERNAME", "bouncer"),
        ("DB_PASSWORD", "secret"),
        ("RETRY_DELAY_SECS", "0"),
        ("SHUTDOWN_GRACE_SECS", "5"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    WorkerConfig::from_vars(vars).expect("test config should be valid")
}

// ── Broker ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct BrokerLog {
    pub queues: HashMap<String, VecDeque<String>>,
    pub unacked: Vec<Delivery>,
    pub acked: Vec<Delivery>,
    pub nacked: Vec<(Delivery, bool)>,
    pub published: Vec<(String, String)>,
}

/// Broker double with reliable-queue semantics matching the Redis binding
#[derive(Default)]
pub struct MemoryBroker {
    log: Mutex<BrokerLog>,
    notify: Notify,
    fail_publish: AtomicBool,
    failing_receives: AtomicUsize,
    receive_errors: AtomicUsize,
}

impl MemoryBroker {
    pub fn push(&self, queue: &str, payload: &str) {
        self.log
            .lock()
            .unwrap()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self) -> BrokerLog {
        self.log.lock().unwrap().clone()
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` receives fail as if Redis were unreachable.
    pub fn fail_next_receives(&self, n: usize) {
        self.failing_receives.store(n, Ordering::SeqCst);
    }

    pub fn receive_errors(&self) -> usize {
        self.receive_errors.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Callback messages published so far, in order
    pub fn callbacks(&self) -> Vec<CallbackMessage> {
        self.log
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(q, _)| q == CALLBACK_QUEUE)
            .map(|(_, p)| serde_json::from_str(p).expect("callback should be valid JSON"))
            .collect()
    }

    pub fn callbacks_for(&self, job_id: &str) -> Vec<CallbackMessage> {
        self.callbacks()
            .into_iter()
            .filter(|c| c.job_id == job_id)
            .collect()
    }

    fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut log = self.log.lock().unwrap();
        let payload = log.queues.get_mut(queue)?.pop_front()?;
        let delivery = Delivery {
            queue: queue.to_string(),
            payload,
        };
        log.unacked.push(delivery.clone());
        Some(delivery)
    }

    fn settle(log: &mut BrokerLog, delivery: &Delivery) {
        if let Some(pos) = log.unacked.iter().position(|d| d == delivery) {
            log.unacked.remove(pos);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let failing = self
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.receive_errors.fetch_add(1, Ordering::SeqCst);
            return Err(unreachable_error());
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_take(queue) {
                return Ok(Some(delivery));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut log = self.log.lock().unwrap();
        Self::settle(&mut log, delivery);
        log.acked.push(delivery.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut log = self.log.lock().unwrap();
            Self::settle(&mut log, delivery);
            log.nacked.push((delivery.clone(), requeue));
            let target = if requeue {
                delivery.queue.clone()
            } else {
                dead_letter_key(&delivery.queue)
            };
            log.queues
                .entry(target)
                .or_default()
                .push_back(delivery.payload.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(unreachable_error());
        }
        self.log
            .lock()
            .unwrap()
            .published
            .push((queue.to_string(), payload.to_string()));
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut log = self.log.lock().unwrap();
        let (stale, kept): (Vec<Delivery>, Vec<Delivery>) =
            log.unacked.drain(..).partition(|d| d.queue == queue);
        log.unacked = kept;
        let moved = stale.len() as u64;
        let q = log.queues.entry(queue.to_string()).or_default();
        for d in stale {
            q.push_back(d.payload);
        }
        Ok(moved)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn unreachable_error() -> BrokerError {
    BrokerError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "broker unavailable",
    )))
}

// ── Conversion tool ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToolStep {
    Succeed,
    Transient,
    Fatal,
    Timeout,
}

/// Conversion double that replays a script of outcomes, then succeeds
pub struct ScriptedTool {
    steps: Mutex<VecDeque<ToolStep>>,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedTool {
    pub fn new(steps: &[ToolStep]) -> Self {
        Self {
            steps: Mutex::new(steps.iter().copied().collect()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(&[])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionTool for ScriptedTool {
    async fn convert(&self, job: &Job) -> Result<JobResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ToolStep::Succeed);
        self.running.fetch_sub(1, Ordering::SeqCst);

        let output_dir = PathBuf::from("/tmp/bouncer").join(&job.id);
        match step {
            ToolStep::Succeed => Ok(JobResult {
                job_id: job.id.clone(),
                artifacts: vec![output_dir.join("model.bin")],
                output_dir,
                log_excerpt: "stdout:\nconverted".to_string(),
                exit_code: Some(0),
                duration: self.delay,
            }),
            ToolStep::Transient => Err(ToolError::Transient {
                code: Some(75),
                excerpt: "stderr:\nlicence server busy".to_string(),
            }),
            ToolStep::Fatal => Err(ToolError::Fatal {
                code: Some(3),
                excerpt: "stderr:\nunsupported file format".to_string(),
            }),
            ToolStep::Timeout => Err(ToolError::Timeout(Duration::from_secs(1))),
        }
    }
}

// ── Import store ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct StoredImport {
    pub job_id: String,
    pub kind: String,
    pub artifacts: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub log_excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImportFailure {
    Connectivity,
    Validation,
}

/// Import double keyed by job id
#[derive(Default)]
pub struct MemoryImportStore {
    rows: Mutex<HashMap<String, StoredImport>>,
    failure: Mutex<Option<ImportFailure>>,
    calls: AtomicUsize,
}

impl MemoryImportStore {
    pub fn failing(failure: ImportFailure) -> Self {
        let store = Self::default();
        *store.failure.lock().unwrap() = Some(failure);
        store
    }

    pub fn rows(&self) -> HashMap<String, StoredImport> {
        self.rows.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImportStore for MemoryImportStore {
    async fn upsert(&self, job: &Job, result: &JobResult) -> Result<ImportOutcome, ImportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.failure.lock().unwrap() {
            Some(ImportFailure::Connectivity) => {
                return Err(ImportError::Connectivity(sqlx::Error::PoolTimedOut))
            }
            Some(ImportFailure::Validation) => {
                return Err(ImportError::Validation("bad artifact metadata".into()))
            }
            None => {}
        }
        validate_result(job, result)?;

        let row = StoredImport {
            job_id: job.id.clone(),
            kind: job.kind.to_string(),
            artifacts: result.artifacts.clone(),
            output_dir: result.output_dir.clone(),
            log_excerpt: result.log_excerpt.clone(),
        };
        let inserted = self
            .rows
            .lock()
            .unwrap()
            .insert(job.id.clone(), row)
            .is_none();

        Ok(ImportOutcome {
            job_id: job.id.clone(),
            durability: bouncer_worker::models::job::Durability::Local,
            artifact_count: result.artifacts.len(),
            asset_dir: result.output_dir.clone(),
            inserted,
        })
    }

    async fn health_check(&self) -> Result<(), ImportError> {
        Ok(())
    }
}

// ── Bundler ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingBundler {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl RecordingBundler {
    pub fn failing() -> Self {
        let bundler = Self::default();
        bundler.fail.store(true, Ordering::SeqCst);
        bundler
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetBundler for RecordingBundler {
    async fn bundle(&self, job: &Job, import: &ImportOutcome) -> Result<BundleOutcome, BundleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BundleError::Failed {
                code: Some(1),
                excerpt: "stderr:\nbundle build failed".into(),
            });
        }
        Ok(BundleOutcome {
            job_id: job.id.clone(),
            bundles: vec![import.asset_dir.join("bundles").join("model.unity3d")],
            log_excerpt: String::new(),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

pub struct Harness {
    pub state: AppState,
    pub broker: Arc<MemoryBroker>,
    pub tool: Arc<ScriptedTool>,
    pub importer: Arc<MemoryImportStore>,
    pub bundler: Arc<RecordingBundler>,
}

pub fn harness(
    tool: ScriptedTool,
    importer: MemoryImportStore,
    bundler: RecordingBundler,
    config: &[(&str, &str)],
) -> Harness {
    let broker = Arc::new(MemoryBroker::default());
    let tool = Arc::new(tool);
    let importer = Arc::new(importer);
    let bundler = Arc::new(bundler);

    let state = AppState::new(
        test_config(config),
        broker.clone(),
        tool.clone(),
        importer.clone(),
        bundler.clone(),
    );

    Harness {
        state,
        broker,
        tool,
        importer,
        bundler,
    }
}

/// Harness with a succeeding import store and bundler
pub fn simple_harness(tool: ScriptedTool) -> Harness {
    harness(
        tool,
        MemoryImportStore::default(),
        RecordingBundler::default(),
        &[],
    )
}

pub fn conversion_message(job_id: &str, source: &str) -> String {
    serde_json::json!({
        "jobId": job_id,
        "kind": "conversion",
        "sourceRefs": [source],
        "targetProject": "project-1",
        "targetRevision": "rev-1"
    })
    .to_string()
}

pub fn bundled_message(job_id: &str) -> String {
    serde_json::json!({
        "jobId": job_id,
        "kind": "bundledConversion",
        "sourceRefs": ["tower.obj"],
        "targetProject": "project-1"
    })
    .to_string()
}

pub fn federation_message(job_id: &str, members: &[&str]) -> String {
    serde_json::json!({
        "jobId": job_id,
        "kind": "federation",
        "memberRevisions": members,
    })
    .to_string()
}

/// Poll `condition` every 10ms until it holds, panicking after `limit`
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("condition not met within {:?}", limit);
        }
        sleep(Duration::from_millis(10)).await;
    }
}
