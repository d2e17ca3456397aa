//! Topological parallel driver (spec §4.6): per-script state machine,
//! freshness checks, cache restore, run-and-save, failure propagation, and
//! service lifecycle.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{info, instrument};

use crate::{
    analyzer::{Dag, Dependency, ScriptConfig, ScriptReference, ServicePersistence},
    cache::{CacheBackend, ReplayLogs},
    error::{ControlFlowOutcome, ExecutionFailure, ScriptFailure},
    fingerprint::{self, Fingerprint, PlatformInfo},
    fs,
    glob,
    manifest::{CleanConfig, EnvVarConfig},
    path::{self, AbsDirPath},
    runner::{self, OutputSink, RunningProcess},
    runtime::Runtime,
};

const LOCK_FILE_NAME: &str = "lock";
const FINGERPRINT_FILE_NAME: &str = "fingerprint";
const MANIFEST_FILE_NAME: &str = "manifest";
const STDOUT_FILE_NAME: &str = "stdout";
const STDERR_FILE_NAME: &str = "stderr";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LOCK_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// `WIREIT_FAILURES` (spec §6/§7): how a failure in one script affects the
/// rest of the run.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum FailureMode {
    /// Stop starting new scripts; scripts already running finish normally.
    #[default]
    NoNew,
    /// A failure only affects its own dependents.
    Continue,
    /// Kill every running script and fail the run immediately.
    Kill,
}

/// A bounded counter with a LIFO wake list (spec §4.6 "Worker Pool"). Unlike
/// a fair semaphore, a released slot is handed to the most recently parked
/// waiter first: under sustained contention this keeps a small number of
/// scripts cycling through the pool instead of guaranteeing round-robin
/// fairness, which matches depth-first DAG drains better.
pub struct WorkerPool {
    capacity: Option<usize>,
    state: std::sync::Mutex<WorkerPoolState>,
}

struct WorkerPoolState {
    available: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

pub struct WorkerPermit<'a> {
    pool: &'a WorkerPool,
    unbounded: bool,
}

impl WorkerPool {
    /// `capacity = None` means unbounded (`WIREIT_PARALLEL=infinity`).
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            state: std::sync::Mutex::new(WorkerPoolState {
                available: capacity.unwrap_or(0),
                waiters: Vec::new(),
            }),
        }
    }

    pub async fn acquire(&self) -> WorkerPermit<'_> {
        if self.capacity.is_none() {
            return WorkerPermit { pool: self, unbounded: true };
        }
        let rx = {
            let mut state = self.state.lock().expect("worker pool mutex poisoned");
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        WorkerPermit { pool: self, unbounded: false }
    }
}

impl Drop for WorkerPermit<'_> {
    fn drop(&mut self) {
        if self.unbounded {
            return;
        }
        let mut state = self.pool.state.lock().expect("worker pool mutex poisoned");
        if let Some(waiter) = state.waiters.pop() {
            // Hand the slot directly to the waiter instead of incrementing
            // `available`, so a concurrent `acquire` can't steal it out from
            // under the LIFO order.
            let _ = waiter.send(());
        } else {
            state.available += 1;
        }
    }
}

/// Captured ctime/mtime/size for one output file (spec §3 "Output manifest").
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct FileStat {
    pub ctime_ns: i64,
    pub mtime_ns: i64,
    pub size_bytes: u64,
}

pub type OutputManifest = BTreeMap<String, FileStat>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SuccessReason {
    Fresh,
    CacheHit,
    Ran,
}

#[derive(Clone, Debug)]
pub struct ScriptSuccess {
    pub fingerprint: Fingerprint,
    pub reason: SuccessReason,
}

pub type ScriptResult = Result<Arc<ScriptSuccess>, Arc<ScriptFailure>>;

/// Receives every script failure exactly once, at the point it's first
/// determined (spec §7 "each failure is logged once"). Terminal-formatting
/// concerns live in the driver, not here.
pub trait FailureSink: Send + Sync {
    fn on_failure(&self, reference: &ScriptReference, failure: &ScriptFailure);
}

pub struct NullFailureSink;

impl FailureSink for NullFailureSink {
    fn on_failure(&self, _reference: &ScriptReference, _failure: &ScriptFailure) {}
}

pub struct NullOutputSink;

impl OutputSink for NullOutputSink {
    fn on_stdout_line(&self, _line: &[u8]) {}
    fn on_stderr_line(&self, _line: &[u8]) {}
}

pub struct ExecutorConfig {
    pub worker_pool: Arc<WorkerPool>,
    pub cache: Option<Arc<dyn CacheBackend>>,
    pub failure_mode: FailureMode,
    pub platform: PlatformInfo,
    pub live_output: Arc<dyn OutputSink>,
    pub failure_sink: Arc<dyn FailureSink>,
    pub runtime: Arc<dyn Runtime>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
enum StopRequest {
    #[default]
    None,
    Graceful,
    Forceful,
}

struct ScriptCell {
    ready_tx: watch::Sender<bool>,
    fingerprint_tx: watch::Sender<Option<Fingerprint>>,
    outcome_tx: watch::Sender<Option<ScriptResult>>,
    stop_tx: watch::Sender<StopRequest>,
}

impl ScriptCell {
    fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (fingerprint_tx, _) = watch::channel(None);
        let (outcome_tx, _) = watch::channel(None);
        let (stop_tx, _) = watch::channel(StopRequest::None);
        Self {
            ready_tx,
            fingerprint_tx,
            outcome_tx,
            stop_tx,
        }
    }

    /// Waits until either readiness fires or a terminal outcome is recorded,
    /// whichever comes first (spec §4.6 "the consumer's step 2 awaits
    /// `ready` rather than `Succeeded` for service deps").
    async fn await_ready_or_outcome(&self) -> Result<Option<Fingerprint>, Arc<ScriptFailure>> {
        let mut ready_rx = self.ready_tx.subscribe();
        let mut outcome_rx = self.outcome_tx.subscribe();
        loop {
            // A terminal outcome always wins over readiness: `drive` marks a
            // script ready unconditionally on its way out (so a consumer
            // blocked on `ready` alone is never stuck if the script turns out
            // not to be a long-running service), which means both channels
            // can flip within the same tick. Check `outcome` first so a
            // same-tick failure isn't misreported as a successful handoff.
            if let Some(outcome) = outcome_rx.borrow().clone() {
                return outcome.map(|s| Some(s.fingerprint.clone()));
            }
            if *ready_rx.borrow() {
                return Ok(self.fingerprint_tx.borrow().clone());
            }
            tokio::select! {
                _ = ready_rx.changed() => {}
                _ = outcome_rx.changed() => {}
            }
        }
    }

    async fn await_outcome(&self) -> ScriptResult {
        let mut rx = self.outcome_tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(Arc::new(ScriptFailure::internal("script task ended without reporting an outcome")));
            }
        }
    }
}

pub struct Executor {
    dag: Arc<Dag>,
    config: ExecutorConfig,
    cells: DashMap<ScriptReference, Arc<ScriptCell>>,
    service_consumers_remaining: DashMap<ScriptReference, std::sync::atomic::AtomicUsize>,
    stop_starting_new: AtomicBool,
    cancel_requested: AtomicBool,
}

impl Executor {
    pub fn new(dag: Arc<Dag>, config: ExecutorConfig) -> Arc<Self> {
        let mut direct_consumers: HashMap<ScriptReference, usize> = HashMap::new();
        for node in dag.nodes.values() {
            for dep in &node.dependencies {
                *direct_consumers.entry(dep.target.clone()).or_default() += 1;
            }
        }

        let service_consumers_remaining = DashMap::new();
        for node in dag.nodes.values() {
            if node.service.is_some() && node.service_persistence == Some(ServicePersistence::Ephemeral) {
                let count = direct_consumers.get(&node.reference).copied().unwrap_or(0);
                service_consumers_remaining.insert(node.reference.clone(), std::sync::atomic::AtomicUsize::new(count));
            }
        }

        Arc::new(Self {
            dag,
            config,
            cells: DashMap::new(),
            service_consumers_remaining,
            stop_starting_new: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// Run the whole DAG reachable from its root. Returns the aggregated,
    /// user-reportable failures (control-flow outcomes are excluded).
    ///
    /// A persistent service (its only transitive consumer is the root
    /// itself) outlives the root script's own completion, so this doesn't
    /// return until every persistent service has also stopped — which only
    /// happens on a process-wide abort (spec §4.2 invariant 3).
    pub async fn run(self: &Arc<Self>) -> Result<(), Vec<Arc<ScriptFailure>>> {
        let root = self.dag.root.clone();
        let root_result = self.execute(&root).await;

        let persistent: Vec<ScriptReference> = self
            .dag
            .nodes
            .values()
            .filter(|config| config.service_persistence == Some(ServicePersistence::Persistent))
            .map(|config| config.reference.clone())
            .collect();
        for reference in persistent {
            let _ = self.execute(&reference).await;
        }

        let mut failures = Vec::new();
        for cell in self.cells.iter() {
            if let Some(Err(failure)) = cell.value().outcome_tx.borrow().clone() {
                if failure.is_reportable() {
                    failures.push(failure);
                }
            }
        }

        if root_result.is_err() || !failures.is_empty() {
            Err(failures)
        } else {
            Ok(())
        }
    }

    /// First call enters graceful cancellation (stop starting new scripts,
    /// SIGINT every running child's process group); a second call escalates
    /// to a forceful kill (spec §4.6 "Cancellation").
    pub fn request_cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            self.stop_starting_new.store(true, Ordering::SeqCst);
            self.broadcast_stop(StopRequest::Graceful);
        } else {
            self.broadcast_stop(StopRequest::Forceful);
        }
    }

    fn broadcast_stop(&self, request: StopRequest) {
        for cell in self.cells.iter() {
            let _ = cell.value().stop_tx.send(request);
        }
    }

    fn cell_for(self: &Arc<Self>, reference: &ScriptReference) -> Arc<ScriptCell> {
        if let Some(existing) = self.cells.get(reference) {
            return existing.clone();
        }
        let cell = Arc::new(ScriptCell::new());
        match self.cells.entry(reference.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(cell.clone());
                let executor = self.clone();
                let reference = reference.clone();
                tokio::spawn(async move { executor.drive(reference).await });
                cell
            }
        }
    }

    /// Start (if needed) and await the outcome for `reference`.
    pub async fn execute(self: &Arc<Self>, reference: &ScriptReference) -> ScriptResult {
        let cell = self.cell_for(reference);
        cell.await_outcome().await
    }

    #[instrument(skip(self), fields(script = %reference.canonical_string()))]
    async fn drive(self: Arc<Self>, reference: ScriptReference) {
        let cell = self.cells.get(&reference).expect("cell was inserted before spawning").clone();
        let result = self.run_pipeline(&reference, &cell).await;

        if let Err(failure) = &result {
            if failure.is_reportable() {
                self.config.failure_sink.on_failure(&reference, failure);
                self.on_script_failed();
            }
        }

        let _ = cell.ready_tx.send(true);
        let _ = cell.outcome_tx.send(Some(result));

        if let Some(config) = self.dag.get(&reference) {
            for dep in &config.dependencies {
                self.release_service_consumer(&dep.target);
            }
        }
    }

    fn on_script_failed(&self) {
        match self.config.failure_mode {
            FailureMode::NoNew => self.stop_starting_new.store(true, Ordering::SeqCst),
            FailureMode::Kill => {
                self.stop_starting_new.store(true, Ordering::SeqCst);
                self.broadcast_stop(StopRequest::Forceful);
            }
            FailureMode::Continue => {}
        }
    }

    fn release_service_consumer(&self, service_ref: &ScriptReference) {
        let Some(counter) = self.service_consumers_remaining.get(service_ref) else {
            return;
        };
        let remaining = counter.value().fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            if let Some(cell) = self.cells.get(service_ref) {
                let _ = cell.stop_tx.send(StopRequest::Graceful);
            }
        }
    }

    async fn await_dependency(self: &Arc<Self>, dep: &Dependency) -> Result<Option<Fingerprint>, Arc<ScriptFailure>> {
        let target_config = self.dag.get(&dep.target).expect("dag is validated");
        let cell = self.cell_for(&dep.target);
        if target_config.service.is_some() {
            cell.await_ready_or_outcome().await
        } else {
            match cell.await_outcome().await {
                Ok(success) => Ok(Some(success.fingerprint.clone())),
                Err(failure) => Err(failure),
            }
        }
    }

    fn gate(&self) -> Result<(), Arc<ScriptFailure>> {
        if self.stop_starting_new.load(Ordering::SeqCst) {
            return Err(Arc::new(ScriptFailure::from(ControlFlowOutcome::StartCancelled)));
        }
        Ok(())
    }

    async fn run_pipeline(self: &Arc<Self>, reference: &ScriptReference, cell: &ScriptCell) -> ScriptResult {
        let config = self.dag.get(reference).expect("reference is part of the analyzed dag").clone();

        // Step 1: gate.
        self.gate()?;

        // Step 2: drive dependencies.
        let mut dependency_fingerprints = Vec::new();
        for dep in &config.dependencies {
            match self.await_dependency(dep).await {
                Ok(Some(fingerprint)) => dependency_fingerprints.push((dep.clone(), fingerprint)),
                Ok(None) => {}
                Err(failure) => return Err(downstream(failure)),
            }
        }
        self.gate()?;

        let state_dir = path::script_state_dir(&config.reference.package_dir, &config.reference.name);
        let mut stop_rx = cell.stop_tx.subscribe();

        // Step 3: acquire the output lock, if this script has declared outputs.
        let lock = if config.output.as_deref().is_some_and(|o| !o.is_empty()) {
            Some(self.acquire_output_lock(&state_dir, &mut stop_rx).await?)
        } else {
            None
        };
        let refresh_task = lock.as_ref().map(|l| fs::spawn_refresh_task(l.clone(), LOCK_REFRESH_INTERVAL));

        let outcome = self
            .run_locked(&config, &state_dir, cell, &dependency_fingerprints, stop_rx)
            .await;

        // The refresh task holds its own clone of `lock`, so it must be
        // stopped explicitly — otherwise it outlives this script's pipeline
        // and keeps ticking (and keeps the lock file's mtime fresh) forever.
        if let Some(task) = refresh_task {
            task.abort();
        }
        drop(lock);

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_locked(
        self: &Arc<Self>,
        config: &ScriptConfig,
        state_dir: &AbsDirPath,
        cell: &ScriptCell,
        dependency_fingerprints: &[(Dependency, Fingerprint)],
        stop_rx: watch::Receiver<StopRequest>,
    ) -> ScriptResult {
        // Step 4: compute fingerprint.
        let resolved_env = resolve_env(&config.env, self.config.runtime.as_ref());
        let package_locks = fingerprint::resolve_package_locks(&config.reference.package_dir, &config.package_locks)
            .await
            .map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?;
        let (fingerprint, _reason) = fingerprint::compute(
            &config.reference.package_dir,
            config,
            dependency_fingerprints,
            resolved_env.clone(),
            package_locks,
            &self.config.platform,
        )
        .await
        .map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?;
        let _ = cell.fingerprint_tx.send(Some(fingerprint.clone()));

        // Step 5: check freshness.
        let prior_fingerprint = read_prior_fingerprint(state_dir).await;
        if fingerprint.fully_tracked {
            if let Some(prior) = &prior_fingerprint {
                let same_fingerprint = match (prior.canonical_string(), fingerprint.canonical_string()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                };
                if same_fingerprint {
                    let current_manifest = capture_output_manifest(&config.reference.package_dir, config.output.as_deref())
                        .await
                        .map_err(Arc::new)?;
                    let prior_manifest = read_prior_manifest(state_dir).await;
                    if prior_manifest.as_ref() == Some(&current_manifest) {
                        replay_persisted_logs(state_dir, self.config.live_output.as_ref()).await;
                        return Ok(Arc::new(ScriptSuccess {
                            fingerprint,
                            reason: SuccessReason::Fresh,
                        }));
                    }
                }
            }
        }
        self.gate()?;

        // Step 6: check cache.
        let cache_hit = if fingerprint.fully_tracked {
            if let Some(cache) = &self.config.cache {
                let hash = fingerprint.hash_hex().map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?;
                cache
                    .get(&config.reference, &hash)
                    .await
                    .map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?
            } else {
                None
            }
        } else {
            None
        };

        // Step 7: prepare — delete prior persisted state.
        remove_persisted_state(state_dir).await;

        // Step 8: clean outputs.
        let effective_clean = if cache_hit.is_some() { CleanConfig::Always } else { config.clean };
        clean_outputs(&config.reference.package_dir, config.output.as_deref(), effective_clean, prior_fingerprint.as_ref(), &fingerprint.files)
            .await
            .map_err(Arc::new)?;

        // Step 9: materialize.
        let replay = if let Some(hit) = &cache_hit {
            hit.apply(&config.reference.package_dir).await.map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?
        } else if config.command.is_some() {
            self.run_and_capture(config, cell, &resolved_env, stop_rx).await?
        } else {
            // Aggregator: no command, nothing to materialize.
            ReplayLogs::default()
        };

        // Step 10: post-success.
        let output_manifest = capture_output_manifest(&config.reference.package_dir, config.output.as_deref())
            .await
            .map_err(Arc::new)?;
        persist_state(state_dir, &fingerprint, &output_manifest, &replay)
            .await
            .map_err(|e| Arc::new(ScriptFailure::internal(e)))?;

        if fingerprint.fully_tracked && cache_hit.is_none() {
            if let Some(cache) = &self.config.cache {
                let hash = fingerprint.hash_hex().map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?;
                if let Some(output_patterns) = &config.output {
                    if let Ok(paths) = resolve_output_paths(&config.reference.package_dir, output_patterns).await {
                        let _ = cache
                            .set(&config.reference, &hash, &config.reference.package_dir, &paths, Some(&replay))
                            .await;
                    }
                }
            }
        }

        Ok(Arc::new(ScriptSuccess {
            fingerprint,
            reason: if cache_hit.is_some() { SuccessReason::CacheHit } else { SuccessReason::Ran },
        }))
    }

    async fn acquire_output_lock(
        &self,
        state_dir: &AbsDirPath,
        stop_rx: &mut watch::Receiver<StopRequest>,
    ) -> Result<Arc<fs::LockFile<fs::Locked>>, Arc<ScriptFailure>> {
        let lock_path = state_dir.join_str_file(LOCK_FILE_NAME);
        let mut unlocked = fs::LockFile::open(lock_path).await.map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))?;
        let mut logged = false;
        loop {
            match unlocked.try_lock().await.map_err(|e| Arc::new(ScriptFailure::internal(e.to_string())))? {
                Ok(locked) => return Ok(Arc::new(locked)),
                Err(back) => {
                    unlocked = back;
                    if !logged {
                        info!("locked");
                        logged = true;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() != StopRequest::None {
                                return Err(Arc::new(ScriptFailure::from(ControlFlowOutcome::Aborted)));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_and_capture(
        &self,
        config: &ScriptConfig,
        cell: &ScriptCell,
        resolved_env: &BTreeMap<String, String>,
        mut stop_rx: watch::Receiver<StopRequest>,
    ) -> Result<ReplayLogs, Arc<ScriptFailure>> {
        let command = config.command.clone().expect("caller only invokes this for scripts with a command");
        let sink = Arc::new(CapturingSink {
            live: self.config.live_output.clone(),
            stdout: std::sync::Mutex::new(Vec::new()),
            stderr: std::sync::Mutex::new(Vec::new()),
        });
        let env_pairs: Vec<(String, String)> = resolved_env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let ready_pattern = config.service.as_ref().and_then(|s| s.ready_when_line_matches.clone());

        let _permit = self.config.worker_pool.acquire().await;

        let running: RunningProcess = runner::spawn(
            config.reference.package_dir.clone(),
            command,
            config.extra_args.clone(),
            env_pairs,
            ready_pattern,
            sink.clone(),
            self.config.runtime.clone(),
        );

        let stop_initiated = AtomicBool::new(false);

        let wait_ready = async {
            running.ready().await;
            let _ = cell.ready_tx.send(true);
        };

        let wait_terminate = async {
            loop {
                tokio::select! {
                    outcome = running.terminated() => return outcome,
                    changed = stop_rx.changed() => {
                        if changed.is_ok() {
                            match *stop_rx.borrow() {
                                StopRequest::Graceful => {
                                    stop_initiated.store(true, Ordering::SeqCst);
                                    running.request_kill();
                                }
                                StopRequest::Forceful => {
                                    stop_initiated.store(true, Ordering::SeqCst);
                                    running.request_kill_forceful();
                                }
                                StopRequest::None => {}
                            }
                        }
                    }
                }
            }
        };

        let (_, outcome) = tokio::join!(wait_ready, wait_terminate);
        let stop_initiated = stop_initiated.load(Ordering::SeqCst);
        let is_service = config.service.is_some();

        // A service only ever terminates on its own by mistake (spec §4.5
        // "services are expected to run until stopped"); a one-shot script
        // killed because of a stop we ourselves requested (cancellation, or
        // another script's failure in "kill" mode) is downstream of that
        // request rather than a failure of its own.
        match (is_service, stop_initiated, &outcome) {
            (true, true, runner::TerminationOutcome::Killed) => {}
            (true, ..) => {
                return Err(Arc::new(ScriptFailure::from(ExecutionFailure::ServiceExitedUnexpectedly)));
            }
            (false, true, runner::TerminationOutcome::Killed) => {
                return Err(Arc::new(ScriptFailure::from(ControlFlowOutcome::Aborted)));
            }
            (false, ..) => {
                outcome.into_execution_result().map_err(|e| Arc::new(ScriptFailure::from(e)))?;
            }
        }

        Ok(ReplayLogs {
            stdout: sink.take_stdout(),
            stderr: sink.take_stderr(),
        })
    }
}

/// Downgrade a dependency's own failure to a control-flow outcome for the
/// dependent: the dependency's failure was already reported, so the
/// dependent just needs to stop without being separately logged.
fn downstream(failure: Arc<ScriptFailure>) -> Arc<ScriptFailure> {
    match failure.as_ref() {
        ScriptFailure::Execution(ExecutionFailure::ServiceExitedUnexpectedly) | ScriptFailure::ControlFlow(_) => {
            Arc::new(ScriptFailure::from(ControlFlowOutcome::DependencyServiceExitedUnexpectedly))
        }
        _ => Arc::new(ScriptFailure::from(ControlFlowOutcome::Aborted)),
    }
}

fn resolve_env(declared: &HashMap<String, EnvVarConfig>, runtime: &dyn Runtime) -> BTreeMap<String, String> {
    let mut resolved = BTreeMap::new();
    for (name, cfg) in declared {
        let value = match cfg {
            EnvVarConfig::External => runtime.env_var(name).unwrap_or_default(),
            EnvVarConfig::Default(default) => runtime.env_var(name).unwrap_or_else(|| default.clone()),
        };
        resolved.insert(name.clone(), value);
    }
    resolved
}

struct CapturingSink {
    live: Arc<dyn OutputSink>,
    stdout: std::sync::Mutex<Vec<u8>>,
    stderr: std::sync::Mutex<Vec<u8>>,
}

impl CapturingSink {
    fn take_stdout(&self) -> Option<Vec<u8>> {
        let buf = std::mem::take(&mut *self.stdout.lock().expect("capture mutex poisoned"));
        (!buf.is_empty()).then_some(buf)
    }

    fn take_stderr(&self) -> Option<Vec<u8>> {
        let buf = std::mem::take(&mut *self.stderr.lock().expect("capture mutex poisoned"));
        (!buf.is_empty()).then_some(buf)
    }
}

impl OutputSink for CapturingSink {
    fn on_stdout_line(&self, line: &[u8]) {
        self.live.on_stdout_line(line);
        let mut buf = self.stdout.lock().expect("capture mutex poisoned");
        buf.extend_from_slice(line);
        buf.push(b'\n');
    }

    fn on_stderr_line(&self, line: &[u8]) {
        self.live.on_stderr_line(line);
        let mut buf = self.stderr.lock().expect("capture mutex poisoned");
        buf.extend_from_slice(line);
        buf.push(b'\n');
    }
}

async fn read_prior_fingerprint(state_dir: &AbsDirPath) -> Option<Fingerprint> {
    let path = state_dir.join_str_file(FINGERPRINT_FILE_NAME);
    let content = fs::read_to_string(&path).await.ok().flatten()?;
    serde_json::from_str(&content).ok()
}

async fn read_prior_manifest(state_dir: &AbsDirPath) -> Option<OutputManifest> {
    let path = state_dir.join_str_file(MANIFEST_FILE_NAME);
    let content = fs::read_to_string(&path).await.ok().flatten()?;
    serde_json::from_str(&content).ok()
}

async fn remove_persisted_state(state_dir: &AbsDirPath) {
    for name in [FINGERPRINT_FILE_NAME, MANIFEST_FILE_NAME, STDOUT_FILE_NAME, STDERR_FILE_NAME] {
        let _ = tokio::fs::remove_file(state_dir.join_str_file(name).as_std_path()).await;
    }
}

async fn persist_state(
    state_dir: &AbsDirPath,
    fingerprint: &Fingerprint,
    manifest: &OutputManifest,
    replay: &ReplayLogs,
) -> Result<(), String> {
    let fingerprint_string = fingerprint.canonical_string().map_err(|e| e.to_string())?;
    fs::write_atomic(&state_dir.join_str_file(FINGERPRINT_FILE_NAME), fingerprint_string)
        .await
        .map_err(|e| e.to_string())?;
    let manifest_string = serde_json::to_string(manifest).map_err(|e| e.to_string())?;
    fs::write_atomic(&state_dir.join_str_file(MANIFEST_FILE_NAME), manifest_string)
        .await
        .map_err(|e| e.to_string())?;
    if let Some(stdout) = &replay.stdout {
        let _ = fs::write(&state_dir.join_str_file(STDOUT_FILE_NAME), stdout).await;
    }
    if let Some(stderr) = &replay.stderr {
        let _ = fs::write(&state_dir.join_str_file(STDERR_FILE_NAME), stderr).await;
    }
    Ok(())
}

async fn replay_persisted_logs(state_dir: &AbsDirPath, sink: &dyn OutputSink) {
    if let Ok(stdout) = tokio::fs::read(state_dir.join_str_file(STDOUT_FILE_NAME).as_std_path()).await {
        sink.on_stdout_line(&stdout);
    }
    if let Ok(stderr) = tokio::fs::read(state_dir.join_str_file(STDERR_FILE_NAME).as_std_path()).await {
        sink.on_stderr_line(&stderr);
    }
}

async fn capture_output_manifest(package_dir: &AbsDirPath, output: Option<&[String]>) -> Result<OutputManifest, ScriptFailure> {
    let Some(patterns) = output else {
        return Ok(BTreeMap::new());
    };
    let set = glob::GlobSet::compile(patterns, true).map_err(|e| ScriptFailure::internal(e.to_string()))?;
    let matches = set.resolve(package_dir).map_err(|e| ScriptFailure::internal(e.to_string()))?;

    let mut manifest = BTreeMap::new();
    for entry in matches {
        if entry.kind != glob::EntryKind::File {
            continue;
        }
        let abs = package_dir.as_std_path().join(entry.path.as_std_path());
        let meta = tokio::fs::symlink_metadata(&abs).await.map_err(|e| ScriptFailure::internal(e.to_string()))?;
        manifest.insert(abs.to_string_lossy().into_owned(), file_stat(&meta));
    }
    Ok(manifest)
}

async fn resolve_output_paths(package_dir: &AbsDirPath, patterns: &[String]) -> Result<Vec<path::RelSomePath>, glob::GlobError> {
    let set = glob::GlobSet::compile(patterns, true)?;
    let matches = set.resolve(package_dir)?;
    Ok(matches.into_iter().map(|m| m.path).collect())
}

#[cfg(unix)]
fn file_stat(meta: &std::fs::Metadata) -> FileStat {
    use std::os::unix::fs::MetadataExt;
    FileStat {
        ctime_ns: meta.ctime() * 1_000_000_000 + meta.ctime_nsec(),
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        size_bytes: meta.size(),
    }
}

#[cfg(windows)]
fn file_stat(meta: &std::fs::Metadata) -> FileStat {
    use std::os::windows::fs::MetadataExt;
    FileStat {
        ctime_ns: (meta.creation_time() as i64) * 100,
        mtime_ns: (meta.last_write_time() as i64) * 100,
        size_bytes: meta.file_size(),
    }
}

async fn clean_outputs(
    package_dir: &AbsDirPath,
    output: Option<&[String]>,
    clean: CleanConfig,
    prior_fingerprint: Option<&Fingerprint>,
    current_files: &BTreeMap<String, String>,
) -> Result<(), ScriptFailure> {
    let should_clean = match clean {
        CleanConfig::Always => true,
        CleanConfig::Never => false,
        CleanConfig::IfFileDeleted => match prior_fingerprint {
            Some(prior) => !prior.files.keys().all(|f| current_files.contains_key(f)),
            None => false,
        },
    };
    if !should_clean {
        return Ok(());
    }
    let Some(patterns) = output else {
        return Ok(());
    };
    let set = glob::GlobSet::compile(patterns, true).map_err(|e| ScriptFailure::internal(e.to_string()))?;
    let matches = set.resolve(package_dir).map_err(|e| ScriptFailure::internal(e.to_string()))?;
    for entry in matches {
        let abs = package_dir.as_std_path().join(entry.path.as_std_path());
        match entry.kind {
            glob::EntryKind::Dir => {
                let _ = tokio::fs::remove_dir_all(&abs).await;
            }
            _ => {
                let _ = tokio::fs::remove_file(&abs).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let pool = Arc::new(WorkerPool::new(Some(1)));
        let a = pool.acquire().await;
        let pool2 = pool.clone();
        let handle = tokio::spawn(async move {
            let _b = pool2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(a);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_pool_unbounded_never_blocks() {
        let pool = WorkerPool::new(None);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        drop(a);
        drop(b);
    }

    #[test]
    fn resolve_env_prefers_process_value_over_default() {
        let runtime = crate::runtime::FakeRuntime::new().with_env("PACKRUN_TEST_ENV_VAR", "from-process");
        let mut declared = HashMap::new();
        declared.insert("PACKRUN_TEST_ENV_VAR".to_string(), EnvVarConfig::Default("fallback".to_string()));
        let resolved = resolve_env(&declared, &runtime);
        assert_eq!(resolved.get("PACKRUN_TEST_ENV_VAR").map(String::as_str), Some("from-process"));
    }

    #[test]
    fn resolve_env_falls_back_to_default_when_unset() {
        let runtime = crate::runtime::FakeRuntime::new();
        let mut declared = HashMap::new();
        declared.insert("PACKRUN_TEST_ENV_VAR".to_string(), EnvVarConfig::Default("fallback".to_string()));
        let resolved = resolve_env(&declared, &runtime);
        assert_eq!(resolved.get("PACKRUN_TEST_ENV_VAR").map(String::as_str), Some("fallback"));
    }
}
