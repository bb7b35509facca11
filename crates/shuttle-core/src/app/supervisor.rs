//! WorkerSupervisor - ワーカーのライフサイクル管理
//!
//! # 状態遷移
//! `Idle → Configuring → Running → Stopping → Stopped`
//! - `Running → Idle` は不可（再起動には新しいインスタンスが必要）
//! - シグナル（SIGINT / SIGTERM）受信時は `Running → Stopping` のあと通常の
//!   `stop` と同じ手順で `Stopped` まで進め、`exit_on_signal` ならプロセスを終了
//!
//! # ファンアウト
//! - `fork_count = 0`: 呼び出し元のランタイム上に `thread_count` 本の poll ループ
//! - `fork_count = N`: N 個のワーカーグループ。グループごとに OS スレッド +
//!   マルチスレッドランタイムを持ち、1 つのグループが落ちても他は動き続ける
//!
//! # 停止
//! running フラグ（watch）を false にするだけ。処理中のハンドラは最後まで走る。
//! `wait = true` なら `stop` はすべての poll ループの終了を待つ。

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::handler::MessageHandler;
use super::options::WorkerOptions;
use super::pipeline::MessagePipeline;
use super::status::{StatusReporter, WorkerProcess, WorkerStatusRegistry, WorkerThread};
use super::worker_loop::PollLoop;
use crate::domain::{QueuePolicy, ShuttleError, SupervisorState, WorkerFailure, WorkerThreadError};
use crate::nonce::NonceManager;
use crate::observability::PipelineCounts;
use crate::ports::BrokerClient;
use crate::retry::RetryBackoff;

type Failures = Arc<Mutex<Vec<WorkerThreadError>>>;

enum GroupHandle {
    /// Poll loops on the supervisor's own runtime.
    Local(JoinHandle<()>),
    /// A worker group thread with its own runtime.
    Thread(std::thread::JoinHandle<()>),
}

impl GroupHandle {
    async fn join(self) {
        match self {
            GroupHandle::Local(handle) => {
                if let Err(err) = handle.await {
                    error!(error = %err, "worker group task failed");
                }
            }
            GroupHandle::Thread(handle) => {
                match tokio::task::spawn_blocking(move || handle.join()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => error!("worker group thread panicked"),
                    Err(err) => error!(error = %err, "failed to join worker group thread"),
                }
            }
        }
    }
}

struct ActiveRun {
    groups: Vec<GroupHandle>,
    wait: bool,
}

/// Everything `stop` touches. Shared with the signal task.
struct Lifecycle {
    state: watch::Sender<SupervisorState>,
    running: watch::Sender<bool>,
    registry: WorkerStatusRegistry,
    counts: Arc<Mutex<PipelineCounts>>,
    run: Mutex<Option<ActiveRun>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: watch::channel(SupervisorState::Idle).0,
            running: watch::channel(false).0,
            registry: WorkerStatusRegistry::new(),
            counts: Arc::default(),
            run: Mutex::new(None),
        }
    }

    fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// `Idle → Configuring`. False if `start` was already called.
    fn claim(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_started() {
                return false;
            }
            *state = SupervisorState::Configuring;
            true
        })
    }

    fn transition(&self, next: SupervisorState) -> Result<(), ShuttleError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(next) => {
                *state = next;
                true
            }
            Err(err) => {
                result = Err(err);
                false
            }
        });
        result
    }

    /// `Running → Stopping` and drop the running flag. Idempotent.
    fn request_stop(&self) {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Running {
                *state = SupervisorState::Stopping;
                true
            } else {
                false
            }
        });
        self.running.send_replace(false);
    }

    async fn stop(&self) -> bool {
        if !matches!(
            self.state(),
            SupervisorState::Running | SupervisorState::Stopping
        ) {
            return false;
        }
        self.request_stop();

        let Some(run) = lock(&self.run).take() else {
            return false;
        };

        info!(groups = run.groups.len(), wait = run.wait, "stopping workers");
        if run.wait {
            for group in run.groups {
                group.join().await;
            }
        }

        self.registry.clear();
        if let Err(err) = self.transition(SupervisorState::Stopped) {
            warn!(error = %err, "unexpected supervisor state on stop");
        }
        let processed = lock(&self.counts).processed();
        info!(processed, "workers stopped");
        true
    }

    async fn wait_until_terminal(&self) {
        let mut state = self.state.subscribe();
        // the sender lives in `self`, so this only ends on `Stopped`
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

pub struct WorkerSupervisor {
    nonce: Arc<NonceManager>,
    failures: Failures,
    lifecycle: Arc<Lifecycle>,
}

impl WorkerSupervisor {
    /// `nonce` is shared with every pipeline this supervisor builds. Pass a
    /// disabled `NonceManager::new()` to rely on the broker alone.
    pub fn new(nonce: Arc<NonceManager>) -> Self {
        Self {
            nonce,
            failures: Arc::default(),
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.running.borrow()
    }

    pub fn counts(&self) -> PipelineCounts {
        lock(&self.lifecycle.counts).clone()
    }

    /// Worker groups that have started and reported in.
    pub fn workers(&self) -> Vec<WorkerProcess> {
        self.lifecycle.registry.workers()
    }

    /// Poll loops that terminated with a `WorkerThreadError`.
    pub fn failures(&self) -> Vec<WorkerThreadError> {
        lock(&self.failures).clone()
    }

    /// Validate `options`, spawn the poll loops and (optionally) block until
    /// they stop.
    ///
    /// # Errors
    /// - `AlreadyRunning` unless the supervisor is `Idle`
    /// - `Configuration` when the broker client is missing, `thread_count`
    ///   is 0, or the queue requires signatures without a verifier
    /// - `WorkerThread` when a worker group thread cannot be spawned
    pub async fn start(
        &self,
        queue: QueuePolicy,
        options: WorkerOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<bool, ShuttleError> {
        let lifecycle = &self.lifecycle;
        if !lifecycle.claim() {
            return Err(ShuttleError::AlreadyRunning);
        }

        let client = match validate(&queue, &options) {
            Ok(client) => client,
            Err(err) => {
                lifecycle.transition(SupervisorState::Idle)?;
                return Err(err);
            }
        };

        let backoff = options
            .jitter
            .clone()
            .map(RetryBackoff::with_jitter)
            .unwrap_or_default();
        let queue_name = queue.name.clone();
        let pipeline = Arc::new(
            MessagePipeline::new(Arc::new(queue), handler, Arc::clone(&self.nonce))
                .with_verifier(options.verifier.clone())
                .with_callbacks(options.callbacks.clone())
                .with_backoff(backoff)
                .with_counts(Arc::clone(&lifecycle.counts)),
        );

        lifecycle.running.send_replace(true);
        let groups = match self.spawn_groups(&options, &client, &pipeline) {
            Ok(groups) => groups,
            Err(err) => {
                // groups already spawned see the flag and exit on their own
                lifecycle.running.send_replace(false);
                lifecycle.transition(SupervisorState::Running)?;
                lifecycle.transition(SupervisorState::Stopping)?;
                lifecycle.transition(SupervisorState::Stopped)?;
                return Err(err);
            }
        };

        *lock(&lifecycle.run) = Some(ActiveRun {
            groups,
            wait: options.wait,
        });
        lifecycle.transition(SupervisorState::Running)?;

        if options.trap_signals {
            match ShutdownSignals::install() {
                Ok(signals) => {
                    tokio::spawn(trap_signals(
                        Arc::clone(lifecycle),
                        signals,
                        options.exit_on_signal,
                    ));
                }
                Err(err) => warn!(error = %err, "could not install signal handlers"),
            }
        }
        info!(
            queue = %queue_name,
            thread_count = options.thread_count,
            fork_count = options.fork_count,
            "workers started"
        );

        if options.block_process {
            wait_until_stopped(lifecycle.running.subscribe()).await;
            lifecycle.stop().await;
            // another caller may be the one joining
            lifecycle.wait_until_terminal().await;
        }
        Ok(true)
    }

    /// Flip the running flag and, when `wait` was set, join every poll loop.
    ///
    /// Returns `false` if the workers were not running (or another `stop`
    /// is already tearing them down).
    pub async fn stop(&self) -> bool {
        self.lifecycle.stop().await
    }

    fn spawn_groups(
        &self,
        options: &WorkerOptions,
        client: &Arc<dyn BrokerClient>,
        pipeline: &Arc<MessagePipeline>,
    ) -> Result<Vec<GroupHandle>, ShuttleError> {
        let build_loops = |prefix: &str| -> (Vec<PollLoop>, Vec<WorkerThread>) {
            (0..options.thread_count)
                .map(|index| {
                    let name = format!("{prefix}-{index}");
                    let poll = PollLoop::new(name.clone(), Arc::clone(pipeline), Arc::clone(client))
                        .with_poll_wait(options.queue_poll_wait)
                        .with_empty_poll_sleep(options.empty_poll_sleep)
                        .with_gc_flush_interval(options.gc_flush_interval);
                    (poll, WorkerThread { name, index })
                })
                .unzip()
        };

        let registry = &self.lifecycle.registry;
        if options.fork_count == 0 {
            let (loops, threads) = build_loops("poller");
            registry.record(WorkerProcess::new(None, threads));
            let handle = tokio::spawn(run_loops(
                loops,
                self.lifecycle.running.subscribe(),
                Arc::clone(&self.failures),
            ));
            return Ok(vec![GroupHandle::Local(handle)]);
        }

        let mut groups = Vec::with_capacity(options.fork_count);
        for group in 0..options.fork_count {
            let (loops, threads) = build_loops(&format!("poller-{group}"));
            let handle = spawn_group(
                group,
                options.thread_count,
                loops,
                threads,
                self.lifecycle.running.subscribe(),
                Arc::clone(&self.failures),
                registry.reporter(),
            )?;
            groups.push(GroupHandle::Thread(handle));
        }
        Ok(groups)
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

fn validate(
    queue: &QueuePolicy,
    options: &WorkerOptions,
) -> Result<Arc<dyn BrokerClient>, ShuttleError> {
    let Some(client) = options.client.clone() else {
        return Err(ShuttleError::Configuration(
            "a broker client is required".to_string(),
        ));
    };
    if options.thread_count == 0 {
        return Err(ShuttleError::Configuration(
            "thread_count must be at least 1".to_string(),
        ));
    }
    if queue.require_signature && options.verifier.is_none() {
        return Err(ShuttleError::Configuration(format!(
            "queue {} requires signatures but no verifier was supplied",
            queue.name
        )));
    }
    Ok(client)
}

async fn wait_until_stopped(mut running: watch::Receiver<bool>) {
    let _ = running.wait_for(|running| !*running).await;
}

/// SIGTERM and SIGINT, registered up front so a signal sent right after
/// `start` returns is not missed.
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                terminate: signal(SignalKind::terminate())?,
                interrupt: signal(SignalKind::interrupt())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.terminate.recv() => {}
                _ = self.interrupt.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Run `stop` on the first signal, then exit when `exit` is set.
///
/// tokio never uninstalls a signal handler, so with `exit` set the task
/// outlives the run: a signal after a regular `stop` still ends the process.
/// Without it the task returns once the supervisor is `Stopped`.
async fn trap_signals(lifecycle: Arc<Lifecycle>, mut signals: ShutdownSignals, exit: bool) {
    if exit {
        signals.recv().await;
    } else {
        tokio::select! {
            _ = signals.recv() => {}
            _ = lifecycle.wait_until_terminal() => return,
        }
    }

    info!(state = %lifecycle.state(), "termination signal received, stopping workers");
    if !lifecycle.stop().await {
        // another stop is joining the loops
        lifecycle.wait_until_terminal().await;
    }

    if exit {
        info!("exiting after termination signal");
        std::process::exit(0);
    }
}

/// Spawn every loop, then wait for all of them. Each loop gets its own
/// watcher task so a failure is logged as soon as it happens.
async fn run_loops(loops: Vec<PollLoop>, running: watch::Receiver<bool>, failures: Failures) {
    let watchers: Vec<_> = loops
        .into_iter()
        .map(|poll| {
            let name = poll.name().to_string();
            let loop_task = tokio::spawn(poll.run(running.clone()));
            let failures = Arc::clone(&failures);
            tokio::spawn(async move {
                let failure = match loop_task.await {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => err,
                    Err(err) => WorkerThreadError::new(name, WorkerFailure::Panicked(err.to_string())),
                };
                error!(worker = %failure.worker, error = %failure, "worker terminated");
                lock(&failures).push(failure);
            })
        })
        .collect();

    for watcher in watchers {
        let _ = watcher.await;
    }
}

fn spawn_group(
    group: usize,
    thread_count: usize,
    loops: Vec<PollLoop>,
    threads: Vec<WorkerThread>,
    running: watch::Receiver<bool>,
    failures: Failures,
    reporter: StatusReporter,
) -> Result<std::thread::JoinHandle<()>, ShuttleError> {
    let thread_name = format!("shuttle-group-{group}");
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(thread_count)
                .thread_name(format!("{thread_name}-rt"))
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(group, error = %err, "failed to build worker group runtime");
                    lock(&failures).push(WorkerThreadError::new(
                        thread_name,
                        WorkerFailure::Startup(err.to_string()),
                    ));
                    return;
                }
            };
            reporter.report(WorkerProcess::new(Some(group), threads));
            runtime.block_on(run_loops(loops, running, failures));
        })
        .map_err(|err| {
            ShuttleError::WorkerThread(WorkerThreadError::new(
                format!("shuttle-group-{group}"),
                WorkerFailure::Startup(err.to_string()),
            ))
        })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
