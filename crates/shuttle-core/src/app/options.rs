//! WorkerOptions - `WorkerSupervisor::start` に渡すオプション
//!
//! 必須なのはブローカークライアントだけ。残りはすべてデフォルトあり。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::handler::Callbacks;
use crate::ports::{BrokerClient, JitterSource, SignatureVerifier};
use crate::settings::WorkerSettings;

#[derive(Clone)]
pub struct WorkerOptions {
    /// Opens one broker channel per poll loop. Mandatory.
    pub client: Option<Arc<dyn BrokerClient>>,
    /// Mandatory when the queue requires signatures.
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
    pub callbacks: Callbacks,
    /// Overrides the backoff jitter draw (tests).
    pub jitter: Option<Arc<dyn JitterSource>>,

    /// Poll loops per worker group (>= 1).
    pub thread_count: usize,
    /// Worker groups, each on its own OS thread and runtime. 0 = none.
    pub fork_count: usize,
    /// `stop` joins the poll loops before returning.
    pub wait: bool,
    /// `start` returns only once the workers have stopped.
    pub block_process: bool,
    pub queue_poll_wait: Duration,
    pub empty_poll_sleep: Duration,
    pub gc_flush_interval: u64,
    /// Map SIGINT/SIGTERM to a full `stop` while running.
    pub trap_signals: bool,
    /// After a trapped signal has stopped the workers, exit the process.
    /// Turn off to keep the host alive (the supervisor ends up `Stopped`).
    pub exit_on_signal: bool,
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            thread_count: settings.thread_count,
            fork_count: settings.fork_count,
            wait: settings.wait,
            block_process: settings.block_process,
            queue_poll_wait: Duration::from_secs(settings.queue_poll_wait_secs),
            empty_poll_sleep: Duration::from_millis(settings.empty_poll_sleep_ms),
            gc_flush_interval: settings.gc_flush_interval,
            trap_signals: settings.trap_signals,
            exit_on_signal: settings.exit_on_signal,
            ..Self::default()
        }
    }

    pub fn client(mut self, client: Arc<dyn BrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn fork_count(mut self, n: usize) -> Self {
        self.fork_count = n;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn block_process(mut self, block: bool) -> Self {
        self.block_process = block;
        self
    }

    pub fn queue_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.queue_poll_wait = poll_wait;
        self
    }

    pub fn empty_poll_sleep(mut self, sleep: Duration) -> Self {
        self.empty_poll_sleep = sleep;
        self
    }

    pub fn gc_flush_interval(mut self, every: u64) -> Self {
        self.gc_flush_interval = every;
        self
    }

    pub fn trap_signals(mut self, trap: bool) -> Self {
        self.trap_signals = trap;
        self
    }

    pub fn exit_on_signal(mut self, exit: bool) -> Self {
        self.exit_on_signal = exit;
        self
    }
}

/// Library default leaves signals alone; the settings default traps them.
impl Default for WorkerOptions {
    fn default() -> Self {
        let settings = WorkerSettings::default();
        Self {
            client: None,
            verifier: None,
            callbacks: Callbacks::default(),
            jitter: None,
            thread_count: settings.thread_count,
            fork_count: settings.fork_count,
            wait: settings.wait,
            block_process: settings.block_process,
            queue_poll_wait: Duration::from_secs(settings.queue_poll_wait_secs),
            empty_poll_sleep: Duration::from_millis(settings.empty_poll_sleep_ms),
            gc_flush_interval: settings.gc_flush_interval,
            trap_signals: false,
            exit_on_signal: settings.exit_on_signal,
        }
    }
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("client", &self.client.is_some())
            .field("verifier", &self.verifier.is_some())
            .field("callbacks", &self.callbacks)
            .field("thread_count", &self.thread_count)
            .field("fork_count", &self.fork_count)
            .field("wait", &self.wait)
            .field("block_process", &self.block_process)
            .field("queue_poll_wait", &self.queue_poll_wait)
            .field("empty_poll_sleep", &self.empty_poll_sleep)
            .field("gc_flush_interval", &self.gc_flush_interval)
            .field("trap_signals", &self.trap_signals)
            .field("exit_on_signal", &self.exit_on_signal)
            .finish()
    }
}
