//! WorkerStatusRegistry - 起動したワーカーの台帳
//!
//! ワーカーグループ（fork_count > 0）は自分の OS スレッド・ランタイムで動くので、
//! 起動時に自分のスナップショットを mpsc で送り、親（スーパーバイザ）がそれを
//! 読み出して集約します。グループなし（fork_count = 0）のときは直接 `record` する。
//!
//! 観測・テスト専用。協調には使わない。

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One poll loop inside a worker group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerThread {
    pub name: String,
    pub index: usize,
}

/// One worker group: an OS thread with its own runtime when fanned out,
/// the supervisor's own runtime otherwise (`group = None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub pid: u32,
    pub group: Option<usize>,
    pub threads: Vec<WorkerThread>,
}

impl WorkerProcess {
    pub fn new(group: Option<usize>, threads: Vec<WorkerThread>) -> Self {
        Self {
            pid: std::process::id(),
            group,
            threads,
        }
    }
}

/// Sending half handed to each worker group.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: mpsc::UnboundedSender<WorkerProcess>,
}

impl StatusReporter {
    /// `false` once the registry is gone.
    pub fn report(&self, process: WorkerProcess) -> bool {
        self.tx.send(process).is_ok()
    }
}

pub struct WorkerStatusRegistry {
    tx: mpsc::UnboundedSender<WorkerProcess>,
    rx: Mutex<mpsc::UnboundedReceiver<WorkerProcess>>,
    workers: Mutex<Vec<WorkerProcess>>,
}

impl WorkerStatusRegistry {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn reporter(&self) -> StatusReporter {
        StatusReporter {
            tx: self.tx.clone(),
        }
    }

    /// In-process registration (no channel hop).
    pub fn record(&self, process: WorkerProcess) {
        lock(&self.workers).push(process);
    }

    /// Drain pending reports into the list.
    pub fn collect(&self) -> usize {
        let mut rx = lock(&self.rx);
        let mut workers = lock(&self.workers);
        let mut drained = 0;
        while let Ok(process) = rx.try_recv() {
            workers.push(process);
            drained += 1;
        }
        drained
    }

    /// Snapshot after draining pending reports, ordered by group.
    pub fn workers(&self) -> Vec<WorkerProcess> {
        self.collect();
        let mut workers = lock(&self.workers).clone();
        workers.sort_by_key(|process| process.group);
        workers
    }

    pub fn thread_count(&self) -> usize {
        self.workers().iter().map(|p| p.threads.len()).sum()
    }

    /// Forget everything, including reports still in flight.
    pub fn clear(&self) {
        self.collect();
        lock(&self.workers).clear();
    }
}

impl Default for WorkerStatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkerStatusRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerStatusRegistry")
            .field("workers", &lock(&self.workers).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
