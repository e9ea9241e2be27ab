//! Shared state of one worker pool
//!
//! A pool owns the global injector, the per-worker external queues used for
//! pinned processes, the stealer handles and the park group. Workers park
//! on the condition variable when no work is visible; every enqueue unparks
//! at least one worker.

use crate::process::Process;
use crossbeam_deque::{Injector, Steal, Stealer};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a parked worker sleeps before rechecking for stealable work
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// State shared by every worker of one pool
pub struct PoolState {
    /// Pool name used for thread names
    pub name: &'static str,
    /// The global injection queue
    injector: Injector<Arc<Process>>,
    /// Per-worker external queues, used for pinned processes
    externals: Vec<Injector<Arc<Process>>>,
    /// Stealer handles of every worker's local deque, set once at startup
    stealers: RwLock<Vec<Stealer<Arc<Process>>>>,
    /// Count of currently parked workers
    parked: Mutex<usize>,
    /// Signalled when work arrives
    unpark: Condvar,
    /// Cleared when the pool shuts down
    alive: AtomicBool,
}

impl PoolState {
    /// Create the state for a pool of `workers` threads
    pub fn new(name: &'static str, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            injector: Injector::new(),
            externals: (0..workers).map(|_| Injector::new()).collect(),
            stealers: RwLock::new(Vec::new()),
            parked: Mutex::new(0),
            unpark: Condvar::new(),
            alive: AtomicBool::new(true),
        })
    }

    /// The number of workers this pool was sized for
    pub fn worker_count(&self) -> usize {
        self.externals.len()
    }

    /// Register the stealer handles of all workers; called once before the
    /// worker threads start.
    pub fn set_stealers(&self, stealers: Vec<Stealer<Arc<Process>>>) {
        *self.stealers.write() = stealers;
    }

    /// Push a process onto the global injector and unpark a worker
    pub fn push(&self, process: Arc<Process>) {
        self.injector.push(process);
        self.unpark_one();
    }

    /// Push a process onto a specific worker's external queue
    ///
    /// Used for pinned processes; falls back to the global injector when
    /// the worker index is out of range.
    pub fn push_external(&self, worker: usize, process: Arc<Process>) {
        match self.externals.get(worker) {
            Some(queue) => {
                queue.push(process);
                // The pinned worker may be parked like any other; wake
                // everyone so it gets a chance to look.
                self.unpark_all();
            }
            None => self.push(process),
        }
    }

    /// Steal a process from the global injector
    pub fn pop_global(&self) -> Option<Arc<Process>> {
        loop {
            match self.injector.steal() {
                Steal::Success(process) => return Some(process),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Pop a process from a worker's external queue
    pub fn pop_external(&self, worker: usize) -> Option<Arc<Process>> {
        let queue = self.externals.get(worker)?;

        loop {
            match queue.steal() {
                Steal::Success(process) => return Some(process),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Whether either shared queue holds work visible to `worker`
    pub fn has_shared_work(&self, worker: usize) -> bool {
        !self.injector.is_empty()
            || self
                .externals
                .get(worker)
                .map(|queue| !queue.is_empty())
                .unwrap_or(false)
    }

    /// Steal from another worker's local deque
    pub fn steal_from(&self, victim: usize) -> Option<Arc<Process>> {
        let stealers = self.stealers.read();
        let stealer = stealers.get(victim)?;

        loop {
            match stealer.steal() {
                Steal::Success(process) => return Some(process),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// The number of registered stealers
    pub fn stealer_count(&self) -> usize {
        self.stealers.read().len()
    }

    /// Park the calling worker until work arrives, the timeout passes, or
    /// the pool shuts down
    pub fn park(&self, worker: usize) {
        let mut parked = self.parked.lock();

        if !self.is_alive() || self.has_shared_work(worker) {
            return;
        }

        *parked += 1;
        let _ = self.unpark.wait_for(&mut parked, PARK_TIMEOUT);
        *parked -= 1;
    }

    /// Wake one parked worker
    pub fn unpark_one(&self) {
        let _parked = self.parked.lock();

        self.unpark.notify_one();
    }

    /// Wake every parked worker
    pub fn unpark_all(&self) {
        let _parked = self.parked.lock();

        self.unpark.notify_all();
    }

    /// Whether the pool is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Shut the pool down and wake every worker so it can exit
    pub fn terminate(&self) {
        self.alive.store(false, Ordering::Release);
        self.unpark_all();
    }
}
