//! Worker threads that execute processes
//!
//! Each worker owns a local deque of runnable processes. Work is found in
//! order: the worker's external queue (pinned processes), the local deque,
//! stealing from a random sibling, then the global injector. Workers with
//! nothing to do park on the pool's condition variable.
//!
//! A worker running a pinned process switches to exclusive mode: its other
//! local work is pushed back to the global queue and no new work is stolen
//! until the process unpins.

use crate::interpreter::Machine;
use crate::process::{Process, ProcessStatus};
use crate::scheduler::pool::PoolState;
use crossbeam_deque::Worker as WorkerQueue;
use std::sync::Arc;

/// The mode a worker is in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Process local work and steal from siblings
    Normal,
    /// Only run the pinned process; steal nothing
    Exclusive,
}

/// A worker owned by one OS thread
pub struct Worker {
    /// The unique index of this worker within its pool
    id: usize,
    /// The local deque
    queue: WorkerQueue<Arc<Process>>,
    /// Shared pool state
    pool: Arc<PoolState>,
    /// The machine used to execute processes
    machine: Machine,
    /// The current mode
    mode: Mode,
}

impl Worker {
    /// Create a worker
    pub fn new(
        id: usize,
        queue: WorkerQueue<Arc<Process>>,
        pool: Arc<PoolState>,
        machine: Machine,
    ) -> Self {
        Self {
            id,
            queue,
            pool,
            machine,
            mode: Mode::Normal,
        }
    }

    /// The worker's index within its pool
    pub fn id(&self) -> usize {
        self.id
    }

    /// The current mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Push a process onto the local deque
    pub fn push_local(&self, process: Arc<Process>) {
        self.queue.push(process);
    }

    /// Enter exclusive mode for a pinned process
    ///
    /// Local work is pushed back to the global queue so other workers can
    /// take it; only the pinned process (re-queued on the external queue or
    /// the local deque) runs here until the matching unpin.
    pub fn enter_exclusive_mode(&mut self) {
        while let Some(job) = self.queue.pop() {
            self.pool.push(job);
        }

        self.mode = Mode::Exclusive;
    }

    /// Return to normal work stealing
    pub fn leave_exclusive_mode(&mut self) {
        self.mode = Mode::Normal;
    }

    /// Run until the pool terminates
    pub fn run(&mut self) {
        while self.pool.is_alive() {
            match self.mode {
                Mode::Normal => self.normal_iteration(),
                Mode::Exclusive => self.exclusive_iteration(),
            }
        }

        #[cfg(debug_assertions)]
        eprintln!("{} worker {} shutting down", self.pool.name, self.id);
    }

    /// One iteration of the normal work loop
    fn normal_iteration(&mut self) {
        if let Some(process) = self.pool.pop_external(self.id) {
            self.process_job(process);
            return;
        }

        if let Some(process) = self.queue.pop() {
            self.process_job(process);
            return;
        }

        if let Some(process) = self.steal_from_siblings() {
            self.process_job(process);
            return;
        }

        if let Some(process) = self.pool.pop_global() {
            self.process_job(process);
            return;
        }

        self.pool.park(self.id);
    }

    /// One iteration of the exclusive work loop
    ///
    /// Stealing would starve the pinned process, so only the external queue
    /// and the local deque are consulted.
    fn exclusive_iteration(&mut self) {
        if let Some(process) = self.pool.pop_external(self.id) {
            self.process_job(process);
            return;
        }

        if let Some(process) = self.queue.pop() {
            self.process_job(process);
            return;
        }

        self.pool.park(self.id);
    }

    /// Steal from a random sibling to avoid contention pile-ups
    fn steal_from_siblings(&self) -> Option<Arc<Process>> {
        use rand::Rng;

        let count = self.pool.stealer_count();

        if count <= 1 {
            return None;
        }

        let start = rand::thread_rng().gen_range(0..count);

        for offset in 0..count {
            let victim = (start + offset) % count;

            if victim == self.id {
                continue;
            }

            if let Some(process) = self.pool.steal_from(victim) {
                return Some(process);
            }
        }

        None
    }

    /// Execute one process until it yields, suspends or terminates
    fn process_job(&mut self, process: Arc<Process>) {
        if process.is_terminated() {
            return;
        }

        process.set_status(ProcessStatus::Running);

        let machine = self.machine.clone();

        machine.run(self, &process);
    }
}
