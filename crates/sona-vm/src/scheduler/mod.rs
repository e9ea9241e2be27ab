//! Process scheduler
//!
//! Two pools of OS threads run processes: the primary pool executes
//! non-blocking work, the blocking pool runs processes that declared
//! themselves blocking. Each worker owns a work-stealing deque; idle
//! workers steal from random siblings, then fall back to the pool's global
//! injector, then park.

pub mod pool;
pub mod worker;

pub use pool::PoolState;
pub use worker::{Mode, Worker};

use crate::process::Process;
use std::sync::Arc;

/// The two worker pools of a running VM
#[derive(Clone)]
pub struct Scheduler {
    /// The pool running non-blocking processes
    pub primary: Arc<PoolState>,
    /// The pool running processes that perform blocking calls
    pub blocking: Arc<PoolState>,
}

impl Scheduler {
    /// Create scheduler state for the given pool sizes
    pub fn new(primary_threads: usize, blocking_threads: usize) -> Self {
        Self {
            primary: PoolState::new("sona-primary", primary_threads.max(1)),
            blocking: PoolState::new("sona-blocking", blocking_threads.max(1)),
        }
    }

    /// Queue a runnable process on the right pool
    ///
    /// Blocking processes go to the blocking pool; pinned processes go to
    /// their worker's external queue so stealing cannot migrate them.
    pub fn schedule(&self, process: Arc<Process>) {
        if process.is_terminated() {
            return;
        }

        let pool = if process.is_blocking() {
            &self.blocking
        } else {
            &self.primary
        };

        match process.pinned_worker() {
            Some(worker) => pool.push_external(worker, process),
            None => pool.push(process),
        }
    }

    /// Whether the scheduler is still running
    pub fn is_alive(&self) -> bool {
        self.primary.is_alive()
    }

    /// Shut both pools down
    pub fn terminate(&self) {
        self.primary.terminate();
        self.blocking.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn scheduler() -> Scheduler {
        Scheduler::new(2, 2)
    }

    #[test]
    fn test_schedule_routes_by_blocking_flag() {
        let scheduler = scheduler();
        let process = Process::new(&Config::for_tests(), false);

        scheduler.schedule(process.clone());

        assert!(scheduler.primary.pop_global().is_some());
        assert!(scheduler.blocking.pop_global().is_none());

        process.set_blocking(true);
        scheduler.schedule(process);

        assert!(scheduler.blocking.pop_global().is_some());
    }

    #[test]
    fn test_schedule_routes_pinned_to_external() {
        let scheduler = scheduler();
        let process = Process::new(&Config::for_tests(), false);

        process.pin();
        process.set_pinned_worker(1);
        scheduler.schedule(process);

        assert!(scheduler.primary.pop_global().is_none());
        assert!(scheduler.primary.pop_external(1).is_some());
    }

    #[test]
    fn test_schedule_skips_terminated() {
        let scheduler = scheduler();
        let process = Process::new(&Config::for_tests(), false);

        process.terminate(crate::value::Value::nil());
        scheduler.schedule(process);

        assert!(scheduler.primary.pop_global().is_none());
    }

    #[test]
    fn test_terminate_stops_both_pools() {
        let scheduler = scheduler();

        scheduler.terminate();

        assert!(!scheduler.primary.is_alive());
        assert!(!scheduler.blocking.is_alive());
        assert!(!scheduler.is_alive());
    }
}
