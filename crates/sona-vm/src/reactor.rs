//! The reactor thread: timers and wakeups
//!
//! A dedicated thread owns a min-heap of timer entries for suspended and
//! timeout-waiting processes. Instead of polling, it sleeps on a condition
//! variable until the next wake time; registering an earlier timer wakes it
//! so it can re-arm.
//!
//! Cancellation is lazy: a process woken by a message before its timer
//! fires bumps its timer generation, and the stale heap entry is discarded
//! when it surfaces.

use crate::process::Process;
use crate::scheduler::Scheduler;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Entry in the timer heap
struct TimerEntry {
    /// When to wake the process
    wake_at: Instant,
    /// The timer generation the wait was registered under
    generation: u64,
    /// The process to wake
    process: Arc<Process>,
}

// Reverse ordering so the BinaryHeap acts as a min-heap.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.wake_at.cmp(&self.wake_at)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

struct ReactorState {
    timers: BinaryHeap<TimerEntry>,
}

/// The reactor thread handle
pub struct Reactor {
    state: Mutex<ReactorState>,
    notify: Condvar,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Create a reactor (not yet started)
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReactorState {
                timers: BinaryHeap::new(),
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the reactor thread; woken processes are handed to `scheduler`
    pub fn start(self: &Arc<Self>, scheduler: Scheduler) -> std::io::Result<()> {
        let reactor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("sona-reactor".to_string())
            .spawn(move || {
                reactor.run_loop(scheduler);
            })?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the reactor thread and wait for it to exit
    pub fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        self.notify.notify_one();

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Register a wakeup for a waiting process
    ///
    /// `generation` must be the value returned by the process's waiting
    /// transition; a wake from any other source invalidates it.
    pub fn register_timer(&self, process: Arc<Process>, generation: u64, wake_at: Instant) {
        let mut state = self.state.lock();

        state.timers.push(TimerEntry {
            wake_at,
            generation,
            process,
        });

        // The new entry may be earlier than the current head; re-arm.
        self.notify.notify_one();
    }

    /// The number of pending timer entries, stale ones included
    pub fn timer_count(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn run_loop(&self, scheduler: Scheduler) {
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let mut state = self.state.lock();

            // Re-check after taking the lock: stop() may have signalled
            // between our first check and acquiring it.
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = Instant::now();

            while let Some(entry) = state.timers.peek() {
                if entry.wake_at > now {
                    break;
                }

                let entry = match state.timers.pop() {
                    Some(entry) => entry,
                    None => break,
                };

                // Stale entries (the process was woken by something else
                // first) fail the generation check and are dropped here.
                if entry.process.try_timer_wake(entry.generation) {
                    scheduler.schedule(entry.process);
                }
            }

            let next_wake = state.timers.peek().map(|entry| entry.wake_at);

            match next_wake {
                Some(wake_at) => {
                    let now = Instant::now();

                    if wake_at > now {
                        let _ = self.notify.wait_for(&mut state, wake_at - now);
                    }
                }
                None => {
                    self.notify.wait(&mut state);
                }
            }
        }

        #[cfg(debug_assertions)]
        eprintln!("reactor shutting down");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::process::ProcessStatus;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(1, 1)
    }

    #[test]
    fn test_timer_wakes_process() {
        let reactor = Reactor::new();
        let scheduler = scheduler();

        reactor.start(scheduler.clone()).unwrap();

        let process = Process::new(&Config::for_tests(), false);
        let generation = process.start_waiting(ProcessStatus::Sleeping);

        reactor.register_timer(
            process.clone(),
            generation,
            Instant::now() + Duration::from_millis(20),
        );

        thread::sleep(Duration::from_millis(100));

        assert_eq!(process.status(), ProcessStatus::Runnable);
        assert!(scheduler.primary.pop_global().is_some());

        reactor.stop();
    }

    #[test]
    fn test_cancelled_timer_is_pruned() {
        let reactor = Reactor::new();
        let scheduler = scheduler();

        reactor.start(scheduler.clone()).unwrap();

        let process = Process::new(&Config::for_tests(), false);
        let generation = process.start_waiting(ProcessStatus::WaitingForTimer);

        reactor.register_timer(
            process.clone(),
            generation,
            Instant::now() + Duration::from_millis(30),
        );

        // A message wake arrives first and invalidates the entry.
        assert!(process.try_wake());
        process.set_status(ProcessStatus::Running);

        thread::sleep(Duration::from_millis(100));

        // The stale entry fired but did not reschedule the process.
        assert_eq!(process.status(), ProcessStatus::Running);
        assert!(scheduler.primary.pop_global().is_none());
        assert_eq!(reactor.timer_count(), 0);

        reactor.stop();
    }

    #[test]
    fn test_timers_fire_in_order() {
        let reactor = Reactor::new();
        let scheduler = scheduler();

        reactor.start(scheduler.clone()).unwrap();

        let first = Process::new(&Config::for_tests(), false);
        let second = Process::new(&Config::for_tests(), false);
        let now = Instant::now();

        let second_generation = second.start_waiting(ProcessStatus::Sleeping);
        let first_generation = first.start_waiting(ProcessStatus::Sleeping);

        reactor.register_timer(
            second.clone(),
            second_generation,
            now + Duration::from_millis(60),
        );
        reactor.register_timer(
            first.clone(),
            first_generation,
            now + Duration::from_millis(20),
        );

        thread::sleep(Duration::from_millis(40));

        assert_eq!(first.status(), ProcessStatus::Runnable);
        assert_eq!(second.status(), ProcessStatus::Sleeping);

        thread::sleep(Duration::from_millis(60));

        assert_eq!(second.status(), ProcessStatus::Runnable);

        reactor.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let reactor = Reactor::new();

        reactor.start(scheduler()).unwrap();
        reactor.stop();
        reactor.stop();
    }
}
