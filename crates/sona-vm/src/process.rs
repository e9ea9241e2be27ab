//! Lightweight processes
//!
//! A process is an isolated actor: a private generational heap, a mailbox,
//! a stack of execution contexts and a scheduling state machine. The
//! mailbox and scheduling state are shared across threads; everything else
//! is touched only by the worker currently running the process.

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::heap::{gc, LocalHeap};
use crate::mailbox::Mailbox;
use crate::message::Envelope;
use crate::object::ObjectKind;
use crate::value::Value;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::cell::UnsafeCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a process
///
/// Identifiers are allocated monotonically and never reused within one VM
/// run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of the identifier
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

/// The scheduling state of a process
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// In a scheduler queue, ready to run
    Runnable,
    /// Executing on a worker
    Running,
    /// Blocked on an empty mailbox
    WaitingForMessage,
    /// Blocked on an empty mailbox with a timeout registered
    WaitingForTimer,
    /// Blocked on an I/O completion
    WaitingForIo,
    /// Suspended for a fixed duration
    Sleeping,
    /// Finished; removed from the process table
    Terminated,
}

struct SchedulingState {
    status: ProcessStatus,
    /// Bumped on every wake so stale timer entries are pruned lazily
    timer_generation: u64,
    /// Set when the most recent wake came from the timer
    timed_out: bool,
}

/// The single-threaded part of a process: heap, frames and interpreter
/// bookkeeping. Only the worker running the process touches this.
pub struct ProcessInner {
    /// The private heap
    pub heap: LocalHeap,
    /// The call stack
    pub frames: Vec<ExecutionContext>,
    /// Reductions left in the current quantum
    pub reductions: u16,
    /// The value travelling up the catch tables during unwinding
    pub thrown: Option<Value>,
    /// The value the outermost frame returned
    pub result: Value,
}

/// An isolated actor with its own heap and mailbox
pub struct Process {
    id: ProcessId,
    main: bool,
    mailbox: Mailbox,
    scheduling: Mutex<SchedulingState>,
    /// Whether the process runs on the blocking pool
    blocking: AtomicBool,
    /// Matched pin depth; only the outermost unpin actually unpins
    pinned: AtomicUsize,
    /// Worker the process is pinned to; usize::MAX when unpinned
    pinned_worker: AtomicUsize,
    inner: UnsafeCell<ProcessInner>,
}

// The mailbox and scheduling state are lock-protected. ProcessInner is only
// accessed by the worker that owns the process while it is Running, which
// the scheduler guarantees by keeping a process in at most one queue.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    /// Create a process with an empty call stack
    pub fn new(config: &Config, main: bool) -> Arc<Self> {
        Arc::new(Self {
            id: ProcessId::new(),
            main,
            mailbox: Mailbox::new(),
            scheduling: Mutex::new(SchedulingState {
                status: ProcessStatus::Runnable,
                timer_generation: 0,
                timed_out: false,
            }),
            blocking: AtomicBool::new(false),
            pinned: AtomicUsize::new(0),
            pinned_worker: AtomicUsize::new(usize::MAX),
            inner: UnsafeCell::new(ProcessInner {
                heap: LocalHeap::new(config.young_threshold, config.mature_threshold),
                frames: Vec::new(),
                reductions: config.reductions,
                thrown: None,
                result: Value::nil(),
            }),
        })
    }

    /// The process identifier
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Whether this is the main process
    pub fn is_main(&self) -> bool {
        self.main
    }

    /// The process mailbox
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Access the single-threaded state
    ///
    /// # Safety
    ///
    /// Only the worker currently running the process may call this, and it
    /// must not hold two returned references at once.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn inner(&self) -> &mut ProcessInner {
        &mut *self.inner.get()
    }

    // ===== Scheduling state =====

    /// The current scheduling status
    pub fn status(&self) -> ProcessStatus {
        self.scheduling.lock().status
    }

    /// Set the scheduling status
    pub fn set_status(&self, status: ProcessStatus) {
        self.scheduling.lock().status = status;
    }

    /// Whether the process has terminated
    pub fn is_terminated(&self) -> bool {
        self.status() == ProcessStatus::Terminated
    }

    /// Transition into a waiting state before the final mailbox check,
    /// returning the timer generation to register a wakeup under.
    ///
    /// The caller re-checks the mailbox after this; a sender that enqueued
    /// in between observes the waiting state and wakes us.
    pub fn start_waiting(&self, status: ProcessStatus) -> u64 {
        let mut state = self.scheduling.lock();

        state.status = status;
        state.timed_out = false;
        state.timer_generation
    }

    /// Abort a waiting transition (the mailbox turned out to be non-empty)
    pub fn stop_waiting(&self) {
        let mut state = self.scheduling.lock();

        if state.status != ProcessStatus::Terminated {
            state.status = ProcessStatus::Running;
        }

        state.timer_generation += 1;
    }

    /// Wake a process blocked in any waiting state
    ///
    /// Returns true when the caller is responsible for rescheduling; at most
    /// one waker wins.
    pub fn try_wake(&self) -> bool {
        let mut state = self.scheduling.lock();

        match state.status {
            ProcessStatus::WaitingForMessage
            | ProcessStatus::WaitingForTimer
            | ProcessStatus::WaitingForIo
            | ProcessStatus::Sleeping => {
                state.status = ProcessStatus::Runnable;
                state.timer_generation += 1;
                state.timed_out = false;
                true
            }
            _ => false,
        }
    }

    /// Wake a process whose timer fired
    ///
    /// Stale entries (the process was woken by something else and the
    /// generation moved on) report false and are pruned by the caller.
    pub fn try_timer_wake(&self, generation: u64) -> bool {
        let mut state = self.scheduling.lock();

        if state.timer_generation != generation {
            return false;
        }

        match state.status {
            // Only a timed-out receive observes the flag; a finished sleep
            // resumes past the suspend instruction and must not leave it
            // behind.
            ProcessStatus::WaitingForTimer => {
                state.status = ProcessStatus::Runnable;
                state.timer_generation += 1;
                state.timed_out = true;
                true
            }
            ProcessStatus::Sleeping => {
                state.status = ProcessStatus::Runnable;
                state.timer_generation += 1;
                state.timed_out = false;
                true
            }
            _ => false,
        }
    }

    /// Consume the timed-out flag set by a timer wake
    pub fn take_timed_out(&self) -> bool {
        let mut state = self.scheduling.lock();

        std::mem::take(&mut state.timed_out)
    }

    // ===== Pool affinity =====

    /// Whether the process runs on the blocking pool
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// Set the blocking flag, returning the previous value
    pub fn set_blocking(&self, blocking: bool) -> bool {
        self.blocking.swap(blocking, Ordering::AcqRel)
    }

    /// Whether the process is pinned to its worker
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire) > 0
    }

    /// Pin the process, returning whether it was already pinned
    pub fn pin(&self) -> bool {
        self.pinned.fetch_add(1, Ordering::AcqRel) > 0
    }

    /// Unpin one level; only the outermost call actually unpins.
    /// Returns whether the process is still pinned.
    pub fn unpin(&self) -> bool {
        let previous = self.pinned.load(Ordering::Acquire);

        if previous == 0 {
            return false;
        }

        let still_pinned = self.pinned.fetch_sub(1, Ordering::AcqRel) > 1;

        if !still_pinned {
            self.pinned_worker.store(usize::MAX, Ordering::Release);
        }

        still_pinned
    }

    /// Record the worker the process is pinned to
    pub fn set_pinned_worker(&self, worker: usize) {
        self.pinned_worker.store(worker, Ordering::Release);
    }

    /// The worker the process is pinned to, if any
    pub fn pinned_worker(&self) -> Option<usize> {
        match self.pinned_worker.load(Ordering::Acquire) {
            usize::MAX => None,
            worker => Some(worker),
        }
    }

    // ===== Messaging =====

    /// Enqueue an envelope; callable from any thread
    pub fn send_message(&self, message: Envelope) {
        self.mailbox.send(message);
    }

    // ===== Execution stack =====

    /// Push a call frame
    pub fn push_context(&self, context: ExecutionContext) {
        unsafe {
            self.inner().frames.push(context);
        }
    }

    /// Pop the current call frame
    pub fn pop_context(&self) -> Option<ExecutionContext> {
        unsafe { self.inner().frames.pop() }
    }

    /// The current call frame
    ///
    /// # Panics
    ///
    /// Panics when the stack is empty; the interpreter only calls this while
    /// a frame is active.
    #[allow(clippy::mut_from_ref)]
    pub fn context_mut(&self) -> &mut ExecutionContext {
        unsafe {
            self.inner()
                .frames
                .last_mut()
                .expect("a running process always has a current context")
        }
    }

    /// The call stack depth
    pub fn frame_count(&self) -> usize {
        unsafe { self.inner().frames.len() }
    }

    /// Drop every frame without running deferred blocks, used by explicit
    /// termination and panics.
    pub fn drop_all_frames(&self) {
        unsafe {
            self.inner().frames.clear();
        }
    }

    /// Format the current stack as `name (file:line)` lines, innermost
    /// first, for panic traces.
    pub fn stack_trace(&self) -> Vec<String> {
        unsafe {
            self.inner()
                .frames
                .iter()
                .rev()
                .map(|frame| {
                    format!("{} ({}:{})", frame.code.name, frame.code.file, frame.line)
                })
                .collect()
        }
    }

    // ===== Allocation & collection =====

    /// Allocate an object in this process's heap
    pub fn allocate(&self, prototype: Value, kind: ObjectKind) -> Value {
        unsafe { self.inner().heap.allocate(prototype, kind) }
    }

    /// Make room for `upcoming` allocations, collecting the young
    /// generation (and, past its threshold, the mature generation) first
    /// when needed.
    ///
    /// The interpreter calls this before reading the registers of an
    /// allocating instruction so no raw value can go stale mid-handler.
    pub fn ensure_allocation_capacity(&self, upcoming: usize) {
        let inner = unsafe { self.inner() };

        if !inner.heap.needs_young_collection(upcoming) {
            return;
        }

        let ProcessInner {
            heap,
            frames,
            thrown,
            result,
            ..
        } = inner;

        gc::collect_young(heap, |visit| {
            Self::each_root(frames, thrown, result, visit);
        });

        if heap.needs_mature_collection() {
            gc::collect_mature(heap, |visit| {
                Self::each_root(frames, thrown, result, visit);
            });
        }

        // Finalizable payloads carry thread-affine state (binding chains),
        // so their destructors run here on the owning worker rather than on
        // a shared pool.
        drop(heap.take_finalizable());
    }

    /// Visit every root slot of the process: frame registers, deferred
    /// blocks, generator back-references, binding chains, the pending
    /// thrown value and the result slot.
    fn each_root(
        frames: &mut [ExecutionContext],
        thrown: &mut Option<Value>,
        result: &mut Value,
        visit: gc::RootVisitor<'_>,
    ) {
        let mut visited = FxHashSet::default();

        for frame in frames.iter_mut() {
            for register in frame.registers.iter_mut() {
                visit(register);
            }

            for deferred in frame.deferred.iter_mut() {
                visit(deferred);
            }

            if let Some(generator) = frame.generator.as_mut() {
                visit(generator);
            }

            let mut binding = Some(frame.binding.clone());

            while let Some(current) = binding {
                if !visited.insert(Rc::as_ptr(&current) as usize) {
                    break;
                }

                current.update_locals(|value| visit(value));
                binding = current.parent().cloned();
            }
        }

        if let Some(value) = thrown.as_mut() {
            visit(value);
        }

        visit(result);
    }

    // ===== Termination =====

    /// Terminate the process: drop all frames (skipping deferred blocks)
    /// and mark it Terminated.
    pub fn terminate(&self, result: Value) {
        self.drop_all_frames();

        unsafe {
            self.inner().result = result;
        }

        self.set_status(ProcessStatus::Terminated);
    }

    /// The value the process terminated with
    pub fn result(&self) -> Value {
        unsafe { self.inner().result }
    }
}
