//! The global process table
//!
//! Maps process identifiers to process handles with O(1) lookup. Entries
//! are inserted at spawn and removed at termination; handles outlive their
//! entry only as values held in live heaps.

use crate::process::{Process, ProcessId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The table of live processes
pub struct ProcessTable {
    processes: RwLock<FxHashMap<ProcessId, Arc<Process>>>,
    spawned: AtomicUsize,
    removed: AtomicUsize,
}

impl ProcessTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(FxHashMap::default()),
            spawned: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        }
    }

    /// Register a process at spawn time
    pub fn insert(&self, process: Arc<Process>) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.processes.write().insert(process.id(), process);
    }

    /// Look up a live process
    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.processes.read().get(&id).cloned()
    }

    /// Remove a terminated process
    pub fn remove(&self, id: ProcessId) -> Option<Arc<Process>> {
        let removed = self.processes.write().remove(&id);

        if removed.is_some() {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }

        removed
    }

    /// The number of live processes
    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    /// Whether no processes are alive
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total processes ever registered
    pub fn spawned_count(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Total processes removed after termination
    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::Relaxed)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
