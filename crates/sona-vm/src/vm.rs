//! The top-level virtual machine
//!
//! Owns the lifecycle of one VM run: start the reactor and both worker
//! pools, create the main process from the image's entry module, wait for
//! the shutdown latch, then drain and join everything. The exit code is the
//! main process's result (or the argument of an explicit exit), 1 on an
//! unhandled panic.

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::interpreter::Machine;
use crate::process::Process;
use crate::scheduler::{PoolState, Worker};
use crate::state::VmState;
use crate::{VmError, VmResult};
use crossbeam_deque::Worker as WorkerQueue;
use sona_bytecode::{Image, ImageError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A runnable virtual machine
pub struct Vm {
    state: Arc<VmState>,
}

impl Vm {
    /// Create a VM for an image
    pub fn new(image: Image, config: Config) -> Self {
        Self::with_arguments(image, config, Vec::new())
    }

    /// Create a VM, forwarding program arguments
    pub fn with_arguments(image: Image, config: Config, arguments: Vec<String>) -> Self {
        Self {
            state: VmState::new(image, config, arguments),
        }
    }

    /// The shared state
    pub fn state(&self) -> &Arc<VmState> {
        &self.state
    }

    /// Run the VM to completion, returning the exit code
    pub fn run(&self) -> VmResult<i32> {
        let state = &self.state;

        if state.image.modules.is_empty() {
            return Err(VmError::Image(ImageError::InvalidEntryModule(
                state.image.entry_module,
                0,
            )));
        }

        state
            .reactor
            .start(state.scheduler.clone())
            .map_err(VmError::ThreadSpawn)?;

        let mut handles = Vec::new();

        handles.extend(self.spawn_pool(&state.scheduler.primary)?);
        handles.extend(self.spawn_pool(&state.scheduler.blocking)?);

        // The main process executes the entry module's top-level code.
        let entry = state.image.entry_module;
        let module = &state.image.modules[entry as usize];
        let code = state.code[module.code_index as usize].clone();
        let main = Process::new(&state.config, true);

        main.push_context(ExecutionContext::for_module(code, entry));
        state.process_table.insert(main.clone());
        state.scheduler.schedule(main);

        let exit_code = state.wait_for_shutdown();

        state.scheduler.terminate();
        state.reactor.stop();

        for handle in handles {
            let _ = handle.join();
        }

        Ok(exit_code)
    }

    /// Spawn the worker threads of one pool
    ///
    /// The local deques are created up front so every worker's stealer is
    /// registered before any thread starts looking for work.
    fn spawn_pool(&self, pool: &Arc<PoolState>) -> VmResult<Vec<JoinHandle<()>>> {
        let queues: Vec<WorkerQueue<Arc<Process>>> = (0..pool.worker_count())
            .map(|_| WorkerQueue::new_lifo())
            .collect();

        pool.set_stealers(queues.iter().map(|queue| queue.stealer()).collect());

        let mut handles = Vec::new();

        for (id, queue) in queues.into_iter().enumerate() {
            let machine = Machine::new(self.state.clone());
            let pool = pool.clone();
            let name = format!("{}-{}", pool.name, id);

            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || {
                    Worker::new(id, queue, pool, machine).run();
                })
                .map_err(VmError::ThreadSpawn)?;

            handles.push(handle);
        }

        Ok(handles)
    }
}
