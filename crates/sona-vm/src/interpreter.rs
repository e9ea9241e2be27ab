//! The bytecode interpreter
//!
//! A machine executes one process at a time on behalf of a worker: a
//! dispatch loop over the current context's instruction stream. Control
//! leaves the loop when the process terminates, exhausts its reduction
//! budget, suspends (receive, suspend, blocking migration), or panics.
//!
//! Exceptions use table-driven unwinding: a throw walks the frame stack
//! consulting each code object's catch table. Frames popped on the way run
//! their deferred blocks; panics and explicit termination skip them.

use crate::context::ExecutionContext;
use crate::message::Envelope;
use crate::object::{Block, Generation, ObjectKind};
use crate::platform;
use crate::process::{Process, ProcessStatus};
use crate::scheduler::Worker;
use crate::state::VmState;
use crate::value::Value;
use sona_bytecode::Opcode;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why the dispatch loop returned
enum Outcome {
    /// The process terminated
    Terminated,
    /// The reduction budget ran out; re-queue on the same pool
    Yielded,
    /// The process parked itself (mailbox, timer); a waker re-queues it
    Suspended,
    /// The blocking flag changed; re-queue on the other pool
    Migrated,
}

/// What a return from the current frame led to
enum ReturnAction {
    /// A deferred block was pushed; the return re-runs afterwards
    Deferred,
    /// Control moved to the calling frame
    Continue,
    /// The outermost frame returned
    Terminated(Value),
}

/// What the unwinding walk led to
enum Unwind {
    /// A catch entry handled the throw; execution continues in that frame
    Landed,
    /// A deferred block of an unwinding frame was pushed
    RunDeferred,
}

/// Executes processes against the shared VM state
#[derive(Clone)]
pub struct Machine {
    /// The shared state
    pub state: Arc<VmState>,
}

impl Machine {
    /// Create a machine
    pub fn new(state: Arc<VmState>) -> Self {
        Self { state }
    }

    /// Run a process until it terminates, yields, suspends or panics, and
    /// route it onward accordingly.
    pub fn run(&self, worker: &mut Worker, process: &Arc<Process>) {
        match self.execute(worker, process) {
            Ok(Outcome::Terminated) => {
                if process.pinned_worker() == Some(worker.id()) {
                    worker.leave_exclusive_mode();
                }
            }
            Ok(Outcome::Yielded) => {
                process.set_status(ProcessStatus::Runnable);

                if process.pinned_worker() == Some(worker.id()) {
                    worker.push_local(process.clone());
                } else {
                    self.state.scheduler.schedule(process.clone());
                }
            }
            Ok(Outcome::Suspended) => {
                // The process parked itself; a sender, the reactor or a
                // timer re-queues it.
            }
            Ok(Outcome::Migrated) => {
                process.set_status(ProcessStatus::Runnable);
                self.state.scheduler.schedule(process.clone());
            }
            Err(message) => {
                // Unhandled panic: print the trace and take the whole VM
                // down with a non-zero exit. Deferred blocks do not run.
                eprintln!("{}", message);
                process.terminate(Value::nil());
                self.state.process_table.remove(process.id());

                if process.is_pinned() {
                    worker.leave_exclusive_mode();
                }

                self.state.terminate_vm(1);
            }
        }
    }

    /// The dispatch loop
    #[allow(clippy::too_many_lines)]
    fn execute(&self, worker: &mut Worker, process: &Arc<Process>) -> Result<Outcome, String> {
        let state = &self.state;
        let inner = unsafe { process.inner() };

        inner.reductions = state.config.reductions;

        'context: loop {
            if inner.thrown.is_some() {
                match self.unwind(process)? {
                    Unwind::Landed => {}
                    Unwind::RunDeferred => continue 'context,
                }
            }

            if inner.frames.is_empty() {
                return Ok(self.finish(process, Value::nil()));
            }

            let code = process.context_mut().code.clone();

            'dispatch: loop {
                let ctx = process.context_mut();

                if ctx.ip >= code.instructions.len() {
                    match self.do_return(process, Value::nil(), false)? {
                        ReturnAction::Deferred | ReturnAction::Continue => continue 'context,
                        ReturnAction::Terminated(value) => {
                            return Ok(self.finish(process, value));
                        }
                    }
                }

                let index = ctx.ip;
                let instruction = &code.instructions[index];

                ctx.ip = index + 1;
                ctx.line = instruction.line;

                match instruction.opcode {
                    // ===== Literals & register moves =====
                    Opcode::LoadLiteral => {
                        let literal = instruction.operand(1) as usize;
                        let value = match state.literals.get(literal) {
                            Some(&value) => value,
                            None => {
                                return Err(self.panic_message(
                                    process,
                                    &format!("literal index {} is out of bounds", literal),
                                ));
                            }
                        };

                        ctx.set_register(instruction.operand(0), value);
                    }
                    Opcode::LoadNil => {
                        ctx.set_register(instruction.operand(0), Value::nil());
                    }
                    Opcode::LoadTrue => {
                        ctx.set_register(instruction.operand(0), Value::boolean(true));
                    }
                    Opcode::LoadFalse => {
                        ctx.set_register(instruction.operand(0), Value::boolean(false));
                    }
                    Opcode::LoadUndefined => {
                        ctx.set_register(instruction.operand(0), Value::undefined());
                    }
                    Opcode::MoveRegister => {
                        let value = ctx.get_register(instruction.operand(1));

                        ctx.set_register(instruction.operand(0), value);
                    }

                    // ===== Locals & binding chain =====
                    Opcode::SetLocal => {
                        let value = ctx.get_register(instruction.operand(1));

                        ctx.binding
                            .set_local(instruction.operand(0) as usize, value);
                    }
                    Opcode::GetLocal => {
                        let value = ctx.binding.get_local(instruction.operand(1) as usize);

                        ctx.set_register(instruction.operand(0), value);
                    }
                    Opcode::SetParentLocal => {
                        let depth = instruction.operand(0) as usize;
                        let local = instruction.operand(1) as usize;
                        let value = ctx.get_register(instruction.operand(2));

                        match ctx.binding.find_parent(depth) {
                            Some(parent) => parent.set_local(local, value),
                            None => {
                                return Err(self.panic_message(
                                    process,
                                    &format!("no parent binding at depth {}", depth),
                                ));
                            }
                        }
                    }
                    Opcode::GetParentLocal => {
                        let depth = instruction.operand(1) as usize;
                        let local = instruction.operand(2) as usize;

                        let value = match ctx.binding.find_parent(depth) {
                            Some(parent) => parent.get_local(local),
                            None => {
                                return Err(self.panic_message(
                                    process,
                                    &format!("no parent binding at depth {}", depth),
                                ));
                            }
                        };

                        ctx.set_register(instruction.operand(0), value);
                    }
                    Opcode::LocalExists => {
                        let exists = ctx.binding.local_exists(instruction.operand(1) as usize);

                        ctx.set_register(instruction.operand(0), Value::boolean(exists));
                    }

                    // ===== Globals, attributes & equality =====
                    Opcode::SetGlobal => {
                        let value = ctx.get_register(instruction.operand(1));

                        if !self.shareable(value) {
                            return Err(self.panic_message(
                                process,
                                "only permanent values may be stored in globals",
                            ));
                        }

                        state.set_global(ctx.module, instruction.operand(0), value);
                    }
                    Opcode::GetGlobal => {
                        let value = state.get_global(ctx.module, instruction.operand(1));

                        ctx.set_register(instruction.operand(0), value);
                    }
                    Opcode::SetAttribute => {
                        let receiver = ctx.get_register(instruction.operand(0));
                        let name = ctx.get_register(instruction.operand(1));
                        let value = ctx.get_register(instruction.operand(2));
                        let symbol = self.attribute_name(process, name)?;

                        let Some(receiver_ptr) = receiver.as_object_ptr() else {
                            return Err(self.panic_message(
                                process,
                                "attributes cannot be set on immediates",
                            ));
                        };

                        let receiver_ref = unsafe { &mut *receiver_ptr.as_ptr() };

                        if receiver_ref.header.generation() == Generation::Permanent
                            && !self.shareable(value)
                        {
                            return Err(self.panic_message(
                                process,
                                "permanent objects may only hold permanent values",
                            ));
                        }

                        receiver_ref.set_attribute(symbol, value);

                        unsafe {
                            process.inner().heap.write_barrier(receiver, value);
                        }
                    }
                    Opcode::GetAttribute => {
                        let receiver = ctx.get_register(instruction.operand(1));
                        let name = ctx.get_register(instruction.operand(2));
                        let symbol = self.attribute_name(process, name)?;

                        let mut current = receiver;
                        let mut found = None;

                        // Walk the prototype chain from the receiver to the
                        // root.
                        for _ in 0..64 {
                            if let Some(ptr) = current.as_object_ptr() {
                                let object = unsafe { &*ptr.as_ptr() };

                                if let Some(value) = object.get_attribute(symbol) {
                                    found = Some(value);
                                    break;
                                }
                            }

                            let prototype = state.prototype_of(current);

                            if prototype.raw() == current.raw() || prototype.is_nil() {
                                break;
                            }

                            current = prototype;
                        }

                        match found {
                            Some(value) => ctx.set_register(instruction.operand(0), value),
                            None => {
                                let name = self.state.symbols.name(symbol);

                                return Err(self.panic_message(
                                    process,
                                    &format!("undefined attribute {:?}", name),
                                ));
                            }
                        }
                    }
                    Opcode::GetPrototype => {
                        let value = ctx.get_register(instruction.operand(1));

                        ctx.set_register(instruction.operand(0), state.prototype_of(value));
                    }
                    Opcode::ObjectEquals => {
                        let left = ctx.get_register(instruction.operand(1));
                        let right = ctx.get_register(instruction.operand(2));

                        ctx.set_register(
                            instruction.operand(0),
                            Value::boolean(left.raw() == right.raw()),
                        );
                    }
                    Opcode::Equals => {
                        let left = ctx.get_register(instruction.operand(1));
                        let right = ctx.get_register(instruction.operand(2));
                        let equal = if left.raw() == right.raw() {
                            true
                        } else if left.is_object() && right.is_object() {
                            let left_ref = unsafe { left.object_ref() };
                            let right_ref = unsafe { right.object_ref() };

                            left_ref.structurally_equals(right_ref)
                        } else {
                            false
                        };

                        ctx.set_register(instruction.operand(0), Value::boolean(equal));
                    }

                    // ===== Allocation & arrays =====
                    Opcode::Allocate => {
                        process.ensure_allocation_capacity(1);

                        let ctx = process.context_mut();
                        let prototype = ctx.get_register(instruction.operand(1));
                        let value = process.allocate(prototype, ObjectKind::None);

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), value);
                    }
                    Opcode::AllocatePermanent => {
                        let prototype = ctx.get_register(instruction.operand(1));

                        if !self.shareable(prototype) {
                            return Err(self.panic_message(
                                process,
                                "permanent objects require a permanent prototype",
                            ));
                        }

                        let value = state.permanent.allocate(prototype, ObjectKind::None);

                        ctx.set_register(instruction.operand(0), value);
                    }
                    Opcode::AllocateArray => {
                        process.ensure_allocation_capacity(1);

                        let value = process
                            .allocate(state.prototypes.array, ObjectKind::Array(Vec::new()));

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), value);
                    }
                    Opcode::ArraySet => {
                        let array = ctx.get_register(instruction.operand(0));
                        let index = self.index_operand(process, ctx, instruction.operand(1))?;
                        let value = ctx.get_register(instruction.operand(2));

                        let Some(elements) =
                            array.as_object_ptr().and_then(|ptr| unsafe {
                                (*ptr.as_ptr()).array_mut()
                            })
                        else {
                            return Err(
                                self.panic_message(process, "ArraySet requires an array")
                            );
                        };

                        if index >= elements.len() {
                            elements.resize(index + 1, Value::nil());
                        }

                        elements[index] = value;

                        unsafe {
                            process.inner().heap.write_barrier(array, value);
                        }
                    }
                    Opcode::ArrayGet => {
                        let array = ctx.get_register(instruction.operand(1));
                        let index = self.index_operand(process, ctx, instruction.operand(2))?;

                        let Some(elements) = array
                            .as_object_ptr()
                            .map(|ptr| unsafe { (*ptr.as_ptr()).array() })
                            .flatten()
                        else {
                            return Err(
                                self.panic_message(process, "ArrayGet requires an array")
                            );
                        };

                        let value = elements.get(index).copied().unwrap_or_else(Value::nil);

                        ctx.set_register(instruction.operand(0), value);
                    }
                    Opcode::ArrayLength => {
                        let array = ctx.get_register(instruction.operand(1));

                        let Some(elements) = array
                            .as_object_ptr()
                            .map(|ptr| unsafe { (*ptr.as_ptr()).array() })
                            .flatten()
                        else {
                            return Err(
                                self.panic_message(process, "ArrayLength requires an array")
                            );
                        };

                        let length = elements.len() as i64;

                        ctx.set_register(
                            instruction.operand(0),
                            Value::integer(length).unwrap_or_else(Value::nil),
                        );
                    }
                    Opcode::ArrayPush => {
                        let array = ctx.get_register(instruction.operand(0));
                        let value = ctx.get_register(instruction.operand(1));

                        let Some(elements) =
                            array.as_object_ptr().and_then(|ptr| unsafe {
                                (*ptr.as_ptr()).array_mut()
                            })
                        else {
                            return Err(
                                self.panic_message(process, "ArrayPush requires an array")
                            );
                        };

                        elements.push(value);

                        unsafe {
                            process.inner().heap.write_barrier(array, value);
                        }
                    }

                    // ===== Arithmetic & comparison =====
                    Opcode::IntAdd => self.int_binary(process, instruction, |a, b| Some(a + b))?,
                    Opcode::IntSub => self.int_binary(process, instruction, |a, b| Some(a - b))?,
                    Opcode::IntMul => self.int_binary(process, instruction, |a, b| Some(a * b))?,
                    Opcode::IntDiv => {
                        self.int_binary(process, instruction, |a, b| a.checked_div(b))?
                    }
                    Opcode::IntMod => {
                        self.int_binary(process, instruction, |a, b| a.checked_rem(b))?
                    }
                    Opcode::IntLess => self.int_compare(process, instruction, |a, b| a < b)?,
                    Opcode::IntGreater => self.int_compare(process, instruction, |a, b| a > b)?,
                    Opcode::FloatAdd => self.float_binary(process, instruction, |a, b| a + b)?,
                    Opcode::FloatMul => self.float_binary(process, instruction, |a, b| a * b)?,

                    // ===== Control flow =====
                    Opcode::Goto => {
                        let target = instruction.operand(0) as usize;

                        if target <= index {
                            // Loop back-edge: charge a reduction and yield
                            // once the budget is gone.
                            if inner.reductions == 0 {
                                ctx.ip = target;
                                return Ok(Outcome::Yielded);
                            }

                            inner.reductions -= 1;
                        }

                        ctx.ip = target;
                    }
                    Opcode::GotoIfTrue => {
                        if ctx.get_register(instruction.operand(1)).is_true() {
                            ctx.ip = instruction.operand(0) as usize;
                        }
                    }
                    Opcode::GotoIfFalse => {
                        if ctx.get_register(instruction.operand(1)).is_false() {
                            ctx.ip = instruction.operand(0) as usize;
                        }
                    }
                    Opcode::Return => {
                        let value = ctx.get_register(instruction.operand(0));

                        match self.do_return(process, value, true)? {
                            ReturnAction::Deferred | ReturnAction::Continue => continue 'context,
                            ReturnAction::Terminated(value) => {
                                return Ok(self.finish(process, value));
                            }
                        }
                    }
                    Opcode::Throw => {
                        inner.thrown = Some(ctx.get_register(instruction.operand(0)));
                        continue 'context;
                    }
                    Opcode::DeferBlock => {
                        let value = ctx.get_register(instruction.operand(0));

                        if self.block_of(value).is_none() {
                            return Err(
                                self.panic_message(process, "DeferBlock requires a block")
                            );
                        }

                        ctx.deferred.push(value);
                    }
                    Opcode::Panic => {
                        let reason = describe_value(ctx.get_register(instruction.operand(0)));

                        return Err(self.panic_message(process, &reason));
                    }
                    Opcode::Exit => {
                        let code = ctx
                            .get_register(instruction.operand(0))
                            .as_integer()
                            .unwrap_or(0) as i32;

                        state.terminate_vm(code);

                        return Ok(self.finish(process, Value::nil()));
                    }

                    // ===== Blocks & invocation =====
                    Opcode::SetBlock => {
                        process.ensure_allocation_capacity(1);

                        let ctx = process.context_mut();
                        let code_index = instruction.operand(1) as usize;

                        let Some(nested) = code.code_objects.get(code_index) else {
                            return Err(self.panic_message(
                                process,
                                &format!("code object index {} is out of bounds", code_index),
                            ));
                        };

                        let block = Block::new(
                            Arc::new(nested.clone()),
                            ctx.binding.clone(),
                            Value::nil(),
                            ctx.module,
                        );
                        let value =
                            process.allocate(state.prototypes.block, ObjectKind::Block(block));

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), value);
                    }
                    Opcode::RunBlock => {
                        if inner.reductions == 0 {
                            ctx.ip = index;
                            return Ok(Outcome::Yielded);
                        }

                        inner.reductions -= 1;
                        self.enter_block(process, instruction, false)?;
                        continue 'context;
                    }
                    Opcode::RunBlockWithReceiver => {
                        if inner.reductions == 0 {
                            ctx.ip = index;
                            return Ok(Outcome::Yielded);
                        }

                        inner.reductions -= 1;
                        self.enter_block(process, instruction, true)?;
                        continue 'context;
                    }
                    Opcode::TailCall => {
                        if inner.reductions == 0 {
                            ctx.ip = index;
                            return Ok(Outcome::Yielded);
                        }

                        inner.reductions -= 1;

                        // Reserve before popping: values visible only from
                        // the replaced frame must survive a collection.
                        process.ensure_allocation_capacity(1);

                        // The current frame is replaced: the new context
                        // inherits its return register and deferred stack.
                        let frame = match process.pop_context() {
                            Some(frame) => frame,
                            None => return Err(self.panic_message(process, "no active frame")),
                        };

                        self.enter_tail_call(process, instruction, frame)?;
                        continue 'context;
                    }
                    Opcode::NativeCall => {
                        if inner.reductions == 0 {
                            ctx.ip = index;
                            return Ok(Outcome::Yielded);
                        }

                        inner.reductions -= 1;
                        process.ensure_allocation_capacity(1);

                        let ctx = process.context_mut();
                        let name_value = match state.literals.get(instruction.operand(1) as usize)
                        {
                            Some(&value) => value,
                            None => {
                                return Err(self.panic_message(
                                    process,
                                    "native function name literal is out of bounds",
                                ));
                            }
                        };
                        let name = match name_value.as_object_ptr() {
                            Some(ptr) => unsafe { (*ptr.as_ptr()).string().unwrap_or("") },
                            None => "",
                        }
                        .to_string();

                        let arguments: Vec<Value> = instruction.operands[2..]
                            .iter()
                            .map(|&register| ctx.get_register(register))
                            .collect();

                        let result = self.run_native(process, &name, &arguments)?;

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), result);
                    }

                    // ===== Processes & messaging =====
                    Opcode::ProcessSpawn => {
                        process.ensure_allocation_capacity(1);

                        let ctx = process.context_mut();
                        let block_value = ctx.get_register(instruction.operand(1));

                        if self.block_of(block_value).is_none() {
                            return Err(
                                self.panic_message(process, "ProcessSpawn requires a block")
                            );
                        }

                        let child = self.spawn(process, block_value)?;
                        let handle = process
                            .allocate(state.prototypes.process, ObjectKind::Process(child));

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), handle);
                    }
                    Opcode::ProcessSend => {
                        let target = ctx.get_register(instruction.operand(0));
                        let message = ctx.get_register(instruction.operand(1));

                        let Some(id) = target
                            .as_object_ptr()
                            .map(|ptr| unsafe { (*ptr.as_ptr()).process() })
                            .flatten()
                        else {
                            return Err(self.panic_message(
                                process,
                                "ProcessSend requires a process handle",
                            ));
                        };

                        let envelope = match Envelope::copy(message) {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                return Err(self.panic_message(process, &error.to_string()));
                            }
                        };

                        // Sends to terminated processes are dropped.
                        if let Some(receiver) = state.process_table.get(id) {
                            receiver.send_message(envelope);

                            if receiver.try_wake() {
                                state.scheduler.schedule(receiver);
                            }
                        }
                    }
                    Opcode::ProcessReceive => {
                        if let Some(envelope) = process.mailbox().receive() {
                            // A timer may have fired between the wake and
                            // this dequeue; the flag is stale now.
                            process.take_timed_out();
                            process.ensure_allocation_capacity(envelope.object_count() + 1);

                            let value = unsafe {
                                envelope.materialize(&mut process.inner().heap)
                            };

                            process
                                .context_mut()
                                .set_register(instruction.operand(0), value);
                            continue 'dispatch;
                        }

                        if process.take_timed_out() {
                            // The timeout elapsed with the mailbox still
                            // empty: raise the timeout value.
                            inner.thrown = Some(state.timeout_error);
                            continue 'context;
                        }

                        let timeout = ctx.get_register(instruction.operand(1));
                        let status = if timeout.is_nil() {
                            ProcessStatus::WaitingForMessage
                        } else if timeout.as_integer().is_some() {
                            ProcessStatus::WaitingForTimer
                        } else {
                            return Err(self.panic_message(
                                process,
                                "receive timeout must be Nil or an integer",
                            ));
                        };

                        // Rewind first: the moment the process is visible
                        // as waiting, a waker may hand it to another
                        // worker, and nothing here may touch the frame
                        // after that.
                        ctx.ip = index;

                        let generation = process.start_waiting(status);

                        // A sender may have enqueued between the empty check
                        // and the transition; retry instead of sleeping.
                        if !process.mailbox().is_empty() {
                            process.stop_waiting();
                            continue 'dispatch;
                        }

                        if let Some(ms) = timeout.as_integer() {
                            state.reactor.register_timer(
                                process.clone(),
                                generation,
                                Instant::now() + Duration::from_millis(ms.max(0) as u64),
                            );
                        }

                        return Ok(Outcome::Suspended);
                    }
                    Opcode::ProcessSuspend => {
                        let duration = ctx.get_register(instruction.operand(0));

                        if duration.is_nil() {
                            return Ok(Outcome::Yielded);
                        }

                        let Some(ms) = duration.as_integer() else {
                            return Err(self.panic_message(
                                process,
                                "suspend duration must be Nil or an integer",
                            ));
                        };

                        if ms <= 0 {
                            return Ok(Outcome::Yielded);
                        }

                        let generation = process.start_waiting(ProcessStatus::Sleeping);

                        state.reactor.register_timer(
                            process.clone(),
                            generation,
                            Instant::now() + Duration::from_millis(ms as u64),
                        );

                        return Ok(Outcome::Suspended);
                    }
                    Opcode::ProcessTerminate => {
                        // Deferred blocks deliberately do not run.
                        return Ok(self.finish(process, Value::nil()));
                    }
                    Opcode::ProcessCurrent => {
                        process.ensure_allocation_capacity(1);

                        let handle = process.allocate(
                            state.prototypes.process,
                            ObjectKind::Process(process.id()),
                        );

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), handle);
                    }
                    Opcode::ProcessSetBlocking => {
                        let flag = ctx.get_register(instruction.operand(1)).is_true();
                        let previous = process.set_blocking(flag);

                        ctx.set_register(instruction.operand(0), Value::boolean(previous));

                        if previous != flag {
                            return Ok(Outcome::Migrated);
                        }
                    }
                    Opcode::ProcessSetPinned => {
                        let flag = ctx.get_register(instruction.operand(1)).is_true();
                        let previous = process.is_pinned();

                        if flag {
                            process.pin();
                            process.set_pinned_worker(worker.id());
                            worker.enter_exclusive_mode();
                        } else if !process.unpin() {
                            worker.leave_exclusive_mode();
                        }

                        ctx.set_register(instruction.operand(0), Value::boolean(previous));
                    }
                    Opcode::ProcessIdentifier => {
                        let target = ctx.get_register(instruction.operand(1));

                        let Some(id) = target
                            .as_object_ptr()
                            .map(|ptr| unsafe { (*ptr.as_ptr()).process() })
                            .flatten()
                        else {
                            return Err(self.panic_message(
                                process,
                                "ProcessIdentifier requires a process handle",
                            ));
                        };

                        ctx.set_register(
                            instruction.operand(0),
                            Value::integer(id.as_u64() as i64).unwrap_or_else(Value::nil),
                        );
                    }

                    // ===== Generators =====
                    Opcode::GeneratorAllocate => {
                        process.ensure_allocation_capacity(1);

                        let ctx = process.context_mut();
                        let block_value = ctx.get_register(instruction.operand(1));

                        let Some(block) = self.block_of(block_value) else {
                            return Err(self.panic_message(
                                process,
                                "GeneratorAllocate requires a block",
                            ));
                        };

                        let binding = crate::binding::Binding::with_parent(
                            block.binding.clone(),
                            block.code.locals,
                        );
                        let generator = crate::generator::Generator::new(
                            block.code.clone(),
                            binding,
                            block.module,
                        );
                        let value = process.allocate(
                            state.prototypes.generator,
                            ObjectKind::Generator(Box::new(generator)),
                        );

                        process
                            .context_mut()
                            .set_register(instruction.operand(0), value);
                    }
                    Opcode::GeneratorResume => {
                        let generator_value = ctx.get_register(instruction.operand(1));

                        let Some(generator) =
                            generator_value.as_object_ptr().and_then(|ptr| unsafe {
                                (*ptr.as_ptr()).generator_mut()
                            })
                        else {
                            return Err(self.panic_message(
                                process,
                                "GeneratorResume requires a generator",
                            ));
                        };

                        match generator.resume() {
                            Some((ip, registers)) => {
                                let binding = match generator.binding() {
                                    Some(binding) => binding.clone(),
                                    None => {
                                        return Err(self.panic_message(
                                            process,
                                            "generator binding is gone",
                                        ));
                                    }
                                };
                                let frame = ExecutionContext::for_generator(
                                    generator_value,
                                    generator.code().clone(),
                                    binding,
                                    generator.module(),
                                    ip,
                                    registers,
                                    Some(instruction.operand(0)),
                                );

                                process.push_context(frame);
                                continue 'context;
                            }
                            None if generator.is_finished() => {
                                ctx.set_register(instruction.operand(0), Value::boolean(false));
                            }
                            None => {
                                return Err(self.panic_message(
                                    process,
                                    "generator resumed while already running",
                                ));
                            }
                        }
                    }
                    Opcode::GeneratorYield => {
                        let value = ctx.get_register(instruction.operand(0));

                        let Some(generator_value) = ctx.generator else {
                            return Err(self.panic_message(
                                process,
                                "yield outside of a generator",
                            ));
                        };

                        let frame = match process.pop_context() {
                            Some(frame) => frame,
                            None => return Err(self.panic_message(process, "no active frame")),
                        };

                        if let Some(generator) =
                            generator_value.as_object_ptr().and_then(|ptr| unsafe {
                                (*ptr.as_ptr()).generator_mut()
                            })
                        {
                            generator.suspend(frame.ip, frame.registers, value);
                        }

                        if let Some(register) = frame.return_register {
                            process
                                .context_mut()
                                .set_register(register, Value::boolean(true));
                        }

                        continue 'context;
                    }
                    Opcode::GeneratorValue => {
                        let generator_value = ctx.get_register(instruction.operand(1));

                        let Some(generator) =
                            generator_value.as_object_ptr().and_then(|ptr| unsafe {
                                (*ptr.as_ptr()).generator()
                            })
                        else {
                            return Err(self.panic_message(
                                process,
                                "GeneratorValue requires a generator",
                            ));
                        };

                        ctx.set_register(instruction.operand(0), generator.value());
                    }

                    // ===== Runtime introspection =====
                    Opcode::Platform => {
                        let value = state.intern_string(platform::operating_system());

                        ctx.set_register(instruction.operand(0), value);
                    }
                }
            }
        }
    }

    // ===== Invocation helpers =====

    /// Push a frame for a block invocation
    fn enter_block(
        &self,
        process: &Arc<Process>,
        instruction: &sona_bytecode::Instruction,
        with_receiver: bool,
    ) -> Result<(), String> {
        // The rest-argument array may allocate.
        process.ensure_allocation_capacity(1);

        let ctx = process.context_mut();
        let result_register = instruction.operand(0);
        let block_value = ctx.get_register(instruction.operand(1));

        let Some(block) = self.block_of(block_value) else {
            return Err(self.panic_message(process, "RunBlock requires a block"));
        };

        let argument_offset = if with_receiver { 3 } else { 2 };
        let arguments: Vec<Value> = instruction.operands[argument_offset..]
            .iter()
            .map(|&register| ctx.get_register(register))
            .collect();
        let receiver = if with_receiver {
            Some(ctx.get_register(instruction.operand(2)))
        } else {
            None
        };

        let context = self.build_block_context(
            process,
            block,
            block_value,
            &arguments,
            receiver,
            Some(result_register),
        )?;

        process.push_context(context);
        Ok(())
    }

    /// Replace the popped frame with a block invocation (tail call)
    fn enter_tail_call(
        &self,
        process: &Arc<Process>,
        instruction: &sona_bytecode::Instruction,
        replaced: ExecutionContext,
    ) -> Result<(), String> {
        let block_value = replaced.get_register(instruction.operand(0));

        let Some(block) = self.block_of(block_value) else {
            return Err(self.panic_message(process, "TailCall requires a block"));
        };

        let arguments: Vec<Value> = instruction.operands[1..]
            .iter()
            .map(|&register| replaced.get_register(register))
            .collect();

        let mut context = self.build_block_context(
            process,
            block,
            block_value,
            &arguments,
            None,
            replaced.return_register,
        )?;

        // The replaced frame's deferred blocks still run when the new
        // context finally returns.
        context.deferred = replaced.deferred;

        process.push_context(context);
        Ok(())
    }

    /// Build a context for a block invocation, binding arguments and
    /// packing rest arguments into an array.
    fn build_block_context(
        &self,
        process: &Arc<Process>,
        block: &Block,
        _block_value: Value,
        arguments: &[Value],
        receiver: Option<Value>,
        return_register: Option<u16>,
    ) -> Result<ExecutionContext, String> {
        let total = block.code.arguments as usize;
        let required = block.code.required_arguments as usize;
        let given = arguments.len();

        if given < required {
            return Err(self.panic_message(
                process,
                &format!(
                    "{} requires {} arguments, but {} were given",
                    block.code.name, required, given
                ),
            ));
        }

        if given > total && !block.code.rest_argument {
            return Err(self.panic_message(
                process,
                &format!(
                    "{} accepts up to {} arguments, but {} were given",
                    block.code.name, total, given
                ),
            ));
        }

        let context = ExecutionContext::for_block(block, return_register);

        // The receiver, when present, binds as the first local; declared
        // arguments follow.
        let mut local = 0;

        if let Some(receiver) = receiver {
            context.binding.set_local(local, receiver);
            local += 1;
        }

        let direct = given.min(total);

        for &argument in &arguments[..direct] {
            context.binding.set_local(local, argument);
            local += 1;
        }

        if block.code.rest_argument {
            let rest: Vec<Value> = arguments[direct..].to_vec();
            let rest_array = process
                .allocate(self.state.prototypes.array, ObjectKind::Array(rest));

            context.binding.set_local(local, rest_array);
        }

        Ok(context)
    }

    // ===== Return & unwinding =====

    /// Handle a return of `value` from the current frame
    ///
    /// Deferred blocks run first, latest first: the return instruction
    /// re-executes after each one until the frame's deferred stack is
    /// empty.
    fn do_return(
        &self,
        process: &Arc<Process>,
        value: Value,
        explicit: bool,
    ) -> Result<ReturnAction, String> {
        let ctx = process.context_mut();

        if let Some(block_value) = ctx.deferred.pop() {
            if explicit {
                // Re-run the Return instruction once the block finishes.
                ctx.ip -= 1;
            }

            let Some(block) = self.block_of(block_value) else {
                return Err(self.panic_message(process, "deferred value is not a block"));
            };

            let frame = ExecutionContext::for_block(block, None);

            process.push_context(frame);
            return Ok(ReturnAction::Deferred);
        }

        let frame = match process.pop_context() {
            Some(frame) => frame,
            None => return Ok(ReturnAction::Terminated(value)),
        };

        if let Some(generator_value) = frame.generator {
            // The generator body ran to completion.
            if let Some(generator) = generator_value
                .as_object_ptr()
                .and_then(|ptr| unsafe { (*ptr.as_ptr()).generator_mut() })
            {
                generator.finish();
            }

            if let Some(register) = frame.return_register {
                process
                    .context_mut()
                    .set_register(register, Value::boolean(false));
            }

            return Ok(ReturnAction::Continue);
        }

        if process.frame_count() == 0 {
            return Ok(ReturnAction::Terminated(value));
        }

        if let Some(register) = frame.return_register {
            process.context_mut().set_register(register, value);
        }

        Ok(ReturnAction::Continue)
    }

    /// Walk the frame stack looking for a catch entry covering the throw
    ///
    /// Frames without a matching entry run their deferred blocks and pop;
    /// an empty stack turns the throw into a panic.
    fn unwind(&self, process: &Arc<Process>) -> Result<Unwind, String> {
        let inner = unsafe { process.inner() };
        let mut trace: Vec<String> = Vec::new();

        loop {
            if inner.frames.is_empty() {
                let thrown = inner.thrown.take().unwrap_or_else(Value::nil);
                let mut message = format!(
                    "Process {} panicked: uncaught throw of {}",
                    process.id().as_u64(),
                    describe_value(thrown)
                );

                for line in trace {
                    message.push_str("\n    ");
                    message.push_str(&line);
                }

                return Err(message);
            }

            let ctx = process.context_mut();

            if !ctx.unwinding {
                let throw_index = ctx.ip.saturating_sub(1) as u16;

                if let Some(entry) = ctx.code.catch_entry_for(throw_index).copied() {
                    let value = inner.thrown.take().unwrap_or_else(Value::nil);

                    ctx.set_register(entry.register, value);
                    ctx.ip = entry.jump_to as usize;
                    return Ok(Unwind::Landed);
                }

                ctx.unwinding = true;
            }

            if let Some(block_value) = ctx.deferred.pop() {
                let Some(block) = self.block_of(block_value) else {
                    return Err(self.panic_message(process, "deferred value is not a block"));
                };

                let frame = ExecutionContext::for_block(block, None);

                process.push_context(frame);
                return Ok(Unwind::RunDeferred);
            }

            let frame = match process.pop_context() {
                Some(frame) => frame,
                None => continue,
            };

            trace.push(format!(
                "{} ({}:{})",
                frame.code.name, frame.code.file, frame.line
            ));

            if let Some(generator_value) = frame.generator {
                // A throwing generator finishes and propagates the error to
                // its resumer, which is the next frame down.
                if let Some(generator) = generator_value
                    .as_object_ptr()
                    .and_then(|ptr| unsafe { (*ptr.as_ptr()).generator_mut() })
                {
                    generator.finish();
                }
            }
        }
    }

    // ===== Process lifecycle =====

    /// Spawn a child process executing a deep-copied block
    fn spawn(
        &self,
        parent: &Arc<Process>,
        block_value: Value,
    ) -> Result<crate::process::ProcessId, String> {
        let envelope = match Envelope::copy(block_value) {
            Ok(envelope) => envelope,
            Err(error) => return Err(self.panic_message(parent, &error.to_string())),
        };

        let child = Process::new(&self.state.config, false);

        // The child is not running yet, so its heap and stack are safe to
        // touch from here.
        {
            let child_inner = unsafe { child.inner() };
            let root = envelope.materialize(&mut child_inner.heap);

            let Some(block) = root
                .as_object_ptr()
                .and_then(|ptr| unsafe { (*ptr.as_ptr()).block() })
            else {
                return Err(self.panic_message(parent, "spawn requires a block"));
            };

            child_inner
                .frames
                .push(ExecutionContext::for_block(block, None));
        }

        let id = child.id();

        self.state.process_table.insert(child.clone());
        self.state.scheduler.schedule(child);
        Ok(id)
    }

    /// Terminate a process normally and propagate the main process's result
    /// into the VM exit code.
    fn finish(&self, process: &Arc<Process>, value: Value) -> Outcome {
        process.terminate(value);
        self.state.process_table.remove(process.id());

        if process.is_main() {
            let code = value.as_integer().map(|code| code as i32).unwrap_or(0);

            self.state.terminate_vm(code);
        }

        Outcome::Terminated
    }

    // ===== Native functions =====

    /// Invoke a registered native function
    fn run_native(
        &self,
        process: &Arc<Process>,
        name: &str,
        arguments: &[Value],
    ) -> Result<Value, String> {
        match name {
            "time" => {
                let seconds = unsafe { libc::time(std::ptr::null_mut()) } as i64;

                Ok(self.int_result(process, seconds as i128))
            }
            "cpu_count" => {
                let count = std::thread::available_parallelism()
                    .map(|count| count.get())
                    .unwrap_or(1) as i64;

                Ok(self.int_result(process, count as i128))
            }
            "argument_count" => {
                Ok(self.int_result(process, self.state.arguments.len() as i128))
            }
            "argument" => {
                let index = arguments
                    .first()
                    .and_then(|value| value.as_integer())
                    .unwrap_or(-1);

                match self.state.arguments.get(index.max(0) as usize) {
                    Some(argument) => Ok(self.state.intern_string(argument)),
                    None => Ok(Value::nil()),
                }
            }
            _ => Err(self.panic_message(
                process,
                &format!("undefined native function {:?}", name),
            )),
        }
    }

    // ===== Small helpers =====

    /// Whether a value may be shared across processes
    fn shareable(&self, value: Value) -> bool {
        if value.is_immediate() {
            return true;
        }

        value
            .as_object_ptr()
            .map(|ptr| unsafe {
                (*ptr.as_ptr()).header.generation() == Generation::Permanent
            })
            .unwrap_or(false)
    }

    /// Borrow the block payload of a value
    fn block_of(&self, value: Value) -> Option<&Block> {
        value
            .as_object_ptr()
            .and_then(|ptr| unsafe { (*ptr.as_ptr()).block() })
    }

    /// Intern an attribute name given as a string value
    fn attribute_name(
        &self,
        process: &Arc<Process>,
        name: Value,
    ) -> Result<crate::symbol::Symbol, String> {
        let string = name
            .as_object_ptr()
            .and_then(|ptr| unsafe { (*ptr.as_ptr()).string() });

        match string {
            Some(string) => Ok(self.state.symbols.intern(string)),
            None => Err(self.panic_message(process, "attribute names must be strings")),
        }
    }

    /// Read an array index operand
    fn index_operand(
        &self,
        process: &Arc<Process>,
        ctx: &ExecutionContext,
        register: u16,
    ) -> Result<usize, String> {
        match ctx.get_register(register).as_integer() {
            Some(index) if index >= 0 => Ok(index as usize),
            _ => Err(self.panic_message(process, "array indexes must be non-negative integers")),
        }
    }

    /// The integer payload of an immediate or big integer value
    fn integer_of(&self, value: Value) -> Option<i128> {
        if let Some(immediate) = value.as_integer() {
            return Some(immediate as i128);
        }

        value.as_object_ptr().and_then(|ptr| unsafe {
            match (*ptr.as_ptr()).value {
                ObjectKind::BigInt(value) => Some(value),
                _ => None,
            }
        })
    }

    /// Pack an integer result, boxing when it exceeds the immediate range
    fn int_result(&self, process: &Arc<Process>, value: i128) -> Value {
        if let Ok(small) = i64::try_from(value) {
            if let Some(immediate) = Value::integer(small) {
                return immediate;
            }
        }

        process.allocate(self.state.prototypes.integer, ObjectKind::BigInt(value))
    }

    /// Execute a binary integer instruction
    fn int_binary<F: Fn(i128, i128) -> Option<i128>>(
        &self,
        process: &Arc<Process>,
        instruction: &sona_bytecode::Instruction,
        op: F,
    ) -> Result<(), String> {
        // The result may box.
        process.ensure_allocation_capacity(1);

        let ctx = process.context_mut();
        let left = ctx.get_register(instruction.operand(1));
        let right = ctx.get_register(instruction.operand(2));

        let (Some(left), Some(right)) = (self.integer_of(left), self.integer_of(right)) else {
            return Err(self.panic_message(process, "integer instructions require integers"));
        };

        let Some(result) = op(left, right) else {
            return Err(self.panic_message(process, "integer division by zero"));
        };

        let value = self.int_result(process, result);

        process
            .context_mut()
            .set_register(instruction.operand(0), value);
        Ok(())
    }

    /// Execute an integer comparison instruction
    fn int_compare<F: Fn(i128, i128) -> bool>(
        &self,
        process: &Arc<Process>,
        instruction: &sona_bytecode::Instruction,
        op: F,
    ) -> Result<(), String> {
        let ctx = process.context_mut();
        let left = ctx.get_register(instruction.operand(1));
        let right = ctx.get_register(instruction.operand(2));

        let (Some(left), Some(right)) = (self.integer_of(left), self.integer_of(right)) else {
            return Err(self.panic_message(process, "integer comparisons require integers"));
        };

        ctx.set_register(instruction.operand(0), Value::boolean(op(left, right)));
        Ok(())
    }

    /// The float payload of a value, accepting integers
    fn float_of(&self, value: Value) -> Option<f64> {
        if let Some(immediate) = value.as_integer() {
            return Some(immediate as f64);
        }

        value.as_object_ptr().and_then(|ptr| unsafe {
            match (*ptr.as_ptr()).value {
                ObjectKind::Float(value) => Some(value),
                ObjectKind::BigInt(value) => Some(value as f64),
                _ => None,
            }
        })
    }

    /// Execute a binary float instruction
    fn float_binary<F: Fn(f64, f64) -> f64>(
        &self,
        process: &Arc<Process>,
        instruction: &sona_bytecode::Instruction,
        op: F,
    ) -> Result<(), String> {
        process.ensure_allocation_capacity(1);

        let ctx = process.context_mut();
        let left = ctx.get_register(instruction.operand(1));
        let right = ctx.get_register(instruction.operand(2));

        let (Some(left), Some(right)) = (self.float_of(left), self.float_of(right)) else {
            return Err(self.panic_message(process, "float instructions require numbers"));
        };

        let value = process.allocate(
            self.state.prototypes.float,
            ObjectKind::Float(op(left, right)),
        );

        process
            .context_mut()
            .set_register(instruction.operand(0), value);
        Ok(())
    }

    /// Format a panic with the process's current stack trace
    fn panic_message(&self, process: &Arc<Process>, reason: &str) -> String {
        let mut message = format!(
            "Process {} panicked: {}",
            process.id().as_u64(),
            reason
        );

        for line in process.stack_trace() {
            message.push_str("\n    ");
            message.push_str(&line);
        }

        message
    }
}

/// A short human-readable description of a value, used in panic messages
fn describe_value(value: Value) -> String {
    if let Some(integer) = value.as_integer() {
        return integer.to_string();
    }

    if let Some(boolean) = value.as_boolean() {
        return boolean.to_string();
    }

    if value.is_nil() {
        return "Nil".to_string();
    }

    if value.is_undefined() {
        return "Undefined".to_string();
    }

    match value.as_object_ptr() {
        Some(ptr) => {
            let object = unsafe { &*ptr.as_ptr() };

            match &object.value {
                ObjectKind::String(string) => format!("{:?}", string),
                ObjectKind::Float(float) => float.to_string(),
                ObjectKind::BigInt(int) => int.to_string(),
                ObjectKind::Array(_) => "an array".to_string(),
                ObjectKind::Block(_) => "a block".to_string(),
                ObjectKind::Generator(_) => "a generator".to_string(),
                ObjectKind::Process(id) => format!("process {}", id.as_u64()),
                ObjectKind::ByteArray(_) => "a byte array".to_string(),
                ObjectKind::None => "an object".to_string(),
            }
        }
        None => "a value".to_string(),
    }
}
