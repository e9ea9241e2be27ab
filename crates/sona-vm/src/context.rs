//! Execution contexts: one call frame of a process
//!
//! A context holds the code being executed, the instruction pointer, the
//! register file, the binding chain, and the frame's deferred-block stack.
//! Contexts form the call stack of a process; generators temporarily push a
//! context that belongs to a heap-allocated generator object.

use crate::binding::{Binding, RcBinding};
use crate::object::Block;
use crate::value::Value;
use sona_bytecode::CodeObject;
use std::sync::Arc;

/// A single call frame
pub struct ExecutionContext {
    /// The code this frame executes
    pub code: Arc<CodeObject>,
    /// Index of the next instruction to execute
    pub ip: usize,
    /// The register file
    pub registers: Vec<Value>,
    /// The binding holding this frame's locals
    pub binding: RcBinding,
    /// The module globals are resolved against
    pub module: u32,
    /// Register in the parent frame receiving the return value
    pub return_register: Option<u16>,
    /// Blocks to run when the frame exits normally or by caught throw
    pub deferred: Vec<Value>,
    /// The generator object this frame belongs to, if any
    pub generator: Option<Value>,
    /// Whether the frame is unwinding and only running deferred blocks
    pub unwinding: bool,
    /// Line of the most recently executed instruction, for traces
    pub line: u16,
}

impl ExecutionContext {
    /// Create a frame for invoking a block
    pub fn for_block(block: &Block, return_register: Option<u16>) -> Self {
        let code = block.code.clone();
        let binding = Binding::with_parent(block.binding.clone(), code.locals);
        let registers = vec![Value::nil(); code.registers as usize];
        let line = code.line;

        Self {
            code,
            ip: 0,
            registers,
            binding,
            module: block.module,
            return_register,
            deferred: Vec::new(),
            generator: None,
            unwinding: false,
            line,
        }
    }

    /// Create the top frame of a module's main code object
    pub fn for_module(code: Arc<CodeObject>, module: u32) -> Self {
        let binding = Binding::new(code.locals);
        let registers = vec![Value::nil(); code.registers as usize];
        let line = code.line;

        Self {
            code,
            ip: 0,
            registers,
            binding,
            module,
            return_register: None,
            deferred: Vec::new(),
            generator: None,
            unwinding: false,
            line,
        }
    }

    /// Create a frame resuming a generator
    pub fn for_generator(
        generator_object: Value,
        code: Arc<CodeObject>,
        binding: RcBinding,
        module: u32,
        ip: usize,
        registers: Vec<Value>,
        return_register: Option<u16>,
    ) -> Self {
        let line = code.line;

        Self {
            code,
            ip,
            registers,
            binding,
            module,
            return_register,
            deferred: Vec::new(),
            generator: Some(generator_object),
            unwinding: false,
            line,
        }
    }

    /// Read a register
    pub fn get_register(&self, register: u16) -> Value {
        self.registers
            .get(register as usize)
            .copied()
            .unwrap_or_else(Value::nil)
    }

    /// Write a register
    pub fn set_register(&mut self, register: u16, value: Value) {
        let index = register as usize;

        if index >= self.registers.len() {
            self.registers.resize(index + 1, Value::nil());
        }

        self.registers[index] = value;
    }
}
