//! Shared VM state
//!
//! Everything global to one running VM: the configuration, the permanent
//! space and its prototypes, materialized literals, module globals, the
//! process table, the scheduler and the reactor, plus the shutdown latch
//! that carries the exit code. All shared structures are lock-free or
//! finely locked; per-process heaps are never reachable from here.

use crate::config::Config;
use crate::heap::permanent::PermanentSpace;
use crate::object::ObjectKind;
use crate::process_table::ProcessTable;
use crate::reactor::Reactor;
use crate::scheduler::Scheduler;
use crate::symbol::SymbolTable;
use crate::value::Value;
use parking_lot::{Condvar, Mutex, RwLock};
use sona_bytecode::{CodeObject, Image, Literal};
use std::sync::Arc;

/// The prototypes of the built-in value kinds, all permanent
pub struct Prototypes {
    /// Root of every prototype chain
    pub object: Value,
    /// Prototype of integers, immediate and boxed alike
    pub integer: Value,
    /// Prototype of floats
    pub float: Value,
    /// Prototype of strings
    pub string: Value,
    /// Prototype of byte arrays
    pub byte_array: Value,
    /// Prototype of arrays
    pub array: Value,
    /// Prototype of blocks
    pub block: Value,
    /// Prototype of booleans
    pub boolean: Value,
    /// Prototype of Nil
    pub nil: Value,
    /// Prototype of generators
    pub generator: Value,
    /// Prototype of process handles
    pub process: Value,
}

impl Prototypes {
    fn new(permanent: &PermanentSpace) -> Self {
        let object = permanent.allocate_empty(Value::nil());

        Self {
            object,
            integer: permanent.allocate_empty(object),
            float: permanent.allocate_empty(object),
            string: permanent.allocate_empty(object),
            byte_array: permanent.allocate_empty(object),
            array: permanent.allocate_empty(object),
            block: permanent.allocate_empty(object),
            boolean: permanent.allocate_empty(object),
            nil: permanent.allocate_empty(object),
            generator: permanent.allocate_empty(object),
            process: permanent.allocate_empty(object),
        }
    }
}

/// State shared by every worker and the reactor
pub struct VmState {
    /// The runtime configuration
    pub config: Config,
    /// The shared immortal space
    pub permanent: PermanentSpace,
    /// The interned symbol pool
    pub symbols: SymbolTable,
    /// Prototypes of the built-in kinds
    pub prototypes: Prototypes,
    /// Top-level code objects, indexed by the image code table
    pub code: Vec<Arc<CodeObject>>,
    /// The loaded image
    pub image: Image,
    /// Literal pool values, materialized into the permanent space
    pub literals: Vec<Value>,
    /// Per-module global slots; values stored here must be permanent
    pub globals: RwLock<Vec<Vec<Value>>>,
    /// The process table
    pub process_table: ProcessTable,
    /// The scheduler queues
    pub scheduler: Scheduler,
    /// The reactor thread handle
    pub reactor: Arc<Reactor>,
    /// The value thrown by a timed-out receive
    pub timeout_error: Value,
    /// Arguments forwarded to the program
    pub arguments: Vec<String>,
    /// The exit code, set once at shutdown
    exit_code: Mutex<Option<i32>>,
    /// Signalled when the exit code is set
    shutdown: Condvar,
}

impl VmState {
    /// Build the shared state for an image
    pub fn new(image: Image, config: Config, arguments: Vec<String>) -> Arc<Self> {
        let permanent = PermanentSpace::new();
        let symbols = SymbolTable::new();
        let prototypes = Prototypes::new(&permanent);

        let literals = image
            .literals
            .iter()
            .map(|literal| match literal {
                Literal::String(value) => permanent.intern_string(prototypes.string, value),
                Literal::Integer(value) => match Value::integer(*value) {
                    Some(immediate) => immediate,
                    None => permanent
                        .allocate(prototypes.integer, ObjectKind::BigInt(*value as i128)),
                },
                Literal::Float(value) => {
                    permanent.allocate(prototypes.float, ObjectKind::Float(*value))
                }
            })
            .collect();

        let code = image
            .code_objects
            .iter()
            .map(|code| Arc::new(code.clone()))
            .collect();

        let globals = image
            .modules
            .iter()
            .map(|module| vec![Value::nil(); module.globals as usize])
            .collect();

        let scheduler = Scheduler::new(config.primary_threads, config.blocking_threads);
        let timeout_error = permanent.intern_string(prototypes.string, "timeout");

        Arc::new(Self {
            config,
            permanent,
            symbols,
            prototypes,
            code,
            image,
            literals,
            globals: RwLock::new(globals),
            process_table: ProcessTable::new(),
            scheduler,
            reactor: Reactor::new(),
            timeout_error,
            arguments,
            exit_code: Mutex::new(None),
            shutdown: Condvar::new(),
        })
    }

    /// Intern a string into the permanent space
    pub fn intern_string(&self, value: &str) -> Value {
        self.permanent.intern_string(self.prototypes.string, value)
    }

    /// The prototype of a value, honoring immediates
    pub fn prototype_of(&self, value: Value) -> Value {
        if value.is_integer() {
            return self.prototypes.integer;
        }

        if value.is_boolean() {
            return self.prototypes.boolean;
        }

        if value.is_nil() || value.is_undefined() {
            return self.prototypes.nil;
        }

        match value.as_object_ptr() {
            Some(ptr) => unsafe { (*ptr.as_ptr()).prototype },
            None => self.prototypes.object,
        }
    }

    /// Read a module global
    pub fn get_global(&self, module: u32, index: u16) -> Value {
        self.globals
            .read()
            .get(module as usize)
            .and_then(|slots| slots.get(index as usize))
            .copied()
            .unwrap_or_else(Value::nil)
    }

    /// Write a module global; the caller validated the value is shareable
    pub fn set_global(&self, module: u32, index: u16, value: Value) {
        let mut globals = self.globals.write();

        if let Some(slots) = globals.get_mut(module as usize) {
            let index = index as usize;

            if index >= slots.len() {
                slots.resize(index + 1, Value::nil());
            }

            slots[index] = value;
        }
    }

    /// Record the exit code and release everything waiting on shutdown.
    /// Only the first call wins.
    pub fn terminate_vm(&self, code: i32) {
        let mut exit_code = self.exit_code.lock();

        if exit_code.is_none() {
            *exit_code = Some(code);
            self.shutdown.notify_all();
        }
    }

    /// Whether shutdown has been requested
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Block until shutdown is requested, returning the exit code
    pub fn wait_for_shutdown(&self) -> i32 {
        let mut exit_code = self.exit_code.lock();

        while exit_code.is_none() {
            self.shutdown.wait(&mut exit_code);
        }

        exit_code.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<VmState> {
        let mut image = Image::new();

        image.add_literal(Literal::String("hello".to_string()));
        image.add_literal(Literal::Integer(7));
        image.add_literal(Literal::Integer(i64::MAX));
        image.add_literal(Literal::Float(1.25));
        image.modules.push(sona_bytecode::ModuleEntry {
            name: "main".to_string(),
            code_index: 0,
            globals: 2,
        });
        image.code_objects.push(CodeObject::new("main", "main.sona", 1));

        VmState::new(image, Config::for_tests(), Vec::new())
    }

    #[test]
    fn test_literal_materialization() {
        let state = state();

        let string = state.literals[0];
        let small = state.literals[1];
        let big = state.literals[2];
        let float = state.literals[3];

        assert_eq!(unsafe { string.object_ref() }.string(), Some("hello"));
        assert_eq!(small.as_integer(), Some(7));
        assert!(big.is_object());
        assert!(matches!(
            unsafe { big.object_ref() }.value,
            ObjectKind::BigInt(value) if value == i64::MAX as i128
        ));
        assert!(float.is_object());
    }

    #[test]
    fn test_prototype_of_immediates() {
        let state = state();

        assert_eq!(
            state.prototype_of(Value::integer(1).unwrap()).raw(),
            state.prototypes.integer.raw()
        );
        assert_eq!(
            state.prototype_of(Value::boolean(true)).raw(),
            state.prototypes.boolean.raw()
        );
        assert_eq!(
            state.prototype_of(Value::nil()).raw(),
            state.prototypes.nil.raw()
        );
    }

    #[test]
    fn test_globals() {
        let state = state();

        assert!(state.get_global(0, 0).is_nil());

        state.set_global(0, 1, Value::integer(5).unwrap());

        assert_eq!(state.get_global(0, 1).as_integer(), Some(5));

        // Unknown modules read as Nil.
        assert!(state.get_global(9, 0).is_nil());
    }

    #[test]
    fn test_terminate_vm_first_wins() {
        let state = state();

        assert!(state.exit_code().is_none());

        state.terminate_vm(3);
        state.terminate_vm(7);

        assert_eq!(state.exit_code(), Some(3));
        assert_eq!(state.wait_for_shutdown(), 3);
    }
}
