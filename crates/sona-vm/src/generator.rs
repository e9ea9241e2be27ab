//! Suspendable generator frames
//!
//! A generator owns the execution state of a restartable block: the code,
//! the captured binding, and, while suspended, the instruction pointer and
//! register file of its body. Resuming moves that state into a regular call
//! frame; yielding moves it back.

use crate::binding::RcBinding;
use crate::value::Value;
use sona_bytecode::CodeObject;
use std::sync::Arc;

/// The lifecycle of a generator
enum GeneratorState {
    /// Created but never resumed
    Ready,
    /// Suspended at a yield; holds the saved frame
    Suspended {
        /// Saved instruction pointer, positioned after the yield
        ip: usize,
        /// Saved register file
        registers: Vec<Value>,
    },
    /// Currently executing on the resumer's stack
    Running,
    /// Ran to completion or unwound
    Finished,
}

/// A suspendable execution context
pub struct Generator {
    /// The code of the generator body
    code: Arc<CodeObject>,
    /// The binding the body executes in
    binding: RcBinding,
    /// The module whose globals the body resolves against
    module: u32,
    /// Current lifecycle state
    state: GeneratorState,
    /// The most recently yielded value
    value: Value,
}

impl Generator {
    /// Create a generator that will execute `code` in `binding`
    pub fn new(code: Arc<CodeObject>, binding: RcBinding, module: u32) -> Self {
        Self {
            code,
            binding,
            module,
            state: GeneratorState::Ready,
            value: Value::nil(),
        }
    }

    /// The code of the generator body
    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    /// The module index of the generator body
    pub fn module(&self) -> u32 {
        self.module
    }

    /// The binding of the generator body, absent once finished
    pub fn binding(&self) -> Option<&RcBinding> {
        match self.state {
            GeneratorState::Finished => None,
            _ => Some(&self.binding),
        }
    }

    /// Whether the generator has run to completion
    pub fn is_finished(&self) -> bool {
        matches!(self.state, GeneratorState::Finished)
    }

    /// Whether the generator is currently on a call stack
    pub fn is_running(&self) -> bool {
        matches!(self.state, GeneratorState::Running)
    }

    /// The most recently yielded value
    pub fn value(&self) -> Value {
        self.value
    }

    /// Take the saved frame for resumption. Returns the instruction pointer
    /// and register file to re-enter with, or `None` when the generator is
    /// finished or already running.
    pub fn resume(&mut self) -> Option<(usize, Vec<Value>)> {
        match std::mem::replace(&mut self.state, GeneratorState::Running) {
            GeneratorState::Ready => {
                Some((0, vec![Value::nil(); self.code.registers as usize]))
            }
            GeneratorState::Suspended { ip, registers } => Some((ip, registers)),
            state @ (GeneratorState::Running | GeneratorState::Finished) => {
                self.state = state;
                None
            }
        }
    }

    /// Store the frame back after a yield
    pub fn suspend(&mut self, ip: usize, registers: Vec<Value>, value: Value) {
        self.state = GeneratorState::Suspended { ip, registers };
        self.value = value;
    }

    /// Mark the generator finished; later resumes report completion
    pub fn finish(&mut self) {
        self.state = GeneratorState::Finished;
        self.value = Value::nil();
    }

    /// Apply `update` to every value slot held by the generator
    pub fn each_pointer<F: FnMut(&mut Value)>(&mut self, update: &mut F) {
        update(&mut self.value);

        if let GeneratorState::Suspended { registers, .. } = &mut self.state {
            for register in registers.iter_mut() {
                update(register);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Binding;

    fn test_code() -> Arc<CodeObject> {
        let mut code = CodeObject::new("gen", "gen.sona", 1);

        code.registers = 2;
        code.generator = true;
        Arc::new(code)
    }

    #[test]
    fn test_resume_fresh_generator() {
        let mut generator = Generator::new(test_code(), Binding::new(0), 0);

        let (ip, registers) = generator.resume().unwrap();

        assert_eq!(ip, 0);
        assert_eq!(registers.len(), 2);
        assert!(generator.is_running());
    }

    #[test]
    fn test_suspend_and_resume() {
        let mut generator = Generator::new(test_code(), Binding::new(0), 0);

        generator.resume().unwrap();
        generator.suspend(5, vec![Value::nil(); 2], Value::integer(10).unwrap());

        assert_eq!(generator.value().as_integer(), Some(10));

        let (ip, _) = generator.resume().unwrap();

        assert_eq!(ip, 5);
    }

    #[test]
    fn test_finished_generator_does_not_resume() {
        let mut generator = Generator::new(test_code(), Binding::new(0), 0);

        generator.resume().unwrap();
        generator.finish();

        assert!(generator.is_finished());
        assert!(generator.resume().is_none());
        assert!(generator.value().is_nil());
        assert!(generator.binding().is_none());
    }

    #[test]
    fn test_running_generator_does_not_resume() {
        let mut generator = Generator::new(test_code(), Binding::new(0), 0);

        generator.resume().unwrap();

        assert!(generator.resume().is_none());
        assert!(generator.is_running());
    }
}
