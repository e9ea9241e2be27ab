//! The permanent space
//!
//! A single shared, immortal region holding module globals, interned
//! strings, prototypes and other values that must be visible to every
//! process. Permanent objects are never moved or collected, which is what
//! makes sharing them across process heaps safe; everything is released en
//! masse when the VM exits.

use crate::heap::mature::MatureSpace;
use crate::object::{Generation, Object, ObjectKind};
use crate::value::Value;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// The shared immortal object space
pub struct PermanentSpace {
    space: Mutex<MatureSpace>,
    interned_strings: Mutex<FxHashMap<String, Value>>,
}

impl PermanentSpace {
    /// Create an empty permanent space
    pub fn new() -> Self {
        Self {
            space: Mutex::new(MatureSpace::new()),
            interned_strings: Mutex::new(FxHashMap::default()),
        }
    }

    /// Allocate a permanent object
    pub fn allocate(&self, prototype: Value, kind: ObjectKind) -> Value {
        let object = Object::new(Generation::Permanent, prototype, kind);
        let ptr = self.space.lock().allocate(object);

        unsafe { Value::from_ptr(ptr) }
    }

    /// Allocate an empty permanent object, used for prototypes
    pub fn allocate_empty(&self, prototype: Value) -> Value {
        self.allocate(prototype, ObjectKind::None)
    }

    /// Intern a string, returning the shared permanent object
    pub fn intern_string(&self, string_prototype: Value, value: &str) -> Value {
        let mut interned = self.interned_strings.lock();

        if let Some(&existing) = interned.get(value) {
            return existing;
        }

        let object = self.allocate(string_prototype, ObjectKind::String(value.into()));

        interned.insert(value.to_string(), object);
        object
    }

    /// The number of permanent objects
    pub fn len(&self) -> usize {
        self.space.lock().occupied_slots()
    }

    /// Whether the space is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PermanentSpace {
    fn default() -> Self {
        Self::new()
    }
}

// Permanent objects are immutable once published and the backing space is
// lock-protected, so sharing raw pointers across worker threads is sound.
unsafe impl Send for PermanentSpace {}
unsafe impl Sync for PermanentSpace {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Generation;

    #[test]
    fn test_allocation_is_permanent() {
        let space = PermanentSpace::new();
        let value = space.allocate_empty(Value::nil());
        let object = unsafe { value.object_ref() };

        assert_eq!(object.header.generation(), Generation::Permanent);
        assert_eq!(space.len(), 1);
    }

    #[test]
    fn test_string_interning() {
        let space = PermanentSpace::new();
        let proto = space.allocate_empty(Value::nil());

        let a = space.intern_string(proto, "ping");
        let b = space.intern_string(proto, "ping");
        let c = space.intern_string(proto, "pong");

        assert_eq!(a.raw(), b.raw());
        assert_ne!(a.raw(), c.raw());

        let object = unsafe { a.object_ref() };

        assert_eq!(object.string(), Some("ping"));
    }
}
