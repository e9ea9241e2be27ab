//! Bump-allocated semispaces for the young generation
//!
//! A semispace is a fixed-capacity slab of object slots. Allocation is a
//! push into the slab; the backing buffer never reallocates, so object
//! addresses are stable until the space is cleared by a collection.

use crate::object::Object;
use std::ptr::NonNull;

/// One half of the young generation
pub struct Semispace {
    slots: Vec<Object>,
}

impl Semispace {
    /// Create a semispace holding up to `capacity` objects
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.max(8)),
        }
    }

    /// Allocate an object, returning `None` when the space is full
    pub fn allocate(&mut self, object: Object) -> Option<NonNull<Object>> {
        if self.slots.len() == self.slots.capacity() {
            return None;
        }

        let index = self.slots.len();

        self.slots.push(object);

        // The push above cannot reallocate: len was below capacity.
        NonNull::new(unsafe { self.slots.as_mut_ptr().add(index) })
    }

    /// The number of allocated objects
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the space holds no objects
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// The number of unallocated slots
    pub fn free_slots(&self) -> usize {
        self.slots.capacity() - self.slots.len()
    }

    /// A raw pointer to the object at `index`
    ///
    /// Used by the collector to scan the space while it is still growing;
    /// the buffer never moves, so the pointer stays valid.
    pub fn object_ptr(&mut self, index: usize) -> *mut Object {
        debug_assert!(index < self.slots.len());

        unsafe { self.slots.as_mut_ptr().add(index) }
    }

    /// Drop all objects, draining finalizable payloads of objects that were
    /// not evacuated into `finalize_queue` first.
    pub fn clear(&mut self, finalize_queue: &mut Vec<Object>) {
        for object in self.slots.drain(..) {
            if !object.header.is_forwarded() && object.header.needs_finalization() {
                finalize_queue.push(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Generation, ObjectKind};
    use crate::value::Value;

    fn young_object() -> Object {
        Object::new(Generation::Young, Value::nil(), ObjectKind::None)
    }

    #[test]
    fn test_allocate_until_full() {
        let mut space = Semispace::new(8);

        for _ in 0..space.capacity() {
            assert!(space.allocate(young_object()).is_some());
        }

        assert!(space.allocate(young_object()).is_none());
        assert_eq!(space.free_slots(), 0);
    }

    #[test]
    fn test_addresses_are_stable() {
        let mut space = Semispace::new(16);
        let first = space.allocate(young_object()).unwrap();

        for _ in 0..10 {
            space.allocate(young_object());
        }

        assert_eq!(space.object_ptr(0), first.as_ptr());
    }

    #[test]
    fn test_clear() {
        let mut space = Semispace::new(8);
        let mut finalize = Vec::new();

        space.allocate(young_object());
        space.allocate(young_object());
        space.clear(&mut finalize);

        assert!(space.is_empty());
        assert!(finalize.is_empty());
    }
}
