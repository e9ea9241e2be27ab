//! Per-process garbage collection
//!
//! Young collections evacuate live objects into the inactive semispace
//! (Cheney scan), promoting objects that have survived
//! [`PROMOTION_AGE`](crate::heap::PROMOTION_AGE) collections into the mature
//! generation. Mature collections mark from the same roots and sweep
//! unmarked slots onto the free list; the mature space never moves objects,
//! so no reference rewriting is needed there.
//!
//! Collections run on the thread executing the owning process and pause
//! only that process. Roots are supplied by the caller as a visitor over
//! every value slot of the process: frame registers, binding chains,
//! deferred blocks and in-flight thrown values.

use crate::binding::RcBinding;
use crate::heap::{LocalHeap, PROMOTION_AGE};
use crate::object::{Generation, Object};
use crate::value::Value;
use rustc_hash::FxHashSet;
use std::rc::Rc;

/// A visitor applied to every root slot of a process
pub type RootVisitor<'a> = &'a mut dyn FnMut(&mut Value);

/// Run a young collection over `heap`
///
/// `each_root` must invoke its argument on every root value slot exactly
/// once per slot. After the call every live young object has been evacuated
/// and all references to it, including those in mature objects recorded in
/// the remembered set, point at the new location.
pub fn collect_young<F>(heap: &mut LocalHeap, mut each_root: F)
where
    F: FnMut(RootVisitor<'_>),
{
    let mut collection = YoungCollection {
        heap: heap as *mut LocalHeap,
        promoted: Vec::new(),
        visited_bindings: FxHashSet::default(),
    };

    // Evacuate everything directly reachable from the process roots.
    each_root(&mut |value| collection.evacuate(value));

    // Flagged mature chunks are roots too: they hold young pointers stored
    // after the objects became mature.
    let cards = heap.remembered.take();

    for &card in &cards {
        let mut pointers = Vec::new();

        heap.mature
            .each_object_in_chunk(card, |ptr| pointers.push(ptr));

        for ptr in pointers {
            collection.trace_object(ptr);
        }
    }

    // Cheney scan: newly copied objects are scanned in allocation order,
    // copying their children, until both the to-space and the promoted
    // queue are exhausted.
    let mut scan = 0;
    let mut promoted_scan = 0;

    loop {
        if scan < heap.young_inactive().len() {
            let ptr = heap.young_inactive().object_ptr(scan);

            scan += 1;
            collection.trace_object(ptr);
            continue;
        }

        if promoted_scan < collection.promoted.len() {
            let ptr = collection.promoted[promoted_scan];

            promoted_scan += 1;
            collection.trace_object(ptr);
            continue;
        }

        break;
    }

    // Drop the from-space, queueing finalizable dead objects, and make the
    // to-space the new allocation target.
    heap.finish_young_collection();

    // Re-flag cards that still reference the (new) young generation,
    // including chunks that gained young pointers through promotion.
    for &card in &cards {
        if chunk_references_young(heap, card) {
            heap.remembered.remember(card);
        }
    }

    for &ptr in &collection.promoted {
        if object_references_young(ptr) {
            if let Some(card) = heap.mature.chunk_of(ptr) {
                heap.remembered.remember(card);
            }
        }
    }
}

/// Run a mature collection over `heap`
///
/// Marks from the process roots, then sweeps unmarked mature slots onto the
/// free list. Young objects are traversed (they keep mature objects alive)
/// but never freed here.
pub fn collect_mature<F>(heap: &mut LocalHeap, mut each_root: F)
where
    F: FnMut(RootVisitor<'_>),
{
    let mut collection = MatureCollection {
        worklist: Vec::new(),
        visited_bindings: FxHashSet::default(),
    };

    each_root(&mut |value| collection.mark(*value));

    while let Some(ptr) = collection.worklist.pop() {
        // The worklist only ever holds pointers to live objects in this
        // process's spaces.
        let object = unsafe { &mut *ptr };

        object.each_pointer(|value| collection.mark(*value));
        object.each_binding(|binding| collection.walk_binding(binding));
    }

    heap.sweep_mature();

    // The trace marked young objects to pass through them; clear those bits
    // for the next cycle.
    for index in 0..heap.young_active().len() {
        let ptr = heap.young_active().object_ptr(index);

        unsafe {
            (*ptr).header.unmark();
        }
    }
}

struct YoungCollection {
    heap: *mut LocalHeap,
    promoted: Vec<*mut Object>,
    visited_bindings: FxHashSet<usize>,
}

impl YoungCollection {
    /// Evacuate the object `value` refers to, updating the slot in place.
    ///
    /// Already-moved objects resolve through the forwarding pointer left in
    /// the from-space header, so aliased references keep their identity.
    fn evacuate(&mut self, value: &mut Value) {
        let Some(ptr) = value.as_object_ptr() else {
            return;
        };

        // The collector runs on the owning thread while the mutator is
        // paused; the heap pointer stays valid for the whole collection.
        let (object, heap) = unsafe { (&mut *ptr.as_ptr(), &mut *self.heap) };

        if object.header.generation() != Generation::Young {
            return;
        }

        if let Some(target) = object.forwarding_target() {
            *value = target;
            return;
        }

        let mut moved = object.forward_to(Value::nil());

        moved.header.increment_age();

        let promote =
            moved.header.age() >= PROMOTION_AGE || heap.young_inactive().free_slots() == 0;

        let new_value = if promote {
            moved.header.set_generation(Generation::Mature);

            let new_ptr = heap.mature.allocate(moved);

            heap.stats.promoted += 1;
            self.promoted.push(new_ptr.as_ptr());
            unsafe { Value::from_ptr(new_ptr) }
        } else {
            match heap.young_inactive().allocate(moved) {
                Some(new_ptr) => unsafe { Value::from_ptr(new_ptr) },
                None => unreachable!("the to-space had a free slot"),
            }
        };

        object.prototype = new_value;
        *value = new_value;
    }

    fn trace_object(&mut self, ptr: *mut Object) {
        let object = unsafe { &mut *ptr };

        object.each_pointer(|value| self.evacuate(value));
        object.each_binding(|binding| self.walk_binding(binding));
    }

    fn walk_binding(&mut self, binding: &RcBinding) {
        if !self.visited_bindings.insert(Rc::as_ptr(binding) as usize) {
            return;
        }

        binding.update_locals(|value| self.evacuate(value));

        if let Some(parent) = binding.parent() {
            self.walk_binding(parent);
        }
    }
}

struct MatureCollection {
    worklist: Vec<*mut Object>,
    visited_bindings: FxHashSet<usize>,
}

impl MatureCollection {
    fn mark(&mut self, value: Value) {
        let Some(ptr) = value.as_object_ptr() else {
            return;
        };

        let object = unsafe { &mut *ptr.as_ptr() };

        if object.header.generation() == Generation::Permanent {
            return;
        }

        if object.header.is_marked() {
            return;
        }

        object.header.mark();
        self.worklist.push(ptr.as_ptr());
    }

    fn walk_binding(&mut self, binding: &RcBinding) {
        if !self.visited_bindings.insert(Rc::as_ptr(binding) as usize) {
            return;
        }

        binding.update_locals(|value| self.mark(*value));

        if let Some(parent) = binding.parent() {
            self.walk_binding(parent);
        }
    }
}

fn object_references_young(ptr: *mut Object) -> bool {
    let object = unsafe { &mut *ptr };
    let mut found = false;

    object.each_pointer(|value| {
        found |= LocalHeap::is_young(*value);
    });

    object.each_binding(|binding| {
        found |= binding_references_young(binding, &mut FxHashSet::default());
    });

    found
}

fn binding_references_young(binding: &RcBinding, visited: &mut FxHashSet<usize>) -> bool {
    if !visited.insert(Rc::as_ptr(binding) as usize) {
        return false;
    }

    let mut found = false;

    binding.update_locals(|value| {
        found |= LocalHeap::is_young(*value);
    });

    if let Some(parent) = binding.parent() {
        found |= binding_references_young(parent, visited);
    }

    found
}

fn chunk_references_young(heap: &mut LocalHeap, card: usize) -> bool {
    let mut pointers = Vec::new();

    heap.mature
        .each_object_in_chunk(card, |ptr| pointers.push(ptr));
    pointers.into_iter().any(object_references_young)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    fn heap() -> LocalHeap {
        LocalHeap::new(64 * std::mem::size_of::<Object>(), 1024 * 1024)
    }

    #[test]
    fn test_young_collection_keeps_roots() {
        let mut heap = heap();
        let mut root = heap.allocate(Value::nil(), ObjectKind::Float(1.5));
        let dead = heap.allocate(Value::nil(), ObjectKind::Float(9.0));

        let _ = dead;

        collect_young(&mut heap, |visit| visit(&mut root));

        assert_eq!(heap.young_len(), 1);
        assert!(root.is_object());

        let object = unsafe { root.object_ref() };

        assert!(matches!(object.value, ObjectKind::Float(value) if value == 1.5));
    }

    #[test]
    fn test_young_collection_preserves_aliasing() {
        let mut heap = heap();
        let object = heap.allocate(Value::nil(), ObjectKind::Float(2.0));
        let mut root_a = object;
        let mut root_b = object;

        collect_young(&mut heap, |visit| {
            visit(&mut root_a);
            visit(&mut root_b);
        });

        assert_eq!(root_a.raw(), root_b.raw());
        assert_ne!(root_a.raw(), object.raw());
    }

    #[test]
    fn test_young_collection_traces_children() {
        let mut heap = heap();
        let child = heap.allocate(Value::nil(), ObjectKind::Float(3.0));
        let mut parent = heap.allocate(Value::nil(), ObjectKind::Array(vec![child]));

        collect_young(&mut heap, |visit| visit(&mut parent));

        assert_eq!(heap.young_len(), 2);

        let parent_ref = unsafe { parent.object_ref() };
        let new_child = parent_ref.array().unwrap()[0];

        assert_ne!(new_child.raw(), child.raw());

        let child_ref = unsafe { new_child.object_ref() };

        assert!(matches!(child_ref.value, ObjectKind::Float(value) if value == 3.0));
    }

    #[test]
    fn test_survivors_are_promoted() {
        let mut heap = heap();
        let mut root = heap.allocate(Value::nil(), ObjectKind::Float(4.0));

        for _ in 0..PROMOTION_AGE {
            collect_young(&mut heap, |visit| visit(&mut root));
        }

        assert!(!LocalHeap::is_young(root));
        assert_eq!(heap.mature.occupied_slots(), 1);
        assert_eq!(heap.stats.promoted, 1);
    }

    #[test]
    fn test_remembered_set_keeps_young_target_alive() {
        let mut heap = heap();
        let holder = heap.allocate_mature(Value::nil(), ObjectKind::Array(Vec::new()));
        let young = heap.allocate(Value::nil(), ObjectKind::Float(5.0));

        unsafe {
            holder.object_mut().array_mut().unwrap().push(young);
        }

        heap.write_barrier(holder, young);

        // No stack roots at all: the young object survives purely through
        // the remembered set.
        collect_young(&mut heap, |_visit| {});

        assert_eq!(heap.young_len(), 1);

        let holder_ref = unsafe { holder.object_ref() };
        let updated = holder_ref.array().unwrap()[0];

        assert_ne!(updated.raw(), young.raw());
        assert!(LocalHeap::is_young(updated));

        // The card stays flagged: the holder still references young.
        assert!(!heap.remembered.is_empty());
    }

    #[test]
    fn test_unreferenced_young_objects_die() {
        let mut heap = heap();

        for _ in 0..10 {
            heap.allocate(Value::nil(), ObjectKind::Float(0.0));
        }

        collect_young(&mut heap, |_visit| {});

        assert_eq!(heap.young_len(), 0);
    }

    #[test]
    fn test_repeated_collection_is_idempotent() {
        let mut heap = heap();
        let mut root = heap.allocate(Value::nil(), ObjectKind::Float(6.0));

        collect_young(&mut heap, |visit| visit(&mut root));

        let after_first = heap.young_len();

        collect_young(&mut heap, |visit| visit(&mut root));

        assert_eq!(heap.young_len(), after_first);
    }

    #[test]
    fn test_mature_collection_sweeps_unreachable() {
        let mut heap = heap();
        let mut kept = heap.allocate_mature(Value::nil(), ObjectKind::Float(1.0));

        heap.allocate_mature(Value::nil(), ObjectKind::Float(2.0));

        collect_mature(&mut heap, |visit| visit(&mut kept));

        assert_eq!(heap.mature.occupied_slots(), 1);
        assert_eq!(heap.stats.mature_freed, 1);

        let object = unsafe { kept.object_ref() };

        assert!(!object.header.is_marked());
    }

    #[test]
    fn test_mature_collection_traces_through_young() {
        let mut heap = heap();
        let mature = heap.allocate_mature(Value::nil(), ObjectKind::Float(7.0));
        let mut young_root = heap.allocate(Value::nil(), ObjectKind::Array(vec![mature]));

        collect_mature(&mut heap, |visit| visit(&mut young_root));

        assert_eq!(heap.mature.occupied_slots(), 1);

        // Young objects were traversed but not marked permanently.
        let young_ref = unsafe { young_root.object_ref() };

        assert!(!young_ref.header.is_marked());
    }

    #[test]
    fn test_collection_updates_binding_locals() {
        use crate::binding::Binding;
        use crate::object::Block;
        use sona_bytecode::CodeObject;
        use std::sync::Arc;

        let mut heap = heap();
        let captured = heap.allocate(Value::nil(), ObjectKind::Float(8.0));
        let binding = Binding::new(1);

        binding.set_local(0, captured);

        let code = Arc::new(CodeObject::new("block", "main.sona", 1));
        let block = Block::new(code, binding.clone(), Value::nil(), 0);
        let mut root = heap.allocate(Value::nil(), ObjectKind::Block(block));

        collect_young(&mut heap, |visit| visit(&mut root));

        let updated = binding.get_local(0);

        assert_ne!(updated.raw(), captured.raw());
        assert!(LocalHeap::is_young(updated));

        let object = unsafe { updated.object_ref() };

        assert!(matches!(object.value, ObjectKind::Float(value) if value == 8.0));
    }
}
