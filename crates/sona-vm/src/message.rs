//! Deep-copied message envelopes
//!
//! Messages cross heap boundaries as *envelopes*: heap-independent copies of
//! the sender's object graph. The sender marshals at send time (so failures
//! surface in the sender) and the receiver materializes the envelope into
//! its own heap at receive time. Envelopes preserve sharing within a single
//! message through a per-copy identity map, reference permanent values
//! without copying, and hold no pointers into any process heap, which also
//! keeps mailbox contents out of the garbage collector's root set.

use crate::binding::{Binding, RcBinding};
use crate::heap::LocalHeap;
use crate::object::{Generation, ObjectKind};
use crate::process::ProcessId;
use crate::symbol::Symbol;
use crate::value::Value;
use rustc_hash::FxHashMap;
use sona_bytecode::CodeObject;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while deep-copying a value into an envelope
#[derive(Debug, Error)]
pub enum CopyError {
    /// The value kind cannot cross a heap boundary
    #[error("{0} values cannot be sent between processes")]
    NotSendable(&'static str),
}

/// One value slot inside an envelope
#[derive(Clone)]
pub enum Slot {
    /// An immediate, copied by bits
    Immediate(Value),
    /// A permanent object, shared by reference
    Permanent(Value),
    /// An index into the envelope's node table
    Node(usize),
}

/// The copied payload of one object
pub enum Payload {
    /// No payload
    None,
    /// A boxed float
    Float(f64),
    /// A boxed big integer
    BigInt(i128),
    /// A string
    String(Box<str>),
    /// A byte array
    ByteArray(Vec<u8>),
    /// An array of slots
    Array(Vec<Slot>),
    /// A block: code is shared, the environment is copied
    Block {
        /// The compiled code, shared by reference
        code: Arc<CodeObject>,
        /// The module the block resolves globals against
        module: u32,
        /// The bound receiver
        receiver: Slot,
        /// Index into the envelope's binding table
        binding: usize,
    },
    /// A process handle
    Process(ProcessId),
}

/// One copied object
pub struct Node {
    /// The object's prototype
    pub prototype: Slot,
    /// Attribute table entries
    pub attributes: Vec<(Symbol, Slot)>,
    /// The payload
    pub payload: Payload,
}

/// One copied binding frame
pub struct BindingNode {
    locals: Vec<Slot>,
    parent: Option<usize>,
}

/// A heap-independent deep copy of one value graph
pub struct Envelope {
    nodes: Vec<Node>,
    bindings: Vec<BindingNode>,
    root: Slot,
}

impl Envelope {
    /// Deep-copy `value` out of the sending process's heap
    pub fn copy(value: Value) -> Result<Self, CopyError> {
        let mut copier = Copier {
            nodes: Vec::new(),
            bindings: Vec::new(),
            seen: FxHashMap::default(),
            seen_bindings: FxHashMap::default(),
        };

        let root = copier.copy_value(value)?;

        Ok(Self {
            nodes: copier.nodes,
            bindings: copier.bindings,
            root,
        })
    }

    /// The number of heap objects materializing this envelope allocates
    pub fn object_count(&self) -> usize {
        self.nodes.len()
    }

    /// Materialize the envelope into `heap`
    ///
    /// The caller reserves room for [`Envelope::object_count`] allocations
    /// beforehand so nothing moves while the graph is being wired up.
    pub fn materialize(&self, heap: &mut LocalHeap) -> Value {
        // Phase one: allocate a skeleton for every node so cyclic references
        // can be resolved, and materialize the binding table.
        let values: Vec<Value> = self
            .nodes
            .iter()
            .map(|node| {
                let kind = match &node.payload {
                    Payload::None => ObjectKind::None,
                    Payload::Float(value) => ObjectKind::Float(*value),
                    Payload::BigInt(value) => ObjectKind::BigInt(*value),
                    Payload::String(value) => ObjectKind::String(value.clone()),
                    Payload::ByteArray(value) => ObjectKind::ByteArray(value.clone()),
                    Payload::Array(_) => ObjectKind::Array(Vec::new()),
                    // Blocks get their binding wired in phase two.
                    Payload::Block { .. } => ObjectKind::None,
                    Payload::Process(id) => ObjectKind::Process(*id),
                };

                heap.allocate(Value::nil(), kind)
            })
            .collect();

        let mut bindings: Vec<Option<RcBinding>> = vec![None; self.bindings.len()];

        for index in 0..self.bindings.len() {
            self.materialize_binding(index, &mut bindings);
        }

        // Phase two: wire up prototypes, attributes, elements and bindings.
        for (index, node) in self.nodes.iter().enumerate() {
            let holder = values[index];
            let prototype = self.resolve(&node.prototype, &values);

            let object = unsafe { holder.object_mut() };

            object.prototype = prototype;
            heap.write_barrier(holder, prototype);

            for (name, slot) in &node.attributes {
                let value = self.resolve(slot, &values);

                unsafe {
                    holder.object_mut().set_attribute(*name, value);
                }

                heap.write_barrier(holder, value);
            }

            match &node.payload {
                Payload::Array(slots) => {
                    for slot in slots {
                        let value = self.resolve(slot, &values);

                        unsafe {
                            if let Some(elements) = holder.object_mut().array_mut() {
                                elements.push(value);
                            }
                        }

                        heap.write_barrier(holder, value);
                    }
                }
                Payload::Block {
                    code,
                    module,
                    receiver,
                    binding,
                } => {
                    let receiver = self.resolve(receiver, &values);
                    let binding = bindings[*binding]
                        .clone()
                        .unwrap_or_else(|| Binding::new(0));

                    unsafe {
                        holder.object_mut().value =
                            ObjectKind::Block(crate::object::Block::new(
                                code.clone(),
                                binding,
                                receiver,
                                *module,
                            ));
                    }

                    heap.write_barrier(holder, receiver);
                }
                _ => {}
            }
        }

        // Binding locals may reference node values.
        for (index, node) in self.bindings.iter().enumerate() {
            if let Some(binding) = &bindings[index] {
                for (slot_index, slot) in node.locals.iter().enumerate() {
                    binding.set_local(slot_index, self.resolve(slot, &values));
                }
            }
        }

        self.resolve(&self.root, &values)
    }

    fn materialize_binding(&self, index: usize, out: &mut Vec<Option<RcBinding>>) -> RcBinding {
        if let Some(existing) = &out[index] {
            return existing.clone();
        }

        let node = &self.bindings[index];
        let locals = node.locals.len() as u16;
        let binding = match node.parent {
            Some(parent) => {
                let parent = self.materialize_binding(parent, out);

                Binding::with_parent(parent, locals)
            }
            None => Binding::new(locals),
        };

        out[index] = Some(binding.clone());
        binding
    }

    fn resolve(&self, slot: &Slot, values: &[Value]) -> Value {
        match slot {
            Slot::Immediate(value) | Slot::Permanent(value) => *value,
            Slot::Node(index) => values[*index],
        }
    }
}

struct Copier {
    nodes: Vec<Node>,
    bindings: Vec<BindingNode>,
    seen: FxHashMap<u64, usize>,
    seen_bindings: FxHashMap<usize, usize>,
}

impl Copier {
    fn copy_value(&mut self, value: Value) -> Result<Slot, CopyError> {
        if value.is_immediate() {
            return Ok(Slot::Immediate(value));
        }

        let object = unsafe { value.object_ref() };

        if object.header.generation() == Generation::Permanent {
            return Ok(Slot::Permanent(value));
        }

        if let Some(&index) = self.seen.get(&value.raw()) {
            return Ok(Slot::Node(index));
        }

        let index = self.nodes.len();

        // Reserve the slot before descending so cycles resolve to it.
        self.nodes.push(Node {
            prototype: Slot::Immediate(Value::nil()),
            attributes: Vec::new(),
            payload: Payload::None,
        });
        self.seen.insert(value.raw(), index);

        let prototype = self.copy_value(object.prototype)?;
        let mut attributes = Vec::new();

        if let Some(table) = &object.attributes {
            for (&name, &attribute) in table.iter() {
                attributes.push((name, self.copy_value(attribute)?));
            }
        }

        let payload = match &object.value {
            ObjectKind::None => Payload::None,
            ObjectKind::Float(value) => Payload::Float(*value),
            ObjectKind::BigInt(value) => Payload::BigInt(*value),
            ObjectKind::String(value) => Payload::String(value.clone()),
            ObjectKind::ByteArray(value) => Payload::ByteArray(value.clone()),
            ObjectKind::Array(values) => {
                let mut slots = Vec::with_capacity(values.len());

                for &element in values.iter() {
                    slots.push(self.copy_value(element)?);
                }

                Payload::Array(slots)
            }
            ObjectKind::Block(block) => Payload::Block {
                code: block.code.clone(),
                module: block.module,
                receiver: self.copy_value(block.receiver)?,
                binding: self.copy_binding(&block.binding)?,
            },
            ObjectKind::Generator(_) => {
                return Err(CopyError::NotSendable("generator"));
            }
            ObjectKind::Process(id) => Payload::Process(*id),
        };

        self.nodes[index].prototype = prototype;
        self.nodes[index].attributes = attributes;
        self.nodes[index].payload = payload;

        Ok(Slot::Node(index))
    }

    fn copy_binding(&mut self, binding: &RcBinding) -> Result<usize, CopyError> {
        let key = Rc::as_ptr(binding) as usize;

        if let Some(&index) = self.seen_bindings.get(&key) {
            return Ok(index);
        }

        let index = self.bindings.len();

        self.bindings.push(BindingNode {
            locals: Vec::new(),
            parent: None,
        });
        self.seen_bindings.insert(key, index);

        let mut locals = Vec::with_capacity(binding.local_count());

        for slot in 0..binding.local_count() {
            locals.push(self.copy_value(binding.get_local(slot))?);
        }

        let parent = match binding.parent() {
            Some(parent) => Some(self.copy_binding(parent)?),
            None => None,
        };

        self.bindings[index].locals = locals;
        self.bindings[index].parent = parent;

        Ok(index)
    }
}
