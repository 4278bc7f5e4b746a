//! The object heap: allocation, string interning, and mark-and-sweep
//! collection.
//!
//! Objects live in an arena of slots addressed by [`ObjRef`] handles; slots
//! freed by the sweep go onto a free list and are reused by later
//! allocations. Handle identity is object identity, which (together with
//! interning) makes string equality a handle comparison.
//!
//! The heap itself never decides *when* to collect; it only reports
//! [`Heap::should_collect`]. The VM calls it at allocation boundaries,
//! marks its roots into the gray worklist, and then asks the heap to trace
//! and sweep. This keeps every root enumerable by the single mutator.

use std::collections::HashMap;

use crate::object::{hash_str, Obj, ObjStr, Upvalue};
use crate::value::{ObjRef, Value};

/// Initial collection threshold; doubled from live bytes after every cycle.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

struct Slot {
    obj: Obj,
    marked: bool,
    size: usize,
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Intern pool. Weak: entries whose strings die in a sweep are removed.
    interns: HashMap<Box<str>, ObjRef>,
    /// Marked-but-unscanned objects awaiting tracing.
    gray: Vec<ObjRef>,
    pub(crate) bytes_allocated: usize,
    next_gc: usize,
    /// Cleared while the VM builds structures not yet reachable from roots
    /// (bootstrap, compilation), so an allocation can never reclaim them.
    pub(crate) gc_enabled: bool,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            interns: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gc_enabled: false,
        }
    }

    // -----------------------------------------------------------------------
    // Allocation and interning
    // -----------------------------------------------------------------------

    /// Place `obj` in the arena. The caller (the VM) is responsible for
    /// checking [`Heap::should_collect`] *before* allocating so the new
    /// object cannot be swept while still unrooted.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = object_size(&obj);
        self.bytes_allocated += size;
        let slot = Slot { obj, marked: false, size };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Return the canonical handle for `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if let Some(&existing) = self.interns.get(text) {
            return existing;
        }
        let handle = self.alloc(Obj::Str(ObjStr {
            chars: text.into(),
            hash: hash_str(text),
        }));
        self.interns.insert(text.into(), handle);
        handle
    }

    pub fn should_collect(&self) -> bool {
        self.gc_enabled && self.bytes_allocated > self.next_gc
    }

    // -----------------------------------------------------------------------
    // Access
    // -----------------------------------------------------------------------

    pub fn get(&self, handle: ObjRef) -> &Obj {
        &self.slots[handle.0 as usize].as_ref().expect("stale handle").obj
    }

    pub fn get_mut(&mut self, handle: ObjRef) -> &mut Obj {
        &mut self.slots[handle.0 as usize].as_mut().expect("stale handle").obj
    }

    pub fn str_value(&self, handle: ObjRef) -> &str {
        match self.get(handle) {
            Obj::Str(s) => &s.chars,
            _ => unreachable!("handle does not refer to a string"),
        }
    }

    pub fn str_hash(&self, handle: ObjRef) -> u32 {
        match self.get(handle) {
            Obj::Str(s) => s.hash,
            _ => unreachable!("handle does not refer to a string"),
        }
    }

    pub fn upvalue(&self, handle: ObjRef) -> Upvalue {
        match self.get(handle) {
            Obj::Upvalue(u) => *u,
            _ => unreachable!("handle does not refer to an upvalue"),
        }
    }

    pub fn set_upvalue(&mut self, handle: ObjRef, upvalue: Upvalue) {
        match self.get_mut(handle) {
            Obj::Upvalue(u) => *u = upvalue,
            _ => unreachable!("handle does not refer to an upvalue"),
        }
    }

    /// Language `==`: same tag, identity for heap objects except lists,
    /// which compare elementwise.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => {
                if ra == rb {
                    return true;
                }
                match (self.get(ra), self.get(rb)) {
                    (Obj::List(la), Obj::List(lb)) => {
                        la.items.len() == lb.items.len()
                            && la
                                .items
                                .iter()
                                .zip(&lb.items)
                                .all(|(&x, &y)| self.values_equal(x, y))
                    }
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    /// The `typeof` name of a value.
    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Obj(handle) => self.get(handle).type_name(),
        }
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    pub fn mark_object(&mut self, handle: ObjRef) {
        let slot = self.slots[handle.0 as usize].as_mut().expect("stale handle");
        if !slot.marked {
            slot.marked = true;
            self.gray.push(handle);
        }
    }

    pub fn mark_table(&mut self, table: &crate::table::Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drain the gray worklist, marking every object reachable from the
    /// already-marked set.
    pub fn trace_references(&mut self) {
        let mut children: Vec<Value> = Vec::new();
        while let Some(handle) = self.gray.pop() {
            children.clear();
            collect_children(self.get(handle), &mut children);
            for &child in &children {
                self.mark_value(child);
            }
        }
    }

    /// Drop intern entries for unmarked strings, free every unmarked slot,
    /// clear the marks on survivors, and reset the growth threshold.
    /// Returns `(objects_freed, bytes_freed)`.
    pub fn sweep(&mut self) -> (usize, usize) {
        let slots = &self.slots;
        self.interns.retain(|_, handle| {
            slots[handle.0 as usize]
                .as_ref()
                .is_some_and(|slot| slot.marked)
        });

        let mut freed = 0usize;
        let mut freed_bytes = 0usize;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    freed += 1;
                    freed_bytes += slot.size;
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_gc = self.bytes_allocated * 2;
        (freed, freed_bytes)
    }

    #[cfg(test)]
    pub(crate) fn live_objects(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

/// Push every value directly referenced by `obj` into `out`.
fn collect_children(obj: &Obj, out: &mut Vec<Value>) {
    match obj {
        Obj::Str(_) => {}
        Obj::List(list) => out.extend_from_slice(&list.items),
        Obj::Function(function) => {
            if let Some(name) = function.name {
                out.push(Value::Obj(name));
            }
            out.extend_from_slice(&function.chunk.constants);
        }
        Obj::Closure(closure) => {
            out.push(Value::Obj(closure.function));
            out.extend(closure.upvalues.iter().map(|&u| Value::Obj(u)));
        }
        Obj::Upvalue(Upvalue::Closed(value)) => out.push(*value),
        Obj::Upvalue(Upvalue::Open(_)) => {}
        Obj::Class(class) => {
            out.push(Value::Obj(class.name));
            if let Some(superclass) = class.superclass {
                out.push(Value::Obj(superclass));
            }
            for (key, value) in class.methods.iter() {
                out.push(Value::Obj(key));
                out.push(value);
            }
        }
        Obj::Instance(instance) => {
            out.push(Value::Obj(instance.class));
            for (key, value) in instance.fields.iter() {
                out.push(Value::Obj(key));
                out.push(value);
            }
        }
        Obj::BoundMethod(bound) => {
            out.push(bound.receiver);
            out.push(Value::Obj(bound.method));
        }
        Obj::Native(native) => {
            out.push(Value::Obj(native.name));
            if let Some(receiver) = native.receiver {
                out.push(receiver);
            }
        }
    }
}

/// A size estimate for GC accounting: the enum footprint plus the owned
/// payload we can see without chasing handles.
fn object_size(obj: &Obj) -> usize {
    let base = std::mem::size_of::<Obj>();
    base + match obj {
        Obj::Str(s) => s.chars.len(),
        Obj::List(list) => list.items.capacity() * std::mem::size_of::<Value>(),
        Obj::Function(function) => {
            function.chunk.code.len()
                + function.chunk.constants.len() * std::mem::size_of::<Value>()
        }
        Obj::Closure(closure) => closure.upvalues.len() * std::mem::size_of::<ObjRef>(),
        Obj::Upvalue(_) => 0,
        Obj::Class(class) => class.methods.len() * 24,
        Obj::Instance(instance) => instance.fields.len() * 24,
        Obj::BoundMethod(_) => 0,
        Obj::Native(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjList;

    #[test]
    fn interning_is_identity() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_value(a), "hello");
    }

    #[test]
    fn sweep_frees_unreachable_and_reuses_slots() {
        let mut heap = Heap::new();
        let kept = heap.alloc(Obj::List(ObjList { items: vec![Value::Number(1.0)] }));
        let _dead = heap.alloc(Obj::List(ObjList { items: Vec::new() }));
        heap.mark_object(kept);
        heap.trace_references();
        let (freed, _) = heap.sweep();
        assert_eq!(freed, 1);
        assert_eq!(heap.live_objects(), 1);
        // The freed slot is recycled by the next allocation.
        let reused = heap.alloc(Obj::List(ObjList { items: Vec::new() }));
        assert_eq!(heap.live_objects(), 2);
        assert_ne!(reused, kept);
    }

    #[test]
    fn list_marking_traces_elements() {
        let mut heap = Heap::new();
        let elem = heap.intern("elem");
        let list = heap.alloc(Obj::List(ObjList { items: vec![Value::Obj(elem)] }));
        heap.mark_object(list);
        heap.trace_references();
        heap.sweep();
        // Both the list and its element survive.
        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.str_value(elem), "elem");
    }

    #[test]
    fn intern_pool_is_weak() {
        let mut heap = Heap::new();
        let doomed = heap.intern("doomed");
        heap.trace_references();
        heap.sweep();
        // The entry is gone; re-interning the same text allocates afresh.
        let again = heap.intern("doomed");
        assert_ne!(doomed, again);
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn threshold_doubles_from_live_bytes() {
        let mut heap = Heap::new();
        let kept = heap.alloc(Obj::Str(ObjStr {
            chars: "keep".into(),
            hash: hash_str("keep"),
        }));
        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.next_gc, heap.bytes_allocated * 2);
        assert!(heap.bytes_allocated > 0);
    }
}
