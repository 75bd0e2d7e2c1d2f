//! Global and local root handles.
//!
//! Globals are embedder-owned roots that can be demoted to weak with a
//! one-shot callback. Locals are pinned by a [`HandleScope`] and released
//! when the scope drops.

use core::ops::{Deref, DerefMut};

use object::Value;

use crate::{Heap, HeapError};

/// Invoked once after the cycle that found the referent unreachable.
/// May allocate through the heap; must not start a collection.
pub type WeakCallback = Box<dyn FnOnce(&mut Heap, WeakCallbackInfo)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakCallbackInfo {
    pub handle: GlobalHandle,
    pub parameter: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Strong,
    Weak,
    /// Referent found dead this cycle; retained until callbacks run.
    Pending,
    Cleared,
}

struct Node {
    value: Value,
    state: HandleState,
    generation: u32,
    in_use: bool,
    parameter: usize,
    callback: Option<WeakCallback>,
}

pub(crate) struct PendingCallback {
    pub info: WeakCallbackInfo,
    pub callback: WeakCallback,
}

#[derive(Default)]
pub struct GlobalHandles {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

impl GlobalHandles {
    pub fn create(&mut self, value: Value) -> GlobalHandle {
        if let Some(index) = self.free.pop() {
            let node = &mut self.nodes[index as usize];
            node.value = value;
            node.state = HandleState::Strong;
            node.in_use = true;
            return GlobalHandle {
                index,
                generation: node.generation,
            };
        }
        self.nodes.push(Node {
            value,
            state: HandleState::Strong,
            generation: 0,
            in_use: true,
            parameter: 0,
            callback: None,
        });
        GlobalHandle {
            index: self.nodes.len() as u32 - 1,
            generation: 0,
        }
    }

    fn node(&self, handle: GlobalHandle) -> Result<&Node, HeapError> {
        self.nodes
            .get(handle.index as usize)
            .filter(|n| n.in_use && n.generation == handle.generation)
            .ok_or(HeapError::InvalidHandle)
    }

    fn node_mut(&mut self, handle: GlobalHandle) -> Result<&mut Node, HeapError> {
        self.nodes
            .get_mut(handle.index as usize)
            .filter(|n| n.in_use && n.generation == handle.generation)
            .ok_or(HeapError::InvalidHandle)
    }

    /// Current referent, or `None` once the collector cleared the handle.
    pub fn get(&self, handle: GlobalHandle) -> Result<Option<Value>, HeapError> {
        let node = self.node(handle)?;
        Ok((node.state != HandleState::Cleared).then_some(node.value))
    }

    pub fn state(&self, handle: GlobalHandle) -> Result<HandleState, HeapError> {
        Ok(self.node(handle)?.state)
    }

    pub fn is_weak(&self, handle: GlobalHandle) -> Result<bool, HeapError> {
        Ok(matches!(
            self.node(handle)?.state,
            HandleState::Weak | HandleState::Pending
        ))
    }

    pub fn make_weak(
        &mut self,
        handle: GlobalHandle,
        parameter: usize,
        callback: WeakCallback,
    ) -> Result<(), HeapError> {
        let node = self.node_mut(handle)?;
        match node.state {
            HandleState::Strong | HandleState::Weak => {
                node.state = HandleState::Weak;
                node.parameter = parameter;
                node.callback = Some(callback);
                Ok(())
            }
            HandleState::Pending | HandleState::Cleared => Err(HeapError::InvalidHandle),
        }
    }

    /// Turns a weak handle back into a strong root, dropping its callback.
    pub fn make_strong(&mut self, handle: GlobalHandle) -> Result<(), HeapError> {
        let node = self.node_mut(handle)?;
        if node.state != HandleState::Weak {
            return Err(HeapError::InvalidHandle);
        }
        node.state = HandleState::Strong;
        node.callback = None;
        Ok(())
    }

    pub fn destroy(&mut self, handle: GlobalHandle) -> Result<(), HeapError> {
        let node = self.node_mut(handle)?;
        node.in_use = false;
        node.generation = node.generation.wrapping_add(1);
        node.value = Value::ZERO;
        node.callback = None;
        node.state = HandleState::Cleared;
        self.free.push(handle.index);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Collector interface ───────────────────────────────────────────

    /// Roots that keep their referent alive: strong and pending handles.
    pub(crate) fn visit_strong_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for node in self.nodes.iter_mut().filter(|n| n.in_use) {
            if matches!(node.state, HandleState::Strong | HandleState::Pending) {
                visitor(&mut node.value);
            }
        }
    }

    /// Referents of every handle that was not cleared.
    pub(crate) fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.nodes
            .iter()
            .filter(|n| n.in_use && n.state != HandleState::Cleared)
            .map(|n| n.value)
    }

    /// Every stored referent, weak ones included. Used for relocation.
    pub(crate) fn visit_all_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for node in self.nodes.iter_mut().filter(|n| n.in_use) {
            if node.state != HandleState::Cleared {
                visitor(&mut node.value);
            }
        }
    }

    /// Moves weak handles whose referent is dead to pending and returns the
    /// referents, which the collector keeps alive for the rest of the cycle.
    pub(crate) fn mark_dying(&mut self, is_live: &dyn Fn(Value) -> bool) -> Vec<Value> {
        let mut dying = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.in_use) {
            if node.state == HandleState::Weak && node.value.is_ref() && !is_live(node.value) {
                node.state = HandleState::Pending;
                dying.push(node.value);
            }
        }
        dying
    }

    /// Clears every pending handle and hands out its callback.
    pub(crate) fn take_pending(&mut self) -> Vec<PendingCallback> {
        let mut pending = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if !node.in_use || node.state != HandleState::Pending {
                continue;
            }
            let Some(callback) = node.callback.take() else {
                panic!("fatal: weak callback for handle {index} fired twice");
            };
            node.state = HandleState::Cleared;
            node.value = Value::ZERO;
            pending.push(PendingCallback {
                info: WeakCallbackInfo {
                    handle: GlobalHandle {
                        index: index as u32,
                        generation: node.generation,
                    },
                    parameter: node.parameter,
                },
                callback,
            });
        }
        pending
    }
}

// ── Local handles ─────────────────────────────────────────────────────

/// A value pinned by a [`HandleScope`].
///
/// The generation tells a reused slot apart from the one this handle named,
/// so a handle that outlives its scope reads as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Local {
    index: usize,
    generation: u32,
}

#[derive(Debug, Default)]
pub struct LocalHandles {
    slots: Vec<Value>,
    generations: Vec<u32>,
    next_generation: u32,
}

impl LocalHandles {
    pub(crate) fn get(&self, local: Local) -> Result<Value, HeapError> {
        match self.generations.get(local.index) {
            Some(&generation) if generation == local.generation => Ok(self.slots[local.index]),
            _ => Err(HeapError::InvalidHandle),
        }
    }

    fn push(&mut self, value: Value) -> Local {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.slots.push(value);
        self.generations.push(generation);
        Local {
            index: self.slots.len() - 1,
            generation,
        }
    }

    fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
        self.generations.truncate(len);
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().copied()
    }

    pub(crate) fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for slot in &mut self.slots {
            visitor(slot);
        }
    }
}

/// Pins values as roots for its lifetime.
///
/// Scopes nest by borrowing the enclosing scope mutably; dropping one
/// releases exactly the locals it created, including on unwind.
pub struct HandleScope<'h> {
    heap: &'h mut Heap,
    base: usize,
}

impl<'h> HandleScope<'h> {
    pub fn new(heap: &'h mut Heap) -> Self {
        let base = heap.locals.len();
        Self { heap, base }
    }

    pub fn pin(&mut self, value: Value) -> Local {
        self.heap.locals.push(value)
    }

    /// Locals created by this scope and still alive.
    pub fn len(&self) -> usize {
        self.heap.locals.len() - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for HandleScope<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for HandleScope<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        self.heap.locals.truncate(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapSettings;
    use object::Address;
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;

    fn r(n: usize) -> Value {
        Value::from_address(Address::new(0, n))
    }

    fn noop() -> WeakCallback {
        Box::new(|_: &mut Heap, _: WeakCallbackInfo| {})
    }

    #[test]
    fn test_create_get_destroy() {
        let mut globals = GlobalHandles::default();
        let h = globals.create(r(1));
        assert_eq!(globals.get(h), Ok(Some(r(1))));
        assert_eq!(globals.is_weak(h), Ok(false));
        globals.destroy(h).unwrap();
        assert_eq!(globals.get(h), Err(HeapError::InvalidHandle));
        assert!(globals.is_empty());

        let reused = globals.create(r(2));
        assert_ne!(reused, h, "stale handle must not alias a reused node");
        assert_eq!(globals.get(h), Err(HeapError::InvalidHandle));
    }

    #[test]
    fn test_weak_handles_are_not_strong_roots() {
        let mut globals = GlobalHandles::default();
        let strong = globals.create(r(1));
        let weak = globals.create(r(2));
        globals.make_weak(weak, 0, noop()).unwrap();
        assert_eq!(globals.is_weak(weak), Ok(true));

        let mut seen = Vec::new();
        globals.visit_strong_roots(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![r(1)]);

        let mut all = Vec::new();
        globals.visit_all_roots(&mut |v| all.push(*v));
        assert_eq!(all, vec![r(1), r(2)]);

        globals.make_strong(weak).unwrap();
        assert_eq!(globals.is_weak(weak), Ok(false));
        let _ = strong;
    }

    #[test]
    fn test_dying_handles_move_to_pending_then_cleared() {
        let mut globals = GlobalHandles::default();
        let h = globals.create(r(3));
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        globals
            .make_weak(h, 1234, Box::new(move |_: &mut Heap, info: WeakCallbackInfo| {
                assert_eq!(info.parameter, 1234);
                counter.set(counter.get() + 1);
            }))
            .unwrap();

        let dying = globals.mark_dying(&|_| false);
        assert_eq!(dying, vec![r(3)]);
        assert_eq!(globals.state(h), Ok(HandleState::Pending));

        let mut seen = Vec::new();
        globals.visit_strong_roots(&mut |v| seen.push(*v));
        assert_eq!(seen, vec![r(3)], "pending referents are retained");

        let pending = globals.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].info.handle, h);
        assert_eq!(globals.get(h), Ok(None));
        assert!(globals.mark_dying(&|_| false).is_empty());
        assert!(globals.take_pending().is_empty());
        assert_eq!(fired.get(), 0, "callbacks run only when invoked");
    }

    #[test]
    fn test_live_weak_referents_stay_weak() {
        let mut globals = GlobalHandles::default();
        let h = globals.create(r(4));
        globals.make_weak(h, 0, noop()).unwrap();
        assert!(globals.mark_dying(&|_| true).is_empty());
        assert_eq!(globals.state(h), Ok(HandleState::Weak));
    }

    #[test]
    fn test_fixnum_referents_never_die() {
        let mut globals = GlobalHandles::default();
        let h = globals.create(Value::from_i64(5));
        globals.make_weak(h, 0, noop()).unwrap();
        assert!(globals.mark_dying(&|_| false).is_empty());
    }

    fn create_test_heap() -> Heap {
        Heap::new(HeapSettings {
            page_cells: 16,
            max_pages: 16,
            verify_heap: true,
            ..HeapSettings::default()
        })
    }

    #[test]
    fn test_scope_releases_locals_on_unwind() {
        let mut heap = create_test_heap();
        let object = heap.allocate_plain(0).unwrap();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut scope = HandleScope::new(&mut heap);
            scope.pin(object);
            assert_eq!(scope.len(), 1);
            panic!("unwinding out of the scope");
        }));
        assert!(result.is_err());
        assert_eq!(heap.locals.len(), 0);

        let mut roots: Vec<Value> = Vec::new();
        let stats = heap.collect_garbage(&mut roots, false);
        assert_eq!(stats.swept, 1);
        assert!(heap.object(object).is_none());
    }

    #[test]
    fn test_local_from_finished_scope_is_invalid() {
        let mut heap = create_test_heap();
        let a = heap.allocate_plain(0).unwrap();
        let b = heap.allocate_plain(0).unwrap();

        let mut outer = HandleScope::new(&mut heap);
        let stale = {
            let mut inner = HandleScope::new(&mut outer);
            let local = inner.pin(a);
            assert_eq!(inner.local(local), Ok(a));
            local
        };
        let fresh = outer.pin(b);
        assert_eq!(outer.local(fresh), Ok(b));
        assert_eq!(outer.local(stale), Err(HeapError::InvalidHandle));
    }
}
