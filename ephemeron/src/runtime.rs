use heap::{
    GcStats, GlobalHandle, HandleState, Heap, HeapError, HeapSettings, StepResult,
    WeakCallbackInfo,
};
use object::{TableSize, Value};

/// Embedder-facing runtime: a heap plus an operand stack of external roots.
///
/// Keys are hashed by identity, so callers never supply hashes here. The
/// hash-taking operations live on [`Heap`].
pub struct Runtime {
    pub heap: Heap,
    /// External roots, handed to the collector on every cycle.
    pub stack: Vec<Value>,
}

impl Runtime {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            heap: Heap::new(settings),
            stack: Vec::new(),
        }
    }

    // ── Roots ─────────────────────────────────────────────────────────

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    /// Root at `depth` from the top. Follows relocation.
    pub fn peek(&self, depth: usize) -> Option<Value> {
        let index = self.stack.len().checked_sub(depth + 1)?;
        self.stack.get(index).copied()
    }

    // ── Objects ───────────────────────────────────────────────────────

    pub fn allocate_object(&mut self, fields: &[Value]) -> Result<Value, HeapError> {
        let object = self.heap.allocate_plain(fields.len())?;
        for (index, &field) in fields.iter().enumerate() {
            self.heap.set_field(object, index as u32, field)?;
        }
        Ok(object)
    }

    pub fn field(&self, object: Value, index: u32) -> Result<Value, HeapError> {
        self.heap.get_field(object, index)
    }

    pub fn set_field(&mut self, object: Value, index: u32, value: Value) -> Result<(), HeapError> {
        self.heap.set_field(object, index, value)
    }

    // ── Weak collections ──────────────────────────────────────────────

    pub fn create_weak_collection(&mut self) -> Result<Value, HeapError> {
        self.heap.create_weak_collection()
    }

    pub fn weak_collection_set(
        &mut self,
        collection: Value,
        key: Value,
        value: Value,
    ) -> Result<(), HeapError> {
        let hash = self.heap.identity_hash(key)?;
        self.heap.weak_collection_set(collection, key, value, hash)
    }

    pub fn weak_collection_get(
        &self,
        collection: Value,
        key: Value,
    ) -> Result<Option<Value>, HeapError> {
        let hash = self.heap.identity_hash(key)?;
        self.heap.weak_collection_get(collection, key, hash)
    }

    pub fn weak_collection_has(&self, collection: Value, key: Value) -> Result<bool, HeapError> {
        let hash = self.heap.identity_hash(key)?;
        self.heap.weak_collection_has(collection, key, hash)
    }

    pub fn weak_collection_delete(
        &mut self,
        collection: Value,
        key: Value,
    ) -> Result<bool, HeapError> {
        let hash = self.heap.identity_hash(key)?;
        self.heap.weak_collection_delete(collection, key, hash)
    }

    pub fn weak_collection_size(&self, collection: Value) -> Result<TableSize, HeapError> {
        self.heap.weak_collection_size(collection)
    }

    // ── Handles ───────────────────────────────────────────────────────

    pub fn create_global(&mut self, value: Value) -> GlobalHandle {
        self.heap.create_global(value)
    }

    pub fn global(&self, handle: GlobalHandle) -> Result<Option<Value>, HeapError> {
        self.heap.global(handle)
    }

    pub fn global_state(&self, handle: GlobalHandle) -> Result<HandleState, HeapError> {
        self.heap.global_state(handle)
    }

    /// Demotes `handle` to weak. `callback` runs at most once, after the
    /// cycle that finds the referent unreachable.
    pub fn make_handle_weak(
        &mut self,
        handle: GlobalHandle,
        parameter: usize,
        callback: impl FnOnce(&mut Heap, WeakCallbackInfo) + 'static,
    ) -> Result<(), HeapError> {
        self.heap.make_weak(handle, parameter, callback)
    }

    pub fn destroy_global(&mut self, handle: GlobalHandle) -> Result<(), HeapError> {
        self.heap.destroy_global(handle)
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Runs one full cycle. Incremental marking in progress is aborted.
    pub fn run_collection(&mut self, full_compaction: bool) -> GcStats {
        self.heap.collect_garbage(&mut self.stack, full_compaction)
    }

    pub fn start_incremental_marking(&mut self) {
        self.heap.start_incremental_marking(&mut self.stack);
    }

    pub fn incremental_marking_step(&mut self, budget: usize) -> StepResult {
        self.heap.incremental_marking_step(budget)
    }

    pub fn abort_incremental_marking(&mut self) {
        self.heap.abort_incremental_marking();
    }

    pub fn simulate_incremental_marking(&mut self) {
        self.heap.simulate_incremental_marking(&mut self.stack);
    }

    pub fn finish_incremental_collection(&mut self) -> GcStats {
        self.heap.finish_incremental_collection(&mut self.stack)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(HeapSettings::default())
    }
}
