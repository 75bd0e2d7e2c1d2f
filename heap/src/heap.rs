//! Paged, compacting heap with incremental marking and ephemeron tables.
//!
//! The heap is an explicit context object: every collector operation takes
//! it by reference. Consumers provide:
//! - A [`RootProvider`] to supply external roots at collection time.
//! - Global handles and handle scopes for roots the heap itself tracks.

use object::{Address, HeapObject, Value};

use crate::{
    GlobalHandle, GlobalHandles, HandleState, HeapError, Local, LocalHandles, Marker,
    WeakCallbackInfo, WriteBarrier, space::Space,
};

// ── Public API types ──────────────────────────────────────────────────

/// Consumers implement this to provide GC roots.
///
/// The visitor receives `&mut Value` so the GC can update root pointers in
/// place during object relocation.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// Root provider for embedders that keep every root in handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyRoots;

impl RootProvider for EmptyRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for root in self.iter_mut() {
            visitor(root);
        }
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the heap and its collector.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Object cells per page. Power of two, at most 65536.
    pub page_cells: usize,
    /// Page limit. Allocation past it fails with out-of-memory.
    pub max_pages: usize,
    /// Total slot budget for hash-table backing stores.
    pub max_backing_entries: usize,
    /// Occupancy fraction (0.0 - 1.0) at or below which a page is
    /// evacuated by the default compaction policy.
    pub evacuation_threshold: f64,
    /// Treat every occupied page as an evacuation candidate.
    pub always_compact: bool,
    /// Never evacuate.
    pub never_compact: bool,
    /// Run the heap verifier after every cycle. A failure is fatal.
    pub verify_heap: bool,
    /// Objects scanned per incremental step when no budget is given.
    pub incremental_step_budget: usize,
    /// Seed for identity hashes.
    pub hash_seed: u32,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            page_cells: 256,
            max_pages: 4096,
            max_backing_entries: 1 << 22,
            evacuation_threshold: 0.25,
            always_compact: false,
            never_compact: false,
            verify_heap: cfg!(debug_assertions),
            incremental_step_budget: 64,
            hash_seed: 0x9e37_79b9,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.page_cells == 0 || self.max_pages == 0 {
            return Err("Sizes must be > 0");
        }
        if !self.page_cells.is_power_of_two() {
            return Err("page_cells must be a power of two");
        }
        if self.page_cells > Address::OFFSET_MASK as usize + 1 {
            return Err("page_cells too large for address offset");
        }
        if self.max_pages > Address::MAX_PAGES {
            return Err("max_pages too large for address page index");
        }
        if !(0.0..=1.0).contains(&self.evacuation_threshold) {
            return Err("evacuation_threshold must be between 0.0 and 1.0");
        }
        if self.always_compact && self.never_compact {
            return Err("always_compact and never_compact are exclusive");
        }
        if self.incremental_step_budget == 0 {
            return Err("incremental_step_budget must be > 0");
        }
        Ok(())
    }
}

// ── Backing store budget ──────────────────────────────────────────────

/// Accounting for hash-table slot arrays. A resize charges the new
/// capacity before the old one is released.
#[derive(Debug, Clone, Copy)]
pub struct BackingBudget {
    used: usize,
    limit: usize,
}

impl BackingBudget {
    pub fn new(limit: usize) -> Self {
        Self { used: 0, limit }
    }

    pub fn charge(&mut self, entries: usize) -> Result<(), HeapError> {
        if self.used + entries > self.limit {
            return Err(HeapError::OutOfMemory {
                what: "table backing store",
                requested: entries,
            });
        }
        self.used += entries;
        Ok(())
    }

    pub fn release(&mut self, entries: usize) {
        debug_assert!(entries <= self.used, "backing budget underflow");
        self.used -= entries;
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

pub struct Heap {
    settings: HeapSettings,
    pub(crate) space: Space,
    pub(crate) globals: GlobalHandles,
    pub(crate) locals: LocalHandles,
    pub(crate) barrier: WriteBarrier,
    /// Present while a marking cycle is in progress.
    pub(crate) marker: Option<Marker>,
    pub(crate) budget: BackingBudget,
    pub(crate) in_weak_callbacks: bool,
    pub(crate) cycles: u64,
    hash_state: u32,
}

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings) -> Self {
        settings.validate().expect("Invalid Heap Settings");
        log::debug!("heap created: {settings:?}");

        Self {
            space: Space::new(settings.page_cells, settings.max_pages),
            globals: GlobalHandles::default(),
            locals: LocalHandles::default(),
            barrier: WriteBarrier::default(),
            marker: None,
            budget: BackingBudget::new(settings.max_backing_entries),
            in_weak_callbacks: false,
            cycles: 0,
            hash_state: settings.hash_seed.max(1),
            settings,
        }
    }

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marker.is_some()
    }

    /// Completed collection cycles.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn object_count(&self) -> usize {
        self.space.object_count()
    }

    pub fn page_count(&self) -> usize {
        self.space.page_count()
    }

    pub fn backing_entries(&self) -> usize {
        self.budget.used()
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Places `object` in the space. Objects allocated while marking is in
    /// progress are black and queued for rescan.
    pub fn allocate(&mut self, object: HeapObject) -> Result<Value, HeapError> {
        let address = self.space.allocate(object)?;
        if self.marker.is_some() {
            let header = &self.space.live_object(address).header;
            header.set_color(object::Color::Black);
            self.barrier.record(address, header);
        }
        Ok(Value::from_address(address))
    }

    /// Allocates an ordinary object with `field_count` zeroed fields.
    pub fn allocate_plain(&mut self, field_count: usize) -> Result<Value, HeapError> {
        let hash = self.next_identity_hash();
        self.allocate(HeapObject::plain(field_count, hash))
    }

    /// xorshift32, kept to 30 bits and never zero.
    pub(crate) fn next_identity_hash(&mut self) -> u32 {
        let mut x = self.hash_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.hash_state = x;
        (x & 0x3fff_ffff).max(1)
    }

    // ── Object access ─────────────────────────────────────────────────

    pub fn object(&self, value: Value) -> Option<&HeapObject> {
        self.space.object(value.address()?)
    }

    /// Stable hash of `value`. Objects keep theirs across relocation.
    pub fn identity_hash(&self, value: Value) -> Result<u32, HeapError> {
        match value.address() {
            Some(_) => self
                .object(value)
                .map(|object| object.header.hash())
                .ok_or(HeapError::InvalidReference(value)),
            None => {
                let raw = value.raw();
                Ok(((raw ^ (raw >> 32)) as u32) & 0x3fff_ffff)
            }
        }
    }

    pub fn get_field(&self, object: Value, index: u32) -> Result<Value, HeapError> {
        self.object(object)
            .and_then(|o| o.slot(object::SlotKind::Field(index)))
            .ok_or(HeapError::InvalidSlot { object, slot: index })
    }

    pub fn set_field(&mut self, object: Value, index: u32, value: Value) -> Result<(), HeapError> {
        let address = object
            .address()
            .ok_or(HeapError::InvalidSlot { object, slot: index })?;
        let slot = self
            .space
            .object_mut(address)
            .and_then(|o| o.slot_mut(object::SlotKind::Field(index)))
            .ok_or(HeapError::InvalidSlot { object, slot: index })?;
        *slot = value;
        self.write_barrier(address);
        Ok(())
    }

    // ── Write barrier ─────────────────────────────────────────────────

    /// Call after storing a reference into the object at `holder`.
    #[inline(always)]
    pub(crate) fn write_barrier(&mut self, holder: Address) {
        if self.marker.is_none() {
            return;
        }
        if let Some(object) = self.space.object(holder) {
            self.barrier.record(holder, &object.header);
        }
    }

    // ── Global handles ────────────────────────────────────────────────

    pub fn create_global(&mut self, value: Value) -> GlobalHandle {
        self.globals.create(value)
    }

    /// Current referent, or `None` once the handle was cleared.
    pub fn global(&self, handle: GlobalHandle) -> Result<Option<Value>, HeapError> {
        self.globals.get(handle)
    }

    pub fn global_state(&self, handle: GlobalHandle) -> Result<HandleState, HeapError> {
        self.globals.state(handle)
    }

    pub fn is_weak(&self, handle: GlobalHandle) -> Result<bool, HeapError> {
        self.globals.is_weak(handle)
    }

    /// Demotes `handle` to weak. `callback` runs at most once, after the
    /// cycle that finds the referent unreachable, and receives `parameter`.
    pub fn make_weak(
        &mut self,
        handle: GlobalHandle,
        parameter: usize,
        callback: impl FnOnce(&mut Heap, WeakCallbackInfo) + 'static,
    ) -> Result<(), HeapError> {
        self.globals.make_weak(handle, parameter, Box::new(callback))
    }

    pub fn make_strong(&mut self, handle: GlobalHandle) -> Result<(), HeapError> {
        self.globals.make_strong(handle)
    }

    pub fn destroy_global(&mut self, handle: GlobalHandle) -> Result<(), HeapError> {
        self.globals.destroy(handle)
    }

    // ── Local handles ─────────────────────────────────────────────────

    pub fn local(&self, local: Local) -> Result<Value, HeapError> {
        self.locals.get(local)
    }

    // ── Roots ─────────────────────────────────────────────────────────

    /// Snapshot of every root that keeps its referent alive.
    pub(crate) fn strong_roots(&mut self, external: &mut dyn RootProvider) -> Vec<Value> {
        let mut roots = Vec::new();
        let mut push = |value: &mut Value| roots.push(*value);
        self.globals.visit_strong_roots(&mut push);
        self.locals.visit_roots(&mut push);
        external.visit_roots(&mut push);
        roots
    }
}

impl core::fmt::Debug for Heap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("pages", &self.space.page_count())
            .field("objects", &self.space.object_count())
            .field("globals", &self.globals.len())
            .field("locals", &self.locals.len())
            .field("backing_entries", &self.budget.used())
            .field("marking", &self.is_marking())
            .field("cycles", &self.cycles)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HandleScope;
    use object::ObjectType;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            page_cells: 16,
            max_pages: 8,
            max_backing_entries: 1024,
            verify_heap: true,
            ..HeapSettings::default()
        }
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn test_settings_validation_rejects_bad_values() {
        let mut settings = create_test_settings();
        settings.page_cells = 12;
        assert!(settings.validate().is_err());

        let mut settings = create_test_settings();
        settings.always_compact = true;
        settings.never_compact = true;
        assert!(settings.validate().is_err());

        let mut settings = create_test_settings();
        settings.evacuation_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "Invalid Heap Settings")]
    fn test_heap_rejects_invalid_settings() {
        let _ = Heap::new(HeapSettings {
            max_pages: 0,
            ..HeapSettings::default()
        });
    }

    #[test]
    fn test_allocation_basic() {
        let mut heap = Heap::new(create_test_settings());
        let obj = heap.allocate_plain(2).unwrap();
        assert!(obj.is_ref());
        assert_eq!(heap.object(obj).unwrap().object_type(), ObjectType::Plain);
        assert_eq!(heap.get_field(obj, 1), Ok(Value::ZERO));
        assert_eq!(
            heap.get_field(obj, 2),
            Err(HeapError::InvalidSlot { object: obj, slot: 2 })
        );
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_allocation_fails_when_space_is_exhausted() {
        let mut heap = Heap::new(HeapSettings {
            page_cells: 2,
            max_pages: 1,
            ..create_test_settings()
        });
        heap.allocate_plain(0).unwrap();
        heap.allocate_plain(0).unwrap();
        assert!(matches!(
            heap.allocate_plain(0),
            Err(HeapError::OutOfMemory { what: "object", .. })
        ));
    }

    #[test]
    fn test_identity_hashes_are_stable_and_distinct() {
        let mut heap = Heap::new(create_test_settings());
        let a = heap.allocate_plain(0).unwrap();
        let b = heap.allocate_plain(0).unwrap();
        let ha = heap.identity_hash(a).unwrap();
        assert_eq!(heap.identity_hash(a).unwrap(), ha);
        assert_ne!(ha, heap.identity_hash(b).unwrap());
        assert_ne!(ha, 0);
        assert!(heap.identity_hash(Value::from_i64(3)).is_ok());
    }

    #[test]
    fn test_set_field_stores_value() {
        let mut heap = Heap::new(create_test_settings());
        let holder = heap.allocate_plain(1).unwrap();
        let target = heap.allocate_plain(0).unwrap();
        heap.set_field(holder, 0, target).unwrap();
        assert_eq!(heap.get_field(holder, 0), Ok(target));
        assert!(heap.barrier.is_empty(), "barrier is idle outside marking");
    }

    #[test]
    fn test_backing_budget_limits_charges() {
        let mut budget = BackingBudget::new(64);
        budget.charge(32).unwrap();
        budget.charge(32).unwrap();
        assert_eq!(
            budget.charge(1),
            Err(HeapError::OutOfMemory {
                what: "table backing store",
                requested: 1
            })
        );
        budget.release(32);
        assert_eq!(budget.used(), 32);
    }

    #[test]
    fn test_handle_scopes_pin_and_release() {
        let mut heap = Heap::new(create_test_settings());
        let a = heap.allocate_plain(0).unwrap();
        let b = heap.allocate_plain(0).unwrap();
        {
            let mut outer = HandleScope::new(&mut heap);
            let la = outer.pin(a);
            {
                let mut inner = HandleScope::new(&mut outer);
                let lb = inner.pin(b);
                assert_eq!(inner.local(lb), Ok(b));
                assert_eq!(inner.local(la), Ok(a));
                assert_eq!(inner.len(), 1);
            }
            assert_eq!(outer.len(), 1);
            assert_eq!(outer.local(la), Ok(a));
        }
        let mut roots = Vec::new();
        heap.locals.visit_roots(&mut |v| roots.push(*v));
        assert!(roots.is_empty(), "dropped scopes release their locals");
    }

    #[test]
    fn test_strong_roots_include_globals_locals_and_external() {
        let mut heap = Heap::new(create_test_settings());
        let a = heap.allocate_plain(0).unwrap();
        let b = heap.allocate_plain(0).unwrap();
        let c = heap.allocate_plain(0).unwrap();
        let d = heap.allocate_plain(0).unwrap();
        heap.create_global(a);
        let weak = heap.create_global(d);
        heap.make_weak(weak, 0, |_, _| {}).unwrap();

        let mut scope = HandleScope::new(&mut heap);
        scope.pin(b);
        let mut external = vec![c];
        let roots = scope.strong_roots(&mut external);
        assert_eq!(roots, vec![a, b, c]);
    }
}
