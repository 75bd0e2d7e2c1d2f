//! Collection orchestrator.
//!
//! One cycle runs: mark (atomically or in incremental steps) -> weak handle
//! processing -> weak table processing -> evacuation and fix-up -> sweep ->
//! verification -> weak callbacks. Marking may be aborted at any step
//! boundary; everything after it runs to completion once started.

use object::HeapObject;

use crate::{
    BackingBudget, Heap, Marker, RootProvider, StepResult,
    compactor::{self, CompactionMode},
    handles::PendingCallback,
    marker::is_live,
    verify::verify_heap,
};

/// Per-cycle statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub marked: usize,
    pub ephemeron_promotions: usize,
    pub cleared_entries: usize,
    pub cleared_handles: usize,
    pub candidates: usize,
    pub evacuated: usize,
    pub updated_slots: usize,
    pub swept: usize,
    pub shrunk_tables: usize,
}

fn release_backing(budget: &mut BackingBudget, object: &HeapObject) {
    if let Some(table) = object.as_table() {
        budget.release(table.capacity());
    }
}

impl Heap {
    #[inline]
    fn assert_not_in_callbacks(&self) {
        assert!(
            !self.in_weak_callbacks,
            "fatal: collection re-entered from a weak callback"
        );
    }

    fn compaction_mode(&self, full_compaction: bool) -> CompactionMode {
        let settings = self.settings();
        if settings.never_compact {
            CompactionMode::Never
        } else if full_compaction || settings.always_compact {
            CompactionMode::Full
        } else {
            CompactionMode::Policy
        }
    }

    /// Selects candidates and greys the roots.
    fn begin_marking(&mut self, roots: &mut dyn RootProvider, mode: CompactionMode) -> Marker {
        let threshold = self.settings().evacuation_threshold;
        let candidates = compactor::select_candidates(&mut self.space, mode, threshold);
        let mut marker = Marker::new(candidates > 0);
        for root in self.strong_roots(roots) {
            marker.mark_value(&self.space, root);
        }
        log::debug!(
            "marking started: {} objects, {candidates} candidates",
            self.space.object_count()
        );
        marker
    }

    // ── Full collection ───────────────────────────────────────────────

    /// Runs a complete cycle. In-flight incremental marking is aborted
    /// first so the cycle starts from an all-white heap.
    pub fn collect_garbage(
        &mut self,
        roots: &mut dyn RootProvider,
        full_compaction: bool,
    ) -> GcStats {
        self.assert_not_in_callbacks();
        if self.is_marking() {
            log::debug!("aborting incremental marking before full collection");
            self.abort_incremental_marking();
        }
        let mode = self.compaction_mode(full_compaction);
        let marker = self.begin_marking(roots, mode);
        self.finish(marker, roots)
    }

    // ── Incremental marking ───────────────────────────────────────────

    pub fn start_incremental_marking(&mut self, roots: &mut dyn RootProvider) {
        self.assert_not_in_callbacks();
        if self.is_marking() {
            return;
        }
        let mode = self.compaction_mode(false);
        let marker = self.begin_marking(roots, mode);
        self.marker = Some(marker);
    }

    /// Scans at most `budget` objects. Returns [`StepResult::Done`] when no
    /// marking is in progress.
    pub fn incremental_marking_step(&mut self, budget: usize) -> StepResult {
        match self.marker.as_mut() {
            Some(marker) => marker.step(&self.space, budget),
            None => StepResult::Done,
        }
    }

    /// Discards all marking progress: colors, worklist, discovered tables,
    /// promotions, recorded slots and candidate selection.
    pub fn abort_incremental_marking(&mut self) {
        if self.marker.take().is_none() {
            return;
        }
        self.space
            .for_each_object(|_, object| object.header.reset_mark_state());
        self.barrier.clear();
        self.space.clear_candidates();
        log::debug!("incremental marking aborted");
    }

    /// Starts marking and steps it to the fixpoint without finishing.
    pub fn simulate_incremental_marking(&mut self, roots: &mut dyn RootProvider) {
        self.start_incremental_marking(roots);
        let budget = self.settings().incremental_step_budget;
        while self.incremental_marking_step(budget) == StepResult::MoreWork {}
    }

    /// Completes the cycle using the incremental marking state, starting
    /// one if none is in progress.
    pub fn finish_incremental_collection(&mut self, roots: &mut dyn RootProvider) -> GcStats {
        self.assert_not_in_callbacks();
        let marker = match self.marker.take() {
            Some(marker) => marker,
            None => {
                let mode = self.compaction_mode(false);
                self.begin_marking(roots, mode)
            }
        };
        self.finish(marker, roots)
    }

    // ── Finalization ──────────────────────────────────────────────────

    fn finish(&mut self, mut marker: Marker, roots: &mut dyn RootProvider) -> GcStats {
        let mut stats = GcStats {
            candidates: self.space.candidates().len(),
            ..GcStats::default()
        };

        // Roots may have changed since marking started, and holders
        // recorded by the barrier may carry edges the marker never saw.
        for root in self.strong_roots(roots) {
            marker.mark_value(&self.space, root);
        }
        for holder in self.barrier.take() {
            marker.rescan(&self.space, holder);
        }
        marker.drain(&self.space);

        // Weak handles: dying referents stay alive for the rest of this
        // cycle, so entries they key survive until the next one.
        let space = &self.space;
        let dying = self.globals.mark_dying(&|value| is_live(space, value));
        for &value in &dying {
            marker.mark_value(&self.space, value);
        }
        marker.drain(&self.space);
        stats.cleared_handles = dying.len();
        stats.marked = marker.marked();
        stats.ephemeron_promotions = marker.promotions();

        let tables = marker.tables().to_vec();
        self.process_weak_tables(&tables, &mut stats);

        let mut slots = std::mem::take(&mut marker.slots);
        if stats.candidates > 0 {
            if compactor::evacuation_fits(&self.space) {
                compactor::record_table_slots(&self.space, &tables, &mut slots);
                stats.evacuated = compactor::evacuate(&mut self.space);
                stats.updated_slots = compactor::update_slots(&mut self.space, &slots);
                self.update_roots(roots);
            } else {
                log::warn!("evacuation skipped: not enough free cells");
                self.space.clear_candidates();
                stats.candidates = 0;
            }
        }

        let budget = &mut self.budget;
        stats.swept = self.space.sweep(&mut |object| release_backing(budget, object));
        stats.swept += self
            .space
            .release_candidates(&mut |object| release_backing(budget, object));

        self.cycles += 1;
        log::info!(
            "gc #{}: marked {} promoted {} cleared {} entries / {} handles, \
             evacuated {} ({} slots), swept {}, shrunk {} tables",
            self.cycles,
            stats.marked,
            stats.ephemeron_promotions,
            stats.cleared_entries,
            stats.cleared_handles,
            stats.evacuated,
            stats.updated_slots,
            stats.swept,
            stats.shrunk_tables,
        );

        if self.settings().verify_heap {
            if let Err(err) = verify_heap(self) {
                panic!("fatal: {err}");
            }
        }

        self.run_weak_callbacks();
        stats
    }

    /// Shrinks sparse tables and tombstones entries whose key is dead.
    ///
    /// The shrink runs first and carries every entry, so capacity is sized
    /// from the survivors while the doomed entries still fit.
    fn process_weak_tables(&mut self, tables: &[object::Address], stats: &mut GcStats) {
        for &address in tables {
            let (dead, resize) = {
                let Some(table) = self.space.object(address).and_then(|o| o.as_table()) else {
                    continue;
                };
                let dead: Vec<_> = table
                    .iter()
                    .filter(|&(_, key, _, _)| !is_live(&self.space, key))
                    .map(|(_, key, _, hash)| (key, hash))
                    .collect();
                let survivors = table.element_count() - dead.len();
                let resize = table
                    .shrink_capacity(survivors)
                    .map(|capacity| (table.capacity(), capacity));
                (dead, resize)
            };

            let Some(table) = self
                .space
                .object_mut(address)
                .and_then(|o| o.as_table_mut())
            else {
                continue;
            };
            if let Some((old, new)) = resize {
                match self.budget.charge(new) {
                    Ok(()) => {
                        table.rehash(new);
                        self.budget.release(old);
                        stats.shrunk_tables += 1;
                        log::trace!("shrunk table {address:?} {old} -> {new}");
                    }
                    Err(err) => log::warn!("skipping shrink of table {address:?}: {err}"),
                }
            }
            stats.cleared_entries += dead.len();
            for (key, hash) in dead {
                table.remove(key, hash);
            }
        }
    }

    fn update_roots(&mut self, roots: &mut dyn RootProvider) {
        let space = &self.space;
        self.globals
            .visit_all_roots(&mut |value| compactor::forward(space, value));
        self.locals
            .visit_roots(&mut |value| compactor::forward(space, value));
        compactor::update_roots(space, roots);
    }

    fn run_weak_callbacks(&mut self) {
        let pending = self.globals.take_pending();
        if pending.is_empty() {
            return;
        }
        log::debug!("running {} weak callbacks", pending.len());
        self.in_weak_callbacks = true;
        for PendingCallback { info, callback } in pending {
            callback(self, info);
        }
        self.in_weak_callbacks = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmptyRoots, HandleScope, HeapSettings};
    use object::{Color, Value};
    use std::cell::Cell;
    use std::rc::Rc;

    fn create_test_settings() -> HeapSettings {
        HeapSettings {
            page_cells: 16,
            max_pages: 64,
            max_backing_entries: 4096,
            verify_heap: true,
            ..HeapSettings::default()
        }
    }

    fn create_test_env() -> (Heap, Vec<Value>) {
        (Heap::new(create_test_settings()), Vec::new())
    }

    #[test]
    fn test_unreachable_objects_are_swept() {
        let (mut heap, mut roots) = create_test_env();
        let live = heap.allocate_plain(1).unwrap();
        let child = heap.allocate_plain(0).unwrap();
        heap.set_field(live, 0, child).unwrap();
        heap.allocate_plain(0).unwrap();
        roots.push(live);

        let stats = heap.collect_garbage(&mut roots, false);
        assert_eq!(stats.swept, 1);
        assert_eq!(stats.marked, 2);
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.cycles(), 1);
    }

    #[test]
    fn test_survivors_are_white_after_a_cycle() {
        let (mut heap, mut roots) = create_test_env();
        let obj = heap.allocate_plain(0).unwrap();
        roots.push(obj);
        heap.collect_garbage(&mut roots, false);
        assert_eq!(heap.object(obj).unwrap().header.color(), Color::White);
    }

    #[test]
    fn test_full_compaction_moves_roots() {
        let (mut heap, mut roots) = create_test_env();
        let obj = heap.allocate_plain(1).unwrap();
        let child = heap.allocate_plain(0).unwrap();
        heap.set_field(obj, 0, child).unwrap();
        roots.push(obj);

        let stats = heap.collect_garbage(&mut roots, true);
        assert_eq!(stats.evacuated, 2);
        assert_ne!(roots[0], obj, "root must follow its object");
        let moved_child = heap.get_field(roots[0], 0).unwrap();
        assert_ne!(moved_child, child);
        assert!(heap.object(moved_child).is_some());
        assert!(heap.object(obj).is_none());
    }

    #[test]
    fn test_never_compact_keeps_addresses() {
        let mut heap = Heap::new(HeapSettings {
            never_compact: true,
            ..create_test_settings()
        });
        let obj = heap.allocate_plain(0).unwrap();
        let mut roots = vec![obj];
        let stats = heap.collect_garbage(&mut roots, true);
        assert_eq!(stats.evacuated, 0);
        assert_eq!(roots[0], obj);
    }

    #[test]
    fn test_weak_callback_fires_once_and_may_allocate() {
        let (mut heap, mut roots) = create_test_env();
        let obj = heap.allocate_plain(0).unwrap();
        let handle = heap.create_global(obj);
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        heap.make_weak(handle, 7, move |heap, info| {
            assert_eq!(info.parameter, 7);
            counter.set(counter.get() + 1);
            heap.allocate_plain(0).unwrap();
            heap.destroy_global(info.handle).unwrap();
        })
        .unwrap();

        let stats = heap.collect_garbage(&mut roots, false);
        assert_eq!(stats.cleared_handles, 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(heap.global(handle), Err(crate::HeapError::InvalidHandle));

        heap.collect_garbage(&mut roots, false);
        heap.collect_garbage(&mut roots, false);
        assert_eq!(fired.get(), 1, "callback must not fire twice");
    }

    #[test]
    fn test_pending_referent_survives_its_cycle() {
        let (mut heap, mut roots) = create_test_env();
        let obj = heap.allocate_plain(0).unwrap();
        let handle = heap.create_global(obj);
        heap.make_weak(handle, 0, |_, _| {}).unwrap();

        let before = heap.object_count();
        heap.collect_garbage(&mut roots, false);
        assert_eq!(heap.object_count(), before, "referent kept for the cycle");
        assert_eq!(heap.global(handle), Ok(None));

        heap.collect_garbage(&mut roots, false);
        assert_eq!(heap.object_count(), before - 1);
    }

    #[test]
    #[should_panic(expected = "fatal: collection re-entered")]
    fn test_collecting_from_a_callback_is_fatal() {
        let (mut heap, mut roots) = create_test_env();
        let obj = heap.allocate_plain(0).unwrap();
        let handle = heap.create_global(obj);
        heap.make_weak(handle, 0, |heap, _| {
            heap.collect_garbage(&mut EmptyRoots, false);
        })
        .unwrap();
        heap.collect_garbage(&mut roots, false);
    }

    #[test]
    fn test_incremental_marking_allocates_black() {
        let (mut heap, mut roots) = create_test_env();
        let holder = heap.allocate_plain(1).unwrap();
        roots.push(holder);

        heap.start_incremental_marking(&mut roots);
        assert!(heap.is_marking());
        let late = heap.allocate_plain(0).unwrap();
        assert_eq!(heap.object(late).unwrap().header.color(), Color::Black);
        heap.set_field(holder, 0, late).unwrap();

        while heap.incremental_marking_step(1) == StepResult::MoreWork {}
        let stats = heap.finish_incremental_collection(&mut roots);
        assert!(!heap.is_marking());
        assert_eq!(stats.swept, 0);
        assert_eq!(heap.get_field(holder, 0), Ok(late));
    }

    #[test]
    fn test_barrier_catches_edges_stored_into_scanned_objects() {
        let (mut heap, mut roots) = create_test_env();
        let carrier = heap.allocate_plain(1).unwrap();
        let holder = heap.allocate_plain(1).unwrap();
        let hidden = heap.allocate_plain(0).unwrap();
        heap.set_field(carrier, 0, hidden).unwrap();
        roots.push(carrier);
        roots.push(holder);

        heap.start_incremental_marking(&mut roots);
        // the worklist is LIFO, so one step scans only the holder
        assert_eq!(heap.incremental_marking_step(1), StepResult::MoreWork);
        assert!(heap.object(holder).unwrap().header.is_black());

        heap.set_field(holder, 0, hidden).unwrap();
        heap.set_field(carrier, 0, Value::ZERO).unwrap();

        let stats = heap.finish_incremental_collection(&mut roots);
        assert_eq!(stats.swept, 0, "object stored behind the marker survives");
        assert_eq!(heap.get_field(holder, 0), Ok(hidden));
        assert!(heap.object(hidden).is_some());
    }

    #[test]
    fn test_abort_resets_marking_state() {
        let (mut heap, mut roots) = create_test_env();
        {
            let mut scope = HandleScope::new(&mut heap);
            let obj = scope.allocate_plain(0).unwrap();
            scope.pin(obj);
            scope.simulate_incremental_marking(&mut roots);
            assert_eq!(scope.object(obj).unwrap().header.color(), Color::Black);
        }
        heap.abort_incremental_marking();
        assert!(!heap.is_marking());
        heap.space.for_each_object(|_, object| {
            assert!(object.header.is_white());
        });

        let stats = heap.collect_garbage(&mut roots, false);
        assert_eq!(stats.swept, 1, "object black before abort is garbage after it");
    }

    #[test]
    fn test_collection_aborts_in_flight_marking() {
        let (mut heap, mut roots) = create_test_env();
        {
            let mut scope = HandleScope::new(&mut heap);
            let obj = scope.allocate_plain(0).unwrap();
            scope.pin(obj);
            scope.simulate_incremental_marking(&mut roots);
        }
        let stats = heap.collect_garbage(&mut roots, false);
        assert_eq!(stats.swept, 1);
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_step_without_marking_is_done() {
        let (mut heap, _) = create_test_env();
        assert_eq!(heap.incremental_marking_step(10), StepResult::Done);
    }
}
