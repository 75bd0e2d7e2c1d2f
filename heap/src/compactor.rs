//! Evacuation of candidate pages and pointer fix-up.
//!
//! Slots that point into candidate pages are recorded in a [`SlotsBuffer`]
//! before anything moves: strong slots by the marker, table key and value
//! slots by an explicit walk over live tables. After evacuation a single
//! pass rewrites every recorded slot and every root through the forwarding
//! cells.

use object::{Address, SlotKind, Value};

use crate::{RootProvider, space::Space};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedSlot {
    /// Object holding the slot, at its address before evacuation.
    pub holder: Address,
    pub slot: SlotKind,
}

#[derive(Debug, Default)]
pub struct SlotsBuffer {
    slots: Vec<RecordedSlot>,
}

impl SlotsBuffer {
    #[inline]
    pub fn record(&mut self, holder: Address, slot: SlotKind) {
        self.slots.push(RecordedSlot { holder, slot });
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordedSlot> + '_ {
        self.slots.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// How a cycle picks evacuation candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionMode {
    /// Pages at or below the occupancy threshold.
    Policy,
    /// Every occupied page.
    Full,
    Never,
}

/// Flags evacuation candidates for this cycle. Candidates are taken only
/// while the rest of the space can absorb everything on them.
pub fn select_candidates(space: &mut Space, mode: CompactionMode, threshold: f64) -> usize {
    let mut pages: Vec<(usize, usize, f64)> = match mode {
        CompactionMode::Never => return 0,
        CompactionMode::Full => space
            .pages()
            .map(|(index, page)| (index, page.live(), page.occupancy()))
            .collect(),
        CompactionMode::Policy => space
            .pages()
            .filter(|(_, page)| page.live() > 0 && page.occupancy() <= threshold)
            .map(|(index, page)| (index, page.live(), page.occupancy()))
            .collect(),
    };
    pages.sort_by(|a, b| a.2.total_cmp(&b.2));

    let mut selected = 0;
    let mut reserved = 0;
    for (index, live, _) in pages {
        // selecting a page also removes its free cells from the target pool
        let free_here = space.page(index).map_or(0, |page| page.free_cells());
        if space.available_cells().saturating_sub(free_here) < reserved + live {
            log::warn!("not enough room to evacuate page {index} ({live} objects)");
            continue;
        }
        space.set_candidate(index);
        reserved += live;
        selected += 1;
    }
    if selected > 0 {
        log::debug!("selected {selected} evacuation candidates");
    }
    selected
}

/// Whether every black object on a candidate page still has a target cell.
/// Allocation during incremental marking can eat into the room reserved
/// when candidates were selected.
pub fn evacuation_fits(space: &Space) -> bool {
    let survivors: usize = space
        .candidates()
        .into_iter()
        .filter_map(|index| space.page(index))
        .map(|page| {
            page.cells()
                .iter()
                .filter(|cell| {
                    matches!(cell, crate::space::Cell::Object(object) if object.header.is_black())
                })
                .count()
        })
        .sum();
    survivors <= space.available_cells()
}

/// Records key and value slots of live tables that point into candidates.
/// Entries cleared by weak processing must already be gone.
pub fn record_table_slots(space: &Space, tables: &[Address], slots: &mut SlotsBuffer) {
    for &holder in tables {
        let Some(table) = space.object(holder).and_then(|o| o.as_table()) else {
            continue;
        };
        for (index, key, value, _) in table.iter() {
            let index = index as u32;
            if points_into_candidate(space, key) {
                slots.record(holder, SlotKind::TableKey(index));
            }
            if points_into_candidate(space, value) {
                slots.record(holder, SlotKind::TableValue(index));
            }
        }
    }
}

#[inline]
fn points_into_candidate(space: &Space, value: Value) -> bool {
    value
        .address()
        .is_some_and(|address| space.is_evacuation_candidate(address))
}

/// Moves every black object off candidate pages. Returns the number moved.
pub fn evacuate(space: &mut Space) -> usize {
    let mut moved = 0;
    for index in space.candidates() {
        let survivors: Vec<Address> = match space.page(index) {
            Some(page) => page
                .cells()
                .iter()
                .enumerate()
                .filter_map(|(offset, cell)| match cell {
                    crate::space::Cell::Object(object) if object.header.is_black() => {
                        Some(Address::new(index, offset))
                    }
                    _ => None,
                })
                .collect(),
            None => continue,
        };
        for from in survivors {
            let to = space
                .evacuate(from)
                .unwrap_or_else(|err| panic!("fatal: evacuation of {from:?} failed: {err}"));
            log::trace!("evacuated {from:?} -> {to:?}");
            moved += 1;
        }
    }
    moved
}

/// Rewrites `value` if it points at a forwarding cell.
#[inline]
pub fn forward(space: &Space, value: &mut Value) {
    if let Some(to) = value.address().and_then(|a| space.forwarding(a)) {
        *value = Value::from_address(to);
    }
}

/// Rewrites every recorded slot. Holders that moved are found through
/// their forwarding cell. Returns the number of slots rewritten.
pub fn update_slots(space: &mut Space, slots: &SlotsBuffer) -> usize {
    let mut updated = 0;
    for RecordedSlot { holder, slot } in slots.iter() {
        let holder = space.resolve(holder);
        let Some(current) = space.object(holder).and_then(|o| o.slot(slot)) else {
            continue;
        };
        let mut next = current;
        forward(space, &mut next);
        if next == current {
            continue;
        }
        if let Some(target) = space.object_mut(holder).and_then(|o| o.slot_mut(slot)) {
            *target = next;
            updated += 1;
        }
    }
    updated
}

/// Rewrites roots through forwarding cells.
pub fn update_roots(space: &Space, roots: &mut dyn RootProvider) {
    roots.visit_roots(&mut |value| forward(space, value));
}
