//! Tri-color marker with an ephemeron fixpoint.
//!
//! Marking is a resumable state machine. [`Marker::step`] scans up to a
//! budget of grey objects; once the worklist is empty it walks every
//! discovered hash table and promotes the values of live keys. Marking is
//! done when a walk promotes nothing.

use object::{Address, Color, HeaderFlags, ObjectType, SlotKind, Value, Visitable};

use crate::{SlotsBuffer, space::Space};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    MoreWork,
    /// Fixpoint reached for the heap as it is now.
    Done,
}

/// Whether `value` survives the current cycle as far as marking knows.
/// Non-references never die.
#[inline]
pub fn is_live(space: &Space, value: Value) -> bool {
    match value.address() {
        Some(address) => space
            .object(address)
            .is_some_and(|object| !object.header.is_white()),
        None => true,
    }
}

#[derive(Debug, Default)]
pub struct Marker {
    worklist: Vec<Address>,
    /// Hash tables reached this cycle, in discovery order.
    tables: Vec<Address>,
    /// Strong slots pointing into evacuation candidates.
    pub(crate) slots: SlotsBuffer,
    record_slots: bool,
    marked: usize,
    promotions: usize,
}

impl Marker {
    pub fn new(record_slots: bool) -> Self {
        Self {
            record_slots,
            ..Self::default()
        }
    }

    #[inline]
    pub fn marked(&self) -> usize {
        self.marked
    }

    #[inline]
    pub fn promotions(&self) -> usize {
        self.promotions
    }

    #[inline]
    pub fn tables(&self) -> &[Address] {
        &self.tables
    }

    pub fn has_work(&self) -> bool {
        !self.worklist.is_empty()
    }

    /// Greys the referent of `value`. Returns `true` if it was white.
    pub fn mark_value(&mut self, space: &Space, value: Value) -> bool {
        let Some(address) = value.address() else {
            return false;
        };
        if space.live_object(address).header.try_grey() {
            self.worklist.push(address);
            self.marked += 1;
            true
        } else {
            false
        }
    }

    fn register_table(&mut self, space: &Space, address: Address) {
        let header = &space.live_object(address).header;
        let prev = header.fetch_or_flags(HeaderFlags::DISCOVERED);
        if !prev.contains(HeaderFlags::DISCOVERED) {
            self.tables.push(address);
        }
    }

    fn scan(&mut self, space: &Space, address: Address) {
        let object = space.live_object(address);
        object.header.set_color(Color::Black);
        if object.object_type() == ObjectType::HashTable {
            self.register_table(space, address);
        }

        object.visit_strong_edges(&mut |slot: SlotKind, value: Value| {
            if self.record_slots
                && value
                    .address()
                    .is_some_and(|target| space.is_evacuation_candidate(target))
            {
                self.slots.record(address, slot);
            }
            self.mark_value(space, value);
        });
    }

    /// Revisits an object whose edges changed behind the marker.
    /// White objects are skipped; they are scanned if something reaches them.
    pub fn rescan(&mut self, space: &Space, address: Address) {
        match space.object(address) {
            Some(object) if !object.header.is_white() => {
                log::trace!("rescanning {address:?}");
                self.scan(space, address);
            }
            _ => {}
        }
    }

    /// Promotes values of tables whose key is live. Returns the number of
    /// newly greyed values.
    fn process_ephemerons(&mut self, space: &Space) -> usize {
        let mut candidates = Vec::new();
        for &address in &self.tables {
            let Some(table) = space.live_object(address).as_table() else {
                continue;
            };
            for (_, key, value, _) in table.iter() {
                if value.is_ref() && is_live(space, key) && !is_live(space, value) {
                    candidates.push(value);
                }
            }
        }

        let mut promoted = 0;
        for value in candidates {
            if self.mark_value(space, value) {
                promoted += 1;
            }
        }
        if promoted > 0 {
            log::trace!("ephemeron pass promoted {promoted} values");
        }
        self.promotions += promoted;
        promoted
    }

    /// Scans at most `budget` objects.
    pub fn step(&mut self, space: &Space, budget: usize) -> StepResult {
        let mut scanned = 0;
        loop {
            while let Some(address) = self.worklist.pop() {
                self.scan(space, address);
                scanned += 1;
                if scanned >= budget {
                    return StepResult::MoreWork;
                }
            }
            if self.process_ephemerons(space) == 0 {
                return StepResult::Done;
            }
        }
    }

    /// Runs to the fixpoint.
    pub fn drain(&mut self, space: &Space) {
        while self.step(space, usize::MAX) == StepResult::MoreWork {}
    }
}
