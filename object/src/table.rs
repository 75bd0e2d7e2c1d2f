//! Open-addressed hash table used as the backing store of weak collections.
//!
//! Keys are compared by identity (the raw reference bits), and the hash is
//! supplied by the caller and cached in the entry, so rehashing never looks
//! at the key object. Removal leaves a tombstone so probe chains stay intact.
//!
//! Capacity is always a power of two. Probing uses triangular steps, which
//! visit every slot exactly once for power-of-two capacities.

use crate::Value;

/// Smallest capacity a table is ever created or shrunk to.
pub const MIN_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Empty,
    /// Tombstone left by a removal.
    Deleted,
    Occupied { key: Value, value: Value, hash: u32 },
}

impl Entry {
    #[inline]
    pub fn is_occupied(&self) -> bool {
        matches!(self, Entry::Occupied { .. })
    }
}

/// Counters reported to embedders and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSize {
    pub element_count: usize,
    pub deleted_count: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct HashTable {
    entries: Box<[Entry]>,
    element_count: usize,
    deleted_count: usize,
}

impl HashTable {
    /// Capacity for a fresh table meant to hold `at_least` entries at 50% load.
    pub fn compute_capacity(at_least: usize) -> usize {
        (at_least * 2).next_power_of_two().max(MIN_CAPACITY)
    }

    /// Capacity after growth: roughly four times the live count after the insert.
    pub fn grown_capacity(live_after_insert: usize) -> usize {
        (live_after_insert * 4).next_power_of_two().max(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "fatal: table capacity {capacity} is not a power of two"
        );
        Self {
            entries: vec![Entry::Empty; capacity].into_boxed_slice(),
            element_count: 0,
            deleted_count: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    #[inline]
    pub fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    pub fn size(&self) -> TableSize {
        TableSize {
            element_count: self.element_count,
            deleted_count: self.deleted_count,
            capacity: self.capacity(),
        }
    }

    #[inline]
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Occupied entries as `(index, key, value, hash)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Value, Value, u32)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match *entry {
                Entry::Occupied { key, value, hash } => {
                    Some((index, key, value, hash))
                }
                _ => None,
            })
    }

    #[inline]
    fn probe(&self, hash: u32) -> impl Iterator<Item = usize> {
        let mask = self.capacity() - 1;
        let start = hash as usize & mask;
        (0..self.capacity()).map(move |i| (start + i * (i + 1) / 2) & mask)
    }

    /// Slot index holding `key`, if present.
    pub fn find_entry(&self, key: Value, hash: u32) -> Option<usize> {
        for index in self.probe(hash) {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Occupied { key: k, .. } if k == key => {
                    return Some(index);
                }
                _ => {}
            }
        }
        None
    }

    pub fn lookup(&self, key: Value, hash: u32) -> Option<Value> {
        self.find_entry(key, hash).map(|index| match self.entries[index] {
            Entry::Occupied { value, .. } => value,
            _ => unreachable!("find_entry returned a vacant slot"),
        })
    }

    /// Capacity the table must grow to before `key` can be inserted, or
    /// `None` if the insert fits (or only overwrites an existing value).
    pub fn capacity_for_insert(&self, key: Value, hash: u32) -> Option<usize> {
        if self.find_entry(key, hash).is_some() {
            return None;
        }
        let occupancy = self.element_count + self.deleted_count + 1;
        if occupancy * 2 > self.capacity() {
            Some(Self::grown_capacity(self.element_count + 1))
        } else {
            None
        }
    }

    /// Inserts or overwrites. The caller grows the table first using
    /// [`Self::capacity_for_insert`]; inserting past the load factor is fatal.
    pub fn put(&mut self, key: Value, value: Value, hash: u32) {
        if let Some(index) = self.find_entry(key, hash) {
            self.entries[index] = Entry::Occupied { key, value, hash };
            return;
        }

        assert!(
            (self.element_count + self.deleted_count + 1) * 2 <= self.capacity(),
            "fatal: insert into table {}/{}+{} would exceed the load factor",
            self.element_count,
            self.capacity(),
            self.deleted_count,
        );

        let mut slot = None;
        for index in self.probe(hash) {
            match self.entries[index] {
                Entry::Empty | Entry::Deleted => {
                    slot = Some(index);
                    break;
                }
                Entry::Occupied { .. } => {}
            }
        }
        let index = slot.expect("load factor guarantees a vacant slot");
        if self.entries[index] == Entry::Deleted {
            self.deleted_count -= 1;
        }
        self.entries[index] = Entry::Occupied { key, value, hash };
        self.element_count += 1;
    }

    /// Removes `key`, leaving a tombstone. Returns the old value.
    pub fn remove(&mut self, key: Value, hash: u32) -> Option<Value> {
        let index = self.find_entry(key, hash)?;
        self.remove_at(index)
    }

    /// Tombstones the slot at `index` if it is occupied.
    pub fn remove_at(&mut self, index: usize) -> Option<Value> {
        match self.entries[index] {
            Entry::Occupied { value, .. } => {
                self.entries[index] = Entry::Deleted;
                self.element_count -= 1;
                self.deleted_count += 1;
                Some(value)
            }
            _ => None,
        }
    }

    /// Capacity a post-collection shrink should use given the number of
    /// entries that survive, or `None` if the table stays as it is.
    ///
    /// The result still holds every entry currently present so the shrink
    /// can run before dead entries are tombstoned.
    pub fn shrink_capacity(&self, survivors: usize) -> Option<usize> {
        if survivors * 4 >= self.capacity() || self.capacity() <= MIN_CAPACITY {
            return None;
        }
        let target = (survivors * 2)
            .next_power_of_two()
            .max(self.element_count.next_power_of_two())
            .max(MIN_CAPACITY);
        (target < self.capacity()).then_some(target)
    }

    /// Rebuilds the slot array at `new_capacity`, dropping all tombstones.
    /// Entries are placed by their cached hash only.
    pub fn rehash(&mut self, new_capacity: usize) {
        assert!(
            new_capacity.is_power_of_two() && new_capacity >= self.element_count,
            "fatal: cannot rehash {} entries into capacity {new_capacity}",
            self.element_count,
        );
        let old = std::mem::replace(
            &mut self.entries,
            vec![Entry::Empty; new_capacity].into_boxed_slice(),
        );
        self.deleted_count = 0;

        for entry in old.iter() {
            if let Entry::Occupied { hash, .. } = *entry {
                let index = self
                    .probe(hash)
                    .find(|&i| self.entries[i] == Entry::Empty)
                    .expect("rehash target has room for every entry");
                self.entries[index] = *entry;
            }
        }
    }

    /// Mutable access to the key of the occupied slot at `index`.
    pub fn key_mut(&mut self, index: usize) -> Option<&mut Value> {
        match self.entries.get_mut(index)? {
            Entry::Occupied { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Mutable access to the value of the occupied slot at `index`.
    pub fn value_mut(&mut self, index: usize) -> Option<&mut Value> {
        match self.entries.get_mut(index)? {
            Entry::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Checks counters and probe reachability of every entry.
    pub fn check_invariants(&self) -> Result<(), String> {
        let occupied = self.entries.iter().filter(|e| e.is_occupied()).count();
        let deleted = self
            .entries
            .iter()
            .filter(|e| **e == Entry::Deleted)
            .count();
        if occupied != self.element_count {
            return Err(format!(
                "element count {} but {occupied} occupied slots",
                self.element_count
            ));
        }
        if deleted != self.deleted_count {
            return Err(format!(
                "deleted count {} but {deleted} tombstones",
                self.deleted_count
            ));
        }
        if self.element_count + self.deleted_count > self.capacity() {
            return Err(format!(
                "occupancy {} exceeds capacity {}",
                self.element_count + self.deleted_count,
                self.capacity()
            ));
        }
        for (index, key, _, hash) in self.iter() {
            if self.find_entry(key, hash) != Some(index) {
                return Err(format!("key {key:?} at slot {index} is unreachable"));
            }
        }
        Ok(())
    }
}
