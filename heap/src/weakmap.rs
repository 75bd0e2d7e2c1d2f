//! Weak collection operations.
//!
//! A weak collection is an ordinary object holding a reference to its hash
//! table. The table is a separate heap object, so a resize rebuilds its slot
//! array in place and the collection never needs rewiring.

use object::{Address, HashTable, HeapObject, TableSize, Value};

use crate::{Heap, HeapError};

impl Heap {
    /// Allocates a weak collection with a minimum-capacity table.
    pub fn create_weak_collection(&mut self) -> Result<Value, HeapError> {
        let capacity = HashTable::compute_capacity(1);
        self.budget.charge(capacity)?;

        let hash = self.next_identity_hash();
        let table = HeapObject::hash_table(HashTable::with_capacity(capacity), hash);
        let table = match self.allocate(table) {
            Ok(table) => table,
            Err(err) => {
                self.budget.release(capacity);
                return Err(err);
            }
        };

        // On failure the table is garbage and its charge returns when swept.
        let hash = self.next_identity_hash();
        let collection = self.allocate(HeapObject::weak_collection(table, hash))?;
        log::trace!("created weak collection {collection:?} with table {table:?}");
        Ok(collection)
    }

    /// The table backing `collection`.
    pub fn weak_collection_table(&self, collection: Value) -> Result<Value, HeapError> {
        self.object(collection)
            .and_then(HeapObject::collection_table)
            .ok_or(HeapError::NotACollection(collection))
    }

    fn table_address(&self, collection: Value) -> Result<Address, HeapError> {
        self.weak_collection_table(collection)?
            .address()
            .ok_or(HeapError::NotACollection(collection))
    }

    fn table(&self, collection: Value) -> Result<&HashTable, HeapError> {
        let address = self.table_address(collection)?;
        self.space
            .object(address)
            .and_then(HeapObject::as_table)
            .ok_or(HeapError::NotACollection(collection))
    }

    fn table_mut(
        &mut self,
        address: Address,
        collection: Value,
    ) -> Result<&mut HashTable, HeapError> {
        self.space
            .object_mut(address)
            .and_then(HeapObject::as_table_mut)
            .ok_or(HeapError::NotACollection(collection))
    }

    /// Inserts or overwrites the entry for `key`. Grows the table first if
    /// the insert would break the load factor; a growth that does not fit
    /// the backing budget fails with out-of-memory and leaves the table
    /// untouched.
    pub fn weak_collection_set(
        &mut self,
        collection: Value,
        key: Value,
        value: Value,
        hash: u32,
    ) -> Result<(), HeapError> {
        let address = self.table_address(collection)?;
        let (old_capacity, grow_to) = {
            let table = self.table(collection)?;
            (table.capacity(), table.capacity_for_insert(key, hash))
        };

        if let Some(new_capacity) = grow_to {
            self.budget.charge(new_capacity)?;
            self.table_mut(address, collection)?.rehash(new_capacity);
            self.budget.release(old_capacity);
            log::debug!("grew table {address:?} {old_capacity} -> {new_capacity}");
        }

        self.table_mut(address, collection)?.put(key, value, hash);
        self.write_barrier(address);
        Ok(())
    }

    pub fn weak_collection_get(
        &self,
        collection: Value,
        key: Value,
        hash: u32,
    ) -> Result<Option<Value>, HeapError> {
        Ok(self.table(collection)?.lookup(key, hash))
    }

    pub fn weak_collection_has(
        &self,
        collection: Value,
        key: Value,
        hash: u32,
    ) -> Result<bool, HeapError> {
        Ok(self.table(collection)?.find_entry(key, hash).is_some())
    }

    /// Tombstones the entry for `key`. Returns whether one was present.
    pub fn weak_collection_delete(
        &mut self,
        collection: Value,
        key: Value,
        hash: u32,
    ) -> Result<bool, HeapError> {
        let address = self.table_address(collection)?;
        Ok(self.table_mut(address, collection)?.remove(key, hash).is_some())
    }

    /// Element, tombstone and slot counts of the backing table.
    pub fn weak_collection_size(&self, collection: Value) -> Result<TableSize, HeapError> {
        Ok(self.table(collection)?.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapSettings;

    fn create_test_heap() -> Heap {
        Heap::new(HeapSettings {
            page_cells: 64,
            max_pages: 16,
            verify_heap: true,
            ..HeapSettings::default()
        })
    }

    fn size(element_count: usize, deleted_count: usize, capacity: usize) -> TableSize {
        TableSize {
            element_count,
            deleted_count,
            capacity,
        }
    }

    #[test]
    fn test_new_collection_is_empty() {
        let mut heap = create_test_heap();
        let map = heap.create_weak_collection().unwrap();
        assert_eq!(heap.weak_collection_size(map), Ok(size(0, 0, 32)));
        assert_eq!(heap.backing_entries(), 32);
        assert_eq!(heap.verify(), Ok(()));
    }

    #[test]
    fn test_set_get_has_delete() {
        let mut heap = create_test_heap();
        let map = heap.create_weak_collection().unwrap();
        let key = heap.allocate_plain(0).unwrap();
        let value = heap.allocate_plain(0).unwrap();
        let hash = heap.identity_hash(key).unwrap();

        heap.weak_collection_set(map, key, value, hash).unwrap();
        assert_eq!(heap.weak_collection_get(map, key, hash), Ok(Some(value)));
        assert_eq!(heap.weak_collection_has(map, key, hash), Ok(true));

        heap.weak_collection_set(map, key, Value::from_i64(7), hash).unwrap();
        assert_eq!(
            heap.weak_collection_get(map, key, hash),
            Ok(Some(Value::from_i64(7)))
        );
        assert_eq!(heap.weak_collection_size(map), Ok(size(1, 0, 32)));

        assert_eq!(heap.weak_collection_delete(map, key, hash), Ok(true));
        assert_eq!(heap.weak_collection_delete(map, key, hash), Ok(false));
        assert_eq!(heap.weak_collection_has(map, key, hash), Ok(false));
        assert_eq!(heap.weak_collection_size(map), Ok(size(0, 1, 32)));
    }

    #[test]
    fn test_growth_quadruples_live_count() {
        let mut heap = create_test_heap();
        let map = heap.create_weak_collection().unwrap();
        for _ in 0..32 {
            let key = heap.allocate_plain(0).unwrap();
            let hash = heap.identity_hash(key).unwrap();
            heap.weak_collection_set(map, key, key, hash).unwrap();
        }
        assert_eq!(heap.weak_collection_size(map), Ok(size(32, 0, 128)));
        assert_eq!(heap.backing_entries(), 128);
        assert_eq!(heap.verify(), Ok(()));
    }

    #[test]
    fn test_growth_past_the_budget_is_out_of_memory() {
        let mut heap = Heap::new(HeapSettings {
            max_backing_entries: 64,
            ..create_test_heap().settings().clone()
        });
        let map = heap.create_weak_collection().unwrap();
        let mut result = Ok(());
        for n in 0..17 {
            result = heap.weak_collection_set(map, Value::from_i64(n), Value::ZERO, n as u32);
        }
        assert_eq!(
            result,
            Err(HeapError::OutOfMemory {
                what: "table backing store",
                requested: 128,
            })
        );
        assert_eq!(heap.weak_collection_size(map), Ok(size(16, 0, 32)));
        assert_eq!(heap.backing_entries(), 32);
    }

    #[test]
    fn test_operations_on_non_collections_fail() {
        let mut heap = create_test_heap();
        let plain = heap.allocate_plain(1).unwrap();
        assert_eq!(
            heap.weak_collection_size(plain),
            Err(HeapError::NotACollection(plain))
        );
        assert_eq!(
            heap.weak_collection_set(Value::from_i64(1), plain, plain, 0),
            Err(HeapError::NotACollection(Value::from_i64(1)))
        );
    }

    #[test]
    fn test_stores_during_marking_reach_the_barrier() {
        let mut heap = create_test_heap();
        let map = heap.create_weak_collection().unwrap();
        let mut roots = vec![map];
        heap.start_incremental_marking(&mut roots);

        let key = heap.allocate_plain(0).unwrap();
        heap.barrier.clear();
        heap.weak_collection_set(map, key, key, 1).unwrap();
        assert_eq!(heap.barrier.len(), 1);
        heap.abort_incremental_marking();
    }
}
