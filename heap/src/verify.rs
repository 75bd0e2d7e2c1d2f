//! Heap verifier. Runs between cycles.

use object::{Address, HeaderFlags, HeapObject, ObjectBody, ObjectType, SlotKind, Value, Visitable};

use crate::{Heap, VerifyError, space::Cell, space::Space};

fn check_reference(
    space: &Space,
    value: Value,
    context: &dyn Fn() -> String,
) -> Result<(), VerifyError> {
    match value.address() {
        Some(address) if space.object(address).is_none() => Err(VerifyError::new(format!(
            "{} points to dead cell {address:?}",
            context()
        ))),
        _ => Ok(()),
    }
}

fn verify_object(
    space: &Space,
    address: Address,
    object: &HeapObject,
    backing: &mut usize,
) -> Result<(), VerifyError> {
    if !object.header.is_white() || object.header.flags() != HeaderFlags::NONE {
        return Err(VerifyError::new(format!(
            "{address:?} left marked: {:?}",
            object.header
        )));
    }

    let mut refs: Result<(), VerifyError> = Ok(());
    object.visit_slots(&mut |slot: SlotKind, value: Value| {
        if refs.is_ok() {
            refs = check_reference(space, value, &|| format!("{address:?} {slot:?}"));
        }
    });
    refs?;

    match &object.body {
        ObjectBody::WeakCollection { table } => {
            let is_table = table
                .address()
                .and_then(|a| space.object(a))
                .is_some_and(|t| t.object_type() == ObjectType::HashTable);
            if !is_table {
                return Err(VerifyError::new(format!(
                    "collection {address:?} has no backing table"
                )));
            }
        }
        ObjectBody::HashTable(table) => {
            table
                .check_invariants()
                .map_err(|e| VerifyError::new(format!("table {address:?}: {e}")))?;
            if table.element_count() * 2 > table.capacity() {
                return Err(VerifyError::new(format!(
                    "table {address:?} holds {} live entries in {} slots",
                    table.element_count(),
                    table.capacity()
                )));
            }
            *backing += table.capacity();
        }
        ObjectBody::Plain { .. } => {}
    }
    Ok(())
}

/// Checks that:
/// - no forwarding cells or candidate pages remain,
/// - every object is white with no GC flags set,
/// - every reference in objects and roots targets a live object,
/// - table counters match their slots and live entries respect the load
///   factor,
/// - the backing budget equals the sum of table capacities.
pub fn verify_heap(heap: &Heap) -> Result<(), VerifyError> {
    let space = &heap.space;

    for (index, page) in space.pages() {
        if page.is_candidate() {
            return Err(VerifyError::new(format!("page {index} is still a candidate")));
        }
        if let Some(offset) = page
            .cells()
            .iter()
            .position(|cell| matches!(cell, Cell::Forwarded(_)))
        {
            return Err(VerifyError::new(format!(
                "forwarding cell left at {index}:{offset}"
            )));
        }
    }

    let mut backing = 0;
    let mut result = Ok(());
    space.for_each_object(|address, object| {
        if result.is_ok() {
            result = verify_object(space, address, object, &mut backing);
        }
    });
    result?;

    if backing != heap.budget.used() {
        return Err(VerifyError::new(format!(
            "backing budget {} does not match table capacities {backing}",
            heap.budget.used()
        )));
    }

    for value in heap.globals.values().chain(heap.locals.values()) {
        check_reference(space, value, &|| "root".to_string())?;
    }
    Ok(())
}

impl Heap {
    /// Verifies heap consistency. Only meaningful between cycles.
    pub fn verify(&self) -> Result<(), VerifyError> {
        verify_heap(self)
    }
}
