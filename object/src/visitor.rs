use crate::objects::{HeapObject, ObjectBody, SlotKind};
use crate::Value;

pub trait Visitable {
    /// Strong outgoing edges only. Table keys and values are ephemeron
    /// edges and are never reported here.
    fn visit_strong_edges(&self, visitor: &mut impl Visitor);
    /// Every pointer-holding slot, strong or not.
    fn visit_slots(&self, visitor: &mut impl FnMut(SlotKind, Value));
}

pub trait Visitor: Sized {
    fn visit(&mut self, slot: SlotKind, value: Value);
}

impl<F: FnMut(SlotKind, Value)> Visitor for F {
    #[inline]
    fn visit(&mut self, slot: SlotKind, value: Value) {
        self(slot, value)
    }
}

// Dispatch happens on the body variant; each arm reports the direct edges
// of that kind and nothing transitive.
impl Visitable for HeapObject {
    #[inline]
    fn visit_strong_edges(&self, visitor: &mut impl Visitor) {
        match &self.body {
            ObjectBody::Plain { fields } => {
                for (n, field) in fields.iter().enumerate() {
                    if field.is_ref() {
                        visitor.visit(SlotKind::Field(n as u32), *field);
                    }
                }
            }
            ObjectBody::WeakCollection { table } => {
                if table.is_ref() {
                    visitor.visit(SlotKind::Table, *table);
                }
            }
            ObjectBody::HashTable(_) => (),
        }
    }

    fn visit_slots(&self, visitor: &mut impl FnMut(SlotKind, Value)) {
        match &self.body {
            ObjectBody::HashTable(table) => {
                for (index, key, value, _) in table.iter() {
                    visitor(SlotKind::TableKey(index as u32), key);
                    visitor(SlotKind::TableValue(index as u32), value);
                }
            }
            _ => self.visit_strong_edges(visitor),
        }
    }
}
