use crate::header::{Header, ObjectType};
use crate::table::HashTable;
use crate::Value;

/// Names one pointer-holding storage location inside an object.
///
/// Used by the compactor to record slots that must be rewritten after
/// their referent moves. Table slots are addressed by entry index so the
/// record stays valid while the table's slot array stays put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Field `n` of a plain object.
    Field(u32),
    /// The backing-table reference of a weak collection.
    Table,
    /// Key of entry `n` in a hash table.
    TableKey(u32),
    /// Value of entry `n` in a hash table.
    TableValue(u32),
}

// ── Object bodies ──────────────────────────────────────────────────

/// Kind-specific payload.
#[derive(Debug)]
pub enum ObjectBody {
    /// Ordinary object with a fixed number of strong fields.
    Plain { fields: Box<[Value]> },
    /// Weak map. Strongly owns its backing table; the table's entries are
    /// ephemerons.
    WeakCollection { table: Value },
    /// Backing store of a weak collection.
    HashTable(HashTable),
}

/// A heap-managed object: header plus body.
#[derive(Debug)]
pub struct HeapObject {
    pub header: Header,
    pub body: ObjectBody,
}

impl HeapObject {
    pub fn plain(field_count: usize, hash: u32) -> Self {
        Self {
            header: Header::new(ObjectType::Plain, hash),
            body: ObjectBody::Plain {
                fields: vec![Value::ZERO; field_count].into_boxed_slice(),
            },
        }
    }

    pub fn weak_collection(table: Value, hash: u32) -> Self {
        Self {
            header: Header::new(ObjectType::WeakCollection, hash),
            body: ObjectBody::WeakCollection { table },
        }
    }

    pub fn hash_table(table: HashTable, hash: u32) -> Self {
        Self {
            header: Header::new(ObjectType::HashTable, hash),
            body: ObjectBody::HashTable(table),
        }
    }

    #[inline]
    pub fn object_type(&self) -> ObjectType {
        self.header.object_type()
    }

    pub fn fields(&self) -> Option<&[Value]> {
        match &self.body {
            ObjectBody::Plain { fields } => Some(fields),
            _ => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut [Value]> {
        match &mut self.body {
            ObjectBody::Plain { fields } => Some(fields),
            _ => None,
        }
    }

    /// The backing table reference if this is a weak collection.
    pub fn collection_table(&self) -> Option<Value> {
        match self.body {
            ObjectBody::WeakCollection { table } => Some(table),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&HashTable> {
        match &self.body {
            ObjectBody::HashTable(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_table_mut(&mut self) -> Option<&mut HashTable> {
        match &mut self.body {
            ObjectBody::HashTable(table) => Some(table),
            _ => None,
        }
    }

    /// Reads the slot named by `kind`, or `None` if it does not exist on
    /// this object (wrong kind, index out of range, or vacant table entry).
    pub fn slot(&self, kind: SlotKind) -> Option<Value> {
        match (kind, &self.body) {
            (SlotKind::Field(n), ObjectBody::Plain { fields }) => {
                fields.get(n as usize).copied()
            }
            (SlotKind::Table, ObjectBody::WeakCollection { table }) => Some(*table),
            (SlotKind::TableKey(n), ObjectBody::HashTable(table)) => {
                match table.entries().get(n as usize)? {
                    crate::Entry::Occupied { key, .. } => Some(*key),
                    _ => None,
                }
            }
            (SlotKind::TableValue(n), ObjectBody::HashTable(table)) => {
                match table.entries().get(n as usize)? {
                    crate::Entry::Occupied { value, .. } => Some(*value),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn slot_mut(&mut self, kind: SlotKind) -> Option<&mut Value> {
        match (kind, &mut self.body) {
            (SlotKind::Field(n), ObjectBody::Plain { fields }) => {
                fields.get_mut(n as usize)
            }
            (SlotKind::Table, ObjectBody::WeakCollection { table }) => Some(table),
            (SlotKind::TableKey(n), ObjectBody::HashTable(table)) => {
                table.key_mut(n as usize)
            }
            (SlotKind::TableValue(n), ObjectBody::HashTable(table)) => {
                table.value_mut(n as usize)
            }
            _ => None,
        }
    }
}
