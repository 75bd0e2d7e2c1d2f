mod header;
mod objects;
mod table;
mod value;
mod visitor;

pub use header::{Color, Header, HeaderFlags, ObjectType};
pub use objects::{HeapObject, ObjectBody, SlotKind};
pub use table::{Entry, HashTable, MIN_CAPACITY, TableSize};
pub use value::{Address, Value};
pub use visitor::{Visitable, Visitor};

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value tagging ──────────────────────────────────────────────

    #[test]
    fn test_fixnum_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, (1 << 62) - 1, -(1 << 62)] {
            let v = Value::from_i64(n);
            assert!(v.is_fixnum());
            assert!(!v.is_ref());
            assert_eq!(v.to_i64(), n);
            assert_eq!(v.address(), None);
        }
    }

    #[test]
    fn test_fixnum_zero_is_zero_bits() {
        assert_eq!(Value::from_i64(0).raw(), 0);
        assert_eq!(Value::ZERO, Value::from_i64(0));
    }

    #[test]
    fn test_ref_tagging() {
        let address = Address::new(513, 65535);
        let v = Value::from_address(address);
        assert!(v.is_ref());
        assert!(!v.is_fixnum());
        assert_eq!(v.address(), Some(address));
        assert_eq!(v.as_fixnum(), None);
        assert_eq!(address.page(), 513);
        assert_eq!(address.offset(), 65535);
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn test_header_object_type() {
        for ty in [ObjectType::Plain, ObjectType::WeakCollection, ObjectType::HashTable] {
            let h = Header::new(ty, 0);
            assert_eq!(h.object_type(), ty);
        }
    }

    #[test]
    fn test_header_colors() {
        let h = Header::new(ObjectType::Plain, 0);
        assert!(h.is_white());
        assert!(h.try_grey(), "white object must be discoverable");
        assert!(!h.try_grey(), "grey object must not be rediscovered");
        h.set_color(Color::Black);
        assert!(h.is_black());
        h.reset_mark_state();
        assert!(h.is_white());
    }

    #[test]
    fn test_header_flags() {
        let h = Header::new(ObjectType::HashTable, 7);
        assert!(!h.has_flag(HeaderFlags::DISCOVERED));

        let prev = h.fetch_or_flags(HeaderFlags::DISCOVERED);
        assert!(!prev.contains(HeaderFlags::DISCOVERED));
        let prev = h.fetch_or_flags(HeaderFlags::DISCOVERED);
        assert!(prev.contains(HeaderFlags::DISCOVERED));

        h.fetch_or_flags(HeaderFlags::REMEMBERED);
        h.remove_flag(HeaderFlags::DISCOVERED);
        assert!(h.has_flag(HeaderFlags::REMEMBERED));
        assert!(!h.has_flag(HeaderFlags::DISCOVERED));

        h.reset_mark_state();
        assert_eq!(h.flags(), HeaderFlags::NONE);
        assert_eq!(h.hash(), 7, "identity hash survives mark reset");
    }
}
