use std::sync::atomic::{AtomicU8, Ordering};

/// Object kind tag. The collector dispatches edge enumeration on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    Plain = 0,
    WeakCollection,
    HashTable,
}

/// Tri-color mark state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    /// Not yet discovered in the current cycle.
    White = 0,
    /// Discovered, outgoing edges not yet scanned.
    Grey = 1,
    /// Scanned and live for the current cycle.
    Black = 2,
}

impl Color {
    #[inline(always)]
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Color::Grey,
            2 => Color::Black,
            _ => Color::White,
        }
    }
}

/// GC / bookkeeping flags stored atomically in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0);
    /// Holder is queued in the write barrier buffer.
    pub const REMEMBERED: Self = Self(1 << 0);
    /// Hash table already registered with the marker's ephemeron list.
    pub const DISCOVERED: Self = Self(1 << 1);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }
}

/// Per-object header.
///
/// Color and flags are atomics so the marker can update them through a
/// shared borrow of the object space while it holds other objects borrowed.
/// The identity hash is fixed at allocation and survives relocation.
pub struct Header {
    object_type: ObjectType,
    flags: AtomicU8,
    color: AtomicU8,
    hash: u32,
}

impl Header {
    pub fn new(object_type: ObjectType, hash: u32) -> Self {
        Self {
            object_type,
            flags: AtomicU8::new(0),
            color: AtomicU8::new(Color::White as u8),
            hash,
        }
    }

    #[inline(always)]
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    #[inline(always)]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    // ── color ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn color(&self) -> Color {
        Color::from_u8(self.color.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_color(&self, color: Color) {
        self.color.store(color as u8, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_white(&self) -> bool {
        self.color() == Color::White
    }

    #[inline(always)]
    pub fn is_black(&self) -> bool {
        self.color() == Color::Black
    }

    /// White → grey transition. Returns `true` if this call discovered the object.
    #[inline(always)]
    pub fn try_grey(&self) -> bool {
        self.color
            .compare_exchange(
                Color::White as u8,
                Color::Grey as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    // ── flags ──────────────────────────────────────────────────────

    #[inline(always)]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn has_flag(&self, flag: HeaderFlags) -> bool {
        self.flags().contains(flag)
    }

    #[inline(always)]
    pub fn remove_flag(&self, flag: HeaderFlags) {
        self.flags.fetch_and(!flag.0, Ordering::Relaxed);
    }

    /// Atomically OR flags and return the *previous* flags value.
    #[inline(always)]
    pub fn fetch_or_flags(&self, flag: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.flags.fetch_or(flag.0, Ordering::Relaxed))
    }

    /// Back to the state every object has between cycles.
    #[inline(always)]
    pub fn reset_mark_state(&self) {
        self.set_color(Color::White);
        self.remove_flag(HeaderFlags::REMEMBERED.with(HeaderFlags::DISCOVERED));
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.object_type())
            .field("color", &self.color())
            .field("flags", &self.flags())
            .field("hash", &self.hash)
            .finish()
    }
}
