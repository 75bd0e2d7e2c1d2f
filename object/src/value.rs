/// Tag constants.
const FIXNUM_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b11;
const REF_TAG: u64 = 0b01;
const ADDRESS_SHIFT: u32 = 2;

/// Location of an object cell inside the paged object space.
///
/// ```text
/// bits 16‥31: page index
/// bits  0‥15: cell offset within the page
/// ```
///
/// Addresses are not stable: compaction moves objects to new cells and
/// rewrites every slot that referred to the old address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(u32);

impl Address {
    pub const PAGE_SHIFT: u32 = 16;
    pub const OFFSET_MASK: u32 = (1 << Self::PAGE_SHIFT) - 1;
    pub const MAX_PAGES: usize = 1 << (32 - Self::PAGE_SHIFT);

    #[inline(always)]
    pub const fn new(page: usize, offset: usize) -> Self {
        debug_assert!(offset as u32 <= Self::OFFSET_MASK);
        debug_assert!(page < Self::MAX_PAGES);
        Self(((page as u32) << Self::PAGE_SHIFT) | offset as u32)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn page(self) -> usize {
        (self.0 >> Self::PAGE_SHIFT) as usize
    }

    #[inline(always)]
    pub const fn offset(self) -> usize {
        (self.0 & Self::OFFSET_MASK) as usize
    }
}

impl core::fmt::Debug for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "@{}:{}", self.page(), self.offset())
    }
}

/// A tagged 64-bit value.
///
/// Encoding:
/// - **Fixnum**:    `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **Reference**: `...XXXX01`: object [`Address`] shifted left by two.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// Fixnum zero. Used as the filler for empty fields and cleared roots.
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Fixnum ─────────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_MASK == 0
    }

    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        debug_assert!(
            (-(1i64 << 62)..(1i64 << 62)).contains(&n),
            "fixnum overflow: {n}"
        );
        Self((n << 1) as u64)
    }

    #[inline(always)]
    pub fn to_i64(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 1
    }

    #[inline(always)]
    pub fn as_fixnum(self) -> Option<i64> {
        self.is_fixnum().then(|| self.to_i64())
    }

    // ── Reference ──────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        self.0 & TAG_MASK == REF_TAG
    }

    #[inline(always)]
    pub const fn from_address(address: Address) -> Self {
        Self(((address.raw() as u64) << ADDRESS_SHIFT) | REF_TAG)
    }

    /// The referenced address, or `None` for fixnums.
    #[inline(always)]
    pub const fn address(self) -> Option<Address> {
        if self.is_ref() {
            Some(Address::from_raw((self.0 >> ADDRESS_SHIFT) as u32))
        } else {
            None
        }
    }
}

impl From<Address> for Value {
    fn from(address: Address) -> Self {
        Self::from_address(address)
    }
}

impl core::fmt::Debug for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.address() {
            Some(address) => write!(f, "Ref({address:?})"),
            None => write!(f, "Fixnum({})", self.to_i64()),
        }
    }
}
