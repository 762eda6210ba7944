//! Chunk geometry and the handle codec.
//!
//! A page is split into `2^nchunks_order` equal chunks. The first chunk is
//! reserved for the page header, so `nchunks = 2^nchunks_order - 1` chunks
//! are usable by buddies. Handles are page base addresses with the buddy
//! ordinal (rotated by the page's `first_num`) stored in the low bits, which
//! are free because pages are aligned to `page_size > 2^nchunks_order`.

use super::z3fold::Z3foldError;
use std::fmt;

pub const DEFAULT_NCHUNKS_ORDER: u32 = 6;
pub const MIN_NCHUNKS_ORDER: u32 = 2;
/// `first_num` is kept in a `u8`.
pub const MAX_NCHUNKS_ORDER: u32 = 8;

/// Pool configuration. The page size itself is a property of the page source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Z3foldConfig {
    /// log2 of the number of chunks per page. Default: 6 (64 chunks).
    pub nchunks_order: u32,
}

impl Default for Z3foldConfig {
    fn default() -> Self {
        Self {
            nchunks_order: DEFAULT_NCHUNKS_ORDER,
        }
    }
}

impl Z3foldConfig {
    /// Derive the chunk geometry for pages of `page_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the page size is not a power of two, the
    /// order is outside `[MIN_NCHUNKS_ORDER, MAX_NCHUNKS_ORDER]`, or a chunk
    /// would be smaller than one byte.
    pub fn geometry(&self, page_size: usize) -> Result<Geometry, Z3foldError> {
        if !page_size.is_power_of_two() {
            return Err(Z3foldError::InvalidConfig(format!(
                "page size {page_size} is not a power of two"
            )));
        }
        let order = self.nchunks_order;
        if !(MIN_NCHUNKS_ORDER..=MAX_NCHUNKS_ORDER).contains(&order) {
            return Err(Z3foldError::InvalidConfig(format!(
                "nchunks_order {order} outside [{MIN_NCHUNKS_ORDER}, {MAX_NCHUNKS_ORDER}]"
            )));
        }
        let page_shift = page_size.trailing_zeros();
        if page_shift < order {
            return Err(Z3foldError::InvalidConfig(format!(
                "page size {page_size} cannot hold {} chunks",
                1usize << order
            )));
        }
        Ok(Geometry {
            page_size,
            nchunks_order: order,
            chunk_shift: page_shift - order,
        })
    }
}

/// Slot of a buddy inside a page. The discriminant is the ordinal stored
/// in handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Buddy {
    Headless = 0,
    First = 1,
    Middle = 2,
    Last = 3,
}

impl Buddy {
    #[inline]
    #[must_use]
    pub const fn ordinal(self) -> usize {
        self as usize
    }

    /// Map a decoded ordinal back to a slot of a headed page.
    #[inline]
    #[must_use]
    pub const fn from_ordinal(ordinal: usize) -> Option<Self> {
        match ordinal {
            1 => Some(Buddy::First),
            2 => Some(Buddy::Middle),
            3 => Some(Buddy::Last),
            _ => None,
        }
    }
}

/// Opaque reference to a stored object, valid from `alloc` until the
/// matching `free`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    page_size: usize,
    nchunks_order: u32,
    chunk_shift: u32,
}

impl Geometry {
    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn nchunks_order(&self) -> u32 {
        self.nchunks_order
    }

    #[inline]
    #[must_use]
    pub const fn chunk_shift(&self) -> u32 {
        self.chunk_shift
    }

    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        1 << self.chunk_shift
    }

    #[inline]
    #[must_use]
    pub const fn total_chunks(&self) -> usize {
        1 << self.nchunks_order
    }

    /// Chunks usable by buddies (every chunk but the header's).
    #[inline]
    #[must_use]
    pub const fn nchunks(&self) -> usize {
        (self.page_size - self.zhdr_size_aligned()) >> self.chunk_shift
    }

    /// Bytes reserved at the start of a headed page.
    #[inline]
    #[must_use]
    pub const fn zhdr_size_aligned(&self) -> usize {
        self.chunk_size()
    }

    #[inline]
    #[must_use]
    pub const fn buddy_mask(&self) -> usize {
        (1 << self.nchunks_order) - 1
    }

    /// Largest request that still shares a page; anything above is headless.
    #[inline]
    #[must_use]
    pub const fn max_buddy_size(&self) -> usize {
        self.page_size - self.zhdr_size_aligned() - self.chunk_size()
    }

    #[inline]
    #[must_use]
    pub const fn size_to_chunks(&self, size: usize) -> usize {
        (size + self.chunk_size() - 1) >> self.chunk_shift
    }

    #[inline]
    #[must_use]
    pub const fn chunks_to_bytes(&self, chunks: usize) -> usize {
        chunks << self.chunk_shift
    }

    #[inline]
    #[must_use]
    pub const fn page_base(&self, addr: usize) -> usize {
        addr & !(self.page_size - 1)
    }

    /// Encode `buddy` of the page at `base`. Headless handles are the bare
    /// page address.
    #[inline]
    #[must_use]
    pub const fn encode_handle(&self, base: usize, buddy: Buddy, first_num: u8) -> Handle {
        let mut handle = base;
        if !matches!(buddy, Buddy::Headless) {
            handle += (buddy.ordinal() + first_num as usize) & self.buddy_mask();
        }
        Handle(handle)
    }

    #[inline]
    #[must_use]
    pub const fn handle_base(&self, handle: Handle) -> usize {
        self.page_base(handle.0)
    }

    /// Decode the slot of a handle on a headed page. `None` means the
    /// ordinal names no slot under the page's current `first_num`.
    #[inline]
    #[must_use]
    pub const fn handle_buddy(&self, handle: Handle, first_num: u8) -> Option<Buddy> {
        let ordinal = handle.0.wrapping_sub(first_num as usize) & self.buddy_mask();
        Buddy::from_ordinal(ordinal)
    }

    /// Next value of a `first_num` field, which is `nchunks_order` bits wide.
    #[inline]
    #[must_use]
    pub const fn next_first_num(&self, first_num: u8) -> u8 {
        // buddy_mask < 256 by MAX_NCHUNKS_ORDER.
        ((first_num as usize + 1) & self.buddy_mask()) as u8
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn geom() -> Geometry {
        Z3foldConfig::default().geometry(4096).unwrap()
    }

    #[test]
    fn test_default_geometry_4k() {
        let g = geom();
        assert_eq!(g.chunk_shift(), 6);
        assert_eq!(g.chunk_size(), 64);
        assert_eq!(g.total_chunks(), 64);
        assert_eq!(g.nchunks(), 63);
        assert_eq!(g.zhdr_size_aligned(), 64);
        assert_eq!(g.buddy_mask(), 63);
        assert_eq!(g.max_buddy_size(), 4096 - 128);
    }

    #[test]
    fn test_size_to_chunks_rounds_up() {
        let g = geom();
        assert_eq!(g.size_to_chunks(1), 1);
        assert_eq!(g.size_to_chunks(64), 1);
        assert_eq!(g.size_to_chunks(65), 2);
        assert_eq!(g.size_to_chunks(500), 8);
        assert_eq!(g.size_to_chunks(g.max_buddy_size()), 62);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let cfg = Z3foldConfig::default();
        assert!(matches!(cfg.geometry(3000), Err(Z3foldError::InvalidConfig(_))));
        assert!(matches!(cfg.geometry(32), Err(Z3foldError::InvalidConfig(_))));

        let cfg = Z3foldConfig { nchunks_order: 1 };
        assert!(matches!(cfg.geometry(4096), Err(Z3foldError::InvalidConfig(_))));
        let cfg = Z3foldConfig { nchunks_order: 9 };
        assert!(matches!(cfg.geometry(4096), Err(Z3foldError::InvalidConfig(_))));
    }

    #[test]
    fn test_order_changes_granularity() {
        let g = Z3foldConfig { nchunks_order: 4 }.geometry(16384).unwrap();
        assert_eq!(g.chunk_size(), 1024);
        assert_eq!(g.nchunks(), 15);
        assert_eq!(g.size_to_chunks(1025), 2);
    }

    #[test]
    fn test_handle_codec() {
        let g = geom();
        let base = 0x7f00_0000_3000;

        let h = g.encode_handle(base, Buddy::Headless, 17);
        assert_eq!(h.as_raw(), base);
        assert_eq!(g.handle_base(h), base);

        for first_num in [0u8, 1, 62, 63] {
            for buddy in [Buddy::First, Buddy::Middle, Buddy::Last] {
                let h = g.encode_handle(base, buddy, first_num);
                assert_eq!(g.handle_base(h), base);
                assert_eq!(g.handle_buddy(h, first_num), Some(buddy));
            }
        }
    }

    #[test]
    fn test_first_num_rotation_shifts_decode() {
        let g = geom();
        let base = 0x10_0000;
        let fnum = 5;
        let first = g.encode_handle(base, Buddy::First, fnum);
        let middle = g.encode_handle(base, Buddy::Middle, fnum);
        let bumped = g.next_first_num(fnum);

        // The object that was MIDDLE now sits in FIRST; its handle follows it.
        assert_eq!(g.handle_buddy(middle, bumped), Some(Buddy::First));
        // The old FIRST handle no longer names any slot.
        assert_eq!(g.handle_buddy(first, bumped), None);
    }

    #[test]
    fn test_first_num_wraps() {
        let g = geom();
        assert_eq!(g.next_first_num(63), 0);
        let h = g.encode_handle(0x2000, Buddy::First, 63);
        // (1 + 63) & 63 == 0: the handle equals the base but is not headless.
        assert_eq!(h.as_raw(), 0x2000);
        assert_eq!(g.handle_buddy(h, 63), Some(Buddy::First));
    }
}
