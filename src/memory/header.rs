//! Per-page control block.
//!
//! The header describes the (up to) three buddies of a headed page. It is
//! kept in the pool's page table rather than written into the page; the
//! first `zhdr_size_aligned` bytes of every headed page stay reserved so the
//! buddy layout is the same as if it were.

use super::geometry::{Buddy, Geometry};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Z3foldHeader {
    pub first_chunks: u16,
    pub middle_chunks: u16,
    pub last_chunks: u16,
    /// Chunk offset of the MIDDLE buddy, counted from the page start
    /// (the header chunk is chunk 0).
    pub start_middle: u16,
    /// Rotates on every compaction; `nchunks_order` bits wide.
    pub first_num: u8,
}

impl Z3foldHeader {
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first_chunks == 0 && self.middle_chunks == 0 && self.last_chunks == 0
    }

    /// All three slots occupied: the page belongs on the buddied list.
    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.first_chunks != 0 && self.middle_chunks != 0 && self.last_chunks != 0
    }

    #[inline]
    #[must_use]
    pub const fn chunks(&self, buddy: Buddy) -> u16 {
        match buddy {
            Buddy::First => self.first_chunks,
            Buddy::Middle => self.middle_chunks,
            Buddy::Last => self.last_chunks,
            Buddy::Headless => 0,
        }
    }

    /// Free chunks used to pick the page's bucket.
    ///
    /// With a MIDDLE buddy present the free space is split in two; only the
    /// larger gap next to an empty neighbour counts, because that is the
    /// only place a new buddy can go. Both gaps are measured in page-start
    /// coordinates, like `start_middle`.
    #[must_use]
    pub fn num_free_chunks(&self, geometry: &Geometry) -> usize {
        if self.middle_chunks != 0 {
            let before = if self.first_chunks == 0 {
                usize::from(self.start_middle).saturating_sub(1)
            } else {
                0
            };
            let after = if self.last_chunks == 0 {
                geometry
                    .total_chunks()
                    .saturating_sub(usize::from(self.start_middle))
                    .saturating_sub(usize::from(self.middle_chunks))
            } else {
                0
            };
            before.max(after)
        } else {
            geometry
                .nchunks()
                .saturating_sub(usize::from(self.first_chunks))
                .saturating_sub(usize::from(self.last_chunks))
        }
    }

    /// Slot a new buddy of `chunks` chunks goes to, or `None` if every slot
    /// is taken.
    #[must_use]
    pub const fn placement(&self, chunks: usize) -> Option<Buddy> {
        if self.first_chunks == 0 {
            if self.middle_chunks != 0 && chunks >= self.start_middle as usize {
                Some(Buddy::Last)
            } else {
                Some(Buddy::First)
            }
        } else if self.last_chunks == 0 {
            Some(Buddy::Last)
        } else if self.middle_chunks == 0 {
            Some(Buddy::Middle)
        } else {
            None
        }
    }

    /// Record a buddy of `chunks` chunks in `buddy`.
    pub fn occupy(&mut self, buddy: Buddy, chunks: u16) {
        match buddy {
            Buddy::First => self.first_chunks = chunks,
            Buddy::Last => self.last_chunks = chunks,
            Buddy::Middle => {
                self.middle_chunks = chunks;
                self.start_middle = self.first_chunks + 1;
            }
            Buddy::Headless => {}
        }
    }

    /// Clear `buddy`'s slot.
    pub fn release(&mut self, buddy: Buddy) {
        match buddy {
            Buddy::First => self.first_chunks = 0,
            Buddy::Middle => {
                self.middle_chunks = 0;
                self.start_middle = 0;
            }
            Buddy::Last => self.last_chunks = 0,
            Buddy::Headless => {}
        }
    }

    /// Byte offset of `buddy`'s data from the page start.
    #[must_use]
    pub const fn offset_of(&self, buddy: Buddy, geometry: &Geometry) -> usize {
        match buddy {
            Buddy::Headless => 0,
            Buddy::First => geometry.zhdr_size_aligned(),
            Buddy::Middle => geometry.chunks_to_bytes(self.start_middle as usize),
            Buddy::Last => {
                geometry.page_size() - geometry.chunks_to_bytes(self.last_chunks as usize)
            }
        }
    }

    /// Whether the lone-MIDDLE layout can be folded into FIRST.
    #[inline]
    #[must_use]
    pub const fn can_compact(&self) -> bool {
        self.middle_chunks != 0 && self.first_chunks == 0 && self.last_chunks == 0
    }
}

/// Per-page state bits kept beside the header (they also apply to
/// headless pages, which have no header).
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PageFlags(u8);

impl PageFlags {
    /// A reclaim pass owns the page's teardown.
    pub const UNDER_RECLAIM: u8 = 1 << 0;
    /// One object spans the whole page; there is no header.
    pub const PAGE_HEADLESS: u8 = 1 << 1;
    /// The MIDDLE buddy is mapped and must not be moved.
    pub const MIDDLE_CHUNK_MAPPED: u8 = 1 << 2;

    #[inline]
    #[must_use]
    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    #[inline]
    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    #[inline]
    #[must_use]
    pub const fn is_headless(self) -> bool {
        self.contains(Self::PAGE_HEADLESS)
    }

    #[inline]
    #[must_use]
    pub const fn under_reclaim(self) -> bool {
        self.contains(Self::UNDER_RECLAIM)
    }

    #[inline]
    #[must_use]
    pub const fn middle_mapped(self) -> bool {
        self.contains(Self::MIDDLE_CHUNK_MAPPED)
    }
}

impl std::fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFlags")
            .field("under_reclaim", &self.under_reclaim())
            .field("headless", &self.is_headless())
            .field("middle_mapped", &self.middle_mapped())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::geometry::Z3foldConfig;

    fn geom() -> Geometry {
        Z3foldConfig::default().geometry(4096).unwrap()
    }

    fn header(first: u16, middle: u16, last: u16, start_middle: u16) -> Z3foldHeader {
        Z3foldHeader {
            first_chunks: first,
            middle_chunks: middle,
            last_chunks: last,
            start_middle,
            first_num: 0,
        }
    }

    #[test]
    fn test_free_chunks_without_middle() {
        let g = geom();
        assert_eq!(header(0, 0, 0, 0).num_free_chunks(&g), 63);
        assert_eq!(header(8, 0, 0, 0).num_free_chunks(&g), 55);
        assert_eq!(header(8, 0, 10, 0).num_free_chunks(&g), 45);
        assert_eq!(header(0, 0, 10, 0).num_free_chunks(&g), 53);
    }

    #[test]
    fn test_free_chunks_with_middle() {
        let g = geom();
        // FIRST occupied, LAST free: only the tail gap counts, chunks 17..=63.
        assert_eq!(header(8, 8, 0, 9).num_free_chunks(&g), 47);
        // FIRST free, LAST occupied: only the gap before MIDDLE counts.
        assert_eq!(header(0, 8, 8, 9).num_free_chunks(&g), 8);
        // Both neighbours free: the larger gap wins.
        assert_eq!(header(0, 8, 0, 9).num_free_chunks(&g), 47);
        assert_eq!(header(0, 4, 0, 50).num_free_chunks(&g), 49);
        // MIDDLE running to the page end leaves no tail gap.
        assert_eq!(header(8, 55, 0, 9).num_free_chunks(&g), 0);
        // Both neighbours occupied.
        assert_eq!(header(8, 8, 8, 9).num_free_chunks(&g), 0);
    }

    #[test]
    fn test_placement_rules() {
        assert_eq!(header(0, 0, 0, 0).placement(8), Some(Buddy::First));
        assert_eq!(header(8, 0, 0, 0).placement(8), Some(Buddy::Last));
        assert_eq!(header(8, 0, 8, 0).placement(8), Some(Buddy::Middle));
        assert_eq!(header(8, 8, 8, 9).placement(1), None);
        // FIRST free with a MIDDLE present: fits before MIDDLE only if
        // chunks < start_middle.
        assert_eq!(header(0, 8, 0, 9).placement(8), Some(Buddy::First));
        assert_eq!(header(0, 8, 0, 9).placement(9), Some(Buddy::Last));
    }

    #[test]
    fn test_occupy_middle_sets_start() {
        let mut h = header(8, 0, 8, 0);
        h.occupy(Buddy::Middle, 5);
        assert_eq!(h.start_middle, 9);
        assert!(h.is_full());
        h.release(Buddy::Middle);
        assert_eq!(h.start_middle, 0);
        assert_eq!(h.middle_chunks, 0);
    }

    #[test]
    fn test_offsets() {
        let g = geom();
        let h = header(8, 4, 10, 9);
        assert_eq!(h.offset_of(Buddy::First, &g), 64);
        assert_eq!(h.offset_of(Buddy::Middle, &g), 9 * 64);
        assert_eq!(h.offset_of(Buddy::Last, &g), 4096 - 640);
        assert_eq!(h.offset_of(Buddy::Headless, &g), 0);
    }

    #[test]
    fn test_page_flags() {
        let mut f = PageFlags::default();
        assert!(!f.under_reclaim());
        f.set(PageFlags::UNDER_RECLAIM);
        f.set(PageFlags::MIDDLE_CHUNK_MAPPED);
        assert!(f.under_reclaim() && f.middle_mapped() && !f.is_headless());
        f.clear(PageFlags::UNDER_RECLAIM);
        assert!(!f.under_reclaim() && f.middle_mapped());
    }
}
