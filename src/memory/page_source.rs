use super::stats;
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::Mutex;
use fixedbitset::FixedBitSet;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Supplier of fixed-size, size-aligned pages for a z3fold pool.
///
/// Implementations may block or take their own locks: the pool never calls
/// into a source while holding its own lock.
pub trait PageSource: Send + Sync {
    /// Size of every page handed out. A power of two; every page is aligned
    /// to it so the low bits of a page address are free for buddy ordinals.
    fn page_size(&self) -> usize;

    /// Hand out one page.
    ///
    /// # Errors
    ///
    /// Returns `VmError` when no page can be supplied.
    fn acquire_page(&self, allow_high_memory: bool) -> Result<NonNull<u8>, VmError>;

    /// Take a page back.
    ///
    /// # Safety
    /// - `page` must have been returned by [`acquire_page`](Self::acquire_page)
    ///   on this exact source.
    /// - `page` must not have been released already and must not be used
    ///   after this call.
    unsafe fn release_page(&self, page: NonNull<u8>);
}

struct ArenaState {
    /// Released page indices, reused LIFO.
    free_list: Vec<usize>,
    /// High-water mark: pages below it have been handed out at least once.
    next_fresh: usize,
    live_mask: FixedBitSet,
    /// Live pages per commit unit.
    unit_live: Vec<u32>,
    unit_committed: FixedBitSet,
    live_count: usize,
    actual_committed: usize,
}

/// Page source backed by a single VM reservation.
///
/// Address space for `capacity` bytes is reserved up front and aligned to
/// the commit unit (`max(page_size, OS page size)`). Units are committed
/// the first time one of their pages is handed out and stay committed after
/// release until [`trim`](Self::trim).
pub struct PageArena {
    state: Mutex<ArenaState>,
    base: NonNull<u8>,
    page_size: usize,
    commit_unit: usize,
    pages_per_unit: usize,
    capacity_pages: usize,
    /// Original pointer from reserve (may differ from base due to alignment)
    original_ptr: NonNull<u8>,
    /// Total reserved including alignment padding
    reserved_including_padding: usize,
}

// Safety: PageArena owns the reservation; all mutable state is behind the
// Mutex and `base`/`original_ptr` are never written after construction.
unsafe impl Send for PageArena {}
// Safety: see above.
unsafe impl Sync for PageArena {}

impl PageArena {
    /// Reserve an arena of at least `capacity` bytes of `page_size` pages.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if `page_size` is not a power of two, the capacity
    /// calculation overflows, or the reservation fails.
    pub fn new(page_size: usize, capacity: usize) -> Result<Self, VmError> {
        if !page_size.is_power_of_two() {
            return Err(VmError::InitializationFailed(format!(
                "page size {page_size} is not a power of two"
            )));
        }
        let commit_unit = page_size.max(PlatformVmOps::page_size());
        let capacity = capacity.max(1).next_multiple_of(commit_unit);
        let reserved_including_padding = capacity.checked_add(commit_unit).ok_or_else(|| {
            VmError::InitializationFailed("PageArena reservation size overflow".to_string())
        })?;
        // Safety: FFI call to reserve memory.
        let original_ptr = unsafe { PlatformVmOps::reserve(reserved_including_padding)? };

        let aligned_addr = (original_ptr.as_ptr() as usize).next_multiple_of(commit_unit);
        let offset = aligned_addr - original_ptr.as_ptr() as usize;
        // Safety: offset < commit_unit, inside the padded reservation.
        let base = unsafe { NonNull::new_unchecked(original_ptr.as_ptr().add(offset)) };

        stats::TOTAL_RESERVED.add(reserved_including_padding);

        let capacity_pages = capacity / page_size;
        let units = capacity / commit_unit;
        log::debug!(
            "page arena reserved: {capacity_pages} x {page_size} bytes, commit unit {commit_unit}"
        );

        Ok(Self {
            state: Mutex::new(ArenaState {
                free_list: Vec::new(),
                next_fresh: 0,
                live_mask: FixedBitSet::with_capacity(capacity_pages),
                unit_live: vec![0; units],
                unit_committed: FixedBitSet::with_capacity(units),
                live_count: 0,
                actual_committed: 0,
            }),
            base,
            page_size,
            commit_unit,
            pages_per_unit: commit_unit / page_size,
            capacity_pages,
            original_ptr,
            reserved_including_padding,
        })
    }

    #[inline]
    fn page_ptr(&self, index: usize) -> NonNull<u8> {
        // Safety: index < capacity_pages, inside the reservation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.page_size)) }
    }

    #[inline]
    fn unit_ptr(&self, unit: usize) -> NonNull<u8> {
        // Safety: unit < number of units, inside the reservation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(unit * self.commit_unit)) }
    }

    fn alloc_index(&self, state: &mut ArenaState) -> Result<usize, VmError> {
        let index = match state.free_list.last().copied() {
            Some(index) => index,
            None if state.next_fresh < self.capacity_pages => state.next_fresh,
            None => {
                return Err(VmError::Exhausted {
                    capacity: self.capacity_pages,
                });
            }
        };

        let unit = index / self.pages_per_unit;
        if !state.unit_committed.contains(unit) {
            // Safety: FFI call to commit memory inside our reservation.
            unsafe { PlatformVmOps::commit(self.unit_ptr(unit), self.commit_unit)? };
            state.unit_committed.insert(unit);
            state.actual_committed += self.commit_unit;
            stats::TOTAL_COMMITTED.add(self.commit_unit);
        }

        // Take the index only after the commit succeeded.
        if state.free_list.last() == Some(&index) {
            state.free_list.pop();
        } else {
            state.next_fresh += 1;
        }
        state.unit_live[unit] += 1;
        state.live_mask.insert(index);
        state.live_count += 1;
        Ok(index)
    }

    #[must_use]
    pub fn live_pages(&self) -> usize {
        crate::sync::lock(&self.state).live_count
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        crate::sync::lock(&self.state).actual_committed
    }

    #[must_use]
    pub fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    /// Decommit every unit without live pages. Capacity remains reserved.
    pub fn trim(&self) {
        let mut state = crate::sync::lock(&self.state);
        let mut decommitted = 0;
        for unit in 0..state.unit_live.len() {
            if state.unit_live[unit] != 0 || !state.unit_committed.contains(unit) {
                continue;
            }
            // Safety: FFI call to decommit a unit we committed.
            match unsafe { PlatformVmOps::decommit(self.unit_ptr(unit), self.commit_unit) } {
                Ok(()) => {
                    state.unit_committed.set(unit, false);
                    decommitted += 1;
                }
                Err(e) => log::error!("page arena: decommit of unit {unit} failed: {e}"),
            }
        }

        if decommitted > 0 {
            let bytes = decommitted * self.commit_unit;
            state.actual_committed -= bytes;
            stats::sub_saturating(&stats::TOTAL_COMMITTED, bytes);
        }
    }
}

impl PageSource for PageArena {
    fn page_size(&self) -> usize {
        self.page_size
    }

    /// Arena pages are always directly addressable; `allow_high_memory` has
    /// no effect.
    fn acquire_page(&self, _allow_high_memory: bool) -> Result<NonNull<u8>, VmError> {
        let mut state = crate::sync::lock(&self.state);
        let index = self.alloc_index(&mut state)?;
        drop(state);

        let ptr = self.page_ptr(index);
        #[cfg(debug_assertions)]
        // Safety: the page is committed and exclusively ours.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, self.page_size);
        }
        Ok(ptr)
    }

    unsafe fn release_page(&self, page: NonNull<u8>) {
        let addr = page.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;

        if addr < base || addr >= base + self.capacity_pages * self.page_size {
            debug_assert!(false, "Page {page:p} does not belong to this PageArena");
            log::error!("page arena: release of foreign page {page:p} ignored");
            return;
        }
        let offset = addr - base;
        if !offset.is_multiple_of(self.page_size) {
            debug_assert!(false, "Page {page:p} is not aligned to the arena page size");
            log::error!("page arena: release of misaligned page {page:p} ignored");
            return;
        }

        let index = offset / self.page_size;
        let mut state = crate::sync::lock(&self.state);
        if !state.live_mask.contains(index) {
            debug_assert!(false, "Double release detected in PageArena for page {page:p}");
            log::error!("page arena: double release of page {page:p} ignored");
            return;
        }

        state.live_mask.set(index, false);
        state.unit_live[index / self.pages_per_unit] -= 1;
        state.free_list.push(index);
        state.live_count -= 1;
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(s) => s,
            Err(e) => e.into_inner(),
        };
        if state.live_count > 0 {
            log::warn!(
                "page arena dropped with {} live pages still handed out",
                state.live_count
            );
        }
        let committed = state.actual_committed;

        // Safety: the arena is going away; nothing may use its pages.
        unsafe {
            drop(PlatformVmOps::release(self.original_ptr, self.reserved_including_padding));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reserved_including_padding);
        if committed > 0 {
            stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
        }
    }
}

/// Page source drawing size-aligned pages from the global allocator.
pub struct HeapPageSource {
    layout: Layout,
    limit: Option<usize>,
    live: AtomicUsize,
}

impl HeapPageSource {
    /// Unbounded source of `page_size` pages.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if `page_size` is not a power
    /// of two.
    pub fn new(page_size: usize) -> Result<Self, VmError> {
        Self::build(page_size, None)
    }

    /// Source that refuses to hand out more than `max_pages` at once.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_limit(page_size: usize, max_pages: usize) -> Result<Self, VmError> {
        Self::build(page_size, Some(max_pages))
    }

    fn build(page_size: usize, limit: Option<usize>) -> Result<Self, VmError> {
        if !page_size.is_power_of_two() {
            return Err(VmError::InitializationFailed(format!(
                "page size {page_size} is not a power of two"
            )));
        }
        let layout = Layout::from_size_align(page_size, page_size)
            .map_err(|e| VmError::InitializationFailed(e.to_string()))?;
        Ok(Self {
            layout,
            limit,
            live: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl PageSource for HeapPageSource {
    fn page_size(&self) -> usize {
        self.layout.size()
    }

    fn acquire_page(&self, _allow_high_memory: bool) -> Result<NonNull<u8>, VmError> {
        let live = self.live.fetch_add(1, Ordering::Relaxed);
        if let Some(limit) = self.limit
            && live >= limit
        {
            self.live.fetch_sub(1, Ordering::Relaxed);
            return Err(VmError::Exhausted { capacity: limit });
        }

        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(self.layout) };
        NonNull::new(ptr).ok_or_else(|| {
            self.live.fetch_sub(1, Ordering::Relaxed);
            VmError::CommitFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "global allocator returned null",
            ))
        })
    }

    unsafe fn release_page(&self, page: NonNull<u8>) {
        // Safety: page came from acquire_page with the same layout.
        unsafe { std::alloc::dealloc(page.as_ptr(), self.layout) };
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}
