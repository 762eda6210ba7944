//! z3fold: a special-purpose allocator for compressed pages.
//!
//! Up to three objects ("buddies") share one page: FIRST right after the
//! header chunk, LAST flush against the page end, and MIDDLE wherever the
//! gap between them allowed when it was placed. Objects too large to share
//! get a headless page of their own. Partially filled pages are kept in
//! buckets indexed by their free-chunk count so an allocation of `n` chunks
//! takes the first page from the first non-empty bucket `>= n`. Every page
//! is also on an LRU list that [`Z3foldPool::reclaim`] walks from the tail,
//! asking the pool's [`EvictionHandler`] to move each buddy out.
//!
//! One lock guards all lists, every page header and the page flags. It is
//! never held while calling the page source or the eviction handler.

use super::geometry::{Buddy, Geometry, Handle, Z3foldConfig};
use super::header::PageFlags;
use super::page_list::{BuddyList, LinkKind, PageId, PageList, PageTable};
use super::page_source::PageSource;
use super::stats;
use super::vm::VmError;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Mutex, MutexGuard};
use std::fmt;
use std::ptr::NonNull;
// Shared ownership of trait objects only; not a synchronization point.
use std::sync::Arc;

#[derive(Debug)]
pub enum Z3foldError {
    /// Zero-size request, or a request for memory the pool cannot map.
    InvalidArgument(&'static str),
    /// The request does not fit in one page.
    TooLarge { size: usize, page_size: usize },
    /// The page source could not supply a page.
    OutOfMemory(VmError),
    /// Reclaim was called without a handler, on an empty pool, or with zero
    /// attempts.
    InvalidState(&'static str),
    /// Every reclaim attempt left its page partially occupied.
    RetryExhausted { attempts: usize },
    InvalidConfig(String),
    /// Raised by eviction handlers that could not move an object out.
    EvictionFailed(String),
    UnknownDriver(String),
    DriverExists(String),
}

impl fmt::Display for Z3foldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Z3foldError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Z3foldError::TooLarge { size, page_size } => write!(
                f,
                "allocation of {size} bytes exceeds page size {page_size}"
            ),
            Z3foldError::OutOfMemory(e) => write!(f, "out of memory: {e}"),
            Z3foldError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Z3foldError::RetryExhausted { attempts } => {
                write!(f, "no page freed after {attempts} reclaim attempts")
            }
            Z3foldError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Z3foldError::EvictionFailed(msg) => write!(f, "eviction failed: {msg}"),
            Z3foldError::UnknownDriver(name) => write!(f, "no zpool driver named {name:?}"),
            Z3foldError::DriverExists(name) => {
                write!(f, "zpool driver {name:?} is already registered")
            }
        }
    }
}

impl std::error::Error for Z3foldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Z3foldError::OutOfMemory(e) => Some(e),
            _ => None,
        }
    }
}

/// Moves stored objects out of the pool on behalf of [`Z3foldPool::reclaim`].
///
/// On success the handler has dropped its own references to `handle` and
/// called [`Z3foldPool::free`] on it. On failure the object stays where it
/// is. A handler must never free the same handle twice.
pub trait EvictionHandler: Send + Sync {
    /// # Errors
    ///
    /// Any error stops the eviction of the remaining buddies of this page.
    fn evict(&self, pool: &Z3foldPool, handle: Handle) -> Result<(), Z3foldError>;
}

impl<F> EvictionHandler for F
where
    F: Fn(&Z3foldPool, Handle) -> Result<(), Z3foldError> + Send + Sync,
{
    fn evict(&self, pool: &Z3foldPool, handle: Handle) -> Result<(), Z3foldError> {
        self(pool, handle)
    }
}

/// Snapshot of a pool's bookkeeping, taken under the pool lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pages: u64,
    pub headless_pages: usize,
    /// Pages with all three buddies in use.
    pub buddied: usize,
    /// Pages in any free bucket.
    pub unbuddied: usize,
    /// `buckets[i]`: pages with `i` free chunks.
    pub buckets: Vec<usize>,
    pub lru: usize,
    pub compactions: u64,
    pub reclaimed: u64,
}

struct PoolInner {
    table: PageTable,
    /// `unbuddied[i]` holds pages with `i` free chunks.
    unbuddied: Vec<PageList>,
    buddied: PageList,
    lru: PageList,
    compactions: u64,
    reclaimed: u64,
}

// Safety: the raw page pointers in the table are owned by the pool and only
// dereferenced under the pool lock.
unsafe impl Send for PoolInner {}

impl PoolInner {
    fn new(geometry: &Geometry) -> Self {
        Self {
            table: PageTable::new(),
            unbuddied: (0..geometry.nchunks())
                .map(|_| PageList::new(LinkKind::Buddy))
                .collect(),
            buddied: PageList::new(LinkKind::Buddy),
            lru: PageList::new(LinkKind::Lru),
            compactions: 0,
            reclaimed: 0,
        }
    }

    /// Take the page off its bucket or the buddied list.
    fn detach_buddy(&mut self, id: PageId) {
        match self.table.get(id).membership {
            BuddyList::Unbuddied(i) => self.unbuddied[i].remove(&mut self.table, id),
            BuddyList::Buddied => self.buddied.remove(&mut self.table, id),
            BuddyList::Detached => return,
        }
        self.table.get_mut(id).membership = BuddyList::Detached;
    }

    /// Put a detached, headed page where its header says it belongs.
    fn rebucket(&mut self, id: PageId, geometry: &Geometry) {
        debug_assert_eq!(self.table.get(id).membership, BuddyList::Detached);
        let header = self.table.get(id).header;
        let membership = if header.is_full() {
            self.buddied.push_front(&mut self.table, id);
            BuddyList::Buddied
        } else {
            let free = header
                .num_free_chunks(geometry)
                .min(self.unbuddied.len() - 1);
            self.unbuddied[free].push_front(&mut self.table, id);
            BuddyList::Unbuddied(free)
        };
        self.table.get_mut(id).membership = membership;
    }

    fn touch_lru(&mut self, id: PageId) {
        if self.table.get(id).on_lru() {
            self.lru.remove(&mut self.table, id);
        }
        self.lru.push_front(&mut self.table, id);
    }

    /// First page able to take `chunks` more chunks, detached from its
    /// bucket, and the slot to use.
    fn find_unbuddied(&mut self, chunks: usize) -> Option<(PageId, Buddy)> {
        for i in chunks..self.unbuddied.len() {
            let mut cursor = self.unbuddied[i].front();
            while let Some(id) = cursor {
                let desc = self.table.get(id);
                if let Some(buddy) = desc.header.placement(chunks) {
                    self.detach_buddy(id);
                    return Some((id, buddy));
                }
                log::error!(
                    "z3fold: page {:#x} in bucket {i} has no free slot ({:?})",
                    desc.addr(),
                    desc.header
                );
                cursor = self.unbuddied[i].next(&self.table, id);
            }
        }
        None
    }

    fn place(&mut self, id: PageId, buddy: Buddy, chunks: usize, geometry: &Geometry) -> Handle {
        // chunks <= nchunks < 2^MAX_NCHUNKS_ORDER
        #[allow(clippy::cast_possible_truncation)]
        self.table.get_mut(id).header.occupy(buddy, chunks as u16);
        self.rebucket(id, geometry);
        self.touch_lru(id);

        let desc = self.table.get(id);
        geometry.encode_handle(desc.addr(), buddy, desc.header.first_num)
    }

    /// Fold a lone, unmapped MIDDLE buddy into the FIRST position.
    fn compact(&mut self, id: PageId, geometry: &Geometry) -> bool {
        let desc = self.table.get_mut(id);
        if desc.flags.middle_mapped() || !desc.header.can_compact() {
            return false;
        }

        let header = &mut desc.header;
        let src = geometry.chunks_to_bytes(usize::from(header.start_middle));
        let len = geometry.chunks_to_bytes(usize::from(header.middle_chunks));
        // Safety: both ranges lie inside the page, which the pool owns; the
        // MIDDLE buddy is not mapped, and FIRST/LAST are empty. `copy`
        // handles the overlap.
        unsafe {
            std::ptr::copy(
                desc.base.as_ptr().add(src),
                desc.base.as_ptr().add(geometry.zhdr_size_aligned()),
                len,
            );
        }
        header.first_chunks = header.middle_chunks;
        header.middle_chunks = 0;
        header.start_middle = 0;
        header.first_num = geometry.next_first_num(header.first_num);

        log::trace!("z3fold: compacted page {:#x}", desc.addr());
        self.compactions += 1;
        stats::Z3FOLD_COMPACTIONS.add(1);
        true
    }

    /// Forget an emptied page and hand back its address for release.
    fn teardown(&mut self, id: PageId) -> Option<NonNull<u8>> {
        if self.table.get(id).on_lru() {
            self.lru.remove(&mut self.table, id);
        }
        self.detach_buddy(id);
        self.table.remove(id).map(|desc| desc.base)
    }
}

pub struct Z3foldPool {
    geometry: Geometry,
    inner: Mutex<PoolInner>,
    /// Readable without the lock; see [`Z3foldPool::size`].
    pages_nr: AtomicU64,
    source: Arc<dyn PageSource>,
    handler: Option<Arc<dyn EvictionHandler>>,
}

impl Z3foldPool {
    /// Create a pool with the default geometry (64 chunks per page).
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the source's page size cannot be split into
    /// chunks.
    pub fn new(
        source: Arc<dyn PageSource>,
        handler: Option<Arc<dyn EvictionHandler>>,
    ) -> Result<Self, Z3foldError> {
        Self::with_config(source, handler, &Z3foldConfig::default())
    }

    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not fit the source's page size.
    pub fn with_config(
        source: Arc<dyn PageSource>,
        handler: Option<Arc<dyn EvictionHandler>>,
        config: &Z3foldConfig,
    ) -> Result<Self, Z3foldError> {
        let geometry = config.geometry(source.page_size())?;
        log::debug!(
            "z3fold: pool created, page {} bytes, {} usable chunks of {} bytes",
            geometry.page_size(),
            geometry.nchunks(),
            geometry.chunk_size()
        );
        Ok(Self {
            inner: Mutex::new(PoolInner::new(&geometry)),
            geometry,
            pages_nr: AtomicU64::new(0),
            source,
            handler,
        })
    }

    #[inline]
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        crate::sync::lock(&self.inner)
    }

    fn acquire_page(&self, allow_high_memory: bool) -> Result<NonNull<u8>, Z3foldError> {
        let page = self
            .source
            .acquire_page(allow_high_memory)
            .map_err(Z3foldError::OutOfMemory)?;
        let addr = page.as_ptr() as usize;
        if self.geometry.page_base(addr) != addr {
            // Safety: the page came from this source a moment ago.
            unsafe { self.source.release_page(page) };
            return Err(Z3foldError::OutOfMemory(VmError::Misaligned {
                addr,
                align: self.geometry.page_size(),
            }));
        }
        Ok(page)
    }

    fn release_page(&self, page: NonNull<u8>) {
        log::trace!("z3fold: releasing page {page:p}");
        // Safety: the page was acquired from this source and its descriptor
        // is gone, so no handle can reach it any more.
        unsafe { self.source.release_page(page) };
    }

    fn page_added(&self) {
        self.pages_nr.fetch_add(1, Ordering::Relaxed);
        stats::Z3FOLD_PAGES.add(1);
    }

    fn page_removed(&self) {
        self.pages_nr.fetch_sub(1, Ordering::Relaxed);
        stats::sub_saturating(&stats::Z3FOLD_PAGES, 1);
    }

    /// Store an object of `size` bytes and return its handle. The bytes are
    /// written by the caller through [`map`](Self::map).
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for `size == 0` or `allow_high_memory`: pages must
    ///   be directly addressable.
    /// - `TooLarge` if `size` exceeds the page size.
    /// - `OutOfMemory` if a new page was needed and the source had none.
    pub fn alloc(&self, size: usize, allow_high_memory: bool) -> Result<Handle, Z3foldError> {
        let geometry = &self.geometry;
        if size == 0 {
            return Err(Z3foldError::InvalidArgument("zero-size allocation"));
        }
        if allow_high_memory {
            return Err(Z3foldError::InvalidArgument(
                "high memory pages cannot be directly mapped",
            ));
        }
        if size > geometry.page_size() {
            return Err(Z3foldError::TooLarge {
                size,
                page_size: geometry.page_size(),
            });
        }

        if size > geometry.max_buddy_size() {
            let page = self.acquire_page(allow_high_memory)?;
            let mut guard = self.lock();
            let inner = &mut *guard;
            let id = inner.table.insert(page);
            inner
                .table
                .get_mut(id)
                .flags
                .set(PageFlags::PAGE_HEADLESS);
            inner.lru.push_front(&mut inner.table, id);
            self.page_added();
            log::trace!("z3fold: headless page {page:p} for {size} bytes");
            return Ok(geometry.encode_handle(page.as_ptr() as usize, Buddy::Headless, 0));
        }

        let chunks = geometry.size_to_chunks(size);
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if let Some((id, buddy)) = inner.find_unbuddied(chunks) {
                return Ok(inner.place(id, buddy, chunks, geometry));
            }
        }

        let page = self.acquire_page(allow_high_memory)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let id = inner.table.insert(page);
        self.page_added();
        log::trace!("z3fold: new page {page:p}");
        Ok(inner.place(id, Buddy::First, chunks, geometry))
    }

    /// Release the object behind `handle`.
    ///
    /// `handle` must come from [`alloc`](Self::alloc) on this pool and not
    /// have been freed. Handles of pages this pool does not own are logged
    /// and ignored.
    pub fn free(&self, handle: Handle) {
        let geometry = &self.geometry;
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(id) = inner.table.lookup(geometry.handle_base(handle)) else {
            log::error!("z3fold: free of unknown handle {handle}");
            return;
        };
        let desc = inner.table.get_mut(id);
        let headless = desc.flags.is_headless();
        if !headless {
            let Some(buddy) = geometry.handle_buddy(handle, desc.header.first_num) else {
                log::error!("z3fold: free of handle {handle} naming no buddy");
                return;
            };
            desc.header.release(buddy);
        }

        // An in-flight reclaim owns this page's teardown.
        if desc.flags.under_reclaim() {
            return;
        }

        if !headless {
            inner.detach_buddy(id);
        }
        if headless || inner.table.get(id).header.is_empty() {
            let page = inner.teardown(id);
            self.page_removed();
            drop(guard);
            if let Some(page) = page {
                self.release_page(page);
            }
        } else {
            inner.compact(id, geometry);
            inner.rebucket(id, geometry);
        }
    }

    /// Address of the object behind `handle`. For a MIDDLE buddy this also
    /// pins it in place until [`unmap`](Self::unmap).
    ///
    /// Returns `None` if the handle names no live buddy.
    #[must_use]
    pub fn map(&self, handle: Handle) -> Option<NonNull<u8>> {
        let geometry = &self.geometry;
        let mut guard = self.lock();
        let Some(id) = guard.table.lookup(geometry.handle_base(handle)) else {
            log::error!("z3fold: map of unknown handle {handle}");
            return None;
        };
        let desc = guard.table.get_mut(id);
        if desc.flags.is_headless() {
            return Some(desc.base);
        }

        let Some(buddy) = geometry.handle_buddy(handle, desc.header.first_num) else {
            log::error!("z3fold: map of handle {handle} naming no buddy");
            return None;
        };
        if buddy == Buddy::Middle {
            desc.flags.set(PageFlags::MIDDLE_CHUNK_MAPPED);
        }
        let offset = desc.header.offset_of(buddy, geometry);
        // Safety: offset < page_size, inside the page.
        Some(unsafe { NonNull::new_unchecked(desc.base.as_ptr().add(offset)) })
    }

    /// End a [`map`](Self::map). Only MIDDLE buddies need it; FIRST and LAST
    /// are never moved.
    pub fn unmap(&self, handle: Handle) {
        let geometry = &self.geometry;
        let mut guard = self.lock();
        let Some(id) = guard.table.lookup(geometry.handle_base(handle)) else {
            log::error!("z3fold: unmap of unknown handle {handle}");
            return;
        };
        let desc = guard.table.get_mut(id);
        if desc.flags.is_headless() {
            return;
        }
        match geometry.handle_buddy(handle, desc.header.first_num) {
            Some(Buddy::Middle) => desc
                .flags
                .clear(PageFlags::MIDDLE_CHUNK_MAPPED),
            Some(_) => {}
            None => log::error!("z3fold: unmap of handle {handle} naming no buddy"),
        }
    }

    /// Try to free one whole page, evicting its buddies through the
    /// eviction handler. Pages are taken from the LRU tail; a page that
    /// cannot be emptied goes back to the LRU head and the next one is tried,
    /// up to `retries` pages.
    ///
    /// # Errors
    ///
    /// - `InvalidState` without a handler, with an empty pool, or with
    ///   `retries == 0`.
    /// - `RetryExhausted` if no page was freed.
    pub fn reclaim(&self, retries: usize) -> Result<(), Z3foldError> {
        let geometry = &self.geometry;
        let Some(handler) = self.handler.as_deref() else {
            return Err(Z3foldError::InvalidState("no eviction handler registered"));
        };
        if retries == 0 {
            return Err(Z3foldError::InvalidState("zero reclaim attempts"));
        }

        let mut guard = self.lock();
        if guard.lru.is_empty() {
            return Err(Z3foldError::InvalidState("no pages to reclaim"));
        }

        for attempt in 0..retries {
            let inner = &mut *guard;
            let Some(id) = inner.lru.back() else {
                return Err(Z3foldError::InvalidState("no pages to reclaim"));
            };
            inner.lru.remove(&mut inner.table, id);
            inner
                .table
                .get_mut(id)
                .flags
                .set(PageFlags::UNDER_RECLAIM);

            let headless = inner.table.get(id).flags.is_headless();
            // Eviction order: MIDDLE, FIRST, LAST.
            let mut victims: [Option<Handle>; 3] = [None; 3];
            if headless {
                let addr = inner.table.get(id).addr();
                victims[0] = Some(geometry.encode_handle(addr, Buddy::Headless, 0));
            } else {
                inner.detach_buddy(id);
                // Snapshot now: a racing free may zero the sizes once we unlock.
                let desc = inner.table.get(id);
                let header = desc.header;
                for (victim, buddy) in victims
                    .iter_mut()
                    .zip([Buddy::Middle, Buddy::First, Buddy::Last])
                {
                    if header.chunks(buddy) != 0 {
                        *victim =
                            Some(geometry.encode_handle(desc.addr(), buddy, header.first_num));
                    }
                }
            }
            drop(guard);

            let mut evicted_all = true;
            for handle in victims.into_iter().flatten() {
                if let Err(e) = handler.evict(self, handle) {
                    log::debug!("z3fold: eviction of {handle} failed: {e}");
                    evicted_all = false;
                    break;
                }
            }

            guard = self.lock();
            let inner = &mut *guard;
            inner
                .table
                .get_mut(id)
                .flags
                .clear(PageFlags::UNDER_RECLAIM);

            let emptied = if headless {
                evicted_all
            } else {
                inner.table.get(id).header.is_empty()
            };
            if emptied {
                let page = inner.teardown(id);
                inner.reclaimed += 1;
                self.page_removed();
                drop(guard);
                stats::Z3FOLD_RECLAIMED.add(1);
                if let Some(page) = page {
                    self.release_page(page);
                }
                log::debug!("z3fold: reclaimed a page after {} attempt(s)", attempt + 1);
                return Ok(());
            }

            if !headless {
                if !inner.table.get(id).header.is_full() {
                    inner.compact(id, geometry);
                }
                inner.rebucket(id, geometry);
            }
            inner.lru.push_front(&mut inner.table, id);
        }

        Err(Z3foldError::RetryExhausted { attempts: retries })
    }

    /// Pages currently owned by the pool. Read without the lock, so the value
    /// may be stale under concurrent alloc/free.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.pages_nr.load(Ordering::Relaxed)
    }

    /// Bytes of pages currently owned by the pool.
    #[inline]
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.size() * self.geometry.page_size() as u64
    }

    /// Whether `reclaim` can do anything at all.
    #[must_use]
    pub fn has_eviction_handler(&self) -> bool {
        self.handler.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let headless_pages = inner
            .table
            .ids()
            .filter(|&id| inner.table.get(id).flags.is_headless())
            .count();
        PoolStats {
            pages: self.size(),
            headless_pages,
            buddied: inner.buddied.len(),
            unbuddied: inner.unbuddied.iter().map(PageList::len).sum(),
            buckets: inner.unbuddied.iter().map(PageList::len).collect(),
            lru: inner.lru.len(),
            compactions: inner.compactions,
            reclaimed: inner.reclaimed,
        }
    }
}

impl Drop for Z3foldPool {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(e) => e.into_inner(),
        };
        let pages = inner.table.drain();
        if !pages.is_empty() {
            log::warn!(
                "z3fold: pool destroyed while owning {} page(s); returning them to the source",
                pages.len()
            );
        }
        stats::sub_saturating(&stats::Z3FOLD_PAGES, pages.len());
        for page in pages {
            // Safety: the pool is going away; its pages came from this source.
            unsafe { self.source.release_page(page) };
        }
    }
}

#[cfg(test)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct PageSnapshot {
    pub base: usize,
    pub header: super::header::Z3foldHeader,
    pub flags: PageFlags,
    pub membership: BuddyList,
    pub on_lru: bool,
}

#[cfg(test)]
impl Z3foldPool {
    /// State of the page behind `handle`.
    pub(crate) fn inspect(&self, handle: Handle) -> Option<PageSnapshot> {
        let inner = self.lock();
        let id = inner.table.lookup(self.geometry.handle_base(handle))?;
        let desc = inner.table.get(id);
        Some(PageSnapshot {
            base: desc.addr(),
            header: desc.header,
            flags: desc.flags,
            membership: desc.membership,
            on_lru: desc.on_lru(),
        })
    }

    /// Page bases from the LRU head (most recently touched) to the tail.
    pub(crate) fn lru_bases(&self) -> Vec<usize> {
        let inner = self.lock();
        inner
            .lru
            .iter(&inner.table)
            .map(|id| inner.table.get(id).addr())
            .collect()
    }

    /// Panics unless every list agrees with every header. Pages under
    /// reclaim are skipped.
    pub(crate) fn check_invariants(&self) {
        let inner = self.lock();
        let mut on_buddy_lists = 0;
        let mut on_lru = 0;
        for id in inner.table.ids() {
            let desc = inner.table.get(id);
            if desc.flags.under_reclaim() {
                continue;
            }
            assert!(desc.on_lru(), "page {:#x} missing from LRU", desc.addr());
            on_lru += 1;
            if desc.flags.is_headless() {
                assert_eq!(desc.membership, BuddyList::Detached);
                continue;
            }
            assert!(!desc.header.is_empty(), "empty page {:#x} kept", desc.addr());
            on_buddy_lists += 1;
            match desc.membership {
                BuddyList::Buddied => assert!(desc.header.is_full()),
                BuddyList::Unbuddied(i) => {
                    assert!(!desc.header.is_full());
                    let expected = desc
                        .header
                        .num_free_chunks(&self.geometry)
                        .min(inner.unbuddied.len() - 1);
                    assert_eq!(i, expected, "page {:#x} in wrong bucket", desc.addr());
                }
                BuddyList::Detached => panic!("page {:#x} on no buddy list", desc.addr()),
            }
        }
        let listed: usize =
            inner.buddied.len() + inner.unbuddied.iter().map(PageList::len).sum::<usize>();
        assert_eq!(listed, on_buddy_lists);
        assert_eq!(inner.lru.len(), on_lru);
        assert_eq!(self.size(), inner.table.len() as u64);
    }
}
