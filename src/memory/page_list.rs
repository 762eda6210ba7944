//! Page descriptors and the intrusive lists threading them.
//!
//! Descriptors live in a slab indexed by `PageId` and are found from a
//! handle through the page base address. Each descriptor carries two links:
//! `buddy` (a free bucket or the buddied list, never both) and `lru`.
//! Lists store only head/tail ids; prev/next live in the descriptors, so
//! unlinking is O(1) like the kernel's `list_head`.

use super::header::{PageFlags, Z3foldHeader};
use std::collections::HashMap;
use std::ptr::NonNull;

/// Slab index; ids of removed pages are reused.
pub(crate) type PageId = usize;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Link {
    prev: Option<PageId>,
    next: Option<PageId>,
    linked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkKind {
    Buddy,
    Lru,
}

/// Which buddy-link list a page is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BuddyList {
    Detached,
    Unbuddied(usize),
    Buddied,
}

pub(crate) struct PageDesc {
    pub base: NonNull<u8>,
    pub header: Z3foldHeader,
    pub flags: PageFlags,
    pub membership: BuddyList,
    buddy: Link,
    lru: Link,
}

impl PageDesc {
    fn new(base: NonNull<u8>) -> Self {
        Self {
            base,
            header: Z3foldHeader::default(),
            flags: PageFlags::default(),
            membership: BuddyList::Detached,
            buddy: Link::default(),
            lru: Link::default(),
        }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn on_lru(&self) -> bool {
        self.lru.linked
    }

    #[inline]
    fn link(&self, kind: LinkKind) -> &Link {
        match kind {
            LinkKind::Buddy => &self.buddy,
            LinkKind::Lru => &self.lru,
        }
    }

    #[inline]
    fn link_mut(&mut self, kind: LinkKind) -> &mut Link {
        match kind {
            LinkKind::Buddy => &mut self.buddy,
            LinkKind::Lru => &mut self.lru,
        }
    }
}

/// Slab of page descriptors keyed by page base address.
#[derive(Default)]
pub(crate) struct PageTable {
    slots: Vec<Option<PageDesc>>,
    vacant: Vec<PageId>,
    by_base: HashMap<usize, PageId>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly acquired page with an empty header.
    pub fn insert(&mut self, base: NonNull<u8>) -> PageId {
        let desc = PageDesc::new(base);
        let addr = desc.addr();
        let id = if let Some(id) = self.vacant.pop() {
            self.slots[id] = Some(desc);
            id
        } else {
            let id = self.slots.len();
            self.slots.push(Some(desc));
            id
        };
        self.by_base.insert(addr, id);
        id
    }

    /// Stop tracking a page. The caller must have unlinked it from every list.
    pub fn remove(&mut self, id: PageId) -> Option<PageDesc> {
        let desc = self.slots.get_mut(id)?.take()?;
        debug_assert!(!desc.buddy.linked && !desc.lru.linked, "removing a linked page");
        self.by_base.remove(&desc.addr());
        self.vacant.push(id);
        Some(desc)
    }

    #[inline]
    pub fn lookup(&self, base: usize) -> Option<PageId> {
        self.by_base.get(&base).copied()
    }

    #[inline]
    pub fn get(&self, id: PageId) -> &PageDesc {
        self.slots[id]
            .as_ref()
            .expect("page id refers to a live descriptor")
    }

    #[inline]
    pub fn get_mut(&mut self, id: PageId) -> &mut PageDesc {
        self.slots[id]
            .as_mut()
            .expect("page id refers to a live descriptor")
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = PageId> + '_ {
        self.by_base.values().copied()
    }

    /// Drop every descriptor, yielding the page bases.
    pub fn drain(&mut self) -> Vec<NonNull<u8>> {
        self.by_base.clear();
        self.vacant.clear();
        self.slots.drain(..).flatten().map(|desc| desc.base).collect()
    }
}

/// Doubly linked list over one of a descriptor's links. `push_front` puts a
/// page at the head; `back` is the oldest entry.
#[derive(Debug)]
pub(crate) struct PageList {
    kind: LinkKind,
    head: Option<PageId>,
    tail: Option<PageId>,
    len: usize,
}

impl PageList {
    pub const fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn front(&self) -> Option<PageId> {
        self.head
    }

    #[inline]
    pub fn back(&self) -> Option<PageId> {
        self.tail
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Id following `id` on this list.
    #[inline]
    pub fn next(&self, table: &PageTable, id: PageId) -> Option<PageId> {
        table.get(id).link(self.kind).next
    }

    pub fn push_front(&mut self, table: &mut PageTable, id: PageId) {
        let kind = self.kind;
        let old_head = self.head;
        {
            let link = table.get_mut(id).link_mut(kind);
            debug_assert!(!link.linked, "page {id} already on a {kind:?} list");
            link.prev = None;
            link.next = old_head;
            link.linked = true;
        }
        match old_head {
            Some(h) => table.get_mut(h).link_mut(kind).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Unlink `id`, which must be on this list.
    pub fn remove(&mut self, table: &mut PageTable, id: PageId) {
        let kind = self.kind;
        let Link { prev, next, linked } = *table.get(id).link(kind);
        debug_assert!(linked, "page {id} not on a {kind:?} list");
        if !linked {
            return;
        }

        match prev {
            Some(p) => table.get_mut(p).link_mut(kind).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => table.get_mut(n).link_mut(kind).prev = prev,
            None => self.tail = prev,
        }

        *table.get_mut(id).link_mut(kind) = Link::default();
        self.len -= 1;
    }

    #[cfg(test)]
    pub fn iter<'a>(&self, table: &'a PageTable) -> impl Iterator<Item = PageId> + 'a {
        let kind = self.kind;
        std::iter::successors(self.head, move |&id| table.get(id).link(kind).next)
    }
}
