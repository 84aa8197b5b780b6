//! Global Page Collection: the process-wide tier between thread caches and
//! the OS.
//!
//! Holds the chunk list, the per-class free-page stacks, the per-span-size
//! free-span stacks, the huge-unit roster and the address→unit reverse map.
//! Everything here is shared by all mutators and the collector; the stacks
//! are lock-free, the reverse map and thread registry share one RwLock
//! (reads on every conservative lookup, writes only on chunk creation and
//! huge register/unregister).

use std::collections::BTreeMap;
use std::ptr::NonNull;

use super::chunk::Chunk;
use super::huge::{HugeRoster, HugeUnitHead};
use super::page::{PageHeader, UnitHeader};
use super::size_class::{
    MAX_LARGE_PAGES, PAGE_HEADER_SIZE, SizeClass, UNIT_CLASS_COUNT,
};
use super::tagged_stack::TaggedStack;
use super::vm::HeapError;
use crate::sync::RwLock;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Value of an address-map entry: the enclosing chunk, or a huge block.
pub(crate) enum AddrEntry {
    Chunk(NonNull<Chunk>),
    Huge(NonNull<HugeUnitHead>),
}

// Safety: entries are plain addresses of structures owned by the Gpc.
unsafe impl Send for AddrEntry {}
// Safety: see above.
unsafe impl Sync for AddrEntry {}

/// Reverse map plus the thread registry, guarded by one lock (writes are
/// rare: chunk creation, huge register/unregister, thread join/exit).
pub(crate) struct GlobalIndex {
    map: BTreeMap<usize, AddrEntry>,
    threads: Vec<u64>,
}

pub(crate) struct Gpc {
    chunk_size: usize,
    /// Newest-first singly linked chunk list (`Chunk::prev` walks older).
    chunks: AtomicUsize,
    free_pages: [TaggedStack<PageHeader>; UNIT_CLASS_COUNT],
    free_spans: [TaggedStack<PageHeader>; MAX_LARGE_PAGES],
    pub(crate) huge_roster: HugeRoster,
    index: RwLock<GlobalIndex>,
    next_tlpc_id: AtomicU64,
}

impl Gpc {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            chunks: AtomicUsize::new(0),
            free_pages: std::array::from_fn(|_| TaggedStack::new()),
            free_spans: std::array::from_fn(|_| TaggedStack::new()),
            huge_roster: HugeRoster::new(),
            index: RwLock::new(GlobalIndex {
                map: BTreeMap::new(),
                threads: Vec::new(),
            }),
            next_tlpc_id: AtomicU64::new(1),
        }
    }

    // ------------------------------------------------------------------
    // Free pages and spans
    // ------------------------------------------------------------------

    /// Pop a free page of the class, or commit a new one from the chunks.
    pub(crate) fn try_get_free_page(
        &self,
        class_index: usize,
    ) -> Result<NonNull<PageHeader>, HeapError> {
        if let Some(page) = self.free_pages[class_index].pop() {
            return Ok(page);
        }
        self.commit_from_chunks(SizeClass::Unit(class_index as u8))
    }

    pub(crate) fn return_free_page(&self, page: NonNull<PageHeader>) {
        let SizeClass::Unit(idx) = PageHeader::size_class(page) else {
            unreachable!("only unit pages circulate through the free-page stacks");
        };
        self.free_pages[idx as usize].push(page);
    }

    /// Pop a free span of `k` pages, or commit a new one.
    pub(crate) fn try_alloc_span(&self, k: u8) -> Result<NonNull<PageHeader>, HeapError> {
        if let Some(page) = self.free_spans[k as usize - 1].pop() {
            return Ok(page);
        }
        self.commit_from_chunks(SizeClass::LargePages(k))
    }

    pub(crate) fn return_free_span(&self, page: NonNull<PageHeader>) {
        let SizeClass::LargePages(k) = PageHeader::size_class(page) else {
            unreachable!("only span heads circulate through the free-span stacks");
        };
        self.free_spans[k as usize - 1].push(page);
    }

    /// Walk the chunk list newest-first; exhausted chunks are skipped; at
    /// the end of the list a fresh chunk is prepended and the walk retried.
    fn commit_from_chunks(&self, class: SizeClass) -> Result<NonNull<PageHeader>, HeapError> {
        loop {
            let mut cur = self.chunks.load(Ordering::Acquire) as *mut Chunk;
            while !cur.is_null() {
                // Safety: chunks live until the Gpc drops.
                let c = unsafe { &*cur };
                match c.commit_pages(class) {
                    Ok(page) => return Ok(page),
                    Err(HeapError::OutOfPages) => cur = c.prev,
                    Err(e) => return Err(e),
                }
            }
            self.grow()?;
        }
    }

    /// Create a chunk, make it discoverable through the reverse map, then
    /// CAS-prepend it to the list. Chunk creation runs outside every lock
    /// except the short map write.
    fn grow(&self) -> Result<(), HeapError> {
        let chunk = Chunk::create(self.chunk_size)?;
        {
            let mut index = self
                .index
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Safety: chunk was just created and is ours.
            index
                .map
                .insert(unsafe { chunk.as_ref() }.base_addr(), AddrEntry::Chunk(chunk));
        }
        loop {
            let head = self.chunks.load(Ordering::Relaxed);
            // Safety: chunk is unpublished; prev is written before the CAS
            // releases it.
            unsafe { (*chunk.as_ptr()).prev = head as *mut Chunk };
            if self
                .chunks
                .compare_exchange_weak(
                    head,
                    chunk.as_ptr() as usize,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Newest chunk, for the sweep walk.
    pub(crate) fn chunks_head(&self) -> *mut Chunk {
        self.chunks.load(Ordering::Acquire) as *mut Chunk
    }

    // ------------------------------------------------------------------
    // Huge units
    // ------------------------------------------------------------------

    /// Make a freshly allocated huge block discoverable: reverse map entry
    /// plus roster membership.
    pub(crate) fn register_huge(&self, block: NonNull<HugeUnitHead>) {
        {
            let mut index = self
                .index
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            index
                .map
                .insert(block.as_ptr() as usize, AddrEntry::Huge(block));
        }
        self.huge_roster.push(block);
    }

    /// Remove a dead huge block from the reverse map (sweep, before the
    /// block storage is returned to the system heap).
    pub(crate) fn unregister_huge(&self, block: NonNull<HugeUnitHead>) {
        let mut index = self
            .index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let removed = index.map.remove(&(block.as_ptr() as usize));
        debug_assert!(matches!(removed, Some(AddrEntry::Huge(_))));
    }

    // ------------------------------------------------------------------
    // Reverse lookup
    // ------------------------------------------------------------------

    /// Turn an arbitrary address into the enclosing unit header, or None.
    /// Accepts interior pointers; rejects page-header bytes, slot overruns,
    /// uncommitted ranges and dead spans.
    pub(crate) fn lookup_unit_head(&self, addr: usize) -> Option<NonNull<UnitHeader>> {
        let index = self
            .index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (_, entry) = index.map.range(..=addr).next_back()?;
        match entry {
            AddrEntry::Chunk(chunk) => {
                // Safety: chunks live until the Gpc drops.
                let c = unsafe { chunk.as_ref() };
                if !c.contains_committed(addr) {
                    return None;
                }
                let page_index = c.page_index_of(addr);
                let page = c.span_first_page(page_index)?;
                match PageHeader::size_class(page) {
                    class @ SizeClass::Unit(_) => {
                        let rel = addr - page.as_ptr() as usize;
                        if rel < PAGE_HEADER_SIZE {
                            return None;
                        }
                        let slot = (rel - PAGE_HEADER_SIZE) / class.stride();
                        if slot >= class.units_per_page() {
                            return None;
                        }
                        let offset = PAGE_HEADER_SIZE + slot * class.stride();
                        // Safety: offset is a valid slot for this class.
                        Some(unsafe { PageHeader::unit_at(page, offset as u16) })
                    }
                    SizeClass::LargePages(_) => Some(PageHeader::span_unit(page)),
                    SizeClass::Huge => None,
                }
            }
            AddrEntry::Huge(block) => {
                // Safety: roster blocks live until swept.
                let h = unsafe { block.as_ref() };
                let payload = HugeUnitHead::user_ptr(*block).as_ptr() as usize;
                let fact = h.fact_unit_size.load(Ordering::Relaxed);
                if addr >= payload && addr < payload + fact {
                    Some(HugeUnitHead::unit(*block))
                } else {
                    None
                }
            }
        }
    }

    /// Set the card bit covering `addr`, wherever it lives (chunk-prefix
    /// table or a huge block's trailing table). Unresolvable addresses are
    /// ignored.
    pub(crate) fn card_mark_addr(&self, addr: usize) {
        let index = self
            .index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some((_, entry)) = index.map.range(..=addr).next_back() else {
            return;
        };
        match entry {
            AddrEntry::Chunk(chunk) => {
                // Safety: chunks live until the Gpc drops.
                let c = unsafe { chunk.as_ref() };
                if c.contains_committed(addr) {
                    c.card_mark(addr);
                }
            }
            AddrEntry::Huge(block) => {
                // Safety: roster blocks live until swept.
                let h = unsafe { block.as_ref() };
                let payload = HugeUnitHead::user_ptr(*block).as_ptr() as usize;
                if addr >= payload && addr < payload + h.aligned_unit_size {
                    HugeUnitHead::card_mark(*block, addr);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Thread registry
    // ------------------------------------------------------------------

    pub(crate) fn register_tlpc(&self) -> u64 {
        let id = self.next_tlpc_id.fetch_add(1, Ordering::Relaxed);
        let mut index = self
            .index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        index.threads.push(id);
        id
    }

    pub(crate) fn unregister_tlpc(&self, id: u64) {
        let mut index = self
            .index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        index.threads.retain(|&t| t != id);
    }

    /// Number of live thread-local collections (diagnostics / shutdown
    /// assertions).
    pub(crate) fn registered_threads(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .threads
            .len()
    }
}

impl Drop for Gpc {
    fn drop(&mut self) {
        // Huge blocks first: their reverse-map entries die with the map.
        let mut block = self.huge_roster.detach_all();
        while !block.is_null() {
            // Safety: roster blocks are owned by the Gpc at teardown.
            let next = unsafe { (*block).next.load(Ordering::Relaxed) } as *mut HugeUnitHead;
            // Safety: no users remain at teardown.
            unsafe { HugeUnitHead::deallocate(NonNull::new_unchecked(block)) };
            block = next;
        }

        let mut chunk = self.chunks.load(Ordering::Acquire) as *mut Chunk;
        while !chunk.is_null() {
            // Safety: exclusive at teardown.
            let prev = unsafe { (*chunk).prev };
            // Safety: no users remain at teardown.
            unsafe { Chunk::destroy(NonNull::new_unchecked(chunk)) };
            chunk = prev;
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::size_class::PAGE_SIZE;

    const TEST_CHUNK: usize = 8 * 1024 * 1024;

    #[test]
    fn test_free_page_cycle() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let gpc = Gpc::new(TEST_CHUNK);
        let page = gpc.try_get_free_page(3).unwrap();
        // Safety: page just committed.
        assert_eq!(unsafe { page.as_ref() }.size_class_tag, 3);

        gpc.return_free_page(page);
        let again = gpc.try_get_free_page(3).unwrap();
        assert_eq!(again, page, "stack returns the page we pushed");
    }

    #[test]
    fn test_span_cycle() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let gpc = Gpc::new(TEST_CHUNK);
        let span = gpc.try_alloc_span(4).unwrap();
        assert_eq!(
            PageHeader::size_class(span),
            SizeClass::LargePages(4)
        );
        gpc.return_free_span(span);
        assert_eq!(gpc.try_alloc_span(4).unwrap(), span);
    }

    #[test]
    fn test_chunk_growth_when_exhausted() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Chunk with 4 pages; the 5th page forces a second chunk.
        let gpc = Gpc::new(4 * PAGE_SIZE);
        for _ in 0..5 {
            gpc.try_get_free_page(0).unwrap();
        }
        // Two chunks on the list now.
        let head = gpc.chunks_head();
        assert!(!head.is_null());
        // Safety: chunks alive.
        assert!(!unsafe { (*head).prev }.is_null());
    }

    #[test]
    fn test_lookup_small_unit_interior() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let gpc = Gpc::new(TEST_CHUNK);
        let class = SizeClass::Unit(5); // capacity 128
        let page = gpc.try_get_free_page(5).unwrap();

        // Second slot of the page, interior pointer into its payload.
        let stride = class.stride();
        let unit_addr = page.as_ptr() as usize + PAGE_HEADER_SIZE + stride;
        let interior = unit_addr + 40;

        let found = gpc.lookup_unit_head(interior).unwrap();
        assert_eq!(found.as_ptr() as usize, unit_addr);

        // Page-header bytes never resolve.
        assert!(gpc.lookup_unit_head(page.as_ptr() as usize + 4).is_none());
        // Uncommitted addresses never resolve.
        assert!(
            gpc.lookup_unit_head(page.as_ptr() as usize + 10 * PAGE_SIZE)
                .is_none()
        );
        // Addresses below every chunk never resolve.
        assert!(gpc.lookup_unit_head(1).is_none());
    }

    #[test]
    fn test_lookup_span_interior() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let gpc = Gpc::new(TEST_CHUNK);
        let span = gpc.try_alloc_span(2).unwrap();
        let unit = PageHeader::span_unit(span);

        // An address deep in the second page still resolves to the unit.
        let deep = span.as_ptr() as usize + PAGE_SIZE + 100;
        assert_eq!(gpc.lookup_unit_head(deep), Some(unit));
    }

    #[test]
    fn test_lookup_huge() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let gpc = Gpc::new(TEST_CHUNK);
        let block = HugeUnitHead::allocate(2_000_000).unwrap();
        gpc.register_huge(block);

        let payload = HugeUnitHead::user_ptr(block).as_ptr() as usize;
        assert_eq!(
            gpc.lookup_unit_head(payload + 1_999_999),
            Some(HugeUnitHead::unit(block))
        );
        // Beyond the fact size: no hit.
        assert!(gpc.lookup_unit_head(payload + 2_000_000).is_none());

        // After unregistering, the block is invisible (sweep owns it).
        gpc.unregister_huge(block);
        assert!(gpc.lookup_unit_head(payload).is_none());
        // Roster still owns the storage; Gpc::drop reclaims it.
    }

    #[test]
    fn test_thread_registry() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let gpc = Gpc::new(TEST_CHUNK);
        assert_eq!(gpc.registered_threads(), 0);
        let a = gpc.register_tlpc();
        let b = gpc.register_tlpc();
        assert_ne!(a, b);
        assert_eq!(gpc.registered_threads(), 2);
        gpc.unregister_tlpc(a);
        assert_eq!(gpc.registered_threads(), 1);
        gpc.unregister_tlpc(b);
        assert_eq!(gpc.registered_threads(), 0);
    }
}
