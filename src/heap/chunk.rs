//! Chunks: large virtual reservations subdivided into 64 KiB pages.
//!
//! A chunk reserves `card_table + chunk_size` bytes up front. The card
//! table prefix (one bit per 512-byte region, committed eagerly) keeps
//! address→card lookups a constant offset from the chunk base. Pages are
//! committed lazily and never decommitted until teardown.
//!
//! Page commit is a two-counter protocol: `next_committing` hands out page
//! ranges with a CAS, `committed` publishes initialized headers in FIFO
//! order of reservation. Readers (sweep, the reverse lookup) acquire
//! `committed` and may touch any page below it.

use std::ptr::NonNull;

use super::page::PageHeader;
use super::size_class::{PAGE_SIZE, SizeClass};
use super::stats;
use super::vm::{HeapError, PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use crate::sync::hint;

/// Default chunk payload size. 2048 pages of 64 KiB.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 128 * 1024 * 1024;

/// One card bit summarizes this many payload bytes.
pub(crate) const CARD_GRANULE: usize = 512;

/// Sentinel in `multipage_offset`: the span's OS commit failed and the
/// pages below it must never be interpreted as headers.
pub(crate) const MULTIPAGE_DEAD: u8 = 0xFF;

pub(crate) struct Chunk {
    /// Reservation base: card table first, pages after.
    base: NonNull<u8>,
    pages_base: NonNull<u8>,
    reserved_size: usize,
    card_table_size: usize,
    pages_per_chunk: usize,
    /// Older chunk in the newest-first global list.
    pub(crate) prev: *mut Chunk,
    /// Reservation counter: next page index to hand out.
    next_committing: AtomicUsize,
    /// Publish counter: pages below this index have initialized headers.
    committed: AtomicUsize,
    /// Offset of page `i` from the first page of its owning span
    /// (0 for single pages and span heads), or [`MULTIPAGE_DEAD`].
    multipage_offset: Box<[AtomicU8]>,
}

// Safety: Chunk owns its reservation; interior mutability is all atomic.
unsafe impl Send for Chunk {}
// Safety: see above.
unsafe impl Sync for Chunk {}

/// Card-table bytes covering `chunk_size` at one bit per granule, padded
/// to the OS page so the page array behind it starts page-aligned (commit
/// operates on whole OS pages).
pub(crate) fn card_table_size(chunk_size: usize) -> usize {
    (chunk_size / CARD_GRANULE / 8).next_multiple_of(PlatformVmOps::page_size())
}

impl Chunk {
    /// Reserve and set up a new chunk. The control block is heap-allocated;
    /// only the card table prefix is committed. On any failure the partial
    /// state is undone and the error returned.
    pub(crate) fn create(chunk_size: usize) -> Result<NonNull<Chunk>, HeapError> {
        debug_assert!(chunk_size.is_multiple_of(PAGE_SIZE));
        let card_table_size = card_table_size(chunk_size);
        let reserved_size = card_table_size + chunk_size;
        let pages_per_chunk = chunk_size / PAGE_SIZE;

        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(reserved_size)? };

        // Card table is committed eagerly so barrier hits never fault.
        // Fresh anonymous memory is zero-filled: all cards start clear.
        // Safety: range is within the reservation just obtained.
        if let Err(e) = unsafe { PlatformVmOps::commit(base, card_table_size) } {
            // Safety: releasing the reservation we just made.
            unsafe { drop(PlatformVmOps::release(base, reserved_size)) };
            return Err(e);
        }

        stats::TOTAL_RESERVED.add(reserved_size);
        stats::TOTAL_COMMITTED.add(card_table_size);

        // Safety: pages_base is inside the reservation.
        let pages_base =
            unsafe { NonNull::new_unchecked(base.as_ptr().add(card_table_size)) };

        let chunk = Box::new(Chunk {
            base,
            pages_base,
            reserved_size,
            card_table_size,
            pages_per_chunk,
            prev: std::ptr::null_mut(),
            next_committing: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            multipage_offset: (0..pages_per_chunk).map(|_| AtomicU8::new(0)).collect(),
        });

        // Safety: Box::into_raw never returns null.
        Ok(unsafe { NonNull::new_unchecked(Box::into_raw(chunk)) })
    }

    /// Tear the chunk down: decommit whatever was committed, release the
    /// reservation, free the control block. Shutdown only.
    ///
    /// # Safety
    /// `chunk` must have come from [`Chunk::create`] and no thread may
    /// reference its pages afterwards.
    pub(crate) unsafe fn destroy(chunk: NonNull<Chunk>) {
        // Safety: exclusive ownership per contract.
        let boxed = unsafe { Box::from_raw(chunk.as_ptr()) };
        let committed_pages = boxed.committed.load(Ordering::Acquire);
        let committed_bytes = boxed.card_table_size + committed_pages * PAGE_SIZE;
        // Safety: decommitting/releasing our own reservation.
        unsafe {
            drop(PlatformVmOps::decommit(boxed.base, committed_bytes));
            drop(PlatformVmOps::release(boxed.base, boxed.reserved_size));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, boxed.reserved_size);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, committed_bytes);
        stats::sub_saturating(&stats::COMMITTED_PAGES, committed_pages);
    }

    /// Commit the pages for one group of `class` and return its first page
    /// with an initialized header.
    ///
    /// `Err(OutOfPages)` means this chunk is exhausted; the caller moves to
    /// the next chunk. A failed OS commit marks the reserved span dead and
    /// still publishes it so later committers never stall on the FIFO
    /// publish order.
    pub(crate) fn commit_pages(&self, class: SizeClass) -> Result<NonNull<PageHeader>, HeapError> {
        let k = class.page_count();
        debug_assert!(k >= 1 && k <= self.pages_per_chunk);

        let first = loop {
            let cur = self.next_committing.load(Ordering::Relaxed);
            if cur + k > self.pages_per_chunk {
                return Err(HeapError::OutOfPages);
            }
            if self
                .next_committing
                .compare_exchange_weak(cur, cur + k, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break cur;
            }
        };

        let page_ptr = self.page_ptr(first);
        // Safety: the reserved span [first, first+k) is exclusively ours.
        let commit_result = unsafe {
            PlatformVmOps::commit(NonNull::new_unchecked(page_ptr), k * PAGE_SIZE)
        };

        match commit_result {
            Ok(()) => {
                let page = NonNull::new(page_ptr.cast::<PageHeader>()).unwrap();
                // Safety: committed span is exclusively ours until publish.
                unsafe {
                    match class {
                        SizeClass::Unit(_) => {
                            PageHeader::init_unit_page(page, class, first as u16);
                        }
                        SizeClass::LargePages(_) => {
                            PageHeader::init_span_page(page, class, first as u16);
                        }
                        SizeClass::Huge => unreachable!("huge units never take chunk pages"),
                    }
                }
                for i in 0..k {
                    self.multipage_offset[first + i].store(i as u8, Ordering::Relaxed);
                }
                self.publish(first, k);

                stats::TOTAL_COMMITTED.add(k * PAGE_SIZE);
                stats::COMMITTED_PAGES.add(k);
                Ok(page)
            }
            Err(e) => {
                // The span is lost: poison it so sweep and lookups skip it,
                // then publish to keep the FIFO order moving.
                for i in 0..k {
                    self.multipage_offset[first + i].store(MULTIPAGE_DEAD, Ordering::Relaxed);
                }
                self.publish(first, k);
                #[cfg(debug_assertions)]
                eprintln!(
                    "[woogc] page commit failed for {k} page(s) at index {first}: {e}; span marked dead",
                );
                Err(e)
            }
        }
    }

    fn publish(&self, first: usize, k: usize) {
        // FIFO publish: wait for every earlier reservation to land, then
        // release our headers (and multipage offsets) in one store.
        while self.committed.load(Ordering::Acquire) != first {
            hint::spin_loop();
        }
        self.committed.store(first + k, Ordering::Release);
    }

    pub(crate) fn page_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.pages_per_chunk);
        // Safety: index is within the reservation.
        unsafe { self.pages_base.as_ptr().add(index * PAGE_SIZE) }
    }

    /// Pages with published headers.
    pub(crate) fn committed_pages(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Reservation base address (the address-map key).
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// True if `addr` falls inside a committed page of this chunk.
    pub(crate) fn contains_committed(&self, addr: usize) -> bool {
        let lo = self.pages_base.as_ptr() as usize;
        let hi = lo + self.committed_pages() * PAGE_SIZE;
        addr >= lo && addr < hi
    }

    /// Page index holding `addr`. Caller checks `contains_committed` first.
    pub(crate) fn page_index_of(&self, addr: usize) -> usize {
        (addr - self.pages_base.as_ptr() as usize) / PAGE_SIZE
    }

    /// Resolve the first page of the span that owns page `index`, skipping
    /// dead spans.
    pub(crate) fn span_first_page(&self, index: usize) -> Option<NonNull<PageHeader>> {
        let off = self.multipage_offset[index].load(Ordering::Relaxed);
        if off == MULTIPAGE_DEAD {
            return None;
        }
        let first = index - off as usize;
        NonNull::new(self.page_ptr(first).cast::<PageHeader>())
    }

    /// Raw span offset byte for page `index` (sweep uses this to skip span
    /// interiors without reading page headers).
    pub(crate) fn multipage_offset_of(&self, index: usize) -> u8 {
        self.multipage_offset[index].load(Ordering::Relaxed)
    }

    /// Set the card bit covering `addr`.
    pub(crate) fn card_mark(&self, addr: usize) {
        let lo = self.pages_base.as_ptr() as usize;
        debug_assert!(addr >= lo && addr < lo + self.pages_per_chunk * PAGE_SIZE);
        let granule = (addr - lo) / CARD_GRANULE;
        let byte = granule / 8;
        let bit = 1u8 << (granule % 8);
        debug_assert!(byte < self.card_table_size);
        // Safety: the card table is committed for the life of the chunk;
        // concurrent setters go through the same atomic view.
        let cell = unsafe { &*self.base.as_ptr().add(byte).cast::<AtomicU8>() };
        cell.fetch_or(bit, Ordering::Relaxed);
    }

    /// Read the card bit covering `addr`.
    #[allow(dead_code)]
    pub(crate) fn card_is_marked(&self, addr: usize) -> bool {
        let lo = self.pages_base.as_ptr() as usize;
        let granule = (addr - lo) / CARD_GRANULE;
        // Safety: same as card_mark.
        let cell = unsafe { &*self.base.as_ptr().add(granule / 8).cast::<AtomicU8>() };
        cell.load(Ordering::Relaxed) & (1 << (granule % 8)) != 0
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::page::MARK_RELEASED;
    use crate::heap::size_class::classify;
    use crate::sync::atomic::Ordering;

    // Tests use a small chunk so reservations stay cheap.
    const TEST_CHUNK: usize = 8 * 1024 * 1024;

    struct TestChunk(NonNull<Chunk>);
    impl Drop for TestChunk {
        fn drop(&mut self) {
            // Safety: created in the test, no outstanding references.
            unsafe { Chunk::destroy(self.0) };
        }
    }

    #[test]
    fn test_create_commits_card_table_only() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let chunk = TestChunk(Chunk::create(TEST_CHUNK).unwrap());
        // Safety: chunk alive.
        let c = unsafe { chunk.0.as_ref() };
        assert_eq!(c.committed_pages(), 0);
        assert_eq!(c.card_table_size, TEST_CHUNK / 512 / 8);
        // Card table is readable/writable right away.
        c.card_mark(c.pages_base.as_ptr() as usize);
        assert!(c.card_is_marked(c.pages_base.as_ptr() as usize));
    }

    #[test]
    fn test_commit_single_page_initializes_units() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let chunk = TestChunk(Chunk::create(TEST_CHUNK).unwrap());
        // Safety: chunk alive.
        let c = unsafe { chunk.0.as_ref() };

        let class = classify(64);
        let page = c.commit_pages(class).unwrap();
        assert_eq!(c.committed_pages(), 1);
        // Safety: page just initialized.
        let hdr = unsafe { page.as_ref() };
        assert_eq!(hdr.page_index, 0);
        assert_eq!(hdr.size_class_tag, class.to_tag());

        // First unit is chained and RELEASED.
        // Safety: unit stream just written.
        let unit = unsafe { PageHeader::unit_at(page, 16) };
        assert_eq!(
            // Safety: header valid.
            unsafe { unit.as_ref() }.mark.load(Ordering::Relaxed),
            MARK_RELEASED
        );
    }

    #[test]
    fn test_commit_span_takes_contiguous_pages() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let chunk = TestChunk(Chunk::create(TEST_CHUNK).unwrap());
        // Safety: chunk alive.
        let c = unsafe { chunk.0.as_ref() };

        let span = c.commit_pages(SizeClass::LargePages(3)).unwrap();
        assert_eq!(c.committed_pages(), 3);
        assert_eq!(c.multipage_offset_of(0), 0);
        assert_eq!(c.multipage_offset_of(1), 1);
        assert_eq!(c.multipage_offset_of(2), 2);
        // Interior pages resolve back to the span head.
        assert_eq!(c.span_first_page(2), Some(span));

        // Next commit lands after the span.
        let class = classify(64);
        let page = c.commit_pages(class).unwrap();
        // Safety: page just initialized.
        assert_eq!(unsafe { page.as_ref() }.page_index, 3);
    }

    #[test]
    fn test_exhaustion_reports_out_of_pages() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // 4 pages total (tiny chunk): 64 KiB * 4.
        let chunk = TestChunk(Chunk::create(4 * PAGE_SIZE).unwrap());
        // Safety: chunk alive.
        let c = unsafe { chunk.0.as_ref() };
        let class = classify(64);

        for _ in 0..4 {
            c.commit_pages(class).unwrap();
        }
        assert!(matches!(
            c.commit_pages(class),
            Err(HeapError::OutOfPages)
        ));
        // A 2-page span also cannot fit.
        assert!(matches!(
            c.commit_pages(SizeClass::LargePages(2)),
            Err(HeapError::OutOfPages)
        ));
    }

    #[test]
    fn test_concurrent_commit_publishes_fifo() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        use crate::sync::Arc;
        use crate::sync::thread;

        let chunk = Chunk::create(TEST_CHUNK).unwrap();
        // Safety: shared read-only handle; Chunk is Sync.
        let shared: Arc<&'static Chunk> = {
            // Leak-free trick: we destroy manually at the end.
            let r: &'static Chunk = unsafe { &*chunk.as_ptr() };
            Arc::new(r)
        };

        let threads = 4;
        let per_thread = 16;
        let mut handles = vec![];
        for _ in 0..threads {
            let c = shared.clone();
            handles.push(thread::spawn(move || {
                let class = classify(64);
                let mut indices = vec![];
                for _ in 0..per_thread {
                    let page = c.commit_pages(class).unwrap();
                    // Safety: page initialized by commit_pages.
                    indices.push(unsafe { page.as_ref() }.page_index);
                }
                indices
            }));
        }

        let mut all: Vec<u16> = vec![];
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();
        let expected: Vec<u16> = (0..(threads * per_thread) as u16).collect();
        assert_eq!(all, expected, "each page index handed out exactly once");
        assert_eq!(shared.committed_pages(), threads * per_thread);

        drop(shared);
        // Safety: all threads joined.
        unsafe { Chunk::destroy(chunk) };
    }
}
