//! Page and unit header layout plus the in-page allocation protocols.
//!
//! A page is a 64 KiB committed region: a 16-byte header followed by a
//! stream of equally-sized unit slots of one size class. Every slot starts
//! with a 16-byte unit header. All intra-page links are 16-bit offsets from
//! the page base; offset 0 is the null sentinel (the page header occupies
//! it, so no unit ever lives there).
//!
//! Ownership rules: `next_bump_offset` belongs to the page's current owner
//! thread and is mutated without atomics. Foreign threads only touch the
//! `foreign_free_head` offset stack and the unit mark bytes.

use std::ptr::NonNull;

use super::size_class::{PAGE_HEADER_SIZE, SizeClass, UNIT_HEADER_SIZE};
use super::tagged_stack::StackNode;
use crate::sync::atomic::{AtomicU8, AtomicU16, AtomicUsize, Ordering};

// Mark colors, numeric values shared with the runtime's wire contract.
pub(crate) const MARK_RELEASED: u8 = 0;
pub(crate) const MARK_UNMARKED: u8 = 1;
pub(crate) const MARK_SELF_MARKED: u8 = 2;
pub(crate) const MARK_FULL_MARKED: u8 = 3;

/// Age of a freshly allocated unit; decremented per surviving sweep down to
/// 0, which denotes a tenured unit.
pub(crate) const AGE_NEWBORN: u8 = 15;

/// Per-unit metadata. 16 bytes, 8-byte aligned, immediately precedes the
/// user data.
///
/// `mark` is the only publication point: allocation writes the other
/// metadata first and then release-stores `MARK_UNMARKED`, so any thread
/// that acquire-loads a non-RELEASED mark sees consistent epoch/type/age.
/// The remaining bytes use relaxed atomics — they are racy by design
/// (sweep ages a unit while its owner may be recycling the slot) and no
/// decision ever hinges on a single stale byte.
#[repr(C)]
pub(crate) struct UnitHeader {
    /// Owning page, null for large-span and huge units.
    pub parent_page: *mut PageHeader,
    pub mark: AtomicU8,
    pub alloc_epoch: AtomicU8,
    pub gc_type: AtomicU8,
    pub age: AtomicU8,
    /// Free-list / bump-cursor chain link (in-page offset, 0 = end).
    pub next_alloc_unit_offset: AtomicU16,
    _pad: u16,
}

// loom's tracked atomics are fatter than the hardware ones, so the packed
// layout only holds in real builds; loom models use hand-placed offsets.
#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<UnitHeader>() == UNIT_HEADER_SIZE);
#[cfg(not(loom))]
const _: () = assert!(std::mem::align_of::<UnitHeader>() == 8);

// GC-type mask bits (bitwise-or'ed into `gc_type`).
pub(crate) const TYPE_NEED_SWEEP: u8 = 1 << 0;
pub(crate) const TYPE_AUTO_MARK: u8 = 1 << 1;
pub(crate) const TYPE_HAS_MARKER: u8 = 1 << 2;
pub(crate) const TYPE_HAS_FINALIZER: u8 = 1 << 3;

impl UnitHeader {
    pub(crate) fn new_free(parent_page: *mut PageHeader, next_offset: u16) -> Self {
        Self {
            parent_page,
            mark: AtomicU8::new(MARK_RELEASED),
            alloc_epoch: AtomicU8::new(0),
            gc_type: AtomicU8::new(0),
            age: AtomicU8::new(AGE_NEWBORN),
            next_alloc_unit_offset: AtomicU16::new(next_offset),
            _pad: 0,
        }
    }

    /// User-data pointer for this unit.
    pub(crate) fn user_ptr(unit: NonNull<UnitHeader>) -> NonNull<u8> {
        // Safety: the user region directly follows the 16-byte header.
        unsafe { NonNull::new_unchecked(unit.as_ptr().cast::<u8>().add(UNIT_HEADER_SIZE)) }
    }

    /// Recover the unit header from a user-data pointer.
    ///
    /// # Safety
    /// `user` must have been produced by [`UnitHeader::user_ptr`].
    pub(crate) unsafe fn from_user_ptr(user: NonNull<u8>) -> NonNull<UnitHeader> {
        // Safety: inverse of user_ptr.
        unsafe { NonNull::new_unchecked(user.as_ptr().sub(UNIT_HEADER_SIZE).cast::<UnitHeader>()) }
    }

    /// Stamp allocation metadata and publish the unit as live.
    ///
    /// The release store of `MARK_UNMARKED` is the publication point; the
    /// sweeper acquire-loads the mark before trusting epoch/type/age.
    ///
    /// # Safety
    /// `unit` must reference a unit slot currently owned by the caller
    /// (just popped from a free list or bump cursor).
    pub(crate) unsafe fn publish_allocated(unit: NonNull<UnitHeader>, epoch: u8, gc_type: u8) {
        // Safety: exclusive ownership per contract.
        let u = unsafe { unit.as_ref() };
        debug_assert_eq!(u.mark.load(Ordering::Relaxed), MARK_RELEASED);
        u.alloc_epoch.store(epoch, Ordering::Relaxed);
        u.gc_type.store(gc_type, Ordering::Relaxed);
        u.age.store(AGE_NEWBORN, Ordering::Relaxed);
        u.mark.store(MARK_UNMARKED, Ordering::Release);
    }

    /// Atomically transition the mark to RELEASED.
    ///
    /// Returns true for the single caller that observed a non-RELEASED
    /// mark; the loser of the race must take no further action. This is
    /// the double-free detector: two frees of the same pointer race here
    /// and exactly one proceeds.
    pub(crate) fn try_release_mark(unit: NonNull<UnitHeader>) -> bool {
        // Safety: unit headers are never deallocated while the page lives.
        let u = unsafe { unit.as_ref() };
        let prev = u.mark.swap(MARK_RELEASED, Ordering::AcqRel);
        debug_assert!(
            prev != MARK_RELEASED,
            "double free of unit {:p}",
            unit.as_ptr()
        );
        prev != MARK_RELEASED
    }
}

/// Per-page metadata. 16 bytes at the page base.
#[repr(C)]
pub(crate) struct PageHeader {
    /// Link slot for the global free-page / free-span stacks.
    pub next_page: AtomicUsize,
    /// Head of the offset stack of units freed by non-owner threads.
    pub foreign_free_head: AtomicU16,
    /// Next unit slot for owner-thread bump allocation (0 = exhausted).
    /// Owner-only; never touched by foreign threads.
    pub next_bump_offset: u16,
    /// Index of this page within its chunk. Written once at commit.
    pub page_index: u16,
    /// Size-class tag (see `SizeClass::to_tag`). Written once at commit.
    pub size_class_tag: u8,
    /// Set when the owning thread evicted this page fully drained; the
    /// sweeper re-adopts it once foreign frees accumulate.
    pub abandoned: AtomicU8,
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);
#[cfg(not(loom))]
const _: () = assert!(std::mem::align_of::<PageHeader>() == 8);

// Safety: the free-page stacks own pushed pages; `next_page` is reserved for
// whichever stack the page is currently linked into.
unsafe impl StackNode for PageHeader {
    fn link(&self) -> &AtomicUsize {
        &self.next_page
    }
}

impl PageHeader {
    /// Initialize a freshly committed page for a small/medium class:
    /// write the page header, then chain every unit slot through
    /// `next_alloc_unit_offset` and hang the chain off the bump cursor.
    ///
    /// # Safety
    /// `page` must point to `PAGE_SIZE` committed, otherwise-unused bytes.
    pub(crate) unsafe fn init_unit_page(
        page: NonNull<PageHeader>,
        class: SizeClass,
        page_index: u16,
    ) {
        debug_assert!(matches!(class, SizeClass::Unit(_)));
        let stride = class.stride();
        let count = class.units_per_page();
        debug_assert!(count >= 1);

        // Safety: page region is exclusively ours during init.
        unsafe {
            page.as_ptr().write(PageHeader {
                next_page: AtomicUsize::new(0),
                foreign_free_head: AtomicU16::new(0),
                next_bump_offset: PAGE_HEADER_SIZE as u16,
                page_index,
                size_class_tag: class.to_tag(),
                abandoned: AtomicU8::new(0),
            });

            let base = page.as_ptr().cast::<u8>();
            for slot in 0..count {
                let offset = PAGE_HEADER_SIZE + slot * stride;
                let next = if slot + 1 == count {
                    0
                } else {
                    (offset + stride) as u16
                };
                base.add(offset)
                    .cast::<UnitHeader>()
                    .write(UnitHeader::new_free(page.as_ptr(), next));
            }
        }
    }

    /// Header value for the first page of a span (also embedded in huge
    /// blocks, where the span has no chunk pages at all).
    pub(crate) fn new_span_header(class: SizeClass, page_index: u16) -> PageHeader {
        debug_assert!(matches!(class, SizeClass::LargePages(_) | SizeClass::Huge));
        PageHeader {
            next_page: AtomicUsize::new(0),
            foreign_free_head: AtomicU16::new(0),
            next_bump_offset: 0,
            page_index,
            size_class_tag: class.to_tag(),
            abandoned: AtomicU8::new(0),
        }
    }

    /// Initialize the first page of a large span: page header plus the
    /// single overlaid unit header. The unit's parent-page is null — large
    /// units are identified through the span's page header instead.
    ///
    /// # Safety
    /// `page` must point to the span's first committed page.
    pub(crate) unsafe fn init_span_page(
        page: NonNull<PageHeader>,
        class: SizeClass,
        page_index: u16,
    ) {
        // Safety: span region is exclusively ours during init.
        unsafe {
            page.as_ptr().write(Self::new_span_header(class, page_index));
            Self::span_unit(page)
                .as_ptr()
                .write(UnitHeader::new_free(std::ptr::null_mut(), 0));
        }
    }

    /// The single unit embedded right after a span's page header.
    pub(crate) fn span_unit(page: NonNull<PageHeader>) -> NonNull<UnitHeader> {
        // Safety: span pages always carry a unit header at offset 16.
        unsafe {
            NonNull::new_unchecked(
                page.as_ptr()
                    .cast::<u8>()
                    .add(PAGE_HEADER_SIZE)
                    .cast::<UnitHeader>(),
            )
        }
    }

    /// Unit header at the given in-page offset.
    ///
    /// # Safety
    /// `offset` must be a valid unit offset for this page's class.
    pub(crate) unsafe fn unit_at(page: NonNull<PageHeader>, offset: u16) -> NonNull<UnitHeader> {
        debug_assert!(offset as usize >= PAGE_HEADER_SIZE);
        // Safety: upheld by caller.
        unsafe {
            NonNull::new_unchecked(
                page.as_ptr()
                    .cast::<u8>()
                    .add(offset as usize)
                    .cast::<UnitHeader>(),
            )
        }
    }

    /// In-page offset of a unit belonging to this page.
    pub(crate) fn offset_of(page: NonNull<PageHeader>, unit: NonNull<UnitHeader>) -> u16 {
        let delta = unit.as_ptr() as usize - page.as_ptr() as usize;
        debug_assert!(delta >= PAGE_HEADER_SIZE && delta < super::size_class::PAGE_SIZE);
        delta as u16
    }

    /// Owner-thread bump allocation: take the unit at the bump cursor and
    /// advance the cursor along the unit chain. Returns None when the page
    /// is exhausted.
    ///
    /// # Safety
    /// Caller must be the page's owning thread.
    pub(crate) unsafe fn try_bump(page: NonNull<PageHeader>) -> Option<NonNull<UnitHeader>> {
        // Safety: owner-exclusive field per contract.
        let offset = unsafe { (*page.as_ptr()).next_bump_offset };
        if offset == 0 {
            return None;
        }
        // Safety: the cursor only ever holds valid unit offsets.
        let unit = unsafe { Self::unit_at(page, offset) };
        let next = unsafe { unit.as_ref() }
            .next_alloc_unit_offset
            .load(Ordering::Relaxed);
        // Safety: owner-exclusive field.
        unsafe { (*page.as_ptr()).next_bump_offset = next };
        Some(unit)
    }

    /// Owner-thread reclaim: true if the page can still yield units, either
    /// from the bump cursor or by swallowing the foreign free list whole.
    /// False means the page is exhausted and should be abandoned.
    ///
    /// # Safety
    /// Caller must be the page's owning thread.
    pub(crate) unsafe fn try_reclaim_foreign(page: NonNull<PageHeader>) -> bool {
        // Safety: owner-exclusive field.
        if unsafe { (*page.as_ptr()).next_bump_offset } != 0 {
            return true;
        }
        // Acquire pairs with the release CAS in foreign_push: the chain the
        // foreign threads wrote through the unit headers is visible.
        let head = unsafe { page.as_ref() }
            .foreign_free_head
            .swap(0, Ordering::Acquire);
        if head == 0 {
            return false;
        }
        // Safety: owner-exclusive field.
        unsafe { (*page.as_ptr()).next_bump_offset = head };
        true
    }

    /// Push a RELEASED unit onto the page's foreign free list.
    ///
    /// # Safety
    /// The caller must have won [`UnitHeader::try_release_mark`] for this
    /// unit (exclusive ownership of a dead unit) and `unit` must belong to
    /// `page`.
    pub(crate) unsafe fn foreign_push(page: NonNull<PageHeader>, unit: NonNull<UnitHeader>) {
        let offset = Self::offset_of(page, unit);
        // Safety: unit is exclusively ours until the CAS publishes it.
        let u = unsafe { unit.as_ref() };
        let head = unsafe { page.as_ref() };
        loop {
            let old = head.foreign_free_head.load(Ordering::Relaxed);
            u.next_alloc_unit_offset.store(old, Ordering::Relaxed);
            if head
                .foreign_free_head
                .compare_exchange_weak(old, offset, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Full foreign-free protocol: mark exchange gate, then push.
    /// Returns false on a detected double free (no push happens).
    ///
    /// # Safety
    /// `unit` must belong to `page`.
    pub(crate) unsafe fn foreign_free(page: NonNull<PageHeader>, unit: NonNull<UnitHeader>) -> bool {
        if !UnitHeader::try_release_mark(unit) {
            return false;
        }
        // Safety: we won the release exchange.
        unsafe { Self::foreign_push(page, unit) };
        true
    }

    pub(crate) fn size_class(page: NonNull<PageHeader>) -> SizeClass {
        // Safety: tag is written once at commit before the page is published.
        SizeClass::from_tag(unsafe { page.as_ref() }.size_class_tag)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::size_class::{PAGE_SIZE, classify};

    /// A heap-backed fake page for protocol tests (no chunk machinery).
    struct TestPage {
        ptr: NonNull<PageHeader>,
        layout: std::alloc::Layout,
    }

    impl TestPage {
        fn new(class: SizeClass) -> Self {
            let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // Safety: non-zero layout.
            let raw = unsafe { std::alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(raw).unwrap().cast::<PageHeader>();
            // Safety: fresh exclusive region.
            unsafe { PageHeader::init_unit_page(ptr, class, 7) };
            Self { ptr, layout }
        }
    }

    impl Drop for TestPage {
        fn drop(&mut self) {
            // Safety: allocated in new() with the same layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout) };
        }
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 16);
        assert_eq!(std::mem::size_of::<UnitHeader>(), 16);
    }

    #[test]
    fn test_init_chains_every_slot() {
        let class = classify(100);
        let page = TestPage::new(class);
        let count = class.units_per_page();

        let mut seen = 0;
        loop {
            // Safety: single-threaded test owns the page.
            let Some(unit) = (unsafe { PageHeader::try_bump(page.ptr) }) else {
                break;
            };
            // Safety: unit header valid.
            let u = unsafe { unit.as_ref() };
            assert_eq!(u.mark.load(Ordering::Relaxed), MARK_RELEASED);
            assert_eq!(u.parent_page, page.ptr.as_ptr());
            seen += 1;
        }
        assert_eq!(seen, count, "bump chain must visit every slot once");
    }

    #[test]
    fn test_publish_then_release_round_trip() {
        let class = classify(64);
        let page = TestPage::new(class);
        // Safety: single-threaded owner.
        let unit = unsafe { PageHeader::try_bump(page.ptr) }.unwrap();

        // Safety: unit just taken from the bump cursor.
        unsafe { UnitHeader::publish_allocated(unit, 3, TYPE_NEED_SWEEP) };
        // Safety: header valid.
        let u = unsafe { unit.as_ref() };
        assert_eq!(u.mark.load(Ordering::Acquire), MARK_UNMARKED);
        assert_eq!(u.alloc_epoch.load(Ordering::Relaxed), 3);
        assert_eq!(u.age.load(Ordering::Relaxed), AGE_NEWBORN);

        assert!(UnitHeader::try_release_mark(unit));
        assert_eq!(u.mark.load(Ordering::Relaxed), MARK_RELEASED);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_release_loses() {
        let class = classify(64);
        let page = TestPage::new(class);
        // Safety: single-threaded owner.
        let unit = unsafe { PageHeader::try_bump(page.ptr) }.unwrap();
        // Safety: unit owned.
        unsafe { UnitHeader::publish_allocated(unit, 0, 0) };

        assert!(UnitHeader::try_release_mark(unit));
        // Second release is the detectable error: loser gets false.
        assert!(!UnitHeader::try_release_mark(unit));
    }

    #[test]
    fn test_foreign_free_reclaim_cycle() {
        let class = classify(64);
        let page = TestPage::new(class);

        // Exhaust the bump cursor.
        let mut units = vec![];
        // Safety: single-threaded owner.
        while let Some(unit) = unsafe { PageHeader::try_bump(page.ptr) } {
            // Safety: unit owned.
            unsafe { UnitHeader::publish_allocated(unit, 0, 0) };
            units.push(unit);
        }
        // Safety: owner thread.
        assert!(!unsafe { PageHeader::try_reclaim_foreign(page.ptr) });

        // "Foreign" free three units back.
        for &unit in units.iter().take(3) {
            // Safety: units belong to this page.
            assert!(unsafe { PageHeader::foreign_free(page.ptr, unit) });
        }

        // Owner swallows the foreign list and bumps again.
        // Safety: owner thread.
        assert!(unsafe { PageHeader::try_reclaim_foreign(page.ptr) });
        for _ in 0..3 {
            // Safety: owner thread.
            let unit = unsafe { PageHeader::try_bump(page.ptr) }.unwrap();
            // Safety: header valid.
            assert_eq!(
                unsafe { unit.as_ref() }.mark.load(Ordering::Relaxed),
                MARK_RELEASED
            );
        }
        // Safety: owner thread.
        assert!(unsafe { PageHeader::try_bump(page.ptr) }.is_none());
    }

    #[test]
    fn test_offset_round_trip() {
        let class = classify(128);
        let page = TestPage::new(class);
        // Safety: owner thread.
        let unit = unsafe { PageHeader::try_bump(page.ptr) }.unwrap();
        let offset = PageHeader::offset_of(page.ptr, unit);
        assert_eq!(offset as usize, PAGE_HEADER_SIZE);
        // Safety: offset just computed from a valid unit.
        assert_eq!(unsafe { PageHeader::unit_at(page.ptr, offset) }, unit);
    }
}
