//! Huge units: allocations beyond the largest page span.
//!
//! Huge units bypass chunks entirely and are backed by the system heap.
//! Each block carries the same page/unit header pair as a large span (so
//! the reverse lookup and the sweeper share one metadata contract),
//! prefixed by huge-specific bookkeeping and suffixed by a private card
//! table sized for the payload.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::chunk::CARD_GRANULE;
use super::page::{PageHeader, UnitHeader};
use super::size_class::SizeClass;
use super::stats;
use super::vm::HeapError;
use crate::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Payload sizes are rounded up to this before card-table sizing.
pub(crate) const HUGE_ALIGN: usize = 4096;

/// Header of a huge block. The embedded `page`/`unit` pair sits last so the
/// user payload directly follows the unit header, exactly as in a span.
#[repr(C)]
pub(crate) struct HugeUnitHead {
    /// Caller-requested size; realloc may grow it up to `aligned_unit_size`
    /// without moving the block. Read by the reverse lookup on the GC
    /// thread, hence atomic.
    pub fact_unit_size: AtomicUsize,
    pub aligned_unit_size: usize,
    /// Trailing per-unit card table.
    pub cards: *mut u8,
    /// Link in the process-global huge roster.
    pub next: AtomicUsize,
    pub page: PageHeader,
    pub unit: UnitHeader,
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<HugeUnitHead>() == 64);
#[cfg(not(loom))]
const _: () = assert!(std::mem::align_of::<HugeUnitHead>() == 8);

impl HugeUnitHead {
    fn block_layout(aligned_unit_size: usize) -> Result<(Layout, usize), HeapError> {
        let card_bytes = aligned_unit_size.div_ceil(CARD_GRANULE * 8);
        let total = std::mem::size_of::<HugeUnitHead>()
            .checked_add(aligned_unit_size)
            .and_then(|t| t.checked_add(card_bytes))
            .ok_or_else(|| HeapError::InvalidRequest("huge size overflow".to_string()))?;
        let layout = Layout::from_size_align(total, std::mem::align_of::<HugeUnitHead>())
            .map_err(|e| HeapError::InvalidRequest(format!("huge layout: {e}")))?;
        Ok((layout, card_bytes))
    }

    /// Allocate and initialize a huge block for `size` user bytes. The unit
    /// is returned unpublished (mark still RELEASED); the caller stamps and
    /// publishes it like any other unit.
    pub(crate) fn allocate(size: usize) -> Result<NonNull<HugeUnitHead>, HeapError> {
        let aligned = size
            .checked_next_multiple_of(HUGE_ALIGN)
            .ok_or_else(|| HeapError::InvalidRequest("huge size overflow".to_string()))?;
        let (layout, card_bytes) = Self::block_layout(aligned)?;

        // Safety: layout is non-zero.
        let raw = unsafe { std::alloc::alloc(layout) };
        let Some(block) = NonNull::new(raw.cast::<HugeUnitHead>()) else {
            return Err(HeapError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "system heap refused huge block",
            )));
        };

        // Safety: fresh exclusive block.
        unsafe {
            let cards = raw.add(std::mem::size_of::<HugeUnitHead>() + aligned);
            // Cards start clear; the payload stays uninitialized.
            std::ptr::write_bytes(cards, 0, card_bytes);

            block.as_ptr().write(HugeUnitHead {
                fact_unit_size: AtomicUsize::new(size),
                aligned_unit_size: aligned,
                cards,
                next: AtomicUsize::new(0),
                page: PageHeader::new_span_header(SizeClass::Huge, 0),
                unit: UnitHeader::new_free(std::ptr::null_mut(), 0),
            });
        }

        stats::HUGE_UNITS_LIVE.add(1);
        stats::HUGE_BYTES_LIVE.add(aligned);
        Ok(block)
    }

    /// Free the block storage. The caller must already have unlinked it
    /// from the roster and the address map.
    ///
    /// # Safety
    /// `block` came from [`HugeUnitHead::allocate`] and has no live users.
    pub(crate) unsafe fn deallocate(block: NonNull<HugeUnitHead>) {
        // Safety: header fields are ours to read.
        let aligned = unsafe { block.as_ref() }.aligned_unit_size;
        let (layout, _) = Self::block_layout(aligned).expect("layout was valid at allocation");
        stats::sub_saturating(&stats::HUGE_UNITS_LIVE, 1);
        stats::sub_saturating(&stats::HUGE_BYTES_LIVE, aligned);
        // Safety: same layout as allocation.
        unsafe { std::alloc::dealloc(block.as_ptr().cast::<u8>(), layout) };
    }

    pub(crate) fn unit(block: NonNull<HugeUnitHead>) -> NonNull<UnitHeader> {
        // Safety: field projection on a live block.
        unsafe { NonNull::from(&mut (*block.as_ptr()).unit) }
    }

    pub(crate) fn user_ptr(block: NonNull<HugeUnitHead>) -> NonNull<u8> {
        UnitHeader::user_ptr(Self::unit(block))
    }

    /// Recover the block header from its embedded unit header.
    ///
    /// # Safety
    /// `unit` must be the `unit` field of a live `HugeUnitHead`.
    pub(crate) unsafe fn from_unit(unit: NonNull<UnitHeader>) -> NonNull<HugeUnitHead> {
        let offset = std::mem::offset_of!(HugeUnitHead, unit);
        // Safety: container-of per contract.
        unsafe {
            NonNull::new_unchecked(unit.as_ptr().cast::<u8>().sub(offset).cast::<HugeUnitHead>())
        }
    }

    /// Set the card bit covering `addr` within this block's payload.
    pub(crate) fn card_mark(block: NonNull<HugeUnitHead>, addr: usize) {
        // Safety: block is live.
        let h = unsafe { block.as_ref() };
        let payload = Self::user_ptr(block).as_ptr() as usize;
        debug_assert!(addr >= payload && addr < payload + h.aligned_unit_size);
        let granule = (addr - payload) / CARD_GRANULE;
        // Safety: cards region allocated with the block.
        let cell = unsafe { &*h.cards.add(granule / 8).cast::<AtomicU8>() };
        cell.fetch_or(1 << (granule % 8), Ordering::Relaxed);
    }
}

/// Process-global roster of live huge units.
///
/// Mutators only push; the sweeper detaches the whole list, filters it and
/// pushes survivors back. Push-only plus detach-all keeps the roster safe
/// with a single-word head (no ABA concern without concurrent pops).
pub(crate) struct HugeRoster {
    head: AtomicUsize,
}

impl HugeRoster {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    pub(crate) fn push(&self, block: NonNull<HugeUnitHead>) {
        loop {
            let old = self.head.load(Ordering::Relaxed);
            // Safety: block is ours until the CAS publishes it.
            unsafe { block.as_ref() }.next.store(old, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(
                    old,
                    block.as_ptr() as usize,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Detach the entire roster (sweep). Returns the old head.
    pub(crate) fn detach_all(&self) -> *mut HugeUnitHead {
        self.head.swap(0, Ordering::Acquire) as *mut HugeUnitHead
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::heap::page::MARK_RELEASED;

    #[test]
    fn test_allocate_layout() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let block = HugeUnitHead::allocate(3_000_000).unwrap();
        // Safety: block alive.
        let h = unsafe { block.as_ref() };
        assert_eq!(h.fact_unit_size.load(Ordering::Relaxed), 3_000_000);
        assert!(h.aligned_unit_size >= 3_000_000);
        assert!(h.aligned_unit_size.is_multiple_of(HUGE_ALIGN));

        // Page header carries the huge tag; unit has no parent page.
        assert_eq!(
            PageHeader::size_class(NonNull::from(&h.page)),
            SizeClass::Huge
        );
        let unit = HugeUnitHead::unit(block);
        // Safety: unit header alive.
        let u = unsafe { unit.as_ref() };
        assert!(u.parent_page.is_null());
        assert_eq!(u.mark.load(Ordering::Relaxed), MARK_RELEASED);

        // Payload directly follows the unit header and is writable.
        let user = HugeUnitHead::user_ptr(block);
        assert_eq!(
            user.as_ptr() as usize,
            block.as_ptr() as usize + std::mem::size_of::<HugeUnitHead>()
        );
        // Safety: payload is ours.
        unsafe {
            std::ptr::write_bytes(user.as_ptr(), 0xEE, 3_000_000);
            assert_eq!(*user.as_ptr().add(2_999_999), 0xEE);
        }

        // Round trip through the embedded unit.
        // Safety: unit belongs to this block.
        assert_eq!(unsafe { HugeUnitHead::from_unit(unit) }, block);

        // Safety: no users left.
        unsafe { HugeUnitHead::deallocate(block) };
    }

    #[test]
    fn test_card_mark_trailing_table() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let block = HugeUnitHead::allocate(10_000).unwrap();
        let user = HugeUnitHead::user_ptr(block).as_ptr() as usize;
        HugeUnitHead::card_mark(block, user + 5_000);
        // Safety: block alive.
        let h = unsafe { block.as_ref() };
        let byte = (5_000 / CARD_GRANULE) / 8;
        let bit = 1u8 << ((5_000 / CARD_GRANULE) % 8);
        // Safety: cards region alive.
        assert_ne!(unsafe { *h.cards.add(byte) } & bit, 0);
        // Safety: no users left.
        unsafe { HugeUnitHead::deallocate(block) };
    }

    #[test]
    fn test_roster_push_detach() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        let roster = HugeRoster::new();
        assert!(roster.detach_all().is_null());

        let a = HugeUnitHead::allocate(2 * 1024 * 1024).unwrap();
        let b = HugeUnitHead::allocate(2 * 1024 * 1024).unwrap();
        roster.push(a);
        roster.push(b);

        // LIFO walk.
        let head = roster.detach_all();
        assert_eq!(head, b.as_ptr());
        // Safety: b alive.
        let next = unsafe { (*head).next.load(Ordering::Relaxed) } as *mut HugeUnitHead;
        assert_eq!(next, a.as_ptr());
        assert!(roster.detach_all().is_null());

        // Safety: no users left.
        unsafe {
            HugeUnitHead::deallocate(a);
            HugeUnitHead::deallocate(b);
        }
    }
}
