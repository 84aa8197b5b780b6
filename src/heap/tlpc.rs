//! Thread-Local Page Collection: the per-thread allocation tier.
//!
//! Each mutator thread owns one `Tlpc`. Per size class it keeps a ring of
//! up to eight active pages plus a local free-unit list linked through the
//! first word of each freed unit's user data. The local list serves the
//! fast path with no atomics beyond the single release publish of the mark
//! byte (and a relaxed load of the collector epoch).
//!
//! Strictly single-owner: only the owning thread touches the ring and the
//! local lists. Everything cross-thread goes through page foreign lists or
//! the GPC stacks.

use std::ptr::NonNull;

use super::huge::HugeUnitHead;
use super::page::{PageHeader, UnitHeader};
use super::runtime::HeapRuntime;
use super::size_class::{PAGE_HEADER_SIZE, SizeClass, UNIT_CLASS_COUNT, classify};
use super::vm::HeapError;
use crate::sync::Arc;
use crate::sync::atomic::Ordering;

/// Active pages kept per size class before drained pages are abandoned.
pub(crate) const ACTIVE_RING_PAGES: usize = 8;

/// Owner-local list of freed units, linked through the first `usize` of
/// each unit's user data. Popping reuses the slot directly: the header is
/// still in place, only the mark and stamp fields need refreshing.
pub(crate) struct LocalFreeList {
    head: Option<NonNull<u8>>,
    count: u32,
}

impl LocalFreeList {
    pub fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    pub fn push(&mut self, user: NonNull<u8>) {
        // SAFETY: user data of a RELEASED unit is dead storage owned by this
        // thread; every class capacity holds at least one usize.
        unsafe {
            *user.cast::<usize>().as_ptr() = self.head.map_or(0, |p| p.as_ptr() as usize);
        }
        self.head = Some(user);
        self.count += 1;
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        if let Some(user) = self.head {
            // SAFETY: link was written by push.
            unsafe {
                let next = *user.cast::<usize>().as_ptr();
                self.head = NonNull::new(next as *mut u8);
            }
            self.count -= 1;
            Some(user)
        } else {
            None
        }
    }

    #[allow(dead_code)]
    pub fn count(&self) -> u32 {
        self.count
    }
}

struct ActiveGroup {
    ring: [*mut PageHeader; ACTIVE_RING_PAGES],
    len: usize,
    current: usize,
    free_units: LocalFreeList,
}

impl ActiveGroup {
    fn new() -> Self {
        Self {
            ring: [std::ptr::null_mut(); ACTIVE_RING_PAGES],
            len: 0,
            current: 0,
            free_units: LocalFreeList::new(),
        }
    }
}

/// One thread's allocation state. Created against a live runtime; the Arc
/// keeps the chunks mapped even if the heap is shut down while this thread
/// still holds cached pages.
pub struct Tlpc {
    pub(crate) runtime: Arc<HeapRuntime>,
    groups: [ActiveGroup; UNIT_CLASS_COUNT],
    id: u64,
}

// Safety: Tlpc is single-owner; sending it to another thread transfers that
// ownership wholesale (the cached pages travel with it).
unsafe impl Send for Tlpc {}

impl Tlpc {
    pub(crate) fn new(runtime: Arc<HeapRuntime>) -> Self {
        let id = runtime.gpc.register_tlpc();
        Self {
            runtime,
            groups: std::array::from_fn(|_| ActiveGroup::new()),
            id,
        }
    }

    #[inline]
    fn rt<'a>(&self) -> &'a HeapRuntime {
        // Safety: self.runtime keeps the runtime alive for self's lifetime;
        // the unbound borrow sidesteps the &mut self / field-borrow
        // conflict on the allocation paths.
        unsafe { &*Arc::as_ptr(&self.runtime) }
    }

    /// Allocate `size` bytes with the given GC-type mask.
    pub fn alloc(&mut self, size: usize, gc_type: u8) -> Result<NonNull<u8>, HeapError> {
        let rt = self.rt();
        let size = size.max(1);
        match classify(size) {
            SizeClass::Unit(idx) => {
                let epoch = rt.gc.current_epoch();
                let idx = idx as usize;
                // Fast path: local free list.
                if let Some(user) = self.groups[idx].free_units.pop() {
                    // Safety: user came from user_ptr of a RELEASED unit.
                    let unit = unsafe { UnitHeader::from_user_ptr(user) };
                    // Safety: popped unit is exclusively ours.
                    unsafe { UnitHeader::publish_allocated(unit, epoch, gc_type) };
                    return Ok(user);
                }
                self.alloc_unit_slow(idx, epoch, gc_type)
            }
            SizeClass::LargePages(k) => {
                let span = rt.gpc.try_alloc_span(k)?;
                let unit = PageHeader::span_unit(span);
                // Safety: span just obtained, unit is RELEASED and ours.
                unsafe { UnitHeader::publish_allocated(unit, rt.gc.current_epoch(), gc_type) };
                Ok(UnitHeader::user_ptr(unit))
            }
            SizeClass::Huge => {
                let block = HugeUnitHead::allocate(size)?;
                let unit = HugeUnitHead::unit(block);
                // Publish before registering: once the block is on the
                // roster the sweeper may inspect it, and a RELEASED huge
                // unit is fair game for reclamation.
                // Safety: block is exclusively ours until registered.
                unsafe { UnitHeader::publish_allocated(unit, rt.gc.current_epoch(), gc_type) };
                rt.gpc.register_huge(block);
                Ok(HugeUnitHead::user_ptr(block))
            }
        }
    }

    /// Slow path: rotate the active ring reclaiming foreign frees, then
    /// pull pages from the GPC, abandoning drained ones.
    fn alloc_unit_slow(
        &mut self,
        idx: usize,
        epoch: u8,
        gc_type: u8,
    ) -> Result<NonNull<u8>, HeapError> {
        loop {
            let g = &mut self.groups[idx];
            for step in 0..g.len {
                let i = (g.current + step) % g.len;
                // Safety: ring entries below len are valid owned pages.
                let page = unsafe { NonNull::new_unchecked(g.ring[i]) };
                // Safety: this thread owns every ring page.
                if unsafe { PageHeader::try_reclaim_foreign(page) } {
                    g.current = i;
                    // Safety: owner thread.
                    if let Some(unit) = unsafe { PageHeader::try_bump(page) } {
                        // Safety: bumped unit is exclusively ours.
                        unsafe { UnitHeader::publish_allocated(unit, epoch, gc_type) };
                        return Ok(UnitHeader::user_ptr(unit));
                    }
                }
            }

            // Nothing in the ring can yield: pull from the GPC.
            let page = self.rt().gpc.try_get_free_page(idx)?;
            // A page straight off the free stack may itself be drained
            // (returned by a dying thread after heavy use). Abandon duds;
            // the sweeper re-adopts them once foreign frees accumulate.
            // Safety: popped page is exclusively ours.
            if !unsafe { PageHeader::try_reclaim_foreign(page) } {
                // Safety: page header alive.
                unsafe { page.as_ref() }.abandoned.store(1, Ordering::Release);
                continue;
            }

            let g = &mut self.groups[idx];
            if g.len == ACTIVE_RING_PAGES {
                // Ring full: every member just failed to yield, so the
                // current page is drained — abandon and replace it.
                let evicted = g.ring[g.current];
                // Safety: evicted page header alive.
                unsafe { (*evicted).abandoned.store(1, Ordering::Release) };
                g.ring[g.current] = page.as_ptr();
            } else {
                g.ring[g.len] = page.as_ptr();
                g.current = g.len;
                g.len += 1;
            }
        }
    }

    /// Manual free. Routing: units of classes this thread allocates go to
    /// the local list; units of classes with no local group take the
    /// parent page's foreign path; spans return to the GPC stack; huge
    /// units only flip to RELEASED (the sweep reclaims the storage).
    ///
    /// # Safety
    /// `user` must be a live pointer previously returned by an alloc on
    /// this heap. A double free is detected by the mark exchange (panics in
    /// debug builds, loser is a no-op in release).
    pub unsafe fn free(&mut self, user: NonNull<u8>) {
        let rt = self.rt();
        // Safety: user points at a unit's data per contract.
        let unit = unsafe { UnitHeader::from_user_ptr(user) };
        // Safety: header alive.
        let parent = unsafe { unit.as_ref() }.parent_page;

        if let Some(page) = NonNull::new(parent) {
            if !UnitHeader::try_release_mark(unit) {
                return; // double free: the loser takes no further action
            }
            rt.invoke_destroyer(unit, user);
            let SizeClass::Unit(idx) = PageHeader::size_class(page) else {
                unreachable!("unit with parent page must be a unit class");
            };
            let g = &mut self.groups[idx as usize];
            if g.len > 0 {
                g.free_units.push(user);
            } else {
                // Safety: we won the release exchange; unit belongs to page.
                unsafe { PageHeader::foreign_push(page, unit) };
            }
            return;
        }

        // Large span or huge block: the discriminating page header sits
        // directly before the unit header.
        // Safety: span/huge layouts place a PageHeader 16 bytes below.
        let page = unsafe {
            NonNull::new_unchecked(
                unit.as_ptr()
                    .cast::<u8>()
                    .sub(PAGE_HEADER_SIZE)
                    .cast::<PageHeader>(),
            )
        };
        match PageHeader::size_class(page) {
            SizeClass::LargePages(_) => {
                if !UnitHeader::try_release_mark(unit) {
                    return;
                }
                rt.invoke_destroyer(unit, user);
                rt.gpc.return_free_span(page);
            }
            SizeClass::Huge => {
                // The mark flip is the whole operation here: the block stays
                // on the roster and the next sweep runs the finalizer and
                // returns the storage to the system heap. Running the
                // finalizer now would race that deallocation, and the
                // exchange keeps a second free a detected no-op.
                UnitHeader::try_release_mark(unit);
            }
            SizeClass::Unit(_) => unreachable!("unit pages always set parent_page"),
        }
    }

    /// Reallocate. Shrinks within one ladder step (and huge shrinks within
    /// the aligned size) keep the pointer; everything else allocates with
    /// the original type mask, copies `min(old, new)` and frees the old
    /// unit.
    ///
    /// # Safety
    /// `user` must be live, as for [`Tlpc::free`].
    pub unsafe fn realloc(
        &mut self,
        user: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        // Safety: user points at a unit's data per contract.
        let unit = unsafe { UnitHeader::from_user_ptr(user) };
        // Safety: header alive.
        let parent = unsafe { unit.as_ref() }.parent_page;

        let (old_ladder, old_size) = if let Some(page) = NonNull::new(parent) {
            let class = PageHeader::size_class(page);
            (class.ladder_index(), class.capacity())
        } else {
            // Safety: span/huge layout as in free().
            let page = unsafe {
                NonNull::new_unchecked(
                    unit.as_ptr()
                        .cast::<u8>()
                        .sub(PAGE_HEADER_SIZE)
                        .cast::<PageHeader>(),
                )
            };
            match PageHeader::size_class(page) {
                class @ SizeClass::LargePages(_) => (class.ladder_index(), class.capacity()),
                SizeClass::Huge => {
                    // Safety: unit embedded in a live huge block.
                    let block = unsafe { HugeUnitHead::from_unit(unit) };
                    // Safety: block alive.
                    let h = unsafe { block.as_ref() };
                    if new_size <= h.aligned_unit_size && new_size > 0 {
                        h.fact_unit_size.store(new_size, Ordering::Relaxed);
                        return Ok(user);
                    }
                    (None, h.fact_unit_size.load(Ordering::Relaxed))
                }
                SizeClass::Unit(_) => unreachable!("unit pages always set parent_page"),
            }
        };

        let new_class = classify(new_size.max(1));
        if let (Some(old), Some(new)) = (old_ladder, new_class.ladder_index()) {
            // Same class, or a shrink by a single step: the slot still fits
            // the data, keep the pointer.
            if new == old || (new + 1 == old) {
                return Ok(user);
            }
        }

        // Safety: header alive.
        let gc_type = unsafe { unit.as_ref() }.gc_type.load(Ordering::Relaxed);
        let new_user = self.alloc(new_size, gc_type)?;
        // Safety: both regions are live and at least min(old, new) long.
        unsafe {
            std::ptr::copy_nonoverlapping(
                user.as_ptr(),
                new_user.as_ptr(),
                old_size.min(new_size),
            );
            self.free(user);
        }
        Ok(new_user)
    }
}

impl Drop for Tlpc {
    fn drop(&mut self) {
        // Drain every cached unit back to its parent page, return the ring
        // pages to the GPC, then unregister. Units on the local lists are
        // already RELEASED, so a plain foreign push suffices.
        let rt: &HeapRuntime = unsafe { &*Arc::as_ptr(&self.runtime) };
        for g in &mut self.groups {
            while let Some(user) = g.free_units.pop() {
                // Safety: local lists only hold unit-page users.
                let unit = unsafe { UnitHeader::from_user_ptr(user) };
                // Safety: header alive.
                let page = NonNull::new(unsafe { unit.as_ref() }.parent_page)
                    .expect("local free lists never hold span or huge units");
                // Safety: unit is RELEASED and ours until pushed.
                unsafe { PageHeader::foreign_push(page, unit) };
            }
            for i in 0..g.len {
                // Safety: ring entries below len are valid.
                rt.gpc
                    .return_free_page(unsafe { NonNull::new_unchecked(g.ring[i]) });
            }
            g.len = 0;
        }
        rt.gpc.unregister_tlpc(self.id);
    }
}
