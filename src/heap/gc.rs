//! The collector: gray work list, cycle state machine, tri-color marking
//! and the sweep.
//!
//! One dedicated thread drives cycles. It sleeps on a bounded wait so stop
//! and trigger requests are observed promptly, and runs a cycle only when
//! one was requested. A cycle is: advance the 4-bit epoch, raise
//! `in_marking`, let the client push roots, drain the gray list to a
//! fixpoint, drop `in_marking`, sweep.
//!
//! Gray entries are raw addresses: everything pushed (roots, barrier hits,
//! conservative range scans) is validated through the reverse map at drain
//! time. Unvalidated garbage simply resolves to nothing.

use std::ptr::NonNull;

use super::chunk::MULTIPAGE_DEAD;
use super::huge::HugeUnitHead;
use super::page::{
    MARK_FULL_MARKED, MARK_RELEASED, MARK_SELF_MARKED, MARK_UNMARKED, PageHeader,
    TYPE_AUTO_MARK, TYPE_HAS_MARKER, TYPE_NEED_SWEEP, UnitHeader,
};
use super::runtime::HeapRuntime;
use super::size_class::{PAGE_HEADER_SIZE, SizeClass};
use super::stats;
use super::tagged_stack::{StackNode, TaggedStack};
use crate::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use crate::sync::{Condvar, Mutex, condvar_wait_timeout};

// ---------------------------------------------------------------------------
// Gray list
// ---------------------------------------------------------------------------

/// A suspected reference awaiting validation and marking.
pub(crate) struct GrayNode {
    next: AtomicUsize,
    addr: usize,
}

// Safety: a node's link belongs to whichever stack (gray or pool) currently
// holds it; ownership transfers with the push.
unsafe impl StackNode for GrayNode {
    fn link(&self) -> &AtomicUsize {
        &self.next
    }
}

/// Process-global gray work list with a pooled-node backing store.
///
/// The list itself is push + steal-all, so a single-word head suffices; the
/// "dropped" node pool sees pop-reuse-push cycles and therefore lives on an
/// ABA-safe tagged stack.
pub(crate) struct GrayList {
    head: AtomicUsize,
    pool: TaggedStack<GrayNode>,
}

impl GrayList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            pool: TaggedStack::new(),
        }
    }

    /// Push a suspected reference. Never blocks; allocates a node only when
    /// the pool is dry.
    pub(crate) fn push(&self, addr: usize) {
        let node = self.pool.pop().unwrap_or_else(|| {
            NonNull::from(Box::leak(Box::new(GrayNode {
                next: AtomicUsize::new(0),
                addr: 0,
            })))
        });
        // Safety: the node is exclusively ours until the CAS publishes it.
        unsafe { (*node.as_ptr()).addr = addr };
        loop {
            let old = self.head.load(Ordering::Relaxed);
            // Safety: node still ours.
            unsafe { node.as_ref() }.next.store(old, Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(
                    old,
                    node.as_ptr() as usize,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Atomically steal the entire list (drain loop).
    fn steal(&self) -> *mut GrayNode {
        self.head.swap(0, Ordering::Acquire) as *mut GrayNode
    }

    fn recycle(&self, node: NonNull<GrayNode>) {
        self.pool.push(node);
    }
}

impl Drop for GrayList {
    fn drop(&mut self) {
        // Stragglers pushed after the final cycle plus the pooled nodes.
        let mut node = self.steal();
        while !node.is_null() {
            // Safety: exclusive at teardown; nodes were leaked Boxes.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) } as *mut GrayNode;
            // Safety: see above.
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
        while let Some(node) = self.pool.pop() {
            // Safety: pool nodes were leaked Boxes.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle state
// ---------------------------------------------------------------------------

struct Trigger {
    requested: u64,
    completed: u64,
    full_pending: bool,
    stop: bool,
}

enum Action {
    Run { seq: u64, full: bool },
    Idle,
    Stop,
}

pub(crate) struct GcState {
    epoch: AtomicU8,
    in_marking: AtomicBool,
    pub(crate) gray: GrayList,
    trigger: Mutex<Trigger>,
    cv: Condvar,
}

impl GcState {
    pub(crate) fn new() -> Self {
        Self {
            epoch: AtomicU8::new(0),
            in_marking: AtomicBool::new(false),
            gray: GrayList::new(),
            trigger: Mutex::new(Trigger {
                requested: 0,
                completed: 0,
                full_pending: false,
                stop: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// The collector's 4-bit round counter, stamped into allocations.
    pub(crate) fn current_epoch(&self) -> u8 {
        self.epoch.load(Ordering::Relaxed)
    }

    pub(crate) fn marking_active(&self) -> bool {
        self.in_marking.load(Ordering::Acquire)
    }

    /// Ask for a cycle; returns the sequence number to wait on. After the
    /// collector has been stopped the request degenerates to a no-op (the
    /// returned sequence is already completed).
    pub(crate) fn request_collect(&self, full: bool) -> u64 {
        let mut t = self
            .trigger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if t.stop {
            return t.completed;
        }
        t.requested += 1;
        t.full_pending |= full;
        let seq = t.requested;
        self.cv.notify_all();
        seq
    }

    /// Block until the cycle with the given sequence number has finished.
    pub(crate) fn wait_completed(&self, seq: u64) {
        let mut t = self
            .trigger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while t.completed < seq {
            t = self
                .cv
                .wait(t)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    pub(crate) fn request_stop(&self) {
        let mut t = self
            .trigger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        t.stop = true;
        self.cv.notify_all();
    }

    fn next_action(&self, wake: std::time::Duration) -> Action {
        let mut t = self
            .trigger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if t.stop {
            return Action::Stop;
        }
        if t.requested == t.completed {
            t = condvar_wait_timeout(&self.cv, t, wake);
            if t.stop {
                return Action::Stop;
            }
            if t.requested == t.completed {
                return Action::Idle;
            }
        }
        let full = t.full_pending;
        t.full_pending = false;
        Action::Run {
            seq: t.completed + 1,
            full,
        }
    }

    fn complete(&self, seq: u64) {
        let mut t = self
            .trigger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug_assert_eq!(t.completed + 1, seq);
        t.completed = seq;
        self.cv.notify_all();
    }

    /// Release every `wait_completed` caller when the collector exits with
    /// requests still pending (stop during an in-flight `collect`).
    fn abort_pending(&self) {
        let mut t = self
            .trigger
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        t.completed = t.requested;
        self.cv.notify_all();
    }
}

/// Body of the dedicated collector thread. Holds a strong reference only
/// while awake; once every other reference is gone the upgrade fails and
/// the thread exits on its next bounded wake.
#[cfg(not(loom))]
pub(crate) fn collector_loop(weak: std::sync::Weak<HeapRuntime>) {
    loop {
        let Some(rt) = weak.upgrade() else { break };
        match rt.gc.next_action(rt.config.gc_wake_interval) {
            Action::Stop => {
                rt.gc.abort_pending();
                break;
            }
            Action::Idle => {}
            Action::Run { seq, full } => {
                run_cycle(&rt, full);
                rt.gc.complete(seq);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Marking
// ---------------------------------------------------------------------------

/// One full cycle: IDLE → MARKING → SWEEPING → IDLE.
pub(crate) fn run_cycle(rt: &HeapRuntime, full: bool) {
    let gc = &rt.gc;

    let epoch = (gc.epoch.load(Ordering::Relaxed) + 1) & 0x0F;
    gc.epoch.store(epoch, Ordering::Release);
    gc.in_marking.store(true, Ordering::Release);

    // Roots. The callback may block; the cycle proceeds only after it
    // returns, having pushed whatever it considers reachable.
    if let Some(root_marking) = rt.callbacks.root_marking {
        // Safety: callback contract (init documented it).
        unsafe { root_marking(rt.callbacks.user_ctx) };
    }

    // Drain to a fixpoint. Marking scans and user markers push more
    // entries, so keep stealing until the list comes back empty.
    loop {
        let mut node = gc.gray.steal();
        if node.is_null() {
            break;
        }
        while let Some(current) = NonNull::new(node) {
            // Safety: stolen nodes are exclusively ours.
            let addr = unsafe { (*node).addr };
            let next = unsafe { (*node).next.load(Ordering::Relaxed) } as *mut GrayNode;
            gc.gray.recycle(current);
            mark_address(rt, addr);
            node = next;
        }
    }

    gc.in_marking.store(false, Ordering::Release);

    sweep(rt, full, epoch);
    stats::GC_CYCLES.add(1);
}

/// Validate one gray entry and run the tri-color transitions on its unit.
fn mark_address(rt: &HeapRuntime, addr: usize) {
    let Some(unit) = rt.gpc.lookup_unit_head(addr) else {
        return;
    };
    // Safety: unit headers live as long as their page/block.
    let u = unsafe { unit.as_ref() };

    // White → gray: only the first marker proceeds; every later attempt
    // (duplicate root, barrier replay) observes the CAS failure and skips.
    if u.mark
        .compare_exchange(MARK_UNMARKED, MARK_SELF_MARKED, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    // Gray → black. Fails only if a mutator freed the unit in between.
    if u.mark
        .compare_exchange(MARK_SELF_MARKED, MARK_FULL_MARKED, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let gc_type = u.gc_type.load(Ordering::Relaxed);
    let user = UnitHeader::user_ptr(unit);

    if gc_type & TYPE_AUTO_MARK != 0 {
        // Conservative child scan: every payload word that resolves through
        // the reverse map is a suspected reference.
        let payload_bytes = unit_payload_size(unit);
        let words = payload_bytes / std::mem::size_of::<usize>();
        for w in 0..words {
            // Safety: the payload is at least `payload_bytes` long and
            // 8-aligned; reading racy mutator data is fine — any torn or
            // stale value just fails validation.
            let value = unsafe { user.as_ptr().cast::<usize>().add(w).read() };
            if value != 0 && rt.gpc.lookup_unit_head(value).is_some() {
                rt.gc.gray.push(value);
            }
        }
    }

    if gc_type & TYPE_HAS_MARKER != 0
        && let Some(marker) = rt.callbacks.marker
    {
        // Safety: callback contract.
        unsafe { marker(rt.callbacks.user_ctx, user.as_ptr()) };
    }
}

/// Payload size of a unit, for the conservative child scan.
fn unit_payload_size(unit: NonNull<UnitHeader>) -> usize {
    // Safety: header alive.
    let parent = unsafe { unit.as_ref() }.parent_page;
    if let Some(page) = NonNull::new(parent) {
        return PageHeader::size_class(page).capacity();
    }
    // Safety: span/huge layout places the page header 16 bytes below.
    let page = unsafe {
        NonNull::new_unchecked(
            unit.as_ptr()
                .cast::<u8>()
                .sub(PAGE_HEADER_SIZE)
                .cast::<PageHeader>(),
        )
    };
    match PageHeader::size_class(page) {
        class @ SizeClass::LargePages(_) => class.capacity(),
        SizeClass::Huge => {
            // Safety: unit embedded in a live huge block.
            let block = unsafe { HugeUnitHead::from_unit(unit) };
            // Safety: block alive.
            unsafe { block.as_ref() }.fact_unit_size.load(Ordering::Relaxed)
        }
        SizeClass::Unit(_) => unreachable!("unit pages always set parent_page"),
    }
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

/// A unit is reclaimed this round iff it is white, opted into sweeping,
/// not allocated during this round, and not shielded by generational
/// policy on a minor cycle.
fn unit_is_dead(u: &UnitHeader, mark: u8, full: bool, epoch: u8) -> bool {
    mark == MARK_UNMARKED
        && u.gc_type.load(Ordering::Relaxed) & TYPE_NEED_SWEEP != 0
        && u.alloc_epoch.load(Ordering::Relaxed) != epoch
        && (full || u.age.load(Ordering::Relaxed) > 0)
}

/// Survivors age toward tenure and their color resets to white. The mark
/// reset is a CAS so a concurrent manual free can never be overwritten.
fn survivor_update(u: &UnitHeader, observed_mark: u8) {
    let age = u.age.load(Ordering::Relaxed);
    if age > 0 {
        u.age.store(age - 1, Ordering::Relaxed);
    }
    if observed_mark == MARK_SELF_MARKED || observed_mark == MARK_FULL_MARKED {
        let _ = u.mark.compare_exchange(
            observed_mark,
            MARK_UNMARKED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

fn sweep(rt: &HeapRuntime, full: bool, epoch: u8) {
    // Every committed page of every chunk, newest chunk first.
    let mut chunk = rt.gpc.chunks_head();
    while !chunk.is_null() {
        // Safety: chunks live until the Gpc drops.
        let c = unsafe { &*chunk };
        let committed = c.committed_pages();
        let mut i = 0;
        while i < committed {
            let offset = c.multipage_offset_of(i);
            if offset == MULTIPAGE_DEAD {
                i += 1;
                continue;
            }
            debug_assert_eq!(offset, 0, "sweep must land on span heads");
            let page = NonNull::new(c.page_ptr(i).cast::<PageHeader>())
                .expect("committed page pointers are never null");
            match PageHeader::size_class(page) {
                class @ SizeClass::Unit(_) => {
                    sweep_unit_page(rt, page, class, full, epoch);
                    i += 1;
                }
                SizeClass::LargePages(k) => {
                    sweep_span(rt, page, full, epoch);
                    i += k as usize;
                }
                SizeClass::Huge => unreachable!("huge tags never appear in chunks"),
            }
        }
        chunk = c.prev;
    }

    sweep_huge(rt, full, epoch);
}

fn sweep_unit_page(
    rt: &HeapRuntime,
    page: NonNull<PageHeader>,
    class: SizeClass,
    full: bool,
    epoch: u8,
) {
    let stride = class.stride();
    for slot in 0..class.units_per_page() {
        let offset = PAGE_HEADER_SIZE + slot * stride;
        // Safety: slot iteration stays within the initialized unit stream.
        let unit = unsafe { PageHeader::unit_at(page, offset as u16) };
        // Safety: header alive.
        let u = unsafe { unit.as_ref() };

        // Acquire pairs with the release publish in allocation, so the
        // epoch/type/age reads below are never older than the mark.
        let mark = u.mark.load(Ordering::Acquire);
        if mark == MARK_RELEASED {
            continue;
        }
        if unit_is_dead(u, mark, full, epoch) {
            // Winner-takes-the-unit: a racing manual free may get here
            // first, in which case this CAS loses and we move on.
            if u.mark
                .compare_exchange(MARK_UNMARKED, MARK_RELEASED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                rt.invoke_destroyer(unit, UnitHeader::user_ptr(unit));
                // Safety: we won the release exchange; unit belongs to page.
                unsafe { PageHeader::foreign_push(page, unit) };
                stats::UNITS_SWEPT.add(1);
            }
        } else {
            survivor_update(u, mark);
        }
    }

    // Re-adopt abandoned pages once foreign frees (often our own pushes
    // just above) made them useful again.
    // Safety: header alive.
    let hdr = unsafe { page.as_ref() };
    if hdr.abandoned.load(Ordering::Acquire) == 1
        && hdr.foreign_free_head.load(Ordering::Relaxed) != 0
        && hdr.abandoned.swap(0, Ordering::AcqRel) == 1
    {
        rt.gpc.return_free_page(page);
    }
}

fn sweep_span(rt: &HeapRuntime, page: NonNull<PageHeader>, full: bool, epoch: u8) {
    let unit = PageHeader::span_unit(page);
    // Safety: header alive.
    let u = unsafe { unit.as_ref() };
    let mark = u.mark.load(Ordering::Acquire);
    if mark == MARK_RELEASED {
        // Free span: already on the free-span stack (manual free or an
        // earlier sweep put it there).
        return;
    }
    if unit_is_dead(u, mark, full, epoch) {
        if u.mark
            .compare_exchange(MARK_UNMARKED, MARK_RELEASED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            rt.invoke_destroyer(unit, UnitHeader::user_ptr(unit));
            rt.gpc.return_free_span(page);
            stats::UNITS_SWEPT.add(1);
        }
    } else {
        survivor_update(u, mark);
    }
}

fn sweep_huge(rt: &HeapRuntime, full: bool, epoch: u8) {
    // Detach the whole roster; dead blocks are unregistered and returned to
    // the system heap, survivors are pushed back.
    let mut block = rt.gpc.huge_roster.detach_all();
    while !block.is_null() {
        // Safety: detached roster entries are exclusively ours to walk.
        let next = unsafe { (*block).next.load(Ordering::Relaxed) } as *mut HugeUnitHead;
        // Safety: non-null checked by the loop condition.
        let bnn = unsafe { NonNull::new_unchecked(block) };
        let unit = HugeUnitHead::unit(bnn);
        // Safety: header alive.
        let u = unsafe { unit.as_ref() };

        let mark = u.mark.load(Ordering::Acquire);
        let mut reclaim = false;
        if mark == MARK_RELEASED {
            // Manually freed: free() only flips the mark on huge units, so
            // the finalizer runs here, where the block is exclusively ours.
            rt.invoke_destroyer(unit, HugeUnitHead::user_ptr(bnn));
            reclaim = true;
        } else if unit_is_dead(u, mark, full, epoch)
            && u.mark
                .compare_exchange(MARK_UNMARKED, MARK_RELEASED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            rt.invoke_destroyer(unit, HugeUnitHead::user_ptr(bnn));
            stats::UNITS_SWEPT.add(1);
            reclaim = true;
        }

        if reclaim {
            rt.gpc.unregister_huge(bnn);
            // Safety: unregistered and off the roster; no lookups can reach
            // the block anymore.
            unsafe { HugeUnitHead::deallocate(bnn) };
        } else {
            survivor_update(u, mark);
            rt.gpc.huge_roster.push(bnn);
        }
        block = next;
    }
}
