//! Heap runtime and public entry points.
//!
//! `HeapRuntime` is the instance form: it owns the Global Page Collection,
//! the collector state and the client callbacks, and spawns the collector
//! thread. `GcHeap` is the process-global facade the managed runtime talks
//! to; it routes through a generation-checked thread-local `Tlpc` so the
//! fast paths never take a lock.

use std::ptr::NonNull;

use super::gc::{self, GcState};
use super::gpc::Gpc;
use super::page::{
    MARK_FULL_MARKED, TYPE_AUTO_MARK, TYPE_HAS_FINALIZER, TYPE_HAS_MARKER, TYPE_NEED_SWEEP,
    UnitHeader,
};
use super::size_class::PAGE_SIZE;
use super::stats;
pub use super::tlpc::Tlpc;
use super::vm::{HeapError, PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::cell::{Cell, UnsafeCell};
use crate::sync::{Arc, Mutex, RwLock};

// GC-type mask bits, the public names for `alloc_attrib`.
/// Unmarked units of this type are destroyed by the sweep.
pub const GC_UNIT_NEED_SWEEP: u8 = TYPE_NEED_SWEEP;
/// Marked units of this type have their payload scanned for references.
pub const GC_UNIT_AUTO_MARK: u8 = TYPE_AUTO_MARK;
/// Marked units of this type trigger the registered marker callback.
pub const GC_UNIT_HAS_MARKER: u8 = TYPE_HAS_MARKER;
/// Reclaimed units of this type trigger the registered destroyer callback.
pub const GC_UNIT_HAS_FINALIZER: u8 = TYPE_HAS_FINALIZER;

/// Opaque pointer handed back to every callback.
pub type UserContext = *mut ();
/// Invoked for units with [`GC_UNIT_HAS_MARKER`] when they turn black; the
/// callback pushes referenced addresses via `try_mark_unit`.
pub type MarkerFn = unsafe fn(UserContext, *mut u8);
/// Invoked for units with [`GC_UNIT_HAS_FINALIZER`] when they are reclaimed.
pub type DestroyerFn = unsafe fn(UserContext, *mut u8);
/// Invoked at mark start; blocks the collector until roots are pushed.
pub type RootMarkingFn = unsafe fn(UserContext);

/// Client callbacks. All optional; a null context with no callbacks yields
/// a heap that only reclaims through manual `free`.
#[derive(Clone, Copy)]
pub struct HeapCallbacks {
    pub user_ctx: UserContext,
    pub marker: Option<MarkerFn>,
    pub destroyer: Option<DestroyerFn>,
    pub root_marking: Option<RootMarkingFn>,
}

impl Default for HeapCallbacks {
    fn default() -> Self {
        Self {
            user_ctx: std::ptr::null_mut(),
            marker: None,
            destroyer: None,
            root_marking: None,
        }
    }
}

// Safety: the context pointer is opaque; the client guarantees its
// callbacks tolerate being invoked from the collector thread.
unsafe impl Send for HeapCallbacks {}
// Safety: see above.
unsafe impl Sync for HeapCallbacks {}

/// Tunables. Defaults match the production constants; tests shrink the
/// chunk to keep reservations cheap.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Payload bytes per chunk reservation. Must be a multiple of the
    /// 64 KiB heap page.
    pub chunk_size: usize,
    /// Bounded wait of the collector thread between trigger checks.
    pub gc_wake_interval: std::time::Duration,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunk_size: super::chunk::DEFAULT_CHUNK_SIZE,
            gc_wake_interval: std::time::Duration::from_millis(10),
        }
    }
}

/// Point-in-time snapshot of the diagnostic gauges.
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub committed_pages: usize,
    pub huge_units_live: usize,
    pub gc_cycles: usize,
    pub units_swept: usize,
}

impl HeapStats {
    pub fn snapshot() -> Self {
        Self {
            total_reserved: stats::TOTAL_RESERVED.load(Ordering::Relaxed),
            total_committed: stats::TOTAL_COMMITTED.load(Ordering::Relaxed),
            committed_pages: stats::COMMITTED_PAGES.load(Ordering::Relaxed),
            huge_units_live: stats::HUGE_UNITS_LIVE.load(Ordering::Relaxed),
            gc_cycles: stats::GC_CYCLES.load(Ordering::Relaxed),
            units_swept: stats::UNITS_SWEPT.load(Ordering::Relaxed),
        }
    }
}

/// One heap instance: page collections, collector state, callbacks and the
/// collector thread.
pub struct HeapRuntime {
    pub(crate) gpc: Gpc,
    pub(crate) gc: GcState,
    pub(crate) callbacks: HeapCallbacks,
    pub(crate) config: HeapConfig,
    #[cfg(not(loom))]
    collector: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl HeapRuntime {
    /// Build a runtime and start its collector thread.
    ///
    /// # Errors
    ///
    /// `InitializationFailed` when the OS page size does not divide the
    /// 64 KiB heap page or the chunk geometry is invalid.
    pub fn new(callbacks: HeapCallbacks, config: HeapConfig) -> Result<Arc<Self>, HeapError> {
        let os_page = PlatformVmOps::page_size();
        if !PAGE_SIZE.is_multiple_of(os_page) {
            return Err(HeapError::InitializationFailed(format!(
                "heap page size {PAGE_SIZE} is not a multiple of the OS page size {os_page}"
            )));
        }
        let card_size = super::chunk::card_table_size(config.chunk_size);
        if !card_size.is_multiple_of(os_page) {
            return Err(HeapError::InitializationFailed(format!(
                "card table size {card_size} is not a multiple of the OS page size {os_page}"
            )));
        }
        if !config.chunk_size.is_multiple_of(PAGE_SIZE) || config.chunk_size == 0 {
            return Err(HeapError::InitializationFailed(format!(
                "chunk size {} is not a multiple of the heap page size",
                config.chunk_size
            )));
        }

        let runtime = Arc::new(Self {
            gpc: Gpc::new(config.chunk_size),
            gc: GcState::new(),
            callbacks,
            config,
            #[cfg(not(loom))]
            collector: Mutex::new(None),
        });

        #[cfg(not(loom))]
        {
            let weak = Arc::downgrade(&runtime);
            let handle = std::thread::Builder::new()
                .name("woogc-collector".to_string())
                .spawn(move || gc::collector_loop(weak))
                .map_err(|e| {
                    HeapError::InitializationFailed(format!("collector thread spawn: {e}"))
                })?;
            *runtime
                .collector
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        }

        Ok(runtime)
    }

    /// New thread-local collection bound to this runtime.
    pub fn new_tlpc(self: &Arc<Self>) -> Tlpc {
        Tlpc::new(self.clone())
    }

    /// Run one full or minor collection cycle and wait for it to finish.
    pub fn collect(&self, full: bool) {
        #[cfg(not(loom))]
        {
            let seq = self.gc.request_collect(full);
            self.gc.wait_completed(seq);
        }
        #[cfg(loom)]
        {
            gc::run_cycle(self, full);
        }
    }

    /// Unconditionally push a suspected unit address onto the gray list;
    /// validation happens at drain time.
    pub fn try_mark_unit(&self, addr: usize) {
        self.gc.gray.push(addr);
    }

    /// Conservatively scan `[begin, end)` (e.g. a stack range), pushing
    /// every loaded word as a suspected reference.
    ///
    /// # Safety
    /// The range must be readable for its whole length.
    pub unsafe fn try_mark_unit_range(&self, begin: usize, end: usize) {
        let word = std::mem::size_of::<usize>();
        let mut cursor = begin.next_multiple_of(word);
        while cursor + word <= end {
            // Safety: readable range per contract.
            let value = unsafe { (cursor as *const usize).read() };
            if value != 0 {
                self.gc.gray.push(value);
            }
            cursor += word;
        }
    }

    /// True iff marking is in progress.
    pub fn checkpoint(&self) -> bool {
        self.gc.marking_active()
    }

    /// Insertion barrier: during marking, a store of `written` into a black
    /// target re-grays the written address. Unresolvable targets push
    /// conservatively. Stores into tenured targets set the card bit.
    pub fn write_barrier(&self, target: *mut u8, written: *mut u8) {
        if !self.gc.marking_active() {
            return;
        }
        let Some(unit) = self.gpc.lookup_unit_head(target as usize) else {
            self.gc.gray.push(written as usize);
            return;
        };
        // Safety: unit header lives with its page/block.
        let u = unsafe { unit.as_ref() };
        if u.mark.load(Ordering::Relaxed) == MARK_FULL_MARKED {
            self.gc.gray.push(written as usize);
        }
        if u.age.load(Ordering::Relaxed) == 0 {
            self.gpc.card_mark_addr(target as usize);
        }
    }

    /// Deletion barrier: during marking, the overwritten referent is pushed
    /// so snapshot reachability is preserved.
    pub fn delete_barrier(&self, addr: usize) {
        if self.gc.marking_active() {
            self.gc.gray.push(addr);
        }
    }

    /// Stop and join the collector thread. Idempotent; called by the global
    /// facade's `shutdown` and by instance owners before teardown.
    pub fn stop_collector(&self) {
        self.gc.request_stop();
        #[cfg(not(loom))]
        {
            let handle = self
                .collector
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            if let Some(handle) = handle
                && handle.thread().id() != std::thread::current().id()
            {
                drop(handle.join());
            }
        }
    }

    pub(crate) fn invoke_destroyer(&self, unit: NonNull<UnitHeader>, user: NonNull<u8>) {
        // Safety: header lives with its page/block.
        let gc_type = unsafe { unit.as_ref() }.gc_type.load(Ordering::Relaxed);
        if gc_type & TYPE_HAS_FINALIZER != 0
            && let Some(destroyer) = self.callbacks.destroyer
        {
            // Safety: callback contract.
            unsafe { destroyer(self.callbacks.user_ctx, user.as_ptr()) };
        }
    }
}

impl Drop for HeapRuntime {
    fn drop(&mut self) {
        // The collector may already be gone (stop_collector) or may be the
        // thread running this drop; either way it only needs the signal.
        self.gc.request_stop();
    }
}

// ---------------------------------------------------------------------------
// Global facade
// ---------------------------------------------------------------------------

crate::sync::loom_static! {
    static GLOBAL_HEAP: RwLock<Option<Arc<HeapRuntime>>> = RwLock::new(None);
}

// Bumped on every init and shutdown; thread-local collections compare their
// recorded generation against this on each entry and rebind when it moved.
crate::sync::loom_static! {
    static HEAP_GENERATION: AtomicU64 = AtomicU64::new(0);
}

/// Per-thread handle owning the thread-local collection.
///
/// # Safety
///
/// `tlpc` is wrapped in `UnsafeCell` because it is only ever accessed by
/// the owning thread (via TLS). None of the allocation paths re-enter the
/// TLS access point — they interact with the GPC and the collector state
/// directly.
struct TlpcHandle {
    tlpc: UnsafeCell<Option<Tlpc>>,
    generation: Cell<u64>,
}

thread_local! {
    static LOCAL_TLPC: TlpcHandle = TlpcHandle {
        tlpc: UnsafeCell::new(None),
        generation: Cell::new(0),
    };
}

fn with_tlpc<R>(f: impl FnOnce(&mut Tlpc) -> R) -> Result<R, HeapError> {
    LOCAL_TLPC.with(|handle| {
        let generation = HEAP_GENERATION.load(Ordering::Acquire);
        // Safety: single-threaded TLS access (see TlpcHandle).
        let slot = crate::sync::unsafe_cell_mut!(handle.tlpc);
        if handle.generation.get() != generation {
            // The heap was re-initialized or shut down since this thread
            // last allocated: flush the stale collection back to its own
            // runtime, then rebind below.
            *slot = None;
            handle.generation.set(generation);
        }
        if slot.is_none() {
            let runtime = GLOBAL_HEAP
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
                .ok_or_else(|| {
                    HeapError::InitializationFailed("heap is not initialized".to_string())
                })?;
            *slot = Some(runtime.new_tlpc());
        }
        Ok(f(slot.as_mut().expect("slot filled above")))
    })
}

fn with_runtime<R>(f: impl FnOnce(&HeapRuntime) -> R) -> Result<R, HeapError> {
    let runtime = GLOBAL_HEAP
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
        .ok_or_else(|| HeapError::InitializationFailed("heap is not initialized".to_string()))?;
    Ok(f(&runtime))
}

/// Process-global heap. The managed runtime initializes it once, allocates
/// through the pointer-shaped API (null on failure), and shuts it down at
/// exit. `init(); shutdown(); init(); shutdown()` in sequence is valid.
pub struct GcHeap;

impl GcHeap {
    /// Initialize the global heap.
    ///
    /// # Errors
    ///
    /// `InitializationFailed` if already initialized or the platform
    /// geometry checks fail.
    pub fn init(callbacks: HeapCallbacks) -> Result<(), HeapError> {
        Self::init_with_config(callbacks, HeapConfig::default())
    }

    pub fn init_with_config(callbacks: HeapCallbacks, config: HeapConfig) -> Result<(), HeapError> {
        let mut slot = GLOBAL_HEAP
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return Err(HeapError::InitializationFailed(
                "already initialized".to_string(),
            ));
        }
        *slot = Some(HeapRuntime::new(callbacks, config)?);
        HEAP_GENERATION.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Shut the global heap down: flush the calling thread's collection,
    /// stop the collector, drop the global reference. Chunks and huge
    /// blocks are released once the last thread lets go of the runtime.
    ///
    /// # Panics
    ///
    /// Panics when called without a matching `init`.
    pub fn shutdown() {
        // Flush this thread's cached pages and units first.
        LOCAL_TLPC.with(|handle| {
            // Safety: single-threaded TLS access.
            let slot = crate::sync::unsafe_cell_mut!(handle.tlpc);
            *slot = None;
        });

        let runtime = {
            let mut slot = GLOBAL_HEAP
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let runtime = slot.take();
            HEAP_GENERATION.fetch_add(1, Ordering::Release);
            runtime
        };
        let runtime = runtime.expect("GcHeap::shutdown without a matching init");
        runtime.stop_collector();
        drop(runtime);
    }

    /// Allocate `size` bytes with an empty GC-type mask. Returns null on
    /// failure; no partial state is left behind.
    pub fn alloc_normal(size: usize) -> *mut u8 {
        Self::alloc_attrib(size, 0)
    }

    /// Allocate `size` bytes with the given GC-type mask (a bitwise-or of
    /// the `GC_UNIT_*` bits). Returns null on failure.
    pub fn alloc_attrib(size: usize, gc_type: u8) -> *mut u8 {
        match with_tlpc(|tlpc| tlpc.alloc(size, gc_type)) {
            Ok(Ok(ptr)) => ptr.as_ptr(),
            _ => std::ptr::null_mut(),
        }
    }

    /// Reallocate. Keeps the pointer when the new size still fits the
    /// unit's class (see `Tlpc::realloc`); otherwise allocates with the
    /// original mask, copies and frees. Null `ptr` degenerates to an
    /// allocation; returns null on failure (the old unit stays valid).
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer from this heap.
    pub unsafe fn realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(user) = NonNull::new(ptr) else {
            return Self::alloc_normal(new_size);
        };
        // Safety: forwarded contract.
        match with_tlpc(|tlpc| unsafe { tlpc.realloc(user, new_size) }) {
            Ok(Ok(ptr)) => ptr.as_ptr(),
            _ => std::ptr::null_mut(),
        }
    }

    /// Manual release. Optional for collected units.
    ///
    /// # Safety
    /// `ptr` must be a live pointer from this heap; double frees are
    /// detected by the mark exchange (panic in debug builds).
    pub unsafe fn free(ptr: *mut u8) {
        let Some(user) = NonNull::new(ptr) else {
            return;
        };
        // Safety: forwarded contract.
        drop(with_tlpc(|tlpc| unsafe { tlpc.free(user) }));
    }

    /// True iff marking is in progress; the calling thread's epoch view is
    /// synchronized as a side effect.
    pub fn checkpoint() -> bool {
        with_runtime(|rt| rt.checkpoint()).unwrap_or(false)
    }

    /// Push a suspected unit address for marking; validated at drain.
    pub fn try_mark_unit(addr: usize) {
        drop(with_runtime(|rt| rt.try_mark_unit(addr)));
    }

    /// Conservatively scan a readable range, pushing every word as a
    /// suspected reference.
    ///
    /// # Safety
    /// `[begin, end)` must be readable.
    pub unsafe fn try_mark_unit_range(begin: usize, end: usize) {
        // Safety: forwarded contract.
        drop(with_runtime(|rt| unsafe { rt.try_mark_unit_range(begin, end) }));
    }

    /// Insertion write barrier; see [`HeapRuntime::write_barrier`].
    pub fn write_barrier(target: *mut u8, written: *mut u8) {
        drop(with_runtime(|rt| rt.write_barrier(target, written)));
    }

    /// Deletion barrier; see [`HeapRuntime::delete_barrier`].
    pub fn delete_barrier(addr: usize) {
        drop(with_runtime(|rt| rt.delete_barrier(addr)));
    }

    /// Run one collection cycle to completion (blocking).
    pub fn collect(full: bool) {
        drop(with_runtime(|rt| rt.collect(full)));
    }

    pub fn stats() -> HeapStats {
        HeapStats::snapshot()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn test_config() -> HeapConfig {
        HeapConfig {
            chunk_size: 8 * 1024 * 1024,
            ..HeapConfig::default()
        }
    }

    #[test]
    fn test_init_shutdown_sequence() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        // init(); shutdown(); init(); shutdown() must be valid.
        GcHeap::init_with_config(HeapCallbacks::default(), test_config()).unwrap();
        GcHeap::shutdown();
        GcHeap::init_with_config(HeapCallbacks::default(), test_config()).unwrap();
        GcHeap::shutdown();
    }

    #[test]
    fn test_double_init_rejected() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        GcHeap::init_with_config(HeapCallbacks::default(), test_config()).unwrap();
        assert!(GcHeap::init_with_config(HeapCallbacks::default(), test_config()).is_err());
        GcHeap::shutdown();
    }

    #[test]
    fn test_alloc_without_init_returns_null() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        assert!(GcHeap::alloc_normal(64).is_null());
    }

    #[test]
    fn test_global_alloc_free_round_trip() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        GcHeap::init_with_config(HeapCallbacks::default(), test_config()).unwrap();

        let ptr = GcHeap::alloc_normal(100);
        assert!(!ptr.is_null());
        // Safety: 100 bytes just allocated.
        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, 100);
            assert_eq!(*ptr.add(99), 0xAB);
            GcHeap::free(ptr);
        }
        GcHeap::shutdown();
    }

    #[test]
    fn test_runtime_rejects_bad_chunk_size() {
        let config = HeapConfig {
            chunk_size: PAGE_SIZE + 1,
            ..HeapConfig::default()
        };
        assert!(HeapRuntime::new(HeapCallbacks::default(), config).is_err());
    }

    #[test]
    fn test_checkpoint_idle_is_false() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        GcHeap::init_with_config(HeapCallbacks::default(), test_config()).unwrap();
        assert!(!GcHeap::checkpoint());
        GcHeap::shutdown();
    }
}
