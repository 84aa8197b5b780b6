#[cfg(not(target_pointer_width = "64"))]
compile_error!("woogc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// allocator + collector entry points
pub use heap::runtime::{
    GC_UNIT_AUTO_MARK, GC_UNIT_HAS_FINALIZER, GC_UNIT_HAS_MARKER, GC_UNIT_NEED_SWEEP, GcHeap,
    HeapCallbacks, HeapConfig, HeapRuntime, Tlpc,
};

// stats
pub use heap::runtime::HeapStats;

// errors
pub use heap::vm::HeapError;
