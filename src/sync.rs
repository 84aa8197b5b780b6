// Synchronization facade.
//
// The lock-free parts of this crate are model-checked with loom, and loom
// can only see operations performed through its own instrumented types.
// This module is the single switch point: real builds re-export std (plus
// `portable_atomic` for the 128-bit stack heads), `--cfg loom` builds
// re-export loom's twins. Importing `std::sync::atomic` directly anywhere
// else in the crate would hide that access from the model checker, so
// everything goes through here.
#![allow(unused_imports, unused_macros)]

pub(crate) mod atomic {
    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicPtr, AtomicU8, AtomicU16, AtomicU32, AtomicU64,
        AtomicUsize, Ordering, fence,
    };

    #[cfg(not(loom))]
    pub(crate) use portable_atomic::AtomicU128;

    // The stock loom release has no 128-bit atomic; model runs use the
    // patched fork that provides one.
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{
        AtomicBool, AtomicIsize, AtomicPtr, AtomicU8, AtomicU16, AtomicU32, AtomicU64,
        AtomicU128, AtomicUsize, Ordering, fence,
    };
}

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

#[cfg(loom)]
pub(crate) use loom::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

/// Bounded condvar wait for the collector's idle loop. loom's `Condvar`
/// offers no timed wait; the collector thread is never part of a loom
/// model, so an untimed wait keeps that configuration compiling.
#[cfg(not(loom))]
pub(crate) fn condvar_wait_timeout<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: std::time::Duration,
) -> MutexGuard<'a, T> {
    cv.wait_timeout(guard, timeout)
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .0
}

#[cfg(loom)]
pub(crate) fn condvar_wait_timeout<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    _timeout: std::time::Duration,
) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap()
}

pub(crate) mod cell {
    #[cfg(not(loom))]
    pub(crate) use std::cell::{Cell, UnsafeCell};

    #[cfg(loom)]
    pub(crate) use loom::cell::{Cell, UnsafeCell};
}

/// Exclusive access to an `UnsafeCell`, spelled so both cell flavors accept
/// it: std hands out `*mut T` from `get()`, loom insists on `with_mut`.
///
/// # Safety
/// The caller must be the only party touching the cell for the duration of
/// the returned borrow.
macro_rules! unsafe_cell_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: exclusivity is the macro's documented precondition.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: exclusivity is the macro's documented precondition.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_mut;

pub(crate) mod hint {
    #[cfg(not(loom))]
    pub(crate) use std::hint::spin_loop;

    #[cfg(loom)]
    pub(crate) use loom::hint::spin_loop;
}

pub(crate) mod thread {
    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, current, spawn, yield_now};

    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, current, spawn, yield_now};
}

// ---------------------------------------------------------------------------
// OnceLock
//
// loom ships no OnceLock, and the crate only ever uses `get_or_init` (the
// cached OS page size), so the loom stand-in is the minimal version: a std
// mutex over a boxed slot. A loom mutex is deliberately not used here — the
// lock serializes one-shot initialization, which is not an interleaving
// worth exploring, and loom mutexes cannot live in `static` items (their
// constructor is not const). Boxing pins the value so plain references can
// be handed out while the lock stays private.
// ---------------------------------------------------------------------------
#[cfg(not(loom))]
pub(crate) use std::sync::OnceLock;

#[cfg(loom)]
pub(crate) struct OnceLock<T> {
    slot: std::sync::Mutex<Option<Box<T>>>,
}

#[cfg(loom)]
impl<T> OnceLock<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn get_or_init<F: FnOnce() -> T>(&self, init: F) -> &T {
        let mut slot = self.slot.lock().unwrap();
        let boxed = slot.get_or_insert_with(|| Box::new(init()));
        let ptr: *const T = &**boxed;
        // Safety: the box is never replaced or dropped while &self is live,
        // so the pointee outlives the returned borrow.
        unsafe { &*ptr }
    }
}

#[cfg(loom)]
// Safety: all access funnels through the inner mutex.
unsafe impl<T: Send> Sync for OnceLock<T> {}

// ---------------------------------------------------------------------------
// loom-compatible statics
//
// loom types are not const-constructible, and every model run wants fresh
// global state anyway. `loom_static!` declares a static that is a plain
// const-initialized item in real builds and a `loom::lazy_static!` binding
// (re-created per model run) under the checker.
// ---------------------------------------------------------------------------
macro_rules! loom_static {
    ($(#[$meta:meta])* pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        $(#[$meta])*
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            $(#[$meta])*
            pub static ref $NAME: $Ty = $init;
        }
    };
    ($(#[$meta:meta])* static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        $(#[$meta])*
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            $(#[$meta])*
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use loom_static;
