//! ABA-safe intrusive Treiber stacks.
//!
//! Free pages, free large spans and pooled gray-list nodes all circulate
//! through lock-free stacks whose nodes are popped, reused and pushed back
//! at the same address — the classic ABA recipe. Each stack head is a
//! 128-bit (pointer, generation) pair updated with double-width
//! compare-and-swap, so a recycled address can never impersonate the node
//! that used to sit on top.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU128, AtomicUsize, Ordering};
use crate::sync::hint;

/// Decoded head word of a stack.
///
/// The top node's address lives in the upper 64 bits, its generation in
/// the lower 64. Every successful head update moves the generation
/// forward, which is what defeats ABA. An odd generation additionally
/// flags an in-flight pop that has pinned the current top node; pushers
/// and other poppers hold off until it settles back to even.
///
/// x86_64 and ARMv8.1+ execute the 128-bit CAS natively (`cmpxchg16b`,
/// `casp`); older ARM cores get an LL/SC pair from the compiler.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Head(u128);

impl Head {
    const EMPTY: Self = Self(0);

    #[inline]
    fn pack(node: *mut u8, generation: u64) -> Self {
        Self(((node as usize as u128) << 64) | u128::from(generation))
    }

    #[inline]
    fn node(self) -> *mut u8 {
        ((self.0 >> 64) as usize) as *mut u8
    }

    #[inline]
    fn generation(self) -> u64 {
        self.0 as u64
    }

    #[inline]
    fn is_empty(self) -> bool {
        self.node().is_null()
    }

    /// An in-flight pop holds the head at an odd generation.
    #[inline]
    fn is_reserved(self) -> bool {
        self.generation() & 1 == 1
    }

    /// The same node, flagged reserved (even → odd).
    #[inline]
    fn reserved(self) -> Self {
        Self::pack(self.node(), self.generation().wrapping_add(1))
    }

    /// A settled head holding `node`: the generation moves to the next
    /// even value whether this update comes from a plain push or commits
    /// a reservation.
    #[inline]
    fn settled(self, node: *mut u8) -> Self {
        Self::pack(node, self.generation().wrapping_add(2))
    }
}

/// A type that can be linked into a [`TaggedStack`].
///
/// # Safety
/// The link slot must be reserved for the owning stack for as long as the
/// node is linked: no other writer may touch it between `push` and the
/// matching `pop`.
pub(crate) unsafe trait StackNode {
    fn link(&self) -> &AtomicUsize;
}

/// Restores the stack head if a pop unwinds between reserving the top node
/// and committing its replacement. Armed at reservation, disarmed at
/// commit; the restore value re-publishes the observed node under a fresh
/// even generation.
struct PopGuard<'a> {
    head: &'a AtomicU128,
    restore: Head,
    armed: bool,
}

impl Drop for PopGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            // We still own the reservation, so a plain store is enough to
            // hand the head back.
            self.head.store(self.restore.0, Ordering::Release);
        }
    }
}

/// Lock-free intrusive stack of `T` nodes.
///
/// Push: write the node's link → DWCAS the head (even → even, gen+2).
/// Pop: DWCAS the head even → odd (reservation pins the node so its link
/// can be read safely), read the link, DWCAS odd → even committing the new
/// head.
pub(crate) struct TaggedStack<T> {
    head: AtomicU128,
    _marker: PhantomData<*mut T>,
}

// Safety: the stack only stores raw node addresses and synchronizes through
// the DWCAS head; node ownership transfers with the push/pop.
unsafe impl<T> Send for TaggedStack<T> {}
// Safety: all head mutation is CAS-based.
unsafe impl<T> Sync for TaggedStack<T> {}

impl<T: StackNode> TaggedStack<T> {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            head: AtomicU128::new(Head::EMPTY.0),
            _marker: PhantomData,
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            head: AtomicU128::new(Head::EMPTY.0),
            _marker: PhantomData,
        }
    }

    pub fn push(&self, node: NonNull<T>) {
        loop {
            let observed = Head(self.head.load(Ordering::Acquire));
            if observed.is_reserved() {
                // A pop is mid-flight on the current top node; wait for the
                // head to settle before linking against it.
                hint::spin_loop();
                continue;
            }

            // Safety: the caller hands over ownership of `node`; its link
            // slot is ours until the node is popped.
            unsafe { node.as_ref() }
                .link()
                .store(observed.node() as usize, Ordering::Relaxed);

            let installed = observed.settled(node.as_ptr().cast::<u8>());
            if self
                .head
                .compare_exchange_weak(observed.0, installed.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn pop(&self) -> Option<NonNull<T>> {
        loop {
            let observed = Head(self.head.load(Ordering::Acquire));
            if observed.is_empty() {
                return None;
            }
            if observed.is_reserved() {
                hint::spin_loop();
                continue;
            }

            // Reserve the top node before touching it. While the head is
            // odd, no push or pop can move it, so the node cannot be handed
            // to a new owner under our feet.
            if self
                .head
                .compare_exchange_weak(
                    observed.0,
                    observed.reserved().0,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }

            let mut guard = PopGuard {
                head: &self.head,
                restore: observed.settled(observed.node()),
                armed: true,
            };

            // Safety: the reservation pins observed.node(), which was
            // pushed as a valid `T`.
            let next = unsafe { &*observed.node().cast::<T>() }
                .link()
                .load(Ordering::Relaxed);

            // Commit: replace the reservation with the next node.
            let committed = self.head.compare_exchange(
                observed.reserved().0,
                observed.settled(next as *mut u8).0,
                Ordering::Release,
                Ordering::Relaxed,
            );
            debug_assert!(
                committed.is_ok(),
                "reserved stack head moved underneath a pop"
            );
            guard.armed = false;

            // Safety: a reserved head is never empty.
            return Some(unsafe { NonNull::new_unchecked(observed.node().cast::<T>()) });
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    struct Node {
        link: AtomicUsize,
        value: u32,
    }

    // Safety: test nodes reserve `link` for the stack.
    unsafe impl StackNode for Node {
        fn link(&self) -> &AtomicUsize {
            &self.link
        }
    }

    fn boxed(value: u32) -> NonNull<Node> {
        NonNull::from(Box::leak(Box::new(Node {
            link: AtomicUsize::new(0),
            value,
        })))
    }

    // Safety: node came from `boxed` and is no longer linked.
    unsafe fn unbox(node: NonNull<Node>) -> u32 {
        unsafe { Box::from_raw(node.as_ptr()).value }
    }

    #[test]
    fn test_push_pop_lifo() {
        let stack: TaggedStack<Node> = TaggedStack::new();
        assert!(stack.pop().is_none());

        stack.push(boxed(1));
        stack.push(boxed(2));
        stack.push(boxed(3));

        // Safety: nodes just popped.
        unsafe {
            assert_eq!(unbox(stack.pop().unwrap()), 3);
            assert_eq!(unbox(stack.pop().unwrap()), 2);
            assert_eq!(unbox(stack.pop().unwrap()), 1);
        }
        assert!(stack.pop().is_none());
    }

    #[test]
    fn test_reuse_same_address() {
        // Push/pop the same node repeatedly; the generation must keep the
        // head consistent even though the address repeats.
        let stack: TaggedStack<Node> = TaggedStack::new();
        let node = boxed(7);
        for _ in 0..100 {
            stack.push(node);
            assert_eq!(stack.pop().unwrap(), node);
        }
        // Safety: node is unlinked.
        unsafe {
            assert_eq!(unbox(node), 7);
        }
    }

    #[test]
    fn test_concurrent_push_pop() {
        let stack: Arc<TaggedStack<Node>> = Arc::new(TaggedStack::new());
        let threads: u32 = 4;
        let per_thread = 500u32;

        let mut handles = vec![];
        for t in 0..threads {
            let s = stack.clone();
            handles.push(thread::spawn(move || {
                let mut popped = 0usize;
                for i in 0..per_thread {
                    s.push(boxed(t * 10_000 + i));
                    if i % 2 == 0
                        && let Some(node) = s.pop()
                    {
                        // Safety: node just popped.
                        unsafe { unbox(node) };
                        popped += 1;
                    }
                }
                popped
            }));
        }

        let mut total_popped = 0usize;
        for h in handles {
            total_popped += h.join().unwrap();
        }

        let mut rest = 0usize;
        while let Some(node) = stack.pop() {
            // Safety: node just popped.
            unsafe { unbox(node) };
            rest += 1;
        }
        assert_eq!(total_popped + rest, threads as usize * per_thread as usize);
    }
}
