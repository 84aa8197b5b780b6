/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the lock-free leaves under every thread interleaving loom can
/// explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates interleavings, so:
///   - Thread counts kept to 2–3 (state space is exponential).
///   - Loop iterations minimised to 1–3 per thread.
///   - Pages are fabricated from plain heap memory through the VmOps mock;
///     the chunk/runtime layers are not modelled (their concurrency is the
///     stacks, the mark byte and the foreign lists, all covered here).
///   - The tagged stack's spin on odd generations causes state-space
///     explosion; those models use `preemption_bound(2)`.
#[cfg(loom)]
mod tests {
    use crate::heap::page::{
        MARK_RELEASED, MARK_UNMARKED, PageHeader, UnitHeader,
    };
    use crate::heap::size_class::{PAGE_SIZE, SizeClass};
    use crate::heap::tagged_stack::{StackNode, TaggedStack};
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use std::ptr::NonNull;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    // =====================================================================
    // 1. TaggedStack — DWCAS Treiber stack
    // =====================================================================

    struct Node {
        link: AtomicUsize,
    }

    // Safety: test nodes reserve `link` for the stack.
    unsafe impl StackNode for Node {
        fn link(&self) -> &AtomicUsize {
            &self.link
        }
    }

    fn new_node() -> NonNull<Node> {
        NonNull::from(Box::leak(Box::new(Node {
            link: AtomicUsize::new(0),
        })))
    }

    unsafe fn free_node(node: NonNull<Node>) {
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }

    #[test]
    fn loom_tagged_stack_push_pop_single() {
        bounded(2).check(|| {
            let stack: TaggedStack<Node> = TaggedStack::new();
            let node = new_node();

            stack.push(node);
            let popped = stack.pop();
            assert_eq!(popped, Some(node));
            assert!(stack.pop().is_none());

            unsafe { free_node(node) };
        });
    }

    #[test]
    fn loom_tagged_stack_concurrent_push() {
        bounded(2).check(|| {
            let stack: Arc<TaggedStack<Node>> = Arc::new(TaggedStack::new());
            let a = new_node();
            let b = new_node();

            let s1 = stack.clone();
            let t1 = loom::thread::spawn(move || {
                s1.push(a);
            });
            let s2 = stack.clone();
            let t2 = loom::thread::spawn(move || {
                s2.push(b);
            });
            t1.join().unwrap();
            t2.join().unwrap();

            // Both nodes must come back, in some order.
            let first = stack.pop().expect("two nodes were pushed");
            let second = stack.pop().expect("two nodes were pushed");
            assert!(stack.pop().is_none());
            assert!(
                (first == a && second == b) || (first == b && second == a),
                "popped set must equal pushed set"
            );

            unsafe {
                free_node(a);
                free_node(b);
            }
        });
    }

    #[test]
    fn loom_tagged_stack_push_vs_pop() {
        bounded(2).check(|| {
            let stack: Arc<TaggedStack<Node>> = Arc::new(TaggedStack::new());
            let seed = new_node();
            let extra = new_node();
            stack.push(seed);

            let s1 = stack.clone();
            let pusher = loom::thread::spawn(move || {
                s1.push(extra);
            });
            let s2 = stack.clone();
            let popper = loom::thread::spawn(move || s2.pop());

            pusher.join().unwrap();
            let popped = popper.join().unwrap();
            assert!(popped.is_some(), "one node was always available");

            // Exactly one node remains.
            let rest = stack.pop().expect("one node must remain");
            assert!(stack.pop().is_none());
            assert_ne!(Some(rest), popped);

            unsafe {
                free_node(seed);
                free_node(extra);
            }
        });
    }

    // =====================================================================
    // 2. Page foreign-free protocol
    // =====================================================================

    /// Fabricate a page in plain heap memory (the VmOps mock's world).
    ///
    /// loom's tracked atomics are fatter than the hardware ones, so the
    /// production stride math does not apply; the two unit slots sit at
    /// hand-picked offsets far past any header size, chained through the
    /// same 16-bit offset links the real init writes.
    fn fake_page() -> (NonNull<PageHeader>, std::alloc::Layout, u16, u16) {
        const SLOT_A: u16 = 1024;
        const SLOT_B: u16 = 2048;
        let layout = std::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let page = NonNull::new(raw).unwrap().cast::<PageHeader>();
        unsafe {
            use crate::sync::atomic::{AtomicU8, AtomicU16, AtomicUsize};
            page.as_ptr().write(PageHeader {
                next_page: AtomicUsize::new(0),
                foreign_free_head: AtomicU16::new(0),
                next_bump_offset: SLOT_A,
                page_index: 0,
                size_class_tag: SizeClass::Unit(20).to_tag(),
                abandoned: AtomicU8::new(0),
            });
            raw.add(SLOT_A as usize)
                .cast::<UnitHeader>()
                .write(UnitHeader::new_free(page.as_ptr(), SLOT_B));
            raw.add(SLOT_B as usize)
                .cast::<UnitHeader>()
                .write(UnitHeader::new_free(page.as_ptr(), 0));
        }
        (page, layout, SLOT_A, SLOT_B)
    }

    #[test]
    fn loom_foreign_free_two_threads_then_reclaim() {
        bounded(2).check(|| {
            let (page, layout, _, _) = fake_page();

            // Owner takes both units and publishes them.
            let u1 = unsafe { PageHeader::try_bump(page) }.unwrap();
            let u2 = unsafe { PageHeader::try_bump(page) }.unwrap();
            assert!(unsafe { PageHeader::try_bump(page) }.is_none());
            unsafe {
                UnitHeader::publish_allocated(u1, 1, 0);
                UnitHeader::publish_allocated(u2, 1, 0);
            }

            let page_addr = page.as_ptr() as usize;
            let a1 = u1.as_ptr() as usize;
            let a2 = u2.as_ptr() as usize;

            let t1 = loom::thread::spawn(move || {
                let page = NonNull::new(page_addr as *mut PageHeader).unwrap();
                let unit = NonNull::new(a1 as *mut UnitHeader).unwrap();
                assert!(unsafe { PageHeader::foreign_free(page, unit) });
            });
            let t2 = loom::thread::spawn(move || {
                let page = NonNull::new(page_addr as *mut PageHeader).unwrap();
                let unit = NonNull::new(a2 as *mut UnitHeader).unwrap();
                assert!(unsafe { PageHeader::foreign_free(page, unit) });
            });
            t1.join().unwrap();
            t2.join().unwrap();

            // Owner reclaims: both units come back through the bump chain,
            // RELEASED, with no loss and no duplication.
            assert!(unsafe { PageHeader::try_reclaim_foreign(page) });
            let mut got = vec![];
            while let Some(u) = unsafe { PageHeader::try_bump(page) } {
                assert_eq!(
                    unsafe { u.as_ref() }.mark.load(Ordering::Relaxed),
                    MARK_RELEASED
                );
                got.push(u.as_ptr() as usize);
            }
            assert_eq!(got.len(), 2);
            assert!(got.contains(&a1));
            assert!(got.contains(&a2));

            unsafe { std::alloc::dealloc(page.as_ptr().cast::<u8>(), layout) };
        });
    }

    // =====================================================================
    // 3. Publish/observe ordering on the unit mark byte
    // =====================================================================

    #[test]
    fn loom_publish_allocated_is_release() {
        bounded(2).check(|| {
            let unit = NonNull::from(Box::leak(Box::new(UnitHeader::new_free(
                std::ptr::null_mut(),
                0,
            ))));
            let addr = unit.as_ptr() as usize;

            let writer = loom::thread::spawn(move || {
                let unit = NonNull::new(addr as *mut UnitHeader).unwrap();
                unsafe { UnitHeader::publish_allocated(unit, 9, 3) };
            });
            let reader = loom::thread::spawn(move || {
                let unit = NonNull::new(addr as *mut UnitHeader).unwrap();
                let u = unsafe { unit.as_ref() };
                // The sweeper's view: acquire the mark, then trust the
                // stamp fields.
                if u.mark.load(Ordering::Acquire) == MARK_UNMARKED {
                    assert_eq!(u.alloc_epoch.load(Ordering::Relaxed), 9);
                    assert_eq!(u.gc_type.load(Ordering::Relaxed), 3);
                }
            });
            writer.join().unwrap();
            reader.join().unwrap();

            unsafe { drop(Box::from_raw(unit.as_ptr())) };
        });
    }

    // =====================================================================
    // 4. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::heap::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }
}
