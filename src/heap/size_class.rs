//! Size classes and the request-size resolver.
//!
//! Every unit lives in a 64 KiB page and carries a 16-byte header, so a
//! class capacity `c` is valid only if `c + 16` tiles the 65520-byte page
//! payload exactly. The 21 small/medium capacities below are the divisors
//! of 65520 minus the header, deduplicated to keep internal fragmentation
//! under ~1/3 per step. Larger requests take whole page spans (1..=16
//! pages, one unit per span) and anything beyond that is huge.

/// Heap page size. Must be a multiple of the OS page size (checked at
/// runtime init) and small enough that in-page offsets fit in 16 bits.
pub(crate) const PAGE_SIZE: usize = 64 * 1024;

pub(crate) const PAGE_HEADER_SIZE: usize = 16;
pub(crate) const UNIT_HEADER_SIZE: usize = 16;

/// Bytes available for unit slots in a single page.
pub(crate) const PAGE_STORAGE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Capacities of the small/medium unit classes, ascending.
pub(crate) const UNIT_CAPACITIES: [usize; UNIT_CLASS_COUNT] = [
    8, 24, 40, 56, 88, 128, 192, 264, 344, 488, 704, 920, 1024, 1440, 2168, 3104, 4352, 6536,
    9344, 13088, 21824,
];
pub(crate) const UNIT_CLASS_COUNT: usize = 21;

/// Largest capacity resolvable via the O(1) lookup table.
const SMALL_LUT_MAX: usize = 1024;
/// Number of classes covered by the lookup table (capacities <= 1024).
const SMALL_LUT_CLASSES: u8 = 13;

pub(crate) const MAX_UNIT_CAPACITY: usize = 21824;

/// Page spans hold exactly one unit; capacity is the span minus the page
/// header and the unit header.
pub(crate) const LARGE_SPAN_HEADER: usize = PAGE_HEADER_SIZE + UNIT_HEADER_SIZE;
pub(crate) const MAX_LARGE_PAGES: usize = 16;
pub(crate) const MAX_LARGE_CAPACITY: usize = MAX_LARGE_PAGES * PAGE_SIZE - LARGE_SPAN_HEADER;

const _: () = assert!(PAGE_SIZE <= u16::MAX as usize + 1, "in-page offsets are u16");
const _: () = {
    // Every small/medium stride must tile the page payload exactly.
    let mut i = 0;
    while i < UNIT_CLASS_COUNT {
        assert!(PAGE_STORAGE_SIZE % (UNIT_CAPACITIES[i] + UNIT_HEADER_SIZE) == 0);
        i += 1;
    }
};

/// Resolved allocation category.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SizeClass {
    /// Small/medium unit; payload is an index into [`UNIT_CAPACITIES`].
    Unit(u8),
    /// Span of `1..=16` whole pages holding a single unit.
    LargePages(u8),
    /// System-heap-backed unit, unbounded.
    Huge,
}

/// O(1) size-to-class lookup for sizes 1..=1024. Index by `ceil(size / 8)`.
/// 129 entries; entry 0 is unused (size 0 is invalid).
static SMALL_CLASS_LUT: [u8; 129] = build_small_class_lut();

const fn build_small_class_lut() -> [u8; 129] {
    let mut table = [0u8; 129];
    let mut q: usize = 1;
    let mut cls: u8 = 0;
    while cls < SMALL_LUT_CLASSES {
        let class_quanta = UNIT_CAPACITIES[cls as usize] / 8;
        while q <= class_quanta {
            table[q] = cls;
            q += 1;
        }
        cls += 1;
    }
    table
}

/// Map a requested byte count to its size class. Tie-break: the smallest
/// class whose capacity meets the request.
pub(crate) fn classify(size: usize) -> SizeClass {
    debug_assert!(size > 0, "zero-size requests are rejected before classify");
    if size <= SMALL_LUT_MAX {
        return SizeClass::Unit(SMALL_CLASS_LUT[(size + 7) >> 3]);
    }
    if size <= MAX_UNIT_CAPACITY {
        // Medium classes are too sparse for a table; a short chain suffices.
        let mut idx = SMALL_LUT_CLASSES as usize;
        while idx < UNIT_CLASS_COUNT {
            if size <= UNIT_CAPACITIES[idx] {
                return SizeClass::Unit(idx as u8);
            }
            idx += 1;
        }
        unreachable!("size {size} <= MAX_UNIT_CAPACITY must match a medium class");
    }
    let pages = (size + LARGE_SPAN_HEADER).div_ceil(PAGE_SIZE);
    if pages <= MAX_LARGE_PAGES {
        SizeClass::LargePages(pages as u8)
    } else {
        SizeClass::Huge
    }
}

impl SizeClass {
    /// User-visible capacity of the class.
    pub(crate) fn capacity(self) -> usize {
        match self {
            SizeClass::Unit(idx) => UNIT_CAPACITIES[idx as usize],
            SizeClass::LargePages(k) => k as usize * PAGE_SIZE - LARGE_SPAN_HEADER,
            SizeClass::Huge => usize::MAX,
        }
    }

    /// Distance between consecutive unit slots in a page (header included).
    pub(crate) fn stride(self) -> usize {
        debug_assert!(matches!(self, SizeClass::Unit(_)));
        self.capacity() + UNIT_HEADER_SIZE
    }

    /// Unit slots per page for small/medium classes.
    pub(crate) fn units_per_page(self) -> usize {
        PAGE_STORAGE_SIZE / self.stride()
    }

    /// Pages consumed when this class takes pages from a chunk.
    pub(crate) fn page_count(self) -> usize {
        match self {
            SizeClass::Unit(_) => 1,
            SizeClass::LargePages(k) => k as usize,
            SizeClass::Huge => 0,
        }
    }

    /// Position on the linear small→medium→large ladder, used by the
    /// realloc within-one-step rule. Huge is off the ladder.
    pub(crate) fn ladder_index(self) -> Option<usize> {
        match self {
            SizeClass::Unit(idx) => Some(idx as usize),
            SizeClass::LargePages(k) => Some(UNIT_CLASS_COUNT + k as usize - 1),
            SizeClass::Huge => None,
        }
    }

    /// Tag byte stored in a page header.
    pub(crate) fn to_tag(self) -> u8 {
        match self {
            SizeClass::Unit(idx) => idx,
            SizeClass::LargePages(k) => LARGE_TAG_BASE + k,
            SizeClass::Huge => HUGE_TAG,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> SizeClass {
        if (tag as usize) < UNIT_CLASS_COUNT {
            SizeClass::Unit(tag)
        } else if tag > LARGE_TAG_BASE && tag <= LARGE_TAG_BASE + MAX_LARGE_PAGES as u8 {
            SizeClass::LargePages(tag - LARGE_TAG_BASE)
        } else {
            debug_assert!(tag == HUGE_TAG, "corrupt size-class tag {tag:#x}");
            SizeClass::Huge
        }
    }
}

const LARGE_TAG_BASE: u8 = 0x40;
const HUGE_TAG: u8 = 0xFF;

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_unit_strides_tile_page() {
        // Property 1: capacity + 16 divides 65520 for every unit class.
        for &cap in &UNIT_CAPACITIES {
            assert_eq!(
                PAGE_STORAGE_SIZE % (cap + UNIT_HEADER_SIZE),
                0,
                "capacity {cap} does not tile the page payload"
            );
        }
    }

    #[test]
    fn test_classify_covers_full_range() {
        // Property 1: every request up to the large maximum resolves to a
        // class whose capacity meets it, and the next-smaller class (if
        // any) does not.
        for s in 1..=MAX_LARGE_CAPACITY {
            let class = classify(s);
            let cap = class.capacity();
            assert!(cap >= s, "class for {s} has capacity {cap}");
            match class {
                SizeClass::Unit(idx) => {
                    if idx > 0 {
                        assert!(UNIT_CAPACITIES[idx as usize - 1] < s);
                    }
                    assert_eq!(cap % 8, 0);
                }
                SizeClass::LargePages(k) => {
                    assert!(s > MAX_UNIT_CAPACITY);
                    assert_eq!(cap, k as usize * PAGE_SIZE - LARGE_SPAN_HEADER);
                    if k > 1 {
                        assert!((k as usize - 1) * PAGE_SIZE - LARGE_SPAN_HEADER < s);
                    }
                }
                SizeClass::Huge => panic!("{s} must not be huge"),
            }
        }
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(classify(1), SizeClass::Unit(0));
        assert_eq!(classify(8), SizeClass::Unit(0));
        assert_eq!(classify(9), SizeClass::Unit(1));
        assert_eq!(classify(1024), SizeClass::Unit(12));
        assert_eq!(classify(1025), SizeClass::Unit(13));
        assert_eq!(classify(MAX_UNIT_CAPACITY), SizeClass::Unit(20));
        assert_eq!(classify(MAX_UNIT_CAPACITY + 1), SizeClass::LargePages(1));
        assert_eq!(classify(PAGE_SIZE - LARGE_SPAN_HEADER), SizeClass::LargePages(1));
        assert_eq!(classify(PAGE_SIZE - LARGE_SPAN_HEADER + 1), SizeClass::LargePages(2));
        assert_eq!(classify(MAX_LARGE_CAPACITY), SizeClass::LargePages(16));
        assert_eq!(classify(MAX_LARGE_CAPACITY + 1), SizeClass::Huge);
    }

    #[test]
    fn test_lut_agrees_with_linear_scan() {
        for s in 1..=SMALL_LUT_MAX {
            let expected = UNIT_CAPACITIES
                .iter()
                .position(|&c| c >= s)
                .expect("capacity exists");
            assert_eq!(classify(s), SizeClass::Unit(expected as u8), "size {s}");
        }
    }

    #[test]
    fn test_tag_round_trip() {
        for idx in 0..UNIT_CLASS_COUNT as u8 {
            let c = SizeClass::Unit(idx);
            assert_eq!(SizeClass::from_tag(c.to_tag()), c);
        }
        for k in 1..=MAX_LARGE_PAGES as u8 {
            let c = SizeClass::LargePages(k);
            assert_eq!(SizeClass::from_tag(c.to_tag()), c);
        }
        assert_eq!(SizeClass::from_tag(SizeClass::Huge.to_tag()), SizeClass::Huge);
    }

    #[test]
    fn test_ladder_is_monotonic() {
        let mut prev = None;
        for s in [1, 100, 1024, 4000, 21824, 30000, 500000, MAX_LARGE_CAPACITY] {
            let ladder = classify(s).ladder_index().unwrap();
            if let Some(p) = prev {
                assert!(ladder >= p, "ladder must not decrease with size ({s})");
            }
            prev = Some(ladder);
        }
    }

    #[test]
    fn test_units_per_page_nonzero() {
        for idx in 0..UNIT_CLASS_COUNT as u8 {
            let c = SizeClass::Unit(idx);
            assert!(c.units_per_page() >= 3, "class {idx} holds too few units");
            assert!(
                (c.units_per_page() * c.stride()) <= PAGE_STORAGE_SIZE,
                "class {idx} overflows the page"
            );
        }
    }
}
