#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use kheap::{ALIGN, BlockInfo, Gate, HEADER_SIZE, HEAP_FOOTPRINT, Heap, MIN_HEAP_SIZE, Toggle};

#[repr(C, align(8))]
struct Arena<const N: usize>([u8; N]);

impl<const N: usize> Arena<N> {
    fn new() -> Self {
        Self([0xcc; N])
    }

    fn place<'a>(&'a mut self, gate: Option<&'a Gate<'a>>) -> &'a Heap<'a> {
        unsafe { Heap::place(self.0.as_mut_ptr(), N, gate) }.unwrap()
    }

    /// Places a heap and also returns the arena base for reading the block
    /// region behind the heap's back.
    fn place_with_base(&mut self) -> (&Heap<'_>, *const u8) {
        let base = self.0.as_mut_ptr();
        let heap = unsafe { Heap::place(base, N, None) }.unwrap();
        (heap, base.cast_const())
    }
}

fn blocks(heap: &Heap<'_>) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    heap.for_each_block(|block| blocks.push(block));
    blocks
}

/// Copies every byte of the block region: headers, links and payloads.
fn chain_bytes<const N: usize>(base: *const u8) -> Vec<u8> {
    let region = unsafe { base.add(HEAP_FOOTPRINT) };
    unsafe { std::slice::from_raw_parts(region, N - HEAP_FOOTPRINT) }.to_vec()
}

fn assert_single_free_block(heap: &Heap<'_>) {
    assert_eq!(
        blocks(heap),
        [BlockInfo {
            offset: HEAP_FOOTPRINT,
            size: heap.capacity() - HEADER_SIZE,
            used: false,
        }]
    );
    heap.verify().unwrap();
}

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.addr().get()
}

#[test]
fn first_fit_reuses_freed_block() {
    let mut arena = Arena::<256>::new();
    let heap = arena.place(None);
    assert!(heap.is_constructed());

    let a = heap.allocate(32).unwrap();
    assert_eq!(addr(a) % ALIGN, 0);
    let b = heap.allocate(64).unwrap();
    assert_ne!(a, b);
    assert!(addr(b) - addr(a) >= 32 + HEADER_SIZE);

    heap.free(a.as_ptr()).unwrap();
    let c = heap.allocate(16).unwrap();
    assert_eq!(c, a);
    heap.verify().unwrap();
}

#[test]
fn freed_neighbors_coalesce() {
    let mut arena = Arena::<1024>::new();
    let heap = arena.place(None);

    let a = heap.allocate(48).unwrap();
    let b = heap.allocate(48).unwrap();
    let c = heap.allocate(48).unwrap();

    heap.free(b.as_ptr()).unwrap();
    heap.free(a.as_ptr()).unwrap();
    let layout = blocks(heap);
    assert_eq!(layout[0].size, 2 * 48 + HEADER_SIZE);
    assert!(!layout[0].used);
    assert_eq!(
        layout[1],
        BlockInfo {
            // `a` is the payload of the first block
            offset: HEAP_FOOTPRINT + (addr(c) - addr(a)),
            size: 48,
            used: true,
        }
    );
    heap.verify().unwrap();

    heap.free(c.as_ptr()).unwrap();
    assert_single_free_block(heap);
}

#[test]
fn too_small_heap_is_unconstructed() {
    let mut arena = Arena::<{ MIN_HEAP_SIZE - ALIGN }>::new();
    let heap = arena.place(None);
    assert!(!heap.is_constructed());
    assert!(heap.status().is_err());
    for size in [0, 1, 8, 16, 64] {
        assert_eq!(heap.allocate(size), None);
    }
}

#[test]
fn single_round_trip_restores_heap() {
    let mut arena = Arena::<2048>::new();
    let heap = arena.place(None);
    let largest = heap.capacity() - HEADER_SIZE;

    for size in [1, 7, 8, 9, 24, 100, 512, largest - 8, largest] {
        let ptr = heap.allocate(size).unwrap();
        assert_eq!(addr(ptr) % ALIGN, 0);
        unsafe { ptr.write_bytes(0x5a, size) };
        heap.free(ptr.as_ptr()).unwrap();
        assert_single_free_block(heap);
    }
    assert_eq!(heap.allocate(largest + 1), None);
}

#[test]
fn any_free_order_restores_heap() {
    const COUNT: usize = 12;
    let orders: [fn(usize) -> usize; 4] = [
        |i| i,
        |i| COUNT - 1 - i,
        |i| if i < COUNT / 2 { i * 2 + 1 } else { (i - COUNT / 2) * 2 },
        |i| (i * 5 + 3) % COUNT,
    ];

    for order in orders {
        let mut arena = Arena::<4096>::new();
        let heap = arena.place(None);

        let ptrs: Vec<_> = (0..COUNT)
            .map(|i| {
                let ptr = heap.allocate(8 + i * 24).unwrap();
                assert_eq!(addr(ptr) % ALIGN, 0);
                ptr
            })
            .collect();
        for i in 0..COUNT {
            heap.free(ptrs[order(i)].as_ptr()).unwrap();
            heap.verify().unwrap();
        }
        assert_single_free_block(heap);
    }
}

#[test]
fn failed_allocation_leaves_chain_unchanged() {
    let mut arena = Arena::<1024>::new();
    let (heap, base) = arena.place_with_base();
    let a = heap.allocate(200).unwrap();
    let _b = heap.allocate(200).unwrap();
    heap.free(a.as_ptr()).unwrap();

    let before = chain_bytes::<1024>(base);
    let largest = heap.stats().largest_free;
    assert_eq!(heap.allocate(largest + 1), None);
    assert_eq!(heap.allocate(usize::MAX), None);
    assert_eq!(heap.allocate(0), None);
    assert_eq!(chain_bytes::<1024>(base), before);
    heap.verify().unwrap();
}

#[test]
fn payloads_do_not_overlap() {
    let mut arena = Arena::<4096>::new();
    let heap = arena.place(None);

    let mut live = Vec::new();
    for i in 0..20_u8 {
        let size = 16 + usize::from(i) * 8;
        let Some(ptr) = heap.allocate(size) else {
            break;
        };
        unsafe { ptr.write_bytes(i, size) };
        live.push((ptr, size, i));
    }
    assert!(live.len() > 10);

    // free every third block and refill the holes
    for (ptr, _, _) in live.iter().step_by(3) {
        heap.free(ptr.as_ptr()).unwrap();
    }
    let refill: Vec<_> = (0..5).filter_map(|_| heap.allocate(16)).collect();
    for ptr in &refill {
        unsafe { ptr.write_bytes(0xee, 16) };
    }

    for (index, &(ptr, size, fill)) in live.iter().enumerate() {
        if index % 3 == 0 {
            continue;
        }
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == fill));
    }
    heap.verify().unwrap();
}

#[test]
fn double_free_is_refused() {
    let mut arena = Arena::<512>::new();
    let (heap, base) = arena.place_with_base();
    let a = heap.allocate(32).unwrap();
    let b = heap.allocate(32).unwrap();
    heap.free(b.as_ptr()).unwrap();
    let before = chain_bytes::<512>(base);
    assert!(heap.free(b.as_ptr()).is_err());
    assert_eq!(chain_bytes::<512>(base), before);
    heap.free(a.as_ptr()).unwrap();
    assert_single_free_block(heap);
}

/// Stand-in for the global interrupt mask of one core.
struct InterruptMask {
    enabled: AtomicBool,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
}

impl InterruptMask {
    const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            depth: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
        }
    }
}

impl Toggle for InterruptMask {
    fn disable(&self) -> bool {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        self.enabled.swap(false, Ordering::Relaxed)
    }

    fn enable(&self, status: bool) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        if status {
            self.enabled.store(true, Ordering::Relaxed);
        }
    }
}

static MASK: InterruptMask = InterruptMask::new();
static GATE: Gate<'static> = Gate::new();

#[test]
fn staged_boot_binds_gate_later() {
    let arena = Box::leak(Box::new(Arena::<1024>::new()));
    let heap = arena.place(Some(&GATE));

    // early boot: no interrupt controller yet
    let early = heap.allocate(64).unwrap();
    assert_eq!(MASK.max_depth.load(Ordering::Relaxed), 0);

    GATE.bind(&MASK);
    let late = heap.allocate(64).unwrap();
    heap.free(early.as_ptr()).unwrap();
    heap.free(late.as_ptr()).unwrap();

    assert_eq!(MASK.max_depth.load(Ordering::Relaxed), 1);
    assert_eq!(MASK.depth.load(Ordering::Relaxed), 0);
    assert!(MASK.enabled.load(Ordering::Relaxed));
    assert_single_free_block(heap);
}
