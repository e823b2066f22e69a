use crate::header::CellHeader;
use crate::heap::Heap;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = simplelog::SimpleLogger::init(
            log::LevelFilter::Debug,
            simplelog::Config::default(),
        );
    });
}

struct Tracked {
    hits: &'static AtomicUsize,
    value: u64,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

struct Node {
    next: *mut Node,
    hits: &'static AtomicUsize,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

// 512 byte cell footprint: 16 header + 8 counter ref + 488 payload.
struct Chunk {
    hits: &'static AtomicUsize,
    _payload: [u8; 488],
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

const CHUNK_FOOTPRINT: usize = 512;

#[inline(never)]
fn alloc_tracked(count: usize, hits: &'static AtomicUsize) {
    for i in 0..count {
        crate::allocate(Tracked {
            hits,
            value: i as u64,
        });
    }
}

#[inline(never)]
fn alloc_chunks(count: usize, hits: &'static AtomicUsize) {
    for _ in 0..count {
        crate::allocate(Chunk {
            hits,
            _payload: [0u8; 488],
        });
    }
}

// A pair where a.next = b and b.next = a, with both pointers dropped on
// return.
#[inline(never)]
fn alloc_cycle(hits: &'static AtomicUsize) {
    let a = crate::allocate(Node { next: null_mut(), hits });
    let b = crate::allocate(Node { next: a, hits });
    unsafe {
        (*a).next = b;
    }
}

#[test]
fn allocation_returns_usable_pointer() {
    init_logging();
    let p = crate::allocate(41u64);
    unsafe {
        assert_eq!(*p, 41);
        *p += 1;
        assert_eq!(*p, 42);
    }
}

#[test]
fn retained_object_survives_collection() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    let p = crate::allocate(Tracked {
        hits: &HITS,
        value: 7,
    });
    crate::collect();
    assert_eq!(HITS.load(Ordering::Relaxed), 0);
    unsafe {
        assert_eq!((*p).value, 7);
    }
}

#[test]
fn unreferenced_burst_is_reclaimed() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    alloc_tracked(14, &HITS);
    crate::collect();
    assert!(HITS.load(Ordering::Relaxed) >= 1);
}

#[test]
fn cycles_are_reclaimed() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    for _ in 0..5 {
        alloc_cycle(&HITS);
    }
    crate::collect();
    assert!(HITS.load(Ordering::Relaxed) >= 1);
}

#[test]
fn retained_pair_survives_partial_reclamation() {
    init_logging();
    static KEPT: AtomicUsize = AtomicUsize::new(0);
    static DROPPED: AtomicUsize = AtomicUsize::new(0);
    let a = crate::allocate(Node {
        next: null_mut(),
        hits: &KEPT,
    });
    let b = crate::allocate(Node {
        next: a,
        hits: &KEPT,
    });
    unsafe {
        (*a).next = b;
    }
    for _ in 0..3 {
        alloc_cycle(&DROPPED);
    }
    crate::collect();
    assert_eq!(KEPT.load(Ordering::Relaxed), 0);
    assert!(DROPPED.load(Ordering::Relaxed) >= 1);
    unsafe {
        assert_eq!((*a).next, b);
        assert_eq!((*b).next, a);
    }
}

#[test]
fn small_burst_does_not_auto_collect() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    crate::collect();
    alloc_chunks(500 * 1024 / CHUNK_FOOTPRINT, &HITS);
    assert_eq!(HITS.load(Ordering::Relaxed), 0);
}

#[test]
fn large_burst_auto_collects() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    crate::collect();
    alloc_chunks(1500 * 1024 / CHUNK_FOOTPRINT, &HITS);
    assert!(HITS.load(Ordering::Relaxed) >= 1);
}

#[test]
fn collections_are_isolated_per_thread() {
    init_logging();
    static MAIN_HITS: AtomicUsize = AtomicUsize::new(0);
    static WORKER_A: AtomicUsize = AtomicUsize::new(0);
    static WORKER_B: AtomicUsize = AtomicUsize::new(0);
    crate::collect();
    let retained = crate::allocate(Tracked {
        hits: &MAIN_HITS,
        value: 11,
    });

    let limit = 1500 * 1024 / CHUNK_FOOTPRINT;
    let spawn = |hits: &'static AtomicUsize| {
        std::thread::spawn(move || {
            alloc_chunks(limit, hits);
            // the worker crossed the threshold, so it must already have
            // reclaimed some of its own garbage
            assert!(hits.load(Ordering::Relaxed) >= 1);
        })
    };
    let r1 = spawn(&WORKER_A);
    let r2 = spawn(&WORKER_B);
    r1.join().unwrap();
    r2.join().unwrap();

    // thread exit drained whatever the workers' cycles had not reached
    assert_eq!(WORKER_A.load(Ordering::Relaxed), limit);
    assert_eq!(WORKER_B.load(Ordering::Relaxed), limit);
    assert_eq!(MAIN_HITS.load(Ordering::Relaxed), 0);
    unsafe {
        assert_eq!((*retained).value, 11);
    }
}

#[test]
fn interior_pointer_retains_object() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    struct Wide {
        hits: &'static AtomicUsize,
        cells: [u64; 4],
    }
    impl Drop for Wide {
        fn drop(&mut self) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }
    let p = crate::allocate(Wide {
        hits: &HITS,
        cells: [1, 2, 3, 4],
    });
    let interior = unsafe { std::ptr::addr_of_mut!((*p).cells[2]) };
    crate::collect();
    assert_eq!(HITS.load(Ordering::Relaxed), 0);
    unsafe {
        assert_eq!(*interior, 3);
    }
}

#[test]
fn finalizer_runs_exactly_once() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    std::thread::spawn(|| {
        alloc_tracked(8, &HITS);
        crate::collect();
        crate::collect();
    })
    .join()
    .unwrap();
    assert_eq!(HITS.load(Ordering::Relaxed), 8);
}

#[test]
fn thread_exit_reclaims_remaining_objects() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    std::thread::spawn(|| {
        alloc_tracked(5, &HITS);
    })
    .join()
    .unwrap();
    assert_eq!(HITS.load(Ordering::Relaxed), 5);
}

#[test]
fn retained_object_survives_repeated_cycles() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    let p = crate::allocate(Tracked {
        hits: &HITS,
        value: 3,
    });
    crate::collect();
    crate::collect();
    crate::collect();
    assert_eq!(HITS.load(Ordering::Relaxed), 0);
    unsafe {
        assert_eq!((*p).value, 3);
    }
}

#[test]
fn lowered_threshold_triggers_collection() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    crate::collect();
    crate::set_threshold(8 * 1024);
    alloc_tracked(1024, &HITS);
    crate::set_threshold(crate::DEFAULT_THRESHOLD);
    assert!(HITS.load(Ordering::Relaxed) >= 1);
}

#[test]
fn defer_guard_suppresses_collection() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    crate::collect();
    {
        let _guard = crate::defer();
        alloc_tracked(14, &HITS);
        crate::collect();
        assert_eq!(HITS.load(Ordering::Relaxed), 0);
    }
    crate::collect();
    assert!(HITS.load(Ordering::Relaxed) >= 1);
}

#[test]
fn allocation_inside_finalizer_does_not_recurse() {
    init_logging();
    static HITS: AtomicUsize = AtomicUsize::new(0);
    struct Spawner {
        hits: &'static AtomicUsize,
    }
    impl Drop for Spawner {
        fn drop(&mut self) {
            let p = crate::allocate(0x5150u64);
            unsafe {
                assert_eq!(*p, 0x5150);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }
    #[inline(never)]
    fn alloc_spawners(hits: &'static AtomicUsize) {
        for _ in 0..4 {
            crate::allocate(Spawner { hits });
        }
    }
    alloc_spawners(&HITS);
    crate::collect();
    assert!(HITS.load(Ordering::Relaxed) >= 1);
}

#[test]
fn statistics_track_allocation() {
    init_logging();
    crate::collect();
    let before = crate::statistics();
    let _p = crate::allocate(9u64);
    let after = crate::statistics();
    assert_eq!(
        after.total_objects_allocated,
        before.total_objects_allocated + 1
    );
    assert!(after.live_objects >= 1);
    assert!(after.bytes_since_collection > before.bytes_since_collection);
}

#[test]
fn trigger_accounting_resets_after_collection() {
    init_logging();
    let _p = crate::allocate(1u64);
    assert!(crate::statistics().bytes_since_collection > 0);
    crate::collect();
    assert_eq!(crate::statistics().bytes_since_collection, 0);
}

#[test]
fn worker_thread_registers_in_registry() {
    init_logging();
    std::thread::spawn(|| {
        crate::allocate(7u64);
        assert!(crate::attached_threads() >= 1);
    })
    .join()
    .unwrap();
}

#[test]
fn heap_resolves_interior_pointers() {
    let mut heap = Heap::new();
    let a = heap.allocate(32, None);
    let b = heap.allocate(64, None);
    heap.prepare_for_conservative_scan();
    unsafe {
        let pa = (*a).payload() as usize;
        let pb = (*b).payload() as usize;
        assert_eq!(heap.find_cell(pa), Some(a));
        assert_eq!(heap.find_cell(pa + 8), Some(a));
        assert_eq!(heap.find_cell(pa + 31), Some(a));
        assert_eq!(heap.find_cell(pb + 63), Some(b));

        // one past the end of the topmost cell must miss
        let (hi, hi_size) = if pa > pb { (pa, 32) } else { (pb, 64) };
        assert_eq!(heap.find_cell(hi + hi_size), None);
        // the header of the lowest cell is not part of any payload
        let lo = pa.min(pb);
        assert_eq!(heap.find_cell(lo - 1), None);
        assert_eq!(heap.find_cell(0x10), None);
    }
}

#[test]
fn heap_sweep_destroys_unmarked_and_clears_survivors() {
    let mut heap = Heap::new();
    let a = heap.allocate(32, None);
    let _b = heap.allocate(32, None);
    unsafe {
        assert!((*a).test_and_set_marked());
    }
    let swept = heap.sweep();
    assert_eq!(swept.destroyed, 1);
    assert_eq!(swept.bytes_freed, 48);
    assert_eq!(heap.len(), 1);
    let mut survivors = 0;
    heap.for_each(|cell| {
        assert_eq!(cell, a);
        survivors += 1;
    });
    assert_eq!(survivors, 1);
    unsafe {
        assert!(!(*a).is_marked());
    }
}

#[test]
fn header_word_roundtrip() {
    let mut header = CellHeader::new(40, None);
    assert_eq!(header.size(), 40);
    assert!(!header.is_marked());
    assert!(header.test_and_set_marked());
    assert!(!header.test_and_set_marked());
    header.clear_marked();
    assert!(!header.is_marked());
    assert_eq!(header.size(), 40);
}
