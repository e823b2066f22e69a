//! The per-thread collection cycle: conservative root discovery over
//! the native stack, iterative tracing through payload words, sweeping,
//! and the allocation-volume trigger policy.

use crate::header::{CellHeader, FinalizeErased};
use crate::heap::{cell_footprint, Heap, CELL_ALIGNMENT};
use crate::stack::{
    approximate_stack_pointer, capture_registers, StackBounds, CAPTURED_REGISTERS,
};
use crate::util::{align_usize, ByteSize};
use std::mem::{align_of, size_of, size_of_val};
use std::time::Instant;

/// Bytes of new cells a thread may accumulate before an allocation
/// forces a collection cycle.
pub const DEFAULT_THRESHOLD: usize = 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum GcReason {
    RequestedByUser,
    ThresholdExceeded,
}

/// Point-in-time counters for one thread's collector.
#[derive(Clone, Copy, Debug)]
pub struct HeapStatistics {
    pub live_bytes: usize,
    pub live_objects: usize,
    pub bytes_since_collection: usize,
    pub heap_threshold: usize,
    pub total_gc_cycles_count: usize,
    pub total_objects_allocated: usize,
    pub total_objects_destroyed: usize,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Live: {} in {} cells",
            ByteSize(self.live_bytes),
            self.live_objects
        )?;
        writeln!(
            f,
            "  Allocated since last cycle: {}",
            ByteSize(self.bytes_since_collection)
        )?;
        writeln!(f, "  Heap threshold: {}", ByteSize(self.heap_threshold))?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total objects allocated: {}",
            self.total_objects_allocated
        )?;
        writeln!(
            f,
            "  Total objects destroyed: {}",
            self.total_objects_destroyed
        )?;
        Ok(())
    }
}

pub(crate) struct Collector {
    heap: Heap,
    /// Outermost scan boundary, recorded when the owning thread's
    /// manager was constructed.
    stack_origin: *mut u8,
    threshold: usize,
    /// While non zero, neither manual nor automatic cycles run.
    defers: usize,
    /// Guards against a finalizer re-entering collection mid-sweep.
    collecting: bool,
    mark_stack: Vec<*mut CellHeader>,
    total_gcs: usize,
    total_objects_allocated: usize,
    total_objects_destroyed: usize,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            stack_origin: StackBounds::current_thread_stack_bounds().origin,
            threshold: DEFAULT_THRESHOLD,
            defers: 0,
            collecting: false,
            mark_stack: Vec::new(),
            total_gcs: 0,
            total_objects_allocated: 0,
            total_objects_destroyed: 0,
        }
    }

    /// Moves `value` into a fresh managed cell and returns the payload
    /// pointer. Runs a full cycle first if the trigger policy says one
    /// is due.
    pub fn allocate<T: 'static>(&mut self, value: T) -> *mut T {
        assert!(
            align_of::<T>() <= CELL_ALIGNMENT,
            "managed allocations are limited to {} byte alignment",
            CELL_ALIGNMENT
        );
        // Round the payload up to word size so tracing sees every slot;
        // sub-word tails would be skipped by the scan.
        let size = align_usize(size_of::<T>(), size_of::<usize>());
        if self.should_collect(cell_footprint(size)) {
            self.collect_internal(GcReason::ThresholdExceeded);
        }
        let cell = self.heap.allocate(size, <T as FinalizeErased>::CALLBACK);
        self.total_objects_allocated += 1;
        unsafe {
            let payload = (*cell).payload().cast::<T>();
            payload.write(value);
            payload
        }
    }

    #[inline(always)]
    fn should_collect(&self, upcoming: usize) -> bool {
        self.defers == 0
            && !self.collecting
            && self.heap.bytes_since_collection() + upcoming >= self.threshold
    }

    /// Forces a full cycle, unless one is already running on this
    /// thread or collection is deferred.
    pub fn collect(&mut self) {
        if self.defers > 0 || self.collecting {
            return;
        }
        self.collect_internal(GcReason::RequestedByUser);
    }

    #[inline(never)]
    fn collect_internal(&mut self, reason: GcReason) {
        self.collecting = true;
        let time = Instant::now();
        let prev = self.heap.live_bytes();

        self.heap.prepare_for_conservative_scan();

        // Capture the callee-saved registers before reading the stack
        // pointer; the capture buffer is scanned as its own root range.
        let mut registers = [0usize; CAPTURED_REGISTERS];
        capture_registers(&mut registers);
        let sp = approximate_stack_pointer();

        let mut cons_roots: Vec<(usize, usize)> = Vec::with_capacity(2);
        cons_roots.push((
            registers.as_ptr() as usize,
            registers.as_ptr() as usize + size_of_val(&registers),
        ));
        let mut from = sp as usize;
        let mut to = self.stack_origin as usize;
        if from > to {
            std::mem::swap(&mut from, &mut to);
        }
        cons_roots.push((from, to));

        let mut mark_stack = std::mem::take(&mut self.mark_stack);
        while let Some((from, to)) = cons_roots.pop() {
            self.scan_range(from, to, &mut mark_stack);
        }
        self.process_mark_stack(&mut mark_stack);
        self.mark_stack = mark_stack;

        let swept = self.heap.sweep();
        #[cfg(debug_assertions)]
        self.heap
            .for_each(|cell| unsafe { debug_assert!(!(*cell).is_marked()) });
        self.total_objects_destroyed += swept.destroyed;
        self.heap.reset_counter();
        self.total_gcs += 1;
        self.collecting = false;

        debug!(
            "GC({}) Pause {:?} {}->{} freed {} cells {:.4}ms",
            self.total_gcs,
            reason,
            ByteSize(prev),
            ByteSize(self.heap.live_bytes()),
            swept.destroyed,
            time.elapsed().as_micros() as f64 / 1000.0
        );
    }

    /// Reads every aligned word in `[from, to)` and treats each as a
    /// candidate pointer. Words that resolve to an unmarked cell mark
    /// it and queue it for tracing; everything else is ignored, so
    /// overlap with the collector's own frames is harmless.
    fn scan_range(&mut self, from: usize, to: usize, mark_stack: &mut Vec<*mut CellHeader>) {
        let mut scan = align_usize(from, size_of::<usize>());
        while scan + size_of::<usize>() <= to {
            let word = unsafe { (scan as *const usize).read() };
            if let Some(cell) = self.heap.find_cell(word) {
                unsafe {
                    if (*cell).test_and_set_marked() {
                        mark_stack.push(cell);
                    }
                }
            }
            scan += size_of::<usize>();
        }
    }

    /// Drains the worklist, treating each marked cell's payload as a
    /// sequence of aligned words. The mark bit keeps cycles and
    /// self-references from being visited twice.
    fn process_mark_stack(&mut self, mark_stack: &mut Vec<*mut CellHeader>) {
        while let Some(cell) = mark_stack.pop() {
            let (payload, size) = unsafe { ((*cell).payload() as usize, (*cell).size()) };
            self.scan_range(payload, payload + size, mark_stack);
        }
    }

    /// Destroys everything this thread still owns; runs on thread exit.
    ///
    /// The reentrancy guard is held across the terminal finalizers for
    /// parity with `collect_internal`, but unlike an ordinary sweep a
    /// finalizer cannot allocate here: the thread-local slot is already
    /// tearing down, so any crate call from a finalizer panics.
    pub fn drain(&mut self) {
        self.collecting = true;
        let swept = self.heap.drain();
        self.collecting = false;
        self.total_objects_destroyed += swept.destroyed;
        if swept.destroyed > 0 {
            debug!(
                "GC thread detach: reclaimed {} in {} cells",
                ByteSize(swept.bytes_freed),
                swept.destroyed
            );
        }
    }

    pub fn defer(&mut self) {
        self.defers += 1;
    }

    pub fn undefer(&mut self) {
        self.defers = self
            .defers
            .checked_sub(1)
            .expect("trying to undefer a collector that is not deferred");
    }

    pub fn set_threshold(&mut self, bytes: usize) {
        self.threshold = bytes;
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics {
            live_bytes: self.heap.live_bytes(),
            live_objects: self.heap.len(),
            bytes_since_collection: self.heap.bytes_since_collection(),
            heap_threshold: self.threshold,
            total_gc_cycles_count: self.total_gcs,
            total_objects_allocated: self.total_objects_allocated,
            total_objects_destroyed: self.total_objects_destroyed,
        }
    }
}
