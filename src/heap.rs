//! Per-thread cell table. Each managed object gets its own malloc'd
//! region of memory: header first, payload right after. Objects are
//! never moved.

use crate::header::{CellHeader, FinalizationCallback};
use crate::util::ByteSize;
use std::cmp::Ordering;
use std::mem::size_of;

/// Payload alignment guaranteed by the allocator. malloc returns 16 byte
/// aligned regions on 64-bit unix and the header is 16 bytes, so the
/// payload lands on a 16 byte boundary. Types with a stricter alignment
/// are rejected at allocation time.
pub(crate) const CELL_ALIGNMENT: usize = 16;

/// Total footprint of a cell with a `size` byte payload.
#[inline(always)]
pub(crate) fn cell_footprint(size: usize) -> usize {
    size_of::<CellHeader>() + size
}

unsafe fn create_cell(size: usize, finalizer: Option<FinalizationCallback>) -> *mut CellHeader {
    let cell = libc::malloc(cell_footprint(size)).cast::<CellHeader>();
    if cell.is_null() {
        oom_abort(cell_footprint(size));
    }
    cell.write(CellHeader::new(size, finalizer));
    cell
}

unsafe fn destroy_cell(cell: *mut CellHeader) {
    (*cell).finalize();
    libc::free(cell.cast());
}

#[cold]
fn oom_abort(size: usize) -> ! {
    eprintln!(
        "cell allocation of {} failed: out of memory",
        ByteSize(size)
    );
    std::process::abort()
}

pub(crate) struct SweepStats {
    pub destroyed: usize,
    pub bytes_freed: usize,
}

/// The owning container of one thread's live cells.
///
/// The table is kept address sorted only while a collection needs to
/// resolve candidate pointers; allocations in between simply append.
pub(crate) struct Heap {
    cells: Vec<*mut CellHeader>,
    bytes_since_gc: usize,
    live_bytes: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            cells: Vec::new(),
            bytes_since_gc: 0,
            live_bytes: 0,
        }
    }

    /// Creates a cell with an uninitialized `size` byte payload and
    /// records it in the table.
    pub fn allocate(
        &mut self,
        size: usize,
        finalizer: Option<FinalizationCallback>,
    ) -> *mut CellHeader {
        let cell = unsafe { create_cell(size, finalizer) };
        self.cells.push(cell);
        self.bytes_since_gc += cell_footprint(size);
        self.live_bytes += cell_footprint(size);
        cell
    }

    /// Sort the cell table so `find_cell` can binary search it.
    pub fn prepare_for_conservative_scan(&mut self) {
        self.cells.sort_unstable();
    }

    /// Resolves `addr` to the cell whose payload range contains it, if
    /// any. Interior pointers match: every address in
    /// `[payload, payload + size)` resolves, not only the base.
    ///
    /// The table must be sorted (see `prepare_for_conservative_scan`).
    pub fn find_cell(&self, addr: usize) -> Option<*mut CellHeader> {
        let first = *self.cells.first()?;
        let last = *self.cells.last()?;
        unsafe {
            if addr < (*first).payload() as usize
                || addr >= (*last).payload() as usize + (*last).size()
            {
                return None;
            }
            self.cells
                .binary_search_by(|&cell| {
                    let payload = (*cell).payload() as usize;
                    if payload + (*cell).size() <= addr {
                        Ordering::Less
                    } else if payload > addr {
                        Ordering::Greater
                    } else {
                        Ordering::Equal
                    }
                })
                .ok()
                .map(|ix| self.cells[ix])
        }
    }

    /// Destroys every unmarked cell and clears the mark bit on every
    /// survivor. Cells allocated while finalizers run (the table is
    /// empty at that point) are preserved untouched.
    pub fn sweep(&mut self) -> SweepStats {
        let cells = std::mem::take(&mut self.cells);
        let mut survivors = Vec::with_capacity(cells.len());
        let mut stats = SweepStats {
            destroyed: 0,
            bytes_freed: 0,
        };
        for cell in cells {
            unsafe {
                if (*cell).is_marked() {
                    (*cell).clear_marked();
                    survivors.push(cell);
                } else {
                    stats.destroyed += 1;
                    stats.bytes_freed += cell_footprint((*cell).size());
                    destroy_cell(cell);
                }
            }
        }
        let newborn = std::mem::replace(&mut self.cells, survivors);
        self.cells.extend(newborn);
        self.live_bytes -= stats.bytes_freed;
        stats
    }

    /// Destroys every remaining cell, reachable or not. Runs when the
    /// owning thread exits.
    pub fn drain(&mut self) -> SweepStats {
        let cells = std::mem::take(&mut self.cells);
        let mut stats = SweepStats {
            destroyed: 0,
            bytes_freed: 0,
        };
        for cell in cells {
            unsafe {
                stats.destroyed += 1;
                stats.bytes_freed += cell_footprint((*cell).size());
                destroy_cell(cell);
            }
        }
        self.live_bytes -= stats.bytes_freed;
        stats
    }

    /// Visits every live cell, in no particular order.
    pub fn for_each(&self, mut f: impl FnMut(*mut CellHeader)) {
        for &cell in self.cells.iter() {
            f(cell);
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn bytes_since_collection(&self) -> usize {
        self.bytes_since_gc
    }

    pub fn reset_counter(&mut self) {
        self.bytes_since_gc = 0;
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.drain();
    }
}
