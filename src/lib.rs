//! Per-thread conservative mark & sweep garbage collection.
//!
//! Objects enter the managed heap through [`allocate`] and stay alive
//! for as long as some aligned word on their owning thread's native
//! call stack (or inside another live managed object) holds their
//! address. Reference cycles are reclaimed like any other garbage: the
//! tracer visits each cell once, so mutually referencing groups that no
//! root reaches are swept together, with every destructor running
//! exactly once before the memory is released.
//!
//! Each thread runs its own independent collector over its own heap.
//! A collection pauses only the thread that triggered it; there is no
//! global lock and no stop-the-world across threads. The flip side is
//! that pointers returned by [`allocate`] must stay on the thread that
//! made them: an object is considered unreachable as soon as its owning
//! thread's stack no longer mentions it, no matter what other threads
//! hold.
//!
//! ```no_run
//! struct Node {
//!     next: *mut Node,
//! }
//!
//! let a = cinder::allocate(Node { next: std::ptr::null_mut() });
//! let b = cinder::allocate(Node { next: a });
//! unsafe { (*a).next = b };
//! // `a` and `b` now form a cycle; once the stack forgets them, one
//! // collection cycle reclaims both.
//! cinder::collect();
//! ```

#[macro_use]
extern crate log;

#[cfg(not(unix))]
compile_error!("stack bounds discovery is only implemented for unix targets");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("register capture is only implemented for x86_64 and aarch64");

mod collector;
mod header;
mod heap;
mod mutator;
mod stack;
mod util;

#[cfg(test)]
mod tests;

pub use collector::{HeapStatistics, DEFAULT_THRESHOLD};
pub use mutator::{attached_threads, DeferGuard};

use mutator::with_mutator;

/// Moves `value` onto the calling thread's managed heap and returns a
/// raw pointer to it. The collector owns the allocation from here on:
/// the pointer stays valid for as long as the calling thread's stack or
/// another live managed object on the same thread refers to it, and the
/// destructor runs when a collection finds it unreachable (at the
/// latest when the thread exits).
///
/// May run a full collection cycle on the calling thread before
/// allocating, when enough bytes have accumulated since the last cycle
/// (see [`set_threshold`]).
///
/// Dereferencing the returned pointer after the object became
/// unreachable, or from any thread other than the allocating one, is
/// undefined behavior.
///
/// # Panics
///
/// A destructor may allocate while an ordinary collection sweeps (the
/// cycle is not re-entered), but once the owning thread has begun
/// tearing down its collector no further allocations are accepted:
/// calling this from a destructor that runs during thread exit panics.
pub fn allocate<T: 'static>(value: T) -> *mut T {
    with_mutator(|m| m.gc().allocate(value))
}

/// Forces a full collection cycle on the calling thread: scans the
/// thread's native stack for roots, traces, and sweeps everything
/// unreachable. Other threads are not paused. Resets the automatic
/// trigger accounting.
pub fn collect() {
    with_mutator(|m| m.gc().collect())
}

/// Overrides the calling thread's automatic collection threshold.
/// Allocation forces a cycle once this many bytes of new cells have
/// accumulated since the previous cycle. Defaults to
/// [`DEFAULT_THRESHOLD`].
pub fn set_threshold(bytes: usize) {
    with_mutator(|m| m.gc().set_threshold(bytes))
}

/// Counters for the calling thread's collector.
pub fn statistics() -> HeapStatistics {
    with_mutator(|m| m.gc().statistics())
}

/// Suppresses collection on the calling thread until the returned guard
/// is dropped. Allocation proceeds normally underneath it.
pub fn defer() -> DeferGuard {
    DeferGuard::new()
}
