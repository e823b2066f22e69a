//! Per-thread manager singletons and the process-global thread
//! registry.
//!
//! A thread's manager is created lazily by its first allocation and
//! torn down by the thread-local storage destructor when the thread
//! exits, at which point every cell the thread still owns is destroyed
//! regardless of reachability. Heaps are never shared: a collection on
//! one thread cannot touch another thread's cells, so the hot paths
//! need no synchronization at all. The registry below exists only so
//! first-touch registration from different threads is safe.

use crate::collector::Collector;
use atomic::Ordering;
use parking_lot::Mutex;
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::sync::atomic::AtomicUsize;
use std::thread::ThreadId;

static N_MUTATORS: AtomicUsize = AtomicUsize::new(0);
static REGISTRY: Mutex<Vec<ThreadId>> = parking_lot::const_mutex(Vec::new());

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MutatorState {
    Active,
    Draining,
}

pub(crate) struct Mutator {
    gc: UnsafeCell<Collector>,
    state: Cell<MutatorState>,
    thread: ThreadId,
}

impl Mutator {
    fn new() -> Self {
        let thread = std::thread::current().id();
        attach_thread(thread);
        Self {
            gc: UnsafeCell::new(Collector::new()),
            state: Cell::new(MutatorState::Active),
            thread,
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn gc(&self) -> &mut Collector {
        unsafe { &mut *self.gc.get() }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.state.set(MutatorState::Draining);
        self.gc().drain();
        detach_thread(self.thread);
    }
}

fn attach_thread(thread: ThreadId) {
    let mut registry = REGISTRY.lock();
    registry.push(thread);
    N_MUTATORS.fetch_add(1, Ordering::Relaxed);
}

fn detach_thread(thread: ThreadId) {
    let mut registry = REGISTRY.lock();
    let mut detached = false;
    registry.retain(|t| {
        if *t == thread && !detached {
            detached = true;
            false
        } else {
            true
        }
    });
    assert!(detached, "mutator must be detached");
    N_MUTATORS.fetch_sub(1, Ordering::Relaxed);
}

thread_local! {
    static MUTATOR: Mutator = Mutator::new();
}

/// Runs `f` against the calling thread's manager, creating it on first
/// touch. Panics once the thread has started draining its heap: no new
/// allocations are accepted while thread-exit finalizers run.
pub(crate) fn with_mutator<R>(f: impl FnOnce(&Mutator) -> R) -> R {
    match MUTATOR.try_with(|mutator| {
        assert!(
            mutator.state.get() == MutatorState::Active,
            "thread-local collector is draining"
        );
        f(mutator)
    }) {
        Ok(r) => r,
        Err(_) => panic!("thread-local collector has been destroyed"),
    }
}

/// Number of threads that currently own a manager.
pub fn attached_threads() -> usize {
    N_MUTATORS.load(Ordering::Relaxed)
}

/// RAII region in which neither automatic nor manual collection runs on
/// the owning thread.
pub struct DeferGuard {
    // keep the guard on the thread whose collector it defers
    _not_send: PhantomData<*mut ()>,
}

impl DeferGuard {
    pub(crate) fn new() -> Self {
        with_mutator(|m| m.gc().defer());
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        // The guard may outlive the manager during thread teardown.
        let _ = MUTATOR.try_with(|m| m.gc().undefer());
    }
}
