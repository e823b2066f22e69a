use modular_bitfield::prelude::*;
use std::mem::size_of;

/// Callback that runs the destructor of the payload it is handed.
pub(crate) type FinalizationCallback = unsafe extern "C" fn(*mut u8);

// CellHeader is prepended to every managed allocation.
//
// +-----------+------+--------------------------------------------+
// | name      | bits |                                            |
// +-----------+------+--------------------------------------------+
// | size      |   62 | Payload size in bytes.                     |
// | mark bit  |    1 | Set while tracing, clear between cycles.   |
// | unused    |    1 |                                            |
// +-----------+------+--------------------------------------------+
// | finalizer |   64 | Destructor thunk; None for trivial types.  |
// +-----------+------+--------------------------------------------+
//
// The payload starts immediately after the header and is 16 byte
// aligned because the header is 16 bytes and cells come from malloc.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub(crate) struct CellWord {
    size: B62,
    marked: bool,
    #[skip]
    __: B1,
}

#[repr(C)]
pub(crate) struct CellHeader {
    word: CellWord,
    finalizer: Option<FinalizationCallback>,
}

impl CellHeader {
    pub fn new(size: usize, finalizer: Option<FinalizationCallback>) -> Self {
        Self {
            word: CellWord::new().with_size(size as u64),
            finalizer,
        }
    }

    /// Payload size in bytes. The cell's footprint is this plus the header.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.word.size() as usize
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.word.marked()
    }

    /// Sets the mark bit, returning true if it was newly set.
    #[inline(always)]
    pub fn test_and_set_marked(&mut self) -> bool {
        if self.is_marked() {
            return false;
        }
        self.word.set_marked(true);
        true
    }

    #[inline(always)]
    pub fn clear_marked(&mut self) {
        self.word.set_marked(false);
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as _
    }

    /// Runs the destructor thunk. Must be invoked at most once, right
    /// before the cell's storage is released.
    pub unsafe fn finalize(&mut self) {
        if let Some(cb) = self.finalizer {
            cb(self.payload());
        }
    }
}

/// Produces the type-erased destructor for `T`, or `None` when dropping
/// `T` is a no-op and sweeping can skip the callback entirely.
pub(crate) trait FinalizeErased {
    const NON_TRIVIAL_DTOR: bool;
    const CALLBACK: Option<FinalizationCallback>;
}

impl<T> FinalizeErased for T {
    const NON_TRIVIAL_DTOR: bool = std::mem::needs_drop::<T>();
    const CALLBACK: Option<FinalizationCallback> = if Self::NON_TRIVIAL_DTOR {
        Some(finalize_thunk::<T>)
    } else {
        None
    };
}

unsafe extern "C" fn finalize_thunk<T>(obj: *mut u8) {
    std::ptr::drop_in_place(obj.cast::<T>());
}
