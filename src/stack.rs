//! Discovery of the current thread's native stack range, plus a
//! register capture primitive so values living only in callee-saved
//! machine registers are visible to the conservative scan.

/// Bounds of a thread's native call stack. `origin` is the outermost
/// boundary: the highest address on architectures where the stack grows
/// down.
#[derive(Clone, Copy)]
pub(crate) struct StackBounds {
    pub origin: *mut u8,
}

impl StackBounds {
    #[cfg(target_os = "linux")]
    pub fn current_thread_stack_bounds() -> Self {
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            assert_eq!(libc::pthread_attr_init(&mut attr), 0);
            assert_eq!(
                libc::pthread_getattr_np(libc::pthread_self(), &mut attr),
                0
            );
            let mut stackaddr = std::ptr::null_mut();
            let mut stacksize = 0;
            assert_eq!(
                libc::pthread_attr_getstack(&attr, &mut stackaddr, &mut stacksize),
                0
            );
            assert_eq!(libc::pthread_attr_destroy(&mut attr), 0);
            // pthread reports the lowest mapped address; the origin is
            // the other end.
            Self {
                origin: (stackaddr as usize + stacksize) as *mut u8,
            }
        }
    }

    #[cfg(target_os = "macos")]
    pub fn current_thread_stack_bounds() -> Self {
        unsafe {
            let thread = libc::pthread_self();
            Self {
                origin: libc::pthread_get_stackaddr_np(thread) as *mut u8,
            }
        }
    }
}

/// Address of the current innermost frame, approximated by the address
/// of a fresh local.
#[inline(always)]
pub(crate) fn approximate_stack_pointer() -> *mut u8 {
    let mut anchor = std::ptr::null_mut::<u8>();
    &mut anchor as *mut *mut u8 as *mut u8
}

/// Slots written by `capture_registers`. Sized for the largest
/// supported callee-saved set (aarch64); unused tail slots stay zero.
pub(crate) const CAPTURED_REGISTERS: usize = 12;

/// Stores every callee-saved register into `buf`. A live pointer that a
/// caller parked in one of these registers would otherwise be invisible
/// to the stack scan, because nothing below the collection entry point
/// is obliged to spill it.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub(crate) fn capture_registers(buf: &mut [usize; CAPTURED_REGISTERS]) {
    unsafe {
        std::arch::asm!(
            "mov [rdi], rbx",
            "mov [rdi + 8], rbp",
            "mov [rdi + 16], r12",
            "mov [rdi + 24], r13",
            "mov [rdi + 32], r14",
            "mov [rdi + 40], r15",
            in("rdi") buf.as_mut_ptr(),
            options(nostack),
        );
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(never)]
pub(crate) fn capture_registers(buf: &mut [usize; CAPTURED_REGISTERS]) {
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [x9]",
            "stp x21, x22, [x9, #16]",
            "stp x23, x24, [x9, #32]",
            "stp x25, x26, [x9, #48]",
            "stp x27, x28, [x9, #64]",
            "str x29, [x9, #80]",
            in("x9") buf.as_mut_ptr(),
            options(nostack),
        );
    }
}
