//! The contract between generated stubs and the host runtime.
//!
//! Managed execution keeps the address of the current thread's runtime block
//! in `r15`. Downcall stubs rely on that; upcall stubs establish it from the
//! entry hook's return value. Everything else the stubs touch in the thread
//! block is described by offset here, so the generators stay decoupled from
//! the runtime's struct definitions.

use strum::{EnumCount, FromRepr};

/// Values of the per-thread execution state word.
///
/// Stores to the word in generated code are plain 32-bit stores; on x86-64
/// they have release semantics. The one transition the collector must not
/// miss, [ThreadState::Native] to [ThreadState::NativeTrans], is followed by
/// a full fence before the stub reads the poll word, so the state store and
/// the poll read cannot be reordered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code, stubs included.
    Managed = 0,
    /// Executing a foreign function. The collector may scan the thread's
    /// stack without stopping it; the frame anchor marks the last managed
    /// frame.
    Native = 1,
    /// Returned from a foreign function but not yet back in managed state.
    NativeTrans = 2,
}

/// Values of the per-thread stack guard word the downcall epilogue compares.
#[repr(u32)]
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq, Eq)]
pub enum StackGuard {
    /// Guard pages armed; nothing to do on return.
    Armed = 0,
    /// The yellow zone was disabled while the thread was in native code and
    /// must be re-armed before managed code runs again.
    YellowDisabled = 1,
}

/// Bit the safepoint poll tests in the thread's poll word. The runtime arms
/// the poll by setting it.
pub const POLL_ARMED_BIT: u8 = 1;

/// Low bits of a reference handle used as a tag by the runtime. Upcall stubs
/// clear them before dereferencing the handle.
pub const HANDLE_TAG_MASK: u8 = 0b11;

/// Byte offsets of the thread block fields generated code reads or writes,
/// plus the offset of the compiled-code entry point within a method
/// structure. All offsets are non-negative.
#[derive(Clone, Copy, Debug)]
pub struct VmThreadLayout {
    /// The 32-bit [ThreadState] word.
    pub state_off: i32,
    /// The safepoint poll byte.
    pub poll_off: i32,
    /// The 32-bit suspend flags word. Zero means not suspended.
    pub suspend_off: i32,
    /// The 32-bit [StackGuard] word.
    pub stack_guard_off: i32,
    /// Frame anchor: stack pointer of the last managed frame.
    pub anchor_sp_off: i32,
    /// Frame anchor: frame base of the last managed frame.
    pub anchor_fp_off: i32,
    /// Frame anchor: return address into the last managed frame.
    pub anchor_pc_off: i32,
    /// Slot an upcall stub publishes the callee method structure to before
    /// dispatching, for stack walkers crossing a frame under construction.
    pub callee_target_off: i32,
    /// Offset of the compiled-code entry pointer within a method structure.
    pub method_entry_off: i32,
}

/// Addresses of the runtime routines generated stubs call out to. All are
/// `extern "C"`.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeHooks {
    /// `fn(thread: *mut c_void)`: safepoint/suspend processing for a thread
    /// caught by the poll on its way out of native state. Called with the
    /// state word still at [ThreadState::NativeTrans].
    pub native_trans_check: usize,
    /// `fn()`: re-arm the yellow guard zone of the current thread's stack.
    pub reguard_stack: usize,
    /// `fn(record: *mut FrameRecord) -> *mut c_void`: attach the upcalling
    /// thread to the runtime, fill in `record`, and return the thread block
    /// address.
    pub on_upcall_entry: usize,
    /// `fn(record: *mut FrameRecord)`: detach after an upcall returns.
    pub on_upcall_exit: usize,
    /// `fn(exception: *mut c_void) -> !`: report an exception that reached an
    /// upcall stub's boundary and abort.
    pub uncaught_exception_abort: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_word_values() {
        // The numeric values are runtime ABI and must not drift.
        assert_eq!(ThreadState::Managed as u32, 0);
        assert_eq!(ThreadState::Native as u32, 1);
        assert_eq!(ThreadState::NativeTrans as u32, 2);
        assert_eq!(ThreadState::from_repr(2), Some(ThreadState::NativeTrans));
        assert_eq!(ThreadState::from_repr(3), None);
    }

    #[test]
    fn guard_word_values() {
        assert_eq!(StackGuard::Armed as u32, 0);
        assert_eq!(StackGuard::YellowDisabled as u32, 1);
        assert_eq!(StackGuard::from_repr(1), Some(StackGuard::YellowDisabled));
    }
}
