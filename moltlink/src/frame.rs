//! Stack frame plans for generated stubs.
//!
//! Frame layout is decided in full before a single frame-relative instruction
//! is emitted: generating the same request twice yields the same plan, and
//! every offset handed to the emitter is a plain constant.

use libc::c_void;
use static_assertions::const_assert_eq;
use std::mem;

/// Accumulates frame regions from the stack pointer upwards.
pub struct FrameBuilder {
    off: u32,
}

impl FrameBuilder {
    pub fn new() -> FrameBuilder {
        FrameBuilder { off: 0 }
    }

    /// Reserve `bytes` and return the region's offset from the post-prologue
    /// stack pointer.
    pub fn reserve(&mut self, bytes: u32) -> u32 {
        let off = self.off;
        self.off += bytes;
        off
    }

    /// Total frame size, rounded up to `align` bytes.
    pub fn finish(self, align: u32) -> u32 {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.off.next_multiple_of(align)
    }
}

/// Frame size for a downcall stub: the outgoing argument area (shadow space
/// included) overlaid with the slow-path spill area, whichever is larger,
/// rounded up to the call alignment.
pub fn downcall_frame_bytes(out_arg_bytes: u32, spill_bytes: u32, align: u32) -> u32 {
    let mut b = FrameBuilder::new();
    b.reserve(out_arg_bytes.max(spill_bytes));
    b.finish(align)
}

/// The fixed layout of an upcall stub frame. All offsets are relative to the
/// post-prologue stack pointer:
///
/// ```text
///    high |  incoming stack arguments  |
///         |  return address            |
///         |  saved frame base          |  <- frame base
///         |  (alignment padding)       |
///         |  return buffer?            |  <- ret_buf_off
///         |  frame record              |  <- frame_record_off
///         |  callee-saved registers    |  <- reg_save_off
///         |  argument register save    |  <- arg_save_off
///         |  result register save      |  <- res_save_off
///     low |  outgoing argument area    |  <- stack pointer
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpcallFrame {
    pub res_save_off: u32,
    pub arg_save_off: u32,
    pub reg_save_off: u32,
    pub frame_record_off: u32,
    pub ret_buf_off: Option<u32>,
    pub size: u32,
}

impl UpcallFrame {
    /// Plan an upcall frame. `out_arg_bytes` must already include any shadow
    /// space and be `align`-aligned so the managed call site sees an aligned
    /// stack pointer.
    pub fn plan(
        out_arg_bytes: u32,
        res_save_bytes: u32,
        arg_save_bytes: u32,
        reg_save_bytes: u32,
        ret_buf_bytes: Option<u32>,
        align: u32,
    ) -> UpcallFrame {
        assert_eq!(out_arg_bytes % align, 0);
        assert_eq!(res_save_bytes % 8, 0);
        assert_eq!(arg_save_bytes % 8, 0);
        assert_eq!(reg_save_bytes % 8, 0);
        let mut b = FrameBuilder::new();
        b.reserve(out_arg_bytes);
        let res_save_off = b.reserve(res_save_bytes);
        let arg_save_off = b.reserve(arg_save_bytes);
        let reg_save_off = b.reserve(reg_save_bytes);
        let frame_record_off = b.reserve(u32::try_from(mem::size_of::<FrameRecord>()).unwrap());
        let ret_buf_off = ret_buf_bytes.map(|n| b.reserve(n));
        UpcallFrame {
            res_save_off,
            arg_save_off,
            reg_save_off,
            frame_record_off,
            ret_buf_off,
            size: b.finish(align),
        }
    }
}

/// Per-crossing metadata embedded in every upcall frame at a fixed offset.
///
/// The runtime's entry hook fills in the anchor fields and the owning thread;
/// generated code only ever computes the record's address. Field order is
/// runtime ABI.
#[repr(C)]
#[derive(Debug)]
pub struct FrameRecord {
    pub last_sp: *mut u8,
    pub last_fp: *mut u8,
    pub last_pc: *mut u8,
    pub thread: *mut c_void,
}

const_assert_eq!(mem::size_of::<FrameRecord>(), 32);
const_assert_eq!(mem::align_of::<FrameRecord>(), 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates() {
        let mut b = FrameBuilder::new();
        assert_eq!(b.reserve(32), 0);
        assert_eq!(b.reserve(8), 32);
        assert_eq!(b.reserve(0), 40);
        assert_eq!(b.reserve(4), 40);
        assert_eq!(b.finish(16), 48);
    }

    #[test]
    fn downcall_frame_overlays_spills() {
        assert_eq!(downcall_frame_bytes(0, 0, 16), 0);
        assert_eq!(downcall_frame_bytes(24, 8, 16), 32);
        assert_eq!(downcall_frame_bytes(8, 16, 16), 16);
    }

    #[test]
    fn upcall_frame_regions_ascend() {
        let f = UpcallFrame::plan(32, 8, 48, 40, None, 16);
        assert_eq!(f.res_save_off, 32);
        assert_eq!(f.arg_save_off, 40);
        assert_eq!(f.reg_save_off, 88);
        assert_eq!(f.frame_record_off, 128);
        assert_eq!(f.ret_buf_off, None);
        assert_eq!(f.size, 160);
    }

    #[test]
    fn upcall_frame_with_ret_buf() {
        let f = UpcallFrame::plan(0, 16, 0, 40, Some(16), 16);
        assert_eq!(f.ret_buf_off, Some(16 + 40 + 32));
        assert_eq!(f.size % 16, 0);
        assert!(f.size >= f.ret_buf_off.unwrap() + 16);
    }

    #[test]
    fn upcall_frame_is_deterministic() {
        let a = UpcallFrame::plan(16, 8, 24, 40, Some(8), 16);
        let b = UpcallFrame::plan(16, 8, 24, 40, Some(8), 16);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic]
    fn unaligned_out_args_rejected() {
        UpcallFrame::plan(8, 0, 0, 0, None, 16);
    }
}
