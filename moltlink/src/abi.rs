//! ABI descriptors and resolved calling conventions.
//!
//! An [AbiDescriptor] captures everything the stub generators need to know
//! about a foreign calling convention: which registers carry arguments and
//! return values, which are clobbered by a call, stack alignment and shadow
//! space, and the two out-of-band registers (downcall target address, upcall
//! return buffer address). A [CallConv] is the result of running a signature
//! through a convention: one location per argument plus the return locations.

use crate::x64::{DW_R10, DW_R11, DW_R8, DW_R9, DW_RAX, DW_RCX, DW_RDI, DW_RDX, DW_RSI};
use moltreg::{PrimTy, VmLoc};

/// Argument registers of the managed calling convention, in assignment order.
/// The set is the native SysV one rotated by one: the native first-argument
/// register is assigned last.
static MANAGED_INT_ARG_REGS: [VmLoc; 6] = [
    VmLoc::Gpr(DW_RSI),
    VmLoc::Gpr(DW_RDX),
    VmLoc::Gpr(DW_RCX),
    VmLoc::Gpr(DW_R8),
    VmLoc::Gpr(DW_R9),
    VmLoc::Gpr(DW_RDI),
];

/// Floating point argument registers of the managed calling convention
/// (XMM0-XMM7, same as native SysV).
static MANAGED_FP_ARG_REGS: [VmLoc; 8] = [
    VmLoc::Fpr(17),
    VmLoc::Fpr(18),
    VmLoc::Fpr(19),
    VmLoc::Fpr(20),
    VmLoc::Fpr(21),
    VmLoc::Fpr(22),
    VmLoc::Fpr(23),
    VmLoc::Fpr(24),
];

/// Describes a foreign ABI to the stub generators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbiDescriptor {
    /// Integer argument registers, in assignment order.
    pub int_arg_regs: Vec<VmLoc>,
    /// Floating point argument registers, in assignment order.
    pub fp_arg_regs: Vec<VmLoc>,
    /// Integer return registers. More than one means a multi-register return,
    /// which requires a return buffer.
    pub int_ret_regs: Vec<VmLoc>,
    /// Floating point return registers.
    pub fp_ret_regs: Vec<VmLoc>,
    /// Call-clobbered integer registers beyond the argument and return sets.
    pub int_extra_volatile: Vec<VmLoc>,
    /// Call-clobbered floating point registers beyond the argument and return
    /// sets.
    pub fp_extra_volatile: Vec<VmLoc>,
    /// Required stack pointer alignment at call sites, in bytes. A power of
    /// two.
    pub stack_align: u32,
    /// Bytes of shadow space the caller reserves at the base of the outgoing
    /// argument area. Zero for SysV.
    pub shadow_bytes: u32,
    /// Register a downcall's target address is passed in.
    pub target_addr_reg: VmLoc,
    /// Register an upcall's return buffer address is passed out in.
    pub ret_buf_addr_reg: VmLoc,
}

impl AbiDescriptor {
    /// The x86-64 System V convention.
    pub fn sysv() -> AbiDescriptor {
        AbiDescriptor {
            int_arg_regs: vec![
                VmLoc::Gpr(DW_RDI),
                VmLoc::Gpr(DW_RSI),
                VmLoc::Gpr(DW_RDX),
                VmLoc::Gpr(DW_RCX),
                VmLoc::Gpr(DW_R8),
                VmLoc::Gpr(DW_R9),
            ],
            // XMM0-XMM7.
            fp_arg_regs: (17..=24).map(VmLoc::Fpr).collect(),
            int_ret_regs: vec![VmLoc::Gpr(DW_RAX), VmLoc::Gpr(DW_RDX)],
            // XMM0, XMM1.
            fp_ret_regs: vec![VmLoc::Fpr(17), VmLoc::Fpr(18)],
            int_extra_volatile: vec![
                VmLoc::Gpr(DW_RAX),
                VmLoc::Gpr(DW_R10),
                VmLoc::Gpr(DW_R11),
            ],
            // XMM8-XMM15.
            fp_extra_volatile: (25..=32).map(VmLoc::Fpr).collect(),
            stack_align: 16,
            shadow_bytes: 0,
            target_addr_reg: VmLoc::Gpr(DW_R10),
            ret_buf_addr_reg: VmLoc::Gpr(DW_R11),
        }
    }

    /// Is the register `loc` clobbered by a call under this ABI?
    ///
    /// # Panics
    ///
    /// If `loc` is not a register.
    pub fn is_volatile_reg(&self, loc: VmLoc) -> bool {
        match loc {
            VmLoc::Gpr(_) => {
                self.int_arg_regs.contains(&loc)
                    || self.int_ret_regs.contains(&loc)
                    || self.int_extra_volatile.contains(&loc)
            }
            VmLoc::Fpr(_) => {
                self.fp_arg_regs.contains(&loc)
                    || self.fp_ret_regs.contains(&loc)
                    || self.fp_extra_volatile.contains(&loc)
            }
            VmLoc::Stack(_) => panic!("not a register: {loc:?}"),
        }
    }
}

/// The locations assigned to one side of a call: one per argument, parallel
/// to the signature, plus the return locations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallConv {
    /// Argument locations, parallel to the signature.
    pub arg_locs: Vec<VmLoc>,
    /// Return locations. Empty for void.
    pub ret_locs: Vec<VmLoc>,
    /// Bytes of outgoing stack the arguments consume, excluding shadow space.
    pub stack_bytes: u32,
}

impl CallConv {
    /// Assign locations for `args`/`ret` under the managed convention: the
    /// rotated integer register set, XMM0-XMM7, overflow to 8-byte stack
    /// slots at ascending offsets, return in RAX or XMM0.
    pub fn managed(args: &[PrimTy], ret: PrimTy) -> CallConv {
        let (arg_locs, stack_bytes) =
            assign_locs(args, &MANAGED_INT_ARG_REGS, &MANAGED_FP_ARG_REGS);
        let ret_locs = match ret {
            PrimTy::Void => Vec::new(),
            t if t.is_fp() => vec![VmLoc::Fpr(17)],
            _ => vec![VmLoc::Gpr(DW_RAX)],
        };
        CallConv {
            arg_locs,
            ret_locs,
            stack_bytes,
        }
    }

    /// Assign locations for `args`/`ret` under the foreign convention
    /// described by `abi`. Single-register returns only; multi-register
    /// returns are resolved by the runtime's linker front end and arrive as
    /// an explicitly built [CallConv].
    pub fn foreign(args: &[PrimTy], ret: PrimTy, abi: &AbiDescriptor) -> CallConv {
        let (arg_locs, stack_bytes) = assign_locs(args, &abi.int_arg_regs, &abi.fp_arg_regs);
        let ret_locs = match ret {
            PrimTy::Void => Vec::new(),
            t if t.is_fp() => vec![abi.fp_ret_regs[0]],
            _ => vec![abi.int_ret_regs[0]],
        };
        CallConv {
            arg_locs,
            ret_locs,
            stack_bytes,
        }
    }
}

/// First-fit register assignment with 8-byte stack overflow slots. All
/// primitive types occupy one register or one slot.
fn assign_locs(args: &[PrimTy], int_regs: &[VmLoc], fp_regs: &[VmLoc]) -> (Vec<VmLoc>, u32) {
    let mut locs = Vec::with_capacity(args.len());
    let mut next_int = 0;
    let mut next_fp = 0;
    let mut stack_off = 0;
    for ty in args {
        assert!(!ty.is_void(), "void argument");
        let regs = if ty.is_fp() { fp_regs } else { int_regs };
        let next = if ty.is_fp() {
            &mut next_fp
        } else {
            &mut next_int
        };
        let loc = if *next < regs.len() {
            *next += 1;
            regs[*next - 1]
        } else {
            let l = VmLoc::Stack(stack_off);
            stack_off += 8;
            l
        };
        locs.push(loc);
    }
    (locs, stack_off)
}
