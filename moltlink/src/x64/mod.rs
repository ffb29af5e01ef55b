//! The x86-64 emission layer shared by the stub generators.
//!
//! Stubs are built with a frame base register: `rbp` is pushed on entry and
//! the frame allocated below it in one step, so incoming stack arguments sit
//! at fixed positive offsets from `rbp` and everything the stub owns at fixed
//! non-negative offsets from `rsp`. Registers are named by their DWARF
//! numbers (see [moltreg]) until the moment an instruction is emitted.

use crate::{shuffle::Move, LinkError};
use dynasmrt::{dynasm, x64::Assembler, AssemblyOffset, DynasmApi, ExecutableBuffer};
use indexmap::IndexMap;
use moltreg::{PrimTy, VmLoc, DWARF_FP_BASE, DWARF_FP_LAST};
use std::cell::Cell;

pub mod downcall;
pub mod spill;
pub mod upcall;

// DWARF numbers of the general purpose registers.
pub(crate) const DW_RAX: u16 = 0;
pub(crate) const DW_RDX: u16 = 1;
pub(crate) const DW_RCX: u16 = 2;
pub(crate) const DW_RBX: u16 = 3;
pub(crate) const DW_RSI: u16 = 4;
pub(crate) const DW_RDI: u16 = 5;
pub(crate) const DW_RBP: u16 = 6;
pub(crate) const DW_RSP: u16 = 7;
pub(crate) const DW_R8: u16 = 8;
pub(crate) const DW_R9: u16 = 9;
pub(crate) const DW_R10: u16 = 10;
pub(crate) const DW_R11: u16 = 11;
pub(crate) const DW_R12: u16 = 12;
pub(crate) const DW_R13: u16 = 13;
pub(crate) const DW_R14: u16 = 14;
pub(crate) const DW_R15: u16 = 15;

/// The size of a 64-bit register in bytes.
pub(crate) const REG64_BYTESIZE: u32 = 8;

/// Stack alignment the managed convention requires at call sites, in bytes.
pub(crate) const MANAGED_STACK_ALIGN: u32 = 16;

/// Bytes between a stub's frame base and its first incoming stack argument:
/// the saved frame base and the return address.
pub(crate) const IN_ARG_BASE_OFF: u32 = 16;

// DWARF numbers general purpose registers in argument-passing order while
// dynasm follows the hardware encoding, so rsi, rdi, rbp and rsp swap
// positions.
// https://docs.rs/dynasmrt/latest/dynasmrt/x64/enum.Rq.html
pub(crate) fn dwarf_to_dynasm_gp(n: u16) -> u8 {
    match n {
        DW_RAX => 0,
        DW_RDX => 2,
        DW_RCX => 1,
        DW_RBX => 3,
        DW_RSI => 6,
        DW_RDI => 7,
        DW_RBP => 5,
        DW_RSP => 4,
        DW_R8 => 8,
        DW_R9 => 9,
        DW_R10 => 10,
        DW_R11 => 11,
        DW_R12 => 12,
        DW_R13 => 13,
        DW_R14 => 14,
        DW_R15 => 15,
        _ => panic!("unsupported DWARF register number: {n}"),
    }
}

/// DWARF numbers XMM0-XMM15 as 17-32; dynasm numbers them 0-15.
pub(crate) fn dwarf_to_dynasm_fp(n: u16) -> u8 {
    if (DWARF_FP_BASE..=DWARF_FP_LAST).contains(&n) {
        u8::try_from(n - DWARF_FP_BASE).unwrap()
    } else {
        panic!("unsupported DWARF register number: {n}");
    }
}

/// Stub names encode the signature one character per type, arguments then
/// return: `molt_downcall_jj_i` takes two longs and returns an int.
pub(crate) fn stub_sig_name(kind: &str, args: &[PrimTy], ret: PrimTy) -> String {
    let mut name = format!("molt_{kind}_");
    for a in args {
        name.push(a.code());
    }
    name.push('_');
    name.push(ret.code());
    name
}

/// A stub under assembly: the assembler plus an offset-keyed comment map
/// consumed by the disassembler.
pub(crate) struct StubAsm {
    pub(crate) asm: Assembler,
    comments: Cell<IndexMap<usize, Vec<String>>>,
}

impl StubAsm {
    pub(crate) fn new() -> Result<StubAsm, LinkError> {
        Ok(StubAsm {
            asm: Assembler::new().map_err(|e| LinkError::ResourceExhausted(Box::new(e)))?,
            comments: Cell::new(IndexMap::new()),
        })
    }

    /// Add a comment to the code at the current offset.
    pub(crate) fn comment(&mut self, line: String) {
        self.comments
            .get_mut()
            .entry(self.asm.offset().0)
            .or_default()
            .push(line);
    }

    pub(crate) fn offset(&self) -> AssemblyOffset {
        self.asm.offset()
    }

    /// Commit the code and hand back the executable buffer together with the
    /// comment map.
    pub(crate) fn finalize(
        mut self,
    ) -> Result<(ExecutableBuffer, IndexMap<usize, Vec<String>>), LinkError> {
        self.asm
            .commit()
            .map_err(|e| LinkError::Internal(format!("When committing: {e}")))?;
        let comments = self.comments.take();
        // This unwrap cannot fail since we just successfully committed.
        Ok((self.asm.finalize().unwrap(), comments))
    }
}

/// Stack addressing for one argument shuffle: sources are read off the frame
/// base register, destinations written off the stack pointer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MoveCtx {
    /// Added to incoming stack slot offsets, beyond the fixed frame-base
    /// bias.
    pub(crate) in_stk_bias: u32,
    /// Added to outgoing stack slot offsets.
    pub(crate) out_stk_bias: u32,
    /// dynasm number of the general purpose register that stages stack to
    /// stack moves.
    pub(crate) scratch: u8,
}

impl MoveCtx {
    fn in_off(&self, slot: u32) -> i32 {
        i32::try_from(IN_ARG_BASE_OFF + self.in_stk_bias + slot).unwrap()
    }

    fn out_off(&self, slot: u32) -> i32 {
        i32::try_from(self.out_stk_bias + slot).unwrap()
    }
}

/// Emit one planned move.
pub(crate) fn emit_move(asm: &mut Assembler, mv: &Move, ctx: MoveCtx) {
    match mv.ty {
        PrimTy::Bool | PrimTy::I8 | PrimTy::I16 | PrimTy::Char | PrimTy::I32 => {
            int_move(asm, mv.from, mv.to, ctx)
        }
        PrimTy::I64 => long_move(asm, mv.from, mv.to, ctx),
        PrimTy::F32 => float_move(asm, mv.from, mv.to, ctx),
        PrimTy::F64 => double_move(asm, mv.from, mv.to, ctx),
        PrimTy::Void => panic!("cannot move a void value"),
    }
}

/// Sub-64-bit integers travel in their 32-bit form; narrowing to the true
/// width happened at the producer.
fn int_move(asm: &mut Assembler, from: VmLoc, to: VmLoc, ctx: MoveCtx) {
    match (from, to) {
        (VmLoc::Gpr(s), VmLoc::Gpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_gp(s), dwarf_to_dynasm_gp(d));
            dynasm!(asm ; .arch x64 ; mov Rd(d), Rd(s));
        }
        (VmLoc::Stack(s), VmLoc::Gpr(d)) => {
            let d = dwarf_to_dynasm_gp(d);
            dynasm!(asm ; .arch x64 ; mov Rd(d), DWORD [rbp + ctx.in_off(s)]);
        }
        (VmLoc::Gpr(s), VmLoc::Stack(d)) => {
            let s = dwarf_to_dynasm_gp(s);
            dynasm!(asm ; .arch x64 ; mov DWORD [rsp + ctx.out_off(d)], Rd(s));
        }
        (VmLoc::Stack(s), VmLoc::Stack(d)) => {
            dynasm!(asm
                ; .arch x64
                ; mov Rd(ctx.scratch), DWORD [rbp + ctx.in_off(s)]
                ; mov DWORD [rsp + ctx.out_off(d)], Rd(ctx.scratch)
            );
        }
        _ => panic!("bad int move: {from:?} -> {to:?}"),
    }
}

fn long_move(asm: &mut Assembler, from: VmLoc, to: VmLoc, ctx: MoveCtx) {
    match (from, to) {
        (VmLoc::Gpr(s), VmLoc::Gpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_gp(s), dwarf_to_dynasm_gp(d));
            dynasm!(asm ; .arch x64 ; mov Rq(d), Rq(s));
        }
        (VmLoc::Stack(s), VmLoc::Gpr(d)) => {
            let d = dwarf_to_dynasm_gp(d);
            dynasm!(asm ; .arch x64 ; mov Rq(d), QWORD [rbp + ctx.in_off(s)]);
        }
        (VmLoc::Gpr(s), VmLoc::Stack(d)) => {
            let s = dwarf_to_dynasm_gp(s);
            dynasm!(asm ; .arch x64 ; mov QWORD [rsp + ctx.out_off(d)], Rq(s));
        }
        (VmLoc::Stack(s), VmLoc::Stack(d)) => {
            dynasm!(asm
                ; .arch x64
                ; mov Rq(ctx.scratch), QWORD [rbp + ctx.in_off(s)]
                ; mov QWORD [rsp + ctx.out_off(d)], Rq(ctx.scratch)
            );
        }
        _ => panic!("bad long move: {from:?} -> {to:?}"),
    }
}

/// The general purpose register cases carry a parked cycle member's raw bits
/// (see [crate::shuffle::plan]).
fn float_move(asm: &mut Assembler, from: VmLoc, to: VmLoc, ctx: MoveCtx) {
    match (from, to) {
        (VmLoc::Fpr(s), VmLoc::Fpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_fp(s), dwarf_to_dynasm_fp(d));
            dynasm!(asm ; .arch x64 ; movss Rx(d), Rx(s));
        }
        (VmLoc::Stack(s), VmLoc::Fpr(d)) => {
            let d = dwarf_to_dynasm_fp(d);
            dynasm!(asm ; .arch x64 ; movss Rx(d), [rbp + ctx.in_off(s)]);
        }
        (VmLoc::Fpr(s), VmLoc::Stack(d)) => {
            let s = dwarf_to_dynasm_fp(s);
            dynasm!(asm ; .arch x64 ; movss [rsp + ctx.out_off(d)], Rx(s));
        }
        (VmLoc::Stack(s), VmLoc::Stack(d)) => {
            dynasm!(asm
                ; .arch x64
                ; mov Rd(ctx.scratch), DWORD [rbp + ctx.in_off(s)]
                ; mov DWORD [rsp + ctx.out_off(d)], Rd(ctx.scratch)
            );
        }
        (VmLoc::Fpr(s), VmLoc::Gpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_fp(s), dwarf_to_dynasm_gp(d));
            dynasm!(asm ; .arch x64 ; movq Rq(d), Rx(s));
        }
        (VmLoc::Gpr(s), VmLoc::Fpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_gp(s), dwarf_to_dynasm_fp(d));
            dynasm!(asm ; .arch x64 ; movq Rx(d), Rq(s));
        }
        _ => panic!("bad float move: {from:?} -> {to:?}"),
    }
}

fn double_move(asm: &mut Assembler, from: VmLoc, to: VmLoc, ctx: MoveCtx) {
    match (from, to) {
        (VmLoc::Fpr(s), VmLoc::Fpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_fp(s), dwarf_to_dynasm_fp(d));
            dynasm!(asm ; .arch x64 ; movsd Rx(d), Rx(s));
        }
        (VmLoc::Stack(s), VmLoc::Fpr(d)) => {
            let d = dwarf_to_dynasm_fp(d);
            dynasm!(asm ; .arch x64 ; movsd Rx(d), [rbp + ctx.in_off(s)]);
        }
        (VmLoc::Fpr(s), VmLoc::Stack(d)) => {
            let s = dwarf_to_dynasm_fp(s);
            dynasm!(asm ; .arch x64 ; movsd [rsp + ctx.out_off(d)], Rx(s));
        }
        (VmLoc::Stack(s), VmLoc::Stack(d)) => {
            dynasm!(asm
                ; .arch x64
                ; mov Rq(ctx.scratch), QWORD [rbp + ctx.in_off(s)]
                ; mov QWORD [rsp + ctx.out_off(d)], Rq(ctx.scratch)
            );
        }
        (VmLoc::Fpr(s), VmLoc::Gpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_fp(s), dwarf_to_dynasm_gp(d));
            dynasm!(asm ; .arch x64 ; movq Rq(d), Rx(s));
        }
        (VmLoc::Gpr(s), VmLoc::Fpr(d)) => {
            let (s, d) = (dwarf_to_dynasm_gp(s), dwarf_to_dynasm_fp(d));
            dynasm!(asm ; .arch x64 ; movq Rx(d), Rq(s));
        }
        _ => panic!("bad double move: {from:?} -> {to:?}"),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::{
        frame::FrameRecord,
        vm::{RuntimeHooks, StackGuard, ThreadState, VmThreadLayout},
    };
    use dynasmrt::{dynasm, x64::Assembler, DynasmApi, ExecutableBuffer};
    use libc::c_void;
    use std::{cell::Cell, mem::offset_of};

    /// Stand-in for the runtime's thread block, with the fields generated
    /// stubs touch.
    #[repr(C)]
    pub(crate) struct TestThread {
        pub(crate) state: u32,
        pub(crate) poll: u8,
        pub(crate) suspend: u32,
        pub(crate) stack_guard: u32,
        pub(crate) anchor_sp: u64,
        pub(crate) anchor_fp: u64,
        pub(crate) anchor_pc: u64,
        pub(crate) callee_target: u64,
    }

    impl TestThread {
        pub(crate) fn new() -> TestThread {
            TestThread {
                state: ThreadState::Managed as u32,
                poll: 0,
                suspend: 0,
                stack_guard: StackGuard::Armed as u32,
                anchor_sp: 0,
                anchor_fp: 0,
                anchor_pc: 0,
                callee_target: 0,
            }
        }

        pub(crate) fn layout() -> VmThreadLayout {
            VmThreadLayout {
                state_off: off(offset_of!(TestThread, state)),
                poll_off: off(offset_of!(TestThread, poll)),
                suspend_off: off(offset_of!(TestThread, suspend)),
                stack_guard_off: off(offset_of!(TestThread, stack_guard)),
                anchor_sp_off: off(offset_of!(TestThread, anchor_sp)),
                anchor_fp_off: off(offset_of!(TestThread, anchor_fp)),
                anchor_pc_off: off(offset_of!(TestThread, anchor_pc)),
                callee_target_off: off(offset_of!(TestThread, callee_target)),
                method_entry_off: off(offset_of!(TestMethod, entry)),
            }
        }
    }

    /// Stand-in for a managed method structure.
    #[repr(C)]
    pub(crate) struct TestMethod {
        pub(crate) entry: u64,
    }

    fn off(o: usize) -> i32 {
        i32::try_from(o).unwrap()
    }

    thread_local! {
        /// Thread block address [recording_on_entry] hands out.
        pub(crate) static TEST_THREAD: Cell<usize> = const { Cell::new(0) };
        pub(crate) static TRANS_CHECKS: Cell<usize> = const { Cell::new(0) };
        /// Anchor stack pointer observed inside the last native-trans check.
        pub(crate) static ANCHOR_SP_SEEN: Cell<u64> = const { Cell::new(0) };
        pub(crate) static REGUARDS: Cell<usize> = const { Cell::new(0) };
        pub(crate) static ON_ENTRIES: Cell<usize> = const { Cell::new(0) };
        pub(crate) static ON_EXITS: Cell<usize> = const { Cell::new(0) };
        pub(crate) static LAST_FRAME_RECORD: Cell<usize> = const { Cell::new(0) };
    }

    pub(crate) extern "C" fn recording_trans_check(thread: *mut c_void) {
        TRANS_CHECKS.with(|c| c.set(c.get() + 1));
        let t = thread as *mut TestThread;
        unsafe {
            assert_eq!((*t).state, ThreadState::NativeTrans as u32);
            ANCHOR_SP_SEEN.with(|c| c.set((*t).anchor_sp));
            // The runtime would process the safepoint and disarm the poll.
            (*t).poll = 0;
            (*t).suspend = 0;
        }
    }

    pub(crate) extern "C" fn recording_reguard() {
        REGUARDS.with(|c| c.set(c.get() + 1));
    }

    pub(crate) extern "C" fn recording_on_entry(rec: *mut FrameRecord) -> *mut c_void {
        ON_ENTRIES.with(|c| c.set(c.get() + 1));
        LAST_FRAME_RECORD.with(|c| c.set(rec as usize));
        let thread = TEST_THREAD.with(|c| c.get());
        assert_ne!(thread, 0, "TEST_THREAD not set");
        unsafe {
            (*rec).thread = thread as *mut c_void;
        }
        thread as *mut c_void
    }

    pub(crate) extern "C" fn recording_on_exit(rec: *mut FrameRecord) {
        ON_EXITS.with(|c| c.set(c.get() + 1));
        assert_eq!(LAST_FRAME_RECORD.with(|c| c.get()), rec as usize);
    }

    pub(crate) extern "C" fn aborting_exception_hook(_exception: *mut c_void) {
        panic!("uncaught exception hook reached");
    }

    pub(crate) fn hooks() -> RuntimeHooks {
        RuntimeHooks {
            native_trans_check: recording_trans_check as usize,
            reguard_stack: recording_reguard as usize,
            on_upcall_entry: recording_on_entry as usize,
            on_upcall_exit: recording_on_exit as usize,
            uncaught_exception_abort: aborting_exception_hook as usize,
        }
    }

    pub(crate) fn reset_counters() {
        TRANS_CHECKS.with(|c| c.set(0));
        ANCHOR_SP_SEEN.with(|c| c.set(0));
        REGUARDS.with(|c| c.set(0));
        ON_ENTRIES.with(|c| c.set(0));
        ON_EXITS.with(|c| c.set(0));
        LAST_FRAME_RECORD.with(|c| c.set(0));
    }

    /// Build a thunk entering a downcall stub under the managed convention.
    ///
    /// Callable as `extern "C" fn(thread, a, b, c)`: loads `thread` into
    /// `r15`, which leaves `a`, `b` and `c` in exactly the registers the
    /// managed convention assigns to the first three integer arguments.
    /// Floating point arguments pass through untouched.
    pub(crate) fn managed_entry_thunk(stub_entry: usize) -> ExecutableBuffer {
        let mut asm = Assembler::new().unwrap();
        dynasm!(asm
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
            ; push r15
            ; push rbx
            ; mov r15, rdi
            ; mov rax, QWORD stub_entry as i64
            ; call rax
            ; pop rbx
            ; pop r15
            ; pop rbp
            ; ret
        );
        asm.commit().unwrap();
        asm.finalize().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dis::{disassemble, verify_instruction_sequence};

    #[test]
    fn dwarf_gp_mapping() {
        // The four registers whose DWARF and hardware numbers disagree.
        assert_eq!(dwarf_to_dynasm_gp(DW_RSI), 6);
        assert_eq!(dwarf_to_dynasm_gp(DW_RDI), 7);
        assert_eq!(dwarf_to_dynasm_gp(DW_RBP), 5);
        assert_eq!(dwarf_to_dynasm_gp(DW_RSP), 4);
        assert_eq!(dwarf_to_dynasm_gp(DW_RDX), 2);
        assert_eq!(dwarf_to_dynasm_gp(DW_RCX), 1);
        assert_eq!(dwarf_to_dynasm_gp(DW_RAX), 0);
        assert_eq!(dwarf_to_dynasm_gp(DW_R15), 15);
    }

    #[test]
    #[should_panic(expected = "unsupported DWARF register")]
    fn dwarf_gp_mapping_rejects_fp() {
        dwarf_to_dynasm_gp(17);
    }

    #[test]
    fn dwarf_fp_mapping() {
        assert_eq!(dwarf_to_dynasm_fp(17), 0);
        assert_eq!(dwarf_to_dynasm_fp(24), 7);
        assert_eq!(dwarf_to_dynasm_fp(32), 15);
    }

    #[test]
    #[should_panic(expected = "unsupported DWARF register")]
    fn dwarf_fp_mapping_rejects_gp() {
        dwarf_to_dynasm_fp(0);
    }

    #[test]
    fn sig_names() {
        use PrimTy::*;
        assert_eq!(stub_sig_name("downcall", &[I64, I64], I32), "molt_downcall_jj_i");
        assert_eq!(stub_sig_name("upcall", &[], Void), "molt_upcall__v");
        assert_eq!(
            stub_sig_name("downcall", &[Bool, I8, I16, Char, F32, F64], I64),
            "molt_downcall_zbscfd_j"
        );
    }

    const CTX: MoveCtx = MoveCtx {
        in_stk_bias: 0,
        out_stk_bias: 0,
        scratch: 0,
    };

    fn emit_one(mv: Move, ctx: MoveCtx) -> Vec<String> {
        let mut asm = Assembler::new().unwrap();
        emit_move(&mut asm, &mv, ctx);
        asm.commit().unwrap();
        let buf = asm.finalize().unwrap();
        disassemble(&buf)
    }

    fn mv(ty: PrimTy, from: VmLoc, to: VmLoc) -> Move {
        Move { ty, from, to }
    }

    #[test]
    fn int_moves() {
        use PrimTy::I32;
        let dis = emit_one(mv(I32, VmLoc::Gpr(DW_RSI), VmLoc::Gpr(DW_RDI)), CTX);
        verify_instruction_sequence(&dis, &["mov edi, esi"]);

        // Incoming slot 8 sits above the saved frame base and return address.
        let dis = emit_one(mv(I32, VmLoc::Stack(8), VmLoc::Gpr(DW_RDX)), CTX);
        verify_instruction_sequence(&dis, &["mov edx, dword ptr [rbp + 0x18]"]);

        let out32 = MoveCtx {
            out_stk_bias: 32,
            ..CTX
        };
        let dis = emit_one(mv(I32, VmLoc::Gpr(DW_R9), VmLoc::Stack(0)), out32);
        verify_instruction_sequence(&dis, &["mov dword ptr [rsp + 0x20], r9d"]);

        let dis = emit_one(mv(I32, VmLoc::Stack(0), VmLoc::Stack(8)), CTX);
        verify_instruction_sequence(
            &dis,
            &["mov eax, dword ptr [rbp + 0x10]", "mov dword ptr [rsp + 8], eax"],
        );
    }

    #[test]
    fn int_move_respects_in_bias() {
        let biased = MoveCtx {
            in_stk_bias: 16,
            ..CTX
        };
        let dis = emit_one(mv(PrimTy::I32, VmLoc::Stack(0), VmLoc::Gpr(DW_RDX)), biased);
        verify_instruction_sequence(&dis, &["mov edx, dword ptr [rbp + 0x20]"]);
    }

    #[test]
    fn long_moves() {
        use PrimTy::I64;
        let dis = emit_one(mv(I64, VmLoc::Gpr(DW_RSI), VmLoc::Gpr(DW_RDI)), CTX);
        verify_instruction_sequence(&dis, &["mov rdi, rsi"]);

        let dis = emit_one(mv(I64, VmLoc::Stack(0), VmLoc::Gpr(DW_RDX)), CTX);
        verify_instruction_sequence(&dis, &["mov rdx, qword ptr [rbp + 0x10]"]);

        let dis = emit_one(mv(I64, VmLoc::Gpr(DW_R8), VmLoc::Stack(0)), CTX);
        verify_instruction_sequence(&dis, &["mov qword ptr [rsp], r8"]);
    }

    #[test]
    fn float_moves() {
        use PrimTy::F32;
        let dis = emit_one(mv(F32, VmLoc::Fpr(17), VmLoc::Fpr(18)), CTX);
        verify_instruction_sequence(&dis, &["movss xmm1, xmm0"]);

        let dis = emit_one(mv(F32, VmLoc::Stack(0), VmLoc::Fpr(17)), CTX);
        verify_instruction_sequence(&dis, &["movss xmm0, dword ptr [rbp + 0x10]"]);

        let dis = emit_one(mv(F32, VmLoc::Fpr(24), VmLoc::Stack(16)), CTX);
        verify_instruction_sequence(&dis, &["movss dword ptr [rsp + 0x10], xmm7"]);
    }

    #[test]
    fn double_moves() {
        use PrimTy::F64;
        let dis = emit_one(mv(F64, VmLoc::Fpr(18), VmLoc::Fpr(17)), CTX);
        verify_instruction_sequence(&dis, &["movsd xmm0, xmm1"]);

        let dis = emit_one(mv(F64, VmLoc::Stack(8), VmLoc::Stack(0)), CTX);
        verify_instruction_sequence(
            &dis,
            &["mov rax, qword ptr [rbp + 0x18]", "mov qword ptr [rsp], rax"],
        );
    }

    #[test]
    fn fp_cycle_parking_uses_raw_transfers() {
        use PrimTy::F64;
        let dis = emit_one(mv(F64, VmLoc::Fpr(17), VmLoc::Gpr(DW_RAX)), CTX);
        verify_instruction_sequence(&dis, &["movq rax, xmm0"]);

        let dis = emit_one(mv(F64, VmLoc::Gpr(DW_RAX), VmLoc::Fpr(18)), CTX);
        verify_instruction_sequence(&dis, &["movq xmm1, rax"]);
    }
}
