//! Upcall stubs: foreign code calling back into a managed method.
//!
//! An upcall stub is a foreign-convention function whose body borrows the
//! calling thread, enters the managed world and invokes a fixed method on a
//! fixed receiver. Its frame:
//!
//! ```text
//!    high |  incoming stack arguments   |
//!         |  return address             |
//!         |  saved frame base           |  <- rbp
//!         |  (alignment padding)        |
//!         |  return buffer?             |
//!         |  frame record               |
//!         |  callee-saved registers     |
//!         |  argument register save     |
//!         |  result register save       |
//!     low |  outgoing argument area     |  <- rsp
//! ```
//!
//! The incoming argument registers are spilled around the `on_entry` call,
//! which attaches the thread and fills the frame record so the stack walker
//! can cross this frame. Registers the foreign ABI requires preserved are
//! saved on entry and restored on exit: managed code is free to clobber
//! them, the thread register included. The receiver is resolved from its
//! global handle after the argument shuffle, immediately before the call.
//!
//! Multi-register returns go through a return buffer in the frame: the
//! managed callee receives its address in `abi.ret_buf_addr_reg`, writes the
//! raw register images there, and the stub loads the foreign return
//! registers from it after the call.
//!
//! Past the normal epilogue sits the uncaught exception barrier. Managed
//! exceptions must not unwind through foreign frames, so the runtime
//! redirects the return out of the managed callee here and the process is
//! torn down.

use super::{
    dwarf_to_dynasm_fp, dwarf_to_dynasm_gp, emit_move, spill::RegSpiller, stub_sig_name, MoveCtx,
    StubAsm, DW_RAX, DW_RBP, DW_RSP, MANAGED_STACK_ALIGN, REG64_BYTESIZE,
};
use crate::{
    abi::{AbiDescriptor, CallConv},
    dis,
    frame::UpcallFrame,
    log,
    shuffle,
    vm::{RuntimeHooks, VmThreadLayout, HANDLE_TAG_MASK},
    LinkError,
};
use dynasmrt::{dynasm, AssemblyOffset, DynasmApi, ExecutableBuffer};
use indexmap::IndexMap;
use libc::c_void;
use moltreg::{PrimTy, VmLoc, DWARF_FP_BASE, DWARF_FP_LAST, DWARF_GP_LAST};

/// Staging register for the argument shuffle: volatile under both
/// conventions and an argument register of neither.
const SHUFFLE_SCRATCH: VmLoc = VmLoc::Gpr(DW_RAX);

/// Registers the foreign ABI requires preserved that managed code is free to
/// clobber. The stack and frame pointers are excluded: the prologue and
/// epilogue handle both.
fn callee_saved_regs(abi: &AbiDescriptor) -> Vec<VmLoc> {
    let mut regs = Vec::new();
    for n in 0..=DWARF_GP_LAST {
        if n == DW_RSP || n == DW_RBP {
            continue;
        }
        if !abi.is_volatile_reg(VmLoc::Gpr(n)) {
            regs.push(VmLoc::Gpr(n));
        }
    }
    for n in DWARF_FP_BASE..=DWARF_FP_LAST {
        if !abi.is_volatile_reg(VmLoc::Fpr(n)) {
            regs.push(VmLoc::Fpr(n));
        }
    }
    regs
}

/// Generate an upcall stub invoking `method` on the object behind
/// `receiver_handle` whenever foreign code calls the stub's entry point.
///
/// `conv` gives the foreign-side locations for `sig`, usually from
/// [CallConv::foreign]. `receiver_handle` is the address of a global handle
/// slot holding the receiver; its low [HANDLE_TAG_MASK] bits are cleared
/// before the load. `method` is the address of the runtime's method
/// structure, published in the thread's callee-target slot for the stack
/// walker and called through its entry field.
///
/// `ret_buf_bytes` requests a return buffer of that size for multi-register
/// returns; `ret_ty` must then be void and `conv.ret_locs` lists the foreign
/// registers to load from the buffer, one 8-byte slot each, in order.
#[allow(clippy::too_many_arguments)]
pub fn make_upcall_stub(
    sig: &[PrimTy],
    ret_ty: PrimTy,
    abi: &AbiDescriptor,
    conv: &CallConv,
    layout: &VmThreadLayout,
    hooks: &RuntimeHooks,
    receiver_handle: usize,
    method: usize,
    ret_buf_bytes: Option<u32>,
) -> Result<UpcallStub, LinkError> {
    assert_eq!(sig.len(), conv.arg_locs.len());
    assert_ne!(receiver_handle, 0, "null receiver handle");
    match ret_buf_bytes {
        Some(bytes) => {
            assert!(
                ret_ty.is_void(),
                "return buffer upcalls must declare a void return, got {ret_ty:?}"
            );
            assert!(
                !conv.ret_locs.is_empty(),
                "return buffer with no return locations"
            );
            let needed = u32::try_from(conv.ret_locs.len()).unwrap() * REG64_BYTESIZE;
            assert!(
                bytes >= needed,
                "return buffer too small: {bytes} bytes for {} return registers",
                conv.ret_locs.len()
            );
        }
        None => {
            if let Some(first) = conv.ret_locs.first() {
                assert_eq!(
                    conv.ret_locs.len(),
                    1,
                    "multi-register return without a return buffer: {:?}",
                    conv.ret_locs
                );
                let managed_ret = if ret_ty.is_fp() {
                    VmLoc::Fpr(DWARF_FP_BASE)
                } else {
                    VmLoc::Gpr(DW_RAX)
                };
                assert_eq!(
                    *first, managed_ret,
                    "foreign return location does not match the managed return register"
                );
            } else {
                assert!(ret_ty.is_void());
            }
        }
    }
    UpcallGen {
        sig,
        ret_ty,
        abi,
        conv,
        layout,
        hooks,
        receiver_handle,
        method,
        ret_buf_bytes,
    }
    .generate()
}

struct UpcallGen<'a> {
    sig: &'a [PrimTy],
    ret_ty: PrimTy,
    abi: &'a AbiDescriptor,
    conv: &'a CallConv,
    layout: &'a VmThreadLayout,
    hooks: &'a RuntimeHooks,
    receiver_handle: usize,
    method: usize,
    ret_buf_bytes: Option<u32>,
}

impl UpcallGen<'_> {
    fn generate(self) -> Result<UpcallStub, LinkError> {
        let name = stub_sig_name("upcall", self.sig, self.ret_ty);
        let l = self.layout;

        // The managed-side signature carries the receiver first. It is
        // loaded from its handle after the shuffle, so only the remaining
        // locations take part in the move plan.
        let mut m_tys = Vec::with_capacity(self.sig.len() + 1);
        m_tys.push(PrimTy::I64);
        m_tys.extend_from_slice(self.sig);
        let m_conv = CallConv::managed(&m_tys, self.ret_ty);
        let recv = match m_conv.arg_locs[0] {
            VmLoc::Gpr(n) => dwarf_to_dynasm_gp(n),
            loc => panic!("receiver does not fit a register: {loc:?}"),
        };

        let moves = shuffle::plan(
            self.sig,
            &self.conv.arg_locs,
            &m_conv.arg_locs[1..],
            SHUFFLE_SCRATCH,
        );

        let arg_spiller = RegSpiller::new(&self.conv.arg_locs);
        let preserved = RegSpiller::new(&callee_saved_regs(self.abi));
        let result_spiller = RegSpiller::new(&self.conv.ret_locs);
        let frame = UpcallFrame::plan(
            m_conv.stack_bytes.next_multiple_of(MANAGED_STACK_ALIGN),
            result_spiller.spill_size_bytes(),
            arg_spiller.spill_size_bytes(),
            preserved.spill_size_bytes(),
            self.ret_buf_bytes,
            self.abi.stack_align,
        );
        let record_off = i32::try_from(frame.frame_record_off).unwrap();

        let mut stub = StubAsm::new()?;
        stub.comment(format!("{name}: prologue"));
        dynasm!(stub.asm
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
            ; sub rsp, i32::try_from(frame.size).unwrap()
        );

        stub.comment("spill the incoming argument registers".to_owned());
        arg_spiller.gen_spill(&mut stub.asm, frame.arg_save_off);

        stub.comment("preserve the callee saved registers".to_owned());
        preserved.gen_spill(&mut stub.asm, frame.reg_save_off);

        stub.comment("on_entry: attach the thread".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; lea rdi, [rsp + record_off]
            ; mov rax, QWORD self.hooks.on_upcall_entry as i64
            ; call rax
            ; mov r15, rax
        );

        stub.comment("refill the incoming argument registers".to_owned());
        arg_spiller.gen_fill(&mut stub.asm, frame.arg_save_off);

        let ctx = MoveCtx {
            in_stk_bias: self.abi.shadow_bytes,
            out_stk_bias: 0,
            scratch: dwarf_to_dynasm_gp(DW_RAX),
        };
        for mv in &moves {
            stub.comment(format!("{:?}: {:?} -> {:?}", mv.ty, mv.from, mv.to));
            emit_move(&mut stub.asm, mv, ctx);
        }

        if let Some(off) = frame.ret_buf_off {
            stub.comment("pass the return buffer address".to_owned());
            let r = match self.abi.ret_buf_addr_reg {
                VmLoc::Gpr(n) => dwarf_to_dynasm_gp(n),
                loc => panic!("return buffer address register must be a general purpose register: {loc:?}"),
            };
            dynasm!(stub.asm
                ; .arch x64
                ; lea Rq(r), [rsp + i32::try_from(off).unwrap()]
            );
        }

        stub.comment("resolve the receiver handle".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; mov r10, QWORD self.receiver_handle as i64
            ; and r10, !(i32::from(HANDLE_TAG_MASK))
            ; mov Rq(recv), [r10]
        );

        stub.comment("call the managed entry".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; mov rbx, QWORD self.method as i64
            ; mov QWORD [r15 + l.callee_target_off], rbx
            ; call QWORD [rbx + l.method_entry_off]
        );

        if let Some(off) = frame.ret_buf_off {
            stub.comment("load the foreign return registers from the buffer".to_owned());
            for (i, loc) in self.conv.ret_locs.iter().enumerate() {
                let slot =
                    i32::try_from(off + u32::try_from(i).unwrap() * REG64_BYTESIZE).unwrap();
                match *loc {
                    VmLoc::Gpr(n) => {
                        let d = dwarf_to_dynasm_gp(n);
                        dynasm!(stub.asm ; .arch x64 ; mov Rq(d), QWORD [rsp + slot]);
                    }
                    VmLoc::Fpr(n) => {
                        let d = dwarf_to_dynasm_fp(n);
                        dynasm!(stub.asm ; .arch x64 ; movsd Rx(d), [rsp + slot]);
                    }
                    VmLoc::Stack(_) => panic!("return location on the stack: {loc:?}"),
                }
            }
        }

        if !self.conv.ret_locs.is_empty() {
            stub.comment("save the return value".to_owned());
            result_spiller.gen_spill(&mut stub.asm, frame.res_save_off);
        }

        stub.comment("on_exit: detach the thread".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; lea rdi, [rsp + record_off]
            ; mov rax, QWORD self.hooks.on_upcall_exit as i64
            ; call rax
        );

        stub.comment("restore the callee saved registers".to_owned());
        preserved.gen_fill(&mut stub.asm, frame.reg_save_off);
        if !self.conv.ret_locs.is_empty() {
            result_spiller.gen_fill(&mut stub.asm, frame.res_save_off);
        }

        stub.comment("epilogue".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; leave
            ; ret
        );

        stub.comment("uncaught exception handler".to_owned());
        let exception_handler_off = u32::try_from(stub.offset().0).unwrap();
        dynasm!(stub.asm
            ; .arch x64
            ; mov rdi, rax
            ; mov rax, QWORD self.hooks.uncaught_exception_abort as i64
            ; call rax
            ; ud2
        );

        let (buf, comments) = stub.finalize()?;
        log::register_stub(name.clone(), buf.ptr(AssemblyOffset(0)) as usize, buf.len());
        let stub = UpcallStub {
            buf,
            name,
            frame_bytes: frame.size,
            frame_record_off: frame.frame_record_off,
            exception_handler_off,
            receiver_handle: self.receiver_handle,
            comments,
        };
        if log::stub_log_enabled() {
            log::log_stub(&stub.name, &stub.disassemble(true));
        }
        Ok(stub)
    }
}

/// A generated upcall stub, ready to be handed to foreign code as a function
/// pointer. Dropping it unmaps the code, so it must outlive every foreign
/// reference to its entry point.
pub struct UpcallStub {
    buf: ExecutableBuffer,
    name: String,
    frame_bytes: u32,
    frame_record_off: u32,
    exception_handler_off: u32,
    receiver_handle: usize,
    comments: IndexMap<usize, Vec<String>>,
}

impl UpcallStub {
    /// Address of the stub's entry point, callable under the foreign
    /// convention.
    pub fn entry(&self) -> *const c_void {
        self.buf.ptr(AssemblyOffset(0)) as *const c_void
    }

    /// The generated machine code.
    pub fn code(&self) -> &[u8] {
        &self.buf
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed frame size in bytes, excluding the return address and the saved
    /// frame base.
    pub fn frame_bytes(&self) -> u32 {
        self.frame_bytes
    }

    /// Offset of the frame record from the stub's stack pointer.
    pub fn frame_record_off(&self) -> u32 {
        self.frame_record_off
    }

    /// Code offset of the uncaught exception barrier.
    pub fn exception_handler_off(&self) -> u32 {
        self.exception_handler_off
    }

    /// Address of the global handle slot the receiver is loaded from.
    pub fn receiver_handle(&self) -> usize {
        self.receiver_handle
    }

    /// Render the stub's code, comments interleaved.
    pub fn disassemble(&self, with_addrs: bool) -> String {
        dis::render(&self.buf, &self.comments, with_addrs)
    }
}
