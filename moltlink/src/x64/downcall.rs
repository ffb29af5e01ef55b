//! Downcall stubs: managed code calling a foreign function.
//!
//! A downcall stub is entered under the managed convention with the foreign
//! target address as a leading long argument. Its frame:
//!
//! ```text
//!    high |  incoming stack arguments   |
//!         |  return address             |
//!         |  saved frame base           |  <- rbp
//!         |  (alignment padding)        |
//!         |  outgoing argument area,    |
//!         |  reused as the slow paths'  |
//!     low |  return value spill area    |  <- rsp
//! ```
//!
//! The stub publishes the frame anchor and flips the thread's state word to
//! native before the call, so the collector can walk the stack from the
//! anchor while the foreign function runs. On the way back the state goes
//! through native-trans, a fence, and the safepoint poll plus suspend check;
//! either firing diverts to an out-of-line path that spills the return
//! registers and calls into the runtime before rejoining. Sub-64-bit integer
//! returns are narrowed to their managed form before managed code sees them.

use super::{
    dwarf_to_dynasm_gp, emit_move, spill::RegSpiller, stub_sig_name, MoveCtx, StubAsm, DW_RAX,
    REG64_BYTESIZE,
};
use crate::{
    abi::{AbiDescriptor, CallConv},
    dis,
    frame::downcall_frame_bytes,
    log,
    shuffle,
    vm::{RuntimeHooks, StackGuard, ThreadState, VmThreadLayout, POLL_ARMED_BIT},
    LinkError,
};
use dynasmrt::{dynasm, AssemblyOffset, DynasmApi, DynasmLabelApi, ExecutableBuffer};
use indexmap::IndexMap;
use libc::c_void;
use moltreg::{PrimTy, RefMap, RefMapTable, VmLoc};

/// Staging register for the argument shuffle: volatile under both
/// conventions and an argument register of neither.
const SHUFFLE_SCRATCH: VmLoc = VmLoc::Gpr(DW_RAX);

/// Frame size in 8-byte words as stack walkers count it: the return address
/// and the saved frame base included.
fn frame_words(frame_bytes: u32) -> u32 {
    frame_bytes / REG64_BYTESIZE + 2
}

/// Generate a downcall stub for `sig`/`ret_ty`.
///
/// `conv` gives the foreign-side locations for `sig`, usually from
/// [CallConv::foreign]. The managed-side signature is derived internally:
/// `sig` with a leading long for the target address, which the stub shuffles
/// into `abi.target_addr_reg` and calls through.
///
/// # Panics
///
/// If `needs_ret_buf` is set: multi-register struct returns are lowered by
/// the linker front end before stub generation on this ABI, so a downcall
/// return buffer request can only be a front end bug.
pub fn make_downcall_stub(
    sig: &[PrimTy],
    ret_ty: PrimTy,
    abi: &AbiDescriptor,
    conv: &CallConv,
    layout: &VmThreadLayout,
    hooks: &RuntimeHooks,
    needs_ret_buf: bool,
) -> Result<DowncallStub, LinkError> {
    assert!(
        !needs_ret_buf,
        "downcall return buffers are unsupported: multi-register returns are lowered before stub generation"
    );
    assert_eq!(sig.len(), conv.arg_locs.len());
    assert!(
        conv.ret_locs.len() <= 1,
        "multi-register return without a return buffer: {:?}",
        conv.ret_locs
    );
    DowncallGen {
        sig,
        ret_ty,
        abi,
        conv,
        layout,
        hooks,
    }
    .generate()
}

struct DowncallGen<'a> {
    sig: &'a [PrimTy],
    ret_ty: PrimTy,
    abi: &'a AbiDescriptor,
    conv: &'a CallConv,
    layout: &'a VmThreadLayout,
    hooks: &'a RuntimeHooks,
}

impl DowncallGen<'_> {
    fn generate(self) -> Result<DowncallStub, LinkError> {
        let name = stub_sig_name("downcall", self.sig, self.ret_ty);
        let l = self.layout;

        // The managed-side signature carries the target address first.
        let mut in_tys = Vec::with_capacity(self.sig.len() + 1);
        in_tys.push(PrimTy::I64);
        in_tys.extend_from_slice(self.sig);
        let in_conv = CallConv::managed(&in_tys, self.ret_ty);

        let mut out_locs = Vec::with_capacity(in_tys.len());
        out_locs.push(self.abi.target_addr_reg);
        out_locs.extend_from_slice(&self.conv.arg_locs);

        let moves = shuffle::plan(&in_tys, &in_conv.arg_locs, &out_locs, SHUFFLE_SCRATCH);

        let target = match self.abi.target_addr_reg {
            VmLoc::Gpr(n) => dwarf_to_dynasm_gp(n),
            loc => panic!("target address register must be a general purpose register: {loc:?}"),
        };

        let out_arg_bytes = self.conv.stack_bytes + self.abi.shadow_bytes;
        let spiller = RegSpiller::new(&self.conv.ret_locs);
        let frame_bytes = downcall_frame_bytes(
            out_arg_bytes,
            spiller.spill_size_bytes(),
            self.abi.stack_align,
        );

        let mut stub = StubAsm::new()?;
        stub.comment(format!("{name}: prologue"));
        dynasm!(stub.asm
            ; .arch x64
            ; push rbp
            ; mov rbp, rsp
        );
        if frame_bytes != 0 {
            dynasm!(stub.asm ; .arch x64 ; sub rsp, i32::try_from(frame_bytes).unwrap());
        }
        let frame_complete_off = u32::try_from(stub.offset().0).unwrap();

        stub.comment("publish the frame anchor".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; anchor:
            ; lea r11, [<anchor]
            ; mov QWORD [r15 + l.anchor_pc_off], r11
            ; mov QWORD [r15 + l.anchor_fp_off], rbp
            ; mov QWORD [r15 + l.anchor_sp_off], rsp
        );

        stub.comment("state: managed -> native".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; mov DWORD [r15 + l.state_off], ThreadState::Native as i32
        );

        let ctx = MoveCtx {
            in_stk_bias: 0,
            out_stk_bias: self.abi.shadow_bytes,
            scratch: dwarf_to_dynasm_gp(DW_RAX),
        };
        for mv in &moves {
            stub.comment(format!("{:?}: {:?} -> {:?}", mv.ty, mv.from, mv.to));
            emit_move(&mut stub.asm, mv, ctx);
        }

        stub.comment("call the foreign function".to_owned());
        dynasm!(stub.asm ; .arch x64 ; call Rq(target));
        let ret_pc_off = u32::try_from(stub.offset().0).unwrap();
        let mut refmaps = RefMapTable::new();
        refmaps.add(ret_pc_off, RefMap::new(frame_words(frame_bytes)));

        match self.ret_ty {
            PrimTy::Bool => {
                stub.comment("canonicalise the bool return value".to_owned());
                dynasm!(stub.asm
                    ; .arch x64
                    ; test eax, eax
                    ; setne al
                    ; movzx eax, al
                );
            }
            PrimTy::I8 => {
                stub.comment("sign extend the byte return value".to_owned());
                dynasm!(stub.asm ; .arch x64 ; movsx eax, al);
            }
            PrimTy::I16 => {
                stub.comment("sign extend the short return value".to_owned());
                dynasm!(stub.asm ; .arch x64 ; movsx eax, ax);
            }
            PrimTy::Char => {
                stub.comment("zero extend the char return value".to_owned());
                dynasm!(stub.asm ; .arch x64 ; movzx eax, ax);
            }
            PrimTy::I32 => {
                stub.comment("sign extend the int return value".to_owned());
                dynasm!(stub.asm ; .arch x64 ; movsxd rax, eax);
            }
            PrimTy::I64 | PrimTy::F32 | PrimTy::F64 | PrimTy::Void => (),
        }

        stub.comment("state: native -> native-trans".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; mov DWORD [r15 + l.state_off], ThreadState::NativeTrans as i32
            ; mfence
        );

        let slow_path = stub.asm.new_dynamic_label();
        let checks_done = stub.asm.new_dynamic_label();
        stub.comment("safepoint poll and suspend check".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; test BYTE [r15 + l.poll_off], POLL_ARMED_BIT as i8
            ; jne =>slow_path
            ; cmp DWORD [r15 + l.suspend_off], 0
            ; jne =>slow_path
            ; =>checks_done
        );

        stub.comment("state: native-trans -> managed".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; mov DWORD [r15 + l.state_off], ThreadState::Managed as i32
        );

        let reguard = stub.asm.new_dynamic_label();
        let reguard_done = stub.asm.new_dynamic_label();
        stub.comment("re-arm the stack guard if it was disabled".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; cmp DWORD [r15 + l.stack_guard_off], StackGuard::YellowDisabled as i32
            ; je =>reguard
            ; =>reguard_done
        );

        stub.comment("clear the frame anchor".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; mov QWORD [r15 + l.anchor_sp_off], 0
            ; mov QWORD [r15 + l.anchor_fp_off], 0
            ; mov QWORD [r15 + l.anchor_pc_off], 0
        );

        stub.comment("epilogue".to_owned());
        dynasm!(stub.asm
            ; .arch x64
            ; leave
            ; ret
        );

        // Out-of-line paths. The return value registers live in the spill
        // area, which overlays the no longer needed outgoing argument area.
        stub.comment("out of line: safepoint/suspend processing".to_owned());
        dynasm!(stub.asm ; .arch x64 ; =>slow_path);
        spiller.gen_spill(&mut stub.asm, 0);
        dynasm!(stub.asm
            ; .arch x64
            ; mov rdi, r15
            ; mov rax, QWORD self.hooks.native_trans_check as i64
            ; call rax
        );
        spiller.gen_fill(&mut stub.asm, 0);
        dynasm!(stub.asm ; .arch x64 ; jmp =>checks_done);

        stub.comment("out of line: stack guard re-arm".to_owned());
        dynasm!(stub.asm ; .arch x64 ; =>reguard);
        spiller.gen_spill(&mut stub.asm, 0);
        dynasm!(stub.asm
            ; .arch x64
            ; mov rax, QWORD self.hooks.reguard_stack as i64
            ; call rax
        );
        spiller.gen_fill(&mut stub.asm, 0);
        dynasm!(stub.asm ; .arch x64 ; jmp =>reguard_done);

        let (buf, comments) = stub.finalize()?;
        log::register_stub(name.clone(), buf.ptr(AssemblyOffset(0)) as usize, buf.len());
        let stub = DowncallStub {
            buf,
            name,
            frame_bytes,
            frame_complete_off,
            refmaps,
            comments,
        };
        if log::stub_log_enabled() {
            log::log_stub(&stub.name, &stub.disassemble(true));
        }
        Ok(stub)
    }
}

/// A generated downcall stub, ready to be installed as the native entry of a
/// managed-to-foreign call site. Dropping it unmaps the code.
pub struct DowncallStub {
    buf: ExecutableBuffer,
    name: String,
    frame_bytes: u32,
    frame_complete_off: u32,
    refmaps: RefMapTable,
    comments: IndexMap<usize, Vec<String>>,
}

impl DowncallStub {
    /// Address of the stub's entry point.
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

    /// Frame size in 8-byte words as stack walkers count it, the return
    /// address and the saved frame base included.
    pub fn frame_words(&self) -> u32 {
        frame_words(self.frame_bytes)
    }

    /// Code offset after which the stub's frame is fully set up.
    pub fn frame_complete_off(&self) -> u32 {
        self.frame_complete_off
    }

    /// Reference maps for the stub's call sites, keyed by return address
    /// offset.
    pub fn refmaps(&self) -> &RefMapTable {
        &self.refmaps
    }

    /// Render the stub's code, comments interleaved.
    pub fn disassemble(&self, with_addrs: bool) -> String {
        dis::render(&self.buf, &self.comments, with_addrs)
    }
}
