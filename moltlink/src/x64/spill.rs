//! Saving register sets across calls made from inside generated stubs.

use super::{dwarf_to_dynasm_fp, dwarf_to_dynasm_gp, REG64_BYTESIZE};
use dynasmrt::{dynasm, x64::Assembler, DynasmApi};
use moltreg::VmLoc;

/// Emits the spills (register to stack) and fills (stack to register) needed
/// to preserve a set of value locations across a call.
///
/// Stack entries in the set are skipped, they are already in memory. Every
/// register occupies a full 8-byte slot regardless of the value's type, at
/// ascending offsets in the order the locations were given, so spill and fill
/// always agree on placement.
pub struct RegSpiller {
    regs: Vec<VmLoc>,
}

impl RegSpiller {
    pub fn new(locs: &[VmLoc]) -> RegSpiller {
        RegSpiller {
            regs: locs.iter().copied().filter(|l| l.is_reg()).collect(),
        }
    }

    /// Bytes of stack the spill area needs.
    pub fn spill_size_bytes(&self) -> u32 {
        u32::try_from(self.regs.len()).unwrap() * REG64_BYTESIZE
    }

    /// Store every register in the set to `[rsp + offset ..]`.
    pub fn gen_spill(&self, asm: &mut Assembler, offset: u32) {
        let mut off = i32::try_from(offset).unwrap();
        for reg in &self.regs {
            match reg {
                VmLoc::Gpr(n) => {
                    let r = dwarf_to_dynasm_gp(*n);
                    dynasm!(asm ; .arch x64 ; mov QWORD [rsp + off], Rq(r));
                }
                VmLoc::Fpr(n) => {
                    let r = dwarf_to_dynasm_fp(*n);
                    dynasm!(asm ; .arch x64 ; movsd [rsp + off], Rx(r));
                }
                VmLoc::Stack(_) => unreachable!(),
            }
            off += i32::try_from(REG64_BYTESIZE).unwrap();
        }
    }

    /// Reload every register in the set from `[rsp + offset ..]`.
    pub fn gen_fill(&self, asm: &mut Assembler, offset: u32) {
        let mut off = i32::try_from(offset).unwrap();
        for reg in &self.regs {
            match reg {
                VmLoc::Gpr(n) => {
                    let r = dwarf_to_dynasm_gp(*n);
                    dynasm!(asm ; .arch x64 ; mov Rq(r), QWORD [rsp + off]);
                }
                VmLoc::Fpr(n) => {
                    let r = dwarf_to_dynasm_fp(*n);
                    dynasm!(asm ; .arch x64 ; movsd Rx(r), [rsp + off]);
                }
                VmLoc::Stack(_) => unreachable!(),
            }
            off += i32::try_from(REG64_BYTESIZE).unwrap();
        }
    }
}
