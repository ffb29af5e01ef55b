//! The storage model shared by the foreign-linkage stub generators: where a
//! value lives (`VmLoc`), what primitive shape it has (`PrimTy`), and which
//! locations hold live managed references at a given code offset (`RefMap`).
//!
//! Register numbering follows the DWARF x86-64 convention so locations can be
//! compared against debug info and stackmaps without translation. Note that
//! DWARF ordering differs from the hardware encoding for some registers (for
//! example RDX is DWARF 1 but encoding 2); translation to encoder numbering
//! happens at emission time, not here.

#![allow(clippy::new_without_default)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("The foreign-linkage storage model currently only supports x86_64.");

use strum::{EnumCount, FromRepr};

/// DWARF number of the last general purpose register (R15).
pub const DWARF_GP_LAST: u16 = 15;
/// DWARF number of XMM0. XMMn is `DWARF_FP_BASE + n`.
pub const DWARF_FP_BASE: u16 = 17;
/// DWARF number of XMM15.
pub const DWARF_FP_LAST: u16 = 32;

/// Where a value lives from the point of view of a calling convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VmLoc {
    /// A general purpose register, DWARF numbering (0..=15).
    Gpr(u16),
    /// A floating point register, DWARF numbering (17..=32, i.e. XMM0..=XMM15).
    Fpr(u16),
    /// A stack slot, as a byte offset from the base of the argument area the
    /// location belongs to. Whether that area is the caller's incoming one or
    /// this frame's outgoing one depends on the convention the location sits
    /// in; the emitter applies the appropriate base register and bias.
    Stack(u32),
}

impl VmLoc {
    /// A general purpose register by DWARF number.
    pub fn gpr(n: u16) -> Self {
        assert!(n <= DWARF_GP_LAST, "not a GP register: DWARF {n}");
        VmLoc::Gpr(n)
    }

    /// The floating point register XMM`n`.
    pub fn xmm(n: u16) -> Self {
        assert!(
            DWARF_FP_BASE + n <= DWARF_FP_LAST,
            "not an XMM register: XMM{n}"
        );
        VmLoc::Fpr(DWARF_FP_BASE + n)
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, VmLoc::Gpr(_) | VmLoc::Fpr(_))
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, VmLoc::Stack(_))
    }

    /// For an `Fpr`, the XMM index (0..=15).
    pub fn xmm_index(&self) -> u16 {
        match self {
            VmLoc::Fpr(n) => n - DWARF_FP_BASE,
            _ => panic!("not an FP register: {self:?}"),
        }
    }
}

/// The closed set of primitive shapes the stub generators marshal. Anything
/// outside this set must have been lowered away before reaching them.
#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq, Eq, Hash)]
pub enum PrimTy {
    Bool,
    I8,
    I16,
    /// An unsigned 16-bit code unit. Distinct from [PrimTy::I16] because it
    /// widens by zero extension where `I16` widens by sign extension.
    Char,
    I32,
    I64,
    F32,
    F64,
    Void,
}

impl PrimTy {
    /// Does a value of this shape travel in the floating point register file?
    pub fn is_fp(&self) -> bool {
        matches!(self, PrimTy::F32 | PrimTy::F64)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, PrimTy::Void)
    }

    /// One-letter code used in generated stub names.
    pub fn code(&self) -> char {
        match self {
            PrimTy::Bool => 'z',
            PrimTy::I8 => 'b',
            PrimTy::I16 => 's',
            PrimTy::Char => 'c',
            PrimTy::I32 => 'i',
            PrimTy::I64 => 'j',
            PrimTy::F32 => 'f',
            PrimTy::F64 => 'd',
            PrimTy::Void => 'v',
        }
    }
}

/// The frame state the collector may observe at one code offset: the frame
/// size and the locations holding live managed references.
///
/// Frame size is measured in 8-byte words and spans from the slot holding the
/// caller's return address down to the stack pointer, inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefMap {
    frame_words: u32,
    live: Vec<VmLoc>,
}

impl RefMap {
    /// A map with no live references, e.g. for a frame whose arguments were
    /// all unwrapped to primitives before the crossing.
    pub fn new(frame_words: u32) -> Self {
        RefMap {
            frame_words,
            live: Vec::new(),
        }
    }

    pub fn with_live(frame_words: u32, live: Vec<VmLoc>) -> Self {
        RefMap { frame_words, live }
    }

    pub fn frame_words(&self) -> u32 {
        self.frame_words
    }

    pub fn live(&self) -> &[VmLoc] {
        &self.live
    }
}

/// Maps code offsets, usually return addresses of calls that can reach a
/// safepoint, to [RefMap]s. Offsets are bytes from the start of the stub.
#[derive(Clone, Debug, Default)]
pub struct RefMapTable {
    maps: Vec<(u32, RefMap)>,
}

impl RefMapTable {
    pub fn new() -> Self {
        RefMapTable { maps: Vec::new() }
    }

    /// Record `map` at `off`. Offsets must be added in strictly ascending
    /// order so lookup can binary search.
    pub fn add(&mut self, off: u32, map: RefMap) {
        if let Some((last, _)) = self.maps.last() {
            assert!(*last < off, "refmap offsets must ascend: {last} then {off}");
        }
        self.maps.push((off, map));
    }

    pub fn get(&self, off: u32) -> Option<&RefMap> {
        self.maps
            .binary_search_by_key(&off, |(o, _)| *o)
            .ok()
            .map(|i| &self.maps[i].1)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, RefMap)> {
        self.maps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmloc_constructors() {
        assert_eq!(VmLoc::gpr(0), VmLoc::Gpr(0));
        assert_eq!(VmLoc::gpr(15), VmLoc::Gpr(15));
        assert_eq!(VmLoc::xmm(0), VmLoc::Fpr(17));
        assert_eq!(VmLoc::xmm(15), VmLoc::Fpr(32));
        assert_eq!(VmLoc::xmm(3).xmm_index(), 3);
    }

    #[test]
    #[should_panic(expected = "not a GP register")]
    fn vmloc_gpr_out_of_range() {
        VmLoc::gpr(16);
    }

    #[test]
    #[should_panic(expected = "not an XMM register")]
    fn vmloc_xmm_out_of_range() {
        VmLoc::xmm(16);
    }

    #[test]
    fn vmloc_kinds() {
        assert!(VmLoc::gpr(3).is_reg());
        assert!(VmLoc::xmm(1).is_reg());
        assert!(!VmLoc::Stack(8).is_reg());
        assert!(VmLoc::Stack(8).is_stack());
    }

    #[test]
    fn primty_files() {
        assert!(PrimTy::F32.is_fp());
        assert!(PrimTy::F64.is_fp());
        for ty in [
            PrimTy::Bool,
            PrimTy::I8,
            PrimTy::I16,
            PrimTy::Char,
            PrimTy::I32,
            PrimTy::I64,
        ] {
            assert!(!ty.is_fp());
        }
        assert!(PrimTy::Void.is_void());
    }

    #[test]
    fn primty_codes_unique() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..u8::try_from(PrimTy::COUNT).unwrap() {
            assert!(seen.insert(PrimTy::from_repr(i).unwrap().code()));
        }
    }

    #[test]
    fn refmap_table_lookup() {
        let mut tbl = RefMapTable::new();
        tbl.add(10, RefMap::new(4));
        tbl.add(42, RefMap::with_live(4, vec![VmLoc::gpr(3)]));
        tbl.add(100, RefMap::new(6));
        assert_eq!(tbl.len(), 3);
        assert_eq!(tbl.get(42).unwrap().live(), &[VmLoc::gpr(3)]);
        assert_eq!(tbl.get(10).unwrap().frame_words(), 4);
        assert!(tbl.get(43).is_none());
    }

    #[test]
    #[should_panic(expected = "offsets must ascend")]
    fn refmap_table_rejects_unordered() {
        let mut tbl = RefMapTable::new();
        tbl.add(42, RefMap::new(4));
        tbl.add(42, RefMap::new(4));
    }
}
