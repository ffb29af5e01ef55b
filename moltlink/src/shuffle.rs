//! Argument shuffle planning.
//!
//! A call crossing the managed/native boundary must move every argument from
//! its location under the caller's convention to its location under the
//! callee's. The moves are "parallel" in the sense that all sources are read
//! as of the state before any move executes, so the plan must order them such
//! that no source register is overwritten while still pending, breaking
//! register cycles through a scratch register.

use moltreg::{PrimTy, VmLoc};

/// A single argument move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub ty: PrimTy,
    pub from: VmLoc,
    pub to: VmLoc,
}

/// Plan the argument moves for one boundary crossing.
///
/// `ins` and `outs` are parallel to `tys`: argument `i` of type `tys[i]`
/// moves from `ins[i]` to `outs[i]`. Stack sources are slots in the caller's
/// incoming argument area and stack destinations are slots in the outgoing
/// argument area, so a stack source and a stack destination never alias even
/// when their offsets are equal.
///
/// The returned moves are safe to execute top to bottom. Register self-moves
/// are dropped; a stack pair with equal offsets is a real move between the
/// two areas and is kept. Register cycles are broken by parking one source in
/// `scratch`.
/// Stack to stack moves also stage through `scratch`, but they are never part
/// of a cycle and always drain before a park, so the two uses cannot overlap.
///
/// # Panics
///
/// If `scratch` appears among `ins` or `outs`, or two arguments share a
/// destination.
pub fn plan(tys: &[PrimTy], ins: &[VmLoc], outs: &[VmLoc], scratch: VmLoc) -> Vec<Move> {
    assert_eq!(tys.len(), ins.len());
    assert_eq!(ins.len(), outs.len());
    assert!(scratch.is_reg(), "scratch must be a register: {scratch:?}");
    assert!(
        !ins.contains(&scratch) && !outs.contains(&scratch),
        "scratch register {scratch:?} is part of the shuffle"
    );
    for (i, out) in outs.iter().enumerate() {
        assert!(
            !outs[i + 1..].contains(out),
            "duplicate destination: {out:?}"
        );
    }

    let mut pending = tys
        .iter()
        .zip(ins.iter().zip(outs.iter()))
        .filter(|(_, (i, o))| !(i.is_reg() && i == o))
        .map(|(ty, (from, to))| Move {
            ty: *ty,
            from: *from,
            to: *to,
        })
        .collect::<Vec<_>>();

    let mut planned = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        // A move is ready when no pending move still reads its destination.
        // Stack destinations are always ready.
        let ready = pending.iter().position(|m| {
            !m.to.is_reg() || !pending.iter().any(|o| o.from == m.to)
        });
        match ready {
            Some(i) => planned.push(pending.remove(i)),
            None => {
                // Every pending destination is still read by a pending move:
                // with unique destinations that means every pending move sits
                // on a register cycle. Park the first one's source in the
                // scratch register and retarget its move; the cycle's
                // predecessor becomes ready on the next pass.
                let m = pending[0];
                planned.push(Move {
                    ty: m.ty,
                    from: m.from,
                    to: scratch,
                });
                pending[0].from = scratch;
            }
        }
    }
    planned
}
