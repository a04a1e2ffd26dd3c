//! Merge-edge fixup.
//!
//! A merge block's phis were allocated against one primary predecessor;
//! every other edge may leave phi inputs in the wrong registers. For each
//! predecessor this pass compares the recorded end-of-block register state
//! against what the phis expect and inserts the reconciling moves at the
//! end of the predecessor, with cycle detection: a destination is only
//! written once no unsatisfied destination still reads it, and a remaining
//! cycle is broken through a temporary register (one not involved in the
//! transfer, falling back to x16).
//!
//! Inputs with no source register are rematerialized straight into the
//! destination, or reloaded from their spill slot; a value with neither is
//! an allocator bug and the pass panics rather than guess.
//!
//! The recorded end state is updated as moves are emitted, so running the
//! pass a second time finds every destination satisfied and inserts
//! nothing.

use crate::ir::{Block, Opcode, Value, ValueData, ValueLoc};
use crate::isa::aarch64::regs::{ALLOCATABLE, SPILLTMP};
use crate::regalloc::{Alloc, EndReg};
use log::trace;

#[derive(Clone, Copy, Debug)]
struct Dest {
    dst: u8,
    src: Option<u8>,
    val: Value,
}

impl Alloc<'_> {
    pub(super) fn shuffle(&mut self) {
        let blocks: Vec<Block> = self.func.blocks().collect();
        for block in blocks {
            if self.func.block(block).preds.len() < 2 {
                continue;
            }
            let phis: Vec<Value> = self
                .func
                .block(block)
                .values
                .iter()
                .copied()
                .filter(|&v| self.func.value(v).opcode == Opcode::Phi)
                .collect();
            if phis.is_empty() {
                continue;
            }
            for pi in 0..self.func.block(block).preds.len() {
                self.shuffle_edge(block, pi, &phis);
            }
        }
    }

    fn shuffle_edge(&mut self, block: Block, pi: usize, phis: &[Value]) {
        let pred = self.func.block(block).preds[pi].block;

        // Working copy of the predecessor's end-of-block register state.
        let mut contents: [Option<(Value, Value)>; 32] = [None; 32];
        for &EndReg { reg, v, c } in &self.end_regs[pred] {
            contents[reg as usize] = Some((v, c));
        }

        let mut dests: Vec<Dest> = phis
            .iter()
            .map(|&phi| {
                let dst = self.func.home[phi].unwrap_reg();
                let val = self.func.value(phi).args[pi];
                let src = (0..32u8).find(|&r| {
                    matches!(contents[r as usize], Some((v, _)) if v == val)
                });
                Dest { dst, src, val }
            })
            .collect();

        let mut done = vec![false; dests.len()];
        loop {
            let mut progress = false;
            for k in 0..dests.len() {
                if done[k] {
                    continue;
                }
                let dst = dests[k].dst;
                let still_needed = dests.iter().enumerate().any(|(m, other)| {
                    !done[m] && m != k && other.src == Some(dst)
                });
                if still_needed {
                    continue;
                }
                self.emit_transfer(pred, dests[k], &mut contents);
                done[k] = true;
                progress = true;
            }
            if done.iter().all(|&d| d) {
                break;
            }
            if progress {
                continue;
            }

            // Only a cycle remains. Break it by moving one source aside.
            let k = (0..dests.len())
                .find(|&k| !done[k] && dests[k].src.is_some())
                .expect("register shuffle cycle with no real source");
            let src = dests[k].src.unwrap();
            let temp = self.pick_shuffle_temp(&dests, &done, &contents);
            trace!(
                "shuffle: breaking cycle {}->{} via x{temp} on edge {pred}->{block}",
                src,
                dests[k].dst
            );
            let (v, c) = contents[src as usize].expect("cycle source vanished");
            let copy = self.append_move_to(pred, Opcode::Copy, v, Some(c), temp);
            contents[temp as usize] = Some((v, copy));
            dests[k].src = Some(temp);
        }

        // Persist what the moves did, so a rerun is a no-op.
        let mut ends: Vec<EndReg> = Vec::new();
        for reg in 0..32u8 {
            if ALLOCATABLE & (1u32 << reg) == 0 {
                continue;
            }
            if let Some((v, c)) = contents[reg as usize] {
                ends.push(EndReg { reg, v, c });
            }
        }
        self.end_regs[pred] = ends;
    }

    fn emit_transfer(
        &mut self,
        pred: Block,
        dest: Dest,
        contents: &mut [Option<(Value, Value)>; 32],
    ) {
        match dest.src {
            Some(src) if src == dest.dst => {}
            Some(src) => {
                let (v, c) = contents[src as usize].expect("shuffle source vanished");
                let copy = self.append_move_to(pred, Opcode::Copy, v, Some(c), dest.dst);
                contents[dest.dst as usize] = Some((dest.val, copy));
            }
            None => {
                // Never in a register on this edge: rebuild it from its
                // definition, or reload its spill slot, directly in place.
                // A value with neither a runtime representation nor a
                // spillable definition here is an allocator bug upstream.
                let val = dest.val;
                if self.func.value(val).opcode.is_rematerializable() {
                    let nv = self.append_move_to(pred, Opcode::FwdRef, val, None, dest.dst);
                    contents[dest.dst as usize] = Some((val, nv));
                } else {
                    let spill = match self.spill_of(val) {
                        Some(spill) => spill,
                        // The value crossed the edge only in memory; its
                        // spill store lands after the def, which dominates
                        // this predecessor.
                        None => self.ensure_spill(val),
                    };
                    self.mark_spill_used(val);
                    let load =
                        self.append_move_to(pred, Opcode::LoadReg, spill, None, dest.dst);
                    contents[dest.dst as usize] = Some((val, load));
                }
            }
        }
    }

    /// Append a move-like value at the end of `pred` (before its implicit
    /// terminator; inserted moves never touch the flags, so a trailing
    /// compare stays intact), homed in `dst`.
    ///
    /// `kind` selects the shape: `Copy` of `src_c`, `LoadReg` of the spill
    /// value `v`, or (for `FwdRef` as a marker) a rematerialization clone
    /// of `v`'s definition.
    fn append_move_to(
        &mut self,
        pred: Block,
        kind: Opcode,
        v: Value,
        src_c: Option<Value>,
        dst: u8,
    ) -> Value {
        let data = match kind {
            Opcode::Copy => ValueData::new(Opcode::Copy, self.func.value(v).ty)
                .with_args([src_c.unwrap()])
                .with_pos(self.func.value(v).pos),
            Opcode::LoadReg => ValueData::new(Opcode::LoadReg, self.func.value(v).ty)
                .with_args([v])
                .with_pos(self.func.value(v).pos),
            _ => {
                let def = self.func.value(v);
                debug_assert!(def.args.is_empty());
                ValueData::new(def.opcode, def.ty)
                    .with_aux_int(def.aux_int)
                    .with_aux(def.aux.clone())
                    .with_pos(def.pos)
            }
        };
        let nv = self.func.append_detached(data, pred);
        self.func.block_mut(pred).values.push(nv);
        self.func.home[nv] = ValueLoc::Reg(dst);
        self.note_reg_use(dst);
        nv
    }

    fn pick_shuffle_temp(
        &self,
        dests: &[Dest],
        done: &[bool],
        contents: &[Option<(Value, Value)>; 32],
    ) -> u8 {
        let mut involved: u32 = 0;
        for (k, d) in dests.iter().enumerate() {
            if done[k] {
                continue;
            }
            involved |= 1 << d.dst;
            if let Some(src) = d.src {
                involved |= 1 << src;
            }
        }
        for reg in 0..32u8 {
            if ALLOCATABLE & (1u32 << reg) == 0 {
                continue;
            }
            if involved & (1 << reg) == 0 && contents[reg as usize].is_none() {
                return reg;
            }
        }
        SPILLTMP
    }
}
