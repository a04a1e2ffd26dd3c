//! Liveness analysis with Belady-style use distances.
//!
//! Backward dataflow to a fixed point, producing for every block the set of
//! values live on its out-edge together with their next-use distances.
//! Distance is measured in instruction positions within a block; crossing a
//! block boundary adds a per-edge penalty, and crossing a call adds a large
//! penalty to everything still live, so values live across calls become the
//! preferred spill candidates.
//!
//! The register allocator combines this inter-block information with exact
//! intra-block use lists it builds itself; inter-block distances are too
//! coarse for spill choice on their own.

use crate::fx::FxHashMap;
use crate::ir::{Block, BlockKind, BranchHint, Func, Opcode, TypeRegistry, Value};
use cranelift_entity::{EntityRef, SecondaryMap};
use log::trace;

/// Edge penalty for a branch hinted likely.
pub const DIST_LIKELY: u32 = 1;
/// Edge penalty for sequential flow and unhinted branches.
pub const DIST_NORMAL: u32 = 10;
/// Edge penalty for a branch hinted unlikely.
pub const DIST_UNLIKELY: u32 = 100;
/// Additional distance for values that stay live across a call.
pub const DIST_CALL: u32 = 100;

/// Per-function liveness results.
pub struct Liveness {
    /// For each block, the values live on exit with their next-use
    /// distance measured from the block's end. Sorted by value id.
    pub live_out: SecondaryMap<Block, Vec<(Value, u32)>>,
}

/// Penalty for the edge `block.succs[succ_idx]`.
pub fn edge_penalty(func: &Func, block: Block, succ_idx: usize) -> u32 {
    let data = func.block(block);
    if data.kind != BlockKind::If {
        return DIST_NORMAL;
    }
    match (data.hint, succ_idx) {
        (BranchHint::Likely, 0) | (BranchHint::Unlikely, 1) => DIST_LIKELY,
        (BranchHint::Likely, 1) | (BranchHint::Unlikely, 0) => DIST_UNLIKELY,
        _ => DIST_NORMAL,
    }
}

/// Compute liveness for `func`.
pub fn compute(func: &Func, types: &TypeRegistry) -> Liveness {
    let mut live_in: SecondaryMap<Block, FxHashMap<Value, u32>> = SecondaryMap::new();
    let mut live_out: SecondaryMap<Block, Vec<(Value, u32)>> = SecondaryMap::new();

    let order = postorder(func);
    let tracked = |func: &Func, v: Value| types.has_runtime_repr(func.value(v).ty);

    let mut changed = true;
    let mut rounds = 0usize;
    while changed {
        changed = false;
        rounds += 1;
        assert!(
            rounds <= 4 * func.num_blocks() + 10,
            "liveness did not converge"
        );

        for &block in &order {
            let block_len = func.block(block).values.len() as u32;

            // Live-out: successors' live-in plus the phi operands we feed
            // them, shifted by the edge penalty.
            let mut live: FxHashMap<Value, u32> = FxHashMap::default();
            for (i, edge) in func.block(block).succs.iter().enumerate() {
                let penalty = edge_penalty(func, block, i);
                for (&v, &d) in &live_in[edge.block] {
                    let d = d.saturating_add(penalty);
                    merge_min(&mut live, v, d);
                }
                for &phi in &func.block(edge.block).values {
                    if func.value(phi).opcode != Opcode::Phi {
                        continue;
                    }
                    let arg = func.value(phi).args[edge.index as usize];
                    if tracked(func, arg) {
                        merge_min(&mut live, arg, penalty);
                    }
                }
            }

            let mut out: Vec<(Value, u32)> = live.iter().map(|(&v, &d)| (v, d)).collect();
            out.sort_unstable();
            live_out[block] = out;

            // Walk the block bottom-up to produce live-in.
            for d in live.values_mut() {
                *d = d.saturating_add(block_len);
            }
            for &c in &func.block(block).control {
                if tracked(func, c) {
                    merge_min(&mut live, c, block_len);
                }
            }
            for i in (0..func.block(block).values.len()).rev() {
                let v = func.block(block).values[i];
                let data = func.value(v);
                live.remove(&v);
                if data.opcode.info().call {
                    for d in live.values_mut() {
                        *d = d.saturating_add(DIST_CALL);
                    }
                }
                if data.opcode == Opcode::Phi {
                    // Phi operands are used in the predecessors.
                    continue;
                }
                for &arg in &data.args {
                    if tracked(func, arg) {
                        merge_min(&mut live, arg, i as u32);
                    }
                }
            }
            // Phi defs never flow into live-in.
            for &v in &func.block(block).values {
                if func.value(v).opcode == Opcode::Phi {
                    live.remove(&v);
                }
            }

            if live_in[block] != live {
                live_in[block] = live;
                changed = true;
            }
        }
    }

    trace!("liveness: {} converged", func.name);
    Liveness { live_out }
}

fn merge_min(map: &mut FxHashMap<Value, u32>, v: Value, d: u32) {
    let entry = map.entry(v).or_insert(d);
    if *entry > d {
        *entry = d;
    }
}

/// Depth-first postorder over the CFG from the entry block, followed by any
/// unreachable blocks in layout order.
fn postorder(func: &Func) -> Vec<Block> {
    let mut seen = vec![false; func.num_blocks()];
    let mut out = Vec::with_capacity(func.num_blocks());
    let entry = func.entry.expand().expect("function without entry");
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    seen[entry.index()] = true;
    loop {
        let (block, next) = match stack.last_mut() {
            Some(&mut (block, ref mut next)) => {
                let i = *next;
                *next += 1;
                (block, i)
            }
            None => break,
        };
        let succs = &func.block(block).succs;
        if next < succs.len() {
            let s = succs[next].block;
            if !seen[s.index()] {
                seen[s.index()] = true;
                stack.push((s, 0));
            }
        } else {
            out.push(block);
            stack.pop();
        }
    }
    for block in func.blocks() {
        if !seen[block.index()] {
            out.push(block);
        }
    }
    out
}
