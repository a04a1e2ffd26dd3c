//! Stack frame layout.
//!
//! Assigns a frame-pointer-relative offset to every local variable and
//! every spill, and computes the final 16-byte-aligned frame size. The
//! frame, from high to low addresses:
//!
//! ```text
//! [ caller frame        ]
//! [ incoming stack args ] <- [FP+16+...]
//! [ saved LR            ] <- [FP+8]
//! [ saved FP            ] <- [FP+0]
//! [ callee-saved saves  ]
//! [ locals              ]
//! [ spill slots         ]
//! [ outgoing args       ] <- [SP]
//! ```
//!
//! Spill slots are reused: two spills share a slot iff they have the same
//! size class and never interfere — a spill interferes with every spill
//! live at its definition, and all spills live across the same call
//! interfere pairwise (they must all survive it).

use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Func, Local, Opcode, TypeRegistry, Value, ValueLoc};
use crate::isa::aarch64::abi::{compute_abi_sig, incoming_stack_offset};
use crate::ir::AbiParam;
use crate::regalloc::RegAllocResult;
use cranelift_entity::SecondaryMap;
use log::trace;

/// The computed frame layout, consumed by the emitter.
pub struct FrameInfo {
    /// Total bytes to subtract from SP after saving FP/LR; 16-aligned.
    pub frame_size: u32,
    /// Bytes of the callee-saved save area (just below FP).
    pub csave_size: u32,
    /// Bytes reserved at SP for outgoing stack arguments.
    pub outgoing_size: u32,
    /// FP-relative byte offset of each local's storage.
    pub local_offsets: SecondaryMap<Local, i32>,
    /// Callee-saved registers to save in the prologue, ascending.
    pub saved_regs: Vec<u8>,
}

fn align_to(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

/// Lay out the frame and assign every spill and local its definitive
/// stack location.
pub fn run(func: &mut Func, types: &TypeRegistry, regalloc: &RegAllocResult) -> FrameInfo {
    let mut saved_regs: Vec<u8> = (0..31u8)
        .filter(|&r| regalloc.used_callee_saved & (1 << r) != 0)
        .collect();
    saved_regs.sort_unstable();
    let csave_size = saved_regs.len() as u32 * 8;

    // Locals in declaration order. Stack-passed parameters already have
    // storage in the caller's frame.
    let abi = compute_abi_sig(&func.sig, types);
    let mut param_locations: FxHashMap<Local, i32> = FxHashMap::default();
    {
        let params: Vec<Local> = func
            .locals
            .keys()
            .filter(|&l| func.locals[l].is_param)
            .collect();
        for (local, param) in params.iter().zip(&abi.params) {
            if let AbiParam::Stack { offset, .. } = param {
                param_locations.insert(*local, incoming_stack_offset(*offset));
            }
        }
    }

    // Only locals whose address is actually taken need storage: fully
    // SSA-promoted locals never touch the frame.
    let mut referenced: FxHashSet<Local> = FxHashSet::default();
    for v in func.values() {
        if let crate::ir::AuxData::LocalVar(local) = func.value(v).aux {
            referenced.insert(local);
        }
    }

    let mut local_offsets: SecondaryMap<Local, i32> = SecondaryMap::new();
    let mut local_cursor = csave_size;
    let locals: Vec<Local> = func.locals.keys().collect();
    for local in locals {
        if let Some(&off) = param_locations.get(&local) {
            local_offsets[local] = off;
            continue;
        }
        if !referenced.contains(&local) {
            continue;
        }
        let data = &func.locals[local];
        let align = types.align(data.ty).max(8);
        let size = align_to(data.size.max(1), 8);
        let pos = align_to(local_cursor, align) + size;
        local_cursor = pos;
        local_offsets[local] = -(pos as i32);
    }

    // Spill slots, with interference-based reuse.
    let spill_order = collect_spills(func);
    let interference = build_interference(func, regalloc);
    let spill_base = align_to(local_cursor, 8);
    let mut slots: Vec<Vec<Value>> = Vec::new();
    for &spill in &spill_order {
        let conflicts = interference.get(&spill);
        let found = slots.iter_mut().position(|slot| {
            slot.iter().all(|&other| {
                conflicts.map_or(true, |set| !set.contains(&other))
            })
        });
        let idx = match found {
            Some(idx) => {
                slots[idx].push(spill);
                idx
            }
            None => {
                slots.push(vec![spill]);
                slots.len() - 1
            }
        };
        let offset = -((spill_base + (idx as u32 + 1) * 8) as i32);
        func.home[spill] = ValueLoc::Stack(offset);
        trace!("stackalloc: {spill} -> slot {idx} at [fp{offset}]");
    }
    let spill_area = slots.len() as u32 * 8;

    // Stack-passed parameter values read straight from the incoming area.
    let arg_stacks: Vec<Value> = func
        .values()
        .filter(|&v| func.value(v).opcode == Opcode::ArgStack)
        .collect();
    for v in arg_stacks {
        let off = func.value(v).aux_int as i32;
        func.home[v] = ValueLoc::Stack(off);
    }

    // Outgoing argument area: the widest stack shape of any call made.
    let mut outgoing_size = 0u32;
    for v in func.values() {
        if func.value(v).opcode == Opcode::A64Call {
            if let crate::ir::AuxData::Call(aux) = &func.value(v).aux {
                outgoing_size = outgoing_size.max(aux.sig.stack_bytes);
            }
        }
    }
    outgoing_size = align_to(outgoing_size, 8);

    let frame_size = align_to(spill_base + spill_area + outgoing_size, 16);
    trace!(
        "stackalloc: {} frame {frame_size} bytes ({} saved, {} spill slots, {} outgoing)",
        func.name,
        csave_size,
        slots.len(),
        outgoing_size
    );

    FrameInfo {
        frame_size,
        csave_size,
        outgoing_size,
        local_offsets,
        saved_regs,
    }
}

/// All spill (`store_reg`) values in program order.
fn collect_spills(func: &Func) -> Vec<Value> {
    let mut out = Vec::new();
    for block in func.blocks() {
        for &v in &func.block(block).values {
            if func.value(v).opcode == Opcode::StoreReg {
                out.push(v);
            }
        }
    }
    out
}

/// The pairwise interference relation between spill values.
fn build_interference(
    func: &Func,
    regalloc: &RegAllocResult,
) -> FxHashMap<Value, FxHashSet<Value>> {
    let mut interference: FxHashMap<Value, FxHashSet<Value>> = FxHashMap::default();
    let mut add = |interference: &mut FxHashMap<Value, FxHashSet<Value>>, a: Value, b: Value| {
        if a != b {
            interference.entry(a).or_default().insert(b);
            interference.entry(b).or_default().insert(a);
        }
    };

    for block in func.blocks() {
        // Spills live across the block end stay live through the whole
        // backward walk unless their store is in this block.
        let mut live: FxHashSet<Value> = regalloc.spill_live[block].iter().copied().collect();
        for &v in func.block(block).values.iter().rev() {
            let data = func.value(v);
            match data.opcode {
                Opcode::LoadReg => {
                    let spill = data.args[0];
                    if func.value(spill).opcode == Opcode::StoreReg {
                        live.insert(spill);
                    }
                }
                Opcode::StoreReg => {
                    for &other in &live {
                        add(&mut interference, v, other);
                    }
                    live.remove(&v);
                }
                _ if data.opcode.info().call => {
                    // Everything live across one call must survive it
                    // together: pairwise interference.
                    let all: Vec<Value> = live.iter().copied().collect();
                    for (i, &a) in all.iter().enumerate() {
                        for &b in &all[i + 1..] {
                            add(&mut interference, a, b);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    interference
}
