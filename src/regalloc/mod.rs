//! Linear-scan register allocation.
//!
//! Three phases per function: initialization, a forward per-block
//! allocation walk, and a merge-edge shuffle ([`shuffle`]). The walk is
//! greedy: arguments are brought into registers where needed
//! (rematerializing constants, reloading spills), outputs take a free
//! register or evict the resident whose next use is farthest away
//! (Belady's rule over the exact intra-block use lists), and calls spill
//! the dirty caller-saved registers whose values live past them.
//!
//! Register state crosses block boundaries through `end_regs`: each
//! processed block records which value occupies which register at its end,
//! merge blocks seed from one deterministic "primary" predecessor, and the
//! shuffle pass reconciles the remaining edges with moves.
//!
//! Every value that produces a runtime result has a `home` location when
//! this pass (plus stack allocation) is done. Allocation failure is a
//! compiler bug: the allocator panics with the value id and register state
//! rather than emit a value without a location.

pub mod register_set;
mod shuffle;

use crate::ir::{
    AuxData, Block, BlockKind, Func, Opcode, TypeRegistry, Value, ValueData, ValueLoc,
};
use crate::isa::aarch64::regs::{
    is_callee_saved, is_caller_saved, RegMask, ALLOCATABLE, RET_REGS,
};
use crate::liveness::Liveness;
use crate::regalloc::register_set::RegisterSet;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{EntitySet, SecondaryMap};
use log::trace;
use smallvec::SmallVec;

/// What register allocation leaves behind for the later phases.
pub struct RegAllocResult {
    /// Callee-saved registers the allocation touched; the prologue must
    /// save them.
    pub used_callee_saved: RegMask,
    /// For each block, the spill values live across its out-edge. Seeds
    /// the stack allocator's interference analysis.
    pub spill_live: SecondaryMap<Block, Vec<Value>>,
    /// Every spill (`store_reg`) value that survived, in creation order.
    pub spills: Vec<Value>,
}

/// One end-of-block register binding: register `reg` holds the SSA value
/// `v`, materialized by `c` (a copy/reload/rematerialization, or `v`
/// itself) whose home is `reg`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EndReg {
    pub reg: u8,
    pub v: Value,
    pub c: Value,
}

#[derive(Clone, Default)]
struct ValState {
    /// Bit per register currently holding this value.
    regs: RegMask,
    /// The spill (`store_reg`) value, created lazily. For stack-passed
    /// parameters this is the parameter value itself.
    spill: PackedOption<Value>,
    /// A reload referenced the spill, so it must be placed.
    spill_used: bool,
    /// Recompute instead of spill/reload.
    remat: bool,
    /// Produces a value that wants a register at all.
    needs_reg: bool,
    /// Remaining use positions in the current block, ascending. Entries
    /// past `cursor` are still pending.
    uses: Vec<u32>,
    cursor: usize,
}

#[derive(Clone, Copy)]
struct RegContent {
    /// The SSA value whose content the register holds.
    v: Value,
    /// The value homed in this register that materializes it here.
    c: Value,
}

/// Insert empty blocks on critical edges (a multi-successor block feeding
/// a multi-predecessor block), so shuffle moves inserted for one edge
/// cannot execute on another.
pub fn split_critical_edges(func: &mut Func) {
    let blocks: Vec<Block> = func.blocks().collect();
    for block in blocks {
        if func.block(block).succs.len() < 2 {
            continue;
        }
        for si in 0..func.block(block).succs.len() {
            let to = func.block(block).succs[si].block;
            if func.block(to).preds.len() >= 2 {
                let mid = func.split_edge(block, si);
                trace!("regalloc: split critical edge {block}->{to} via {mid}");
            }
        }
    }
}

/// Allocate registers for `func`.
pub fn run(func: &mut Func, types: &TypeRegistry, liveness: &Liveness) -> RegAllocResult {
    let mut alloc = Alloc {
        func,
        types,
        liveness,
        state: SecondaryMap::new(),
        regs: [None; 32],
        free: RegisterSet::new(),
        end_regs: SecondaryMap::new(),
        processed: EntitySet::new(),
        spills: Vec::new(),
        used_callee_saved: 0,
        spill_live: SecondaryMap::new(),
    };
    alloc.init();
    let blocks: Vec<Block> = alloc.func.blocks().collect();
    for block in blocks {
        alloc.alloc_block(block);
        alloc.processed.insert(block);
    }
    alloc.shuffle();
    if cfg!(debug_assertions) {
        // Shuffle is idempotent: the recorded end states were updated, so
        // a second pass must find every destination satisfied.
        let count = |alloc: &Alloc| -> usize {
            alloc
                .func
                .blocks()
                .map(|b| alloc.func.block(b).values.len())
                .sum()
        };
        let before = count(&alloc);
        alloc.shuffle();
        assert_eq!(before, count(&alloc), "shuffle inserted copies on rerun");
    }
    alloc.place_spills();

    let spills: Vec<Value> = alloc
        .spills
        .iter()
        .copied()
        .filter(|&s| !alloc.func.is_dead(s))
        .collect();
    RegAllocResult {
        used_callee_saved: alloc.used_callee_saved,
        spill_live: alloc.spill_live,
        spills,
    }
}

pub(crate) struct Alloc<'a> {
    pub(crate) func: &'a mut Func,
    types: &'a TypeRegistry,
    liveness: &'a Liveness,
    state: SecondaryMap<Value, ValState>,
    regs: [Option<RegContent>; 32],
    free: RegisterSet,
    pub(crate) end_regs: SecondaryMap<Block, Vec<EndReg>>,
    processed: EntitySet<Block>,
    spills: Vec<Value>,
    used_callee_saved: RegMask,
    spill_live: SecondaryMap<Block, Vec<Value>>,
}

impl<'a> Alloc<'a> {
    fn init(&mut self) {
        let values: Vec<Value> = self.func.values().collect();
        for v in values {
            let data = self.func.value(v);
            let st = &mut self.state[v];
            st.remat = data.opcode.is_rematerializable();
            st.needs_reg = self.types.has_runtime_repr(data.ty);
            if data.opcode == Opcode::ArgStack {
                st.spill = v.into();
                st.needs_reg = true;
            }
        }
    }

    // ---- small helpers ----

    fn bind(&mut self, reg: u8, v: Value, c: Value) {
        debug_assert!(self.regs[reg as usize].is_none(), "x{reg} already bound");
        if self.free.is_avail(reg) {
            self.free.take(reg);
        }
        self.regs[reg as usize] = Some(RegContent { v, c });
        self.state[v].regs |= 1 << reg;
        if is_callee_saved(reg) {
            self.used_callee_saved |= 1 << reg;
        }
        self.func.home[c] = ValueLoc::Reg(reg);
    }

    fn unbind(&mut self, reg: u8) {
        if let Some(rc) = self.regs[reg as usize].take() {
            self.state[rc.v].regs &= !(1 << reg);
            self.free.free(reg);
        }
    }

    /// The spill value of `v`, if one has been created.
    pub(crate) fn spill_of(&self, v: Value) -> Option<Value> {
        self.state[v].spill.expand()
    }

    /// Note that a reload referenced `v`'s spill.
    pub(crate) fn mark_spill_used(&mut self, v: Value) {
        self.state[v].spill_used = true;
    }

    /// Record that allocation touched `reg` (for the prologue's
    /// callee-saved bookkeeping).
    pub(crate) fn note_reg_use(&mut self, reg: u8) {
        if is_callee_saved(reg) {
            self.used_callee_saved |= 1 << reg;
        }
    }

    fn resident_reg(&self, v: Value) -> Option<u8> {
        let mask = self.state[v].regs;
        if mask == 0 {
            None
        } else {
            Some(mask.trailing_zeros() as u8)
        }
    }

    fn next_use(&self, v: Value) -> Option<u32> {
        let st = &self.state[v];
        st.uses.get(st.cursor).copied()
    }

    /// Any use remaining at all (at the current position or later).
    fn has_remaining_use(&self, v: Value) -> bool {
        let st = &self.state[v];
        st.cursor < st.uses.len()
    }

    /// Any use strictly past position `i`.
    fn live_past(&self, v: Value, i: u32) -> bool {
        let st = &self.state[v];
        st.uses.last().map_or(false, |&d| d > i) && st.cursor < st.uses.len()
    }

    /// The spill value for `v`, created on first demand. The store itself
    /// is placed after `v`'s definition by [`Alloc::place_spills`].
    fn ensure_spill(&mut self, v: Value) -> Value {
        if let Some(s) = self.state[v].spill.expand() {
            return s;
        }
        let block = self.func.value(v).block.expand().unwrap();
        let data = ValueData::new(Opcode::StoreReg, self.func.value(v).ty)
            .with_args([v])
            .with_pos(self.func.value(v).pos);
        let s = self.func.append_detached(data, block);
        trace!("regalloc: spill {s} created for {v}");
        self.state[v].spill = s.into();
        self.spills.push(s);
        s
    }

    /// Free `reg`, preserving its value if it is still needed: discard
    /// rematerializable or otherwise-resident values, spill the rest.
    fn evict(&mut self, reg: u8, i: u32) {
        let rc = match self.regs[reg as usize] {
            Some(rc) => rc,
            None => return,
        };
        let w = rc.v;
        self.unbind(reg);
        if !self.has_remaining_use(w) {
            return;
        }
        if self.state[w].remat || self.state[w].regs != 0 {
            return;
        }
        trace!("regalloc: evict {w} from x{reg} at {i}");
        self.ensure_spill(w);
    }

    /// A register for a new value at position `i`: free if possible, else
    /// the resident with the farthest next use (ties to the lowest
    /// register number). `used` only vetoes *eviction*: a register freed
    /// by an argument dying at this instruction may be reused for the
    /// output (the argument is read before the output is written).
    fn alloc_reg(&mut self, i: u32, used: RegMask) -> u8 {
        if let Some(reg) = self.free.pick(0) {
            return reg;
        }
        let mut best: Option<(u8, u64)> = None;
        for reg in 0..31u8 {
            if ALLOCATABLE & (1 << reg) == 0 || used & (1 << reg) != 0 {
                continue;
            }
            if let Some(rc) = self.regs[reg as usize] {
                let dist = self.next_use(rc.v).map(u64::from).unwrap_or(u64::MAX);
                if best.map_or(true, |(_, d)| dist > d) {
                    best = Some((reg, dist));
                }
            }
        }
        let (reg, _) = best.unwrap_or_else(|| {
            panic!(
                "{}: no allocatable register at position {i} (used {used:#x}, free {:?})",
                self.func.name, self.free
            )
        });
        self.evict(reg, i);
        reg
    }

    /// Make the content of `v` available in a register, materializing a
    /// reload or rematerialization when it is not resident. Returns the
    /// register and the value homed there.
    fn get_in_reg(
        &mut self,
        v: Value,
        i: u32,
        used: RegMask,
        block: Block,
        out: &mut Vec<Value>,
    ) -> (u8, Value) {
        if let Some(reg) = self.resident_reg(v) {
            return (reg, self.regs[reg as usize].unwrap().c);
        }
        let reg = self.alloc_reg(i, used);
        let c = self.materialize(v, block);
        out.push(c);
        self.bind(reg, v, c);
        (reg, c)
    }

    /// A fresh value that recomputes (rematerializable) or reloads
    /// (spilled) `v`. The spill is created on demand when none exists yet:
    /// its store is placed right after `v`'s definition, which dominates
    /// every possible reload, so retroactive creation is always sound.
    fn materialize(&mut self, v: Value, block: Block) -> Value {
        if self.state[v].remat {
            let def = self.func.value(v);
            debug_assert!(def.args.is_empty(), "rematerializable {v} has args");
            let data = ValueData {
                opcode: def.opcode,
                ty: def.ty,
                aux_int: def.aux_int,
                aux: def.aux.clone(),
                args: SmallVec::new(),
                block: None.into(),
                pos: def.pos,
                uses: 0,
            };
            return self.func.append_detached(data, block);
        }
        let spill = self.ensure_spill(v);
        self.state[v].spill_used = true;
        let data = ValueData::new(Opcode::LoadReg, self.func.value(v).ty)
            .with_args([spill])
            .with_pos(self.func.value(v).pos);
        self.func.append_detached(data, block)
    }

    // ---- per-block allocation ----

    fn alloc_block(&mut self, block: Block) {
        let primary = self.seed_registers(block);
        let next_call = self.build_use_lists(block);
        self.alloc_phis(block, primary);

        let snapshot: Vec<Value> = self.func.block(block).values.clone();
        let mut out: Vec<Value> = Vec::with_capacity(snapshot.len());

        for (i, &v) in snapshot.iter().enumerate() {
            let i = i as u32;
            let opcode = self.func.value(v).opcode;
            match opcode {
                Opcode::Phi => out.push(v),
                Opcode::Arg => {
                    let reg = self.func.value(v).aux_int as u8;
                    match self.regs[reg as usize] {
                        Some(rc) if rc.v == v => {}
                        Some(_) => {
                            self.evict(reg, i);
                            self.bind(reg, v, v);
                        }
                        None => self.bind(reg, v, v),
                    }
                    self.func.home[v] = ValueLoc::Reg(reg);
                    out.push(v);
                    self.release_if_dead(v);
                }
                Opcode::ArgStack => {
                    out.push(v);
                }
                Opcode::SelectN => {
                    let call = self.func.value(v).args[0];
                    let n = self.func.value(v).aux_int as usize;
                    let reg = match &self.func.value(call).aux {
                        AuxData::Call(aux) => aux.reg_for_ret(n),
                        _ => panic!("select_n of a non-call"),
                    };
                    debug_assert!(self.regs[reg as usize].is_none());
                    self.bind(reg, v, v);
                    out.push(v);
                    self.release_if_dead(v);
                }
                _ if opcode.info().call => {
                    self.handle_call(block, v, i, &next_call, &mut out);
                }
                _ => {
                    let orig_args: SmallVec<[Value; 3]> =
                        self.func.value(v).args.clone();
                    let mut used: RegMask = 0;
                    for j in 0..orig_args.len() {
                        let a = orig_args[j];
                        if !self.state[a].needs_reg {
                            continue;
                        }
                        let (reg, c) = self.get_in_reg(a, i, used, block, &mut out);
                        used |= 1 << reg;
                        self.func.set_value_arg(v, j, c);
                    }
                    // Release dying arguments first so the output can
                    // reuse their registers; `used` still vetoes evicting
                    // a live argument to hold the output.
                    self.advance_uses(&orig_args, i, next_call[i as usize]);
                    if self.state[v].needs_reg {
                        let reg = self.alloc_reg(i, used);
                        self.bind(reg, v, v);
                    }
                    out.push(v);
                    self.release_if_dead(v);
                }
            }
        }

        let block_len = snapshot.len() as u32;
        self.load_control_values(block, block_len, &mut out);
        self.func.block_mut(block).values = out;
        self.snapshot_end_state(block);
    }

    fn release_if_dead(&mut self, v: Value) {
        if !self.has_remaining_use(v) {
            let mask = self.state[v].regs;
            let mut mask = mask;
            while mask != 0 {
                let reg = mask.trailing_zeros() as u8;
                mask &= mask - 1;
                self.unbind(reg);
            }
        }
    }

    /// Seed register state from the primary (lowest-id, already processed)
    /// predecessor, keeping only values that are live into this block.
    fn seed_registers(&mut self, block: Block) -> Option<Block> {
        for reg in 0..32u8 {
            if self.regs[reg as usize].is_some() {
                self.unbind(reg);
            }
        }
        debug_assert_eq!(self.free, RegisterSet::new());

        let primary = self
            .func
            .block(block)
            .preds
            .iter()
            .map(|e| e.block)
            .filter(|&p| self.processed.contains(p))
            .min();
        let primary = match primary {
            Some(p) => p,
            None => {
                // Entry (or unreachable) block: pre-bind the incoming
                // parameter registers so nothing clobbers them before the
                // arg values claim their homes.
                let params: Vec<(u8, Value)> = self
                    .func
                    .block(block)
                    .values
                    .iter()
                    .filter(|&&v| self.func.value(v).opcode == Opcode::Arg)
                    .map(|&v| (self.func.value(v).aux_int as u8, v))
                    .collect();
                for (reg, v) in params {
                    self.bind(reg, v, v);
                }
                return None;
            }
        };

        let live: crate::fx::FxHashSet<Value> = self.liveness.live_out[primary]
            .iter()
            .map(|&(v, _)| v)
            .collect();
        let ends: Vec<EndReg> = self.end_regs[primary].clone();
        for end in ends {
            if live.contains(&end.v) {
                self.bind(end.reg, end.v, end.c);
                // Use lists are per-block; drop whatever the previous walk
                // left so carried values read as dead until this block's
                // lists are built.
                let st = &mut self.state[end.v];
                st.uses.clear();
                st.cursor = 0;
            }
        }
        Some(primary)
    }

    /// Exact intra-block use positions for every value used in this block,
    /// plus the distance table to the next call.
    fn build_use_lists(&mut self, block: Block) -> Vec<u32> {
        let values = self.func.block(block).values.clone();
        let n = values.len();

        let mut lists: crate::fx::FxHashMap<Value, Vec<u32>> = Default::default();
        for (i, &v) in values.iter().enumerate() {
            if self.func.value(v).opcode == Opcode::Phi {
                continue;
            }
            for &a in &self.func.value(v).args {
                if self.state[a].needs_reg {
                    lists.entry(a).or_default().push(i as u32);
                }
            }
        }
        for &c in &self.func.block(block).control {
            if self.state[c].needs_reg {
                lists.entry(c).or_default().push(n as u32);
            }
        }
        for &(v, d) in &self.liveness.live_out[block] {
            lists
                .entry(v)
                .or_default()
                .push((n as u32).saturating_add(d));
        }

        // Reset lists for every value this block touches (defs included,
        // so dead defs release their registers immediately).
        for &v in &values {
            let st = &mut self.state[v];
            st.uses.clear();
            st.cursor = 0;
        }
        let mut keys: Vec<Value> = lists.keys().copied().collect();
        keys.sort_unstable();
        for v in keys {
            let mut list = lists.remove(&v).unwrap();
            list.sort_unstable();
            let st = &mut self.state[v];
            st.uses = list;
            st.cursor = 0;
        }

        let mut next_call = vec![u32::MAX; n + 1];
        let mut cur = u32::MAX;
        for i in (0..n).rev() {
            if self.func.value(values[i]).opcode.info().call {
                cur = i as u32;
            }
            next_call[i] = cur;
        }
        next_call
    }

    /// Allocate this block's phis in three passes: reuse the primary
    /// predecessor's argument registers (free copies), hand out free
    /// registers, then commit with eviction.
    fn alloc_phis(&mut self, block: Block, primary: Option<Block>) {
        let phis: Vec<Value> = self
            .func
            .block(block)
            .values
            .iter()
            .copied()
            .filter(|&v| self.func.value(v).opcode == Opcode::Phi)
            .collect();
        if phis.is_empty() {
            return;
        }
        let primary_idx = primary.map(|p| {
            self.func
                .block(block)
                .preds
                .iter()
                .position(|e| e.block == p)
                .unwrap()
        });

        let mut assigned: Vec<Option<u8>> = vec![None; phis.len()];
        let mut claimed: RegMask = 0;

        // Pass 1: free copies from the primary edge.
        if let Some(pi) = primary_idx {
            for (k, &phi) in phis.iter().enumerate() {
                let arg = self.func.value(phi).args[pi];
                if let Some(reg) = self.resident_reg(arg) {
                    if claimed & (1 << reg) == 0 {
                        assigned[k] = Some(reg);
                        claimed |= 1 << reg;
                    }
                }
            }
        }
        // Pass 2: free registers for the rest.
        for slot in assigned.iter_mut() {
            if slot.is_none() {
                if let Some(reg) = self.free.pick(claimed) {
                    *slot = Some(reg);
                    claimed |= 1 << reg;
                } else {
                    // No free register: claim an unclaimed resident's.
                    let reg = (0..31u8)
                        .find(|&r| {
                            ALLOCATABLE & (1 << r) != 0 && claimed & (1 << r) == 0
                        })
                        .unwrap_or_else(|| {
                            panic!("{}: more phis than registers in {block}", self.func.name)
                        });
                    *slot = Some(reg);
                    claimed |= 1 << reg;
                }
            }
        }
        // Pass 3: commit, evicting previous residents.
        for (k, &phi) in phis.iter().enumerate() {
            let reg = assigned[k].unwrap();
            if let Some(rc) = self.regs[reg as usize] {
                if rc.v != phi {
                    self.evict(reg, 0);
                }
            }
            self.bind(reg, phi, phi);
            trace!("regalloc: phi {phi} in {block} -> x{reg}");
        }
    }

    /// Pop one pending use per argument occurrence; free the registers of
    /// arguments whose next use is out of reach (none left, or only past
    /// the next call).
    fn advance_uses(&mut self, orig_args: &[Value], i: u32, next_call: u32) {
        for &a in orig_args {
            if !self.state[a].needs_reg {
                continue;
            }
            let st = &mut self.state[a];
            debug_assert!(
                st.uses.get(st.cursor).copied() == Some(i),
                "use list out of sync for {a} at {i}"
            );
            st.cursor += 1;
        }
        for &a in orig_args {
            if !self.state[a].needs_reg {
                continue;
            }
            let release = match self.next_use(a) {
                None => true,
                Some(d) => d > next_call,
            };
            if release {
                self.release_registers_of(a);
            }
        }
    }

    fn release_registers_of(&mut self, v: Value) {
        let mut mask = self.state[v].regs;
        while mask != 0 {
            let reg = mask.trailing_zeros() as u8;
            mask &= mask - 1;
            self.unbind(reg);
        }
    }

    // ---- calls ----

    fn handle_call(
        &mut self,
        block: Block,
        v: Value,
        i: u32,
        next_call: &[u32],
        out: &mut Vec<Value>,
    ) {
        let (arg_regs, ret_regs): (SmallVec<[u8; 8]>, SmallVec<[u8; 2]>) =
            match &self.func.value(v).aux {
                AuxData::Call(aux) => (aux.arg_regs.clone(), aux.ret_regs.clone()),
                aux => panic!("{}: call {v} without descriptor ({aux:?})", self.func.name),
            };
        let orig_args: SmallVec<[Value; 3]> = self.func.value(v).args.clone();
        assert_eq!(
            orig_args.len(),
            arg_regs.len(),
            "{}: call {v} argument/constraint mismatch",
            self.func.name
        );

        // Spill dirty caller-saved residents that live past the call. The
        // spill store lands just after the value's def, so the register
        // content can simply be dropped when the call clobbers it.
        for reg in 0..31u8 {
            if ALLOCATABLE & (1 << reg) == 0 || !is_caller_saved(reg) {
                continue;
            }
            if let Some(rc) = self.regs[reg as usize] {
                let w = rc.v;
                if self.live_past(w, i)
                    && !self.state[w].remat
                    && self.state[w].spill.is_none()
                {
                    trace!("regalloc: {w} live across call {v}, spilling");
                    self.ensure_spill(w);
                }
            }
        }

        // Move every argument into its ABI register.
        let constraint_mask: RegMask =
            arg_regs.iter().fold(0, |mask, &reg| mask | (1 << reg));
        let mut used: RegMask = 0;
        for j in 0..orig_args.len() {
            let a = orig_args[j];
            let target = arg_regs[j];
            if let Some(rc) = self.regs[target as usize] {
                if rc.v == a {
                    self.func.set_value_arg(v, j, rc.c);
                    used |= 1 << target;
                    continue;
                }
                self.vacate(target, used | constraint_mask, block, out);
            }
            let c = if let Some(reg) = self.resident_reg(a) {
                let src = self.regs[reg as usize].unwrap().c;
                let copy = self.func.append_detached(
                    ValueData::new(Opcode::Copy, self.func.value(a).ty)
                        .with_args([src])
                        .with_pos(self.func.value(a).pos),
                    block,
                );
                out.push(copy);
                copy
            } else {
                let c = self.materialize(a, block);
                out.push(c);
                c
            };
            self.bind(target, a, c);
            self.func.set_value_arg(v, j, c);
            used |= 1 << target;
        }

        self.advance_uses(&orig_args, i, next_call[i as usize]);
        out.push(v);

        // The call clobbers every caller-saved register.
        for reg in 0..31u8 {
            if ALLOCATABLE & (1 << reg) != 0
                && is_caller_saved(reg)
                && self.regs[reg as usize].is_some()
            {
                self.unbind(reg);
            }
        }

        // Bind the result. Multi-register results are claimed by the
        // following select_n values instead.
        if !ret_regs.is_empty() && self.state[v].needs_reg {
            self.bind(ret_regs[0], v, v);
            self.release_if_dead(v);
        }
    }

    /// Empty `target` before a forced move, preserving the old resident:
    /// copy it to a free register outside `forbidden` when it is still
    /// needed and unrecoverable, spill otherwise.
    fn vacate(&mut self, target: u8, forbidden: RegMask, block: Block, out: &mut Vec<Value>) {
        let rc = match self.regs[target as usize] {
            Some(rc) => rc,
            None => return,
        };
        let w = rc.v;
        self.unbind(target);
        if !self.has_remaining_use(w) {
            return;
        }
        if self.state[w].remat || self.state[w].regs != 0 || self.state[w].spill.is_some() {
            return;
        }
        if let Some(reg) = self.free.pick(forbidden) {
            let copy = self.func.append_detached(
                ValueData::new(Opcode::Copy, self.func.value(w).ty)
                    .with_args([rc.c])
                    .with_pos(self.func.value(w).pos),
                block,
            );
            out.push(copy);
            self.bind(reg, w, copy);
        } else {
            self.ensure_spill(w);
        }
    }

    // ---- block ends ----

    /// Bring the block's control values into registers. Return blocks move
    /// their control values into the ABI result registers; branch controls
    /// only need to be resident somewhere.
    fn load_control_values(&mut self, block: Block, block_len: u32, out: &mut Vec<Value>) {
        match self.func.block(block).kind {
            BlockKind::Plain | BlockKind::Exit => {}
            BlockKind::If => {
                let control = self.func.block(block).control.clone();
                for (j, &c) in control.iter().enumerate() {
                    if !self.state[c].needs_reg {
                        continue; // flags feed the branch directly
                    }
                    let (_, cv) = self.get_in_reg(c, block_len, 0, block, out);
                    self.func.set_control_entry(block, j, cv);
                }
            }
            BlockKind::Ret => {
                let control = self.func.block(block).control.clone();
                let mut used: RegMask = 0;
                for (j, &c) in control.iter().enumerate() {
                    let target = RET_REGS[j];
                    if let Some(rc) = self.regs[target as usize] {
                        if rc.v == c {
                            self.func.set_control_entry(block, j, rc.c);
                            used |= 1 << target;
                            continue;
                        }
                        let ret_mask =
                            (1u32 << RET_REGS[0]) | (1 << RET_REGS[1]);
                        self.vacate(target, used | ret_mask, block, out);
                    }
                    let cv = if let Some(reg) = self.resident_reg(c) {
                        let src = self.regs[reg as usize].unwrap().c;
                        let copy = self.func.append_detached(
                            ValueData::new(Opcode::Copy, self.func.value(c).ty)
                                .with_args([src])
                                .with_pos(self.func.value(c).pos),
                            block,
                        );
                        out.push(copy);
                        copy
                    } else {
                        let cv = self.materialize(c, block);
                        out.push(cv);
                        cv
                    };
                    self.bind(target, c, cv);
                    self.func.set_control_entry(block, j, cv);
                    used |= 1 << target;
                }
            }
        }
    }

    fn snapshot_end_state(&mut self, block: Block) {
        let mut ends = Vec::new();
        for reg in 0..31u8 {
            if ALLOCATABLE & (1 << reg) == 0 {
                continue;
            }
            if let Some(rc) = self.regs[reg as usize] {
                ends.push(EndReg {
                    reg,
                    v: rc.v,
                    c: rc.c,
                });
            }
        }
        self.end_regs[block] = ends;

        let mut live_spills = Vec::new();
        for &(v, _) in &self.liveness.live_out[block] {
            if let Some(s) = self.state[v].spill.expand() {
                if s != v {
                    live_spills.push(s);
                }
            }
        }
        self.spill_live[block] = live_spills;
    }

    // ---- spill placement ----

    /// Insert each used spill store just after its value's definition (the
    /// register is guaranteed to still hold the value there); drop spills
    /// nothing ever reloaded.
    fn place_spills(&mut self) {
        let spills = self.spills.clone();
        for s in spills {
            if self.func.value(s).uses == 0 {
                let v = self.func.value(s).args[0];
                trace!("regalloc: dropping unused spill {s} of {v}");
                self.state[v].spill = None.into();
                self.func.free_value(s);
                continue;
            }
            let v = self.func.value(s).args[0];
            let block = self.func.value(v).block.expand().unwrap();
            let values = &self.func.block(block).values;
            let at = match self.func.value(v).opcode {
                // Phi and parameter homes are written at block entry;
                // store after the whole leading cluster.
                Opcode::Phi | Opcode::Arg | Opcode::ArgStack => values
                    .iter()
                    .take_while(|&&x| {
                        matches!(
                            self.func.value(x).opcode,
                            Opcode::Phi | Opcode::Arg | Opcode::ArgStack
                        )
                    })
                    .count(),
                _ => {
                    values
                        .iter()
                        .position(|&x| x == v)
                        .unwrap_or_else(|| {
                            panic!("{}: spilled {v} not in {block}", self.func.name)
                        })
                        + 1
                }
            };
            self.func.block_mut(block).values.insert(at, s);
        }
    }
}
