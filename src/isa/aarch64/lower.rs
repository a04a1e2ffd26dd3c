//! Instruction selection: target-independent ops to ARM64 ops.
//!
//! A pattern-directed, in-place rewrite over each block. Every rewrite
//! preserves semantics and value identity where it can: a value usually
//! keeps its id and changes opcode, so uses never need rewiring. The pass
//! also:
//!
//! - folds small constants into immediate instruction forms;
//! - fuses a comparison with its single branch use into a flags-producing
//!   `cmp` scheduled as the final value of its block, recording the
//!   condition code on the block; data uses of comparisons become fused
//!   CMP+CSET ops so nothing can be scheduled between the flag def and use;
//! - splits two-word values (strings, slices, small pairs) into word
//!   components, introducing `select_n` after calls and per-component phis;
//! - expands calls: register arguments gain explicit constraints in the
//!   call descriptor, stack arguments become SP-relative stores, oversized
//!   results route through the hidden x8 pointer.
//!
//! Rematerializability is preserved: `movz`, `movn`, the constant sequence
//! op and the symbol-address op stay rematerializable so the register
//! allocator can rebuild them into any destination register.

use crate::fx::FxHashMap;
use crate::ir::{
    self, AuxCall, AuxData, Block, BlockKind, Func, IntCC, Opcode, PassClass, Signature,
    SymRef, TypeRegistry, Value, ValueData,
};
use crate::isa::aarch64::abi::compute_abi_sig;
use crate::isa::aarch64::imms::{Imm12, ImmLogic, ImmShift, MoveWideConst};
use log::trace;
use smallvec::SmallVec;

/// The runtime symbol for string concatenation.
pub const STR_CONCAT_FN: &str = "__cot_str_concat";

/// Lower `func` from generic SSA to ARM64 SSA, in place.
pub fn lower(func: &mut Func, types: &TypeRegistry) {
    // Lowering rewrites constant ops in place, which invalidates the
    // builder's structural cache keys.
    func.clear_const_cache();
    let mut cx = LowerCtx {
        types,
        components: FxHashMap::default(),
    };

    // Pair-typed phis first: the component phis must exist before any
    // operand block reads them.
    let blocks: Vec<Block> = func.blocks().collect();
    let mut pair_phis: Vec<Value> = Vec::new();
    for &block in &blocks {
        let phis: Vec<Value> = func
            .block(block)
            .values
            .iter()
            .copied()
            .filter(|&v| {
                func.value(v).opcode == Opcode::Phi
                    && types.class(func.value(v).ty) == PassClass::Pair
            })
            .collect();
        for phi in phis {
            let pos = func.value(phi).pos;
            let lo = func.insert_value(
                block,
                0,
                ValueData::new(Opcode::Phi, ir::types::I64).with_pos(pos),
            );
            let hi = func.insert_value(
                block,
                1,
                ValueData::new(Opcode::Phi, ir::types::I64).with_pos(pos),
            );
            cx.components.insert(phi, (lo, hi));
            pair_phis.push(phi);
        }
    }

    for &block in &blocks {
        cx.lower_block(func, block);
    }

    // Now every pair value has components: fill the split phis and drop the
    // pair shells' operands.
    for phi in pair_phis {
        let (lo, hi) = cx.components[&phi];
        let args: Vec<Value> = func.value(phi).args.to_vec();
        for arg in args {
            let (alo, ahi) = cx.component_pair(func, arg);
            func.push_value_arg(lo, alo);
            func.push_value_arg(hi, ahi);
        }
        func.clear_value_args(phi);
    }

    func.sweep_dead_values();
}

struct LowerCtx<'a> {
    types: &'a TypeRegistry,
    /// Word components of every two-word value.
    components: FxHashMap<Value, (Value, Value)>,
}

impl<'a> LowerCtx<'a> {
    fn component_pair(&self, func: &Func, v: Value) -> (Value, Value) {
        *self.components.get(&v).unwrap_or_else(|| {
            panic!(
                "{}: no components for {} ({})",
                func.name,
                v,
                func.value(v).opcode
            )
        })
    }

    fn lower_block(&mut self, func: &mut Func, block: Block) {
        let snapshot: Vec<Value> = func.block(block).values.clone();
        let mut out: Vec<Value> = Vec::with_capacity(snapshot.len());
        // A branch-fused compare goes last so the flags reach the
        // terminator intact.
        let mut branch_cmp: Option<Value> = None;

        for v in snapshot {
            self.lower_value(func, block, v, &mut out, &mut branch_cmp);
        }

        if let Some(cmp) = branch_cmp {
            out.push(cmp);
        }
        func.block_mut(block).values = out;

        // Split pair-typed return values into their word components.
        if func.block(block).kind == BlockKind::Ret {
            let control = func.block(block).control.clone();
            if control.len() == 1 {
                let v = control[0];
                if self.types.class(func.value(v).ty) == PassClass::Pair {
                    let (lo, hi) = self.component_pair(func, v);
                    func.set_control(block, &[lo, hi]);
                }
            }
        }
    }

    fn lower_value(
        &mut self,
        func: &mut Func,
        block: Block,
        v: Value,
        out: &mut Vec<Value>,
        branch_cmp: &mut Option<Value>,
    ) {
        use Opcode::*;
        let opcode = func.value(v).opcode;
        let pos = func.value(v).pos;
        match opcode {
            // Pseudo ops the later phases understand directly.
            Phi | Copy | Arg | ArgStack => out.push(v),

            ConstInt => {
                let bits = func.value(v).aux_int as u64;
                let op = const_op(bits);
                func.value_mut(v).opcode = op;
                out.push(v);
            }

            ConstStr => {
                let lit = match func.value(v).aux {
                    AuxData::Str(s) => s,
                    _ => panic!("const_str without literal"),
                };
                let len = func.strings[lit].len() as u64;
                let addr = func.append_detached(
                    ValueData::new(A64SymAddr, ir::types::PTR)
                        .with_aux(AuxData::Sym(SymRef::Str(lit)))
                        .with_pos(pos),
                    block,
                );
                let len_val = func.append_detached(
                    ValueData::new(const_op(len), ir::types::I64)
                        .with_aux_int(len as i64)
                        .with_pos(pos),
                    block,
                );
                out.push(addr);
                out.push(len_val);
                self.components.insert(v, (addr, len_val));
            }

            MakeTuple => {
                let args = &func.value(v).args;
                self.components.insert(v, (args[0], args[1]));
            }

            LocalAddr => {
                func.value_mut(v).opcode = A64LocalAddr;
                out.push(v);
            }
            GlobalAddr => {
                func.value_mut(v).opcode = A64SymAddr;
                out.push(v);
            }

            Load => self.lower_load(func, block, v, out),
            Store => self.lower_store(func, block, v, out),

            Add | Sub => self.lower_addsub(func, v, out),
            Mul => {
                func.value_mut(v).opcode = A64Mul;
                out.push(v);
            }
            Div => {
                let signed = self.types.is_signed(func.value(v).ty);
                func.value_mut(v).opcode = if signed { A64SDiv } else { A64UDiv };
                out.push(v);
            }
            Rem => {
                let signed = self.types.is_signed(func.value(v).ty);
                let (a, b) = (func.value(v).args[0], func.value(v).args[1]);
                let ty = func.value(v).ty;
                let q = func.append_detached(
                    ValueData::new(if signed { A64SDiv } else { A64UDiv }, ty)
                        .with_args([a, b])
                        .with_pos(pos),
                    block,
                );
                out.push(q);
                // rem = a - q * b
                replace_op(func, v, A64MSub, &[q, b, a]);
                out.push(v);
            }

            And => self.lower_logical(func, v, A64And, A64AndImm, out),
            Or => self.lower_logical(func, v, A64Orr, A64OrrImm, out),
            Xor => self.lower_logical(func, v, A64Eor, A64EorImm, out),

            Shl => self.lower_shift(func, v, A64Lsl, A64LslImm, out),
            Shr => {
                let signed = self.types.is_signed(func.value(func.value(v).args[0]).ty);
                if signed {
                    self.lower_shift(func, v, A64Asr, A64AsrImm, out);
                } else {
                    self.lower_shift(func, v, A64Lsr, A64LsrImm, out);
                }
            }

            Neg => {
                func.value_mut(v).opcode = A64Neg;
                out.push(v);
            }
            Not => {
                func.value_mut(v).opcode = A64Mvn;
                out.push(v);
            }

            Eq | Ne | Lt | Le | Gt | Ge => {
                self.lower_compare(func, block, v, out, branch_cmp)
            }

            Select => {
                func.value_mut(v).opcode = A64CSel;
                out.push(v);
            }

            Sext => self.lower_extend(func, v, true, out),
            Uext => self.lower_extend(func, v, false, out),
            Trunc => {
                let to = func.value(v).ty;
                let op = match (self.types.size(to), self.types.is_signed(to)) {
                    (1, true) => A64Sxtb,
                    (1, false) => A64Uxtb,
                    (2, true) => A64Sxth,
                    (2, false) => A64Uxth,
                    (4, true) => A64Sxtw,
                    (4, false) => A64Uxtw,
                    (8, _) => Copy,
                    (size, _) => panic!("trunc to {size}-byte type"),
                };
                func.value_mut(v).opcode = op;
                out.push(v);
            }

            NilCheck => {
                func.value_mut(v).opcode = A64NilCheck;
                out.push(v);
            }

            Call => self.lower_call(func, block, v, None, out),
            StrConcat => {
                let sig = Signature::new(
                    vec![ir::types::STR, ir::types::STR],
                    ir::types::STR,
                );
                let aux = AuxCall::new(STR_CONCAT_FN, compute_abi_sig(&sig, self.types));
                self.lower_call(func, block, v, Some(aux), out);
            }

            SelectN | StoreReg | LoadReg => {
                panic!("{}: {opcode} before regalloc", func.name)
            }
            FwdRef => panic!("{}: fwd_ref survived SSA construction", func.name),
            RetSlotAddr => panic!("{}: ret_slot_addr survived SSA construction", func.name),

            _ => {
                assert!(
                    !opcode.is_generic(),
                    "{}: unhandled generic op {opcode}",
                    func.name
                );
                out.push(v);
            }
        }
    }

    fn lower_addsub(&mut self, func: &mut Func, v: Value, out: &mut Vec<Value>) {
        use Opcode::*;
        let sub = func.value(v).opcode == Sub;
        let (mut a, mut b) = (func.value(v).args[0], func.value(v).args[1]);
        if !sub {
            // Put a foldable constant on the right.
            if const_value(func, a).is_some() && const_value(func, b).is_none() {
                core::mem::swap(&mut a, &mut b);
            }
        }
        if let Some(k) = const_value(func, b) {
            let k = k as i64;
            let (imm_op, magnitude) = if (k < 0) != sub {
                (A64SubImm, k.unsigned_abs())
            } else {
                (A64AddImm, k.unsigned_abs())
            };
            if Imm12::maybe_from_u64(magnitude).is_some() {
                let aux = magnitude as i64;
                replace_op(func, v, imm_op, &[a]);
                func.value_mut(v).aux_int = aux;
                out.push(v);
                return;
            }
        }
        replace_op(func, v, if sub { A64Sub } else { A64Add }, &[a, b]);
        out.push(v);
    }

    fn lower_logical(
        &mut self,
        func: &mut Func,
        v: Value,
        reg_op: Opcode,
        imm_op: Opcode,
        out: &mut Vec<Value>,
    ) {
        let (mut a, mut b) = (func.value(v).args[0], func.value(v).args[1]);
        if const_value(func, a).is_some() && const_value(func, b).is_none() {
            core::mem::swap(&mut a, &mut b);
        }
        if let Some(k) = const_value(func, b) {
            if ImmLogic::maybe_from_u64(k).is_some() {
                replace_op(func, v, imm_op, &[a]);
                func.value_mut(v).aux_int = k as i64;
                out.push(v);
                return;
            }
        }
        replace_op(func, v, reg_op, &[a, b]);
        out.push(v);
    }

    fn lower_shift(
        &mut self,
        func: &mut Func,
        v: Value,
        reg_op: Opcode,
        imm_op: Opcode,
        out: &mut Vec<Value>,
    ) {
        let (a, b) = (func.value(v).args[0], func.value(v).args[1]);
        if let Some(k) = const_value(func, b) {
            if k == 0 {
                replace_op(func, v, Opcode::Copy, &[a]);
                out.push(v);
                return;
            }
            if ImmShift::maybe_from_u64(k).is_some() {
                replace_op(func, v, imm_op, &[a]);
                func.value_mut(v).aux_int = k as i64;
                out.push(v);
                return;
            }
        }
        replace_op(func, v, reg_op, &[a, b]);
        out.push(v);
    }

    fn lower_extend(&mut self, func: &mut Func, v: Value, signed: bool, out: &mut Vec<Value>) {
        use Opcode::*;
        let from = func.value(func.value(v).args[0]).ty;
        let op = match (self.types.size(from), signed) {
            (1, true) => A64Sxtb,
            (1, false) => A64Uxtb,
            (2, true) => A64Sxth,
            (2, false) => A64Uxth,
            (4, true) => A64Sxtw,
            (4, false) => A64Uxtw,
            (8, _) => Copy,
            (size, _) => panic!("extend from {size}-byte type"),
        };
        func.value_mut(v).opcode = op;
        out.push(v);
    }

    fn lower_compare(
        &mut self,
        func: &mut Func,
        block: Block,
        v: Value,
        out: &mut Vec<Value>,
        branch_cmp: &mut Option<Value>,
    ) {
        use Opcode::*;
        let data = func.value(v);
        let (mut a, mut b) = (data.args[0], data.args[1]);
        let signed = self.types.is_signed(func.value(a).ty);
        let mut cc = match data.opcode {
            Eq => IntCC::Equal,
            Ne => IntCC::NotEqual,
            Lt if signed => IntCC::SignedLessThan,
            Lt => IntCC::UnsignedLessThan,
            Le if signed => IntCC::SignedLessThanOrEqual,
            Le => IntCC::UnsignedLessThanOrEqual,
            Gt if signed => IntCC::SignedGreaterThan,
            Gt => IntCC::UnsignedGreaterThan,
            Ge if signed => IntCC::SignedGreaterThanOrEqual,
            Ge => IntCC::UnsignedGreaterThanOrEqual,
            op => panic!("not a comparison: {op}"),
        };
        assert_ne!(
            self.types.class(func.value(a).ty),
            PassClass::Pair,
            "{}: pair comparison must be lowered by the frontend",
            func.name
        );

        // Put a foldable constant on the right.
        if const_value(func, a).is_some() && const_value(func, b).is_none() {
            core::mem::swap(&mut a, &mut b);
            cc = cc.swap_args();
        }
        let imm = const_value(func, b)
            .filter(|&k| Imm12::maybe_from_u64(k).is_some())
            .map(|k| k as i64);

        let is_branch = {
            let blk = func.block(block);
            blk.kind == BlockKind::If
                && blk.control.first() == Some(&v)
                && func.value(v).uses == 1
        };
        if is_branch {
            // Becomes the block-final flags def; the branch reads `cc`.
            match imm {
                Some(k) => {
                    replace_op(func, v, A64CmpImm, &[a]);
                    func.value_mut(v).aux_int = k;
                }
                None => replace_op(func, v, A64Cmp, &[a, b]),
            }
            func.value_mut(v).ty = ir::types::FLAGS;
            func.block_mut(block).cond = Some(cc);
            debug_assert!(branch_cmp.is_none(), "two branch compares in {block}");
            *branch_cmp = Some(v);
        } else {
            // Data use: fuse compare and CSET into one op so nothing can
            // come between the flag def and its use.
            match imm {
                Some(k) => {
                    replace_op(func, v, A64CmpImmSet, &[a]);
                    func.value_mut(v).aux_int = k;
                }
                None => replace_op(func, v, A64CmpSet, &[a, b]),
            }
            func.value_mut(v).aux = AuxData::Cond(cc);
            out.push(v);
        }
    }

    fn lower_load(&mut self, func: &mut Func, block: Block, v: Value, out: &mut Vec<Value>) {
        let ty = func.value(v).ty;
        let addr = func.value(v).args[0];
        let pos = func.value(v).pos;
        if self.types.class(ty) == PassClass::Pair {
            let lo = func.append_detached(
                ValueData::new(Opcode::A64Ldr, ir::types::I64)
                    .with_args([addr])
                    .with_pos(pos),
                block,
            );
            let hi = func.append_detached(
                ValueData::new(Opcode::A64Ldr, ir::types::I64)
                    .with_args([addr])
                    .with_aux_int(8)
                    .with_pos(pos),
                block,
            );
            out.push(lo);
            out.push(hi);
            self.components.insert(v, (lo, hi));
            return;
        }
        let op = load_op(self.types.size(ty), self.types.is_signed(ty));
        let (base, off) = fold_address(func, addr, self.types.size(ty).min(8));
        replace_op(func, v, op, &[base]);
        func.value_mut(v).aux_int = off;
        out.push(v);
    }

    fn lower_store(&mut self, func: &mut Func, block: Block, v: Value, out: &mut Vec<Value>) {
        let addr = func.value(v).args[0];
        let val = func.value(v).args[1];
        let ty = func.value(val).ty;
        let pos = func.value(v).pos;
        if self.types.class(ty) == PassClass::Pair {
            let (lo, hi) = self.component_pair(func, val);
            replace_op(func, v, Opcode::A64Str, &[lo, addr]);
            func.value_mut(v).aux_int = 0;
            out.push(v);
            let second = func.append_detached(
                ValueData::new(Opcode::A64Str, ir::types::VOID)
                    .with_args([hi, addr])
                    .with_aux_int(8)
                    .with_pos(pos),
                block,
            );
            out.push(second);
            return;
        }
        let op = store_op(self.types.size(ty));
        let (base, off) = fold_address(func, addr, self.types.size(ty).min(8));
        replace_op(func, v, op, &[val, base]);
        func.value_mut(v).aux_int = off;
        out.push(v);
    }

    fn lower_call(
        &mut self,
        func: &mut Func,
        block: Block,
        v: Value,
        runtime_aux: Option<AuxCall>,
        out: &mut Vec<Value>,
    ) {
        let pos = func.value(v).pos;
        let mut aux = match runtime_aux {
            Some(aux) => aux,
            None => match core::mem::take(&mut func.value_mut(v).aux) {
                AuxData::Call(b) => *b,
                _ => panic!("{}: call without descriptor", func.name),
            },
        };
        let old_args: Vec<Value> = func.value(v).args.to_vec();
        let mut new_args: SmallVec<[Value; 3]> = SmallVec::new();
        let mut arg_regs: SmallVec<[u8; 8]> = SmallVec::new();

        let mut old_iter = old_args.into_iter();
        if aux.sig.uses_hidden_return {
            let addr = old_iter.next().expect("missing hidden return address");
            new_args.push(addr);
            arg_regs.push(crate::isa::aarch64::regs::HIDDEN_RET);
        }

        let params = aux.sig.params.clone();
        for param in &params {
            let arg = old_iter.next().expect("missing call argument");
            let class = self.types.class(func.value(arg).ty);
            match param {
                ir::AbiParam::Reg(regs) => match class {
                    PassClass::Word => {
                        new_args.push(arg);
                        arg_regs.push(regs[0]);
                    }
                    PassClass::Pair => {
                        let (lo, hi) = self.component_pair(func, arg);
                        new_args.push(lo);
                        arg_regs.push(regs[0]);
                        new_args.push(hi);
                        arg_regs.push(regs[1]);
                    }
                    class => panic!("register argument of class {class:?}"),
                },
                ir::AbiParam::Stack { offset, size } => match class {
                    PassClass::Word => {
                        let st = func.append_detached(
                            ValueData::new(Opcode::A64StoreArg, ir::types::VOID)
                                .with_args([arg])
                                .with_aux_int(*offset as i64)
                                .with_pos(pos),
                            block,
                        );
                        out.push(st);
                    }
                    PassClass::Pair => {
                        let (lo, hi) = self.component_pair(func, arg);
                        for (part, off) in [(lo, *offset), (hi, *offset + 8)] {
                            let st = func.append_detached(
                                ValueData::new(Opcode::A64StoreArg, ir::types::VOID)
                                    .with_args([part])
                                    .with_aux_int(off as i64)
                                    .with_pos(pos),
                                block,
                            );
                            out.push(st);
                        }
                    }
                    PassClass::Memory => {
                        // The frontend passes oversized values by naming
                        // their storage; copy it word by word into the
                        // outgoing area.
                        let mut off = 0i64;
                        while off < *size as i64 {
                            let word = func.append_detached(
                                ValueData::new(Opcode::A64Ldr, ir::types::I64)
                                    .with_args([arg])
                                    .with_aux_int(off)
                                    .with_pos(pos),
                                block,
                            );
                            out.push(word);
                            let st = func.append_detached(
                                ValueData::new(Opcode::A64StoreArg, ir::types::VOID)
                                    .with_args([word])
                                    .with_aux_int(*offset as i64 + off)
                                    .with_pos(pos),
                                block,
                            );
                            out.push(st);
                            off += 8;
                        }
                        // The address itself is no longer an argument.
                    }
                    class => panic!("stack argument of class {class:?}"),
                },
            }
        }
        assert!(old_iter.next().is_none(), "extra call arguments");

        aux.arg_regs = arg_regs;
        aux.ret_regs = aux.sig.ret_regs.clone();

        let ret_class = self.types.class(func.value(v).ty);
        func.clear_value_args(v);
        func.value_mut(v).opcode = Opcode::A64Call;
        for arg in new_args {
            func.push_value_arg(v, arg);
        }
        func.value_mut(v).aux = AuxData::Call(Box::new(aux));
        out.push(v);
        trace!("lower: {} call -> arm64_call in {}", func.name, block);

        if ret_class == PassClass::Pair {
            func.value_mut(v).ty = ir::types::TUPLE2;
            let lo = func.append_detached(
                ValueData::new(Opcode::SelectN, ir::types::I64)
                    .with_args([v])
                    .with_pos(pos),
                block,
            );
            let hi = func.append_detached(
                ValueData::new(Opcode::SelectN, ir::types::I64)
                    .with_args([v])
                    .with_aux_int(1)
                    .with_pos(pos),
                block,
            );
            out.push(lo);
            out.push(hi);
            self.components.insert(v, (lo, hi));
        }
    }
}

/// The constant bits of a (possibly already lowered) constant value.
fn const_value(func: &Func, v: Value) -> Option<u64> {
    use Opcode::*;
    match func.value(v).opcode {
        ConstInt | A64Movz | A64Movn | A64LoadConst => Some(func.value(v).aux_int as u64),
        _ => None,
    }
}

/// The cheapest op that materializes `bits`.
fn const_op(bits: u64) -> Opcode {
    if MoveWideConst::maybe_from_u64(bits).is_some() {
        Opcode::A64Movz
    } else if MoveWideConst::maybe_from_u64(!bits).is_some() {
        Opcode::A64Movn
    } else {
        Opcode::A64LoadConst
    }
}

fn load_op(size: u32, signed: bool) -> Opcode {
    use Opcode::*;
    match (size, signed) {
        (1, false) => A64Ldrb,
        (1, true) => A64Ldrsb,
        (2, false) => A64Ldrh,
        (2, true) => A64Ldrsh,
        (4, false) => A64Ldrw,
        (4, true) => A64Ldrsw,
        (8, _) => A64Ldr,
        (size, _) => panic!("load of {size}-byte type"),
    }
}

fn store_op(size: u32) -> Opcode {
    use Opcode::*;
    match size {
        1 => A64Strb,
        2 => A64Strh,
        4 => A64Strw,
        8 => A64Str,
        size => panic!("store of {size}-byte type"),
    }
}

/// Fold `addr = add_imm(base, k)` into a load/store offset when the offset
/// fits the unsigned scaled addressing mode.
fn fold_address(func: &Func, addr: Value, access_size: u32) -> (Value, i64) {
    let data = func.value(addr);
    if data.opcode == Opcode::A64AddImm {
        let off = data.aux_int;
        if off >= 0
            && off <= 4095 * access_size as i64
            && off % access_size as i64 == 0
        {
            return (data.args[0], off);
        }
    }
    (addr, 0)
}

/// Rewrite `v` in place to `opcode` over `new_args`, keeping use counts
/// straight.
fn replace_op(func: &mut Func, v: Value, opcode: Opcode, new_args: &[Value]) {
    // Bump first so shared arguments can't hit zero in between.
    for &arg in new_args {
        debug_assert!(!func.is_dead(arg));
    }
    let new: SmallVec<[Value; 3]> = new_args.iter().copied().collect();
    for &arg in &new {
        func.value_mut(arg).uses += 1;
    }
    func.clear_value_args(v);
    let data = func.value_mut(v);
    data.opcode = opcode;
    data.args = new;
}
