//! IR to SSA construction.
//!
//! The flat IR refers to local variable slots; this pass converts it to SSA
//! with on-the-fly phi insertion: reading a variable walks backwards through
//! the CFG, inserting phis at join points as it goes, and a block's phis are
//! completed only once the block is *sealed* (all predecessors filled). In
//! unsealed blocks a read materializes a `fwd_ref` placeholder that is
//! rewritten in place — same value id, users untouched — when the block
//! seals. Trivial phis are removed and their uses rewired, transitively.
//!
//! Locals that have their address taken, or whose type is larger than two
//! machine words, are not promoted: their reads and writes stay explicit
//! memory operations.

use crate::flat;
use crate::fx::FxHashMap;
use crate::ir::{
    self, AuxCall, AuxData, Block, BlockKind, Func, Local, Opcode, PassClass, SymRef,
    TypeRegistry, Value, ValueData,
};
use crate::isa::aarch64::abi::{compute_abi_sig, incoming_stack_offset};
use crate::isa::aarch64::regs::HIDDEN_RET;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{EntityRef, EntitySet, SecondaryMap};
use log::trace;
use smallvec::SmallVec;

/// Build an SSA [`Func`] from one function of flat IR.
pub fn build(input: &flat::Function, types: &TypeRegistry) -> Func {
    let mut builder = SsaBuilder::new(input, types);
    builder.run(input);
    builder.finish()
}

struct SsaBuilder<'a> {
    types: &'a TypeRegistry,
    func: Func,
    /// Flat block index to SSA block.
    block_map: Vec<Block>,
    /// Flat instruction to its SSA value.
    inst_value: SecondaryMap<flat::Inst, PackedOption<Value>>,
    /// Current definition of each promoted local, per block.
    current_def: SecondaryMap<Block, FxHashMap<Local, Value>>,
    sealed: EntitySet<Block>,
    filled: EntitySet<Block>,
    /// Pending `fwd_ref` placeholders per unsealed block, in creation order.
    incomplete: FxHashMap<Block, Vec<(Local, Value)>>,
    /// Locals that stay in memory.
    memory_locals: EntitySet<Local>,
    /// The hidden-return-pointer argument, for functions that have one.
    ret_ptr: Option<Value>,
}

impl<'a> SsaBuilder<'a> {
    fn new(input: &flat::Function, types: &'a TypeRegistry) -> Self {
        let mut func = Func::new(input.name.clone(), input.sig.clone());
        for (_, data) in input.locals.iter() {
            func.add_local(data.clone());
        }
        for (_, bytes) in input.strings.iter() {
            func.add_string(bytes.clone());
        }

        // Locals that cannot live in registers: larger than two words, or
        // address-taken anywhere in the function.
        let mut memory_locals = EntitySet::new();
        for local in func.locals.keys() {
            if types.class(func.locals[local].ty) == PassClass::Memory {
                memory_locals.insert(local);
            }
        }
        for (_, inst) in input.insts.iter() {
            if let flat::InstData::Op {
                opcode: Opcode::LocalAddr,
                aux: flat::FlatAux::Local(local),
                ..
            } = inst
            {
                memory_locals.insert(*local);
            }
        }

        let mut block_map = Vec::with_capacity(input.blocks.len());
        for flat_block in &input.blocks {
            let kind = match flat_block.term {
                flat::Terminator::Jump(_) => BlockKind::Plain,
                flat::Terminator::Branch { .. } => BlockKind::If,
                flat::Terminator::Ret(_) => BlockKind::Ret,
                flat::Terminator::Exit => BlockKind::Exit,
            };
            let block = func.create_block(kind);
            func.block_mut(block).pos = flat_block.pos;
            func.block_mut(block).hint = flat_block.hint;
            block_map.push(block);
        }
        func.entry = block_map[0].into();
        for (i, flat_block) in input.blocks.iter().enumerate() {
            let from = block_map[i];
            match flat_block.term {
                flat::Terminator::Jump(to) => func.add_edge(from, block_map[to]),
                flat::Terminator::Branch {
                    then_dest,
                    else_dest,
                    ..
                } => {
                    func.add_edge(from, block_map[then_dest]);
                    func.add_edge(from, block_map[else_dest]);
                }
                flat::Terminator::Ret(_) | flat::Terminator::Exit => {}
            }
        }

        Self {
            types,
            func,
            block_map,
            inst_value: SecondaryMap::new(),
            current_def: SecondaryMap::new(),
            sealed: EntitySet::new(),
            filled: EntitySet::new(),
            incomplete: FxHashMap::default(),
            memory_locals,
            ret_ptr: None,
        }
    }

    fn run(&mut self, input: &flat::Function) {
        self.lower_params(input);
        self.try_seal_blocks();

        for (i, flat_block) in input.blocks.iter().enumerate() {
            let block = self.block_map[i];
            for &inst in &flat_block.insts {
                self.translate_inst(input, block, inst);
            }
            self.translate_terminator(input, block, &flat_block.term);
            self.filled.insert(block);
            self.try_seal_blocks();
        }

        assert!(
            self.incomplete.is_empty(),
            "{}: unsealed blocks at end of SSA construction",
            self.func.name
        );
    }

    fn finish(mut self) -> Func {
        self.func.sweep_dead_values();
        trace!(
            "ssa: {} built, {} blocks, {} values",
            self.func.name,
            self.func.num_blocks(),
            self.func.values().count()
        );
        self.func
    }

    // ---- parameters ----

    fn lower_params(&mut self, input: &flat::Function) {
        let entry = self.block_map[0];
        let abi = compute_abi_sig(&input.sig, self.types);

        if abi.uses_hidden_return {
            let v = self.func.append_value(
                entry,
                ValueData::new(Opcode::Arg, ir::types::PTR).with_aux_int(HIDDEN_RET as i64),
            );
            self.ret_ptr = Some(v);
        }

        let param_locals: Vec<Local> = input.param_locals().collect();
        assert_eq!(
            param_locals.len(),
            abi.params.len(),
            "{}: parameter count mismatch",
            input.name
        );

        for (local, param) in param_locals.iter().zip(&abi.params) {
            let local = *local;
            let ty = self.func.locals[local].ty;
            let class = self.types.class(ty);
            let value = match param {
                ir::AbiParam::Reg(regs) => match class {
                    PassClass::Word => Some(self.func.append_value(
                        entry,
                        ValueData::new(Opcode::Arg, ty).with_aux_int(regs[0] as i64),
                    )),
                    PassClass::Pair => {
                        let lo = self.func.append_value(
                            entry,
                            ValueData::new(Opcode::Arg, ir::types::I64)
                                .with_aux_int(regs[0] as i64),
                        );
                        let hi = self.func.append_value(
                            entry,
                            ValueData::new(Opcode::Arg, ir::types::I64)
                                .with_aux_int(regs[1] as i64),
                        );
                        Some(self.func.append_value(
                            entry,
                            ValueData::new(Opcode::MakeTuple, ty).with_args([lo, hi]),
                        ))
                    }
                    _ => panic!("register parameter of class {class:?}"),
                },
                ir::AbiParam::Stack { offset, .. } => {
                    if class == PassClass::Memory {
                        // The local's storage is the incoming argument area;
                        // the stack allocator homes it there.
                        None
                    } else {
                        let fp_off = incoming_stack_offset(*offset);
                        let value = match class {
                            PassClass::Word => self.func.append_value(
                                entry,
                                ValueData::new(Opcode::ArgStack, ty)
                                    .with_aux_int(fp_off as i64),
                            ),
                            PassClass::Pair => {
                                let lo = self.func.append_value(
                                    entry,
                                    ValueData::new(Opcode::ArgStack, ir::types::I64)
                                        .with_aux_int(fp_off as i64),
                                );
                                let hi = self.func.append_value(
                                    entry,
                                    ValueData::new(Opcode::ArgStack, ir::types::I64)
                                        .with_aux_int((fp_off + 8) as i64),
                                );
                                self.func.append_value(
                                    entry,
                                    ValueData::new(Opcode::MakeTuple, ty).with_args([lo, hi]),
                                )
                            }
                            _ => unreachable!(),
                        };
                        Some(value)
                    }
                }
            };
            if let Some(value) = value {
                if self.memory_locals.contains(local) {
                    // Address-taken parameter: give it a real slot.
                    let addr = self.func.append_value(
                        entry,
                        ValueData::new(Opcode::LocalAddr, ir::types::PTR)
                            .with_aux(AuxData::LocalVar(local)),
                    );
                    self.func.append_value(
                        entry,
                        ValueData::new(Opcode::Store, ir::types::VOID).with_args([addr, value]),
                    );
                } else {
                    self.write_variable(local, entry, value);
                }
            }
        }
    }

    // ---- instruction translation ----

    fn translate_inst(&mut self, input: &flat::Function, block: Block, inst: flat::Inst) {
        let value = match &input.insts[inst] {
            flat::InstData::LocalLoad { local, ty, pos } => {
                if self.memory_locals.contains(*local) {
                    assert_ne!(
                        self.types.class(*ty),
                        PassClass::Memory,
                        "{}: whole-value load of oversized {}",
                        input.name,
                        self.func.locals[*local].name
                    );
                    let addr = self.func.append_value(
                        block,
                        ValueData::new(Opcode::LocalAddr, ir::types::PTR)
                            .with_aux(AuxData::LocalVar(*local))
                            .with_pos(*pos),
                    );
                    Some(self.func.append_value(
                        block,
                        ValueData::new(Opcode::Load, *ty)
                            .with_args([addr])
                            .with_pos(*pos),
                    ))
                } else {
                    Some(self.read_variable(*local, block))
                }
            }
            flat::InstData::LocalStore { local, value, pos } => {
                let stored = self.value_of(*value);
                if self.memory_locals.contains(*local) {
                    if self.types.class(self.func.value(stored).ty) == PassClass::Memory {
                        self.attach_hidden_return(block, *local, stored);
                    } else {
                        let addr = self.func.append_value(
                            block,
                            ValueData::new(Opcode::LocalAddr, ir::types::PTR)
                                .with_aux(AuxData::LocalVar(*local))
                                .with_pos(*pos),
                        );
                        self.func.append_value(
                            block,
                            ValueData::new(Opcode::Store, ir::types::VOID)
                                .with_args([addr, stored])
                                .with_pos(*pos),
                        );
                    }
                } else {
                    self.write_variable(*local, block, stored);
                }
                None
            }
            flat::InstData::Op {
                opcode,
                ty,
                aux_int,
                aux,
                args,
                pos,
            } => {
                assert!(
                    opcode.is_generic(),
                    "{}: non-generic {} in flat IR",
                    input.name,
                    opcode
                );
                match opcode {
                    Opcode::ConstInt => Some(self.func.const_int(*ty, *aux_int)),
                    Opcode::RetSlotAddr => Some(
                        self.ret_ptr
                            .expect("ret_slot_addr in a function without hidden return"),
                    ),
                    Opcode::Call => {
                        let info = match aux {
                            flat::FlatAux::Call(info) => info,
                            _ => panic!("call without callee info"),
                        };
                        let abi = compute_abi_sig(&info.sig, self.types);
                        let vargs: SmallVec<[Value; 3]> =
                            args.iter().map(|&a| self.value_of(a)).collect();
                        let data = ValueData {
                            opcode: Opcode::Call,
                            ty: *ty,
                            aux_int: 0,
                            aux: AuxData::Call(Box::new(AuxCall::new(
                                info.name.clone(),
                                abi,
                            ))),
                            args: vargs,
                            block: None.into(),
                            pos: *pos,
                            uses: 0,
                        };
                        Some(self.func.append_value(block, data))
                    }
                    _ => {
                        let vargs: SmallVec<[Value; 3]> =
                            args.iter().map(|&a| self.value_of(a)).collect();
                        let data = ValueData {
                            opcode: *opcode,
                            ty: *ty,
                            aux_int: *aux_int,
                            aux: translate_aux(aux),
                            args: vargs,
                            block: None.into(),
                            pos: *pos,
                            uses: 0,
                        };
                        Some(self.func.append_value(block, data))
                    }
                }
            }
        };
        if let Some(value) = value {
            self.inst_value[inst] = value.into();
        }
    }

    /// `local_store` of an oversized call result: route the hidden return
    /// pointer at the destination local's storage instead of copying.
    fn attach_hidden_return(&mut self, block: Block, local: Local, call: Value) {
        let data = self.func.value(call);
        assert!(
            data.opcode == Opcode::Call && data.uses == 0,
            "{}: oversized value {} must be a call result stored exactly once",
            self.func.name,
            call
        );
        match &data.aux {
            AuxData::Call(aux) => assert!(aux.sig.uses_hidden_return),
            _ => panic!("call without descriptor"),
        }
        let at = self
            .func
            .block(block)
            .values
            .iter()
            .position(|&v| v == call)
            .expect("call not in block");
        let addr = self.func.insert_value(
            block,
            at,
            ValueData::new(Opcode::LocalAddr, ir::types::PTR).with_aux(AuxData::LocalVar(local)),
        );
        self.func.insert_value_arg(call, 0, addr);
        // The call's result now lives in the local; the call value itself
        // produces nothing.
        self.func.value_mut(call).ty = ir::types::VOID;
    }

    fn translate_terminator(
        &mut self,
        input: &flat::Function,
        block: Block,
        term: &flat::Terminator,
    ) {
        match term {
            flat::Terminator::Jump(_) | flat::Terminator::Exit => {}
            flat::Terminator::Branch { cond, .. } => {
                let cond = self.value_of(*cond);
                self.func.set_control(block, &[cond]);
            }
            flat::Terminator::Ret(value) => match value {
                None => {
                    assert!(
                        self.types.class(input.sig.ret) == PassClass::Void
                            || self.ret_ptr.is_some(),
                        "{}: missing return value",
                        input.name
                    );
                }
                Some(inst) => {
                    let v = self.value_of(*inst);
                    self.func.set_control(block, &[v]);
                }
            },
        }
    }

    fn value_of(&self, inst: flat::Inst) -> Value {
        self.inst_value[inst]
            .expand()
            .unwrap_or_else(|| panic!("{}: use of resultless {inst}", self.func.name))
    }

    // ---- variable bookkeeping ----

    fn write_variable(&mut self, local: Local, block: Block, value: Value) {
        self.current_def[block].insert(local, value);
    }

    fn read_variable(&mut self, local: Local, block: Block) -> Value {
        if let Some(&v) = self.current_def[block].get(&local) {
            return v;
        }
        self.read_variable_recursive(local, block)
    }

    fn read_variable_recursive(&mut self, local: Local, block: Block) -> Value {
        let ty = self.func.locals[local].ty;
        let value = if !self.sealed.contains(block) {
            let v = self.func.insert_value(
                block,
                0,
                ValueData::new(Opcode::FwdRef, ty).with_aux_int(local.index() as i64),
            );
            self.incomplete.entry(block).or_default().push((local, v));
            v
        } else if self.func.block(block).preds.len() == 1 {
            let pred = self.func.block(block).preds[0].block;
            self.read_variable(local, pred)
        } else if self.func.block(block).preds.is_empty() {
            // Reading an uninitialized local: a frontend bug, but keep the
            // SSA well-formed with an unspecified (zero) value.
            self.undef_value(ty)
        } else {
            let phi = self
                .func
                .insert_value(block, 0, ValueData::new(Opcode::Phi, ty));
            self.current_def[block].insert(local, phi);
            self.add_phi_operands(local, phi)
        };
        self.current_def[block].insert(local, value);
        value
    }

    fn add_phi_operands(&mut self, local: Local, phi: Value) -> Value {
        let block = self.func.value(phi).block.expand().unwrap();
        let preds: Vec<Block> = self
            .func
            .block(block)
            .preds
            .iter()
            .map(|e| e.block)
            .collect();
        for pred in preds {
            let arg = self.read_variable(local, pred);
            self.func.push_value_arg(phi, arg);
        }
        self.try_remove_trivial_phi(phi)
    }

    /// If `phi` merges a single distinct value (or only itself), remove it,
    /// rewire its uses, and recheck any phi users that may have become
    /// trivial in turn.
    fn try_remove_trivial_phi(&mut self, phi: Value) -> Value {
        let mut same: Option<Value> = None;
        for &arg in &self.func.value(phi).args {
            if arg == phi || Some(arg) == same {
                continue;
            }
            if same.is_some() {
                return phi;
            }
            same = Some(arg);
        }
        let same = match same {
            Some(v) => v,
            // Self-referential only: unreachable or undefined.
            None => {
                let ty = self.func.value(phi).ty;
                self.undef_value(ty)
            }
        };

        let phi_users: Vec<Value> = self
            .func
            .values()
            .filter(|&u| {
                u != phi
                    && self.func.value(u).opcode == Opcode::Phi
                    && self.func.value(u).args.contains(&phi)
            })
            .collect();

        trace!("ssa: removing trivial phi {phi} -> {same}");
        self.func.replace_all_uses(phi, same);
        for (_, defs) in self.current_def.iter_mut() {
            for v in defs.values_mut() {
                if *v == phi {
                    *v = same;
                }
            }
        }
        self.func.free_value(phi);

        for user in phi_users {
            if !self.func.is_dead(user) && self.func.value(user).opcode == Opcode::Phi {
                self.try_remove_trivial_phi(user);
            }
        }
        same
    }

    /// A well-formed but unspecified value of the given type. Placed in
    /// the entry block's leading cluster so it dominates every possible
    /// use.
    fn undef_value(&mut self, ty: ir::TypeIdx) -> Value {
        match self.types.class(ty) {
            PassClass::Pair => {
                let zero = self.func.const_int(ir::types::I64, 0);
                let entry = self.func.entry.expand().unwrap();
                let at = self
                    .func
                    .block(entry)
                    .values
                    .iter()
                    .take_while(|&&v| {
                        matches!(
                            self.func.value(v).opcode,
                            Opcode::Arg | Opcode::ArgStack | Opcode::ConstInt
                        )
                    })
                    .count();
                self.func.insert_value(
                    entry,
                    at,
                    ValueData::new(Opcode::MakeTuple, ty).with_args([zero, zero]),
                )
            }
            _ => self.func.const_int(ty, 0),
        }
    }

    // ---- sealing ----

    fn try_seal_blocks(&mut self) {
        let blocks: Vec<Block> = self.func.blocks().collect();
        for block in blocks {
            if self.sealed.contains(block) {
                continue;
            }
            let ready = self
                .func
                .block(block)
                .preds
                .iter()
                .all(|e| self.filled.contains(e.block));
            if ready {
                self.seal_block(block);
            }
        }
    }

    /// All predecessors are known and filled: complete this block's pending
    /// `fwd_ref`s by rewriting them, in place, into phis (or removing them
    /// as trivial).
    fn seal_block(&mut self, block: Block) {
        self.sealed.insert(block);
        let pending = self.incomplete.remove(&block).unwrap_or_default();
        for (local, v) in pending {
            debug_assert_eq!(self.func.value(v).opcode, Opcode::FwdRef);
            {
                let data = self.func.value_mut(v);
                data.opcode = Opcode::Phi;
                data.aux_int = 0;
            }
            self.add_phi_operands(local, v);
        }
    }
}

fn translate_aux(aux: &flat::FlatAux) -> AuxData {
    match aux {
        flat::FlatAux::None => AuxData::None,
        flat::FlatAux::Str(s) => AuxData::Str(*s),
        flat::FlatAux::Global(g) => AuxData::Sym(SymRef::Global(*g)),
        flat::FlatAux::Local(l) => AuxData::LocalVar(*l),
        flat::FlatAux::Call(_) => panic!("call aux outside call"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::{FlatAux, InstData, Terminator};
    use crate::ir::types;
    use crate::ir::{LocalData, Signature, SourceLoc};
    use smallvec::smallvec;

    fn local(name: &str, ty: ir::TypeIdx, is_param: bool) -> LocalData {
        LocalData {
            name: name.to_string(),
            ty,
            size: 8,
            is_param,
        }
    }

    fn op(opcode: Opcode, ty: ir::TypeIdx, args: &[flat::Inst]) -> InstData {
        InstData::Op {
            opcode,
            ty,
            aux_int: 0,
            aux: FlatAux::None,
            args: args.iter().copied().collect(),
            pos: SourceLoc::default(),
        }
    }

    fn const_int(ty: ir::TypeIdx, bits: i64) -> InstData {
        InstData::Op {
            opcode: Opcode::ConstInt,
            ty,
            aux_int: bits,
            aux: FlatAux::None,
            args: smallvec![],
            pos: SourceLoc::default(),
        }
    }

    #[test]
    fn straight_line_promotion() {
        // x = 1; y = x + x; return y
        let mut f = flat::Function::new("f", Signature::new(vec![], types::I64));
        let x = f.add_local(local("x", types::I64, false));
        let b0 = f.add_block();
        let c1 = f.push_inst(b0, const_int(types::I64, 1));
        f.push_inst(
            b0,
            InstData::LocalStore {
                local: x,
                value: c1,
                pos: SourceLoc::default(),
            },
        );
        let l1 = f.push_inst(
            b0,
            InstData::LocalLoad {
                local: x,
                ty: types::I64,
                pos: SourceLoc::default(),
            },
        );
        let l2 = f.push_inst(
            b0,
            InstData::LocalLoad {
                local: x,
                ty: types::I64,
                pos: SourceLoc::default(),
            },
        );
        let sum = f.push_inst(b0, op(Opcode::Add, types::I64, &[l1, l2]));
        f.blocks[b0].term = Terminator::Ret(Some(sum));

        let types_reg = TypeRegistry::new();
        let func = build(&f, &types_reg);
        // No loads, stores or phis: everything promoted.
        for v in func.values() {
            let opcode = func.value(v).opcode;
            assert!(
                !matches!(opcode, Opcode::Load | Opcode::Store | Opcode::Phi),
                "unexpected {opcode}"
            );
        }
        // Both operands of the add are the same constant value.
        let entry = func.entry.unwrap();
        let ret = func.block(entry).control[0];
        let args = &func.value(ret).args;
        assert_eq!(args[0], args[1]);
    }

    #[test]
    fn diamond_inserts_one_phi() {
        // if c { a = 1 } else { a = 2 }; return a
        let mut f = flat::Function::new(
            "diamond",
            Signature::new(vec![types::BOOL], types::I64),
        );
        let c = f.add_local(local("c", types::BOOL, true));
        let a = f.add_local(local("a", types::I64, false));
        let b0 = f.add_block();
        let b_then = f.add_block();
        let b_else = f.add_block();
        let b_merge = f.add_block();

        let cv = f.push_inst(
            b0,
            InstData::LocalLoad {
                local: c,
                ty: types::BOOL,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b0].term = Terminator::Branch {
            cond: cv,
            then_dest: b_then,
            else_dest: b_else,
        };

        let one = f.push_inst(b_then, const_int(types::I64, 1));
        f.push_inst(
            b_then,
            InstData::LocalStore {
                local: a,
                value: one,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b_then].term = Terminator::Jump(b_merge);

        let two = f.push_inst(b_else, const_int(types::I64, 2));
        f.push_inst(
            b_else,
            InstData::LocalStore {
                local: a,
                value: two,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b_else].term = Terminator::Jump(b_merge);

        let av = f.push_inst(
            b_merge,
            InstData::LocalLoad {
                local: a,
                ty: types::I64,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b_merge].term = Terminator::Ret(Some(av));

        let types_reg = TypeRegistry::new();
        let func = build(&f, &types_reg);
        let phis: Vec<Value> = func
            .values()
            .filter(|&v| func.value(v).opcode == Opcode::Phi)
            .collect();
        assert_eq!(phis.len(), 1);
        let phi = phis[0];
        assert_eq!(func.value(phi).args.len(), 2);
        // The phi's operands follow predecessor order.
        let merge = func.value(phi).block.unwrap();
        assert_eq!(func.block(merge).preds.len(), 2);
        assert_eq!(func.block(merge).control[0], phi);
    }

    #[test]
    fn loop_back_edge_uses_fwd_ref_then_phi() {
        // i = 0; loop: i = i + 1; if i < 10 goto loop else done; return i
        let mut f = flat::Function::new("count", Signature::new(vec![], types::I64));
        let i = f.add_local(local("i", types::I64, false));
        let b0 = f.add_block();
        let b_loop = f.add_block();
        let b_done = f.add_block();

        let zero = f.push_inst(b0, const_int(types::I64, 0));
        f.push_inst(
            b0,
            InstData::LocalStore {
                local: i,
                value: zero,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b0].term = Terminator::Jump(b_loop);

        let iv = f.push_inst(
            b_loop,
            InstData::LocalLoad {
                local: i,
                ty: types::I64,
                pos: SourceLoc::default(),
            },
        );
        let one = f.push_inst(b_loop, const_int(types::I64, 1));
        let next = f.push_inst(b_loop, op(Opcode::Add, types::I64, &[iv, one]));
        f.push_inst(
            b_loop,
            InstData::LocalStore {
                local: i,
                value: next,
                pos: SourceLoc::default(),
            },
        );
        let ten = f.push_inst(b_loop, const_int(types::I64, 10));
        let cond = f.push_inst(b_loop, op(Opcode::Lt, types::BOOL, &[next, ten]));
        f.blocks[b_loop].term = Terminator::Branch {
            cond,
            then_dest: b_loop,
            else_dest: b_done,
        };

        let out = f.push_inst(
            b_done,
            InstData::LocalLoad {
                local: i,
                ty: types::I64,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b_done].term = Terminator::Ret(Some(out));

        let types_reg = TypeRegistry::new();
        let func = build(&f, &types_reg);
        // No fwd_refs survive; exactly one phi in the loop header.
        let mut phis = 0;
        for v in func.values() {
            let data = func.value(v);
            assert_ne!(data.opcode, Opcode::FwdRef);
            if data.opcode == Opcode::Phi {
                phis += 1;
                assert_eq!(data.args.len(), 2);
                // One operand comes from the add in the loop body.
                assert!(data
                    .args
                    .iter()
                    .any(|&a| func.value(a).opcode == Opcode::Add));
            }
        }
        assert_eq!(phis, 1);
    }

    #[test]
    fn address_taken_local_stays_in_memory() {
        let mut f = flat::Function::new("addr", Signature::new(vec![], types::I64));
        let x = f.add_local(local("x", types::I64, false));
        let b0 = f.add_block();
        let c = f.push_inst(b0, const_int(types::I64, 5));
        f.push_inst(
            b0,
            InstData::LocalStore {
                local: x,
                value: c,
                pos: SourceLoc::default(),
            },
        );
        // Taking the address forces x into memory.
        f.push_inst(
            b0,
            InstData::Op {
                opcode: Opcode::LocalAddr,
                ty: types::PTR,
                aux_int: 0,
                aux: FlatAux::Local(x),
                args: smallvec![],
                pos: SourceLoc::default(),
            },
        );
        let l = f.push_inst(
            b0,
            InstData::LocalLoad {
                local: x,
                ty: types::I64,
                pos: SourceLoc::default(),
            },
        );
        f.blocks[b0].term = Terminator::Ret(Some(l));

        let types_reg = TypeRegistry::new();
        let func = build(&f, &types_reg);
        let has_store = func
            .values()
            .any(|v| func.value(v).opcode == Opcode::Store);
        let has_load = func.values().any(|v| func.value(v).opcode == Opcode::Load);
        assert!(has_store && has_load);
    }
}
