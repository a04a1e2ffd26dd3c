//! The SSA function representation.
//!
//! A `Func` exclusively owns its values and blocks; everything else refers
//! to them by [`Value`] and [`Block`] indices. Freed values are recycled
//! through a free list and never survive the function. The function also
//! owns the constant cache (so identical constants share one value), the
//! home map filled in by the register and stack allocators, the local
//! variable table, and the string literal table.

use crate::fx::FxHashMap;
use crate::ir::entities::{Block, Local, StrLit, Value};
use crate::ir::extfunc::Signature;
use crate::ir::opcodes::{AuxData, Opcode};
use crate::ir::sourceloc::SourceLoc;
use crate::ir::types::{self, TypeIdx};
use crate::ir::valueloc::ValueLoc;
use crate::ir::condcodes::IntCC;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};
use smallvec::SmallVec;

/// How a block terminates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Falls through or jumps to its single successor.
    Plain,
    /// Two successors; the first is taken when the condition holds.
    If,
    /// Function return; control values are the returned words.
    Ret,
    /// Control never leaves (runtime abort).
    Exit,
}

/// Branch-likelihood hint for an `If` block's first successor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum BranchHint {
    /// No hint.
    #[default]
    None,
    /// The first successor is likely.
    Likely,
    /// The first successor is unlikely.
    Unlikely,
}

/// One half of a CFG edge.
///
/// For every successor edge `from.succs[i] == (to, j)` there is a matching
/// predecessor edge `to.preds[j] == (from, i)`, and vice versa. Phi operands
/// are ordered to match the predecessor list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    /// The block on the other end.
    pub block: Block,
    /// The index of the matching edge in that block's list.
    pub index: u32,
}

/// The contents of one SSA value.
#[derive(Clone, Debug)]
pub struct ValueData {
    /// Operation tag.
    pub opcode: Opcode,
    /// Result type.
    pub ty: TypeIdx,
    /// Signed integer payload; meaning depends on the opcode.
    pub aux_int: i64,
    /// Tagged payload; the kind must match the op table's declaration.
    pub aux: AuxData,
    /// Ordered arguments. Each occurrence holds +1 on the argument's use
    /// count.
    pub args: SmallVec<[Value; 3]>,
    /// Owning block.
    pub block: PackedOption<Block>,
    /// Source position.
    pub pos: SourceLoc,
    /// Number of references from other values' args and block controls.
    pub uses: u32,
}

impl ValueData {
    /// A value with the given op, type and no payload.
    pub fn new(opcode: Opcode, ty: TypeIdx) -> Self {
        Self {
            opcode,
            ty,
            aux_int: 0,
            aux: AuxData::None,
            args: SmallVec::new(),
            block: None.into(),
            pos: SourceLoc::default(),
            uses: 0,
        }
    }

    /// Set the integer payload.
    pub fn with_aux_int(mut self, aux_int: i64) -> Self {
        self.aux_int = aux_int;
        self
    }

    /// Set the tagged payload.
    pub fn with_aux(mut self, aux: AuxData) -> Self {
        self.aux = aux;
        self
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    /// Set the source position.
    pub fn with_pos(mut self, pos: SourceLoc) -> Self {
        self.pos = pos;
        self
    }
}

/// One basic block.
#[derive(Clone, Debug)]
pub struct BlockData {
    /// Terminator kind.
    pub kind: BlockKind,
    /// Values in execution order. After regalloc this order is canonical
    /// and the emitter preserves it exactly.
    pub values: Vec<Value>,
    /// Control operands of the terminator: the branch condition for `If`,
    /// the returned words for `Ret`. Each holds +1 on its value's use count.
    pub control: SmallVec<[Value; 2]>,
    /// Predecessor edges.
    pub preds: Vec<Edge>,
    /// Successor edges.
    pub succs: Vec<Edge>,
    /// Source position.
    pub pos: SourceLoc,
    /// Branch hint for `If` blocks.
    pub hint: BranchHint,
    /// Condition under which the first successor is taken; set by lowering
    /// when the control is a flags-producing compare.
    pub cond: Option<IntCC>,
}

impl BlockData {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            values: Vec::new(),
            control: SmallVec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            pos: SourceLoc::default(),
            hint: BranchHint::None,
            cond: None,
        }
    }
}

/// A local variable slot.
#[derive(Clone, Debug)]
pub struct LocalData {
    /// Source name, for diagnostics.
    pub name: String,
    /// Declared type.
    pub ty: TypeIdx,
    /// Size in bytes.
    pub size: u32,
    /// Whether this local is a parameter.
    pub is_param: bool,
}

/// A function under compilation.
pub struct Func {
    /// Symbol name.
    pub name: String,
    /// Source-level signature.
    pub sig: Signature,
    /// Entry block.
    pub entry: PackedOption<Block>,
    /// Location assignments, filled by regalloc and stackalloc.
    pub home: SecondaryMap<Value, ValueLoc>,
    /// Local variable slots, in declaration order.
    pub locals: PrimaryMap<Local, LocalData>,
    /// Interned string literals referenced by this function.
    pub strings: PrimaryMap<StrLit, Box<[u8]>>,

    values: PrimaryMap<Value, ValueData>,
    blocks: PrimaryMap<Block, BlockData>,
    free_values: Vec<Value>,
    dead: crate::fx::FxHashSet<Value>,
    const_cache: FxHashMap<(Opcode, TypeIdx, i64), Value>,
}

impl Func {
    /// Create an empty function.
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        Self {
            name: name.into(),
            sig,
            entry: None.into(),
            home: SecondaryMap::new(),
            locals: PrimaryMap::new(),
            strings: PrimaryMap::new(),
            values: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            free_values: Vec::new(),
            dead: crate::fx::FxHashSet::default(),
            const_cache: FxHashMap::default(),
        }
    }

    // ---- blocks ----

    /// Append a new block.
    pub fn create_block(&mut self, kind: BlockKind) -> Block {
        self.blocks.push(BlockData::new(kind))
    }

    /// Borrow a block.
    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    /// Mutably borrow a block.
    pub fn block_mut(&mut self, block: Block) -> &mut BlockData {
        &mut self.blocks[block]
    }

    /// Iterate over blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.blocks.keys()
    }

    /// Number of blocks, including any unreachable ones.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Connect `from` to `to`, appending matched edges on both sides.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        let succ_index = self.blocks[from].succs.len() as u32;
        let pred_index = self.blocks[to].preds.len() as u32;
        self.blocks[from].succs.push(Edge {
            block: to,
            index: pred_index,
        });
        self.blocks[to].preds.push(Edge {
            block: from,
            index: succ_index,
        });
    }

    /// Split the edge `from.succs[succ_idx]` by inserting an empty plain
    /// block. Phi operand order in the successor is unaffected because the
    /// predecessor index is preserved.
    pub fn split_edge(&mut self, from: Block, succ_idx: usize) -> Block {
        let Edge { block: to, index: pred_idx } = self.blocks[from].succs[succ_idx];
        let mid = self.create_block(BlockKind::Plain);
        self.blocks[mid].pos = self.blocks[from].pos;
        self.blocks[from].succs[succ_idx] = Edge { block: mid, index: 0 };
        self.blocks[mid].preds.push(Edge {
            block: from,
            index: succ_idx as u32,
        });
        self.blocks[mid].succs.push(Edge {
            block: to,
            index: pred_idx,
        });
        self.blocks[to].preds[pred_idx as usize] = Edge { block: mid, index: 0 };
        mid
    }

    // ---- values ----

    /// Create a value from `data`, recycling a freed id when available.
    /// Bumps the use count of every argument.
    pub fn create_value(&mut self, data: ValueData) -> Value {
        let arg_len = data.opcode.arg_len();
        debug_assert!(
            arg_len < 0 || data.args.len() == arg_len as usize,
            "{}: {} args, table declares {}",
            data.opcode,
            data.args.len(),
            arg_len
        );
        for i in 0..data.args.len() {
            let arg = data.args[i];
            self.values[arg].uses += 1;
        }
        match self.free_values.pop() {
            Some(v) => {
                self.dead.remove(&v);
                self.values[v] = data;
                v
            }
            None => self.values.push(data),
        }
    }

    /// Create a value and append it to `block`.
    pub fn append_value(&mut self, block: Block, data: ValueData) -> Value {
        let v = self.create_value(data);
        self.values[v].block = block.into();
        self.blocks[block].values.push(v);
        v
    }

    /// Create a value and insert it at position `index` of `block`.
    pub fn insert_value(&mut self, block: Block, index: usize, data: ValueData) -> Value {
        let v = self.create_value(data);
        self.values[v].block = block.into();
        self.blocks[block].values.insert(index, v);
        v
    }

    /// Create a value owned by `block` without entering it in the block's
    /// value list. Passes that rebuild value lists wholesale use this and
    /// place the id themselves.
    pub fn append_detached(&mut self, data: ValueData, block: Block) -> Value {
        let v = self.create_value(data);
        self.values[v].block = block.into();
        v
    }

    /// Borrow a value.
    pub fn value(&self, v: Value) -> &ValueData {
        debug_assert!(!self.dead.contains(&v), "use of freed {v}");
        &self.values[v]
    }

    /// Mutably borrow a value. Argument edits must go through
    /// [`Func::set_value_arg`] and friends to keep use counts consistent.
    pub fn value_mut(&mut self, v: Value) -> &mut ValueData {
        debug_assert!(!self.dead.contains(&v), "use of freed {v}");
        &mut self.values[v]
    }

    /// Whether `v` has been freed.
    pub fn is_dead(&self, v: Value) -> bool {
        self.dead.contains(&v)
    }

    /// Total number of value slots ever created (including freed ones).
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Iterate over live value ids.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.keys().filter(move |&v| !self.dead.contains(&v))
    }

    /// Replace argument `i` of `user`, maintaining use counts.
    pub fn set_value_arg(&mut self, user: Value, i: usize, new: Value) {
        let old = self.values[user].args[i];
        if old == new {
            return;
        }
        self.values[user].args[i] = new;
        self.values[new].uses += 1;
        self.values[old].uses -= 1;
    }

    /// Append an argument to `user` (phi operands), maintaining use counts.
    pub fn push_value_arg(&mut self, user: Value, arg: Value) {
        self.values[user].args.push(arg);
        self.values[arg].uses += 1;
    }

    /// Insert an argument at position `i` of `user`, maintaining use counts.
    pub fn insert_value_arg(&mut self, user: Value, i: usize, arg: Value) {
        self.values[user].args.insert(i, arg);
        self.values[arg].uses += 1;
    }

    /// Drop all arguments of `user`, maintaining use counts.
    pub fn clear_value_args(&mut self, user: Value) {
        let args = core::mem::take(&mut self.values[user].args);
        for arg in args {
            self.values[arg].uses -= 1;
        }
    }

    /// Rewrite every use of `old` (in args and block controls) to `new`.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) {
        debug_assert_ne!(old, new);
        let users: Vec<Value> = self
            .values()
            .filter(|&u| self.values[u].args.contains(&old))
            .collect();
        for user in users {
            for i in 0..self.values[user].args.len() {
                if self.values[user].args[i] == old {
                    self.set_value_arg(user, i, new);
                }
            }
        }
        let blocks: Vec<Block> = self.blocks.keys().collect();
        for block in blocks {
            for i in 0..self.blocks[block].control.len() {
                if self.blocks[block].control[i] == old {
                    self.blocks[block].control[i] = new;
                    self.values[new].uses += 1;
                    self.values[old].uses -= 1;
                }
            }
        }
    }

    /// Free an unused value: drop its arguments' use counts, purge any
    /// constant-cache entry keyed to it, unlink it from its block, and put
    /// the id on the free list.
    pub fn free_value(&mut self, v: Value) {
        assert_eq!(
            self.values[v].uses, 0,
            "freeing {v} ({}) with {} uses in {}",
            self.values[v].opcode, self.values[v].uses, self.name
        );
        self.clear_value_args(v);
        let key = (self.values[v].opcode, self.values[v].ty, self.values[v].aux_int);
        if self.const_cache.get(&key) == Some(&v) {
            self.const_cache.remove(&key);
        }
        if let Some(block) = self.values[v].block.expand() {
            self.blocks[block].values.retain(|&x| x != v);
        }
        self.values[v].block = None.into();
        self.values[v].aux = AuxData::None;
        self.dead.insert(v);
        self.free_values.push(v);
    }

    /// Repeatedly discard values with no uses, no side effects, and no
    /// control role, until nothing changes.
    pub fn sweep_dead_values(&mut self) {
        loop {
            let dead: Vec<Value> = self
                .values()
                .filter(|&v| {
                    let data = &self.values[v];
                    data.uses == 0 && !data.opcode.has_side_effects()
                })
                .collect();
            if dead.is_empty() {
                return;
            }
            for v in dead {
                self.free_value(v);
            }
        }
    }

    // ---- control values ----

    /// Set the control operands of `block`, maintaining use counts.
    pub fn set_control(&mut self, block: Block, control: &[Value]) {
        let old = core::mem::take(&mut self.blocks[block].control);
        for v in old {
            self.values[v].uses -= 1;
        }
        for &v in control {
            self.values[v].uses += 1;
        }
        self.blocks[block].control = control.iter().copied().collect();
    }

    /// Replace control operand `j` of `block`, maintaining use counts.
    pub fn set_control_entry(&mut self, block: Block, j: usize, new: Value) {
        let old = self.blocks[block].control[j];
        if old == new {
            return;
        }
        self.blocks[block].control[j] = new;
        self.values[new].uses += 1;
        self.values[old].uses -= 1;
    }

    // ---- constants ----

    /// An integer constant of the given type. Two calls with the same type
    /// and bits return the same value.
    pub fn const_int(&mut self, ty: TypeIdx, bits: i64) -> Value {
        self.cached_constant(Opcode::ConstInt, ty, normalize_const(ty, bits))
    }

    /// Look up or create a cached constant-like value. The home block is the
    /// entry block; the register allocator rematerializes constants where
    /// they are used.
    pub fn cached_constant(&mut self, opcode: Opcode, ty: TypeIdx, aux_int: i64) -> Value {
        debug_assert!(opcode.is_rematerializable());
        if let Some(&v) = self.const_cache.get(&(opcode, ty, aux_int)) {
            return v;
        }
        let entry = self.entry.expand().expect("constant before entry block");
        let data = ValueData::new(opcode, ty).with_aux_int(aux_int);
        let v = self.create_value(data);
        self.values[v].block = entry.into();
        // Constants sit near the head of the entry block, after the
        // incoming-parameter values so they cannot be scheduled into an
        // argument register before the parameter claims it.
        let at = self.blocks[entry]
            .values
            .iter()
            .take_while(|&&p| {
                matches!(self.values[p].opcode, Opcode::Arg | Opcode::ArgStack)
            })
            .count();
        self.blocks[entry].values.insert(at, v);
        self.const_cache.insert((opcode, ty, aux_int), v);
        v
    }

    /// Purge the constant cache. Lowering rewrites constant ops in place,
    /// which invalidates the structural keys.
    pub fn clear_const_cache(&mut self) {
        self.const_cache.clear();
    }

    /// The cached value for `(opcode, ty, aux_int)`, if any. Test hook.
    pub fn lookup_constant(&self, opcode: Opcode, ty: TypeIdx, aux_int: i64) -> Option<Value> {
        self.const_cache.get(&(opcode, ty, aux_int)).copied()
    }

    // ---- tables ----

    /// Append a local variable slot.
    pub fn add_local(&mut self, data: LocalData) -> Local {
        self.locals.push(data)
    }

    /// Append a string literal.
    pub fn add_string(&mut self, bytes: Box<[u8]>) -> StrLit {
        self.strings.push(bytes)
    }

    /// Whether the function makes any calls.
    pub fn is_leaf(&self) -> bool {
        self.values().all(|v| !self.values[v].opcode.is_call())
    }
}

impl core::fmt::Debug for Func {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        writeln!(f, "fn {}:", self.name)?;
        for block in self.blocks.keys() {
            let data = &self.blocks[block];
            writeln!(
                f,
                "  {block} {:?} preds={:?} succs={:?} control={:?}",
                data.kind,
                data.preds.iter().map(|e| e.block).collect::<Vec<_>>(),
                data.succs.iter().map(|e| e.block).collect::<Vec<_>>(),
                data.control,
            )?;
            for &v in &data.values {
                let vd = &self.values[v];
                writeln!(
                    f,
                    "    {v} = {} {:?} aux={} uses={} home={} {}",
                    vd.opcode, vd.args, vd.aux_int, vd.uses, self.home[v], vd.pos
                )?;
            }
        }
        Ok(())
    }
}

/// Make sure a constant of a small type stays within its representable
/// range; the frontend is expected to have normalized this already.
pub fn normalize_const(ty: TypeIdx, bits: i64) -> i64 {
    match ty {
        types::BOOL => bits & 1,
        types::I8 => bits as i8 as i64,
        types::U8 => bits as u8 as i64,
        types::I16 => bits as i16 as i64,
        types::U16 => bits as u16 as i64,
        types::I32 => bits as i32 as i64,
        types::U32 => bits as u32 as i64,
        _ => bits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types;

    fn test_func() -> Func {
        let mut func = Func::new("t", Signature::new(vec![], types::VOID));
        let entry = func.create_block(BlockKind::Ret);
        func.entry = entry.into();
        func
    }

    #[test]
    fn constant_cache_identity() {
        let mut func = test_func();
        let a = func.const_int(types::I64, 42);
        let b = func.const_int(types::I64, 42);
        assert_eq!(a, b);
        let c = func.const_int(types::I64, 43);
        assert_ne!(a, c);
        let d = func.const_int(types::I32, 42);
        assert_ne!(a, d);
    }

    #[test]
    fn freeing_purges_cache() {
        let mut func = test_func();
        let a = func.const_int(types::I64, 7);
        func.free_value(a);
        assert!(func.lookup_constant(Opcode::ConstInt, types::I64, 7).is_none());
        let b = func.const_int(types::I64, 7);
        // The freed id is recycled for the fresh constant.
        assert_eq!(a, b);
        assert!(!func.is_dead(b));
    }

    #[test]
    fn use_counts_track_args_and_control() {
        let mut func = test_func();
        let entry = func.entry.unwrap();
        let a = func.const_int(types::I64, 1);
        let b = func.const_int(types::I64, 2);
        let sum = func.append_value(
            entry,
            ValueData::new(Opcode::Add, types::I64).with_args([a, b]),
        );
        assert_eq!(func.value(a).uses, 1);
        assert_eq!(func.value(b).uses, 1);
        func.set_control(entry, &[sum]);
        assert_eq!(func.value(sum).uses, 1);
        func.set_value_arg(sum, 1, a);
        assert_eq!(func.value(a).uses, 2);
        assert_eq!(func.value(b).uses, 0);
    }

    #[test]
    fn edges_are_bidirectional() {
        let mut func = test_func();
        let a = func.create_block(BlockKind::If);
        let b = func.create_block(BlockKind::Plain);
        let c = func.create_block(BlockKind::Plain);
        func.add_edge(a, b);
        func.add_edge(a, c);
        func.add_edge(b, c);
        for block in [a, b, c] {
            for (i, e) in func.block(block).succs.iter().enumerate() {
                let back = func.block(e.block).preds[e.index as usize];
                assert_eq!(back.block, block);
                assert_eq!(back.index as usize, i);
            }
        }
    }

    #[test]
    fn split_edge_keeps_invariant() {
        let mut func = test_func();
        let a = func.create_block(BlockKind::If);
        let b = func.create_block(BlockKind::Plain);
        let m = func.create_block(BlockKind::Plain);
        func.add_edge(a, b);
        func.add_edge(a, m);
        func.add_edge(b, m);
        let mid = func.split_edge(a, 1);
        assert_eq!(func.block(a).succs[1].block, mid);
        assert_eq!(func.block(mid).succs[0].block, m);
        assert_eq!(func.block(m).preds[1].block, mid);
        // The phi operand position (pred index 1) is preserved.
        assert_eq!(func.block(mid).succs[0].index, 1);
    }
}
