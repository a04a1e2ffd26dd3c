//! IR invariant checks.
//!
//! Run by tests and, under `debug_assertions`, between pipeline phases.
//! A failed check means a pass has a bug; the messages carry the function,
//! block and value involved so the dump is actionable.

use crate::fx::FxHashMap;
use crate::ir::{Func, Opcode, PassClass, TypeRegistry, Value};
use crate::result::{CodegenError, CodegenResult};

/// Check structural invariants that hold at every pipeline stage:
/// use-count accounting and the bidirectional edge property.
pub fn verify_func(func: &Func, types: &TypeRegistry) -> CodegenResult<()> {
    let _ = types;
    let mut counted: FxHashMap<Value, u32> = FxHashMap::default();
    for v in func.values() {
        let data = func.value(v);
        let declared = data.opcode.arg_len();
        if declared >= 0 && data.args.len() != declared as usize {
            return err(format!(
                "{}: {v} ({}) has {} args, table declares {declared}",
                func.name,
                data.opcode,
                data.args.len()
            ));
        }
        for &arg in &data.args {
            if func.is_dead(arg) {
                return err(format!(
                    "{}: {v} ({}) references freed {arg}",
                    func.name, data.opcode
                ));
            }
            *counted.entry(arg).or_insert(0) += 1;
        }
    }
    for block in func.blocks() {
        for &c in &func.block(block).control {
            if func.is_dead(c) {
                return err(format!("{}: {block} control references freed {c}", func.name));
            }
            *counted.entry(c).or_insert(0) += 1;
        }
        for &v in &func.block(block).values {
            if func.value(v).block.expand() != Some(block) {
                return err(format!(
                    "{}: {v} listed in {block} but owned by {:?}",
                    func.name,
                    func.value(v).block.expand()
                ));
            }
        }
    }
    for v in func.values() {
        let expected = counted.get(&v).copied().unwrap_or(0);
        if func.value(v).uses != expected {
            return err(format!(
                "{}: {v} ({} {}) use count {} but {} references found",
                func.name,
                func.value(v).opcode,
                func.value(v).pos,
                func.value(v).uses,
                expected
            ));
        }
    }

    for block in func.blocks() {
        let data = func.block(block);
        for (i, edge) in data.succs.iter().enumerate() {
            let back = func.block(edge.block).preds.get(edge.index as usize);
            if back.map(|e| (e.block, e.index as usize)) != Some((block, i)) {
                return err(format!(
                    "{}: edge {block}.succs[{i}] -> {} is not mirrored",
                    func.name, edge.block
                ));
            }
        }
        for (i, edge) in data.preds.iter().enumerate() {
            let back = func.block(edge.block).succs.get(edge.index as usize);
            if back.map(|e| (e.block, e.index as usize)) != Some((block, i)) {
                return err(format!(
                    "{}: edge {block}.preds[{i}] -> {} is not mirrored",
                    func.name, edge.block
                ));
            }
        }
        for &v in &data.values {
            if func.value(v).opcode == Opcode::Phi
                && func.value(v).args.len() != data.preds.len()
            {
                return err(format!(
                    "{}: phi {v} has {} operands for {} predecessors",
                    func.name,
                    func.value(v).args.len(),
                    data.preds.len()
                ));
            }
        }
    }
    Ok(())
}

/// Check that allocation assigned a location to every value that produces
/// a runtime result (valid only after regalloc and stackalloc).
pub fn verify_locations(func: &Func, types: &TypeRegistry) -> CodegenResult<()> {
    for block in func.blocks() {
        for &v in &func.block(block).values {
            let data = func.value(v);
            let class = types.class(data.ty);
            if matches!(class, PassClass::Void | PassClass::Flags) {
                continue;
            }
            if data.ty == crate::ir::types::TUPLE2 {
                continue;
            }
            if !func.home[v].is_assigned() {
                return err(format!(
                    "{}: {v} ({}) in {block} has no location after allocation",
                    func.name, data.opcode
                ));
            }
        }
    }
    Ok(())
}

fn err(msg: String) -> CodegenResult<()> {
    Err(CodegenError::Verifier(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types, BlockKind, Signature, ValueData};

    #[test]
    fn catches_bad_use_counts() {
        let mut func = Func::new("t", Signature::new(vec![], types::I64));
        let entry = func.create_block(BlockKind::Ret);
        func.entry = entry.into();
        let a = func.const_int(types::I64, 1);
        let b = func.append_value(
            entry,
            ValueData::new(Opcode::Copy, types::I64).with_args([a]),
        );
        let types_reg = TypeRegistry::new();
        assert!(verify_func(&func, &types_reg).is_ok());
        // Corrupt the count directly.
        func.value_mut(b).uses = 7;
        assert!(verify_func(&func, &types_reg).is_err());
    }

    #[test]
    fn catches_one_sided_edges() {
        let mut func = Func::new("t", Signature::new(vec![], types::VOID));
        let a = func.create_block(BlockKind::Plain);
        let b = func.create_block(BlockKind::Ret);
        func.entry = a.into();
        func.add_edge(a, b);
        let types_reg = TypeRegistry::new();
        assert!(verify_func(&func, &types_reg).is_ok());
        func.block_mut(b).preds.clear();
        assert!(verify_func(&func, &types_reg).is_err());
    }
}
