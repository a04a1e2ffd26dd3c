//! AAPCS64-style parameter and result classification.
//!
//! [`compute_abi_sig`] turns a source signature into the passing record both
//! sides of a call derive from: the caller-side expansion (argument moves,
//! outgoing stack stores, hidden return pointer) and the callee-side
//! prologue (incoming `arg` values, stack-parameter homes) must use the
//! same record, or the two sides disagree about where values live.
//!
//! The rules:
//! - the first eight integer-class words go in x0–x7; a 9..=16-byte value
//!   takes a register pair and needs two free slots;
//! - everything else goes on the stack, 8-byte aligned per slot, at
//!   [FP + 16 + offset] from the callee's point of view;
//! - results of at most 8 bytes return in x0, 9..=16 bytes in x0:x1, and
//!   anything larger through a caller-allocated buffer addressed by x8.

use crate::ir::extfunc::{AbiParam, AbiSig, Signature};
use crate::ir::types::{PassClass, TypeIdx, TypeRegistry};
use crate::isa::aarch64::regs::ARG_REGS;
use smallvec::{smallvec, SmallVec};

/// Number of words a register-passed value of class `class` occupies.
fn words(class: PassClass) -> usize {
    match class {
        PassClass::Word => 1,
        PassClass::Pair => 2,
        _ => 0,
    }
}

/// Classify every parameter and the result of `sig`.
pub fn compute_abi_sig(sig: &Signature, types: &TypeRegistry) -> AbiSig {
    let mut next_reg = 0usize;
    let mut stack_off = 0i32;
    let mut params = Vec::with_capacity(sig.params.len());

    for &ty in &sig.params {
        let class = types.class(ty);
        let size = types.size(ty);
        assert_ne!(
            class,
            PassClass::Void,
            "void parameter in signature"
        );
        let need = words(class);
        if class != PassClass::Memory && next_reg + need <= ARG_REGS.len() {
            let regs: SmallVec<[u8; 2]> = (0..need)
                .map(|i| ARG_REGS[next_reg + i])
                .collect();
            next_reg += need;
            params.push(AbiParam::Reg(regs));
        } else {
            let slot = (size.max(8) + 7) & !7;
            params.push(AbiParam::Stack {
                offset: stack_off,
                size,
            });
            stack_off += slot as i32;
        }
    }

    let ret_class = types.class(sig.ret);
    let (ret_regs, uses_hidden_return, hidden_ret_size): (SmallVec<[u8; 2]>, bool, u32) =
        match ret_class {
            PassClass::Void => (smallvec![], false, 0),
            PassClass::Word => (smallvec![0], false, 0),
            PassClass::Pair => (smallvec![0, 1], false, 0),
            PassClass::Memory => (smallvec![], true, types.size(sig.ret)),
            PassClass::Flags => panic!("flags-typed return"),
        };

    AbiSig {
        params,
        ret_regs,
        uses_hidden_return,
        hidden_ret_size,
        stack_bytes: stack_off as u32,
    }
}

/// The byte offset, from the callee's frame pointer, of the stack parameter
/// described by `offset` within the incoming argument area.
pub fn incoming_stack_offset(offset: i32) -> i32 {
    16 + offset
}

/// The access size class of a load or store of `ty`, in bytes.
pub fn access_size(ty: TypeIdx, types: &TypeRegistry) -> u32 {
    types.size(ty).min(8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types;

    #[test]
    fn words_in_registers() {
        let reg = TypeRegistry::new();
        let sig = Signature::new(vec![types::I64, types::I64], types::I64);
        let abi = compute_abi_sig(&sig, &reg);
        assert_eq!(abi.params[0], AbiParam::Reg(smallvec![0]));
        assert_eq!(abi.params[1], AbiParam::Reg(smallvec![1]));
        assert_eq!(abi.ret_regs.as_slice(), &[0]);
        assert!(!abi.uses_hidden_return);
        assert_eq!(abi.stack_bytes, 0);
    }

    #[test]
    fn pairs_take_two_registers() {
        let reg = TypeRegistry::new();
        let sig = Signature::new(vec![types::STR, types::STR], types::STR);
        let abi = compute_abi_sig(&sig, &reg);
        assert_eq!(abi.params[0], AbiParam::Reg(smallvec![0, 1]));
        assert_eq!(abi.params[1], AbiParam::Reg(smallvec![2, 3]));
        assert_eq!(abi.ret_regs.as_slice(), &[0, 1]);
    }

    #[test]
    fn overflow_goes_to_stack() {
        let reg = TypeRegistry::new();
        let sig = Signature::new(vec![types::I64; 10], types::VOID);
        let abi = compute_abi_sig(&sig, &reg);
        for i in 0..8 {
            assert_eq!(abi.params[i], AbiParam::Reg(smallvec![i as u8]));
        }
        assert_eq!(abi.params[8], AbiParam::Stack { offset: 0, size: 8 });
        assert_eq!(abi.params[9], AbiParam::Stack { offset: 8, size: 8 });
        assert_eq!(abi.stack_bytes, 16);
    }

    #[test]
    fn large_result_uses_hidden_pointer() {
        let mut reg = TypeRegistry::new();
        let big = reg.push_aggregate(24, 8);
        let sig = Signature::new(vec![], big);
        let abi = compute_abi_sig(&sig, &reg);
        assert!(abi.uses_hidden_return);
        assert_eq!(abi.hidden_ret_size, 24);
        assert!(abi.ret_regs.is_empty());
    }

    #[test]
    fn large_param_goes_to_stack() {
        let mut reg = TypeRegistry::new();
        let big = reg.push_aggregate(24, 8);
        let sig = Signature::new(vec![big, types::I64], types::VOID);
        let abi = compute_abi_sig(&sig, &reg);
        assert_eq!(abi.params[0], AbiParam::Stack { offset: 0, size: 24 });
        assert_eq!(abi.params[1], AbiParam::Reg(smallvec![0]));
        assert_eq!(abi.stack_bytes, 24);
    }
}
