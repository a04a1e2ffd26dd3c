//! Function signatures and call descriptors.
//!
//! `AbiSig` records how each parameter and the result of a signature are
//! passed. It is computed once per signature by the ABI analyzer and is the
//! single source of truth about call shape: the caller-side call expansion
//! and the callee-side prologue both derive from the same record.

use crate::ir::types::TypeIdx;
use smallvec::SmallVec;

/// A source-level function signature, as the frontend declares it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// Parameter types, in declaration order.
    pub params: Vec<TypeIdx>,
    /// Result type; `types::VOID` for none.
    pub ret: TypeIdx,
}

impl Signature {
    /// A signature with the given parameters and result.
    pub fn new(params: Vec<TypeIdx>, ret: TypeIdx) -> Self {
        Self { params, ret }
    }
}

/// How one parameter is passed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbiParam {
    /// In one or two registers; the vector is never empty.
    Reg(SmallVec<[u8; 2]>),
    /// On the stack in the outgoing-argument area (caller) or at
    /// [FP + 16 + offset] (callee).
    Stack {
        /// Byte offset within the stack-argument area.
        offset: i32,
        /// Size of the copy in bytes.
        size: u32,
    },
}

impl AbiParam {
    /// The register list, or panic for a stack parameter.
    pub fn unwrap_regs(&self) -> &[u8] {
        match self {
            AbiParam::Reg(regs) => regs,
            AbiParam::Stack { .. } => panic!("expected register parameter"),
        }
    }
}

/// The computed passing record for a whole signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AbiSig {
    /// How each parameter is passed, in declaration order.
    pub params: Vec<AbiParam>,
    /// Result registers: empty for void and hidden-pointer returns, one
    /// register for word results, two for pair results.
    pub ret_regs: SmallVec<[u8; 2]>,
    /// The result is returned through a caller-allocated buffer whose
    /// address is passed in x8.
    pub uses_hidden_return: bool,
    /// Size of the hidden return buffer, when used.
    pub hidden_ret_size: u32,
    /// Total bytes of stack-passed arguments, 8-byte aligned per slot.
    pub stack_bytes: u32,
}

/// ABI descriptor attached to call values.
///
/// `arg_regs` and `ret_regs` are filled in during lowering, once the call's
/// argument list has been flattened to machine words: entry `i` constrains
/// the call value's argument `i` to that register.
#[derive(Clone, Debug)]
pub struct AuxCall {
    /// The callee symbol.
    pub name: Box<str>,
    /// The passing record for the callee's signature.
    pub sig: AbiSig,
    /// Per-argument register constraints, aligned with the call's args.
    pub arg_regs: SmallVec<[u8; 8]>,
    /// Result register constraints.
    pub ret_regs: SmallVec<[u8; 2]>,
}

impl AuxCall {
    /// A descriptor with constraints not yet computed.
    pub fn new(name: impl Into<Box<str>>, sig: AbiSig) -> Self {
        Self {
            name: name.into(),
            sig,
            arg_regs: SmallVec::new(),
            ret_regs: SmallVec::new(),
        }
    }

    /// The register constraint for call argument `i`.
    pub fn reg_for_arg(&self, i: usize) -> u8 {
        self.arg_regs[i]
    }

    /// The register holding result word `n`.
    pub fn reg_for_ret(&self, n: usize) -> u8 {
        self.ret_regs[n]
    }
}
