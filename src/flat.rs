//! The frontend IR contract.
//!
//! This is what the Cot frontend hands to the backend after type checking:
//! a per-function record of blocks holding three-address instructions that
//! refer to *earlier instructions* or to *local variable slots* — loads and
//! stores against locals are explicit, there are no SSA values yet. The
//! frontend has already numbered the blocks and established the CFG.
//!
//! The backend tolerates unreachable blocks and redundant stores; it must
//! not assume any frontend optimization.

use crate::ir::entities::{GlobalId, Local, StrLit};
use crate::ir::function::{BranchHint, LocalData};
use crate::ir::opcodes::Opcode;
use crate::ir::sourceloc::SourceLoc;
use crate::ir::extfunc::Signature;
use crate::ir::types::TypeIdx;
use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;

/// A reference to an instruction in a flat function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// Callee information attached to a flat call instruction.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// The callee's symbol name.
    pub name: String,
    /// The callee's signature.
    pub sig: Signature,
}

/// The tagged payload of a flat instruction.
#[derive(Clone, Debug, Default)]
pub enum FlatAux {
    /// No payload.
    #[default]
    None,
    /// A string literal.
    Str(StrLit),
    /// A global variable.
    Global(GlobalId),
    /// A local variable (for `local_addr`).
    Local(Local),
    /// A call descriptor.
    Call(Box<CallInfo>),
}

/// One flat instruction.
#[derive(Clone, Debug)]
pub enum InstData {
    /// Read the current value of a local slot.
    LocalLoad {
        /// The slot.
        local: Local,
        /// The slot's type.
        ty: TypeIdx,
        /// Source position.
        pos: SourceLoc,
    },
    /// Write a previously computed value to a local slot.
    LocalStore {
        /// The slot.
        local: Local,
        /// The stored instruction's result.
        value: Inst,
        /// Source position.
        pos: SourceLoc,
    },
    /// Any other operation, expressed with a target-independent opcode over
    /// earlier instruction results.
    Op {
        /// The operation; must be a generic opcode.
        opcode: Opcode,
        /// Result type.
        ty: TypeIdx,
        /// Integer payload.
        aux_int: i64,
        /// Tagged payload.
        aux: FlatAux,
        /// Arguments, referring to earlier instructions.
        args: SmallVec<[Inst; 2]>,
        /// Source position.
        pos: SourceLoc,
    },
}

impl InstData {
    /// Source position of this instruction.
    pub fn pos(&self) -> SourceLoc {
        match *self {
            InstData::LocalLoad { pos, .. }
            | InstData::LocalStore { pos, .. }
            | InstData::Op { pos, .. } => pos,
        }
    }
}

/// How a flat block transfers control. Destinations are indices into the
/// function's block vector.
#[derive(Clone, Debug)]
pub enum Terminator {
    /// Unconditional jump.
    Jump(usize),
    /// Two-way branch on a previously computed condition.
    Branch {
        /// The boolean condition instruction.
        cond: Inst,
        /// Destination when the condition holds.
        then_dest: usize,
        /// Destination otherwise.
        else_dest: usize,
    },
    /// Return, with the returned instruction when the function is non-void.
    Ret(Option<Inst>),
    /// Control does not continue (runtime abort already called).
    Exit,
}

/// One flat basic block.
#[derive(Clone, Debug)]
pub struct BlockIr {
    /// The block's instructions, in order.
    pub insts: Vec<Inst>,
    /// The terminator.
    pub term: Terminator,
    /// Branch hint for two-way branches.
    pub hint: BranchHint,
    /// Source position.
    pub pos: SourceLoc,
}

/// One function of flat IR.
#[derive(Clone, Debug)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Signature.
    pub sig: Signature,
    /// All instructions, indexed function-wide.
    pub insts: PrimaryMap<Inst, InstData>,
    /// Blocks in layout order; block 0 is the entry.
    pub blocks: Vec<BlockIr>,
    /// Local slots. Parameters come first, in declaration order, with
    /// `is_param` set.
    pub locals: PrimaryMap<Local, LocalData>,
    /// Interned string literals.
    pub strings: PrimaryMap<StrLit, Box<[u8]>>,
    /// Source position of the function itself.
    pub pos: SourceLoc,
}

impl Function {
    /// An empty function with the given name and signature.
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        Self {
            name: name.into(),
            sig,
            insts: PrimaryMap::new(),
            blocks: Vec::new(),
            locals: PrimaryMap::new(),
            strings: PrimaryMap::new(),
            pos: SourceLoc::default(),
        }
    }

    /// Append an empty block ending in `Exit`; callers set the real
    /// terminator once it is known.
    pub fn add_block(&mut self) -> usize {
        self.blocks.push(BlockIr {
            insts: Vec::new(),
            term: Terminator::Exit,
            hint: BranchHint::None,
            pos: SourceLoc::default(),
        });
        self.blocks.len() - 1
    }

    /// Append an instruction to a block.
    pub fn push_inst(&mut self, block: usize, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Declare a local slot.
    pub fn add_local(&mut self, data: LocalData) -> Local {
        self.locals.push(data)
    }

    /// Intern a string literal.
    pub fn add_string(&mut self, bytes: &[u8]) -> StrLit {
        self.strings.push(bytes.into())
    }

    /// The parameter locals, in declaration order.
    pub fn param_locals(&self) -> impl Iterator<Item = Local> + '_ {
        self.locals
            .keys()
            .filter(move |&l| self.locals[l].is_param)
    }
}

/// A global variable.
#[derive(Clone, Debug)]
pub struct GlobalData {
    /// Symbol name.
    pub name: String,
    /// Declared type.
    pub ty: TypeIdx,
    /// Whether the global is immutable.
    pub is_const: bool,
    /// Size in bytes.
    pub size: u32,
    /// Initial bytes; `None` places the global in `__bss`.
    pub init: Option<Box<[u8]>>,
}

/// One compilation unit of flat IR.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// The unit's functions.
    pub funcs: Vec<Function>,
    /// The unit-wide global table.
    pub globals: PrimaryMap<GlobalId, GlobalData>,
}

impl Module {
    /// An empty module.
    pub fn new() -> Self {
        Self::default()
    }
}
