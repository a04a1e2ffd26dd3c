//! Intermediate representation: the SSA data model.
//!
//! The representation is the classic sea-of-blocks SSA: a [`Func`] owning
//! numbered [`Block`]s and [`Value`]s, an op table describing every
//! operation's static properties, and a home map assigning each runtime
//! value a register or stack location once allocation has run.

pub mod condcodes;
pub mod entities;
pub mod extfunc;
pub mod function;
pub mod opcodes;
pub mod sourceloc;
pub mod types;
pub mod valueloc;

pub use self::condcodes::IntCC;
pub use self::entities::{Block, GlobalId, Local, StrLit, Value};
pub use self::extfunc::{AbiParam, AbiSig, AuxCall, Signature};
pub use self::function::{
    BlockData, BlockKind, BranchHint, Edge, Func, LocalData, ValueData,
};
pub use self::opcodes::{AuxData, AuxKind, OpInfo, Opcode, SymRef, OPCODE_INFO};
pub use self::sourceloc::SourceLoc;
pub use self::types::{PassClass, TypeIdx, TypeRegistry};
pub use self::valueloc::ValueLoc;
