//! IR entity references.
//!
//! Values, blocks and the other per-function entities are referenced by
//! compact `u32` indices into tables owned by the `Func`, not by Rust
//! references. This keeps the in-memory representation small and sidesteps
//! the dangling-pointer hazards of growable tables; there is a separate
//! index type for each entity so we don't lose type safety.

use core::u32;
use cranelift_entity::entity_impl;

/// An opaque reference to an SSA value.
///
/// Every value is owned by exactly one [`Func`](super::Func); ids are dense
/// and unique within it. Freed values are recycled through the function's
/// free list and never survive the function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

impl Value {
    /// Create a value reference from its number, as used in the `vNN`
    /// textual notation.
    pub fn with_number(n: u32) -> Option<Self> {
        if n < u32::MAX {
            Some(Self(n))
        } else {
            None
        }
    }
}

/// An opaque reference to a basic block.
///
/// The order of block ids is stable but arbitrary; layout order is the
/// creation order, which follows the frontend's block numbering.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a local variable slot in the function's local
/// table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Local(u32);
entity_impl!(Local, "local");

/// An opaque reference to an interned string literal.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrLit(u32);
entity_impl!(StrLit, "str");

/// An opaque reference to a global variable in the unit-wide global table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);
entity_impl!(GlobalId, "gv");
