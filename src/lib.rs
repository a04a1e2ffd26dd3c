//! Code generator for the Cot compiler.
//!
//! This crate is the middle/back end of the Cot compiler: it consumes the
//! typed, lowered IR produced by the frontend (see [`flat`]) and produces an
//! ARM64 Mach-O relocatable object. The pipeline per function is:
//!
//! ```text
//! flat IR -> SSA build -> lowering -> liveness -> regalloc -> stackalloc -> emit
//! ```
//!
//! followed by a per-unit Mach-O write. Each phase consumes the previous
//! phase's output; there is no iteration between phases. The [`Context`]
//! struct composes the phases and holds allocations across function
//! compilations.
//!
//! The frontend (lexer, parser, resolver, type checker) lives elsewhere in
//! the compiler; this crate assumes well-formed input and asserts liberally.

#![warn(missing_docs)]

pub mod binemit;
pub mod context;
pub mod flat;
pub mod fx;
pub mod ir;
pub mod isa;
pub mod liveness;
pub mod obj;
pub mod regalloc;
pub mod result;
pub mod ssa;
pub mod stackalloc;
pub mod verifier;

pub use crate::context::Context;
pub use crate::result::{CodegenError, CodegenResult};
