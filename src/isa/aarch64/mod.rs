//! ARM64 (AArch64) target support: register environment, immediate
//! formats, the ABI analyzer, instruction selection, and binary emission.

pub mod abi;
pub mod emit;
pub mod imms;
pub mod lower;
pub mod regs;
