//! Compilation context and backend entry points.
//!
//! `Context` composes the backend phases in their fixed order:
//!
//! ```text
//! SSA build -> critical-edge split -> lowering -> liveness
//!          -> regalloc -> stackalloc -> emission
//! ```
//!
//! Each phase consumes the previous phase's output; there is no iteration
//! between phases. One `Context` is intended per compilation thread; the
//! shared `TypeRegistry` is read-only by the time code generation runs.

use crate::binemit::RelocEntry;
use crate::flat;
use crate::ir::{Func, TypeRegistry};
use crate::isa::aarch64::{emit, lower};
use crate::obj::ObjectBuilder;
use crate::regalloc;
use crate::result::CodegenResult;
use crate::stackalloc;
use crate::verifier;
use crate::liveness;
use log::debug;
use target_lexicon::Triple;

/// The result of compiling one function.
pub struct CompiledFunc {
    /// The function, fully allocated; useful for tests and dumps.
    pub func: Func,
    /// Raw machine code.
    pub code: Vec<u8>,
    /// Relocations against symbols outside the function.
    pub relocs: Vec<RelocEntry>,
}

/// Persistent state for compiling functions one after another.
pub struct Context<'a> {
    types: &'a TypeRegistry,
}

impl<'a> Context<'a> {
    /// A context over a frozen type registry.
    pub fn new(types: &'a TypeRegistry) -> Self {
        Self { types }
    }

    /// Run the whole backend pipeline over one function of flat IR.
    pub fn compile_function(&mut self, input: &flat::Function) -> CodegenResult<CompiledFunc> {
        debug!("compile: {}", input.name);
        let mut func = crate::ssa::build(input, self.types);
        self.verify(&func)?;

        regalloc::split_critical_edges(&mut func);
        lower::lower(&mut func, self.types);
        self.verify(&func)?;

        let live = liveness::compute(&func, self.types);
        let alloc = regalloc::run(&mut func, self.types, &live);
        let frame = stackalloc::run(&mut func, self.types, &alloc);
        self.verify(&func)?;
        if cfg!(debug_assertions) {
            verifier::verify_locations(&func, self.types)?;
        }

        let (code, relocs) = emit::emit_func(&func, &frame);
        Ok(CompiledFunc { func, code, relocs })
    }

    fn verify(&self, func: &Func) -> CodegenResult<()> {
        if cfg!(debug_assertions) {
            verifier::verify_func(func, self.types)?;
        }
        Ok(())
    }
}

/// Compile a whole unit to a Mach-O relocatable object for `triple`.
///
/// This is the top-level backend call: it either returns the complete
/// object bytes or the first error; there is no partial output.
pub fn compile_unit(
    module: &flat::Module,
    types: &TypeRegistry,
    triple: &Triple,
) -> CodegenResult<Vec<u8>> {
    let mut object = ObjectBuilder::new(triple)?;
    object.declare_globals(&module.globals);
    let mut cx = Context::new(types);
    for input in &module.funcs {
        let compiled = cx.compile_function(input)?;
        object.define_function(&compiled.func, compiled.code, compiled.relocs)?;
    }
    object.finish()
}
