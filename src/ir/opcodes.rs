//! Operation tags and the op table.
//!
//! Every SSA value carries an [`Opcode`]. The properties a pass may need —
//! argument count, aux payload kind, rematerializability, side effects — live
//! in a single constant table indexed by the tag. Passes must query the
//! table instead of pattern-matching on op identity, so a property change is
//! a one-line edit here.
//!
//! The enum and the table are produced by one macro invocation; they cannot
//! drift out of order.

use crate::ir::condcodes::IntCC;
use crate::ir::entities::{GlobalId, Local, StrLit};
use crate::ir::extfunc::AuxCall;
use crate::ir::types::TypeIdx;

/// Which payload an op carries in its value's `aux` slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuxKind {
    /// No tagged payload (the `aux_int` field may still be used).
    None,
    /// Only the signed 64-bit `aux_int` field.
    IntVal,
    /// A string literal reference.
    Str,
    /// A local variable reference.
    LocalVar,
    /// A symbol reference (function, literal or global address).
    Sym,
    /// A condition code.
    Cond,
    /// A call descriptor.
    Call,
    /// A type reference.
    TypeRef,
}

/// A symbol an address-producing op refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymRef {
    /// A function or runtime symbol, by name.
    Func(Box<str>),
    /// A string literal in the function's literal table.
    Str(StrLit),
    /// A global variable.
    Global(GlobalId),
}

/// The tagged aux payload of a value.
#[derive(Clone, Debug, Default)]
pub enum AuxData {
    /// No payload.
    #[default]
    None,
    /// A string literal.
    Str(StrLit),
    /// A local variable.
    LocalVar(Local),
    /// A symbol.
    Sym(SymRef),
    /// A condition code.
    Cond(IntCC),
    /// A call descriptor.
    Call(Box<AuxCall>),
    /// A type reference.
    TypeRef(TypeIdx),
}

/// Static properties of one opcode.
#[derive(Copy, Clone, Debug)]
pub struct OpInfo {
    /// Display name.
    pub name: &'static str,
    /// Number of arguments, or -1 for variadic ops.
    pub arg_len: i8,
    /// Which aux payload the op carries.
    pub aux: AuxKind,
    /// Target-independent op; must not survive lowering.
    pub generic: bool,
    /// May be recomputed into any register instead of spilled/reloaded.
    pub rematerializable: bool,
    /// `op(a, b) == op(b, a)`.
    pub commutative: bool,
    /// Two-operand form: the result must be allocated to arg0's register.
    pub result_in_arg0: bool,
    /// Execution destroys the processor flags.
    pub clobber_flags: bool,
    /// A function call; clobbers caller-saved registers.
    pub call: bool,
    /// Must not be discarded even when unused.
    pub has_side_effects: bool,
    /// Reads from memory.
    pub reads_memory: bool,
    /// Writes to memory.
    pub writes_memory: bool,
    /// Traps when arg0 is nil.
    pub nil_check: bool,
    /// Faults (rather than trapping deliberately) on nil arg0.
    pub fault_on_nil_arg0: bool,
    /// Consumes the processor flags.
    pub uses_flags: bool,
}

impl OpInfo {
    const DEFAULT: OpInfo = OpInfo {
        name: "",
        arg_len: 0,
        aux: AuxKind::None,
        generic: false,
        rematerializable: false,
        commutative: false,
        result_in_arg0: false,
        clobber_flags: false,
        call: false,
        has_side_effects: false,
        reads_memory: false,
        writes_memory: false,
        nil_check: false,
        fault_on_nil_arg0: false,
        uses_flags: false,
    };
}

macro_rules! define_opcodes {
    ($(
        $(#[$attr:meta])*
        $name:ident = $display:literal, args($args:expr), aux($aux:ident) $(, $flag:ident)* ;
    )*) => {
        /// An operation tag.
        ///
        /// Ops named `A64*` are ARM64-specific and only appear after
        /// lowering; all other ops are target-independent.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $( $(#[$attr])* $name, )*
        }

        /// The op table, indexed by `Opcode as usize`.
        pub static OPCODE_INFO: &[OpInfo] = &[
            $( OpInfo {
                name: $display,
                arg_len: $args,
                aux: AuxKind::$aux,
                $( $flag: true, )*
                ..OpInfo::DEFAULT
            }, )*
        ];

        impl Opcode {
            /// Every opcode, in table order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];
        }
    };
}

define_opcodes! {
    // ---- target-independent ops ----

    /// Placeholder for a variable read in an unsealed block; `aux_int` is
    /// the local index. Rewritten in place when the block seals.
    FwdRef = "fwd_ref", args(0), aux(IntVal), generic;
    /// Merge-point selection; operands ordered to match the predecessors.
    Phi = "phi", args(-1), aux(None), generic;
    /// Register-to-register move.
    Copy = "copy", args(1), aux(None), generic;
    /// A register-passed parameter; `aux_int` is the ABI register number.
    Arg = "arg", args(0), aux(IntVal), generic;
    /// A stack-passed parameter; `aux_int` is its frame-pointer offset.
    ArgStack = "arg_stack", args(0), aux(IntVal), generic;
    /// Integer constant in `aux_int`.
    ConstInt = "const_int", args(0), aux(IntVal), generic, rematerializable;
    /// String literal constant: a (pointer, length) pair.
    ConstStr = "const_str", args(0), aux(Str), generic;
    /// Address of a local variable slot.
    LocalAddr = "local_addr", args(0), aux(LocalVar), generic, rematerializable;
    /// Address of a global variable.
    GlobalAddr = "global_addr", args(0), aux(Sym), generic, rematerializable;
    /// Typed load through arg0.
    Load = "load", args(1), aux(None), generic, reads_memory;
    /// Store arg1 through arg0.
    Store = "store", args(2), aux(None), generic, writes_memory, has_side_effects;

    Add = "add", args(2), aux(None), generic, commutative;
    Sub = "sub", args(2), aux(None), generic;
    Mul = "mul", args(2), aux(None), generic, commutative;
    Div = "div", args(2), aux(None), generic;
    Rem = "rem", args(2), aux(None), generic;
    And = "and", args(2), aux(None), generic, commutative;
    Or = "or", args(2), aux(None), generic, commutative;
    Xor = "xor", args(2), aux(None), generic, commutative;
    Shl = "shl", args(2), aux(None), generic;
    Shr = "shr", args(2), aux(None), generic;
    Neg = "neg", args(1), aux(None), generic;
    Not = "not", args(1), aux(None), generic;

    Eq = "eq", args(2), aux(None), generic, commutative;
    Ne = "ne", args(2), aux(None), generic, commutative;
    Lt = "lt", args(2), aux(None), generic;
    Le = "le", args(2), aux(None), generic;
    Gt = "gt", args(2), aux(None), generic;
    Ge = "ge", args(2), aux(None), generic;

    /// `arg1 if arg0 != 0 else arg2`.
    Select = "select", args(3), aux(None), generic;
    /// Sign-extend arg0 to the result type.
    Sext = "sext", args(1), aux(None), generic;
    /// Zero-extend arg0 to the result type.
    Uext = "uext", args(1), aux(None), generic;
    /// Truncate arg0 to the result type.
    Trunc = "trunc", args(1), aux(None), generic;

    /// Address of the caller-allocated return buffer (the x8 parameter).
    /// Only appears in flat IR; the SSA builder resolves it to the hidden
    /// argument value.
    RetSlotAddr = "ret_slot_addr", args(0), aux(None), generic;

    /// Direct call; the aux call descriptor names the callee and its ABI.
    Call = "call", args(-1), aux(Call), generic, call, has_side_effects, clobber_flags;
    /// Concatenate two strings; becomes a runtime call.
    StrConcat = "string_concat", args(2), aux(None), generic, call, has_side_effects, clobber_flags;
    /// Trap if arg0 is nil.
    NilCheck = "nil_check", args(1), aux(None), generic, has_side_effects, nil_check, fault_on_nil_arg0;
    /// Build a two-register value from word components.
    MakeTuple = "make_tuple", args(2), aux(None), generic;
    /// Extract register `aux_int` of a multi-register call result.
    SelectN = "select_n", args(1), aux(IntVal), generic;

    /// Spill arg0 to its stack slot. Created by regalloc.
    StoreReg = "store_reg", args(1), aux(None), generic, has_side_effects;
    /// Reload from the spill (or incoming-argument) slot of arg0.
    LoadReg = "load_reg", args(1), aux(None), generic;

    // ---- ARM64 ops ----

    A64Add = "arm64_add", args(2), aux(None), commutative;
    A64AddImm = "arm64_add_imm", args(1), aux(IntVal);
    A64Sub = "arm64_sub", args(2), aux(None);
    A64SubImm = "arm64_sub_imm", args(1), aux(IntVal);
    A64Neg = "arm64_neg", args(1), aux(None);
    A64Mul = "arm64_mul", args(2), aux(None), commutative;
    A64SDiv = "arm64_sdiv", args(2), aux(None);
    A64UDiv = "arm64_udiv", args(2), aux(None);
    /// `arg2 - arg0 * arg1`.
    A64MSub = "arm64_msub", args(3), aux(None);
    A64And = "arm64_and", args(2), aux(None), commutative;
    A64AndImm = "arm64_and_imm", args(1), aux(IntVal);
    A64Orr = "arm64_orr", args(2), aux(None), commutative;
    A64OrrImm = "arm64_orr_imm", args(1), aux(IntVal);
    A64Eor = "arm64_eor", args(2), aux(None), commutative;
    A64EorImm = "arm64_eor_imm", args(1), aux(IntVal);
    A64Mvn = "arm64_mvn", args(1), aux(None);
    A64Lsl = "arm64_lsl", args(2), aux(None);
    A64LslImm = "arm64_lsl_imm", args(1), aux(IntVal);
    A64Lsr = "arm64_lsr", args(2), aux(None);
    A64LsrImm = "arm64_lsr_imm", args(1), aux(IntVal);
    A64Asr = "arm64_asr", args(2), aux(None);
    A64AsrImm = "arm64_asr_imm", args(1), aux(IntVal);

    /// MOVZ-expressible constant in `aux_int`.
    A64Movz = "arm64_movz", args(0), aux(IntVal), rematerializable;
    /// MOVN-expressible constant in `aux_int`.
    A64Movn = "arm64_movn", args(0), aux(IntVal), rematerializable;
    /// Arbitrary 64-bit constant; emits a MOVZ/MOVK sequence.
    A64LoadConst = "arm64_load_const", args(0), aux(IntVal), rematerializable;
    /// Symbol address; emits ADRP+ADD with PAGE21/PAGEOFF12 relocations.
    A64SymAddr = "arm64_sym_addr", args(0), aux(Sym), rematerializable;
    /// Address of a local slot, computed from the frame pointer.
    A64LocalAddr = "arm64_local_addr", args(0), aux(LocalVar), rematerializable;

    /// Compare two registers, producing flags for the block branch.
    A64Cmp = "arm64_cmp", args(2), aux(None), clobber_flags;
    /// Compare a register against `aux_int`, producing flags.
    A64CmpImm = "arm64_cmp_imm", args(1), aux(IntVal), clobber_flags;
    /// Fused CMP+CSET: materialize a comparison as 0/1.
    A64CmpSet = "arm64_cmp_set", args(2), aux(Cond), clobber_flags;
    /// Fused CMP#imm+CSET; the immediate is in `aux_int`.
    A64CmpImmSet = "arm64_cmp_imm_set", args(1), aux(Cond), clobber_flags;
    /// Fused CMP#0+CSEL: `arg1 if arg0 != 0 else arg2`.
    A64CSel = "arm64_csel", args(3), aux(None), clobber_flags;

    A64Sxtb = "arm64_sxtb", args(1), aux(None);
    A64Sxth = "arm64_sxth", args(1), aux(None);
    A64Sxtw = "arm64_sxtw", args(1), aux(None);
    A64Uxtb = "arm64_uxtb", args(1), aux(None);
    A64Uxth = "arm64_uxth", args(1), aux(None);
    A64Uxtw = "arm64_uxtw", args(1), aux(None);

    A64Ldrb = "arm64_ldrb", args(1), aux(IntVal), reads_memory;
    A64Ldrh = "arm64_ldrh", args(1), aux(IntVal), reads_memory;
    A64Ldrw = "arm64_ldrw", args(1), aux(IntVal), reads_memory;
    A64Ldr = "arm64_ldr", args(1), aux(IntVal), reads_memory;
    A64Ldrsb = "arm64_ldrsb", args(1), aux(IntVal), reads_memory;
    A64Ldrsh = "arm64_ldrsh", args(1), aux(IntVal), reads_memory;
    A64Ldrsw = "arm64_ldrsw", args(1), aux(IntVal), reads_memory;
    A64Strb = "arm64_strb", args(2), aux(IntVal), writes_memory, has_side_effects;
    A64Strh = "arm64_strh", args(2), aux(IntVal), writes_memory, has_side_effects;
    A64Strw = "arm64_strw", args(2), aux(IntVal), writes_memory, has_side_effects;
    A64Str = "arm64_str", args(2), aux(IntVal), writes_memory, has_side_effects;

    /// Store an outgoing stack argument at SP + `aux_int`.
    A64StoreArg = "arm64_store_arg", args(1), aux(IntVal), writes_memory, has_side_effects;
    /// BL to the aux call descriptor's symbol.
    A64Call = "arm64_call", args(-1), aux(Call), call, has_side_effects, clobber_flags;
    /// CBZ-over-BRK nil check.
    A64NilCheck = "arm64_nil_check", args(1), aux(None), has_side_effects, nil_check, fault_on_nil_arg0;
}

impl Opcode {
    /// The table row for this opcode.
    #[inline]
    pub fn info(self) -> &'static OpInfo {
        &OPCODE_INFO[self as usize]
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Declared argument count, or -1 for variadic ops.
    pub fn arg_len(self) -> i8 {
        self.info().arg_len
    }

    /// Target-independent?
    pub fn is_generic(self) -> bool {
        self.info().generic
    }

    /// Recomputable into any register instead of spilled?
    pub fn is_rematerializable(self) -> bool {
        self.info().rematerializable
    }

    /// A function call?
    pub fn is_call(self) -> bool {
        self.info().call
    }

    /// Must be kept even when the result is unused?
    pub fn has_side_effects(self) -> bool {
        self.info().has_side_effects
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
