//! ARM64 binary code emission.
//!
//! Bit-exact encoding of every op lowering can produce, plus the function
//! scaffolding: prologue/epilogue, block terminators, and frame-relative
//! memory access (scaled unsigned offsets where possible, unscaled
//! LDUR/STUR for short negative offsets, and an x16-materialized address
//! as the fallback).
//!
//! The value order within each block is the canonical execution order
//! established by the register allocator; it is emitted exactly as given.

use crate::binemit::{CodeBuffer, Reloc, RelocEntry};
use crate::ir::{
    AuxData, Block, BlockKind, Func, IntCC, Opcode, SymRef, Value,
};
use crate::isa::aarch64::imms::{
    Imm12, ImmLogic, MoveWideConst, SImm7Scaled, SImm9, UImm12Scaled,
};
use crate::isa::aarch64::regs::{FP, SPILLTMP, ZR};
use crate::stackalloc::FrameInfo;
use log::trace;

//=============================================================================
// Instruction word packing

fn enc_arith_rrr(bits_31_21: u32, bits_15_10: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    (bits_31_21 << 21)
        | (bits_15_10 << 10)
        | ((rm as u32) << 16)
        | ((rn as u32) << 5)
        | rd as u32
}

fn enc_arith_rr_imm12(bits_31_24: u32, imm: Imm12, rn: u8, rd: u8) -> u32 {
    (bits_31_24 << 24)
        | (imm.shift_bits() << 22)
        | (imm.imm_bits() << 10)
        | ((rn as u32) << 5)
        | rd as u32
}

fn enc_arith_rr_imml(bits_31_23: u32, imm_bits: u32, rn: u8, rd: u8) -> u32 {
    (bits_31_23 << 23) | (imm_bits << 10) | ((rn as u32) << 5) | rd as u32
}

fn enc_arith_rrrr(top11: u32, rm: u8, bit15: u32, ra: u8, rn: u8, rd: u8) -> u32 {
    (top11 << 21)
        | ((rm as u32) << 16)
        | (bit15 << 15)
        | ((ra as u32) << 10)
        | ((rn as u32) << 5)
        | rd as u32
}

fn enc_jump26(op_31_26: u32, off_26_0: u32) -> u32 {
    debug_assert!(off_26_0 < (1 << 26));
    (op_31_26 << 26) | off_26_0
}

fn enc_cmpbr(op_31_24: u32, off_18_0: u32, rt: u8) -> u32 {
    debug_assert!(off_18_0 < (1 << 19));
    (op_31_24 << 24) | (off_18_0 << 5) | rt as u32
}

fn enc_cbr(op_31_24: u32, off_18_0: u32, cond: u32) -> u32 {
    debug_assert!(off_18_0 < (1 << 19));
    debug_assert!(cond < (1 << 4));
    (op_31_24 << 24) | (off_18_0 << 5) | cond
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum MoveWideOp {
    MovZ,
    MovN,
}

fn enc_move_wide(op: MoveWideOp, rd: u8, imm: MoveWideConst) -> u32 {
    let op = match op {
        MoveWideOp::MovN => 0b00,
        MoveWideOp::MovZ => 0b10,
    };
    0x92800000 | (op << 29) | ((imm.shift as u32) << 21) | ((imm.bits as u32) << 5) | rd as u32
}

fn enc_movk(rd: u8, imm: MoveWideConst) -> u32 {
    0xF2800000 | ((imm.shift as u32) << 21) | ((imm.bits as u32) << 5) | rd as u32
}

fn enc_ldst_uimm12(op_31_22: u32, imm: UImm12Scaled, rn: u8, rt: u8) -> u32 {
    (op_31_22 << 22) | (imm.bits() << 10) | ((rn as u32) << 5) | rt as u32
}

fn enc_ldst_simm9(op_31_22: u32, imm: SImm9, op_11_10: u32, rn: u8, rt: u8) -> u32 {
    (op_31_22 << 22)
        | (imm.bits() << 12)
        | (op_11_10 << 10)
        | ((rn as u32) << 5)
        | rt as u32
}

fn enc_ldst_pair(op_31_22: u32, simm7: SImm7Scaled, rn: u8, rt: u8, rt2: u8) -> u32 {
    (op_31_22 << 22)
        | (simm7.bits() << 15)
        | ((rt2 as u32) << 10)
        | ((rn as u32) << 5)
        | rt as u32
}

fn enc_adrp(rd: u8, off: i32) -> u32 {
    let off = off as u32;
    let immlo = off & 3;
    let immhi = (off >> 2) & ((1 << 19) - 1);
    0x90000000 | (immlo << 29) | (immhi << 5) | rd as u32
}

fn enc_csel(rd: u8, rn: u8, rm: u8, cond: IntCC) -> u32 {
    0x9A800000 | ((rm as u32) << 16) | (cond.bits() << 12) | ((rn as u32) << 5) | rd as u32
}

fn enc_cset(rd: u8, cond: IntCC) -> u32 {
    // CSET Rd, cond == CSINC Rd, XZR, XZR, invert(cond).
    0x9A9F07E0 | (cond.complement().bits() << 12) | rd as u32
}

fn enc_bfm64(opc: u32, rd: u8, rn: u8, immr: u32, imms: u32) -> u32 {
    debug_assert!(immr < 64 && imms < 64);
    (1 << 31)
        | (opc << 29)
        | (0b100110 << 23)
        | (1 << 22)
        | (immr << 16)
        | (imms << 10)
        | ((rn as u32) << 5)
        | rd as u32
}

fn enc_brk(imm16: u16) -> u32 {
    0xD4200000 | ((imm16 as u32) << 5)
}

fn enc_ret() -> u32 {
    0xD65F03C0
}

fn enc_mov(rd: u8, rm: u8) -> u32 {
    // MOV Xd, Xm == ORR Xd, XZR, Xm.
    enc_arith_rrr(0b10101010_000, 0, rd, ZR, rm)
}

/// MOV to/from SP must use the ADD-immediate form; register 31 means SP
/// there instead of XZR.
fn enc_mov_sp(rd: u8, rn: u8) -> u32 {
    enc_arith_rr_imm12(0b10010001, Imm12 { bits: 0, shift12: false }, rn, rd)
}

// Load/store op_31_22 selectors, unsigned-offset form. Clearing bit 2
// turns each into its unscaled (LDUR/STUR) sibling.
const LDST_X_LOAD: u32 = 0b1111100101;
const LDST_X_STORE: u32 = 0b1111100100;
const LDST_W_LOAD: u32 = 0b1011100101;
const LDST_W_STORE: u32 = 0b1011100100;
const LDST_H_LOAD: u32 = 0b0111100101;
const LDST_H_STORE: u32 = 0b0111100100;
const LDST_B_LOAD: u32 = 0b0011100101;
const LDST_B_STORE: u32 = 0b0011100100;
const LDST_SB_LOAD: u32 = 0b0011100110;
const LDST_SH_LOAD: u32 = 0b0111100110;
const LDST_SW_LOAD: u32 = 0b1011100110;
const LDP_X: u32 = 0b1010100101;
const STP_X: u32 = 0b1010100100;
const STP_X_PRE: u32 = 0b1010100110;
const LDP_X_POST: u32 = 0b1010100011;

fn unscaled(op_31_22: u32) -> u32 {
    op_31_22 & !0b100
}

fn ldst_size(op_31_22: u32) -> u32 {
    1 << (op_31_22 >> 8)
}

//=============================================================================
// Function emission

/// Emit machine code for one allocated function, returning the raw bytes
/// and their relocations.
pub fn emit_func(func: &Func, frame: &FrameInfo) -> (Vec<u8>, Vec<RelocEntry>) {
    let mut buf = CodeBuffer::new();
    // Stack parameters are addressed off the frame pointer, so reading
    // them requires the frame setup even with an empty frame.
    let reads_stack_params = func
        .values()
        .any(|v| func.value(v).opcode == Opcode::ArgStack);
    let needs_frame = frame.frame_size > 0
        || !func.is_leaf()
        || !frame.saved_regs.is_empty()
        || reads_stack_params;

    if needs_frame {
        emit_prologue(frame, &mut buf);
    }

    let blocks: Vec<Block> = func.blocks().collect();
    for (bi, &block) in blocks.iter().enumerate() {
        buf.bind_block(block);
        for &v in &func.block(block).values {
            emit_value(func, frame, v, &mut buf);
        }
        let fallthrough = blocks.get(bi + 1).copied();
        emit_terminator(func, frame, block, fallthrough, needs_frame, &mut buf);
    }

    trace!("emit: {} -> {} bytes", func.name, buf.offset());
    buf.finish()
}

fn emit_prologue(frame: &FrameInfo, buf: &mut CodeBuffer) {
    // stp x29, x30, [sp, #-16]!
    buf.put4(enc_ldst_pair(
        STP_X_PRE,
        SImm7Scaled::maybe_from_i64(-16, 8).unwrap(),
        31,
        FP,
        30,
    ));
    // mov x29, sp
    buf.put4(enc_mov_sp(FP, 31));
    if frame.frame_size > 0 {
        emit_sp_adjust(frame.frame_size, buf);
    }
    emit_csave(frame, buf, false);
}

fn emit_epilogue(frame: &FrameInfo, needs_frame: bool, buf: &mut CodeBuffer) {
    if !needs_frame {
        buf.put4(enc_ret());
        return;
    }
    emit_csave(frame, buf, true);
    // mov sp, x29
    buf.put4(enc_mov_sp(31, FP));
    // ldp x29, x30, [sp], #16
    buf.put4(enc_ldst_pair(
        LDP_X_POST,
        SImm7Scaled::maybe_from_i64(16, 8).unwrap(),
        31,
        FP,
        30,
    ));
    buf.put4(enc_ret());
}

/// sub sp, sp, #frame_size, via x16 when the immediate form cannot hold it.
fn emit_sp_adjust(frame_size: u32, buf: &mut CodeBuffer) {
    if let Some(imm) = Imm12::maybe_from_u64(frame_size as u64) {
        buf.put4(enc_arith_rr_imm12(0b11010001, imm, 31, 31));
    } else {
        emit_load_const(SPILLTMP, frame_size as u64, buf);
        // sub sp, sp, x16, uxtx
        buf.put4(0xCB206000 | ((SPILLTMP as u32) << 16) | (31 << 5) | 31);
    }
}

/// Save or restore the used callee-saved registers just below the frame
/// pointer, in pairs.
fn emit_csave(frame: &FrameInfo, buf: &mut CodeBuffer, restore: bool) {
    let regs = &frame.saved_regs;
    let mut k = 0;
    while k + 1 < regs.len() {
        let off = -(8 * (k as i64 + 2));
        let simm7 = SImm7Scaled::maybe_from_i64(off, 8).unwrap();
        let op = if restore { LDP_X } else { STP_X };
        buf.put4(enc_ldst_pair(op, simm7, FP, regs[k], regs[k + 1]));
        k += 2;
    }
    if k < regs.len() {
        let off = -(8 * (k as i64 + 1));
        let op = if restore {
            unscaled(LDST_X_LOAD)
        } else {
            unscaled(LDST_X_STORE)
        };
        buf.put4(enc_ldst_simm9(
            op,
            SImm9::maybe_from_i64(off).unwrap(),
            0b00,
            FP,
            regs[k],
        ));
    }
}

/// Materialize an arbitrary 64-bit constant into `rd` with MOVZ/MOVK.
fn emit_load_const(rd: u8, value: u64, buf: &mut CodeBuffer) {
    if let Some(imm) = MoveWideConst::maybe_from_u64(value) {
        buf.put4(enc_move_wide(MoveWideOp::MovZ, rd, imm));
        return;
    }
    if let Some(imm) = MoveWideConst::maybe_from_u64(!value) {
        buf.put4(enc_move_wide(MoveWideOp::MovN, rd, imm));
        return;
    }
    let mut first = true;
    for shift in 0..4u8 {
        let chunk = (value >> (16 * shift)) & 0xffff;
        if first {
            // Seed with MOVZ, even when the low chunk is zero, so the
            // untouched lanes are defined.
            if chunk != 0 || shift == 3 {
                buf.put4(enc_move_wide(
                    MoveWideOp::MovZ,
                    rd,
                    MoveWideConst::chunk_of(value, shift),
                ));
                first = false;
            }
            continue;
        }
        if chunk != 0 {
            buf.put4(enc_movk(rd, MoveWideConst::chunk_of(value, shift)));
        }
    }
}

/// A load or store of `rt` at [x29 + off], picking scaled, unscaled or
/// x16-assisted addressing.
fn emit_fp_ldst(op_31_22: u32, off: i32, rt: u8, buf: &mut CodeBuffer) {
    let size = ldst_size(op_31_22);
    if let Some(imm) = UImm12Scaled::maybe_from_i64(off as i64, size) {
        buf.put4(enc_ldst_uimm12(op_31_22, imm, FP, rt));
    } else if let Some(simm9) = SImm9::maybe_from_i64(off as i64) {
        buf.put4(enc_ldst_simm9(unscaled(op_31_22), simm9, 0b00, FP, rt));
    } else {
        emit_load_const(SPILLTMP, off as i64 as u64, buf);
        // add x16, x29, x16
        buf.put4(enc_arith_rrr(0b10001011_000, 0, SPILLTMP, FP, SPILLTMP));
        buf.put4(enc_ldst_simm9(
            unscaled(op_31_22),
            SImm9::maybe_from_i64(0).unwrap(),
            0b00,
            SPILLTMP,
            rt,
        ));
    }
}

fn reg_of(func: &Func, v: Value) -> u8 {
    func.home[v].unwrap_reg()
}

fn arg_reg(func: &Func, v: Value, i: usize) -> u8 {
    reg_of(func, func.value(v).args[i])
}

fn emit_value(func: &Func, frame: &FrameInfo, v: Value, buf: &mut CodeBuffer) {
    use Opcode::*;
    let data = func.value(v);
    match data.opcode {
        // Location markers; no code.
        Phi | Arg | ArgStack | SelectN => {}

        Copy => {
            let rd = reg_of(func, v);
            let rm = arg_reg(func, v, 0);
            if rd != rm {
                buf.put4(enc_mov(rd, rm));
            }
        }

        StoreReg => {
            let rt = arg_reg(func, v, 0);
            let off = func.home[v].unwrap_stack();
            emit_fp_ldst(LDST_X_STORE, off, rt, buf);
        }
        LoadReg => {
            let rd = reg_of(func, v);
            let off = func.home[data.args[0]].unwrap_stack();
            emit_fp_ldst(LDST_X_LOAD, off, rd, buf);
        }

        A64Movz => {
            let imm = MoveWideConst::maybe_from_u64(data.aux_int as u64)
                .expect("movz constant not movz-encodable");
            buf.put4(enc_move_wide(MoveWideOp::MovZ, reg_of(func, v), imm));
        }
        A64Movn => {
            let imm = MoveWideConst::maybe_from_u64(!(data.aux_int as u64))
                .expect("movn constant not movn-encodable");
            buf.put4(enc_move_wide(MoveWideOp::MovN, reg_of(func, v), imm));
        }
        A64LoadConst => {
            emit_load_const(reg_of(func, v), data.aux_int as u64, buf);
        }
        A64SymAddr => {
            let sym = match &data.aux {
                AuxData::Sym(sym) => sym.clone(),
                aux => panic!("sym_addr without symbol: {aux:?}"),
            };
            let rd = reg_of(func, v);
            buf.reloc(Reloc::Page21, sym.clone(), 0);
            buf.put4(enc_adrp(rd, 0));
            buf.reloc(Reloc::PageOff12, sym, 0);
            buf.put4(enc_arith_rr_imm12(
                0b10010001,
                Imm12 { bits: 0, shift12: false },
                rd,
                rd,
            ));
        }
        A64LocalAddr => {
            let local = match data.aux {
                AuxData::LocalVar(local) => local,
                ref aux => panic!("local_addr without local: {aux:?}"),
            };
            let rd = reg_of(func, v);
            let off = frame.local_offsets[local] as i64;
            let mag = off.unsigned_abs();
            let op: u32 = if off < 0 { 0b11010001 } else { 0b10010001 };
            if let Some(imm) = Imm12::maybe_from_u64(mag) {
                buf.put4(enc_arith_rr_imm12(op, imm, FP, rd));
            } else {
                emit_load_const(rd, mag, buf);
                // add/sub rd, x29, rd
                let bits = if off < 0 { 0b11001011_000 } else { 0b10001011_000 };
                buf.put4(enc_arith_rrr(bits, 0, rd, FP, rd));
            }
        }

        A64Add => buf.put4(enc_arith_rrr(
            0b10001011_000,
            0,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Sub => buf.put4(enc_arith_rrr(
            0b11001011_000,
            0,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Neg => buf.put4(enc_arith_rrr(
            0b11001011_000,
            0,
            reg_of(func, v),
            ZR,
            arg_reg(func, v, 0),
        )),
        A64AddImm => buf.put4(enc_arith_rr_imm12(
            0b10010001,
            Imm12::maybe_from_u64(data.aux_int as u64).expect("add_imm out of range"),
            arg_reg(func, v, 0),
            reg_of(func, v),
        )),
        A64SubImm => buf.put4(enc_arith_rr_imm12(
            0b11010001,
            Imm12::maybe_from_u64(data.aux_int as u64).expect("sub_imm out of range"),
            arg_reg(func, v, 0),
            reg_of(func, v),
        )),

        A64Mul => buf.put4(enc_arith_rrrr(
            0b10011011_000,
            arg_reg(func, v, 1),
            0,
            ZR,
            arg_reg(func, v, 0),
            reg_of(func, v),
        )),
        A64MSub => buf.put4(enc_arith_rrrr(
            0b10011011_000,
            arg_reg(func, v, 1),
            1,
            arg_reg(func, v, 2),
            arg_reg(func, v, 0),
            reg_of(func, v),
        )),
        A64SDiv => buf.put4(enc_arith_rrr(
            0b10011010_110,
            0b000011,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64UDiv => buf.put4(enc_arith_rrr(
            0b10011010_110,
            0b000010,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),

        A64And => buf.put4(enc_arith_rrr(
            0b10001010_000,
            0,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Orr => buf.put4(enc_arith_rrr(
            0b10101010_000,
            0,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Eor => buf.put4(enc_arith_rrr(
            0b11001010_000,
            0,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Mvn => buf.put4(enc_arith_rrr(
            0b10101010_001,
            0,
            reg_of(func, v),
            ZR,
            arg_reg(func, v, 0),
        )),
        A64AndImm => emit_logical_imm(func, v, 0b100100100, buf),
        A64OrrImm => emit_logical_imm(func, v, 0b101100100, buf),
        A64EorImm => emit_logical_imm(func, v, 0b110100100, buf),

        A64Lsl => buf.put4(enc_arith_rrr(
            0b10011010_110,
            0b001000,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Lsr => buf.put4(enc_arith_rrr(
            0b10011010_110,
            0b001001,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64Asr => buf.put4(enc_arith_rrr(
            0b10011010_110,
            0b001010,
            reg_of(func, v),
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64LslImm => {
            let sh = data.aux_int as u32;
            buf.put4(enc_bfm64(
                0b10,
                reg_of(func, v),
                arg_reg(func, v, 0),
                64 - sh,
                63 - sh,
            ));
        }
        A64LsrImm => {
            let sh = data.aux_int as u32;
            buf.put4(enc_bfm64(0b10, reg_of(func, v), arg_reg(func, v, 0), sh, 63));
        }
        A64AsrImm => {
            let sh = data.aux_int as u32;
            buf.put4(enc_bfm64(0b00, reg_of(func, v), arg_reg(func, v, 0), sh, 63));
        }

        A64Sxtb => buf.put4(enc_bfm64(0b00, reg_of(func, v), arg_reg(func, v, 0), 0, 7)),
        A64Sxth => buf.put4(enc_bfm64(0b00, reg_of(func, v), arg_reg(func, v, 0), 0, 15)),
        A64Sxtw => buf.put4(enc_bfm64(0b00, reg_of(func, v), arg_reg(func, v, 0), 0, 31)),
        A64Uxtb => buf.put4(enc_bfm64(0b10, reg_of(func, v), arg_reg(func, v, 0), 0, 7)),
        A64Uxth => buf.put4(enc_bfm64(0b10, reg_of(func, v), arg_reg(func, v, 0), 0, 15)),
        A64Uxtw => buf.put4(enc_bfm64(0b10, reg_of(func, v), arg_reg(func, v, 0), 0, 31)),

        A64Cmp => buf.put4(enc_arith_rrr(
            0b11101011_000,
            0,
            ZR,
            arg_reg(func, v, 0),
            arg_reg(func, v, 1),
        )),
        A64CmpImm => buf.put4(enc_arith_rr_imm12(
            0b11110001,
            Imm12::maybe_from_u64(data.aux_int as u64).expect("cmp_imm out of range"),
            arg_reg(func, v, 0),
            ZR,
        )),
        A64CmpSet => {
            let cc = cond_of(data);
            buf.put4(enc_arith_rrr(
                0b11101011_000,
                0,
                ZR,
                arg_reg(func, v, 0),
                arg_reg(func, v, 1),
            ));
            buf.put4(enc_cset(reg_of(func, v), cc));
        }
        A64CmpImmSet => {
            let cc = cond_of(data);
            buf.put4(enc_arith_rr_imm12(
                0b11110001,
                Imm12::maybe_from_u64(data.aux_int as u64).expect("cmp_imm out of range"),
                arg_reg(func, v, 0),
                ZR,
            ));
            buf.put4(enc_cset(reg_of(func, v), cc));
        }
        A64CSel => {
            // cmp cond, #0; csel rd, a, b, ne
            buf.put4(enc_arith_rr_imm12(
                0b11110001,
                Imm12 { bits: 0, shift12: false },
                arg_reg(func, v, 0),
                ZR,
            ));
            buf.put4(enc_csel(
                reg_of(func, v),
                arg_reg(func, v, 1),
                arg_reg(func, v, 2),
                IntCC::NotEqual,
            ));
        }

        A64Ldrb => emit_load(func, v, LDST_B_LOAD, buf),
        A64Ldrh => emit_load(func, v, LDST_H_LOAD, buf),
        A64Ldrw => emit_load(func, v, LDST_W_LOAD, buf),
        A64Ldr => emit_load(func, v, LDST_X_LOAD, buf),
        A64Ldrsb => emit_load(func, v, LDST_SB_LOAD, buf),
        A64Ldrsh => emit_load(func, v, LDST_SH_LOAD, buf),
        A64Ldrsw => emit_load(func, v, LDST_SW_LOAD, buf),
        A64Strb => emit_store(func, v, LDST_B_STORE, buf),
        A64Strh => emit_store(func, v, LDST_H_STORE, buf),
        A64Strw => emit_store(func, v, LDST_W_STORE, buf),
        A64Str => emit_store(func, v, LDST_X_STORE, buf),

        A64StoreArg => {
            let rt = arg_reg(func, v, 0);
            let imm = UImm12Scaled::maybe_from_i64(data.aux_int, 8)
                .expect("outgoing argument offset out of range");
            buf.put4(enc_ldst_uimm12(LDST_X_STORE, imm, 31, rt));
        }

        A64NilCheck => {
            // cbnz rt, +8 ; brk #1
            let rt = arg_reg(func, v, 0);
            buf.put4(enc_cmpbr(0b1011_0101, 2, rt));
            buf.put4(enc_brk(1));
        }

        A64Call => {
            let name = match &data.aux {
                AuxData::Call(aux) => aux.name.clone(),
                aux => panic!("call without descriptor: {aux:?}"),
            };
            buf.reloc(Reloc::Branch26, SymRef::Func(name), 0);
            buf.put4(enc_jump26(0b100101, 0));
        }

        opcode => panic!(
            "{}: cannot emit {opcode} ({v}); lowering should have removed it",
            func.name
        ),
    }
}

fn cond_of(data: &crate::ir::ValueData) -> IntCC {
    match data.aux {
        AuxData::Cond(cc) => cc,
        ref aux => panic!("compare without condition: {aux:?}"),
    }
}

fn emit_logical_imm(func: &Func, v: Value, bits_31_23: u32, buf: &mut CodeBuffer) {
    let data = func.value(v);
    let imm = ImmLogic::maybe_from_u64(data.aux_int as u64)
        .expect("logical immediate not encodable");
    buf.put4(enc_arith_rr_imml(
        bits_31_23,
        imm.enc_bits(),
        arg_reg(func, v, 0),
        reg_of(func, v),
    ));
}

fn emit_load(func: &Func, v: Value, op_31_22: u32, buf: &mut CodeBuffer) {
    let data = func.value(v);
    let rn = arg_reg(func, v, 0);
    let rd = reg_of(func, v);
    let imm = UImm12Scaled::maybe_from_i64(data.aux_int, ldst_size(op_31_22))
        .expect("load offset out of range");
    buf.put4(enc_ldst_uimm12(op_31_22, imm, rn, rd));
}

fn emit_store(func: &Func, v: Value, op_31_22: u32, buf: &mut CodeBuffer) {
    let data = func.value(v);
    let rt = arg_reg(func, v, 0);
    let rn = arg_reg(func, v, 1);
    let imm = UImm12Scaled::maybe_from_i64(data.aux_int, ldst_size(op_31_22))
        .expect("store offset out of range");
    buf.put4(enc_ldst_uimm12(op_31_22, imm, rn, rt));
}

fn emit_terminator(
    func: &Func,
    frame: &FrameInfo,
    block: Block,
    fallthrough: Option<Block>,
    needs_frame: bool,
    buf: &mut CodeBuffer,
) {
    let data = func.block(block);
    match data.kind {
        BlockKind::Plain => {
            let target = data.succs[0].block;
            if fallthrough != Some(target) {
                buf.put4_branch26(enc_jump26(0b000101, 0), target);
            }
        }
        BlockKind::If => {
            let taken = data.succs[0].block;
            let other = data.succs[1].block;
            match data.cond {
                Some(cc) => {
                    buf.put4_branch19(enc_cbr(0b01010100, 0, cc.bits()), taken);
                }
                None => {
                    let rt = reg_of(func, data.control[0]);
                    buf.put4_branch19(enc_cmpbr(0b1011_0101, 0, rt), taken);
                }
            }
            if fallthrough != Some(other) {
                buf.put4_branch26(enc_jump26(0b000101, 0), other);
            }
        }
        BlockKind::Ret => {
            emit_epilogue(frame, needs_frame, buf);
        }
        BlockKind::Exit => {
            buf.put4(enc_brk(1));
        }
    }
}
