//! Scalar per-opcode emission templates.
//!
//! Invariant throughout: scalar IR values live zero-extended in their host
//! registers (32-bit writes clear the upper half), and U1 values are the
//! integers 0 or 1.

use arx_ir::{InstRef, Opcode, Value};
use arx_state::offsets;

use crate::asm::{Gpr, HostCond, Mem};
use crate::emit::Emitter;
use crate::regalloc::STATE_REG;

pub(crate) fn emit(em: &mut Emitter<'_>, r: InstRef) {
    let opcode = em.block.inst(r).opcode;
    match opcode {
        Opcode::GetRegister => emit_get_register(em, r),
        Opcode::SetRegister => emit_set_register(em, r),
        Opcode::GetVector => emit_get_vector(em, r),
        Opcode::SetVector => emit_set_vector(em, r),
        Opcode::GetNFlag => emit_get_flag(em, r, offsets::n_flag()),
        Opcode::GetZFlag => emit_get_flag(em, r, offsets::z_flag()),
        Opcode::GetCFlag => emit_get_flag(em, r, offsets::c_flag()),
        Opcode::GetVFlag => emit_get_flag(em, r, offsets::v_flag()),
        Opcode::SetNFlag => emit_set_flag(em, r, offsets::n_flag()),
        Opcode::SetZFlag => emit_set_flag(em, r, offsets::z_flag()),
        Opcode::SetCFlag => emit_set_flag(em, r, offsets::c_flag()),
        Opcode::SetVFlag => emit_set_flag(em, r, offsets::v_flag()),
        Opcode::AddWithCarry => emit_add_with_carry(em, r),
        Opcode::SubWithCarry => emit_sub_with_carry(em, r),
        Opcode::Mul => emit_mul(em, r),
        Opcode::And => emit_logical(em, r, LogicalOp::And),
        Opcode::Eor => emit_logical(em, r, LogicalOp::Eor),
        Opcode::Or => emit_logical(em, r, LogicalOp::Or),
        Opcode::Not => emit_not(em, r),
        Opcode::CountLeadingZeros => emit_clz(em, r),
        Opcode::LogicalShiftLeft => emit_shift(em, r, ShiftKind::Lsl),
        Opcode::LogicalShiftRight => emit_shift(em, r, ShiftKind::Lsr),
        Opcode::ArithmeticShiftRight => emit_shift(em, r, ShiftKind::Asr),
        Opcode::RotateRight => emit_shift(em, r, ShiftKind::Ror),
        Opcode::RotateRightExtended => emit_rrx(em, r),
        Opcode::MostSignificantBit => emit_msb(em, r),
        Opcode::IsZero => emit_is_zero(em, r),
        Opcode::LeastSignificantByte => emit_narrow(em, r, 8),
        Opcode::LeastSignificantHalf => emit_narrow(em, r, 16),
        Opcode::SignExtendByteToWord => emit_extend(em, r, 8, true),
        Opcode::SignExtendHalfToWord => emit_extend(em, r, 16, true),
        Opcode::ZeroExtendByteToWord => emit_extend(em, r, 8, false),
        Opcode::ZeroExtendHalfToWord => emit_extend(em, r, 16, false),
        Opcode::ByteReverseWord => emit_byte_reverse_word(em, r),
        Opcode::ByteReverseHalf => emit_byte_reverse_half(em, r),
        Opcode::ByteReverseDual => emit_byte_reverse_dual(em, r),
        Opcode::ReadMemory8 | Opcode::ReadMemory16 | Opcode::ReadMemory32
        | Opcode::ReadMemory64 => emit_read_memory(em, r),
        Opcode::WriteMemory8 | Opcode::WriteMemory16 | Opcode::WriteMemory32
        | Opcode::WriteMemory64 => emit_write_memory(em, r),
        Opcode::CallSupervisor => emit_call_supervisor(em, r),
        other => panic!("not a scalar opcode: {other:?}"),
    }
}

fn emit_get_register(em: &mut Emitter<'_>, r: InstRef) {
    let reg = em.block.inst(r).arg(0).as_u8() as usize;
    let g = em.ra.scratch_gpr(&mut em.asm);
    em.asm.mov_r32_m(g, Mem::Base(STATE_REG, offsets::reg(reg)));
    em.ra.define_gpr(em.block, r, g);
}

fn emit_set_register(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let reg = inst.arg(0).as_u8() as usize;
    let value = inst.arg(1);
    let mem = Mem::Base(STATE_REG, offsets::reg(reg));
    match value {
        Value::U32(imm) => em.asm.mov_m32_i(mem, imm),
        v => {
            let g = em.ra.use_gpr(&mut em.asm, v);
            em.asm.mov_m_r32(mem, g);
        }
    }
}

fn emit_get_vector(em: &mut Emitter<'_>, r: InstRef) {
    let q = em.block.inst(r).arg(0).as_u8() as usize;
    let x = em.ra.scratch_xmm(&mut em.asm);
    em.asm.movaps_rm(x, Mem::Base(STATE_REG, offsets::vector(q)));
    em.ra.define_xmm(em.block, r, x);
}

fn emit_set_vector(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let q = inst.arg(0).as_u8() as usize;
    let x = em.ra.use_xmm(&mut em.asm, inst.arg(1));
    em.asm.movaps_mr(Mem::Base(STATE_REG, offsets::vector(q)), x);
}

fn emit_get_flag(em: &mut Emitter<'_>, r: InstRef, offset: i32) {
    let g = em.ra.scratch_gpr(&mut em.asm);
    em.asm.movzx_r32_m8(g, Mem::Base(STATE_REG, offset));
    em.ra.define_gpr(em.block, r, g);
}

fn emit_set_flag(em: &mut Emitter<'_>, r: InstRef, offset: i32) {
    let value = em.block.inst(r).arg(0);
    let mem = Mem::Base(STATE_REG, offset);
    match value {
        Value::U1(b) => em.asm.mov_m8_i(mem, u8::from(b)),
        v => {
            let g = em.ra.use_gpr(&mut em.asm, v);
            em.asm.mov_m8_r(mem, g);
        }
    }
}

/// Put the host carry flag in the state ARM expects before an adc/sbb.
/// `invert` models subtraction's borrow sense.
fn load_carry_in(em: &mut Emitter<'_>, carry_in: Value, invert: bool) {
    match carry_in {
        Value::U1(c) => {
            if c != invert {
                em.asm.stc();
            } else {
                em.asm.clc();
            }
        }
        v => {
            let g = em.ra.use_gpr(&mut em.asm, v);
            em.asm.bt_ri32(g, 0);
            if invert {
                em.asm.cmc();
            }
        }
    }
}

/// Define the carry/overflow pseudo-results straight off the host flags.
/// Nothing that changes RFLAGS may be emitted between the arithmetic and
/// this (register moves are fine).
fn define_flag_outputs(
    em: &mut Emitter<'_>,
    carry_out: Option<(InstRef, HostCond)>,
    overflow_out: Option<InstRef>,
) {
    if let Some((co, cond)) = carry_out {
        let g = em.ra.scratch_gpr(&mut em.asm);
        em.asm.setcc(cond, g);
        em.asm.movzx_r32_r8(g, g);
        em.ra.define_gpr(em.block, co, g);
    }
    if let Some(vo) = overflow_out {
        let g = em.ra.scratch_gpr(&mut em.asm);
        em.asm.setcc(HostCond::O, g);
        em.asm.movzx_r32_r8(g, g);
        em.ra.define_gpr(em.block, vo, g);
    }
}

fn emit_add_with_carry(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let (a, b, carry_in) = (inst.arg(0), inst.arg(1), inst.arg(2));
    let carry_out = em.live_pseudo_op(r, Opcode::GetCarryFromOp);
    let overflow_out = em.live_pseudo_op(r, Opcode::GetOverflowFromOp);

    let result = em.ra.use_scratch_gpr(&mut em.asm, a);
    if carry_in == Value::U1(false) {
        match b {
            Value::U32(imm) => em.asm.add_ri32(result, imm),
            v => {
                let g = em.ra.use_gpr(&mut em.asm, v);
                em.asm.add_rr32(result, g);
            }
        }
    } else {
        // Carry-in participates: set CF first, then adc.
        match b {
            Value::U32(imm) => {
                load_carry_in(em, carry_in, false);
                em.asm.adc_ri32(result, imm);
            }
            v => {
                let g = em.ra.use_gpr(&mut em.asm, v);
                load_carry_in(em, carry_in, false);
                em.asm.adc_rr32(result, g);
            }
        }
    }
    define_flag_outputs(em, carry_out.map(|c| (c, HostCond::B)), overflow_out);
    em.ra.define_gpr(em.block, r, result);
    em.release_pseudo_uses(r);
}

fn emit_sub_with_carry(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let (a, b, carry_in) = (inst.arg(0), inst.arg(1), inst.arg(2));
    let carry_out = em.live_pseudo_op(r, Opcode::GetCarryFromOp);
    let overflow_out = em.live_pseudo_op(r, Opcode::GetOverflowFromOp);

    let result = em.ra.use_scratch_gpr(&mut em.asm, a);
    if carry_in == Value::U1(true) {
        // a - b exactly; the host borrow is the inverted ARM carry.
        match b {
            Value::U32(imm) => em.asm.sub_ri32(result, imm),
            v => {
                let g = em.ra.use_gpr(&mut em.asm, v);
                em.asm.sub_rr32(result, g);
            }
        }
    } else {
        match b {
            Value::U32(imm) => {
                load_carry_in(em, carry_in, true);
                em.asm.sbb_ri32(result, imm);
            }
            v => {
                let g = em.ra.use_gpr(&mut em.asm, v);
                load_carry_in(em, carry_in, true);
                em.asm.sbb_rr32(result, g);
            }
        }
    }
    // ARM carry for subtraction is NOT borrow.
    define_flag_outputs(em, carry_out.map(|c| (c, HostCond::Ae)), overflow_out);
    em.ra.define_gpr(em.block, r, result);
    em.release_pseudo_uses(r);
}

fn emit_mul(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    let b = em.ra.use_gpr(&mut em.asm, inst.arg(1));
    em.asm.imul_rr32(result, b);
    em.ra.define_gpr(em.block, r, result);
}

#[derive(Clone, Copy)]
enum LogicalOp {
    And,
    Eor,
    Or,
}

fn emit_logical(em: &mut Emitter<'_>, r: InstRef, op: LogicalOp) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    match inst.arg(1) {
        Value::U32(imm) => match op {
            LogicalOp::And => em.asm.and_ri32(result, imm),
            LogicalOp::Eor => em.asm.xor_ri32(result, imm),
            LogicalOp::Or => em.asm.or_ri32(result, imm),
        },
        v => {
            let g = em.ra.use_gpr(&mut em.asm, v);
            match op {
                LogicalOp::And => em.asm.and_rr32(result, g),
                LogicalOp::Eor => em.asm.xor_rr32(result, g),
                LogicalOp::Or => em.asm.or_rr32(result, g),
            }
        }
    }
    em.ra.define_gpr(em.block, r, result);
}

fn emit_not(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    em.asm.not_r32(result);
    em.ra.define_gpr(em.block, r, result);
}

fn emit_clz(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let src = em.ra.use_gpr(&mut em.asm, inst.arg(0));
    let out = em.ra.scratch_gpr(&mut em.asm);
    let done = em.asm.buf.new_label();
    em.asm.mov_ri32(out, 32);
    em.asm.test_rr32(src, src);
    em.asm.jcc_label(HostCond::E, done);
    em.asm.bsr_rr32(out, src);
    em.asm.xor_ri32(out, 31);
    em.asm.buf.bind_label(done);
    em.ra.define_gpr(em.block, r, out);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

fn emit_shift(em: &mut Emitter<'_>, r: InstRef, kind: ShiftKind) {
    let inst = em.block.inst(r);
    let (x, n, carry_in) = (inst.arg(0), inst.arg(1), inst.arg(2));
    let carry_out = em.live_pseudo_op(r, Opcode::GetCarryFromOp);
    match n {
        Value::U8(amount) => emit_shift_imm(em, r, kind, x, amount, carry_in, carry_out),
        n => emit_shift_dynamic(em, r, kind, x, n, carry_in, carry_out),
    }
    em.release_pseudo_uses(r);
}

/// Copy a U1 value (or immediate) into a fresh register.
fn materialize_u1(em: &mut Emitter<'_>, v: Value) -> Gpr {
    match v {
        Value::U1(b) => {
            let g = em.ra.scratch_gpr(&mut em.asm);
            em.asm.mov_ri32(g, u32::from(b));
            g
        }
        v => em.ra.use_scratch_gpr(&mut em.asm, v),
    }
}

fn emit_shift_imm(
    em: &mut Emitter<'_>,
    r: InstRef,
    kind: ShiftKind,
    x: Value,
    amount: u8,
    carry_in: Value,
    carry_out: Option<InstRef>,
) {
    // The translator has already folded the shift-by-32 encodings, so the
    // immediate is in 0..=32 (0..=31 for LSL/ROR).
    debug_assert!(amount <= 32);

    if amount == 0 {
        // Identity; the carry out is the carry in.
        let result = em.ra.use_scratch_gpr(&mut em.asm, x);
        if let Some(co) = carry_out {
            let c = materialize_u1(em, carry_in);
            em.ra.define_gpr(em.block, co, c);
        } else {
            em.ra.discard(carry_in);
        }
        em.ra.define_gpr(em.block, r, result);
        return;
    }

    em.ra.discard(carry_in);
    let result = em.ra.use_scratch_gpr(&mut em.asm, x);

    if amount == 32 {
        match kind {
            ShiftKind::Lsl | ShiftKind::Lsr => {
                // Result is zero; the carry is the edge bit.
                if let Some(co) = carry_out {
                    let c = em.ra.scratch_gpr(&mut em.asm);
                    em.asm.mov_rr32(c, result);
                    match kind {
                        ShiftKind::Lsl => em.asm.and_ri32(c, 1),
                        _ => em.asm.shr_ri32(c, 31),
                    }
                    em.ra.define_gpr(em.block, co, c);
                }
                em.asm.xor_rr32(result, result);
            }
            ShiftKind::Asr => {
                // Sign fill; carry is the sign bit.
                em.asm.sar_ri32(result, 31);
                if let Some(co) = carry_out {
                    let c = em.ra.scratch_gpr(&mut em.asm);
                    em.asm.mov_rr32(c, result);
                    em.asm.and_ri32(c, 1);
                    em.ra.define_gpr(em.block, co, c);
                }
            }
            ShiftKind::Ror => unreachable!("ROR immediate is 1..=31"),
        }
        em.ra.define_gpr(em.block, r, result);
        return;
    }

    match kind {
        ShiftKind::Lsl => em.asm.shl_ri32(result, amount),
        ShiftKind::Lsr => em.asm.shr_ri32(result, amount),
        ShiftKind::Asr => em.asm.sar_ri32(result, amount),
        ShiftKind::Ror => em.asm.ror_ri32(result, amount),
    }
    if let Some(co) = carry_out {
        let c = em.ra.scratch_gpr(&mut em.asm);
        match kind {
            // The shift left the departing bit in CF.
            ShiftKind::Lsl | ShiftKind::Lsr | ShiftKind::Asr => {
                em.asm.setcc(HostCond::B, c);
                em.asm.movzx_r32_r8(c, c);
            }
            // For rotates the carry is the new bit 31.
            ShiftKind::Ror => {
                em.asm.mov_rr32(c, result);
                em.asm.shr_ri32(c, 31);
            }
        }
        em.ra.define_gpr(em.block, co, c);
    }
    em.ra.define_gpr(em.block, r, result);
}

fn emit_shift_dynamic(
    em: &mut Emitter<'_>,
    r: InstRef,
    kind: ShiftKind,
    x: Value,
    n: Value,
    carry_in: Value,
    carry_out: Option<InstRef>,
) {
    // The count register: claim rcx before any other allocation so the
    // operands cannot land in it.
    em.ra.claim_gpr(&mut em.asm, Gpr::Rcx);
    let n_reg = em.ra.use_gpr(&mut em.asm, n);
    em.asm.mov_rr32(Gpr::Rcx, n_reg);

    let result = em.ra.use_scratch_gpr(&mut em.asm, x);
    let cout = if carry_out.is_some() {
        let c = materialize_u1(em, carry_in);
        Some(c)
    } else {
        em.ra.discard(carry_in);
        None
    };

    let done = em.asm.buf.new_label();
    em.asm.test_rr32(Gpr::Rcx, Gpr::Rcx);
    em.asm.jcc_label(HostCond::E, done);

    match kind {
        ShiftKind::Lsl => {
            let extract = em.asm.buf.new_label();
            // 64-bit shift keeps the departing bit reachable at bit 32.
            em.asm.shl_cl64(result);
            em.asm.cmp_ri32(Gpr::Rcx, 64);
            em.asm.jcc_label(HostCond::B, extract);
            em.asm.xor_rr32(result, result);
            if let Some(c) = cout {
                em.asm.xor_rr32(c, c);
            }
            em.asm.jmp_label(done);
            em.asm.buf.bind_label(extract);
            if let Some(c) = cout {
                em.asm.mov_rr64(c, result);
                em.asm.shr_ri64(c, 32);
                em.asm.and_ri32(c, 1);
            }
            em.asm.mov_rr32(result, result);
        }
        ShiftKind::Lsr => {
            let out_of_range = em.asm.buf.new_label();
            em.asm.cmp_ri32(Gpr::Rcx, 32);
            em.asm.jcc_label(HostCond::A, out_of_range);
            // Shift by n-1, pick the carry off bit 0, then finish.
            em.asm.sub_ri32(Gpr::Rcx, 1);
            em.asm.shr_cl64(result);
            if let Some(c) = cout {
                em.asm.mov_rr32(c, result);
                em.asm.and_ri32(c, 1);
            }
            em.asm.shr_ri64(result, 1);
            em.asm.jmp_label(done);
            em.asm.buf.bind_label(out_of_range);
            em.asm.xor_rr32(result, result);
            if let Some(c) = cout {
                em.asm.xor_rr32(c, c);
            }
        }
        ShiftKind::Asr => {
            em.asm.movsxd(result, result);
            let small = em.asm.buf.new_label();
            em.asm.cmp_ri32(Gpr::Rcx, 32);
            em.asm.jcc_label(HostCond::B, small);
            // Everything past 32 behaves like 32: sign fill, sign carry.
            em.asm.mov_ri32(Gpr::Rcx, 32);
            em.asm.buf.bind_label(small);
            em.asm.sub_ri32(Gpr::Rcx, 1);
            em.asm.sar_cl64(result);
            if let Some(c) = cout {
                em.asm.mov_rr32(c, result);
                em.asm.and_ri32(c, 1);
            }
            em.asm.sar_ri64(result, 1);
            em.asm.mov_rr32(result, result);
        }
        ShiftKind::Ror => {
            let mult32 = em.asm.buf.new_label();
            em.asm.and_ri32(Gpr::Rcx, 31);
            em.asm.jcc_label(HostCond::E, mult32);
            em.asm.ror_cl32(result);
            if let Some(c) = cout {
                em.asm.mov_rr32(c, result);
                em.asm.shr_ri32(c, 31);
            }
            em.asm.jmp_label(done);
            em.asm.buf.bind_label(mult32);
            if let Some(c) = cout {
                em.asm.mov_rr32(c, result);
                em.asm.shr_ri32(c, 31);
            }
        }
    }

    em.asm.buf.bind_label(done);
    if let (Some(co), Some(c)) = (carry_out, cout) {
        em.ra.define_gpr(em.block, co, c);
    }
    em.ra.define_gpr(em.block, r, result);
}

fn emit_rrx(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let (x, carry_in) = (inst.arg(0), inst.arg(1));
    let carry_out = em.live_pseudo_op(r, Opcode::GetCarryFromOp);

    let result = em.ra.use_scratch_gpr(&mut em.asm, x);
    load_carry_in(em, carry_in, false);
    em.asm.rcr_r32_1(result);
    define_flag_outputs(em, carry_out.map(|c| (c, HostCond::B)), None);
    em.ra.define_gpr(em.block, r, result);
    em.release_pseudo_uses(r);
}

fn emit_msb(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    em.asm.shr_ri32(result, 31);
    em.ra.define_gpr(em.block, r, result);
}

fn emit_is_zero(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let a = em.ra.use_gpr(&mut em.asm, inst.arg(0));
    let out = em.ra.scratch_gpr(&mut em.asm);
    em.asm.test_rr32(a, a);
    em.asm.setcc(HostCond::E, out);
    em.asm.movzx_r32_r8(out, out);
    em.ra.define_gpr(em.block, r, out);
}

fn emit_narrow(em: &mut Emitter<'_>, r: InstRef, bits: u32) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    if bits == 8 {
        em.asm.movzx_r32_r8(result, result);
    } else {
        em.asm.movzx_r32_r16(result, result);
    }
    em.ra.define_gpr(em.block, r, result);
}

fn emit_extend(em: &mut Emitter<'_>, r: InstRef, bits: u32, signed: bool) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    match (bits, signed) {
        (8, true) => em.asm.movsx_r32_r8(result, result),
        (16, true) => em.asm.movsx_r32_r16(result, result),
        (8, false) => em.asm.movzx_r32_r8(result, result),
        _ => em.asm.movzx_r32_r16(result, result),
    }
    em.ra.define_gpr(em.block, r, result);
}

fn emit_byte_reverse_word(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    em.asm.bswap_r32(result);
    em.ra.define_gpr(em.block, r, result);
}

fn emit_byte_reverse_half(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    em.asm.bswap_r32(result);
    em.asm.shr_ri32(result, 16);
    em.ra.define_gpr(em.block, r, result);
}

fn emit_byte_reverse_dual(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let result = em.ra.use_scratch_gpr(&mut em.asm, inst.arg(0));
    em.asm.bswap_r64(result);
    em.ra.define_gpr(em.block, r, result);
}

/// Copy up to two operands into fixed argument registers, handling the
/// case where an operand already sits in the other argument's register.
fn move_call_args(em: &mut Emitter<'_>, first: (Gpr, Gpr), second: Option<(Gpr, Gpr)>) {
    match second {
        None => {
            let (dst, src) = first;
            if dst != src {
                em.asm.mov_rr64(dst, src);
            }
        }
        Some((dst2, src2)) => {
            let (dst1, src1) = first;
            if src2 == dst1 && src1 == dst2 {
                // Swap through the call-target temporary.
                em.asm.mov_rr64(Gpr::R11, src2);
                em.asm.mov_rr64(dst1, src1);
                em.asm.mov_rr64(dst2, Gpr::R11);
            } else if src2 == dst1 {
                em.asm.mov_rr64(dst2, src2);
                em.asm.mov_rr64(dst1, src1);
            } else {
                if dst1 != src1 {
                    em.asm.mov_rr64(dst1, src1);
                }
                if dst2 != src2 {
                    em.asm.mov_rr64(dst2, src2);
                }
            }
        }
    }
}

fn emit_call(em: &mut Emitter<'_>, f: usize) {
    em.asm.mov_ri64(Gpr::Rdi, em.env.ctx as u64);
    em.asm.mov_ri64(Gpr::R11, f as u64);
    em.asm.call_r64(Gpr::R11);
}

fn emit_read_memory(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let opcode = inst.opcode;
    let vaddr = inst.arg(0);

    em.ra.host_call_spill(&mut em.asm);
    match vaddr {
        Value::U32(imm) => em.asm.mov_ri32(Gpr::Rsi, imm),
        v => {
            let g = em.ra.use_gpr(&mut em.asm, v);
            move_call_args(em, (Gpr::Rsi, g), None);
        }
    }
    let f = match opcode {
        Opcode::ReadMemory8 => em.env.read8 as usize,
        Opcode::ReadMemory16 => em.env.read16 as usize,
        Opcode::ReadMemory32 => em.env.read32 as usize,
        _ => em.env.read64 as usize,
    };
    em.ra.end_of_alloc_scope();
    // A reload above may have landed a still-live value in a caller-save
    // register; evacuate again now that the argument copies are made.
    em.ra.host_call_spill(&mut em.asm);
    emit_call(em, f);

    let out = em.ra.scratch_gpr(&mut em.asm);
    if opcode == Opcode::ReadMemory64 {
        em.asm.mov_rr64(out, Gpr::Rax);
    } else {
        // The thunks return u32; keep the zero-extension invariant.
        em.asm.mov_rr32(out, Gpr::Rax);
    }
    em.ra.define_gpr(em.block, r, out);
}

fn emit_write_memory(em: &mut Emitter<'_>, r: InstRef) {
    let inst = em.block.inst(r);
    let opcode = inst.opcode;
    let (vaddr, data) = (inst.arg(0), inst.arg(1));

    em.ra.host_call_spill(&mut em.asm);
    // Reload both operands before touching the argument registers: a
    // reload is free to land in rsi/rdx.
    let addr_gpr = match vaddr {
        Value::U32(_) => None,
        v => Some(em.ra.use_gpr(&mut em.asm, v)),
    };
    let data_gpr = if data.is_immediate() {
        None
    } else {
        Some(em.ra.use_gpr(&mut em.asm, data))
    };
    match (addr_gpr, data_gpr) {
        (Some(a), Some(d)) => move_call_args(em, (Gpr::Rsi, a), Some((Gpr::Rdx, d))),
        (Some(a), None) => move_call_args(em, (Gpr::Rsi, a), None),
        (None, Some(d)) => move_call_args(em, (Gpr::Rdx, d), None),
        (None, None) => {}
    }
    if let Value::U32(imm) = vaddr {
        em.asm.mov_ri32(Gpr::Rsi, imm);
    }
    if data.is_immediate() {
        em.asm.mov_ri64(Gpr::Rdx, data.zext_to_u64());
    }
    let f = match opcode {
        Opcode::WriteMemory8 => em.env.write8 as usize,
        Opcode::WriteMemory16 => em.env.write16 as usize,
        Opcode::WriteMemory32 => em.env.write32 as usize,
        _ => em.env.write64 as usize,
    };
    em.ra.end_of_alloc_scope();
    em.ra.host_call_spill(&mut em.asm);
    emit_call(em, f);
}

fn emit_call_supervisor(em: &mut Emitter<'_>, r: InstRef) {
    let imm = em.block.inst(r).arg(0);
    em.ra.host_call_spill(&mut em.asm);
    match imm {
        Value::U32(v) => em.asm.mov_ri32(Gpr::Rsi, v),
        v => {
            let g = em.ra.use_gpr(&mut em.asm, v);
            move_call_args(em, (Gpr::Rsi, g), None);
        }
    }
    em.ra.end_of_alloc_scope();
    em.ra.host_call_spill(&mut em.asm);
    emit_call(em, em.env.svc as usize);
}
