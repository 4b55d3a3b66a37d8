//! 16-bit Thumb decoder table and visitors.

use arx_ir::{Cond, IrBuilder, Reg, Terminal, Value};

use crate::decoder::{bits16, lookup, Matcher};

pub type Thumb16Matcher = Matcher<u16>;

fn reg(field: u32) -> Reg {
    Reg::from_index(field)
}

/// The PC value an instruction observes when reading R15 directly:
/// current + 4 in Thumb state, unaligned.
fn read_pc(ir: &mut IrBuilder<'_>) -> Value {
    let pc = ir.current_location.pc().wrapping_add(4);
    ir.imm32(pc)
}

fn read_reg(ir: &mut IrBuilder<'_>, r: Reg) -> Value {
    if r == Reg::PC {
        read_pc(ir)
    } else {
        ir.get_register(r)
    }
}

/// Fall back to the interpreter for this instruction.
fn interpret(ir: &mut IrBuilder<'_>) -> bool {
    ir.set_terminal(Terminal::Interpret {
        next: ir.current_location,
    });
    false
}

/// Unpredictable encodings never produce IR with invented semantics.
fn unpredictable(ir: &mut IrBuilder<'_>) -> bool {
    interpret(ir)
}

fn set_nz(ir: &mut IrBuilder<'_>, result: Value) {
    let n = ir.most_significant_bit(result);
    ir.set_n_flag(n);
    let z = ir.is_zero(result);
    ir.set_z_flag(z);
}

// Shift / add / subtract / move / compare.

fn lsl_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm5 = bits16(w, 10, 6) as u8;
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // LSLS <Rd>, <Rm>, #<imm5>
    let cpsr_c = ir.get_c_flag();
    let rm = ir.get_register(m);
    let shift = ir.imm8(imm5);
    let result = ir.logical_shift_left(rm, shift, cpsr_c);
    ir.set_register(d, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    true
}

fn lsr_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm5 = bits16(w, 10, 6) as u8;
    let shift_n = if imm5 != 0 { imm5 } else { 32 };
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // LSRS <Rd>, <Rm>, #<imm5>
    let cpsr_c = ir.get_c_flag();
    let rm = ir.get_register(m);
    let shift = ir.imm8(shift_n);
    let result = ir.logical_shift_right(rm, shift, cpsr_c);
    ir.set_register(d, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    true
}

fn asr_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm5 = bits16(w, 10, 6) as u8;
    let shift_n = if imm5 != 0 { imm5 } else { 32 };
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // ASRS <Rd>, <Rm>, #<imm5>
    let cpsr_c = ir.get_c_flag();
    let rm = ir.get_register(m);
    let shift = ir.imm8(shift_n);
    let result = ir.arithmetic_shift_right(rm, shift, cpsr_c);
    ir.set_register(d, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    true
}

fn add_sub_common(ir: &mut IrBuilder<'_>, d: Reg, a: Value, b: Value, subtract: bool) {
    let carry_in = ir.imm1(subtract);
    let result = if subtract {
        ir.sub_with_carry(a, b, carry_in)
    } else {
        ir.add_with_carry(a, b, carry_in)
    };
    ir.set_register(d, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
}

fn add_reg_t1(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 8, 6));
    let n = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // ADDS <Rd>, <Rn>, <Rm>; Rd cannot encode R15.
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    add_sub_common(ir, d, rn, rm, false);
    true
}

fn sub_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 8, 6));
    let n = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // SUBS <Rd>, <Rn>, <Rm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    add_sub_common(ir, d, rn, rm, true);
    true
}

fn add_imm_t1(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm3 = bits16(w, 8, 6);
    let n = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // ADDS <Rd>, <Rn>, #<imm3>
    let rn = ir.get_register(n);
    let imm = ir.imm32(imm3);
    add_sub_common(ir, d, rn, imm, false);
    true
}

fn sub_imm_t1(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm3 = bits16(w, 8, 6);
    let n = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // SUBS <Rd>, <Rn>, #<imm3>
    let rn = ir.get_register(n);
    let imm = ir.imm32(imm3);
    add_sub_common(ir, d, rn, imm, true);
    true
}

fn mov_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let d = reg(bits16(w, 10, 8));
    let imm8 = bits16(w, 7, 0);
    // MOVS <Rd>, #<imm8>; Rd cannot encode R15.
    let result = ir.imm32(imm8);
    ir.set_register(d, result);
    set_nz(ir, result);
    true
}

fn cmp_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let n = reg(bits16(w, 10, 8));
    let imm8 = bits16(w, 7, 0);
    // CMP <Rn>, #<imm8>
    let rn = ir.get_register(n);
    let imm = ir.imm32(imm8);
    let one = ir.imm1(true);
    let result = ir.sub_with_carry(rn, imm, one);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
    true
}

fn add_imm_t2(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let d_n = reg(bits16(w, 10, 8));
    let imm8 = bits16(w, 7, 0);
    // ADDS <Rdn>, #<imm8>
    let rn = ir.get_register(d_n);
    let imm = ir.imm32(imm8);
    add_sub_common(ir, d_n, rn, imm, false);
    true
}

fn sub_imm_t2(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let d_n = reg(bits16(w, 10, 8));
    let imm8 = bits16(w, 7, 0);
    // SUBS <Rdn>, #<imm8>
    let rn = ir.get_register(d_n);
    let imm = ir.imm32(imm8);
    add_sub_common(ir, d_n, rn, imm, true);
    true
}

// Data processing (register), opcode field in bits 9:6.

fn logical_common(ir: &mut IrBuilder<'_>, d: Option<Reg>, result: Value) -> bool {
    if let Some(d) = d {
        ir.set_register(d, result);
    }
    set_nz(ir, result);
    true
}

fn dp_and(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    // ANDS <Rdn>, <Rm>
    let rn = ir.get_register(d_n);
    let rm = ir.get_register(m);
    let result = ir.and(rn, rm);
    logical_common(ir, Some(d_n), result)
}

fn dp_eor(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    // EORS <Rdn>, <Rm>
    let rn = ir.get_register(d_n);
    let rm = ir.get_register(m);
    let result = ir.eor(rn, rm);
    logical_common(ir, Some(d_n), result)
}

fn dp_shift_reg<'b>(
    ir: &mut IrBuilder<'b>,
    w: u16,
    shift: fn(&mut IrBuilder<'b>, Value, Value, Value) -> arx_ir::ResultAndCarry,
) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    let rm = ir.get_register(m);
    let shift_n = ir.least_significant_byte(rm);
    let cpsr_c = ir.get_c_flag();
    let rn = ir.get_register(d_n);
    let result = shift(ir, rn, shift_n, cpsr_c);
    ir.set_register(d_n, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    true
}

fn dp_lsl(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    dp_shift_reg(ir, w, IrBuilder::logical_shift_left)
}

fn dp_lsr(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    dp_shift_reg(ir, w, IrBuilder::logical_shift_right)
}

fn dp_asr(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    dp_shift_reg(ir, w, IrBuilder::arithmetic_shift_right)
}

fn dp_ror(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    dp_shift_reg(ir, w, IrBuilder::rotate_right)
}

fn dp_adc(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    // ADCS <Rdn>, <Rm>
    let cpsr_c = ir.get_c_flag();
    let rn = ir.get_register(d_n);
    let rm = ir.get_register(m);
    let result = ir.add_with_carry(rn, rm, cpsr_c);
    ir.set_register(d_n, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
    true
}

fn dp_sbc(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    // SBCS <Rdn>, <Rm>
    let cpsr_c = ir.get_c_flag();
    let rn = ir.get_register(d_n);
    let rm = ir.get_register(m);
    let result = ir.sub_with_carry(rn, rm, cpsr_c);
    ir.set_register(d_n, result.result);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
    true
}

fn dp_tst(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let n = reg(bits16(w, 2, 0));
    // TST <Rn>, <Rm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    let result = ir.and(rn, rm);
    logical_common(ir, None, result)
}

fn dp_rsb(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let n = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // RSBS <Rd>, <Rn>, #0
    let zero = ir.imm32(0);
    let rn = ir.get_register(n);
    add_sub_common(ir, d, zero, rn, true);
    true
}

fn dp_cmp(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let n = reg(bits16(w, 2, 0));
    // CMP <Rn>, <Rm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    let one = ir.imm1(true);
    let result = ir.sub_with_carry(rn, rm, one);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
    true
}

fn dp_cmn(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let n = reg(bits16(w, 2, 0));
    // CMN <Rn>, <Rm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    let zero = ir.imm1(false);
    let result = ir.add_with_carry(rn, rm, zero);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
    true
}

fn dp_orr(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    // ORRS <Rdn>, <Rm>
    let rm = ir.get_register(m);
    let rn = ir.get_register(d_n);
    let result = ir.or(rm, rn);
    logical_common(ir, Some(d_n), result)
}

fn dp_mul(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let n = reg(bits16(w, 5, 3));
    let d_m = reg(bits16(w, 2, 0));
    // MULS <Rdm>, <Rn>, <Rdm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(d_m);
    let result = ir.mul(rn, rm);
    logical_common(ir, Some(d_m), result)
}

fn dp_bic(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d_n = reg(bits16(w, 2, 0));
    // BICS <Rdn>, <Rm>
    let rn = ir.get_register(d_n);
    let rm = ir.get_register(m);
    let not_rm = ir.not(rm);
    let result = ir.and(rn, not_rm);
    logical_common(ir, Some(d_n), result)
}

fn dp_mvn(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // MVNS <Rd>, <Rm>
    let rm = ir.get_register(m);
    let result = ir.not(rm);
    logical_common(ir, Some(d), result)
}

// Hi-register operations and branch/exchange.

fn add_reg_t2(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let dn_hi = bits16(w, 7, 7) != 0;
    let m = reg(bits16(w, 6, 3));
    let d_n = reg(bits16(w, 2, 0) | if dn_hi { 8 } else { 0 });
    if d_n == Reg::PC && m == Reg::PC {
        return unpredictable(ir);
    }
    // ADD <Rdn>, <Rm>
    let rn = read_reg(ir, d_n);
    let rm = read_reg(ir, m);
    let zero = ir.imm1(false);
    let result = ir.add_with_carry(rn, rm, zero);
    if d_n == Reg::PC {
        ir.alu_write_pc(result.result);
        // Can't predict the new PC. Stop compilation.
        ir.set_terminal(Terminal::ReturnToDispatch);
        false
    } else {
        ir.set_register(d_n, result.result);
        true
    }
}

fn cmp_reg_t2(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let n_hi = bits16(w, 7, 7) != 0;
    let m = reg(bits16(w, 6, 3));
    let n = reg(bits16(w, 2, 0) | if n_hi { 8 } else { 0 });
    if (n.index() < 8 && m.index() < 8) || n == Reg::PC || m == Reg::PC {
        return unpredictable(ir);
    }
    // CMP <Rn>, <Rm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    let one = ir.imm1(true);
    let result = ir.sub_with_carry(rn, rm, one);
    set_nz(ir, result.result);
    ir.set_c_flag(result.carry);
    ir.set_v_flag(result.overflow);
    true
}

fn mov_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let d_hi = bits16(w, 7, 7) != 0;
    let m = reg(bits16(w, 6, 3));
    let d = reg(bits16(w, 2, 0) | if d_hi { 8 } else { 0 });
    // MOV <Rd>, <Rm>
    let result = read_reg(ir, m);
    if d == Reg::PC {
        ir.alu_write_pc(result);
        ir.set_terminal(Terminal::ReturnToDispatch);
        false
    } else {
        ir.set_register(d, result);
        true
    }
}

/// Interworking branch: the stored PC carries the Thumb bit in bit 0; the
/// dispatcher derives the new instruction set from it.
fn bx(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 6, 3));
    // BX <Rm>
    let target = read_reg(ir, m);
    ir.set_register(Reg::PC, target);
    ir.set_terminal(Terminal::ReturnToDispatch);
    false
}

fn blx_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 6, 3));
    if m == Reg::PC {
        return unpredictable(ir);
    }
    // BLX <Rm>
    let ret = ir.current_location.pc().wrapping_add(2) | 1;
    let ret = ir.imm32(ret);
    ir.set_register(Reg::LR, ret);
    let target = ir.get_register(m);
    ir.set_register(Reg::PC, target);
    ir.set_terminal(Terminal::ReturnToDispatch);
    false
}

// Load/store.

fn ldr_literal(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 10, 8));
    let imm32 = bits16(w, 7, 0) << 2;
    // LDR <Rt>, <label>; Rt cannot encode R15.
    let address = ir.align_pc(4).wrapping_add(imm32);
    let address = ir.imm32(address);
    let data = ir.read_memory_32(address);
    ir.set_register(t, data);
    true
}

fn reg_offset_address(ir: &mut IrBuilder<'_>, w: u16) -> Value {
    let m = reg(bits16(w, 8, 6));
    let n = reg(bits16(w, 5, 3));
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    ir.add(rn, rm)
}

fn str_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // STR <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let data = ir.get_register(t);
    ir.write_memory_32(address, data);
    true
}

fn strh_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // STRH <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let rt = ir.get_register(t);
    let data = ir.least_significant_half(rt);
    ir.write_memory_16(address, data);
    true
}

fn strb_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // STRB <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let rt = ir.get_register(t);
    let data = ir.least_significant_byte(rt);
    ir.write_memory_8(address, data);
    true
}

fn ldrsb_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDRSB <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let byte = ir.read_memory_8(address);
    let data = ir.sign_extend_byte_to_word(byte);
    ir.set_register(t, data);
    true
}

fn ldr_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDR <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let data = ir.read_memory_32(address);
    ir.set_register(t, data);
    true
}

fn ldrh_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDRH <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let half = ir.read_memory_16(address);
    let data = ir.zero_extend_half_to_word(half);
    ir.set_register(t, data);
    true
}

fn ldrb_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDRB <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let byte = ir.read_memory_8(address);
    let data = ir.zero_extend_byte_to_word(byte);
    ir.set_register(t, data);
    true
}

fn ldrsh_reg(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDRSH <Rt>, [<Rn>, <Rm>]
    let address = reg_offset_address(ir, w);
    let half = ir.read_memory_16(address);
    let data = ir.sign_extend_half_to_word(half);
    ir.set_register(t, data);
    true
}

fn imm_offset_address(ir: &mut IrBuilder<'_>, w: u16, scale: u32) -> Value {
    let imm32 = bits16(w, 10, 6) << scale;
    let n = reg(bits16(w, 5, 3));
    let rn = ir.get_register(n);
    let imm = ir.imm32(imm32);
    ir.add(rn, imm)
}

fn str_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // STR <Rt>, [<Rn>, #<imm>]
    let address = imm_offset_address(ir, w, 2);
    let data = ir.get_register(t);
    ir.write_memory_32(address, data);
    true
}

fn ldr_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDR <Rt>, [<Rn>, #<imm>]
    let address = imm_offset_address(ir, w, 2);
    let data = ir.read_memory_32(address);
    ir.set_register(t, data);
    true
}

fn strb_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // STRB <Rt>, [<Rn>, #<imm>]
    let address = imm_offset_address(ir, w, 0);
    let rt = ir.get_register(t);
    let data = ir.least_significant_byte(rt);
    ir.write_memory_8(address, data);
    true
}

fn ldrb_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDRB <Rt>, [<Rn>, #<imm>]
    let address = imm_offset_address(ir, w, 0);
    let byte = ir.read_memory_8(address);
    let data = ir.zero_extend_byte_to_word(byte);
    ir.set_register(t, data);
    true
}

fn strh_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // STRH <Rt>, [<Rn>, #<imm>]
    let address = imm_offset_address(ir, w, 1);
    let rt = ir.get_register(t);
    let data = ir.least_significant_half(rt);
    ir.write_memory_16(address, data);
    true
}

fn ldrh_imm(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 2, 0));
    // LDRH <Rt>, [<Rn>, #<imm>]
    let address = imm_offset_address(ir, w, 1);
    let half = ir.read_memory_16(address);
    let data = ir.zero_extend_half_to_word(half);
    ir.set_register(t, data);
    true
}

fn sp_relative_address(ir: &mut IrBuilder<'_>, w: u16) -> Value {
    let imm32 = bits16(w, 7, 0) << 2;
    let sp = ir.get_register(Reg::SP);
    let imm = ir.imm32(imm32);
    ir.add(sp, imm)
}

fn str_sp(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 10, 8));
    // STR <Rt>, [SP, #<imm>]
    let address = sp_relative_address(ir, w);
    let data = ir.get_register(t);
    ir.write_memory_32(address, data);
    true
}

fn ldr_sp(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let t = reg(bits16(w, 10, 8));
    // LDR <Rt>, [SP, #<imm>]
    let address = sp_relative_address(ir, w);
    let data = ir.read_memory_32(address);
    ir.set_register(t, data);
    true
}

// PC/SP-relative address generation.

fn adr(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let d = reg(bits16(w, 10, 8));
    let imm32 = bits16(w, 7, 0) << 2;
    // ADR <Rd>, <label>; Rd cannot encode R15.
    let result = ir.align_pc(4).wrapping_add(imm32);
    let result = ir.imm32(result);
    ir.set_register(d, result);
    true
}

fn add_sp_t1(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let d = reg(bits16(w, 10, 8));
    let imm32 = bits16(w, 7, 0) << 2;
    // ADD <Rd>, SP, #<imm>
    let sp = ir.get_register(Reg::SP);
    let imm = ir.imm32(imm32);
    let zero = ir.imm1(false);
    let result = ir.add_with_carry(sp, imm, zero);
    ir.set_register(d, result.result);
    true
}

fn add_sp_t2(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm32 = bits16(w, 6, 0) << 2;
    // ADD SP, SP, #<imm>
    let sp = ir.get_register(Reg::SP);
    let imm = ir.imm32(imm32);
    let zero = ir.imm1(false);
    let result = ir.add_with_carry(sp, imm, zero);
    ir.set_register(Reg::SP, result.result);
    true
}

fn sub_sp(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm32 = bits16(w, 6, 0) << 2;
    // SUB SP, SP, #<imm>
    let sp = ir.get_register(Reg::SP);
    let imm = ir.imm32(imm32);
    let one = ir.imm1(true);
    let result = ir.sub_with_carry(sp, imm, one);
    ir.set_register(Reg::SP, result.result);
    true
}

// Extension and reversal.

fn sxth(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // SXTH <Rd>, <Rm>
    let rm = ir.get_register(m);
    let half = ir.least_significant_half(rm);
    let data = ir.sign_extend_half_to_word(half);
    ir.set_register(d, data);
    true
}

fn sxtb(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // SXTB <Rd>, <Rm>
    let rm = ir.get_register(m);
    let byte = ir.least_significant_byte(rm);
    let data = ir.sign_extend_byte_to_word(byte);
    ir.set_register(d, data);
    true
}

fn uxth(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // UXTH <Rd>, <Rm>
    let rm = ir.get_register(m);
    let half = ir.least_significant_half(rm);
    let data = ir.zero_extend_half_to_word(half);
    ir.set_register(d, data);
    true
}

fn uxtb(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // UXTB <Rd>, <Rm>
    let rm = ir.get_register(m);
    let byte = ir.least_significant_byte(rm);
    let data = ir.zero_extend_byte_to_word(byte);
    ir.set_register(d, data);
    true
}

fn rev(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // REV <Rd>, <Rm>
    let rm = ir.get_register(m);
    let data = ir.byte_reverse_word(rm);
    ir.set_register(d, data);
    true
}

fn rev16(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // REV16 <Rd>, <Rm>
    let rm = ir.get_register(m);
    let sixteen = ir.imm8(16);
    let zero = ir.imm1(false);
    let shifted = ir.logical_shift_right(rm, sixteen, zero);
    let upper_half = ir.least_significant_half(shifted.result);
    let lower_half = ir.least_significant_half(rm);
    let rev_upper = ir.byte_reverse_half(upper_half);
    let rev_upper = ir.zero_extend_half_to_word(rev_upper);
    let rev_lower = ir.byte_reverse_half(lower_half);
    let rev_lower = ir.zero_extend_half_to_word(rev_lower);
    let sixteen = ir.imm8(16);
    let zero = ir.imm1(false);
    let hi = ir.logical_shift_left(rev_upper, sixteen, zero);
    let result = ir.or(hi.result, rev_lower);
    ir.set_register(d, result);
    true
}

fn revsh(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let m = reg(bits16(w, 5, 3));
    let d = reg(bits16(w, 2, 0));
    // REVSH <Rd>, <Rm>
    let rm = ir.get_register(m);
    let half = ir.least_significant_half(rm);
    let rev_half = ir.byte_reverse_half(half);
    let data = ir.sign_extend_half_to_word(rev_half);
    ir.set_register(d, data);
    true
}

// Exceptions and branches.

fn udf(ir: &mut IrBuilder<'_>, _w: u16) -> bool {
    interpret(ir)
}

fn svc(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm8 = bits16(w, 7, 0);
    // SVC #<imm8>
    let imm = ir.imm32(imm8);
    ir.call_supervisor(imm);
    false
}

fn b_cond(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let cond = Cond::from_bits(bits16(w, 11, 8));
    let imm32 = ((bits16(w, 7, 0) as i32) << 24 >> 23) as u32;
    // B<cond> <label>
    let target = ir.current_location.pc().wrapping_add(4).wrapping_add(imm32);
    ir.set_terminal(Terminal::If {
        cond,
        then_: ir.current_location.with_pc(target),
        else_: ir.current_location.advance(2),
    });
    false
}

fn b_uncond(ir: &mut IrBuilder<'_>, w: u16) -> bool {
    let imm32 = ((bits16(w, 10, 0) as i32) << 21 >> 20) as u32;
    // B <label>
    let target = ir.current_location.pc().wrapping_add(4).wrapping_add(imm32);
    ir.set_terminal(Terminal::LinkBlock {
        next: ir.current_location.with_pc(target),
    });
    false
}

macro_rules! entry {
    ($name:literal, $mask:literal, $expect:literal, $handler:ident) => {
        Matcher {
            name: $name,
            mask: $mask,
            expect: $expect,
            handler: $handler,
        }
    };
}

/// Ordered Thumb16 decode table; first match wins. Narrow patterns come
/// before wider ones that would shadow them (UDF/SVC before B<cond>).
pub static THUMB16_TABLE: &[Thumb16Matcher] = &[
    entry!("LSL (imm)", 0xF800, 0x0000, lsl_imm),
    entry!("LSR (imm)", 0xF800, 0x0800, lsr_imm),
    entry!("ASR (imm)", 0xF800, 0x1000, asr_imm),
    entry!("ADD (reg, t1)", 0xFE00, 0x1800, add_reg_t1),
    entry!("SUB (reg)", 0xFE00, 0x1A00, sub_reg),
    entry!("ADD (imm, t1)", 0xFE00, 0x1C00, add_imm_t1),
    entry!("SUB (imm, t1)", 0xFE00, 0x1E00, sub_imm_t1),
    entry!("MOV (imm)", 0xF800, 0x2000, mov_imm),
    entry!("CMP (imm)", 0xF800, 0x2800, cmp_imm),
    entry!("ADD (imm, t2)", 0xF800, 0x3000, add_imm_t2),
    entry!("SUB (imm, t2)", 0xF800, 0x3800, sub_imm_t2),
    entry!("AND (reg)", 0xFFC0, 0x4000, dp_and),
    entry!("EOR (reg)", 0xFFC0, 0x4040, dp_eor),
    entry!("LSL (reg)", 0xFFC0, 0x4080, dp_lsl),
    entry!("LSR (reg)", 0xFFC0, 0x40C0, dp_lsr),
    entry!("ASR (reg)", 0xFFC0, 0x4100, dp_asr),
    entry!("ADC (reg)", 0xFFC0, 0x4140, dp_adc),
    entry!("SBC (reg)", 0xFFC0, 0x4180, dp_sbc),
    entry!("ROR (reg)", 0xFFC0, 0x41C0, dp_ror),
    entry!("TST (reg)", 0xFFC0, 0x4200, dp_tst),
    entry!("RSB (imm)", 0xFFC0, 0x4240, dp_rsb),
    entry!("CMP (reg, t1)", 0xFFC0, 0x4280, dp_cmp),
    entry!("CMN (reg)", 0xFFC0, 0x42C0, dp_cmn),
    entry!("ORR (reg)", 0xFFC0, 0x4300, dp_orr),
    entry!("MUL (reg)", 0xFFC0, 0x4340, dp_mul),
    entry!("BIC (reg)", 0xFFC0, 0x4380, dp_bic),
    entry!("MVN (reg)", 0xFFC0, 0x43C0, dp_mvn),
    entry!("ADD (reg, t2)", 0xFF00, 0x4400, add_reg_t2),
    entry!("CMP (reg, t2)", 0xFF00, 0x4500, cmp_reg_t2),
    entry!("MOV (reg)", 0xFF00, 0x4600, mov_reg),
    entry!("BX", 0xFF87, 0x4700, bx),
    entry!("BLX (reg)", 0xFF87, 0x4780, blx_reg),
    entry!("LDR (literal)", 0xF800, 0x4800, ldr_literal),
    entry!("STR (reg)", 0xFE00, 0x5000, str_reg),
    entry!("STRH (reg)", 0xFE00, 0x5200, strh_reg),
    entry!("STRB (reg)", 0xFE00, 0x5400, strb_reg),
    entry!("LDRSB (reg)", 0xFE00, 0x5600, ldrsb_reg),
    entry!("LDR (reg)", 0xFE00, 0x5800, ldr_reg),
    entry!("LDRH (reg)", 0xFE00, 0x5A00, ldrh_reg),
    entry!("LDRB (reg)", 0xFE00, 0x5C00, ldrb_reg),
    entry!("LDRSH (reg)", 0xFE00, 0x5E00, ldrsh_reg),
    entry!("STR (imm, t1)", 0xF800, 0x6000, str_imm),
    entry!("LDR (imm, t1)", 0xF800, 0x6800, ldr_imm),
    entry!("STRB (imm)", 0xF800, 0x7000, strb_imm),
    entry!("LDRB (imm)", 0xF800, 0x7800, ldrb_imm),
    entry!("STRH (imm)", 0xF800, 0x8000, strh_imm),
    entry!("LDRH (imm)", 0xF800, 0x8800, ldrh_imm),
    entry!("STR (imm, sp)", 0xF800, 0x9000, str_sp),
    entry!("LDR (imm, sp)", 0xF800, 0x9800, ldr_sp),
    entry!("ADR", 0xF800, 0xA000, adr),
    entry!("ADD (SP, t1)", 0xF800, 0xA800, add_sp_t1),
    entry!("ADD (SP, t2)", 0xFF80, 0xB000, add_sp_t2),
    entry!("SUB (SP)", 0xFF80, 0xB080, sub_sp),
    entry!("SXTH", 0xFFC0, 0xB200, sxth),
    entry!("SXTB", 0xFFC0, 0xB240, sxtb),
    entry!("UXTH", 0xFFC0, 0xB280, uxth),
    entry!("UXTB", 0xFFC0, 0xB2C0, uxtb),
    entry!("REV", 0xFFC0, 0xBA00, rev),
    entry!("REV16", 0xFFC0, 0xBA40, rev16),
    entry!("REVSH", 0xFFC0, 0xBAC0, revsh),
    entry!("UDF", 0xFF00, 0xDE00, udf),
    entry!("SVC", 0xFF00, 0xDF00, svc),
    entry!("B (cond)", 0xF000, 0xD000, b_cond),
    entry!("B", 0xF800, 0xE000, b_uncond),
];

/// First matching Thumb16 entry.
pub fn decode_thumb16(word: u16) -> Option<&'static Thumb16Matcher> {
    lookup(THUMB16_TABLE, word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_movs() {
        // MOVS R0, #0x42
        let m = decode_thumb16(0x2042).unwrap();
        assert_eq!(m.name, "MOV (imm)");
    }

    #[test]
    fn test_decode_first_match_wins() {
        // SVC and UDF sit inside the B<cond> pattern space; they must win.
        assert_eq!(decode_thumb16(0xDF01).unwrap().name, "SVC");
        assert_eq!(decode_thumb16(0xDE00).unwrap().name, "UDF");
        assert_eq!(decode_thumb16(0xD0FE).unwrap().name, "B (cond)");
    }

    #[test]
    fn test_decode_dp_group() {
        assert_eq!(decode_thumb16(0x4000).unwrap().name, "AND (reg)");
        assert_eq!(decode_thumb16(0x43C0).unwrap().name, "MVN (reg)");
        assert_eq!(decode_thumb16(0x4340).unwrap().name, "MUL (reg)");
    }

    #[test]
    fn test_decode_bx_requires_zero_low_bits() {
        assert_eq!(decode_thumb16(0x4770).unwrap().name, "BX");
        // Low bits set: not BX; falls through to no match in this space.
        assert!(decode_thumb16(0x4771).is_none());
    }

    #[test]
    fn test_every_word_decodes_or_misses_cleanly() {
        // The table must never panic during lookup.
        for w in 0..=u16::MAX {
            let _ = decode_thumb16(w);
        }
    }
}
