//! 32-bit ARM decoder table and visitors.
//!
//! The condition field is not part of the match: the translate loop strips
//! it and guards conditional instructions at the block level.

use arx_ir::{IrBuilder, Reg, ResultAndCarry, Terminal, Value};

use crate::decoder::{bit32, bits32, lookup, Matcher};

pub type Arm32Matcher = Matcher<u32>;

fn reg(field: u32) -> Reg {
    Reg::from_index(field)
}

/// Reading R15 in ARM state observes the current instruction + 8.
fn read_reg(ir: &mut IrBuilder<'_>, r: Reg) -> Value {
    if r == Reg::PC {
        let pc = ir.current_location.pc().wrapping_add(8);
        ir.imm32(pc)
    } else {
        ir.get_register(r)
    }
}

fn interpret(ir: &mut IrBuilder<'_>) -> bool {
    ir.set_terminal(Terminal::Interpret {
        next: ir.current_location,
    });
    false
}

fn unpredictable(ir: &mut IrBuilder<'_>) -> bool {
    interpret(ir)
}

fn set_nz(ir: &mut IrBuilder<'_>, result: Value) {
    let n = ir.most_significant_bit(result);
    ir.set_n_flag(n);
    let z = ir.is_zero(result);
    ir.set_z_flag(z);
}

/// ARMExpandImm_C: rotate imm8 right by 2*rotate. The carry-out is the
/// rotated-in bit when the rotation is non-zero, otherwise carry-in.
fn expand_imm_c(word: u32) -> (u32, Option<bool>) {
    let rotate = bits32(word, 11, 8) * 2;
    let imm8 = bits32(word, 7, 0);
    let imm32 = imm8.rotate_right(rotate);
    let carry = if rotate == 0 {
        None
    } else {
        Some(imm32 >> 31 != 0)
    };
    (imm32, carry)
}

/// Immediate-shifted register operand. `imm5 == 0` encodes LSL #0
/// (identity), shift-by-32 for LSR/ASR, and RRX for ROR.
fn emit_imm_shift(
    ir: &mut IrBuilder<'_>,
    value: Value,
    shift_type: u32,
    imm5: u32,
    carry_in: Value,
) -> ResultAndCarry {
    match shift_type {
        0b00 => {
            let n = ir.imm8(imm5 as u8);
            ir.logical_shift_left(value, n, carry_in)
        }
        0b01 => {
            let n = ir.imm8(if imm5 == 0 { 32 } else { imm5 as u8 });
            ir.logical_shift_right(value, n, carry_in)
        }
        0b10 => {
            let n = ir.imm8(if imm5 == 0 { 32 } else { imm5 as u8 });
            ir.arithmetic_shift_right(value, n, carry_in)
        }
        _ => {
            if imm5 == 0 {
                ir.rotate_right_extended(value, carry_in)
            } else {
                let n = ir.imm8(imm5 as u8);
                ir.rotate_right(value, n, carry_in)
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DpClass {
    /// Result written to Rd; N/Z (and shifter carry) on S.
    Logical,
    /// Result written to Rd; full NZCV on S.
    Arith,
    /// Flags only, no destination (TST/TEQ: logical; CMP/CMN: arithmetic).
    TestLogical,
    TestArith,
}

fn dp_class(op: u32) -> DpClass {
    match op {
        0b0000 | 0b0001 | 0b1100 | 0b1101 | 0b1110 | 0b1111 => DpClass::Logical,
        0b1000 | 0b1001 => DpClass::TestLogical,
        0b1010 | 0b1011 => DpClass::TestArith,
        _ => DpClass::Arith,
    }
}

/// Shared body for the 16 data-processing opcodes once operand2 and its
/// carry are known.
fn dp_common(
    ir: &mut IrBuilder<'_>,
    word: u32,
    operand2: Value,
    shifter_carry: Value,
) -> bool {
    let op = bits32(word, 24, 21);
    let s = bit32(word, 20);
    let n = reg(bits32(word, 19, 16));
    let d = reg(bits32(word, 15, 12));
    let class = dp_class(op);

    if matches!(class, DpClass::TestLogical | DpClass::TestArith) && !s {
        // S=0 in the test space encodes MRS/MSR and friends.
        return interpret(ir);
    }
    if d == Reg::PC && s {
        // Flag-setting PC writes are exception returns.
        return interpret(ir);
    }

    let rn = read_reg(ir, n);
    let (result, carry, overflow) = match op {
        0b0000 | 0b1000 => (ir.and(rn, operand2), Some(shifter_carry), None),
        0b0001 | 0b1001 => (ir.eor(rn, operand2), Some(shifter_carry), None),
        0b0010 | 0b1010 => {
            let one = ir.imm1(true);
            let r = ir.sub_with_carry(rn, operand2, one);
            (r.result, Some(r.carry), Some(r.overflow))
        }
        0b0011 => {
            let one = ir.imm1(true);
            let r = ir.sub_with_carry(operand2, rn, one);
            (r.result, Some(r.carry), Some(r.overflow))
        }
        0b0100 | 0b1011 => {
            let zero = ir.imm1(false);
            let r = ir.add_with_carry(rn, operand2, zero);
            (r.result, Some(r.carry), Some(r.overflow))
        }
        0b0101 => {
            let c = ir.get_c_flag();
            let r = ir.add_with_carry(rn, operand2, c);
            (r.result, Some(r.carry), Some(r.overflow))
        }
        0b0110 => {
            let c = ir.get_c_flag();
            let r = ir.sub_with_carry(rn, operand2, c);
            (r.result, Some(r.carry), Some(r.overflow))
        }
        0b0111 => {
            let c = ir.get_c_flag();
            let r = ir.sub_with_carry(operand2, rn, c);
            (r.result, Some(r.carry), Some(r.overflow))
        }
        0b1100 => (ir.or(rn, operand2), Some(shifter_carry), None),
        0b1101 => (operand2, Some(shifter_carry), None),
        0b1110 => {
            let not_op2 = ir.not(operand2);
            (ir.and(rn, not_op2), Some(shifter_carry), None)
        }
        _ => {
            let r = ir.not(operand2);
            (r, Some(shifter_carry), None)
        }
    };

    match class {
        DpClass::TestLogical | DpClass::TestArith => {
            set_nz(ir, result);
            if let Some(c) = carry {
                ir.set_c_flag(c);
            }
            if let Some(v) = overflow {
                ir.set_v_flag(v);
            }
            true
        }
        DpClass::Logical | DpClass::Arith => {
            if d == Reg::PC {
                ir.alu_write_pc(result);
                ir.set_terminal(Terminal::ReturnToDispatch);
                return false;
            }
            ir.set_register(d, result);
            if s {
                set_nz(ir, result);
                if let Some(c) = carry {
                    ir.set_c_flag(c);
                }
                if let Some(v) = overflow {
                    ir.set_v_flag(v);
                }
            }
            true
        }
    }
}

fn dp_imm(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let (imm32, carry) = expand_imm_c(word);
    let operand2 = ir.imm32(imm32);
    let shifter_carry = match carry {
        Some(c) => ir.imm1(c),
        None => ir.get_c_flag(),
    };
    dp_common(ir, word, operand2, shifter_carry)
}

fn dp_reg(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let imm5 = bits32(word, 11, 7);
    let shift_type = bits32(word, 6, 5);
    let m = reg(bits32(word, 3, 0));
    let rm = read_reg(ir, m);
    let carry_in = ir.get_c_flag();
    let shifted = emit_imm_shift(ir, rm, shift_type, imm5, carry_in);
    dp_common(ir, word, shifted.result, shifted.carry)
}

fn dp_reg_shifted(ir: &mut IrBuilder<'_>, _word: u32) -> bool {
    // Register-shifted-register operand2 is rare enough to interpret.
    interpret(ir)
}

fn movw(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    if d == Reg::PC {
        return unpredictable(ir);
    }
    let imm = (bits32(word, 19, 16) << 12) | bits32(word, 11, 0);
    // MOVW <Rd>, #<imm16>
    let value = ir.imm32(imm);
    ir.set_register(d, value);
    true
}

fn movt(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    if d == Reg::PC {
        return unpredictable(ir);
    }
    let imm = (bits32(word, 19, 16) << 12) | bits32(word, 11, 0);
    // MOVT <Rd>, #<imm16>: replace the top half, keep the bottom.
    let rd = ir.get_register(d);
    let low_mask = ir.imm32(0x0000_FFFF);
    let low = ir.and(rd, low_mask);
    let high = ir.imm32(imm << 16);
    let value = ir.or(low, high);
    ir.set_register(d, value);
    true
}

fn mul(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 19, 16));
    let s = bit32(word, 20);
    let m = reg(bits32(word, 11, 8));
    let n = reg(bits32(word, 3, 0));
    if d == Reg::PC || m == Reg::PC || n == Reg::PC {
        return unpredictable(ir);
    }
    // MUL{S} <Rd>, <Rn>, <Rm>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    let result = ir.mul(rn, rm);
    ir.set_register(d, result);
    if s {
        set_nz(ir, result);
    }
    true
}

fn mla(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 19, 16));
    let s = bit32(word, 20);
    let a = reg(bits32(word, 15, 12));
    let m = reg(bits32(word, 11, 8));
    let n = reg(bits32(word, 3, 0));
    if d == Reg::PC || a == Reg::PC || m == Reg::PC || n == Reg::PC {
        return unpredictable(ir);
    }
    // MLA{S} <Rd>, <Rn>, <Rm>, <Ra>
    let rn = ir.get_register(n);
    let rm = ir.get_register(m);
    let product = ir.mul(rn, rm);
    let ra = ir.get_register(a);
    let result = ir.add(product, ra);
    ir.set_register(d, result);
    if s {
        set_nz(ir, result);
    }
    true
}

fn clz(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    let m = reg(bits32(word, 3, 0));
    if d == Reg::PC || m == Reg::PC {
        return unpredictable(ir);
    }
    // CLZ <Rd>, <Rm>
    let rm = ir.get_register(m);
    let result = ir.count_leading_zeros(rm);
    ir.set_register(d, result);
    true
}

fn bx(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let m = reg(bits32(word, 3, 0));
    // BX <Rm>: bit 0 of the stored PC carries the Thumb bit for the
    // dispatcher.
    let target = read_reg(ir, m);
    ir.set_register(Reg::PC, target);
    ir.set_terminal(Terminal::ReturnToDispatch);
    false
}

fn branch(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let imm32 = ((bits32(word, 23, 0) as i32) << 8 >> 6) as u32;
    // B <label>
    let target = ir.current_location.pc().wrapping_add(8).wrapping_add(imm32);
    ir.set_terminal(Terminal::LinkBlock {
        next: ir.current_location.with_pc(target),
    });
    false
}

fn branch_link(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let imm32 = ((bits32(word, 23, 0) as i32) << 8 >> 6) as u32;
    // BL <label>
    let ret = ir.current_location.pc().wrapping_add(4);
    let ret = ir.imm32(ret);
    ir.set_register(Reg::LR, ret);
    let target = ir.current_location.pc().wrapping_add(8).wrapping_add(imm32);
    ir.set_terminal(Terminal::LinkBlock {
        next: ir.current_location.with_pc(target),
    });
    false
}

/// Word/byte load-store, immediate offset. Only offset addressing (P=1,
/// W=0) is lifted; pre/post-indexed writeback goes to the interpreter.
fn load_store_imm(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let p = bit32(word, 24);
    let u = bit32(word, 23);
    let byte = bit32(word, 22);
    let w = bit32(word, 21);
    let load = bit32(word, 20);
    let n = reg(bits32(word, 19, 16));
    let t = reg(bits32(word, 15, 12));
    let imm12 = bits32(word, 11, 0);

    if !p || w {
        return interpret(ir);
    }

    let base = if n == Reg::PC {
        let aligned = ir.align_pc(4);
        ir.imm32(aligned)
    } else {
        ir.get_register(n)
    };
    let offset = ir.imm32(if u { imm12 } else { imm12.wrapping_neg() });
    let address = ir.add(base, offset);

    match (load, byte) {
        (true, false) => {
            // LDR <Rt>, [<Rn>, #+/-<imm12>]
            let data = ir.read_memory_32(address);
            if t == Reg::PC {
                ir.set_register(Reg::PC, data);
                ir.set_terminal(Terminal::ReturnToDispatch);
                return false;
            }
            ir.set_register(t, data);
        }
        (true, true) => {
            // LDRB <Rt>, [<Rn>, #+/-<imm12>]
            if t == Reg::PC {
                return unpredictable(ir);
            }
            let byte = ir.read_memory_8(address);
            let data = ir.zero_extend_byte_to_word(byte);
            ir.set_register(t, data);
        }
        (false, false) => {
            // STR <Rt>, [<Rn>, #+/-<imm12>]
            let data = read_reg(ir, t);
            ir.write_memory_32(address, data);
        }
        (false, true) => {
            // STRB <Rt>, [<Rn>, #+/-<imm12>]
            if t == Reg::PC {
                return unpredictable(ir);
            }
            let rt = ir.get_register(t);
            let data = ir.least_significant_byte(rt);
            ir.write_memory_8(address, data);
        }
    }
    true
}

/// Word/byte load-store, immediate-shifted register offset.
fn load_store_reg(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let p = bit32(word, 24);
    let u = bit32(word, 23);
    let byte = bit32(word, 22);
    let w = bit32(word, 21);
    let load = bit32(word, 20);
    let n = reg(bits32(word, 19, 16));
    let t = reg(bits32(word, 15, 12));
    let imm5 = bits32(word, 11, 7);
    let shift_type = bits32(word, 6, 5);
    let m = reg(bits32(word, 3, 0));

    if !p || w || m == Reg::PC {
        return interpret(ir);
    }
    if t == Reg::PC {
        return unpredictable(ir);
    }

    let rm = ir.get_register(m);
    let carry_in = ir.get_c_flag();
    let offset = emit_imm_shift(ir, rm, shift_type, imm5, carry_in).result;
    let base = read_reg(ir, n);
    let address = if u {
        ir.add(base, offset)
    } else {
        let negated = ir.not(offset);
        let one = ir.imm1(true);
        let r = ir.add_with_carry(base, negated, one);
        r.result
    };

    match (load, byte) {
        (true, false) => {
            let data = ir.read_memory_32(address);
            ir.set_register(t, data);
        }
        (true, true) => {
            let b = ir.read_memory_8(address);
            let data = ir.zero_extend_byte_to_word(b);
            ir.set_register(t, data);
        }
        (false, false) => {
            let data = ir.get_register(t);
            ir.write_memory_32(address, data);
        }
        (false, true) => {
            let rt = ir.get_register(t);
            let data = ir.least_significant_byte(rt);
            ir.write_memory_8(address, data);
        }
    }
    true
}

fn extend_operand(ir: &mut IrBuilder<'_>, word: u32) -> Value {
    let rotate = bits32(word, 11, 10) * 8;
    let m = reg(bits32(word, 3, 0));
    let rm = ir.get_register(m);
    if rotate == 0 {
        rm
    } else {
        let n = ir.imm8(rotate as u8);
        let zero = ir.imm1(false);
        ir.rotate_right(rm, n, zero).result
    }
}

fn sxtb(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    if d == Reg::PC || bits32(word, 3, 0) == 15 {
        return unpredictable(ir);
    }
    // SXTB <Rd>, <Rm>{, <rotation>}
    let rotated = extend_operand(ir, word);
    let b = ir.least_significant_byte(rotated);
    let data = ir.sign_extend_byte_to_word(b);
    ir.set_register(d, data);
    true
}

fn sxth(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    if d == Reg::PC || bits32(word, 3, 0) == 15 {
        return unpredictable(ir);
    }
    // SXTH <Rd>, <Rm>{, <rotation>}
    let rotated = extend_operand(ir, word);
    let h = ir.least_significant_half(rotated);
    let data = ir.sign_extend_half_to_word(h);
    ir.set_register(d, data);
    true
}

fn uxtb(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    if d == Reg::PC || bits32(word, 3, 0) == 15 {
        return unpredictable(ir);
    }
    // UXTB <Rd>, <Rm>{, <rotation>}
    let rotated = extend_operand(ir, word);
    let b = ir.least_significant_byte(rotated);
    let data = ir.zero_extend_byte_to_word(b);
    ir.set_register(d, data);
    true
}

fn uxth(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    if d == Reg::PC || bits32(word, 3, 0) == 15 {
        return unpredictable(ir);
    }
    // UXTH <Rd>, <Rm>{, <rotation>}
    let rotated = extend_operand(ir, word);
    let h = ir.least_significant_half(rotated);
    let data = ir.zero_extend_half_to_word(h);
    ir.set_register(d, data);
    true
}

fn rev(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    let m = reg(bits32(word, 3, 0));
    if d == Reg::PC || m == Reg::PC {
        return unpredictable(ir);
    }
    // REV <Rd>, <Rm>
    let rm = ir.get_register(m);
    let data = ir.byte_reverse_word(rm);
    ir.set_register(d, data);
    true
}

fn revsh(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let d = reg(bits32(word, 15, 12));
    let m = reg(bits32(word, 3, 0));
    if d == Reg::PC || m == Reg::PC {
        return unpredictable(ir);
    }
    // REVSH <Rd>, <Rm>
    let rm = ir.get_register(m);
    let half = ir.least_significant_half(rm);
    let rev_half = ir.byte_reverse_half(half);
    let data = ir.sign_extend_half_to_word(rev_half);
    ir.set_register(d, data);
    true
}

fn svc(ir: &mut IrBuilder<'_>, word: u32) -> bool {
    let imm24 = bits32(word, 23, 0);
    // SVC #<imm24>
    let imm = ir.imm32(imm24);
    ir.call_supervisor(imm);
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

/// Ordered A32 decode table over bits 27:0 (condition stripped by the
/// caller); first match wins.
pub static ARM32_TABLE: &[Arm32Matcher] = &[
    entry!("BX", 0x0FFF_FFF0, 0x012F_FF10, bx),
    entry!("CLZ", 0x0FFF_0FF0, 0x016F_0F10, clz),
    entry!("MUL", 0x0FE0_F0F0, 0x0000_0090, mul),
    entry!("MLA", 0x0FE0_00F0, 0x0020_0090, mla),
    entry!("MOVW", 0x0FF0_0000, 0x0300_0000, movw),
    entry!("MOVT", 0x0FF0_0000, 0x0340_0000, movt),
    entry!("SXTB", 0x0FFF_03F0, 0x06AF_0070, sxtb),
    entry!("SXTH", 0x0FFF_03F0, 0x06BF_0070, sxth),
    entry!("UXTB", 0x0FFF_03F0, 0x06EF_0070, uxtb),
    entry!("UXTH", 0x0FFF_03F0, 0x06FF_0070, uxth),
    entry!("REV", 0x0FFF_0FF0, 0x06BF_0F30, rev),
    entry!("REVSH", 0x0FFF_0FF0, 0x06FF_0FB0, revsh),
    entry!("DP (imm)", 0x0E00_0000, 0x0200_0000, dp_imm),
    entry!("DP (reg)", 0x0E00_0010, 0x0000_0000, dp_reg),
    entry!("DP (rsr)", 0x0E00_0090, 0x0000_0010, dp_reg_shifted),
    entry!("LDR/STR (imm)", 0x0E00_0000, 0x0400_0000, load_store_imm),
    entry!("LDR/STR (reg)", 0x0E00_0010, 0x0600_0000, load_store_reg),
    entry!("B", 0x0F00_0000, 0x0A00_0000, branch),
    entry!("BL", 0x0F00_0000, 0x0B00_0000, branch_link),
    entry!("SVC", 0x0F00_0000, 0x0F00_0000, svc),
];

/// First matching A32 entry for a condition-stripped word.
pub fn decode_arm32(word: u32) -> Option<&'static Arm32Matcher> {
    lookup(ARM32_TABLE, word & 0x0FFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dp() {
        // ADD r0, r1, r2 = E0810002
        assert_eq!(decode_arm32(0xE081_0002).unwrap().name, "DP (reg)");
        // MOV r0, #1 = E3A00001
        assert_eq!(decode_arm32(0xE3A0_0001).unwrap().name, "DP (imm)");
    }

    #[test]
    fn test_decode_specifics_win_over_dp() {
        // BX lr = E12FFF1E
        assert_eq!(decode_arm32(0xE12F_FF1E).unwrap().name, "BX");
        // CLZ r0, r1 = E16F0F11
        assert_eq!(decode_arm32(0xE16F_0F11).unwrap().name, "CLZ");
        // MUL r0, r1, r2 = E0000291
        assert_eq!(decode_arm32(0xE000_0291).unwrap().name, "MUL");
        // MOVW r0, #0x1234 = E3010234
        assert_eq!(decode_arm32(0xE301_0234).unwrap().name, "MOVW");
    }

    #[test]
    fn test_decode_load_store() {
        // LDR r0, [r1, #4] = E5910004
        assert_eq!(decode_arm32(0xE591_0004).unwrap().name, "LDR/STR (imm)");
        // STR r0, [r1, r2] = E7810002
        assert_eq!(decode_arm32(0xE781_0002).unwrap().name, "LDR/STR (reg)");
    }

    #[test]
    fn test_decode_branches_and_svc() {
        assert_eq!(decode_arm32(0xEA00_0000).unwrap().name, "B");
        assert_eq!(decode_arm32(0xEB00_0000).unwrap().name, "BL");
        assert_eq!(decode_arm32(0xEF00_0001).unwrap().name, "SVC");
    }

    #[test]
    fn test_expand_imm_c() {
        // Rotate 0: carry unchanged.
        assert_eq!(expand_imm_c(0x0000_00FF), (0xFF, None));
        // MOV r0, #0xFF000000: imm8=0xFF ror 8.
        let (imm, carry) = expand_imm_c(0x0000_04FF);
        assert_eq!(imm, 0xFF00_0000);
        assert_eq!(carry, Some(true));
    }
}
