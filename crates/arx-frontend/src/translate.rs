//! The translation loop: fetch, decode, lift, repeat until a terminal.

use arx_ir::{Block, Cond, IrBuilder, LocationDescriptor, Terminal};
use tracing::{debug, trace_span};

use crate::arm32::decode_arm32;
use crate::thumb16::decode_thumb16;

/// Knobs for a single translation.
#[derive(Clone, Copy, Debug, Default)]
pub struct TranslationOptions {
    /// Stop after one guest instruction regardless of control flow.
    pub single_step: bool,
}

/// Thumb instruction fetch: read the aligned 32-bit word covering the PC
/// and select the half. Thumb-32 encodings have their high five bits in
/// {0b11101, 0b11110, 0b11111}; the second half is fetched the same way.
fn read_thumb_instruction(arm_pc: u32, read_code: &mut dyn FnMut(u32) -> u32) -> (u32, bool) {
    let mut first = read_code(arm_pc & !3);
    if arm_pc & 2 != 0 {
        first >>= 16;
    }
    first &= 0xFFFF;

    if first & 0xF800 < 0xE800 {
        return (first, false);
    }

    let next_pc = arm_pc.wrapping_add(2);
    let mut second = read_code(next_pc & !3);
    if next_pc & 2 != 0 {
        second >>= 16;
    }
    second &= 0xFFFF;

    ((first << 16) | second, true)
}

fn interpret_current(ir: &mut IrBuilder<'_>) -> bool {
    ir.set_terminal(Terminal::Interpret {
        next: ir.current_location,
    });
    false
}

/// Translate one basic block starting at `descriptor`.
///
/// `read_code` returns the aligned 32-bit instruction word at the given
/// address. The block always carries exactly one terminal on return.
pub fn translate(
    descriptor: LocationDescriptor,
    read_code: &mut dyn FnMut(u32) -> u32,
    options: TranslationOptions,
) -> Block {
    let span = trace_span!("translate", location = ?descriptor);
    let _enter = span.enter();

    let mut block = Block::new(descriptor);
    let mut ir = IrBuilder::new(&mut block);
    let mut should_continue = true;

    while should_continue {
        let arm_pc = ir.current_location.pc();

        let inst_size = if ir.current_location.is_thumb() {
            let (instruction, is_thumb32) = read_thumb_instruction(arm_pc, read_code);
            if is_thumb32 {
                // No Thumb-32 coverage; hand the instruction over.
                should_continue = interpret_current(&mut ir);
                4
            } else {
                should_continue = match decode_thumb16(instruction as u16) {
                    Some(matcher) => (matcher.handler)(&mut ir, instruction as u16),
                    // Undefined encoding.
                    None => interpret_current(&mut ir),
                };
                2
            }
        } else {
            debug_assert!(arm_pc & 3 == 0, "unaligned ARM PC {arm_pc:#x}");
            let word = read_code(arm_pc & !3);
            let cond = Cond::from_bits(word >> 28);

            if ir.block.cycle_count == 0 && cond != Cond::Al && cond != Cond::Nv {
                // A conditional instruction opens a guarded single-
                // instruction block; the guard skips to cond_failed.
                ir.block.cond = cond;
                ir.block.cond_failed = Some(ir.current_location.advance(4));
            } else if ir.block.cycle_count > 0 && cond != ir.block.cond {
                // Condition change ends the block before this instruction.
                ir.set_terminal(Terminal::LinkBlock {
                    next: ir.current_location,
                });
                break;
            }

            should_continue = if cond == Cond::Nv {
                // Unconditional space (BLX imm and friends).
                interpret_current(&mut ir)
            } else {
                match decode_arm32(word) {
                    Some(matcher) => (matcher.handler)(&mut ir, word & 0x0FFF_FFFF),
                    None => interpret_current(&mut ir),
                }
            };
            4
        };

        ir.block.cycle_count += 1;

        // A visitor that set a terminal has decided where execution goes;
        // do not bump the location past it.
        if !ir.block.has_terminal() {
            ir.current_location = ir.current_location.advance(inst_size);
        }

        if should_continue && ir.block.cond != Cond::Al {
            // Guarded blocks hold exactly one instruction.
            ir.set_terminal(Terminal::LinkBlock {
                next: ir.current_location,
            });
            break;
        }

        if options.single_step {
            break;
        }
    }

    let final_location = ir.current_location;
    drop(ir);

    if !block.has_terminal() {
        block.set_terminal(Terminal::LinkBlock {
            next: final_location,
        });
    }

    debug!(
        instructions = block.len(),
        cycles = block.cycle_count,
        "translated block"
    );
    debug_assert!({
        block.verify();
        true
    });
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use arx_ir::{InstRef, Opcode, Reg, Value};

    fn thumb_loc(pc: u32) -> LocationDescriptor {
        LocationDescriptor::new(pc, true, 0)
    }

    fn arm_loc(pc: u32) -> LocationDescriptor {
        LocationDescriptor::new(pc, false, 0)
    }

    /// Translate from a little-endian halfword stream starting at `base`.
    fn translate_thumb(base: u32, halfwords: &[u16], options: TranslationOptions) -> Block {
        let code: Vec<u16> = halfwords.to_vec();
        let mut read = move |vaddr: u32| {
            let idx = ((vaddr - base) / 2) as usize;
            let lo = code.get(idx).copied().unwrap_or(0xDEDE) as u32;
            let hi = code.get(idx + 1).copied().unwrap_or(0xDEDE) as u32;
            (hi << 16) | lo
        };
        translate(thumb_loc(base), &mut read, options)
    }

    fn translate_arm(base: u32, words: &[u32], options: TranslationOptions) -> Block {
        let code: Vec<u32> = words.to_vec();
        let mut read = move |vaddr: u32| {
            let idx = ((vaddr - base) / 4) as usize;
            code.get(idx).copied().unwrap_or(0xE7F0_00F0)
        };
        translate(arm_loc(base), &mut read, options)
    }

    #[test]
    fn test_movs_single_step_block_shape() {
        // MOVS R0, #0x42 at 0x1000.
        let block = translate_thumb(
            0x1000,
            &[0x2042],
            TranslationOptions { single_step: true },
        );
        let live: Vec<_> = block
            .instructions()
            .iter()
            .filter(|i| !i.is_void())
            .map(|i| i.opcode)
            .collect();
        assert_eq!(
            live,
            vec![
                Opcode::SetRegister,
                Opcode::MostSignificantBit,
                Opcode::SetNFlag,
                Opcode::IsZero,
                Opcode::SetZFlag,
            ]
        );
        assert_eq!(block.inst(InstRef(0)).args[0], Value::U8(0));
        assert_eq!(block.inst(InstRef(0)).args[1], Value::U32(0x42));
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: thumb_loc(0x1002)
            }
        );
        assert_eq!(block.cycle_count, 1);
    }

    #[test]
    fn test_block_runs_until_branch() {
        // MOVS R0, #1; MOVS R1, #2; B -4 (to 0x1000).
        let block = translate_thumb(
            0x1000,
            &[0x2001, 0x2102, 0xE7FC],
            TranslationOptions::default(),
        );
        assert_eq!(block.cycle_count, 3);
        // B at 0x1004: target = 0x1004 + 4 + (-8) = 0x1000.
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: thumb_loc(0x1000)
            }
        );
    }

    #[test]
    fn test_conditional_branch_terminal() {
        // CMP R0, #0; BEQ +2.
        let block = translate_thumb(
            0x1000,
            &[0x2800, 0xD001],
            TranslationOptions::default(),
        );
        match block.terminal() {
            Terminal::If { cond, then_, else_ } => {
                assert_eq!(cond, Cond::Eq);
                // 0x1002 + 4 + 2 = 0x1008.
                assert_eq!(then_.pc(), 0x1008);
                assert_eq!(else_.pc(), 0x1004);
            }
            other => panic!("unexpected terminal {other:?}"),
        }
    }

    #[test]
    fn test_lsr_imm_zero_is_shift_32() {
        // LSRS R0, R1, #0.
        let block = translate_thumb(
            0x1000,
            &[0x0808],
            TranslationOptions { single_step: true },
        );
        let shift = block
            .instructions()
            .iter()
            .find(|i| i.opcode == Opcode::LogicalShiftRight)
            .unwrap();
        assert_eq!(shift.args[1], Value::U8(32));
    }

    #[test]
    fn test_asr_imm_zero_is_shift_32() {
        // ASRS R0, R1, #0.
        let block = translate_thumb(
            0x1000,
            &[0x1008],
            TranslationOptions { single_step: true },
        );
        let shift = block
            .instructions()
            .iter()
            .find(|i| i.opcode == Opcode::ArithmeticShiftRight)
            .unwrap();
        assert_eq!(shift.args[1], Value::U8(32));
    }

    #[test]
    fn test_add_pc_writes_terminate_with_return_to_dispatch() {
        // ADD PC, PC, ... (hi-register form, Rdn = PC, Rm = R0): 44 87.
        let block = translate_thumb(
            0x1000,
            &[0x4487],
            TranslationOptions::default(),
        );
        assert_eq!(block.terminal(), Terminal::ReturnToDispatch);
        // The PC write flows through the interworking mask.
        let set_pc = block
            .instructions()
            .iter()
            .filter(|i| i.opcode == Opcode::SetRegister)
            .find(|i| i.args[0] == Value::U8(Reg::PC as u8));
        assert!(set_pc.is_some());
    }

    #[test]
    fn test_add_pc_pc_is_unpredictable() {
        // ADD PC, PC (Rdn = PC, Rm = PC): dn_hi=1, m=15, low=111 → 0x44FF.
        let block = translate_thumb(
            0x1000,
            &[0x44FF],
            TranslationOptions::default(),
        );
        assert_eq!(
            block.terminal(),
            Terminal::Interpret {
                next: thumb_loc(0x1000)
            }
        );
    }

    #[test]
    fn test_svc_links_past_the_instruction() {
        // SVC #5.
        let block = translate_thumb(0x1000, &[0xDF05], TranslationOptions::default());
        let svc = block
            .instructions()
            .iter()
            .find(|i| i.opcode == Opcode::CallSupervisor)
            .unwrap();
        assert_eq!(svc.args[0], Value::U32(5));
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: thumb_loc(0x1002)
            }
        );
    }

    #[test]
    fn test_thumb32_falls_back_to_interpret() {
        // 0xF000 prefix opens a 32-bit encoding.
        let block = translate_thumb(
            0x1000,
            &[0xF000, 0xB800],
            TranslationOptions::default(),
        );
        assert_eq!(
            block.terminal(),
            Terminal::Interpret {
                next: thumb_loc(0x1000)
            }
        );
    }

    #[test]
    fn test_thumb_fetch_at_2_mod_4_takes_upper_half() {
        // MOVS R0, #7 placed at 0x1002.
        let code = [0x0000u16, 0x2007];
        let mut read = move |vaddr: u32| {
            assert_eq!(vaddr, 0x1000, "reads must be aligned");
            (u32::from(code[1]) << 16) | u32::from(code[0])
        };
        let block = translate(
            thumb_loc(0x1002),
            &mut read,
            TranslationOptions { single_step: true },
        );
        assert_eq!(block.inst(InstRef(0)).args[1], Value::U32(7));
    }

    #[test]
    fn test_arm_block_translates_and_links() {
        // MOV r0, #1; ADD r0, r0, #2; B +0.
        let block = translate_arm(
            0x2000,
            &[0xE3A0_0001, 0xE280_0002, 0xEA00_0000],
            TranslationOptions::default(),
        );
        assert_eq!(block.cycle_count, 3);
        // S is clear on both ALU instructions: no flag writes anywhere.
        assert!(!block.instructions().iter().any(|i| matches!(
            i.opcode,
            Opcode::SetNFlag | Opcode::SetZFlag | Opcode::SetCFlag | Opcode::SetVFlag
        )));
        // B at 0x2008: target = 0x2008 + 8 + 0 = 0x2010.
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: arm_loc(0x2010)
            }
        );
    }

    #[test]
    fn test_arm_conditional_run_is_single_instruction_block() {
        // ADDEQ r0, r0, #1; ADDEQ r0, r0, #2.
        let block = translate_arm(
            0x2000,
            &[0x0280_0001, 0x0280_0002],
            TranslationOptions::default(),
        );
        assert_eq!(block.cond, Cond::Eq);
        assert_eq!(block.cond_failed, Some(arm_loc(0x2004)));
        assert_eq!(block.cycle_count, 1);
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: arm_loc(0x2004)
            }
        );
    }

    #[test]
    fn test_arm_condition_change_ends_unconditional_block() {
        // MOV r0, #1; MOVNE r1, #2.
        let block = translate_arm(
            0x2000,
            &[0xE3A0_0001, 0x13A0_1002],
            TranslationOptions::default(),
        );
        assert_eq!(block.cond, Cond::Al);
        assert_eq!(block.cycle_count, 1);
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: arm_loc(0x2004)
            }
        );
    }

    #[test]
    fn test_arm_bl_sets_link_register() {
        let block = translate_arm(0x2000, &[0xEB00_0010], TranslationOptions::default());
        let set_lr = block
            .instructions()
            .iter()
            .find(|i| i.opcode == Opcode::SetRegister && i.args[0] == Value::U8(Reg::LR as u8))
            .unwrap();
        assert_eq!(set_lr.args[1], Value::U32(0x2004));
        // Target: 0x2000 + 8 + 0x40 = 0x2048.
        assert_eq!(
            block.terminal(),
            Terminal::LinkBlock {
                next: arm_loc(0x2048)
            }
        );
    }

    #[test]
    fn test_arm_ldr_literal_uses_aligned_pc() {
        // LDR r1, [pc, #4] at 0x2000: base = 0x2008, address = 0x200C.
        let block = translate_arm(
            0x2000,
            &[0xE59F_1004],
            TranslationOptions { single_step: true },
        );
        let read = block
            .instructions()
            .iter()
            .find(|i| i.opcode == Opcode::ReadMemory32)
            .unwrap();
        // Address is computed by an add of the aligned PC and the offset.
        let addr_ref = read.args[0].inst_ref().unwrap();
        let add = block.inst(addr_ref);
        assert_eq!(add.opcode, Opcode::AddWithCarry);
        assert_eq!(add.args[0], Value::U32(0x2008));
        assert_eq!(add.args[1], Value::U32(4));
    }
}
