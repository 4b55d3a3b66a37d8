//! Fold reads of read-only guest memory into literals.

use arx_ir::{Block, Opcode, Value};
use arx_state::UserCallbacks;
use tracing::debug;

/// Replace `read_memory_N(imm)` with the value behind it when the callback
/// reports the address read-only. Reads of anything else are left alone:
/// an MMIO read folded at compile time would lose its side effect.
pub fn constant_memory_reads(block: &mut Block, cb: &mut dyn UserCallbacks) {
    let mut folded = 0usize;
    for r in block.refs() {
        let inst = block.inst(r);
        if inst.opcode.memory_read_width().is_none() || !inst.are_all_args_immediates() {
            continue;
        }
        let vaddr = inst.arg(0).as_u32();
        if !cb.is_read_only_memory(vaddr) {
            continue;
        }
        let literal = match inst.opcode {
            Opcode::ReadMemory8 => Value::U8(cb.memory_read_8(vaddr)),
            Opcode::ReadMemory16 => Value::U16(cb.memory_read_16(vaddr)),
            Opcode::ReadMemory32 => Value::U32(cb.memory_read_32(vaddr)),
            Opcode::ReadMemory64 => Value::U64(cb.memory_read_64(vaddr)),
            _ => unreachable!(),
        };
        block.replace_uses_with(r, literal);
        folded += 1;
    }
    if folded > 0 {
        debug!(folded, "constant memory reads");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arx_frontend::{translate, TranslationOptions};
    use arx_ir::LocationDescriptor;
    use arx_state::testing::TestCallbacks;

    #[test]
    fn test_pc_relative_load_from_rom_folds_to_literal() {
        // Thumb LDR R1, [PC, #4] at 0x1000 reads 0x1008.
        let mut cb = TestCallbacks::new(0x2000);
        cb.memory_write_32(0x1008, 0xDEAD_BEEF);
        cb.read_only_below = 0x2000;

        let mut read = |vaddr: u32| {
            assert_eq!(vaddr, 0x1000);
            0x0000_4901 // LDR R1, [PC, #4] in the low half
        };
        let mut block = translate(
            LocationDescriptor::new(0x1000, true, 0),
            &mut read,
            TranslationOptions { single_step: true },
        );

        constant_memory_reads(&mut block, &mut cb);

        assert!(!block
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::ReadMemory32));
        let set = block
            .instructions()
            .iter()
            .find(|i| i.opcode == Opcode::SetRegister)
            .unwrap();
        assert_eq!(set.args[0], Value::U8(1));
        assert_eq!(set.args[1], Value::U32(0xDEAD_BEEF));
    }

    #[test]
    fn test_mmio_reads_are_never_folded() {
        let mut cb = TestCallbacks::new(0x2000);
        cb.read_only_below = 0; // nothing is read-only
        cb.memory_write_32(0x1008, 0x1234_5678);

        let mut read = |_vaddr: u32| 0x0000_4901;
        let mut block = translate(
            LocationDescriptor::new(0x1000, true, 0),
            &mut read,
            TranslationOptions { single_step: true },
        );
        constant_memory_reads(&mut block, &mut cb);

        assert!(block
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::ReadMemory32));
    }

    #[test]
    fn test_idempotent() {
        let mut cb = TestCallbacks::new(0x2000);
        cb.memory_write_32(0x1008, 0xCAFE_F00D);
        cb.read_only_below = 0x2000;

        let mut read = |_vaddr: u32| 0x0000_4901;
        let mut block = translate(
            LocationDescriptor::new(0x1000, true, 0),
            &mut read,
            TranslationOptions { single_step: true },
        );
        constant_memory_reads(&mut block, &mut cb);
        let once: Vec<_> = block.instructions().iter().map(|i| i.opcode).collect();
        constant_memory_reads(&mut block, &mut cb);
        let twice: Vec<_> = block.instructions().iter().map(|i| i.opcode).collect();
        assert_eq!(once, twice);
    }
}
