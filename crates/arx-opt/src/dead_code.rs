//! Dead-code elimination.

use arx_ir::Block;
use tracing::debug;

/// Invalidate pure instructions whose results are never used. A single
/// backward walk is enough: a user always sits after its definition, so by
/// the time the walk reaches the definition every dead user has already
/// released its operands.
pub fn dead_code_elimination(block: &mut Block) {
    let mut removed = 0usize;
    for r in block.refs().rev() {
        let inst = block.inst(r);
        if inst.is_void() || inst.opcode.has_side_effects() || inst.use_count > 0 {
            continue;
        }
        block.invalidate(r);
        removed += 1;
    }
    if removed > 0 {
        debug!(removed, "dead code elimination");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arx_ir::{IrBuilder, LocationDescriptor, Opcode};

    fn block() -> Block {
        Block::new(LocationDescriptor::new(0x1000, true, 0))
    }

    #[test]
    fn test_unused_overflow_pseudo_op_dies() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let a = ir.get_register(arx_ir::Reg::R0);
            let c = ir.imm32(2);
            let cin = ir.imm1(false);
            let r = ir.add_with_carry(a, c, cin);
            ir.set_register(arx_ir::Reg::R1, r.result);
            ir.set_c_flag(r.carry);
            // r.overflow is never consumed.
        }
        dead_code_elimination(&mut b);
        assert!(!b
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::GetOverflowFromOp));
        // The arithmetic itself is still live through its uses.
        assert!(b
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::AddWithCarry));
    }

    #[test]
    fn test_dead_chains_die_in_one_pass() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let a = ir.get_register(arx_ir::Reg::R0);
            let n = ir.not(a);
            let _unused = ir.not(n);
        }
        dead_code_elimination(&mut b);
        // Everything here is pure, including the register read.
        assert!(b.instructions().iter().all(|i| i.is_void()));
    }

    #[test]
    fn test_side_effects_survive() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let addr = ir.imm32(0x1000);
            let _data = ir.read_memory_32(addr);
        }
        dead_code_elimination(&mut b);
        assert!(b
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::ReadMemory32));
    }

    #[test]
    fn test_idempotent() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let a = ir.get_register(arx_ir::Reg::R0);
            let _n = ir.not(a);
        }
        dead_code_elimination(&mut b);
        let once: Vec<_> = b.instructions().iter().map(|i| i.opcode).collect();
        dead_code_elimination(&mut b);
        let twice: Vec<_> = b.instructions().iter().map(|i| i.opcode).collect();
        assert_eq!(once, twice);
    }
}
