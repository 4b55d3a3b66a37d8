//! Remove flag writes that store back a freshly-read flag.

use arx_ir::{Block, Opcode, Value};
use tracing::debug;

fn flag_pair(set: Opcode) -> Option<Opcode> {
    match set {
        Opcode::SetNFlag => Some(Opcode::GetNFlag),
        Opcode::SetZFlag => Some(Opcode::GetZFlag),
        Opcode::SetCFlag => Some(Opcode::GetCFlag),
        Opcode::SetVFlag => Some(Opcode::GetVFlag),
        _ => None,
    }
}

/// `set_?_flag(get_?_flag())` is the identity as long as both sit in the
/// same block. Sets whose value comes from arithmetic are untouched: the
/// set is the only observable effect of the computation.
pub fn flag_set_elimination(block: &mut Block) {
    let mut removed = 0usize;
    for r in block.refs() {
        let inst = block.inst(r);
        let Some(get) = flag_pair(inst.opcode) else {
            continue;
        };
        let Some(Value::Inst(src)) = inst.args.first().copied() else {
            continue;
        };
        if block.inst(src).opcode == get {
            block.invalidate(r);
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, "flag set elimination");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arx_ir::{IrBuilder, LocationDescriptor};

    fn block() -> Block {
        Block::new(LocationDescriptor::new(0x1000, true, 0))
    }

    #[test]
    fn test_removes_get_then_set_of_same_flag() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let c = ir.get_c_flag();
            ir.set_c_flag(c);
        }
        flag_set_elimination(&mut b);
        assert!(b.instructions().iter().any(|i| i.is_void()));
        assert!(!b
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::SetCFlag));
    }

    #[test]
    fn test_keeps_cross_flag_set() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let z = ir.get_z_flag();
            ir.set_c_flag(z);
        }
        flag_set_elimination(&mut b);
        assert!(b
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::SetCFlag));
    }

    #[test]
    fn test_keeps_arithmetic_carry_set() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let a = ir.imm32(1);
            let c = ir.imm32(2);
            let cin = ir.imm1(false);
            let r = ir.add_with_carry(a, c, cin);
            ir.set_c_flag(r.carry);
        }
        flag_set_elimination(&mut b);
        assert!(b
            .instructions()
            .iter()
            .any(|i| i.opcode == Opcode::SetCFlag));
    }

    #[test]
    fn test_idempotent() {
        let mut b = block();
        {
            let mut ir = IrBuilder::new(&mut b);
            let c = ir.get_c_flag();
            ir.set_c_flag(c);
            let v = ir.get_v_flag();
            ir.set_v_flag(v);
        }
        flag_set_elimination(&mut b);
        let once: Vec<_> = b.instructions().iter().map(|i| i.opcode).collect();
        flag_set_elimination(&mut b);
        let twice: Vec<_> = b.instructions().iter().map(|i| i.opcode).collect();
        assert_eq!(once, twice);
    }
}
