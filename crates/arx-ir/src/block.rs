//! IR basic blocks.

use crate::{Cond, Inst, InstRef, LocationDescriptor, Opcode, Terminal, Type, Value};

/// A straight-line region of lifted guest code with exactly one terminal.
#[derive(Clone, Debug)]
pub struct Block {
    /// Location this block was lifted from.
    pub location: LocationDescriptor,
    /// Predicate guarding the whole block (A32 conditional runs). `Al` for
    /// unconditional blocks.
    pub cond: Cond,
    /// Where execution resumes if `cond` fails. Set iff `cond != Al`.
    pub cond_failed: Option<LocationDescriptor>,
    instructions: Vec<Inst>,
    /// Coarse cycle count: one per translated guest instruction.
    pub cycle_count: u64,
    terminal: Option<Terminal>,
}

impl Block {
    pub fn new(location: LocationDescriptor) -> Self {
        Self {
            location,
            cond: Cond::Al,
            cond_failed: None,
            instructions: Vec::new(),
            cycle_count: 0,
            terminal: None,
        }
    }

    /// Append an instruction, checking argument types against the opcode's
    /// declared signature. Type mismatches are programmer errors.
    pub fn push(&mut self, opcode: Opcode, args: Vec<Value>) -> InstRef {
        let expected = opcode.arg_types();
        assert_eq!(
            args.len(),
            expected.len(),
            "{opcode:?}: expected {} args, got {}",
            expected.len(),
            args.len()
        );
        for (i, (arg, want)) in args.iter().zip(expected).enumerate() {
            let got = match arg {
                Value::Inst(r) => self.inst(*r).result_type(),
                imm => imm.immediate_type().unwrap(),
            };
            assert_eq!(
                got, *want,
                "{opcode:?}: arg {i} has type {got:?}, expected {want:?}"
            );
            if let Value::Inst(r) = arg {
                assert!(
                    r.index() < self.instructions.len(),
                    "{opcode:?}: forward reference to %{}",
                    r.0
                );
                self.instructions[r.index()].use_count += 1;
            }
        }
        self.instructions.push(Inst::new(opcode, args));
        InstRef(self.instructions.len() as u32 - 1)
    }

    pub fn inst(&self, r: InstRef) -> &Inst {
        &self.instructions[r.index()]
    }

    pub fn inst_mut(&mut self, r: InstRef) -> &mut Inst {
        &mut self.instructions[r.index()]
    }

    pub fn instructions(&self) -> &[Inst] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn refs(&self) -> impl DoubleEndedIterator<Item = InstRef> {
        (0..self.instructions.len() as u32).map(InstRef)
    }

    /// Turn an instruction into a no-op, releasing its uses of earlier
    /// values. The slot stays in place so existing references keep their
    /// meaning (a void result must have no remaining uses).
    pub fn invalidate(&mut self, r: InstRef) {
        let args = std::mem::take(&mut self.inst_mut(r).args);
        for arg in args {
            if let Value::Inst(dep) = arg {
                self.instructions[dep.index()].use_count -= 1;
            }
        }
        self.inst_mut(r).opcode = Opcode::Void;
    }

    /// Replace every use of `r`'s result with `value`, then invalidate `r`.
    pub fn replace_uses_with(&mut self, r: InstRef, value: Value) {
        debug_assert!(value.is_immediate() || value.inst_ref().unwrap() != r);
        let mut transferred = 0u32;
        for i in 0..self.instructions.len() {
            for a in 0..self.instructions[i].args.len() {
                if self.instructions[i].args[a] == Value::Inst(r) {
                    self.instructions[i].args[a] = value;
                    transferred += 1;
                }
            }
        }
        self.instructions[r.index()].use_count -= transferred;
        if let Value::Inst(dep) = value {
            self.instructions[dep.index()].use_count += transferred;
        }
        self.invalidate(r);
    }

    /// Block terminal. Panics if the translator has not set one.
    pub fn terminal(&self) -> Terminal {
        self.terminal.expect("block has no terminal")
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Set the terminal. Exactly one per block.
    pub fn set_terminal(&mut self, terminal: Terminal) {
        assert!(self.terminal.is_none(), "terminal already set");
        self.terminal = Some(terminal);
    }

    /// Check the structural invariants: backward-only references and
    /// argument/opcode type agreement.
    pub fn verify(&self) {
        for (i, inst) in self.instructions.iter().enumerate() {
            let expected = inst.opcode.arg_types();
            assert_eq!(inst.args.len(), expected.len());
            for (arg, want) in inst.args.iter().zip(expected) {
                match arg {
                    Value::Inst(r) => {
                        assert!(r.index() < i, "%{i} references non-earlier %{}", r.0);
                        assert_eq!(self.inst(*r).result_type(), *want);
                    }
                    imm => {
                        assert_eq!(imm.immediate_type().unwrap(), *want);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block::new(LocationDescriptor::new(0x1000, true, 0))
    }

    #[test]
    fn test_push_tracks_use_counts() {
        let mut b = block();
        let imm = b.push(Opcode::GetRegister, vec![Value::U8(0)]);
        let not = b.push(Opcode::Not, vec![Value::Inst(imm)]);
        b.push(Opcode::SetRegister, vec![Value::U8(1), Value::Inst(not)]);
        assert_eq!(b.inst(imm).use_count, 1);
        assert_eq!(b.inst(not).use_count, 1);
        b.verify();
    }

    #[test]
    #[should_panic(expected = "expected")]
    fn test_type_mismatch_panics() {
        let mut b = block();
        b.push(Opcode::Not, vec![Value::U8(1)]);
    }

    #[test]
    fn test_invalidate_releases_uses() {
        let mut b = block();
        let x = b.push(Opcode::GetRegister, vec![Value::U8(0)]);
        let n = b.push(Opcode::Not, vec![Value::Inst(x)]);
        b.invalidate(n);
        assert_eq!(b.inst(x).use_count, 0);
        assert!(b.inst(n).is_void());
    }

    #[test]
    fn test_replace_uses_with() {
        let mut b = block();
        let rd = b.push(Opcode::ReadMemory32, vec![Value::U32(0x1008)]);
        b.push(Opcode::SetRegister, vec![Value::U8(1), Value::Inst(rd)]);
        b.replace_uses_with(rd, Value::U32(0xDEAD_BEEF));
        assert!(b.inst(rd).is_void());
        assert_eq!(b.inst(InstRef(1)).args[1], Value::U32(0xDEAD_BEEF));
        b.verify();
    }

    #[test]
    #[should_panic(expected = "terminal already set")]
    fn test_double_terminal_panics() {
        let mut b = block();
        b.set_terminal(Terminal::ReturnToDispatch);
        b.set_terminal(Terminal::ReturnToDispatch);
    }
}
