//! Register allocation for one block emission.
//!
//! Tracks which host register holds which IR value, inserts spills and
//! reloads against the state image's spill area, and enforces the
//! one-owner-per-register discipline. All state is local to a single
//! compilation.

use arx_ir::{Block, InstRef, Value};
use arx_state::offsets;
use rustc_hash::FxHashMap;

use crate::asm::{Assembler, Gpr, Mem, Xmm};

/// State pointer register; never allocated.
pub const STATE_REG: Gpr = Gpr::R15;

/// GPRs handed out to values, callee-saved first so short blocks do not
/// touch caller-save registers that host calls would spill anyway.
const GPR_POOL: [Gpr; 13] = [
    Gpr::Rbx,
    Gpr::Rbp,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
];

const CALLER_SAVED_GPRS: [Gpr; 9] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];

/// Callee-saved registers the prologue preserves (r15 is the dispatcher's).
pub const SAVED_GPRS: [Gpr; 5] = [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Home {
    Gpr(Gpr),
    Xmm(Xmm),
    Spill(usize),
}

#[derive(Clone, Copy, Debug)]
struct ValueInfo {
    home: Home,
    remaining_uses: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct HostReg {
    owner: Option<InstRef>,
    /// Scratch registers have undefined contents and are released at the
    /// end of the current allocation scope.
    scratch: bool,
    /// Locked registers survive eviction for the current emission step.
    locked: bool,
}

pub struct RegAlloc {
    gprs: FxHashMap<usize, HostReg>,
    xmms: [HostReg; 16],
    values: FxHashMap<u32, ValueInfo>,
    spill_used: [bool; arx_state::NUM_SPILL_SLOTS],
}

impl RegAlloc {
    pub fn new() -> Self {
        let mut gprs = FxHashMap::default();
        for g in GPR_POOL {
            gprs.insert(g.index(), HostReg::default());
        }
        Self {
            gprs,
            xmms: [HostReg::default(); 16],
            values: FxHashMap::default(),
            spill_used: [false; arx_state::NUM_SPILL_SLOTS],
        }
    }

    fn remaining(&self, r: InstRef) -> u32 {
        self.values.get(&r.0).map_or(0, |v| v.remaining_uses)
    }

    // ---- GPR side ----

    fn find_free_gpr(&self) -> Option<Gpr> {
        GPR_POOL
            .into_iter()
            .find(|g| {
                let s = &self.gprs[&g.index()];
                s.owner.is_none() && !s.scratch
            })
    }

    fn evict_one_gpr(&mut self, asm: &mut Assembler<'_>) -> Gpr {
        let victim = GPR_POOL
            .into_iter()
            .find(|g| {
                let s = &self.gprs[&g.index()];
                s.owner.is_some() && !s.locked
            })
            .expect("register allocator: no evictable GPR");
        let owner = self.gprs[&victim.index()].owner.unwrap();
        let slot = self.take_spill_slot();
        asm.mov_m_r64(Mem::Base(STATE_REG, offsets::spill(slot)), victim);
        self.values.get_mut(&owner.0).unwrap().home = Home::Spill(slot);
        self.gprs.get_mut(&victim.index()).unwrap().owner = None;
        victim
    }

    fn take_spill_slot(&mut self) -> usize {
        let slot = self
            .spill_used
            .iter()
            .position(|used| !used)
            .expect("register allocator: out of spill slots");
        self.spill_used[slot] = true;
        slot
    }

    fn alloc_gpr(&mut self, asm: &mut Assembler<'_>) -> Gpr {
        match self.find_free_gpr() {
            Some(g) => g,
            None => self.evict_one_gpr(asm),
        }
    }

    /// A register with undefined contents, released at scope end.
    pub fn scratch_gpr(&mut self, asm: &mut Assembler<'_>) -> Gpr {
        let g = self.alloc_gpr(asm);
        let s = self.gprs.get_mut(&g.index()).unwrap();
        s.scratch = true;
        s.locked = true;
        g
    }

    /// Ensure `v` is in a GPR; the value stays live for other uses.
    pub fn use_gpr(&mut self, asm: &mut Assembler<'_>, v: Value) -> Gpr {
        match v {
            Value::Inst(r) => {
                let g = self.value_to_gpr(asm, r);
                self.consume_use(r);
                self.gprs.get_mut(&g.index()).unwrap().locked = true;
                g
            }
            imm => {
                let g = self.scratch_gpr(asm);
                asm.mov_ri64(g, imm.zext_to_u64());
                g
            }
        }
    }

    /// Ensure `v` is in a GPR the emitter may clobber. If the value has
    /// further uses, a copy is handed out instead of the home register.
    pub fn use_scratch_gpr(&mut self, asm: &mut Assembler<'_>, v: Value) -> Gpr {
        match v {
            Value::Inst(r) => {
                let home = self.value_to_gpr(asm, r);
                self.consume_use(r);
                if self.remaining(r) == 0 {
                    // Last use: hand the home register over.
                    let s = self.gprs.get_mut(&home.index()).unwrap();
                    s.owner = None;
                    s.scratch = true;
                    s.locked = true;
                    self.values.remove(&r.0);
                    home
                } else {
                    self.gprs.get_mut(&home.index()).unwrap().locked = true;
                    let copy = self.scratch_gpr(asm);
                    asm.mov_rr64(copy, home);
                    copy
                }
            }
            imm => {
                let g = self.scratch_gpr(asm);
                asm.mov_ri64(g, imm.zext_to_u64());
                g
            }
        }
    }

    fn value_to_gpr(&mut self, asm: &mut Assembler<'_>, r: InstRef) -> Gpr {
        let info = *self
            .values
            .get(&r.0)
            .unwrap_or_else(|| panic!("use of undefined value %{}", r.0));
        match info.home {
            Home::Gpr(g) => g,
            Home::Spill(slot) => {
                let g = self.alloc_gpr(asm);
                asm.mov_r64_m(g, Mem::Base(STATE_REG, offsets::spill(slot)));
                self.spill_used[slot] = false;
                self.values.get_mut(&r.0).unwrap().home = Home::Gpr(g);
                self.gprs.get_mut(&g.index()).unwrap().owner = Some(r);
                g
            }
            Home::Xmm(_) => panic!("value %{} lives in an XMM register", r.0),
        }
    }

    // ---- XMM side ----

    fn find_free_xmm(&self) -> Option<Xmm> {
        (0..16)
            .find(|&i| {
                let s = &self.xmms[i];
                s.owner.is_none() && !s.scratch
            })
            .map(|i| Xmm(i as u8))
    }

    fn evict_one_xmm(&mut self, asm: &mut Assembler<'_>) -> Xmm {
        let victim = (0..16)
            .find(|&i| self.xmms[i].owner.is_some() && !self.xmms[i].locked)
            .map(|i| Xmm(i as u8))
            .expect("register allocator: no evictable XMM");
        let owner = self.xmms[victim.index()].owner.unwrap();
        let slot = self.take_spill_slot();
        asm.movaps_mr(Mem::Base(STATE_REG, offsets::spill(slot)), victim);
        self.values.get_mut(&owner.0).unwrap().home = Home::Spill(slot);
        self.xmms[victim.index()].owner = None;
        victim
    }

    fn alloc_xmm(&mut self, asm: &mut Assembler<'_>) -> Xmm {
        match self.find_free_xmm() {
            Some(x) => x,
            None => self.evict_one_xmm(asm),
        }
    }

    pub fn scratch_xmm(&mut self, asm: &mut Assembler<'_>) -> Xmm {
        let x = self.alloc_xmm(asm);
        let s = &mut self.xmms[x.index()];
        s.scratch = true;
        s.locked = true;
        x
    }

    pub fn use_xmm(&mut self, asm: &mut Assembler<'_>, v: Value) -> Xmm {
        match v {
            Value::Inst(r) => {
                let x = self.value_to_xmm(asm, r);
                self.consume_use(r);
                self.xmms[x.index()].locked = true;
                x
            }
            Value::Vector(bits) => {
                let x = self.scratch_xmm(asm);
                self.load_vector_imm(asm, x, bits);
                x
            }
            imm => {
                // Scalar immediate broadcast into the low lane.
                let x = self.scratch_xmm(asm);
                self.load_vector_imm(asm, x, imm.zext_to_u64() as u128);
                x
            }
        }
    }

    pub fn use_scratch_xmm(&mut self, asm: &mut Assembler<'_>, v: Value) -> Xmm {
        match v {
            Value::Inst(r) => {
                let home = self.value_to_xmm(asm, r);
                self.consume_use(r);
                if self.remaining(r) == 0 {
                    let s = &mut self.xmms[home.index()];
                    s.owner = None;
                    s.scratch = true;
                    s.locked = true;
                    self.values.remove(&r.0);
                    home
                } else {
                    self.xmms[home.index()].locked = true;
                    let copy = self.scratch_xmm(asm);
                    asm.movaps_rr(copy, home);
                    copy
                }
            }
            Value::Vector(bits) => {
                let x = self.scratch_xmm(asm);
                self.load_vector_imm(asm, x, bits);
                x
            }
            imm => {
                let x = self.scratch_xmm(asm);
                self.load_vector_imm(asm, x, imm.zext_to_u64() as u128);
                x
            }
        }
    }

    fn load_vector_imm(&mut self, asm: &mut Assembler<'_>, x: Xmm, bits: u128) {
        if bits == 0 {
            asm.xorps(x, x);
        } else {
            let lo = bits as u64;
            let hi = (bits >> 64) as u64;
            let cst = asm.buf.const128(lo, hi);
            asm.movaps_rm(x, Mem::RipConst(cst));
        }
    }

    fn value_to_xmm(&mut self, asm: &mut Assembler<'_>, r: InstRef) -> Xmm {
        let info = *self
            .values
            .get(&r.0)
            .unwrap_or_else(|| panic!("use of undefined value %{}", r.0));
        match info.home {
            Home::Xmm(x) => x,
            Home::Spill(slot) => {
                let x = self.alloc_xmm(asm);
                asm.movaps_rm(x, Mem::Base(STATE_REG, offsets::spill(slot)));
                self.spill_used[slot] = false;
                self.values.get_mut(&r.0).unwrap().home = Home::Xmm(x);
                self.xmms[x.index()].owner = Some(r);
                x
            }
            Home::Gpr(_) => panic!("value %{} lives in a GPR", r.0),
        }
    }

    // ---- Definition and scope ----

    fn consume_use(&mut self, r: InstRef) {
        let info = self
            .values
            .get_mut(&r.0)
            .unwrap_or_else(|| panic!("use of undefined value %{}", r.0));
        debug_assert!(info.remaining_uses > 0, "over-consumed value %{}", r.0);
        info.remaining_uses -= 1;
    }

    /// Bind the result of `inst` to a GPR the emitter just produced it in.
    pub fn define_gpr(&mut self, block: &Block, inst: InstRef, g: Gpr) {
        let uses = block.inst(inst).use_count;
        let s = self.gprs.get_mut(&g.index()).unwrap();
        debug_assert!(s.owner.is_none(), "defining into an owned register");
        s.owner = Some(inst);
        s.scratch = false;
        s.locked = true;
        self.values.insert(
            inst.0,
            ValueInfo {
                home: Home::Gpr(g),
                remaining_uses: uses,
            },
        );
    }

    pub fn define_xmm(&mut self, block: &Block, inst: InstRef, x: Xmm) {
        let uses = block.inst(inst).use_count;
        let s = &mut self.xmms[x.index()];
        debug_assert!(s.owner.is_none(), "defining into an owned register");
        s.owner = Some(inst);
        s.scratch = false;
        s.locked = true;
        self.values.insert(
            inst.0,
            ValueInfo {
                home: Home::Xmm(x),
                remaining_uses: uses,
            },
        );
    }

    /// Account for an operand the template never needs to materialize
    /// (a dead carry-in, a lane the sequence proves zero).
    pub fn discard(&mut self, v: Value) {
        if let Value::Inst(r) = v {
            self.consume_use(r);
        }
    }

    /// Take a specific register as a locked scratch, relocating whatever
    /// value currently lives there. Needed for `cl`-count shifts.
    pub fn claim_gpr(&mut self, asm: &mut Assembler<'_>, g: Gpr) {
        let s = self.gprs[&g.index()];
        assert!(!s.locked, "claiming a locked register");
        if let Some(owner) = s.owner {
            let slot = self.take_spill_slot();
            asm.mov_m_r64(Mem::Base(STATE_REG, offsets::spill(slot)), g);
            self.values.get_mut(&owner.0).unwrap().home = Home::Spill(slot);
        }
        let s = self.gprs.get_mut(&g.index()).unwrap();
        s.owner = None;
        s.scratch = true;
        s.locked = true;
    }

    /// Unlock everything and drop values whose uses are exhausted.
    /// Called after each instruction's template.
    pub fn end_of_alloc_scope(&mut self) {
        let dead: Vec<u32> = self
            .values
            .iter()
            .filter(|(_, info)| info.remaining_uses == 0)
            .map(|(&k, _)| k)
            .collect();
        for k in dead {
            let info = self.values.remove(&k).unwrap();
            match info.home {
                Home::Gpr(g) => self.gprs.get_mut(&g.index()).unwrap().owner = None,
                Home::Xmm(x) => self.xmms[x.index()].owner = None,
                Home::Spill(slot) => self.spill_used[slot] = false,
            }
        }
        for s in self.gprs.values_mut() {
            s.locked = false;
            s.scratch = false;
        }
        for s in self.xmms.iter_mut() {
            s.locked = false;
            s.scratch = false;
        }
    }

    /// Move every live value out of caller-save registers before emitting
    /// a call, keeping the SysV contract.
    pub fn host_call_spill(&mut self, asm: &mut Assembler<'_>) {
        for g in CALLER_SAVED_GPRS {
            let Some(state) = self.gprs.get(&g.index()).copied() else {
                continue;
            };
            if let Some(owner) = state.owner {
                assert!(!state.locked, "live caller-save GPR locked across a call");
                let slot = self.take_spill_slot();
                asm.mov_m_r64(Mem::Base(STATE_REG, offsets::spill(slot)), g);
                self.values.get_mut(&owner.0).unwrap().home = Home::Spill(slot);
                self.gprs.get_mut(&g.index()).unwrap().owner = None;
            }
        }
        for i in 0..16 {
            if let Some(owner) = self.xmms[i].owner {
                assert!(
                    !self.xmms[i].locked,
                    "live XMM locked across a call"
                );
                let slot = self.take_spill_slot();
                asm.movaps_mr(Mem::Base(STATE_REG, offsets::spill(slot)), Xmm(i as u8));
                self.values.get_mut(&owner.0).unwrap().home = Home::Spill(slot);
                self.xmms[i].owner = None;
            }
        }
    }

    /// Block-boundary invariant: nothing may own a register or a spill
    /// slot once the terminal is reached.
    pub fn assert_all_released(&self) {
        for (idx, s) in &self.gprs {
            assert!(
                s.owner.is_none(),
                "GPR {idx} still owned at end of block"
            );
        }
        for (i, s) in self.xmms.iter().enumerate() {
            assert!(s.owner.is_none(), "XMM {i} still owned at end of block");
        }
        assert!(
            self.values.is_empty(),
            "values with remaining uses at end of block"
        );
    }
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arx_ir::{IrBuilder, LocationDescriptor, Reg};
    use crate::codebuf::CodeBuffer;

    fn test_block() -> Block {
        let mut b = Block::new(LocationDescriptor::new(0, true, 0));
        let mut ir = IrBuilder::new(&mut b);
        let r0 = ir.get_register(Reg::R0);
        let r1 = ir.get_register(Reg::R1);
        let sum = ir.add(r0, r1);
        ir.set_register(Reg::R2, sum);
        b
    }

    #[test]
    fn test_define_use_release_cycle() {
        let block = test_block();
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        let mut ra = RegAlloc::new();

        let g0 = ra.scratch_gpr(&mut asm);
        ra.define_gpr(&block, arx_ir::InstRef(0), g0);
        ra.end_of_alloc_scope();

        // Value 0 has one use (the add), so it stays allocated.
        let back = ra.use_gpr(&mut asm, arx_ir::Value::Inst(arx_ir::InstRef(0)));
        assert_eq!(back, g0);
        ra.end_of_alloc_scope();

        // Use count exhausted: the register is free again.
        ra.assert_all_released();
    }

    #[test]
    fn test_use_scratch_copies_when_value_still_live() {
        let mut block = Block::new(LocationDescriptor::new(0, true, 0));
        {
            let mut ir = IrBuilder::new(&mut block);
            let r0 = ir.get_register(Reg::R0);
            let n1 = ir.not(r0);
            let n2 = ir.not(r0);
            ir.set_register(Reg::R1, n1);
            ir.set_register(Reg::R2, n2);
        }
        let mut buf = CodeBuffer::new(4096);
        let mut asm = Assembler::new(&mut buf);
        let mut ra = RegAlloc::new();

        let g = ra.scratch_gpr(&mut asm);
        ra.define_gpr(&block, arx_ir::InstRef(0), g);
        ra.end_of_alloc_scope();

        // First Not: the value has 2 uses; clobbering must copy.
        let s = ra.use_scratch_gpr(&mut asm, arx_ir::Value::Inst(arx_ir::InstRef(0)));
        assert_ne!(s, g);
        ra.end_of_alloc_scope();

        // Second Not: last use; the home register itself is handed over.
        let s2 = ra.use_scratch_gpr(&mut asm, arx_ir::Value::Inst(arx_ir::InstRef(0)));
        assert_eq!(s2, g);
        ra.end_of_alloc_scope();
        ra.assert_all_released();
    }

    #[test]
    fn test_spill_under_pressure() {
        let mut block = Block::new(LocationDescriptor::new(0, true, 0));
        {
            let mut ir = IrBuilder::new(&mut block);
            let mut vals = Vec::new();
            for i in 0..16 {
                let v = ir.get_register(Reg::from_index(i % 13));
                vals.push(v);
            }
            // Keep them all live.
            let mut acc = vals[0];
            for &v in &vals[1..] {
                acc = ir.add(acc, v);
            }
            ir.set_register(Reg::R0, acc);
        }
        let mut buf = CodeBuffer::new(1 << 16);
        let mut asm = Assembler::new(&mut buf);
        let mut ra = RegAlloc::new();

        // Define more values than there are pool registers; eviction must
        // kick in rather than panic.
        for i in 0..15 {
            let g = ra.scratch_gpr(&mut asm);
            ra.define_gpr(&block, arx_ir::InstRef(i), g);
            ra.end_of_alloc_scope();
        }
    }

    #[test]
    fn test_pool_excludes_reserved_registers() {
        assert!(!GPR_POOL.contains(&STATE_REG));
        assert!(!GPR_POOL.contains(&Gpr::Rsp));
        // r11 is the emitter's private call-target temporary.
        assert!(!GPR_POOL.contains(&Gpr::R11));
    }
}
