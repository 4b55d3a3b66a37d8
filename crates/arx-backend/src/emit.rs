//! Block emission: prologue, per-opcode dispatch, terminals.

use arx_ir::{Block, Cond, InstRef, LocationDescriptor, Opcode, Terminal};
use arx_state::offsets;
use std::ffi::c_void;
use tracing::trace;

use crate::asm::{Assembler, Gpr, HostCond, Mem};
use crate::codebuf::{CodeBuffer, CodeBufferError};
use crate::regalloc::{RegAlloc, SAVED_GPRS, STATE_REG};
use crate::{emit_data, emit_vector, HostFeatures};

/// Host entry points for guest memory, supervisor calls, and cycle
/// accounting, reachable from emitted code. The context pointer and the
/// function pointers are baked into the generated code, so the table (and
/// whatever `ctx` points at) must outlive it.
#[derive(Clone, Copy)]
pub struct EnvTable {
    pub ctx: *mut c_void,
    pub read8: extern "sysv64" fn(*mut c_void, u32) -> u32,
    pub read16: extern "sysv64" fn(*mut c_void, u32) -> u32,
    pub read32: extern "sysv64" fn(*mut c_void, u32) -> u32,
    pub read64: extern "sysv64" fn(*mut c_void, u32) -> u64,
    pub write8: extern "sysv64" fn(*mut c_void, u32, u32),
    pub write16: extern "sysv64" fn(*mut c_void, u32, u32),
    pub write32: extern "sysv64" fn(*mut c_void, u32, u32),
    pub write64: extern "sysv64" fn(*mut c_void, u32, u64),
    pub svc: extern "sysv64" fn(*mut c_void, u32),
}

/// Per-compilation emission knobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmitConfig {
    pub features: HostFeatures,
    /// Request ARM-faithful NaN propagation even where the host SIMD op
    /// would produce a different NaN.
    pub accurate_nan: bool,
}

/// Where a compiled block landed in the buffer.
#[derive(Clone, Copy, Debug)]
pub struct BlockDescriptor {
    pub entry_offset: usize,
    pub size: usize,
}

pub(crate) struct Emitter<'a> {
    pub asm: Assembler<'a>,
    pub ra: RegAlloc,
    pub block: &'a Block,
    pub config: &'a EmitConfig,
    pub env: &'a EnvTable,
    /// Target of a `LinkBlockFast` terminal, when already compiled.
    pub fast_lookup: Option<&'a dyn Fn(LocationDescriptor) -> Option<*const u8>>,
}

impl<'a> Emitter<'a> {
    /// The FPSCR codegen bits active for this block.
    pub fn fpcr(&self) -> u32 {
        self.block.location.fpscr()
    }

    pub fn fpscr_dn(&self) -> bool {
        self.block.location.fpscr_dn()
    }

    pub fn accurate_nan(&self) -> bool {
        self.config.accurate_nan
    }

    /// Pseudo-instruction extracting a secondary result of `producer`, if
    /// it is live.
    pub fn live_pseudo_op(&self, producer: InstRef, opcode: Opcode) -> Option<InstRef> {
        self.block.refs().find(|&r| {
            let inst = self.block.inst(r);
            inst.opcode == opcode
                && inst.args.first().and_then(|a| a.inst_ref()) == Some(producer)
                && inst.use_count > 0
        })
    }

    /// Settle the uses pseudo-instructions hold on `producer`. The
    /// producer's template resolves them inline (or proves them dead), so
    /// they never go through the allocator's use path. Called after the
    /// producer's result is defined.
    pub fn release_pseudo_uses(&mut self, producer: InstRef) {
        for r in self.block.refs() {
            let inst = self.block.inst(r);
            if matches!(
                inst.opcode,
                Opcode::GetCarryFromOp | Opcode::GetOverflowFromOp
            ) && inst.args.first().and_then(|a| a.inst_ref()) == Some(producer)
            {
                self.ra.discard(arx_ir::Value::Inst(producer));
            }
        }
    }
}

fn emit_prologue(asm: &mut Assembler<'_>) {
    for g in SAVED_GPRS {
        asm.push_r64(g);
    }
}

fn emit_epilogue(asm: &mut Assembler<'_>) {
    for g in SAVED_GPRS.iter().rev() {
        asm.pop_r64(*g);
    }
}

/// Jump to `target` when the guest condition holds, reading the flag bytes
/// from the state image. Only used at block boundaries where no values are
/// live, so rax/rcx are free for the comparison.
fn emit_cond_jump(asm: &mut Assembler<'_>, cond: Cond, target: crate::codebuf::Label) {
    let n = Mem::Base(STATE_REG, offsets::n_flag());
    let z = Mem::Base(STATE_REG, offsets::z_flag());
    let c = Mem::Base(STATE_REG, offsets::c_flag());
    let v = Mem::Base(STATE_REG, offsets::v_flag());

    let flag_set = |asm: &mut Assembler<'_>, mem: Mem, want: bool, target| {
        asm.movzx_r32_m8(Gpr::Rax, mem);
        asm.test_rr32(Gpr::Rax, Gpr::Rax);
        asm.jcc_label(if want { HostCond::Ne } else { HostCond::E }, target);
    };

    match cond {
        Cond::Eq => flag_set(asm, z, true, target),
        Cond::Ne => flag_set(asm, z, false, target),
        Cond::Cs => flag_set(asm, c, true, target),
        Cond::Cc => flag_set(asm, c, false, target),
        Cond::Mi => flag_set(asm, n, true, target),
        Cond::Pl => flag_set(asm, n, false, target),
        Cond::Vs => flag_set(asm, v, true, target),
        Cond::Vc => flag_set(asm, v, false, target),
        Cond::Hi => {
            // C set and Z clear.
            let skip = asm.buf.new_label();
            asm.movzx_r32_m8(Gpr::Rax, c);
            asm.test_rr32(Gpr::Rax, Gpr::Rax);
            asm.jcc_label(HostCond::E, skip);
            asm.movzx_r32_m8(Gpr::Rax, z);
            asm.test_rr32(Gpr::Rax, Gpr::Rax);
            asm.jcc_label(HostCond::E, target);
            asm.buf.bind_label(skip);
        }
        Cond::Ls => {
            // C clear or Z set.
            asm.movzx_r32_m8(Gpr::Rax, c);
            asm.test_rr32(Gpr::Rax, Gpr::Rax);
            asm.jcc_label(HostCond::E, target);
            asm.movzx_r32_m8(Gpr::Rax, z);
            asm.test_rr32(Gpr::Rax, Gpr::Rax);
            asm.jcc_label(HostCond::Ne, target);
        }
        Cond::Ge => {
            asm.movzx_r32_m8(Gpr::Rax, n);
            asm.movzx_r32_m8(Gpr::Rcx, v);
            asm.cmp_rr32(Gpr::Rax, Gpr::Rcx);
            asm.jcc_label(HostCond::E, target);
        }
        Cond::Lt => {
            asm.movzx_r32_m8(Gpr::Rax, n);
            asm.movzx_r32_m8(Gpr::Rcx, v);
            asm.cmp_rr32(Gpr::Rax, Gpr::Rcx);
            asm.jcc_label(HostCond::Ne, target);
        }
        Cond::Gt => {
            // Z clear, and N equals V.
            let skip = asm.buf.new_label();
            asm.movzx_r32_m8(Gpr::Rax, z);
            asm.test_rr32(Gpr::Rax, Gpr::Rax);
            asm.jcc_label(HostCond::Ne, skip);
            asm.movzx_r32_m8(Gpr::Rax, n);
            asm.movzx_r32_m8(Gpr::Rcx, v);
            asm.cmp_rr32(Gpr::Rax, Gpr::Rcx);
            asm.jcc_label(HostCond::E, target);
            asm.buf.bind_label(skip);
        }
        Cond::Le => {
            // Z set, or N differs from V.
            asm.movzx_r32_m8(Gpr::Rax, z);
            asm.test_rr32(Gpr::Rax, Gpr::Rax);
            asm.jcc_label(HostCond::Ne, target);
            asm.movzx_r32_m8(Gpr::Rax, n);
            asm.movzx_r32_m8(Gpr::Rcx, v);
            asm.cmp_rr32(Gpr::Rax, Gpr::Rcx);
            asm.jcc_label(HostCond::Ne, target);
        }
        Cond::Al | Cond::Nv => panic!("AL/NV are not emitted as guards"),
    }
}

/// Store the resume PC and return to the dispatcher.
fn emit_exit_to(asm: &mut Assembler<'_>, next: LocationDescriptor, cycles: u64) {
    asm.mov_m32_i(Mem::Base(STATE_REG, offsets::reg(15)), next.pc());
    emit_exit_dynamic(asm, cycles);
}

/// Return to the dispatcher with whatever PC the block stored.
fn emit_exit_dynamic(asm: &mut Assembler<'_>, cycles: u64) {
    asm.sub_m64_i32(
        Mem::Base(STATE_REG, offsets::cycles_remaining()),
        cycles as i32,
    );
    emit_epilogue(asm);
    asm.ret();
}

fn emit_terminal(em: &mut Emitter<'_>) {
    let cycles = em.block.cycle_count;
    match em.block.terminal() {
        Terminal::LinkBlock { next } => {
            emit_exit_to(&mut em.asm, next, cycles);
        }
        Terminal::LinkBlockFast { next } => {
            let target = em.fast_lookup.and_then(|lookup| lookup(next));
            match target {
                Some(ptr) => {
                    // Chain straight into the compiled target; its own
                    // prologue runs after our epilogue.
                    em.asm
                        .mov_m32_i(Mem::Base(STATE_REG, offsets::reg(15)), next.pc());
                    em.asm.sub_m64_i32(
                        Mem::Base(STATE_REG, offsets::cycles_remaining()),
                        cycles as i32,
                    );
                    emit_epilogue(&mut em.asm);
                    em.asm.jmp_abs_in_buffer(ptr);
                }
                None => emit_exit_to(&mut em.asm, next, cycles),
            }
        }
        Terminal::If { cond, then_, else_ } => {
            let taken = em.asm.buf.new_label();
            emit_cond_jump(&mut em.asm, cond, taken);
            emit_exit_to(&mut em.asm, else_, cycles);
            em.asm.buf.bind_label(taken);
            emit_exit_to(&mut em.asm, then_, cycles);
        }
        Terminal::Interpret { next } => {
            em.asm
                .mov_m8_i(Mem::Base(STATE_REG, offsets::interpret_requested()), 1);
            emit_exit_to(&mut em.asm, next, cycles);
        }
        Terminal::ReturnToDispatch => {
            emit_exit_dynamic(&mut em.asm, cycles);
        }
    }
}

/// Emit one block into the buffer. On success the near cursor holds the
/// block body and any cold fixups sit in the far region; all forward
/// references are linked.
pub fn emit_block(
    buf: &mut CodeBuffer,
    block: &Block,
    config: &EmitConfig,
    env: &EnvTable,
    fast_lookup: Option<&dyn Fn(LocationDescriptor) -> Option<*const u8>>,
) -> Result<BlockDescriptor, CodeBufferError> {
    let entry_offset = buf.pos();
    let mut em = Emitter {
        asm: Assembler::new(buf),
        ra: RegAlloc::new(),
        block,
        config,
        env,
        fast_lookup,
    };

    emit_prologue(&mut em.asm);

    // A conditionally-guarded block bails to cond_failed when the
    // predicate does not hold.
    if block.cond != Cond::Al {
        let body = em.asm.buf.new_label();
        emit_cond_jump(&mut em.asm, block.cond, body);
        let failed = block
            .cond_failed
            .expect("conditional block without cond_failed");
        emit_exit_to(&mut em.asm, failed, block.cycle_count);
        em.asm.buf.bind_label(body);
    }

    for r in block.refs() {
        let inst = block.inst(r);
        if inst.is_void() {
            continue;
        }
        match inst.opcode {
            // Secondary results are defined by their producer's template.
            Opcode::GetCarryFromOp | Opcode::GetOverflowFromOp => continue,
            op if emit_vector::is_vector_op(op) => emit_vector::emit(&mut em, r),
            _ => emit_data::emit(&mut em, r),
        }
        em.ra.end_of_alloc_scope();
    }

    em.ra.end_of_alloc_scope();
    em.ra.assert_all_released();
    emit_terminal(&mut em);

    em.asm.buf.link();
    em.asm.buf.take_error()?;
    let size = em.asm.buf.pos() - entry_offset;
    trace!(entry_offset, size, "emitted block");
    Ok(BlockDescriptor { entry_offset, size })
}
