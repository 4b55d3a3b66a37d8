//! Vector floating-point emission.
//!
//! Reconciles guest NEON semantics with SSE/AVX: ARM-ordered NaN
//! propagation (with far-code fixups on the accurate path), default-NaN
//! rewriting, signed-zero-correct min/max, fused multiply-add, and the
//! conversion family.

use arx_ir::{InstRef, Opcode, RoundingMode, Value};
use arx_state::offsets;

use crate::asm::{CmpImm, Gpr, HostCond, Mem, Xmm};
use crate::emit::Emitter;
use crate::regalloc::STATE_REG;
use crate::softfp;

pub(crate) fn is_vector_op(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::FPVectorAbs16
            | Opcode::FPVectorAbs32
            | Opcode::FPVectorAbs64
            | Opcode::FPVectorNeg16
            | Opcode::FPVectorNeg32
            | Opcode::FPVectorNeg64
            | Opcode::FPVectorAdd32
            | Opcode::FPVectorAdd64
            | Opcode::FPVectorSub32
            | Opcode::FPVectorSub64
            | Opcode::FPVectorMul32
            | Opcode::FPVectorMul64
            | Opcode::FPVectorDiv32
            | Opcode::FPVectorDiv64
            | Opcode::FPVectorMin32
            | Opcode::FPVectorMin64
            | Opcode::FPVectorMax32
            | Opcode::FPVectorMax64
            | Opcode::FPVectorMulAdd32
            | Opcode::FPVectorMulAdd64
            | Opcode::FPVectorPairedAdd32
            | Opcode::FPVectorPairedAdd64
            | Opcode::FPVectorPairedAddLower32
            | Opcode::FPVectorPairedAddLower64
            | Opcode::FPVectorEqual32
            | Opcode::FPVectorEqual64
            | Opcode::FPVectorGreater32
            | Opcode::FPVectorGreater64
            | Opcode::FPVectorGreaterEqual32
            | Opcode::FPVectorGreaterEqual64
            | Opcode::FPVectorRecipEstimate32
            | Opcode::FPVectorRecipEstimate64
            | Opcode::FPVectorRecipStepFused32
            | Opcode::FPVectorRecipStepFused64
            | Opcode::FPVectorRSqrtEstimate32
            | Opcode::FPVectorRSqrtEstimate64
            | Opcode::FPVectorRSqrtStepFused32
            | Opcode::FPVectorRSqrtStepFused64
            | Opcode::FPVectorToSignedFixed32
            | Opcode::FPVectorToSignedFixed64
            | Opcode::FPVectorToUnsignedFixed32
            | Opcode::FPVectorToUnsignedFixed64
            | Opcode::FPVectorS32ToSingle
            | Opcode::FPVectorU32ToSingle
            | Opcode::FPVectorS64ToDouble
            | Opcode::FPVectorU64ToDouble
    )
}

pub(crate) fn emit(em: &mut Emitter<'_>, r: InstRef) {
    let opcode = em.block.inst(r).opcode;
    match opcode {
        Opcode::FPVectorAbs16 => emit_mask_op(em, r, MaskOp::And, 0x7FFF_7FFF_7FFF_7FFF),
        Opcode::FPVectorAbs32 => emit_mask_op(em, r, MaskOp::And, 0x7FFF_FFFF_7FFF_FFFF),
        Opcode::FPVectorAbs64 => emit_mask_op(em, r, MaskOp::And, 0x7FFF_FFFF_FFFF_FFFF),
        Opcode::FPVectorNeg16 => emit_mask_op(em, r, MaskOp::Xor, 0x8000_8000_8000_8000),
        Opcode::FPVectorNeg32 => emit_mask_op(em, r, MaskOp::Xor, 0x8000_0000_8000_0000),
        Opcode::FPVectorNeg64 => emit_mask_op(em, r, MaskOp::Xor, 0x8000_0000_0000_0000),
        Opcode::FPVectorAdd32 => emit_arith(em, r, 32, ArithOp::Add),
        Opcode::FPVectorAdd64 => emit_arith(em, r, 64, ArithOp::Add),
        Opcode::FPVectorSub32 => emit_arith(em, r, 32, ArithOp::Sub),
        Opcode::FPVectorSub64 => emit_arith(em, r, 64, ArithOp::Sub),
        Opcode::FPVectorMul32 => emit_arith(em, r, 32, ArithOp::Mul),
        Opcode::FPVectorMul64 => emit_arith(em, r, 64, ArithOp::Mul),
        Opcode::FPVectorDiv32 => emit_arith(em, r, 32, ArithOp::Div),
        Opcode::FPVectorDiv64 => emit_arith(em, r, 64, ArithOp::Div),
        Opcode::FPVectorMin32 => emit_min_max(em, r, 32, false),
        Opcode::FPVectorMin64 => emit_min_max(em, r, 64, false),
        Opcode::FPVectorMax32 => emit_min_max(em, r, 32, true),
        Opcode::FPVectorMax64 => emit_min_max(em, r, 64, true),
        Opcode::FPVectorMulAdd32 => emit_mul_add(em, r, 32),
        Opcode::FPVectorMulAdd64 => emit_mul_add(em, r, 64),
        Opcode::FPVectorPairedAdd32 => emit_paired_add(em, r, 32),
        Opcode::FPVectorPairedAdd64 => emit_paired_add(em, r, 64),
        Opcode::FPVectorPairedAddLower32 => emit_paired_add_lower(em, r, 32),
        Opcode::FPVectorPairedAddLower64 => emit_paired_add_lower(em, r, 64),
        Opcode::FPVectorEqual32 => emit_compare(em, r, 32, CmpKind::Equal),
        Opcode::FPVectorEqual64 => emit_compare(em, r, 64, CmpKind::Equal),
        Opcode::FPVectorGreater32 => emit_compare(em, r, 32, CmpKind::Greater),
        Opcode::FPVectorGreater64 => emit_compare(em, r, 64, CmpKind::Greater),
        Opcode::FPVectorGreaterEqual32 => emit_compare(em, r, 32, CmpKind::GreaterEqual),
        Opcode::FPVectorGreaterEqual64 => emit_compare(em, r, 64, CmpKind::GreaterEqual),
        Opcode::FPVectorRecipEstimate32 => {
            emit_two_op_fallback(em, r, softfp::recip_estimate_kernel_32 as usize)
        }
        Opcode::FPVectorRecipEstimate64 => {
            emit_two_op_fallback(em, r, softfp::recip_estimate_kernel_64 as usize)
        }
        Opcode::FPVectorRSqrtEstimate32 => {
            emit_two_op_fallback(em, r, softfp::rsqrt_estimate_kernel_32 as usize)
        }
        Opcode::FPVectorRSqrtEstimate64 => {
            emit_two_op_fallback(em, r, softfp::rsqrt_estimate_kernel_64 as usize)
        }
        Opcode::FPVectorRecipStepFused32 => {
            emit_three_op_fallback(em, r, softfp::recip_step_kernel_32 as usize)
        }
        Opcode::FPVectorRecipStepFused64 => {
            emit_three_op_fallback(em, r, softfp::recip_step_kernel_64 as usize)
        }
        Opcode::FPVectorRSqrtStepFused32 => {
            emit_three_op_fallback(em, r, softfp::rsqrt_step_kernel_32 as usize)
        }
        Opcode::FPVectorRSqrtStepFused64 => {
            emit_three_op_fallback(em, r, softfp::rsqrt_step_kernel_64 as usize)
        }
        Opcode::FPVectorToSignedFixed32 => emit_to_fixed(em, r, 32, false),
        Opcode::FPVectorToSignedFixed64 => emit_to_fixed(em, r, 64, false),
        Opcode::FPVectorToUnsignedFixed32 => emit_to_fixed(em, r, 32, true),
        Opcode::FPVectorToUnsignedFixed64 => emit_to_fixed(em, r, 64, true),
        Opcode::FPVectorS32ToSingle => emit_s32_to_single(em, r),
        Opcode::FPVectorU32ToSingle => emit_u32_to_single(em, r),
        Opcode::FPVectorS64ToDouble => emit_s64_to_double(em, r),
        Opcode::FPVectorU64ToDouble => emit_u64_to_double(em, r),
        other => panic!("not a vector opcode: {other:?}"),
    }
}

// ---- Simple bitwise forms ----

#[derive(Clone, Copy)]
enum MaskOp {
    And,
    Xor,
}

fn emit_mask_op(em: &mut Emitter<'_>, r: InstRef, op: MaskOp, pattern: u64) {
    let a = em.block.inst(r).arg(0);
    let x = em.ra.use_scratch_xmm(&mut em.asm, a);
    let cst = em.asm.buf.const128(pattern, pattern);
    match op {
        MaskOp::And => em.asm.pand_m(x, Mem::RipConst(cst)),
        MaskOp::Xor => em.asm.pxor_m(x, Mem::RipConst(cst)),
    }
    em.ra.define_xmm(em.block, r, x);
}

// ---- The three-operand skeleton ----

fn default_nan_pattern(fsize: u32) -> u64 {
    if fsize == 32 {
        0x7FC0_0000_7FC0_0000
    } else {
        softfp::DEFAULT_NAN_64
    }
}

/// Default-NaN post-process: keep the clean lanes of `x`, replace every
/// NaN lane with the canonical pattern.
fn emit_dn_postprocess(em: &mut Emitter<'_>, fsize: u32, x: Xmm) {
    let nan_mask = em.ra.scratch_xmm(&mut em.asm);
    let tmp = em.ra.scratch_xmm(&mut em.asm);
    em.asm.pcmpeqw(tmp, tmp);
    em.asm.movaps_rr(nan_mask, x);
    em.asm.cmpp(fsize, nan_mask, nan_mask, CmpImm::Ord);
    em.asm.andps(x, nan_mask);
    em.asm.xorps(nan_mask, tmp);
    let pattern = default_nan_pattern(fsize);
    let cst = em.asm.buf.const128(pattern, pattern);
    em.asm.andps_m(nan_mask, Mem::RipConst(cst));
    em.asm.orps(x, nan_mask);
}

/// Branch to a far-code fixup when any lane of `nan_mask` is set. The
/// fixup spills `xmms` (result first) to the stack, calls `handler` on the
/// array, and reloads the patched result.
fn emit_handle_nans(em: &mut Emitter<'_>, xmms: &[Xmm], nan_mask: Xmm, handler: usize) {
    const CALLER_SAVED: [Gpr; 9] = [
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
    let result = xmms[0];

    if em.config.features.sse41 {
        em.asm.ptest(nan_mask, nan_mask);
    } else {
        let bits = em.ra.scratch_gpr(&mut em.asm);
        em.asm.movmskps(bits, nan_mask);
        em.asm.test_rr32(bits, bits);
    }

    let nan = em.asm.buf.new_label();
    let end = em.asm.buf.new_label();
    em.asm.jcc_label(HostCond::Ne, nan);
    em.asm.buf.bind_label(end);

    em.asm.buf.switch_to_far();
    em.asm.buf.bind_label(nan);

    // Keep the host call from trampling anything live: all caller-save
    // GPRs, and every XMM except the result (it is reloaded from the
    // array the handler rewrites).
    em.asm.sub_ri64(Gpr::Rsp, 8);
    for g in CALLER_SAVED {
        em.asm.push_r64(g);
    }
    em.asm.sub_ri64(Gpr::Rsp, 15 * 16);
    let mut slot = 0;
    for i in 0..16u8 {
        if Xmm(i) != result {
            em.asm
                .movaps_mr(Mem::Base(Gpr::Rsp, slot * 16), Xmm(i));
            slot += 1;
        }
    }

    let array_bytes = (xmms.len() * 16) as i32;
    em.asm.sub_ri64(Gpr::Rsp, array_bytes);
    for (i, &x) in xmms.iter().enumerate() {
        em.asm.movaps_mr(Mem::Base(Gpr::Rsp, (i * 16) as i32), x);
    }
    em.asm.lea_r64(Gpr::Rdi, Mem::Base(Gpr::Rsp, 0));
    em.asm.mov_ri64(Gpr::R11, handler as u64);
    em.asm.call_r64(Gpr::R11);
    em.asm.movaps_rm(result, Mem::Base(Gpr::Rsp, 0));
    em.asm.add_ri64(Gpr::Rsp, array_bytes);

    let mut slot = 0;
    for i in 0..16u8 {
        if Xmm(i) != result {
            em.asm
                .movaps_rm(Xmm(i), Mem::Base(Gpr::Rsp, slot * 16));
            slot += 1;
        }
    }
    em.asm.add_ri64(Gpr::Rsp, 15 * 16);
    for g in CALLER_SAVED.iter().rev() {
        em.asm.pop_r64(*g);
    }
    em.asm.add_ri64(Gpr::Rsp, 8);
    em.asm.jmp_label(end);
    em.asm.buf.switch_to_near();
}

/// Two-source vector op with the three-path NaN dispatch.
fn emit_three_op(
    em: &mut Emitter<'_>,
    r: InstRef,
    fsize: u32,
    apply: &mut dyn FnMut(&mut Emitter<'_>, Xmm, Xmm),
    nan_handler: usize,
) {
    let inst = em.block.inst(r);
    let (a, b) = (inst.arg(0), inst.arg(1));

    if !em.accurate_nan() || em.fpscr_dn() {
        let xa = em.ra.use_scratch_xmm(&mut em.asm, a);
        let xb = em.ra.use_xmm(&mut em.asm, b);
        apply(em, xa, xb);
        if em.fpscr_dn() {
            emit_dn_postprocess(em, fsize, xa);
        }
        em.ra.define_xmm(em.block, r, xa);
        return;
    }

    let result = em.ra.scratch_xmm(&mut em.asm);
    let xa = em.ra.use_xmm(&mut em.asm, a);
    let xb = em.ra.use_xmm(&mut em.asm, b);
    let nan_mask = em.ra.scratch_xmm(&mut em.asm);

    em.asm.movaps_rr(nan_mask, xb);
    em.asm.movaps_rr(result, xa);
    em.asm.cmpp(fsize, nan_mask, xa, CmpImm::Unord);
    apply(em, result, xb);
    em.asm.cmpp(fsize, nan_mask, result, CmpImm::Unord);

    emit_handle_nans(em, &[result, xa, xb], nan_mask, nan_handler);
    em.ra.define_xmm(em.block, r, result);
}

fn nan_handler_2(fsize: u32) -> usize {
    if fsize == 32 {
        softfp::nan_handler_32_2 as usize
    } else {
        softfp::nan_handler_64_2 as usize
    }
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

fn emit_arith(em: &mut Emitter<'_>, r: InstRef, fsize: u32, op: ArithOp) {
    emit_three_op(
        em,
        r,
        fsize,
        &mut |em: &mut Emitter<'_>, dst, src| match op {
            ArithOp::Add => em.asm.addp(fsize, dst, src),
            ArithOp::Sub => em.asm.subp(fsize, dst, src),
            ArithOp::Mul => em.asm.mulp(fsize, dst, src),
            ArithOp::Div => em.asm.divp(fsize, dst, src),
        },
        nan_handler_2(fsize),
    );
}

/// ARM orders signed zeros in min/max where the host treats them equal and
/// picks the second operand. Lanes the host saw as equal get the AND of
/// the inputs for max (+0 beats -0) and the OR for min (-0 beats +0).
fn emit_min_max(em: &mut Emitter<'_>, r: InstRef, fsize: u32, is_max: bool) {
    emit_three_op(
        em,
        r,
        fsize,
        &mut |em: &mut Emitter<'_>, dst, src| {
            let mask = em.ra.scratch_xmm(&mut em.asm);
            let blended = em.ra.scratch_xmm(&mut em.asm);
            em.asm.movaps_rr(mask, dst);
            em.asm.movaps_rr(blended, dst);
            em.asm.cmpp(fsize, mask, src, CmpImm::Neq);
            if is_max {
                em.asm.andps(blended, src);
                em.asm.maxp(fsize, dst, src);
            } else {
                em.asm.orps(blended, src);
                em.asm.minp(fsize, dst, src);
            }
            em.asm.andps(dst, mask);
            em.asm.andnps(mask, blended);
            em.asm.orps(dst, mask);
        },
        nan_handler_2(fsize),
    );
}

fn emit_paired_add(em: &mut Emitter<'_>, r: InstRef, fsize: u32) {
    let handler = if fsize == 32 {
        softfp::nan_handler_paired_32 as usize
    } else {
        softfp::nan_handler_paired_64 as usize
    };
    emit_three_op(
        em,
        r,
        fsize,
        &mut |em: &mut Emitter<'_>, dst, src| em.asm.haddp(fsize, dst, src),
        handler,
    );
}

fn emit_paired_add_lower(em: &mut Emitter<'_>, r: InstRef, fsize: u32) {
    let handler = if fsize == 32 {
        softfp::nan_handler_paired_lower_32 as usize
    } else {
        softfp::nan_handler_paired_lower_64 as usize
    };
    emit_three_op(
        em,
        r,
        fsize,
        &mut |em: &mut Emitter<'_>, dst, src| {
            let zero = em.ra.scratch_xmm(&mut em.asm);
            em.asm.xorps(zero, zero);
            em.asm.punpcklqdq(dst, src);
            em.asm.haddp(fsize, dst, zero);
        },
        handler,
    );
}

fn emit_mul_add(em: &mut Emitter<'_>, r: InstRef, fsize: u32) {
    if em.config.features.fma {
        emit_four_op_fma(em, r, fsize);
        return;
    }
    // No host FMA: marshal through the software kernel.
    let kernel = if fsize == 32 {
        softfp::mul_add_kernel_32 as usize
    } else {
        softfp::mul_add_kernel_64 as usize
    };
    emit_fallback(em, r, 3, FallbackArgs::Fpcr, kernel);
}

/// dst = addend + a*b via vfmadd231, with the four-operand NaN dispatch.
fn emit_four_op_fma(em: &mut Emitter<'_>, r: InstRef, fsize: u32) {
    let inst = em.block.inst(r);
    let (addend, a, b) = (inst.arg(0), inst.arg(1), inst.arg(2));
    let handler = if fsize == 32 {
        softfp::nan_handler_fma_32 as usize
    } else {
        softfp::nan_handler_fma_64 as usize
    };

    if !em.accurate_nan() || em.fpscr_dn() {
        let xd = em.ra.use_scratch_xmm(&mut em.asm, addend);
        let xa = em.ra.use_xmm(&mut em.asm, a);
        let xb = em.ra.use_xmm(&mut em.asm, b);
        em.asm.vfmadd231p(fsize, xd, xa, xb);
        if em.fpscr_dn() {
            emit_dn_postprocess(em, fsize, xd);
        }
        em.ra.define_xmm(em.block, r, xd);
        return;
    }

    let result = em.ra.scratch_xmm(&mut em.asm);
    let xd = em.ra.use_xmm(&mut em.asm, addend);
    let xa = em.ra.use_xmm(&mut em.asm, a);
    let xb = em.ra.use_xmm(&mut em.asm, b);
    let nan_mask = em.ra.scratch_xmm(&mut em.asm);

    em.asm.movaps_rr(nan_mask, xa);
    em.asm.movaps_rr(result, xd);
    em.asm.cmpp(fsize, nan_mask, xd, CmpImm::Unord);
    em.asm.cmpp(fsize, nan_mask, xb, CmpImm::Unord);
    em.asm.vfmadd231p(fsize, result, xa, xb);
    em.asm.cmpp(fsize, nan_mask, result, CmpImm::Unord);

    emit_handle_nans(em, &[result, xd, xa, xb], nan_mask, handler);
    em.ra.define_xmm(em.block, r, result);
}

#[derive(Clone, Copy)]
enum CmpKind {
    Equal,
    Greater,
    GreaterEqual,
}

fn emit_compare(em: &mut Emitter<'_>, r: InstRef, fsize: u32, kind: CmpKind) {
    let inst = em.block.inst(r);
    let (a, b) = (inst.arg(0), inst.arg(1));
    match kind {
        CmpKind::Equal => {
            let xa = em.ra.use_scratch_xmm(&mut em.asm, a);
            let xb = em.ra.use_xmm(&mut em.asm, b);
            em.asm.cmpp(fsize, xa, xb, CmpImm::Eq);
            em.ra.define_xmm(em.block, r, xa);
        }
        // a > b and a >= b flip into lt/le with swapped operands.
        CmpKind::Greater => {
            let xa = em.ra.use_xmm(&mut em.asm, a);
            let xb = em.ra.use_scratch_xmm(&mut em.asm, b);
            em.asm.cmpp(fsize, xb, xa, CmpImm::Lt);
            em.ra.define_xmm(em.block, r, xb);
        }
        CmpKind::GreaterEqual => {
            let xa = em.ra.use_xmm(&mut em.asm, a);
            let xb = em.ra.use_scratch_xmm(&mut em.asm, b);
            em.asm.cmpp(fsize, xb, xa, CmpImm::Le);
            em.ra.define_xmm(em.block, r, xb);
        }
    }
}

// ---- Fallback calls ----

enum FallbackArgs {
    /// (result, operands..., fpcr, fpsr*)
    Fpcr,
    /// (result, operand, fbits, signedness|rounding, fpsr*)
    FbitsPacked { fbits: u32, packed: u32 },
}

/// Marshal `nargs` vector operands to the stack and call a software
/// kernel on them.
fn emit_fallback(em: &mut Emitter<'_>, r: InstRef, nargs: usize, extra: FallbackArgs, kernel: usize) {
    let inst = em.block.inst(r);
    let args: Vec<Value> = (0..nargs).map(|i| inst.arg(i)).collect();

    let xs: Vec<Xmm> = args
        .iter()
        .map(|&v| em.ra.use_xmm(&mut em.asm, v))
        .collect();

    let space = ((nargs + 1) * 16) as i32;
    em.asm.sub_ri64(Gpr::Rsp, space);
    for (i, &x) in xs.iter().enumerate() {
        em.asm
            .movaps_mr(Mem::Base(Gpr::Rsp, ((i + 1) * 16) as i32), x);
    }

    em.ra.end_of_alloc_scope();
    em.ra.host_call_spill(&mut em.asm);

    em.asm.lea_r64(Gpr::Rdi, Mem::Base(Gpr::Rsp, 0));
    em.asm.lea_r64(Gpr::Rsi, Mem::Base(Gpr::Rsp, 16));
    let fpsr = Mem::Base(STATE_REG, offsets::fpsr_exc());
    match (nargs, extra) {
        (1, FallbackArgs::Fpcr) => {
            em.asm.mov_ri32(Gpr::Rdx, em.fpcr());
            em.asm.lea_r64(Gpr::Rcx, fpsr);
        }
        (1, FallbackArgs::FbitsPacked { fbits, packed }) => {
            em.asm.mov_ri32(Gpr::Rdx, fbits);
            em.asm.mov_ri32(Gpr::Rcx, packed);
            em.asm.lea_r64(Gpr::R8, fpsr);
        }
        (2, FallbackArgs::Fpcr) => {
            em.asm.lea_r64(Gpr::Rdx, Mem::Base(Gpr::Rsp, 32));
            em.asm.mov_ri32(Gpr::Rcx, em.fpcr());
            em.asm.lea_r64(Gpr::R8, fpsr);
        }
        (3, FallbackArgs::Fpcr) => {
            em.asm.lea_r64(Gpr::Rdx, Mem::Base(Gpr::Rsp, 32));
            em.asm.lea_r64(Gpr::Rcx, Mem::Base(Gpr::Rsp, 48));
            em.asm.mov_ri32(Gpr::R8, em.fpcr());
            em.asm.lea_r64(Gpr::R9, fpsr);
        }
        _ => unreachable!("unsupported fallback shape"),
    }
    em.asm.mov_ri64(Gpr::R11, kernel as u64);
    em.asm.call_r64(Gpr::R11);

    let out = em.ra.scratch_xmm(&mut em.asm);
    em.asm.movaps_rm(out, Mem::Base(Gpr::Rsp, 0));
    em.asm.add_ri64(Gpr::Rsp, space);
    em.ra.define_xmm(em.block, r, out);
}

fn emit_two_op_fallback(em: &mut Emitter<'_>, r: InstRef, kernel: usize) {
    emit_fallback(em, r, 1, FallbackArgs::Fpcr, kernel);
}

fn emit_three_op_fallback(em: &mut Emitter<'_>, r: InstRef, kernel: usize) {
    emit_fallback(em, r, 2, FallbackArgs::Fpcr, kernel);
}

// ---- Conversions ----

fn round_imm(rounding: RoundingMode) -> Option<u8> {
    match rounding {
        RoundingMode::ToNearest => Some(0b00),
        RoundingMode::TowardsMinusInfinity => Some(0b01),
        RoundingMode::TowardsPlusInfinity => Some(0b10),
        RoundingMode::TowardsZero => Some(0b11),
        RoundingMode::ToNearestTieAwayFromZero => None,
    }
}

/// FP to fixed point. The signed single-precision form has an inline SSE4.1
/// path that rounds, saturates out-of-range lanes to the encoded limits,
/// and zeroes NaN lanes; every other shape selects a software kernel by
/// (fbits, rounding).
fn emit_to_fixed(em: &mut Emitter<'_>, r: InstRef, fsize: u32, unsigned: bool) {
    let inst = em.block.inst(r);
    let fbits = u32::from(inst.arg(1).as_u8());
    let rounding = softfp::decode_rounding(u32::from(inst.arg(2).as_u8()));

    let fast = em.config.features.sse41
        && fsize == 32
        && !unsigned
        && round_imm(rounding).is_some();
    if !fast {
        let kernel = if fsize == 32 {
            softfp::to_fixed_kernel_32 as usize
        } else {
            softfp::to_fixed_kernel_64 as usize
        };
        let packed = u32::from(unsigned) << 8 | inst.arg(2).as_u8() as u32;
        emit_fallback(em, r, 1, FallbackArgs::FbitsPacked { fbits, packed }, kernel);
        return;
    }

    let src = em.ra.use_scratch_xmm(&mut em.asm, inst.arg(0));
    if fbits != 0 {
        // 2^fbits as a float, broadcast.
        let scale = (fbits + 127) << 23;
        let pattern = u64::from(scale) | u64::from(scale) << 32;
        let cst = em.asm.buf.const128(pattern, pattern);
        em.asm.mulp_m(32, src, Mem::RipConst(cst));
    }
    em.asm.roundp(32, src, src, round_imm(rounding).unwrap());

    let nan_mask = em.ra.scratch_xmm(&mut em.asm);
    let too_high = em.ra.scratch_xmm(&mut em.asm);
    let saturated = em.ra.scratch_xmm(&mut em.asm);

    em.asm.movaps_rr(nan_mask, src);
    em.asm.cmpp(32, nan_mask, src, CmpImm::Unord);

    // Lanes at or above 2^31 cannot convert; saturate them by hand. The
    // low side is free: cvttps2dq already returns INT_MIN there.
    let upper = 0x4F00_0000u64 | 0x4F00_0000u64 << 32;
    let upper_cst = em.asm.buf.const128(upper, upper);
    em.asm.movaps_rr(too_high, src);
    em.asm.cmpp_m(32, too_high, Mem::RipConst(upper_cst), CmpImm::Nlt);

    em.asm.cvttp_dq(32, src, src);

    let max = 0x7FFF_FFFFu64 | 0x7FFF_FFFFu64 << 32;
    let max_cst = em.asm.buf.const128(max, max);
    em.asm.movaps_rr(saturated, too_high);
    em.asm.andps_m(saturated, Mem::RipConst(max_cst));
    em.asm.andnps(too_high, src);
    em.asm.orps(too_high, saturated);

    // NaN lanes convert to zero.
    em.asm.andnps(nan_mask, too_high);
    em.ra.define_xmm(em.block, r, nan_mask);
}

fn emit_s32_to_single(em: &mut Emitter<'_>, r: InstRef) {
    let a = em.block.inst(r).arg(0);
    let x = em.ra.use_scratch_xmm(&mut em.asm, a);
    em.asm.cvtdq2ps(x, x);
    em.ra.define_xmm(em.block, r, x);
}

/// Unsigned 32-bit lanes to single precision: split each lane into 16-bit
/// halves, bias each half into a float mantissa, and add the halves back
/// together. Bit-identical to a round-to-nearest software conversion; in
/// round-towards-minus-infinity the result sign bit is cleared, since an
/// unsigned input can never produce a negative value.
fn emit_u32_to_single(em: &mut Emitter<'_>, r: InstRef) {
    let a = em.block.inst(r).arg(0);
    let x = em.ra.use_scratch_xmm(&mut em.asm, a);
    let tmp = em.ra.scratch_xmm(&mut em.asm);

    let mask_ffff = em.asm.buf.const128(0x0000_FFFF_0000_FFFF, 0x0000_FFFF_0000_FFFF);
    let low_bias = em.asm.buf.const128(0x4B00_0000_4B00_0000, 0x4B00_0000_4B00_0000);
    let high_bias = em.asm.buf.const128(0x5300_0000_5300_0000, 0x5300_0000_5300_0000);
    let rebias = em.asm.buf.const128(0xD300_0080_D300_0080, 0xD300_0080_D300_0080);

    em.asm.movaps_rm(tmp, Mem::RipConst(mask_ffff));
    em.asm.pand(tmp, x);
    em.asm.por_m(tmp, Mem::RipConst(low_bias));
    em.asm.psrld(x, 16);
    em.asm.por_m(x, Mem::RipConst(high_bias));
    em.asm.addp_m(32, x, Mem::RipConst(rebias));
    em.asm.addp(32, x, tmp);

    if em.block.location.rounding_mode() == RoundingMode::TowardsMinusInfinity {
        let sign_clear = em.asm.buf.const128(0x7FFF_FFFF_7FFF_FFFF, 0x7FFF_FFFF_7FFF_FFFF);
        em.asm.pand_m(x, Mem::RipConst(sign_clear));
    }
    em.ra.define_xmm(em.block, r, x);
}

fn emit_s64_to_double(em: &mut Emitter<'_>, r: InstRef) {
    let a = em.block.inst(r).arg(0);
    let x = em.ra.use_scratch_xmm(&mut em.asm, a);
    let high = em.ra.scratch_xmm(&mut em.asm);
    let low_conv = em.ra.scratch_xmm(&mut em.asm);
    let tmp = em.ra.scratch_gpr(&mut em.asm);

    em.asm.movhlps(high, x);
    em.asm.movq_rx(tmp, x);
    em.asm.cvtsi2sd_r64(x, tmp);
    em.asm.movq_rx(tmp, high);
    em.asm.cvtsi2sd_r64(low_conv, tmp);
    em.asm.unpcklpd(x, low_conv);
    em.ra.define_xmm(em.block, r, x);
}

/// Unsigned 64-bit lanes to double precision via the 2^52/2^84 unpack
/// trick: interleave each lane's halves with magic exponents, subtract the
/// bias, and sum the partial doubles.
fn emit_u64_to_double(em: &mut Emitter<'_>, r: InstRef) {
    let a = em.block.inst(r).arg(0);
    let x = em.ra.use_scratch_xmm(&mut em.asm, a);
    let unpack_reg = em.ra.scratch_xmm(&mut em.asm);
    let subtrahend_reg = em.ra.scratch_xmm(&mut em.asm);
    let tmp1 = em.ra.scratch_xmm(&mut em.asm);
    let tmp2 = em.ra.scratch_xmm(&mut em.asm);

    let unpack = em.asm.buf.const128(0x4530_0000_4330_0000, 0);
    let subtrahend = em
        .asm
        .buf
        .const128(0x4330_0000_0000_0000, 0x4530_0000_0000_0000);

    em.asm.movaps_rm(unpack_reg, Mem::RipConst(unpack));
    em.asm.movaps_rm(subtrahend_reg, Mem::RipConst(subtrahend));

    em.asm.pshufd(tmp1, x, 0b0100_1110);

    em.asm.punpckldq(x, unpack_reg);
    em.asm.subp(64, x, subtrahend_reg);
    em.asm.pshufd(tmp2, x, 0b0100_1110);
    em.asm.addp(64, x, tmp2);

    em.asm.punpckldq(tmp1, unpack_reg);
    em.asm.subp(64, tmp1, subtrahend_reg);

    em.asm.pshufd(unpack_reg, tmp1, 0b0100_1110);
    em.asm.addp(64, unpack_reg, tmp1);

    em.asm.unpcklpd(x, unpack_reg);

    if em.block.location.rounding_mode() == RoundingMode::TowardsMinusInfinity {
        let sign_clear = em
            .asm
            .buf
            .const128(0x7FFF_FFFF_FFFF_FFFF, 0x7FFF_FFFF_FFFF_FFFF);
        em.asm.pand_m(x, Mem::RipConst(sign_clear));
    }
    em.ra.define_xmm(em.block, r, x);
}

#[cfg(test)]
mod tests {
    use super::*;
    use arx_ir::{Block, IrBuilder, LocationDescriptor, Terminal};
    use crate::codebuf::CodeBuffer;
    use crate::emit::{emit_block, EmitConfig, EnvTable};
    use crate::HostFeatures;
    use std::ffi::c_void;

    fn null_env() -> EnvTable {
        extern "sysv64" fn r32(_: *mut c_void, _: u32) -> u32 {
            0
        }
        extern "sysv64" fn r64(_: *mut c_void, _: u32) -> u64 {
            0
        }
        extern "sysv64" fn w32(_: *mut c_void, _: u32, _: u32) {}
        extern "sysv64" fn w64(_: *mut c_void, _: u32, _: u64) {}
        extern "sysv64" fn svc(_: *mut c_void, _: u32) {}
        EnvTable {
            ctx: std::ptr::null_mut(),
            read8: r32,
            read16: r32,
            read32: r32,
            read64: r64,
            write8: w32,
            write16: w32,
            write32: w32,
            write64: w64,
            svc,
        }
    }

    fn emit_vector_block(fpscr: u32, accurate_nan: bool, build: impl FnOnce(&mut IrBuilder<'_>)) -> usize {
        let mut block = Block::new(LocationDescriptor::new(0x1000, true, fpscr));
        {
            let mut ir = IrBuilder::new(&mut block);
            build(&mut ir);
            ir.set_terminal(Terminal::ReturnToDispatch);
        }
        let mut buf = CodeBuffer::new(1 << 20);
        let env = null_env();
        let config = EmitConfig {
            features: HostFeatures::all(),
            accurate_nan,
        };
        let desc = emit_block(&mut buf, &block, &config, &env, None).unwrap();
        desc.size
    }

    #[test]
    fn test_vector_add_emits_on_all_paths() {
        for &(fpscr, accurate) in &[(0u32, false), (0, true), (1 << 25, true)] {
            let size = emit_vector_block(fpscr, accurate, |ir| {
                let a = ir.get_vector(0);
                let b = ir.get_vector(1);
                let sum = ir.fp_vector_add(32, a, b);
                ir.set_vector(2, sum);
            });
            assert!(size > 0);
        }
    }

    #[test]
    fn test_accurate_path_is_larger_than_fast_path() {
        let build = |ir: &mut IrBuilder<'_>| {
            let a = ir.get_vector(0);
            let b = ir.get_vector(1);
            let sum = ir.fp_vector_add(32, a, b);
            ir.set_vector(2, sum);
        };
        let fast = emit_vector_block(0, false, build);
        let accurate = emit_vector_block(0, true, build);
        // The accurate path carries the NaN test and the far-code fixup.
        assert!(accurate > fast);
    }

    #[test]
    fn test_min_max_and_muladd_emit() {
        let size = emit_vector_block(0, true, |ir| {
            let a = ir.get_vector(0);
            let b = ir.get_vector(1);
            let mx = ir.fp_vector_max(32, a, b);
            let mn = ir.fp_vector_min(64, mx, b);
            let fma = ir.fp_vector_mul_add(32, mn, a, b);
            ir.set_vector(2, fma);
        });
        assert!(size > 0);
    }

    #[test]
    fn test_conversions_emit() {
        let size = emit_vector_block(0, true, |ir| {
            let a = ir.get_vector(0);
            let s = ir.fp_vector_u32_to_single(a);
            let f = ir.fp_vector_to_signed_fixed(32, s, 4, 0);
            let g = ir.fp_vector_to_unsigned_fixed(64, f, 0, 2);
            ir.set_vector(1, g);
        });
        assert!(size > 0);
    }

    #[test]
    fn test_u32_to_single_masks_sign_under_round_to_minus_infinity() {
        let build = |ir: &mut IrBuilder<'_>| {
            let a = ir.get_vector(0);
            let s = ir.fp_vector_u32_to_single(a);
            ir.set_vector(1, s);
        };
        let rn = emit_vector_block(0, false, build);
        let rm = emit_vector_block(2 << 22, false, build);
        // The RM-mode block carries the extra sign-clearing mask.
        assert!(rm > rn);
    }

    #[test]
    fn test_wide_conversions_emit() {
        let size = emit_vector_block(0, false, |ir| {
            let a = ir.get_vector(0);
            let s = ir.fp_vector_s32_to_single(a);
            let d = ir.fp_vector_s64_to_double(s);
            let u = ir.fp_vector_u64_to_double(d);
            let p = ir.fp_vector_paired_add(32, u, s);
            let q = ir.fp_vector_paired_add_lower(64, p, u);
            let e = ir.fp_vector_equal(32, q, p);
            let g = ir.fp_vector_greater(64, e, q);
            let ge = ir.fp_vector_greater_equal(32, g, e);
            let ab = ir.fp_vector_abs(16, ge);
            let ng = ir.fp_vector_neg(64, ab);
            ir.set_vector(2, ng);
        });
        assert!(size > 0);
    }

    #[test]
    fn test_estimates_emit_as_fallback_calls(){
        let size = emit_vector_block(0, true, |ir| {
            let a = ir.get_vector(0);
            let e = ir.fp_vector_recip_estimate(32, a);
            let s = ir.fp_vector_recip_step_fused(32, e, a);
            let q = ir.fp_vector_rsqrt_estimate(64, s);
            let t = ir.fp_vector_rsqrt_step_fused(64, q, s);
            ir.set_vector(3, t);
        });
        assert!(size > 0);
    }
}
