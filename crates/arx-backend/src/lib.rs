//! x86-64 backend: code buffer, assembler, register allocator, and the
//! per-opcode emission templates.

mod asm;
mod codebuf;
mod emit;
mod emit_data;
mod emit_vector;
mod regalloc;
pub mod softfp;

pub use asm::{Assembler, CmpImm, Gpr, HostCond, Mem, Xmm};
pub use codebuf::{CodeBuffer, CodeBufferError, Label};
pub use emit::{emit_block, BlockDescriptor, EmitConfig, EnvTable};
pub use regalloc::RegAlloc;

/// Host SIMD capabilities, probed by the embedder (the CPUID probe itself
/// is outside this crate) and threaded through emission.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostFeatures {
    pub sse41: bool,
    pub avx: bool,
    pub fma: bool,
}

impl HostFeatures {
    /// Everything this backend can take advantage of.
    pub fn all() -> Self {
        Self {
            sse41: true,
            avx: true,
            fma: true,
        }
    }
}
