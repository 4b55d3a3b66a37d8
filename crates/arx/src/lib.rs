//! ARX - A32/Thumb to x86-64 dynamic binary translator.
//!
//! Guest instructions are decoded, lifted to IR, optimized, and emitted as
//! native x86-64 machine code. The dispatcher loop, executable-page
//! management, and the CPUID probe belong to the embedder; this crate
//! covers the translation-and-emission pipeline.
//!
//! # Example
//!
//! ```ignore
//! use arx::{Jit, JitConfig, LocationDescriptor};
//!
//! let mut jit = Jit::new(JitConfig::default(), Box::new(my_callbacks));
//! let entry = jit.get_or_compile(LocationDescriptor::new(0x1000, true, 0))?;
//! ```

// Re-export from sub-crates
pub use arx_backend::{
    BlockDescriptor, CodeBuffer, CodeBufferError, EmitConfig, EnvTable, HostFeatures,
};
pub use arx_frontend::{translate, TranslationOptions};
pub use arx_ir::{
    Block, Cond, Inst, InstRef, IrBuilder, LocationDescriptor, Opcode, Reg, RoundingMode,
    Terminal, Type, Value,
};
pub use arx_opt::{constant_memory_reads, dead_code_elimination, flag_set_elimination};
pub use arx_state::{BlockCache, CodePtr, CpuState, UserCallbacks};

mod jit;
pub use jit::*;

use thiserror::Error;

/// Translator errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("code buffer: {0}")]
    CodeBuffer(#[from] CodeBufferError),
}

pub type Result<T> = std::result::Result<T, Error>;
