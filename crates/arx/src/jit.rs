//! The compilation pipeline: cache lookup, translate, optimize, emit.

use std::ffi::c_void;

use arx_backend::{emit_block, CodeBuffer, EmitConfig, EnvTable, HostFeatures};
use arx_frontend::{translate, TranslationOptions};
use arx_ir::LocationDescriptor;
use arx_state::{BlockCache, CodePtr, UserCallbacks};
use rustc_hash::FxHashMap;
use tracing::{debug, trace_span};

use crate::Result;

/// Refuse to start a compilation with less than this much room; the
/// dispatcher is expected to clear the cache and retry.
const MIN_SPACE_REMAINING: usize = 64 * 1024;

/// Pipeline configuration.
#[derive(Clone, Copy, Debug)]
pub struct JitConfig {
    /// Host SIMD capabilities, as probed by the embedder.
    pub features: HostFeatures,
    /// ARM-faithful NaN propagation on vector ops.
    pub accurate_nan: bool,
    /// Fold reads of read-only memory at compile time.
    pub opt_constant_memory_reads: bool,
    /// Drop redundant flag writes.
    pub opt_flag_elimination: bool,
    /// Drop unused pure computations.
    pub opt_dead_code: bool,
    /// Capacity of the executable region, in bytes.
    pub code_buffer_capacity: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            features: HostFeatures::default(),
            accurate_nan: false,
            opt_constant_memory_reads: true,
            opt_flag_elimination: true,
            opt_dead_code: true,
            code_buffer_capacity: 16 * 1024 * 1024,
        }
    }
}

/// Stable-address cell the emitted call thunks point at.
struct CallbackCell {
    cb: Box<dyn UserCallbacks>,
}

extern "sysv64" fn thunk_read8(ctx: *mut c_void, vaddr: u32) -> u32 {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    u32::from(cell.cb.memory_read_8(vaddr))
}

extern "sysv64" fn thunk_read16(ctx: *mut c_void, vaddr: u32) -> u32 {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    u32::from(cell.cb.memory_read_16(vaddr))
}

extern "sysv64" fn thunk_read32(ctx: *mut c_void, vaddr: u32) -> u32 {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.memory_read_32(vaddr)
}

extern "sysv64" fn thunk_read64(ctx: *mut c_void, vaddr: u32) -> u64 {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.memory_read_64(vaddr)
}

extern "sysv64" fn thunk_write8(ctx: *mut c_void, vaddr: u32, value: u32) {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.memory_write_8(vaddr, value as u8);
}

extern "sysv64" fn thunk_write16(ctx: *mut c_void, vaddr: u32, value: u32) {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.memory_write_16(vaddr, value as u16);
}

extern "sysv64" fn thunk_write32(ctx: *mut c_void, vaddr: u32, value: u32) {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.memory_write_32(vaddr, value);
}

extern "sysv64" fn thunk_write64(ctx: *mut c_void, vaddr: u32, value: u64) {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.memory_write_64(vaddr, value);
}

extern "sysv64" fn thunk_svc(ctx: *mut c_void, swi: u32) {
    let cell = unsafe { &mut *(ctx as *mut CallbackCell) };
    cell.cb.call_svc(swi);
}

/// The translator: owns a code buffer, the block cache, and the user
/// callbacks the emitted code calls back into.
pub struct Jit {
    config: JitConfig,
    buffer: CodeBuffer,
    cache: BlockCache,
    callbacks: Box<CallbackCell>,
    /// Descriptor to (offset, size) of compiled blocks, for introspection.
    block_info: FxHashMap<u64, (usize, usize)>,
}

impl Jit {
    pub fn new(config: JitConfig, callbacks: Box<dyn UserCallbacks>) -> Self {
        Self {
            config,
            buffer: CodeBuffer::new(config.code_buffer_capacity),
            cache: BlockCache::new(),
            callbacks: Box::new(CallbackCell { cb: callbacks }),
            block_info: FxHashMap::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn callbacks_mut(&mut self) -> &mut dyn UserCallbacks {
        &mut *self.callbacks.cb
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    fn env_table(&mut self) -> EnvTable {
        EnvTable {
            ctx: (&mut *self.callbacks as *mut CallbackCell).cast(),
            read8: thunk_read8,
            read16: thunk_read16,
            read32: thunk_read32,
            read64: thunk_read64,
            write8: thunk_write8,
            write16: thunk_write16,
            write32: thunk_write32,
            write64: thunk_write64,
            svc: thunk_svc,
        }
    }

    /// Compiled entry point for `descriptor`, compiling on miss.
    ///
    /// On `Error::CodeBuffer` the embedder should `clear_cache` and retry.
    pub fn get_or_compile(&mut self, descriptor: LocationDescriptor) -> Result<CodePtr> {
        if let Some(ptr) = self.cache.lookup(descriptor) {
            return Ok(ptr);
        }
        self.compile(descriptor)
    }

    fn compile(&mut self, descriptor: LocationDescriptor) -> Result<CodePtr> {
        let span = trace_span!("compile", location = ?descriptor);
        let _enter = span.enter();

        if self.buffer.space_remaining() < MIN_SPACE_REMAINING {
            return Err(arx_backend::CodeBufferError::Full {
                capacity: self.buffer.capacity(),
            }
            .into());
        }

        // Translate.
        let cb = &mut self.callbacks.cb;
        let mut read_code = |vaddr: u32| cb.memory_read_32(vaddr);
        let mut block = translate(descriptor, &mut read_code, TranslationOptions::default());

        // Optimize.
        if self.config.opt_flag_elimination {
            arx_opt::flag_set_elimination(&mut block);
        }
        if self.config.opt_constant_memory_reads {
            arx_opt::constant_memory_reads(&mut block, &mut *self.callbacks.cb);
        }
        if self.config.opt_dead_code {
            arx_opt::dead_code_elimination(&mut block);
        }

        // Emit.
        let emit_config = EmitConfig {
            features: self.config.features,
            accurate_nan: self.config.accurate_nan,
        };
        let env = self.env_table();
        let cache = &self.cache;
        let lookup = move |loc: LocationDescriptor| cache.lookup(loc).map(|p| p.0);
        let desc = emit_block(&mut self.buffer, &block, &emit_config, &env, Some(&lookup))?;

        let ptr = CodePtr(unsafe { self.buffer.base_ptr().add(desc.entry_offset) });
        self.cache.insert(descriptor, ptr);
        self.block_info
            .insert(descriptor.to_u64(), (desc.entry_offset, desc.size));
        debug!(
            entry = desc.entry_offset,
            size = desc.size,
            "compiled block"
        );
        Ok(ptr)
    }

    /// Bytes of a previously compiled block.
    pub fn compiled_code(&self, descriptor: LocationDescriptor) -> Option<&[u8]> {
        let &(offset, size) = self.block_info.get(&descriptor.to_u64())?;
        Some(self.buffer.bytes_at(offset, size))
    }

    /// Drop every compiled block and start over with an empty buffer.
    /// Pointers previously handed out become invalid.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.block_info.clear();
        self.buffer = CodeBuffer::new(self.config.code_buffer_capacity);
    }
}
