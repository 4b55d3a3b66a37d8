//! IR-to-IR rewrites.
//!
//! Passes walk a block in program order and mutate it only through
//! instruction invalidation and replace-uses-with, so they compose in any
//! order and running one twice changes nothing.

mod constant_memory_reads;
mod dead_code;
mod flag_elimination;

pub use constant_memory_reads::constant_memory_reads;
pub use dead_code::dead_code_elimination;
pub use flag_elimination::flag_set_elimination;
