//! Intermediate representation for the ARX dynamic binary translator.
//!
//! This crate provides pure IR types with no guest-ISA decoding knowledge.
//! The A32/Thumb instruction lifting lives in `arx-frontend`; the x86-64
//! emission lives in `arx-backend`.

mod block;
mod builder;
mod inst;
mod location;
mod opcode;
mod terminal;
mod types;
mod value;

pub use block::*;
pub use builder::*;
pub use inst::*;
pub use location::*;
pub use opcode::*;
pub use terminal::*;
pub use types::*;
pub use value::*;
