//! Block terminals: how a compiled block exits.

use crate::{Cond, LocationDescriptor};

/// The single instruction-like object describing block exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// Continue at a statically known location via the dispatcher.
    LinkBlock { next: LocationDescriptor },
    /// Continue at a statically known location; the emitter may wire a
    /// direct jump when the target is already compiled.
    LinkBlockFast { next: LocationDescriptor },
    /// Two-way conditional exit on the guest flags.
    If {
        cond: Cond,
        then_: LocationDescriptor,
        else_: LocationDescriptor,
    },
    /// Hand one instruction to the interpreter, then re-enter the
    /// dispatcher. Used for encodings the translator does not cover.
    Interpret { next: LocationDescriptor },
    /// The PC was written dynamically; the dispatcher reads it from the
    /// guest state.
    ReturnToDispatch,
}
