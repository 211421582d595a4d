//! The runtime's error taxonomy.
//!
//! Mirrors the error kinds a caller actually needs to branch on: a memory
//! fault always propagates, a stack fault always propagates with the
//! attempted operation named, a type mismatch names the opcode that saw the
//! wrong cell, and `RefCount` is kept here only so the allocator's defensive
//! logging has a single `Display`-able shape — it is never returned from a
//! public function (the allocator logs it and moves on, per the spec).

use tacit_core::MemoryError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("stack underflow in {op}: sp={sp} requested={requested}")]
    StackUnderflow { op: &'static str, sp: u32, requested: u32 },

    #[error("stack overflow in {op}: sp={sp} capacity={capacity}")]
    StackOverflow { op: &'static str, sp: u32, capacity: u32 },

    #[error("type error in {op}: unexpected tag {tag:?}")]
    TypeError { op: &'static str, tag: Option<u8> },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    /// Logged by the allocator, never raised through the dispatch loop.
    #[error("refcount error: {0}")]
    RefCount(String),
}

/// A [`VmError`] paired with a snapshot of the data stack at the moment the
/// interpreter loop unwound, per §7's "formats a message containing the
/// current stack snapshot". The stacks themselves are left untouched; this
/// is a read-only copy for the host to print or inspect.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error} (stack: {stack:?})")]
pub struct VmFault {
    #[source]
    pub error: VmError,
    pub stack: Vec<tacit_core::Cell>,
}
