//! Block heap, persistent data structures, and bytecode interpreter for the
//! Tacit VM.
//!
//! [`tacit_core`] defines the memory and value representation this crate
//! builds on; this crate is where that representation becomes a running
//! machine: a reference-counted block heap, length-prefixed vectors and
//! cursor-driven sequences built on top of it, a dictionary of name/payload
//! bindings, a string interner, and the two-stack interpreter that ties them
//! together.

pub mod dict;
pub mod digest;
pub mod error;
pub mod heap;
pub mod interpreter;
pub mod sequence;
pub mod vector;

pub use dict::Dict;
pub use digest::{Digest, DigestFull, StringDigest};
pub use error::{VmError, VmFault};
pub use heap::Heap;
pub use interpreter::{OpHandler, Vm};
pub use sequence::{ProcessorOp, SequenceCursor, SourceType};
