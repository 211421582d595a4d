//! Memory-level error taxonomy.
//!
//! These are the only errors the core can raise on its own: every access is
//! bounds- and alignment-checked before it touches the backing buffer, and
//! every violation is reported here rather than by indexing out of range.

use crate::Segment;

/// An error accessing [`Memory`](crate::Memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// The access would read or write past the end of its segment.
    #[error("out of bounds: segment {segment:?} offset {offset} len {len}")]
    OutOfBounds {
        segment: Segment,
        offset: u32,
        len: u32,
    },

    /// The offset does not satisfy the alignment required by the access width.
    #[error("misaligned access: segment {segment:?} offset {offset} width {width}")]
    Misaligned {
        segment: Segment,
        offset: u32,
        width: u32,
    },
}
