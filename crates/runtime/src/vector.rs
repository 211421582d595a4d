//! Vectors: length-prefixed payload stored across chained blocks.
//!
//! ```text
//! head block:  [ length:u16 | cell0 | cell1 | ... ]   (14 cells/block)
//! next block:  [ cell_k | cell_(k+1) | ... ]           (15 cells/block)
//! ```
//!
//! Updates are copy-on-write: mutating a shared vector clones the whole
//! chain (see the note in `heap.rs`) rather than splicing an interior block,
//! so a prior snapshot is never observed to change (spec P5 / scenario 2).

use tacit_core::{Cell, Memory, Segment, Tag};

use crate::heap::{Heap, BLOCK_PAYLOAD_SIZE};

// The length header is a u16 but occupies a full 4-byte slot so every cell
// that follows it stays 4-byte aligned (`Memory::read32`/`write32` require
// alignment to the segment-relative offset).
const LENGTH_FIELD_SIZE: u32 = 4;
const CELL_SIZE: u32 = 4;

/// Cells that fit in a head block alongside the length field.
pub const HEAD_CAPACITY: u32 = (BLOCK_PAYLOAD_SIZE - LENGTH_FIELD_SIZE) / CELL_SIZE;
/// Cells that fit in a continuation block.
pub const CONT_CAPACITY: u32 = BLOCK_PAYLOAD_SIZE / CELL_SIZE;

fn total_payload_bytes(len: u32) -> u32 {
    LENGTH_FIELD_SIZE + len * CELL_SIZE
}

/// `(block, offset-within-block-payload)` for logical index `i`, walking the
/// chain from `head`. Shared with [`crate::sequence`], which stores its
/// `[source_type, cursor, meta_count, meta...]` payload in the same
/// length-prefixed chain layout.
pub(crate) fn locate(heap: &Heap, memory: &Memory, head: u16, i: u32) -> Option<(u16, u32)> {
    if i < HEAD_CAPACITY {
        return Some((head, LENGTH_FIELD_SIZE + i * CELL_SIZE));
    }
    let mut remaining = i - HEAD_CAPACITY;
    let mut block = heap.block_next(memory, head)?;
    loop {
        if remaining < CONT_CAPACITY {
            return Some((block, remaining * CELL_SIZE));
        }
        remaining -= CONT_CAPACITY;
        block = heap.block_next(memory, block)?;
    }
}

pub(crate) fn cell_addr(block: u16, payload_off: u32) -> u32 {
    Heap::payload_offset(block) + payload_off
}

/// Allocate a length-prefixed chain holding `data`, incrementing the
/// refcount of any heap-tagged cell it contains. Returns the head block, or
/// `None` on allocation failure. Untagged — callers wrap the result with
/// whichever `Tag` names their structure.
pub(crate) fn build_chain(heap: &mut Heap, memory: &mut Memory, data: &[Cell]) -> Option<u16> {
    let len = data.len() as u32;
    let size = if len == 0 {
        LENGTH_FIELD_SIZE
    } else {
        total_payload_bytes(len)
    };
    let head = heap.malloc(memory, size)?;
    memory
        .write16(Segment::Heap, Heap::payload_offset(head), len as u16)
        .expect("freshly allocated head block is in range");

    for (i, &cell) in data.iter().enumerate() {
        let (block, off) = locate(heap, memory, head, i as u32)
            .expect("index within declared length must resolve to an allocated block");
        memory
            .write32(Segment::Heap, cell_addr(block, off), cell.to_bits())
            .expect("allocated cell slot is in range");
        if let Some(child) = cell.heap_block() {
            heap.increment_ref(memory, child);
        }
    }
    Some(head)
}

/// Logical length of the chain rooted at `head`.
pub(crate) fn chain_length(memory: &Memory, head: u16) -> u16 {
    memory
        .read16(Segment::Heap, Heap::payload_offset(head))
        .expect("chain head block is in range")
}

/// Read element `i` of the chain, or `NIL` if out of range.
pub(crate) fn chain_get(heap: &Heap, memory: &Memory, head: u16, i: i64) -> Cell {
    let len = chain_length(memory, head) as i64;
    if i < 0 || i >= len {
        return tacit_core::NIL;
    }
    let (block, off) = locate(heap, memory, head, i as u32).expect("in-range index resolves");
    let bits = memory
        .read32(Segment::Heap, cell_addr(block, off))
        .expect("allocated cell slot is in range");
    Cell::from_bits(bits)
}

/// Materialize every element of the chain into a `Vec<Cell>`.
pub(crate) fn chain_to_vec(heap: &Heap, memory: &Memory, head: u16) -> Vec<Cell> {
    let len = chain_length(memory, head);
    (0..len as i64).map(|i| chain_get(heap, memory, head, i)).collect()
}

/// Overwrite element `i` of the chain in place, with no refcount bookkeeping
/// (the caller owns that — used by [`crate::sequence`] for cursor cells that
/// are never heap-tagged).
pub(crate) fn chain_set_raw(heap: &Heap, memory: &mut Memory, head: u16, i: u32, value: Cell) {
    let (block, off) = locate(heap, memory, head, i).expect("in-range index resolves");
    memory
        .write32(Segment::Heap, cell_addr(block, off), value.to_bits())
        .expect("allocated cell slot is in range");
}

/// Build a vector from `data`, incrementing the refcount of any heap-tagged
/// cell it contains (structural sharing — the new vector is an independent
/// owner of each child). Returns `NIL` on allocation failure.
pub fn vector_create(heap: &mut Heap, memory: &mut Memory, data: &[Cell]) -> Cell {
    match build_chain(heap, memory, data) {
        Some(head) => Cell::to_tagged_enum(Tag::HeapVector, head, false),
        None => tacit_core::NIL,
    }
}

/// Logical length of `vec`. Panics if `vec` is not a `HEAP.VECTOR` cell —
/// callers are expected to check the tag first (the same "logic error, fail
/// loudly" posture the heap applies to block indices).
pub fn vector_length(memory: &Memory, vec: Cell) -> u16 {
    let head = vec.heap_block().expect("vector_length: not a HEAP.VECTOR cell");
    chain_length(memory, head)
}

/// Read element `i`, or `NIL` if out of range.
pub fn vector_get(heap: &Heap, memory: &Memory, vec: Cell, i: i64) -> Cell {
    let Some(head) = vec.heap_block() else {
        return tacit_core::NIL;
    };
    chain_get(heap, memory, head, i)
}

/// Materialize every element into a `Vec<Cell>` (host/test convenience —
/// never used on the interpreter's hot path).
pub fn vector_to_vec(heap: &Heap, memory: &Memory, vec: Cell) -> Vec<Cell> {
    let Some(head) = vec.heap_block() else {
        return Vec::new();
    };
    chain_to_vec(heap, memory, head)
}

/// Persistent update: returns a vector with element `i` set to `value`,
/// leaving any other live reference to `vec` observing the old contents.
///
/// Implemented at whole-chain granularity: if the chain is shared
/// (`refs > 1`) the entire chain is cloned (incrementing the refcount of any
/// heap-tagged cell it carries, since the clone is now an independent
/// owner), the old head's reference is released, and the write lands on the
/// fresh copy; otherwise the write happens in place.
pub fn vector_update(heap: &mut Heap, memory: &mut Memory, vec: Cell, i: i64, value: Cell) -> Cell {
    let Some(head) = vec.heap_block() else {
        return tacit_core::NIL;
    };
    let len = vector_length(memory, vec);
    if i < 0 || i >= len as i64 {
        return tacit_core::NIL;
    }

    let working_head = if heap.block_refs(memory, head) > 1 {
        let data = chain_to_vec(heap, memory, head);
        let cloned = build_chain(heap, memory, &data)
            .expect("cloning a chain that already fit in memory failed under allocation pressure");
        heap.decrement_ref(memory, head, Tag::HeapVector);
        cloned
    } else {
        head
    };

    let (block, off) = locate(heap, memory, working_head, i as u32)
        .expect("in-range index resolves on the working chain");
    let old_bits = memory
        .read32(Segment::Heap, cell_addr(block, off))
        .expect("allocated cell slot is in range");
    let old = Cell::from_bits(old_bits);
    if let Some(child) = old.heap_block() {
        heap.decrement_ref(memory, child, tag_of_heap_cell(old));
    }
    memory
        .write32(Segment::Heap, cell_addr(block, off), value.to_bits())
        .expect("allocated cell slot is in range");
    if let Some(child) = value.heap_block() {
        heap.increment_ref(memory, child);
    }

    Cell::to_tagged_enum(Tag::HeapVector, working_head, false)
}

/// Recover the heap tag of a cell known to be heap-allocated.
pub(crate) fn tag_of_heap_cell(cell: Cell) -> Tag {
    cell.decode_tag().map(|(t, _, _)| t).expect("heap-allocated cell always decodes a Tag")
}

/// Decref every heap-tagged cell stored in the chain rooted at `head`. Shared
/// by vector and sequence cleanup, which both store plain cell payloads.
pub(crate) fn decref_chain_contents(heap: &mut Heap, memory: &mut Memory, head: u16) {
    let len = chain_length(memory, head);
    for i in 0..len as i64 {
        let cell = chain_get(heap, memory, head, i);
        if let Some(child) = cell.heap_block() {
            heap.decrement_ref(memory, child, tag_of_heap_cell(cell));
        }
    }
}

/// Cleanup handler registered for `Tag::HeapVector`: decref every payload
/// cell across the whole chain.
pub(crate) fn cleanup(heap: &mut Heap, memory: &mut Memory, head: u16) {
    decref_chain_contents(heap, memory, head);
}
