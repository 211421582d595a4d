//! The dictionary: a singly-linked list of name/payload entries.
//!
//! Each entry is one heap block, chained through the block's own `next`
//! field rather than a separate `prev_ref` payload cell — the whole chain is
//! one allocation, refcounted only at its head, exactly like a multi-block
//! vector. An entry's payload holds `[payload, name]` at the block's first
//! two cell slots.
//!
//! `mark`/`forget` give scope-exit rewind: capture the head block index,
//! later truncate the chain back to it, decref'ing whatever each discarded
//! entry pointed at along the way.

use tacit_core::{Cell, Memory, Segment, Tag, INVALID_BLOCK};

use crate::heap::Heap;

const PAYLOAD_OFFSET: u32 = 0;
const NAME_OFFSET: u32 = 4;

fn entry_payload(memory: &Memory, block: u16) -> Cell {
    let bits = memory
        .read32(Segment::Heap, Heap::payload_offset(block) + PAYLOAD_OFFSET)
        .expect("dict entry block is in range");
    Cell::from_bits(bits)
}

fn entry_name(memory: &Memory, block: u16) -> Cell {
    let bits = memory
        .read32(Segment::Heap, Heap::payload_offset(block) + NAME_OFFSET)
        .expect("dict entry block is in range");
    Cell::from_bits(bits)
}

fn tag_of(cell: Cell) -> Tag {
    cell.decode_tag().map(|(t, _, _)| t).expect("heap-allocated cell always decodes a Tag")
}

/// A name/payload dictionary. `head` is the most recently defined entry's
/// block, or `INVALID_BLOCK` when empty.
pub struct Dict {
    head: u16,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
    pub fn new() -> Self {
        Dict { head: INVALID_BLOCK }
    }

    /// Embed this dictionary as a first-class `HEAP.DICT` cell.
    pub fn to_cell(&self) -> Cell {
        Cell::to_tagged_enum(Tag::HeapDict, self.head, false)
    }

    /// Recover a `Dict` view over a `HEAP.DICT` cell. The returned `Dict` is
    /// a borrowed view, not a new allocation — dropping it does not release
    /// anything.
    pub fn from_cell(cell: Cell) -> Option<Dict> {
        match cell.decode_tag() {
            Some((Tag::HeapDict, head, _)) => Some(Dict { head }),
            _ => None,
        }
    }

    /// Bind `name` to `payload`, shadowing any earlier entry with the same
    /// name (lookup always finds the most recent one first).
    pub fn define(&mut self, heap: &mut Heap, memory: &mut Memory, name: Cell, payload: Cell) {
        let block = heap.malloc(memory, 8).expect("dictionary entry allocation failed");
        memory
            .write32(Segment::Heap, Heap::payload_offset(block) + PAYLOAD_OFFSET, payload.to_bits())
            .expect("freshly allocated entry block is in range");
        memory
            .write32(Segment::Heap, Heap::payload_offset(block) + NAME_OFFSET, name.to_bits())
            .expect("freshly allocated entry block is in range");
        if let Some(child) = payload.heap_block() {
            heap.increment_ref(memory, child);
        }
        if let Some(child) = name.heap_block() {
            heap.increment_ref(memory, child);
        }
        heap.link_raw(memory, block, self.head);
        self.head = block;
    }

    /// Find the most recent entry bound to `name`.
    pub fn lookup(&self, heap: &Heap, memory: &Memory, name: Cell) -> Option<Cell> {
        let mut cur = self.head;
        while cur != INVALID_BLOCK {
            if entry_name(memory, cur) == name {
                return Some(entry_payload(memory, cur));
            }
            cur = heap.block_next(memory, cur).unwrap_or(INVALID_BLOCK);
        }
        None
    }

    /// Capture the current write pointer for a later `forget`.
    pub fn mark(&self) -> u16 {
        self.head
    }

    /// Rewind to `mark`, releasing every entry defined since and decref'ing
    /// whatever each one pointed at.
    pub fn forget(&mut self, heap: &mut Heap, memory: &mut Memory, mark: u16) {
        let mut cur = self.head;
        while cur != mark && cur != INVALID_BLOCK {
            let next = heap.block_next(memory, cur).unwrap_or(INVALID_BLOCK);
            let payload = entry_payload(memory, cur);
            let name = entry_name(memory, cur);
            if let Some(child) = payload.heap_block() {
                heap.decrement_ref(memory, child, tag_of(payload));
            }
            if let Some(child) = name.heap_block() {
                heap.decrement_ref(memory, child, tag_of(name));
            }
            heap.release_block(memory, cur);
            cur = next;
        }
        self.head = cur;
    }
}

/// Walk entry `index` (0 = most recently defined) of the dictionary named by
/// `dict_cell`, for sequence DICT sources. `None` once `index` runs past the
/// last entry.
pub(crate) fn entry_at(heap: &Heap, memory: &Memory, dict_cell: Cell, index: u32) -> Option<(Cell, Cell)> {
    let head = Dict::from_cell(dict_cell)?.head;
    let mut cur = head;
    for _ in 0..index {
        cur = heap.block_next(memory, cur)?;
    }
    if cur == INVALID_BLOCK {
        return None;
    }
    Some((entry_name(memory, cur), entry_payload(memory, cur)))
}

/// Cleanup handler registered for `Tag::HeapDict`: decref every entry's
/// payload and name. Block reclamation is handled by the caller
/// (`Heap::decrement_ref`'s `free_chain`), which walks the same `next` chain.
pub(crate) fn cleanup(heap: &mut Heap, memory: &mut Memory, head: u16) {
    let mut cur = Some(head);
    while let Some(block) = cur {
        let payload = entry_payload(memory, block);
        let name = entry_name(memory, block);
        if let Some(child) = payload.heap_block() {
            heap.decrement_ref(memory, child, tag_of(payload));
        }
        if let Some(child) = name.heap_block() {
            heap.decrement_ref(memory, child, tag_of(name));
        }
        cur = heap.block_next(memory, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tacit_core::SegmentLayout;

    fn fresh(heap_bytes: u32) -> (Heap, Memory) {
        let mut mem = Memory::new(SegmentLayout {
            data_stack: 256,
            return_stack: 256,
            code: 256,
            digest: 256,
            heap: heap_bytes,
        });
        let heap = Heap::new(&mut mem);
        (heap, mem)
    }

    fn name(n: u16) -> Cell {
        Cell::to_tagged_enum(Tag::String, n, false)
    }

    #[test]
    fn lookup_finds_the_most_recent_binding() {
        let (mut heap, mut mem) = fresh(4096);
        let mut dict = Dict::new();
        dict.define(&mut heap, &mut mem, name(1), Cell::from_number(10.0));
        dict.define(&mut heap, &mut mem, name(1), Cell::from_number(20.0));
        assert_eq!(dict.lookup(&heap, &mem, name(1)).unwrap().as_number(), 20.0);
    }

    #[test]
    fn lookup_misses_return_none() {
        let (heap, mem) = fresh(4096);
        let dict = Dict::new();
        assert!(dict.lookup(&heap, &mem, name(1)).is_none());
    }

    #[test]
    fn mark_and_forget_rewinds_and_releases_blocks() {
        let (mut heap, mut mem) = fresh(4096);
        let mut dict = Dict::new();
        let mark = dict.mark();
        let before = heap.available(&mem);
        dict.define(&mut heap, &mut mem, name(1), Cell::from_number(1.0));
        dict.define(&mut heap, &mut mem, name(2), Cell::from_number(2.0));
        assert!(heap.available(&mem) < before);

        dict.forget(&mut heap, &mut mem, mark);
        assert_eq!(heap.available(&mem), before);
        assert!(dict.lookup(&heap, &mem, name(1)).is_none());
        assert!(dict.lookup(&heap, &mem, name(2)).is_none());
    }

    #[test]
    fn forget_partial_keeps_earlier_entries() {
        let (mut heap, mut mem) = fresh(4096);
        let mut dict = Dict::new();
        dict.define(&mut heap, &mut mem, name(1), Cell::from_number(1.0));
        let mark = dict.mark();
        dict.define(&mut heap, &mut mem, name(2), Cell::from_number(2.0));

        dict.forget(&mut heap, &mut mem, mark);
        assert!(dict.lookup(&heap, &mem, name(1)).is_some());
        assert!(dict.lookup(&heap, &mem, name(2)).is_none());
    }
}
