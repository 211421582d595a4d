//! Sequences: a cursor-carrying state machine stored in the same
//! length-prefixed chain layout as a [`crate::vector`], tagged
//! `HEAP.SEQUENCE` instead of `HEAP.VECTOR`.
//!
//! Payload: `[source_type, cursor, meta_count, meta...]`. Processors never
//! restructure their source sequences — advancing one only overwrites its
//! own `cursor` cell in place, so `seq_next` never needs copy-on-write and
//! always returns the same tag it was given.

use tacit_core::{Cell, Memory, Tag};

use crate::heap::Heap;
use crate::interpreter::Vm;
use crate::vector::{build_chain, chain_get, chain_set_raw, decref_chain_contents};
use crate::VmError;

const IDX_SOURCE_TYPE: i64 = 0;
const IDX_CURSOR: i64 = 1;
const IDX_META_COUNT: i64 = 2;
const META_START: i64 = 3;

/// The kind of thing a sequence draws values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SourceType {
    Range = 0,
    Vector = 1,
    String = 2,
    Processor = 3,
    Constant = 4,
    Dict = 5,
}

impl SourceType {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => SourceType::Range,
            1 => SourceType::Vector,
            2 => SourceType::String,
            3 => SourceType::Processor,
            4 => SourceType::Constant,
            5 => SourceType::Dict,
            _ => return None,
        })
    }
}

/// A `PROCESSOR` sequence's `meta[0]` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcessorOp {
    Map = 0,
    Filter = 1,
    Sift = 2,
    Take = 3,
    Drop = 4,
    Multi = 5,
    MultiSource = 6,
}

impl ProcessorOp {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => ProcessorOp::Map,
            1 => ProcessorOp::Filter,
            2 => ProcessorOp::Sift,
            3 => ProcessorOp::Take,
            4 => ProcessorOp::Drop,
            5 => ProcessorOp::Multi,
            6 => ProcessorOp::MultiSource,
            _ => return None,
        })
    }
}

fn int_cell(v: u16) -> Cell {
    Cell::to_tagged_enum(Tag::Integer, v, false)
}

fn int_value(cell: Cell) -> Option<u16> {
    cell.decode_tag().and_then(|(t, v, _)| (t == Tag::Integer).then_some(v))
}

fn is_truthy(cell: Cell) -> bool {
    !(cell.is_nil() || (cell.is_number() && cell.as_number() == 0.0))
}

/// `seq_create(heap, source_type, meta) → cell`. `meta`'s first slot is the
/// initial cursor position's source; the stored cursor is `meta[0]` for
/// `RANGE` (its start) and `0.0` for every other source type.
pub fn seq_create(heap: &mut Heap, memory: &mut Memory, source_type: SourceType, meta: &[Cell]) -> Cell {
    let cursor = if source_type == SourceType::Range {
        meta.first().copied().unwrap_or(Cell::from_number(0.0))
    } else {
        Cell::from_number(0.0)
    };

    let mut payload = Vec::with_capacity(META_START as usize + meta.len());
    payload.push(int_cell(source_type as u16));
    payload.push(cursor);
    payload.push(Cell::from_number(meta.len() as f32));
    payload.extend_from_slice(meta);

    match build_chain(heap, memory, &payload) {
        Some(head) => Cell::to_tagged_enum(Tag::HeapSequence, head, false),
        None => tacit_core::NIL,
    }
}

fn source_type_of(heap: &Heap, memory: &Memory, head: u16) -> SourceType {
    let cell = chain_get(heap, memory, head, IDX_SOURCE_TYPE);
    SourceType::from_u16(int_value(cell).unwrap_or(u16::MAX))
        .expect("sequence head carries a valid SourceType")
}

fn cursor_of(heap: &Heap, memory: &Memory, head: u16) -> Cell {
    chain_get(heap, memory, head, IDX_CURSOR)
}

fn set_cursor(heap: &Heap, memory: &mut Memory, head: u16, value: Cell) {
    chain_set_raw(heap, memory, head, IDX_CURSOR as u32, value);
}

fn meta_count(heap: &Heap, memory: &Memory, head: u16) -> usize {
    chain_get(heap, memory, head, IDX_META_COUNT).as_number() as usize
}

fn meta_at(heap: &Heap, memory: &Memory, head: u16, i: usize) -> Cell {
    chain_get(heap, memory, head, META_START + i as i64)
}

/// Advance `seq` by one step, pushing the next element (or `NIL` once
/// exhausted) onto `vm`'s data stack, and returning the same sequence cell
/// — every variant mutates only its own cursor, never its structure.
pub fn seq_next(vm: &mut Vm, seq: Cell) -> Result<Cell, VmError> {
    let head = seq.heap_block().expect("seq_next: not a HEAP.SEQUENCE cell");
    let source_type = {
        let (heap, memory) = vm.heap_memory_mut();
        source_type_of(heap, memory, head)
    };

    match source_type {
        SourceType::Range => range_next(vm, head)?,
        SourceType::Vector => vector_source_next(vm, head)?,
        SourceType::Dict => dict_source_next(vm, head)?,
        SourceType::String => string_source_next(vm, head)?,
        SourceType::Constant => {
            let value = {
                let (heap, memory) = vm.heap_memory_mut();
                meta_at(heap, memory, head, 0)
            };
            vm.push_data(value)?;
        }
        SourceType::Processor => processor_next(vm, head)?,
    }
    Ok(seq)
}

fn range_next(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (heap, memory) = vm.heap_memory_mut();
    let cursor = cursor_of(heap, memory, head).as_number();
    let end = meta_at(heap, memory, head, 1).as_number();
    let step = meta_at(heap, memory, head, 2).as_number();
    if cursor <= end {
        set_cursor(heap, memory, head, Cell::from_number(cursor + step));
        vm.push_data(Cell::from_number(cursor))
    } else {
        vm.push_data(tacit_core::NIL)
    }
}

fn vector_source_next(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (heap, memory) = vm.heap_memory_mut();
    let source = meta_at(heap, memory, head, 0);
    let source_head = source.heap_block().expect("VECTOR source meta[0] is a HEAP.VECTOR cell");
    let cursor = cursor_of(heap, memory, head).as_number() as i64;
    let value = chain_get(heap, memory, source_head, cursor);
    set_cursor(heap, memory, head, Cell::from_number((cursor + 1) as f32));
    vm.push_data(value)
}

/// A DICT-sourced sequence walks the dictionary's `prev_ref` chain from its
/// head (most-recently-defined entry first) and pushes key then value per
/// step.
fn dict_source_next(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (heap, memory) = vm.heap_memory_mut();
    let source = meta_at(heap, memory, head, 0);
    let index = cursor_of(heap, memory, head).as_number() as u32;
    match crate::dict::entry_at(heap, memory, source, index) {
        Some((key, value)) => {
            set_cursor(heap, memory, head, Cell::from_number((index + 1) as f32));
            vm.push_data(key)?;
            vm.push_data(value)
        }
        None => vm.push_data(tacit_core::NIL),
    }
}

fn string_source_next(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (heap, memory) = vm.heap_memory_mut();
    let source = meta_at(heap, memory, head, 0);
    let source_head = source.heap_block().expect("STRING source meta[0] is a HEAP.VECTOR of bytes");
    let cursor = cursor_of(heap, memory, head).as_number() as i64;
    let value = chain_get(heap, memory, source_head, cursor);
    set_cursor(heap, memory, head, Cell::from_number((cursor + 1) as f32));
    vm.push_data(value)
}

fn processor_next(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let op = {
        let (heap, memory) = vm.heap_memory_mut();
        let op_cell = meta_at(heap, memory, head, 0);
        ProcessorOp::from_u16(int_value(op_cell).unwrap_or(u16::MAX))
            .expect("PROCESSOR sequence carries a valid ProcessorOp in meta[0]")
    };
    match op {
        ProcessorOp::Map => processor_map(vm, head),
        ProcessorOp::Filter => processor_filter(vm, head),
        ProcessorOp::Sift => processor_sift(vm, head),
        ProcessorOp::Take => processor_take(vm, head),
        ProcessorOp::Drop => processor_drop(vm, head),
        ProcessorOp::Multi => processor_multi(vm, head),
        ProcessorOp::MultiSource => processor_multi_source(vm, head),
    }
}

fn meta_seq(heap: &Heap, memory: &Memory, head: u16, i: usize) -> Cell {
    meta_at(heap, memory, head, i)
}

fn processor_map(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (source, fn_ip) = {
        let (heap, memory) = vm.heap_memory_mut();
        (meta_seq(heap, memory, head, 1), meta_seq(heap, memory, head, 2).as_number() as u32)
    };
    seq_next(vm, source)?;
    if vm.peek_data()?.is_nil() {
        return Ok(());
    }
    vm.call_compiled(fn_ip)
}

fn processor_filter(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (source, pred_ip) = {
        let (heap, memory) = vm.heap_memory_mut();
        (meta_seq(heap, memory, head, 1), meta_seq(heap, memory, head, 2).as_number() as u32)
    };
    loop {
        seq_next(vm, source)?;
        if vm.peek_data()?.is_nil() {
            return Ok(());
        }
        let value = vm.peek_data()?;
        vm.push_data(value)?;
        vm.call_compiled(pred_ip)?;
        let keep = vm.pop_data()?;
        if is_truthy(keep) {
            return Ok(());
        }
        vm.pop_data()?; // discard this round's value, try the next element
    }
}

fn processor_sift(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (source, mask_seq) = {
        let (heap, memory) = vm.heap_memory_mut();
        (meta_seq(heap, memory, head, 1), meta_seq(heap, memory, head, 2))
    };
    loop {
        seq_next(vm, source)?;
        if vm.peek_data()?.is_nil() {
            return Ok(());
        }
        seq_next(vm, mask_seq)?;
        let mask = vm.pop_data()?;
        if is_truthy(mask) {
            return Ok(()); // source value is left on the stack
        }
        vm.pop_data()?; // discard source value, advance to the next pair
    }
}

fn processor_take(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (source, n) = {
        let (heap, memory) = vm.heap_memory_mut();
        (meta_seq(heap, memory, head, 1), meta_seq(heap, memory, head, 2).as_number())
    };
    let taken = {
        let (heap, memory) = vm.heap_memory_mut();
        cursor_of(heap, memory, head).as_number()
    };
    if taken >= n {
        return vm.push_data(tacit_core::NIL);
    }
    seq_next(vm, source)?;
    if vm.peek_data()?.is_nil() {
        let (heap, memory) = vm.heap_memory_mut();
        set_cursor(heap, memory, head, Cell::from_number(n)); // latch exhausted
        return Ok(());
    }
    let (heap, memory) = vm.heap_memory_mut();
    set_cursor(heap, memory, head, Cell::from_number(taken + 1.0));
    Ok(())
}

fn processor_drop(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let (source, n) = {
        let (heap, memory) = vm.heap_memory_mut();
        (meta_seq(heap, memory, head, 1), meta_seq(heap, memory, head, 2).as_number() as u32)
    };
    let already_dropped = {
        let (heap, memory) = vm.heap_memory_mut();
        cursor_of(heap, memory, head).as_number() != 0.0
    };
    if !already_dropped {
        for _ in 0..n {
            seq_next(vm, source)?;
            vm.pop_data()?;
        }
        let (heap, memory) = vm.heap_memory_mut();
        set_cursor(heap, memory, head, Cell::from_number(1.0));
    }
    seq_next(vm, source)?;
    Ok(())
}

fn processor_sources(heap: &Heap, memory: &Memory, head: u16) -> Vec<Cell> {
    let count = meta_count(heap, memory, head) - 1; // meta[0] is the op
    (0..count).map(|i| meta_at(heap, memory, head, 1 + i)).collect()
}

fn processor_multi(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let sources = {
        let (heap, memory) = vm.heap_memory_mut();
        processor_sources(heap, memory, head)
    };
    let mut any_nil = false;
    for source in sources {
        seq_next(vm, source)?;
        if vm.pop_data()?.is_nil() {
            any_nil = true;
        }
    }
    if any_nil {
        vm.push_data(tacit_core::NIL)?;
    }
    Ok(())
}

fn processor_multi_source(vm: &mut Vm, head: u16) -> Result<(), VmError> {
    let sources = {
        let (heap, memory) = vm.heap_memory_mut();
        processor_sources(heap, memory, head)
    };
    for source in sources {
        seq_next(vm, source)?;
    }
    Ok(())
}

/// A host/test-convenience `Iterator` that drains a sequence via repeated
/// `seq_next`, stopping at the first `NIL`. Never used by the interpreter
/// itself — the heap-resident cursor state is the real state machine.
pub struct SequenceCursor<'a> {
    vm: &'a mut Vm,
    seq: Cell,
    done: bool,
}

impl<'a> SequenceCursor<'a> {
    pub fn new(vm: &'a mut Vm, seq: Cell) -> Self {
        SequenceCursor { vm, seq, done: false }
    }
}

impl<'a> Iterator for SequenceCursor<'a> {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        if self.done {
            return None;
        }
        self.seq = seq_next(self.vm, self.seq).ok()?;
        let value = self.vm.pop_data().ok()?;
        if value.is_nil() {
            self.done = true;
            return None;
        }
        Some(value)
    }
}

/// Cleanup handler registered for `Tag::HeapSequence`: decref every
/// heap-tagged meta cell (sources, predicates aren't heap cells themselves
/// but a MAP/FILTER's source sequence is).
pub(crate) fn cleanup(heap: &mut Heap, memory: &mut Memory, head: u16) {
    decref_chain_contents(heap, memory, head);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::StringDigest;
    use tacit_core::SegmentLayout;

    fn fresh_vm() -> Vm {
        let layout = SegmentLayout {
            data_stack: 1024,
            return_stack: 256,
            code: 256,
            digest: 256,
            heap: 8192,
        };
        Vm::new(Memory::new(layout), Box::new(StringDigest::new()))
    }

    #[test]
    fn range_counts_up_and_terminates() {
        let mut vm = fresh_vm();
        let meta = [Cell::from_number(0.0), Cell::from_number(2.0), Cell::from_number(1.0)];
        let (heap, memory) = vm.heap_memory_mut();
        let seq = seq_create(heap, memory, SourceType::Range, &meta);

        let mut seen = Vec::new();
        let mut cur = seq;
        loop {
            cur = seq_next(&mut vm, cur).unwrap();
            let v = vm.pop_data().unwrap();
            if v.is_nil() {
                break;
            }
            seen.push(v.as_number());
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn vector_source_walks_elements_then_nil() {
        let mut vm = fresh_vm();
        let (heap, memory) = vm.heap_memory_mut();
        let data = crate::vector::vector_create(
            heap,
            memory,
            &[Cell::from_number(10.0), Cell::from_number(20.0)],
        );
        let seq = seq_create(heap, memory, SourceType::Vector, &[data]);

        let mut out = Vec::new();
        let mut cur = seq;
        for _ in 0..3 {
            cur = seq_next(&mut vm, cur).unwrap();
            out.push(vm.pop_data().unwrap());
        }
        assert_eq!(out[0].as_number(), 10.0);
        assert_eq!(out[1].as_number(), 20.0);
        assert!(out[2].is_nil());
    }

    #[test]
    fn constant_always_yields_the_same_cell() {
        let mut vm = fresh_vm();
        let (heap, memory) = vm.heap_memory_mut();
        let seq = seq_create(heap, memory, SourceType::Constant, &[Cell::from_number(7.0)]);
        for _ in 0..3 {
            seq_next(&mut vm, seq).unwrap();
            assert_eq!(vm.pop_data().unwrap().as_number(), 7.0);
        }
    }

    #[test]
    fn take_stops_after_n_even_if_source_has_more() {
        let mut vm = fresh_vm();
        let meta = [Cell::from_number(0.0), Cell::from_number(99.0), Cell::from_number(1.0)];
        let (heap, memory) = vm.heap_memory_mut();
        let source = seq_create(heap, memory, SourceType::Range, &meta);
        let take_meta = [int_cell(ProcessorOp::Take as u16), source, Cell::from_number(2.0)];
        let seq = seq_create(heap, memory, SourceType::Processor, &take_meta);

        let mut out = Vec::new();
        let mut cur = seq;
        for _ in 0..3 {
            cur = seq_next(&mut vm, cur).unwrap();
            out.push(vm.pop_data().unwrap());
        }
        assert_eq!(out[0].as_number(), 0.0);
        assert_eq!(out[1].as_number(), 1.0);
        assert!(out[2].is_nil());
    }

    #[test]
    fn drop_discards_the_first_n_then_forwards() {
        let mut vm = fresh_vm();
        let meta = [Cell::from_number(0.0), Cell::from_number(99.0), Cell::from_number(1.0)];
        let (heap, memory) = vm.heap_memory_mut();
        let source = seq_create(heap, memory, SourceType::Range, &meta);
        let drop_meta = [int_cell(ProcessorOp::Drop as u16), source, Cell::from_number(3.0)];
        let seq = seq_create(heap, memory, SourceType::Processor, &drop_meta);

        seq_next(&mut vm, seq).unwrap();
        assert_eq!(vm.pop_data().unwrap().as_number(), 3.0);
    }
}
