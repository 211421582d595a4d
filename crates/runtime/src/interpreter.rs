//! The two-stack bytecode interpreter.
//!
//! State carried by the VM: an instruction pointer (`IP`, a byte offset into
//! CODE), a data stack pointer (`SP`) and return stack pointer (`RSP`, both
//! byte offsets into their segments), a frame base (`BP`), a `running` flag,
//! and the heap/memory/digest the rest of the runtime operates on.
//!
//! Dispatch distinguishes a user function call from everything else by the
//! high bit of the fetched opcode byte (per the literal-encoding rules):
//! bytes `0x00..=0x7F` index a 128-slot handler table; bytes with the high
//! bit set are the first half of a two-byte user-function-call operand and
//! never reach the table at all. Slots `0..6` of the table are reserved for
//! the remaining six core control-flow opcodes below (slot `2` is skipped
//! and left unregistered — there is no `UserCall` table entry, since a user
//! call is recognized by the high bit before the table lookup ever happens);
//! `7..127` are open for host-registered builtins.

use tacit_core::{Cell, Memory, Segment, Tag};

use crate::digest::Digest;
use crate::error::{VmError, VmFault};
use crate::heap::Heap;

pub const OP_LITERAL_NUMBER: u8 = 0;
pub const OP_LITERAL_STRING: u8 = 1;
pub const OP_EXIT: u8 = 3;
pub const OP_IF_FALSE_BRANCH: u8 = 4;
pub const OP_BRANCH_ALWAYS: u8 = 5;
pub const OP_ABORT: u8 = 6;

const OPCODE_TABLE_SIZE: usize = 128;

pub type OpHandler = fn(&mut Vm) -> Result<(), VmError>;

/// The virtual machine: two stacks, the heap, the digest, and the fetch
/// loop's handler table.
pub struct Vm {
    memory: Memory,
    heap: Heap,
    digest: Box<dyn Digest>,
    functions: Vec<u32>,
    opcodes: [Option<OpHandler>; OPCODE_TABLE_SIZE],
    ip: u32,
    sp: u32,
    rsp: u32,
    bp: u32,
    running: bool,
    pub debug: bool,
}

impl Vm {
    pub fn new(mut memory: Memory, digest: Box<dyn Digest>) -> Self {
        let heap = Heap::new(&mut memory);
        let mut opcodes: [Option<OpHandler>; OPCODE_TABLE_SIZE] = [None; OPCODE_TABLE_SIZE];
        opcodes[OP_LITERAL_NUMBER as usize] = Some(op_literal_number);
        opcodes[OP_LITERAL_STRING as usize] = Some(op_literal_string);
        opcodes[OP_EXIT as usize] = Some(op_exit);
        opcodes[OP_IF_FALSE_BRANCH as usize] = Some(op_if_false_branch);
        opcodes[OP_BRANCH_ALWAYS as usize] = Some(op_branch_always);
        opcodes[OP_ABORT as usize] = Some(op_abort);
        Vm {
            memory,
            heap,
            digest,
            functions: Vec::new(),
            opcodes,
            ip: 0,
            sp: 0,
            rsp: 0,
            bp: 0,
            running: false,
            debug: false,
        }
    }

    /// Register a host builtin at `code` (must be `7..127`; `0..6` are
    /// reserved for the core control-flow opcodes above).
    pub fn register_builtin(&mut self, code: u8, handler: OpHandler) {
        assert!(code >= 7, "opcodes 0..6 are reserved for core control flow");
        self.opcodes[code as usize] = Some(handler);
    }

    /// Append `entry_ip` to the user-function table, returning its index for
    /// `UserCall` operands.
    pub fn define_function(&mut self, entry_ip: u32) -> u32 {
        self.functions.push(entry_ip);
        self.functions.len() as u32 - 1
    }

    pub fn ip(&self) -> u32 {
        self.ip
    }
    pub fn sp(&self) -> u32 {
        self.sp
    }
    pub fn rsp(&self) -> u32 {
        self.rsp
    }
    pub fn bp(&self) -> u32 {
        self.bp
    }
    /// Whether the dispatch loop considers itself still running. `false`
    /// once `Abort` has fired, even if observed from outside `execute`.
    pub fn running(&self) -> bool {
        self.running
    }

    pub fn heap_memory_mut(&mut self) -> (&mut Heap, &mut Memory) {
        (&mut self.heap, &mut self.memory)
    }
    pub fn heap(&self) -> &Heap {
        &self.heap
    }
    pub fn memory(&self) -> &Memory {
        &self.memory
    }
    pub fn digest_mut(&mut self) -> &mut dyn Digest {
        self.digest.as_mut()
    }

    fn fetch_u8(&mut self) -> Result<u8, VmError> {
        let b = self.memory.read8(Segment::Code, self.ip)?;
        self.ip += 1;
        Ok(b)
    }

    fn fetch_u16(&mut self) -> Result<u16, VmError> {
        let v = self.memory.read16(Segment::Code, self.ip)?;
        self.ip += 2;
        Ok(v)
    }

    fn fetch_f32(&mut self) -> Result<f32, VmError> {
        let v = self.memory.read_float32(Segment::Code, self.ip)?;
        self.ip += 4;
        Ok(v)
    }

    pub fn push_data(&mut self, cell: Cell) -> Result<(), VmError> {
        let capacity = self.memory.segment_len(Segment::DataStack);
        if self.sp + 4 > capacity {
            return Err(VmError::StackOverflow { op: "push", sp: self.sp, capacity });
        }
        self.memory.write32(Segment::DataStack, self.sp, cell.to_bits())?;
        self.sp += 4;
        Ok(())
    }

    pub fn pop_data(&mut self) -> Result<Cell, VmError> {
        if self.sp < 4 {
            return Err(VmError::StackUnderflow { op: "pop", sp: self.sp, requested: 4 });
        }
        self.sp -= 4;
        Ok(Cell::from_bits(self.memory.read32(Segment::DataStack, self.sp)?))
    }

    pub fn peek_data(&self) -> Result<Cell, VmError> {
        if self.sp < 4 {
            return Err(VmError::StackUnderflow { op: "peek", sp: self.sp, requested: 4 });
        }
        Ok(Cell::from_bits(self.memory.read32(Segment::DataStack, self.sp - 4)?))
    }

    fn push_return(&mut self, cell: Cell) -> Result<(), VmError> {
        let capacity = self.memory.segment_len(Segment::ReturnStack);
        if self.rsp + 4 > capacity {
            return Err(VmError::StackOverflow { op: "call", sp: self.rsp, capacity });
        }
        self.memory.write32(Segment::ReturnStack, self.rsp, cell.to_bits())?;
        self.rsp += 4;
        Ok(())
    }

    fn pop_return(&mut self) -> Result<Cell, VmError> {
        if self.rsp < 4 {
            return Err(VmError::StackUnderflow { op: "return", sp: self.rsp, requested: 4 });
        }
        self.rsp -= 4;
        Ok(Cell::from_bits(self.memory.read32(Segment::ReturnStack, self.rsp)?))
    }

    /// Snapshot of the live data stack, base to top, for error reporting and
    /// host inspection.
    pub fn get_stack_data(&self) -> Vec<Cell> {
        (0..self.sp / 4)
            .map(|i| Cell::from_bits(self.memory.read32(Segment::DataStack, i * 4).unwrap()))
            .collect()
    }

    fn fault(&self, error: VmError) -> VmFault {
        VmFault { error, stack: self.get_stack_data() }
    }

    /// Run the fetch-decode-dispatch loop from `start_ip` until `Abort`
    /// clears `running`, or (if given) `IP` reaches `break_at`.
    pub fn execute(&mut self, start_ip: u32, break_at: Option<u32>) -> Result<(), VmFault> {
        self.ip = start_ip;
        self.running = true;
        while self.running {
            if break_at == Some(self.ip) {
                break;
            }
            self.step().map_err(|e| self.fault(e))?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), VmError> {
        let opcode = self.fetch_u8()?;
        if opcode & 0x80 != 0 {
            let lo = self.fetch_u8()?;
            let index = (((opcode & 0x7F) as u32) << 7) | (lo & 0x7F) as u32;
            return self.user_call(index);
        }
        match self.opcodes[opcode as usize] {
            Some(handler) => handler(self),
            None => Err(VmError::UnknownOpcode(opcode)),
        }
    }

    fn user_call(&mut self, index: u32) -> Result<(), VmError> {
        let entry_ip = *self
            .functions
            .get(index as usize)
            .ok_or(VmError::InvalidBytecode(format!("user call to undefined function {index}")))?;
        let return_ip = self.ip;
        self.push_return(Cell::to_tagged_enum(Tag::Code, return_ip as u16, false))?;
        self.push_return(Cell::to_tagged_enum(Tag::Integer, self.bp as u16, false))?;
        self.bp = self.rsp;
        self.ip = entry_ip;
        Ok(())
    }

    /// Re-entrant invocation used by MAP/FILTER and host REPL evaluation:
    /// save `IP`, push a frame, run the dispatch loop until it returns to
    /// the saved `IP`, then hand control back with the callee's effects
    /// visible on the data stack.
    pub fn call_compiled(&mut self, entry_ip: u32) -> Result<(), VmError> {
        let return_ip = self.ip;
        self.push_return(Cell::to_tagged_enum(Tag::Code, return_ip as u16, false))?;
        self.push_return(Cell::to_tagged_enum(Tag::Integer, self.bp as u16, false))?;
        self.bp = self.rsp;
        self.ip = entry_ip;
        let was_running = self.running;
        self.running = true;
        while self.ip != return_ip {
            self.step()?;
            if !self.running {
                break;
            }
        }
        // `self.running` is still true here unless the callee hit Abort, in
        // which case it must stay false and propagate outward rather than be
        // papered back over by the caller's prior state — Abort is supposed
        // to halt the whole dispatch loop, not just this re-entrant call.
        self.running = self.running && was_running;
        Ok(())
    }

    // -- compound-aware stack operations -----------------------------------

    /// Cell count of the logical element whose last cell sits at byte offset
    /// `top_offset` (exclusive) within the data stack: `1` for a scalar, or
    /// `LINK.value + 1` when that cell is a `LINK` closing an inline
    /// compound (per the LIST/TUPLE...LINK framing).
    fn span_ending_at(&self, top_offset: u32) -> Result<u32, VmError> {
        if top_offset < 4 {
            return Err(VmError::StackUnderflow { op: "span", sp: top_offset, requested: 4 });
        }
        let cell = Cell::from_bits(self.memory.read32(Segment::DataStack, top_offset - 4)?);
        Ok(match cell.decode_tag() {
            Some((Tag::Link, back_offset, _)) => back_offset as u32 + 1,
            _ => 1,
        })
    }

    /// The `k` topmost logical elements' `(start_offset, len_bytes)`, ordered
    /// oldest (bottom) to newest (top).
    fn top_spans(&self, k: usize) -> Result<Vec<(u32, u32)>, VmError> {
        let mut cursor = self.sp;
        let mut spans = Vec::with_capacity(k);
        for _ in 0..k {
            let span_cells = self.span_ending_at(cursor)?;
            let span_bytes = span_cells * 4;
            if cursor < span_bytes {
                return Err(VmError::StackUnderflow { op: "stack op", sp: cursor, requested: span_bytes });
            }
            let start = cursor - span_bytes;
            spans.push((start, span_bytes));
            cursor = start;
        }
        spans.reverse();
        Ok(spans)
    }

    fn reverse_range(&mut self, start: u32, end: u32) -> Result<(), VmError> {
        let mut lo = start;
        let mut hi = end - 4;
        while lo < hi {
            let a = self.memory.read32(Segment::DataStack, lo)?;
            let b = self.memory.read32(Segment::DataStack, hi)?;
            self.memory.write32(Segment::DataStack, lo, b)?;
            self.memory.write32(Segment::DataStack, hi, a)?;
            lo += 4;
            hi -= 4;
        }
        Ok(())
    }

    fn rotate_via_reversals(&mut self, spans: &[(u32, u32)], isolate: usize) -> Result<(), VmError> {
        let whole_start = spans[0].0;
        let whole_end = spans[spans.len() - 1].0 + spans[spans.len() - 1].1;
        let (iso_start, iso_len) = spans[isolate];
        let other_start = if isolate == 0 { spans[1].0 } else { whole_start };
        let other_end = if isolate == 0 { whole_end } else { spans[spans.len() - 2].0 + spans[spans.len() - 2].1 };

        self.reverse_range(iso_start, iso_start + iso_len)?;
        self.reverse_range(other_start, other_end)?;
        self.reverse_range(whole_start, whole_end)
    }

    /// `a b -> b a`.
    pub fn op_swap(&mut self) -> Result<(), VmError> {
        let spans = self.top_spans(2)?;
        self.rotate_via_reversals(&spans, 0)
    }

    /// `a b c -> b c a` (bring the third-from-top logical element to the top).
    pub fn op_rot(&mut self) -> Result<(), VmError> {
        let spans = self.top_spans(3)?;
        self.rotate_via_reversals(&spans, 0)
    }

    /// `a b c -> c a b` (send the top logical element to the bottom of the three).
    pub fn op_revrot(&mut self) -> Result<(), VmError> {
        let spans = self.top_spans(3)?;
        self.rotate_via_reversals(&spans, 2)
    }

    fn copy_span_to_top(&mut self, start: u32, len: u32) -> Result<(), VmError> {
        let capacity = self.memory.segment_len(Segment::DataStack);
        if self.sp + len > capacity {
            return Err(VmError::StackOverflow { op: "dup/over", sp: self.sp, capacity });
        }
        self.memory.copy_within(Segment::DataStack, start, Segment::DataStack, self.sp, len)?;
        for i in 0..len / 4 {
            let bits = self.memory.read32(Segment::DataStack, self.sp + i * 4)?;
            if let Some(child) = Cell::from_bits(bits).heap_block() {
                self.heap.increment_ref(&mut self.memory, child);
            }
        }
        self.sp += len;
        Ok(())
    }

    /// `a -> a a`.
    pub fn op_dup(&mut self) -> Result<(), VmError> {
        let spans = self.top_spans(1)?;
        let (start, len) = spans[0];
        self.copy_span_to_top(start, len)
    }

    /// `a b -> a b a`.
    pub fn op_over(&mut self) -> Result<(), VmError> {
        let spans = self.top_spans(2)?;
        let (start, len) = spans[0];
        self.copy_span_to_top(start, len)
    }

    /// `a ->` (discards the top logical element, decref'ing any heap
    /// pointers it carried).
    pub fn op_drop(&mut self) -> Result<(), VmError> {
        let spans = self.top_spans(1)?;
        let (start, len) = spans[0];
        for i in 0..len / 4 {
            let bits = self.memory.read32(Segment::DataStack, start + i * 4)?;
            let cell = Cell::from_bits(bits);
            if let Some(child) = cell.heap_block() {
                let tag = cell.decode_tag().map(|(t, _, _)| t).expect("heap cell decodes a Tag");
                self.heap.decrement_ref(&mut self.memory, child, tag);
            }
        }
        self.sp = start;
        Ok(())
    }
}

fn op_literal_number(vm: &mut Vm) -> Result<(), VmError> {
    let value = vm.fetch_f32()?;
    vm.push_data(Cell::from_number(value))
}

fn op_literal_string(vm: &mut Vm) -> Result<(), VmError> {
    let handle = vm.fetch_u16()?;
    vm.push_data(Cell::to_tagged_enum(Tag::String, handle, false))
}

fn op_exit(vm: &mut Vm) -> Result<(), VmError> {
    let bp_cell = vm.pop_return()?;
    let return_ip_cell = vm.pop_return()?;
    let (_, bp_value, _) = bp_cell
        .decode_tag()
        .ok_or_else(|| VmError::InvalidBytecode("Exit: malformed frame (BP)".into()))?;
    let (tag, ip_value, _) = return_ip_cell
        .decode_tag()
        .ok_or_else(|| VmError::InvalidBytecode("Exit: malformed frame (return IP)".into()))?;
    if tag != Tag::Code {
        return Err(VmError::TypeError { op: "Exit", tag: Some(tag.discriminant()) });
    }
    vm.bp = bp_value as u32;
    vm.ip = ip_value as u32;
    Ok(())
}

fn op_if_false_branch(vm: &mut Vm) -> Result<(), VmError> {
    let offset = vm.fetch_u16()? as i16;
    let cell = vm.pop_data()?;
    let falsy = cell.is_nil() || (cell.is_number() && cell.as_number() == 0.0);
    if falsy {
        vm.ip = (vm.ip as i64 + offset as i64) as u32;
    }
    Ok(())
}

fn op_branch_always(vm: &mut Vm) -> Result<(), VmError> {
    let offset = vm.fetch_u16()? as i16;
    vm.ip = (vm.ip as i64 + offset as i64) as u32;
    Ok(())
}

fn op_abort(vm: &mut Vm) -> Result<(), VmError> {
    vm.running = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::StringDigest;
    use tacit_core::SegmentLayout;

    fn fresh_vm() -> Vm {
        let layout = SegmentLayout {
            data_stack: 256,
            return_stack: 256,
            code: 256,
            digest: 256,
            heap: 4096,
        };
        Vm::new(Memory::new(layout), Box::new(StringDigest::new()))
    }

    #[test]
    fn dup_duplicates_a_scalar() {
        let mut vm = fresh_vm();
        vm.push_data(Cell::from_number(5.0)).unwrap();
        vm.op_dup().unwrap();
        assert_eq!(vm.pop_data().unwrap().as_number(), 5.0);
        assert_eq!(vm.pop_data().unwrap().as_number(), 5.0);
    }

    #[test]
    fn swap_exchanges_two_scalars() {
        let mut vm = fresh_vm();
        vm.push_data(Cell::from_number(1.0)).unwrap();
        vm.push_data(Cell::from_number(2.0)).unwrap();
        vm.op_swap().unwrap();
        assert_eq!(vm.pop_data().unwrap().as_number(), 1.0);
        assert_eq!(vm.pop_data().unwrap().as_number(), 2.0);
    }

    #[test]
    fn over_copies_the_second_element_to_the_top() {
        let mut vm = fresh_vm();
        vm.push_data(Cell::from_number(1.0)).unwrap();
        vm.push_data(Cell::from_number(2.0)).unwrap();
        vm.op_over().unwrap();
        assert_eq!(vm.pop_data().unwrap().as_number(), 1.0);
        assert_eq!(vm.pop_data().unwrap().as_number(), 2.0);
        assert_eq!(vm.pop_data().unwrap().as_number(), 1.0);
    }

    #[test]
    fn drop_discards_the_top_scalar() {
        let mut vm = fresh_vm();
        vm.push_data(Cell::from_number(1.0)).unwrap();
        vm.push_data(Cell::from_number(2.0)).unwrap();
        vm.op_drop().unwrap();
        assert_eq!(vm.pop_data().unwrap().as_number(), 1.0);
    }

    /// Scenario: stack `[(1 2) 3 4]` encoded as `[LIST:2, 1, 2, LINK:3, 3, 4]`;
    /// `rot` should produce `[3, 4, LIST:2, 1, 2, LINK:3]`.
    #[test]
    fn rot_moves_a_compound_whole_as_one_logical_element() {
        let mut vm = fresh_vm();
        vm.push_data(Cell::to_tagged_enum(Tag::List, 2, false)).unwrap();
        vm.push_data(Cell::from_number(1.0)).unwrap();
        vm.push_data(Cell::from_number(2.0)).unwrap();
        vm.push_data(Cell::to_tagged_enum(Tag::Link, 3, false)).unwrap();
        vm.push_data(Cell::from_number(3.0)).unwrap();
        vm.push_data(Cell::from_number(4.0)).unwrap();

        vm.op_rot().unwrap();

        assert_eq!(vm.sp(), 24);
        let stack = vm.get_stack_data();
        assert_eq!(stack[0].as_number(), 3.0);
        assert_eq!(stack[1].as_number(), 4.0);
        assert_eq!(stack[2].decode_tag().unwrap().0, Tag::List);
        assert_eq!(stack[3].as_number(), 1.0);
        assert_eq!(stack[4].as_number(), 2.0);
        assert_eq!(stack[5].decode_tag().unwrap().0, Tag::Link);
    }

    #[test]
    fn revrot_is_the_inverse_of_rot() {
        let mut vm = fresh_vm();
        vm.push_data(Cell::from_number(1.0)).unwrap();
        vm.push_data(Cell::from_number(2.0)).unwrap();
        vm.push_data(Cell::from_number(3.0)).unwrap();
        vm.op_rot().unwrap();
        vm.op_revrot().unwrap();
        assert_eq!(vm.pop_data().unwrap().as_number(), 3.0);
        assert_eq!(vm.pop_data().unwrap().as_number(), 2.0);
        assert_eq!(vm.pop_data().unwrap().as_number(), 1.0);
    }

    #[test]
    fn if_false_branch_skips_on_zero_or_nil() {
        let mut vm = fresh_vm();
        let code = [
            OP_IF_FALSE_BRANCH, 0, 5, // skip 5 bytes if falsy
            OP_LITERAL_NUMBER, 0, 0, 0, 0, // would push 0.0 (skipped)
            OP_ABORT,
        ];
        let (_, memory) = vm.heap_memory_mut();
        for (i, b) in code.iter().enumerate() {
            memory.write8(Segment::Code, i as u32, *b).unwrap();
        }
        vm.push_data(tacit_core::NIL).unwrap();
        vm.execute(0, None).unwrap();
        assert_eq!(vm.sp(), 0);
    }

    #[test]
    fn user_call_and_exit_round_trip_bp_and_ip() {
        let mut vm = fresh_vm();
        // function body at ip=10: just Exit.
        let (_, memory) = vm.heap_memory_mut();
        memory.write8(Segment::Code, 10, OP_EXIT).unwrap();
        let index = vm.define_function(10);
        // main: UserCall(index), Abort.
        let hi = 0x80 | ((index >> 7) as u8 & 0x7F);
        let lo = (index & 0x7F) as u8;
        let (_, memory) = vm.heap_memory_mut();
        memory.write8(Segment::Code, 0, hi).unwrap();
        memory.write8(Segment::Code, 1, lo).unwrap();
        memory.write8(Segment::Code, 2, OP_ABORT).unwrap();

        vm.execute(0, None).unwrap();
        assert_eq!(vm.ip(), 3);
        assert_eq!(vm.rsp(), 0);
    }
}
