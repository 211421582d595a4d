//! NaN-boxed tagged values.
//!
//! Every cell is a 32-bit IEEE-754 float. The negative quiet/signaling-NaN
//! half of the float space (sign bit set, exponent all ones) is reserved for
//! tagged values; everything else — finite floats, infinities, and the
//! canonical positive NaN — is a plain number.
//!
//! ```text
//! bit:   31   30      23 22            17 16   15              0
//!      ┌────┬──────────┬────────────────┬─────┬──────────────────┐
//!      │sign│ exponent │      tag (6)   │meta │     value (16)   │
//!      └────┴──────────┴────────────────┴─────┴──────────────────┘
//!        1      =0xFF       mantissa bits 22..17   bit 16   bits 15..0
//! ```
//!
//! Reads and writes are always raw bit-pattern operations
//! (`f32::to_bits`/`from_bits`), never a widening float conversion — the
//! latter can canonicalize signalling NaNs and silently corrupt a payload.

const TAGGED_SIGN: u32 = 0x8000_0000;
const EXP_ALL_ONES: u32 = 0x7F80_0000;
const TAG_SHIFT: u32 = 17;
const TAG_MASK: u32 = 0x3F;
const META_SHIFT: u32 = 16;
const VALUE_MASK: u32 = 0xFFFF;

/// A single 32-bit cell: either a number or a NaN-boxed tagged value.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Cell(u32);

impl Cell {
    /// Wrap a raw bit pattern. Prefer [`Cell::from_number`] / [`to_tagged`]
    /// for anything that isn't already a known-good bit pattern.
    pub const fn from_bits(bits: u32) -> Self {
        Cell(bits)
    }

    pub const fn to_bits(self) -> u32 {
        self.0
    }

    pub fn from_number(value: f32) -> Self {
        Cell(value.to_bits())
    }

    /// Panics-free float view; meaningless if [`Cell::is_number`] is false
    /// (the bit pattern is still a valid `f32`, just not the number the
    /// caller probably wants — it decodes to some NaN).
    pub fn as_number(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub fn is_number(self) -> bool {
        !is_tagged_bits(self.0)
    }

    pub fn is_tagged(self) -> bool {
        is_tagged_bits(self.0)
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Cell {}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match from_tagged(*self) {
            Ok((tag, value, meta)) => write!(f, "Tagged(tag={tag}, value={value}, meta={meta})"),
            Err(_) => write!(f, "Number({})", self.as_number()),
        }
    }
}

fn is_tagged_bits(bits: u32) -> bool {
    bits & TAGGED_SIGN != 0 && bits & EXP_ALL_ONES == EXP_ALL_ONES
}

/// A cell is not a tagged value (it's the bit pattern of a plain number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cell is not a tagged value")]
pub struct NotTagged;

/// Encode `(tag, value, meta)` into a cell. `tag` is truncated to 6 bits and
/// `value` to 16 bits; callers that need validated tags should go through
/// [`Tag`] and [`Cell::to_tagged_enum`] instead.
pub fn to_tagged(tag: u8, value: u16, meta: bool) -> Cell {
    let bits = TAGGED_SIGN
        | EXP_ALL_ONES
        | (((tag as u32) & TAG_MASK) << TAG_SHIFT)
        | ((meta as u32) << META_SHIFT)
        | (value as u32 & VALUE_MASK);
    Cell(bits)
}

/// Decode a cell into `(tag, value, meta)`. Fails if the cell is a plain
/// number rather than a NaN-boxed tagged value.
pub fn from_tagged(cell: Cell) -> Result<(u8, u16, bool), NotTagged> {
    if !is_tagged_bits(cell.0) {
        return Err(NotTagged);
    }
    let tag = ((cell.0 >> TAG_SHIFT) & TAG_MASK) as u8;
    let meta = (cell.0 >> META_SHIFT) & 1 != 0;
    let value = (cell.0 & VALUE_MASK) as u16;
    Ok((tag, value, meta))
}

/// The canonical NaN produced by float operations whose result is undefined
/// (e.g. `0.0 / 0.0`). Lives in the positive-sign NaN space, so it never
/// collides with a tagged cell.
pub const CANONICAL_NAN: Cell = Cell(0x7FC0_0000);

/// The named tag vocabulary. Discriminant `0` (`NUMBER`) is intentionally
/// absent: the spec reserves it as "not used via tag" since plain numbers
/// never carry a `Tag` at all, and `Cell::is_number`/`is_tagged` already draw
/// that line through the sign bit, not through any tag discriminant — so
/// every value here can round-trip through [`to_tagged`]/[`from_tagged`]
/// without needing the discriminant space to double as a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Integer = 1,
    String = 2,
    Code = 3,
    Builtin = 4,
    Local = 5,
    DataRef = 6,
    Sentinel = 7,
    List = 8,
    Link = 9,
    Tuple = 10,
    Nil = 11,
    HeapVector = 12,
    HeapSequence = 13,
    HeapDict = 14,
}

impl Tag {
    pub const fn discriminant(self) -> u8 {
        self as u8
    }

    pub const fn from_discriminant(d: u8) -> Option<Tag> {
        Some(match d {
            1 => Tag::Integer,
            2 => Tag::String,
            3 => Tag::Code,
            4 => Tag::Builtin,
            5 => Tag::Local,
            6 => Tag::DataRef,
            7 => Tag::Sentinel,
            8 => Tag::List,
            9 => Tag::Link,
            10 => Tag::Tuple,
            11 => Tag::Nil,
            12 => Tag::HeapVector,
            13 => Tag::HeapSequence,
            14 => Tag::HeapDict,
            _ => return None,
        })
    }

    pub const fn is_heap_allocated(self) -> bool {
        matches!(self, Tag::HeapVector | Tag::HeapSequence | Tag::HeapDict)
    }
}

impl Cell {
    /// Encode a value of a known [`Tag`].
    pub fn to_tagged_enum(tag: Tag, value: u16, meta: bool) -> Cell {
        to_tagged(tag.discriminant(), value, meta)
    }

    /// Decode into a known [`Tag`]; `None` if the cell isn't tagged or its
    /// discriminant isn't one of the named tags (e.g. `0`).
    pub fn decode_tag(self) -> Option<(Tag, u16, bool)> {
        let (tag, value, meta) = from_tagged(self).ok()?;
        Tag::from_discriminant(tag).map(|t| (t, value, meta))
    }
}

/// The singleton NIL value.
pub const NIL: Cell = Cell(
    0x8000_0000 | 0x7F80_0000 | ((Tag::Nil as u32) << TAG_SHIFT),
);

/// Sentinel used for "no block"/"no next" throughout the heap.
pub const INVALID_BLOCK: u16 = 0xFFFF;

impl Cell {
    pub fn is_nil(self) -> bool {
        self.0 == NIL.0
    }

    /// A `DATA_REF` or any `HEAP.*` cell — i.e. something that names a live
    /// heap block.
    pub fn is_ref(self) -> bool {
        matches!(
            self.decode_tag(),
            Some((Tag::DataRef | Tag::HeapVector | Tag::HeapSequence | Tag::HeapDict, _, _))
        )
    }

    pub fn is_list(self) -> bool {
        matches!(self.decode_tag(), Some((Tag::List | Tag::Tuple, _, _)))
    }

    pub fn is_heap_allocated(self) -> bool {
        matches!(self.decode_tag(), Some((t, _, _)) if t.is_heap_allocated())
    }

    /// Block index carried by a `HEAP.*` cell, if any.
    pub fn heap_block(self) -> Option<u16> {
        match self.decode_tag() {
            Some((t, value, _)) if t.is_heap_allocated() => Some(value),
            _ => None,
        }
    }
}

/// `LIST`/`TUPLE` header payload: the count of cells that follow.
pub fn get_list_length(header: Cell) -> Option<u16> {
    match header.decode_tag() {
        Some((Tag::List | Tag::Tuple, n, _)) => Some(n),
        _ => None,
    }
}

/// Build a `DATA_REF` cell pointing at `cell_index` in the heap/dictionary
/// segment.
pub fn create_data_ref(cell_index: u16) -> Cell {
    Cell::to_tagged_enum(Tag::DataRef, cell_index, false)
}
