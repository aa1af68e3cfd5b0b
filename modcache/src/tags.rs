//! The 256-slot tag registry.
//!
//! Slot 0 is the NULL tag. The reserved range near the top of the byte
//! holds the structural tags the codec dispatches on; everything below it
//! is available for well-known values that encode in a single byte. A
//! second, larger symbol list encodes in two bytes via [`Tag::CommonSym`].
//!
//! The registry is built once per session from the runtime's well-known
//! set and never mutated afterwards. Initialization order is fixed:
//! structural tags first (their slot numbers are part of the file format),
//! then well-known values, then the two common-symbol tables. Save and
//! load must build identical registries or single-byte encodings would
//! change meaning between the two sides.

use std::collections::HashMap;

use runtime::{Runtime, ValueId};

/// The NULL tag: a single zero byte is a null reference.
pub const TAG_NULL: u8 = 0;

/// First structural tag; registry value slots are `1..FIRST_STRUCTURAL`.
pub const FIRST_STRUCTURAL: u8 = Tag::Datatype as u8;

/// Structural tags, occupying the top of the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Datatype = 0xDD,
    Tvar,
    UnionAll,
    Method,
    MethodInstance,
    CodeInstance,
    Module,
    Array,
    Array1d,
    SVec,
    LongSVec,
    Symbol,
    LongSymbol,
    String,
    Int32,
    Int64,
    UInt8,
    ShortInt32,
    ShortInt64,
    ShorterInt64,
    CommonSym,
    Backref,
    ShortBackref,
    Core,
    Base,
    Singleton,
    BitsTypename,
    CNull,
    ShortGeneral,
    General,
    Typename,
    MethodTable,
    IdDict,
    BigNum,
    Ptr,
}

const _: () = assert!(Tag::Ptr as usize == 0xFF);

impl Tag {
    /// Decode a structural tag byte.
    #[inline(always)]
    pub fn from_u8(b: u8) -> Option<Tag> {
        if b >= FIRST_STRUCTURAL {
            // The enum is dense from FIRST_STRUCTURAL to 0xFF.
            Some(unsafe { core::mem::transmute::<u8, Tag>(b) })
        } else {
            None
        }
    }
}

/// Symbols common enough to earn a single-byte encoding.
const FREQUENT_SYMBOLS: &[&str] = &[
    "call", "invoke", "getfield", "setfield!", "tuple", "getindex",
    "setindex!", "convert", "length", "iterate", "==", "+", "-", "*",
    "push!", "getproperty", "setproperty!", "isa", "typeof", "size",
];

/// Second tier: two-byte encodings via [`Tag::CommonSym`].
const COMMON_SYMBOLS: &[&str] = &[
    "map", "filter", "reduce", "promote", "similar", "copy", "eltype",
    "ndims", "axes", "first", "last", "isempty", "haskey", "get", "merge",
    "keys", "values", "show", "print", "println", "string", "nameof",
    "parent", "names", "eachindex", "zero", "one", "min", "max", "abs",
    "in", "hash", "isequal", "<", "<=", ">", ">=", "!=", "!", "&&", "||",
];

/// Bidirectional mapping between well-known values and tag bytes.
pub struct TagRegistry {
    by_value: HashMap<ValueId, u8, ahash::RandomState>,
    values: Vec<Option<ValueId>>,
    common_by_value: HashMap<ValueId, u8, ahash::RandomState>,
    common_syms: Vec<ValueId>,
}

impl TagRegistry {
    /// Build the registry for a bootstrapped runtime. Interning the symbol
    /// lists is idempotent, so save and load construct identical tables.
    pub fn new(rt: &mut Runtime) -> Self {
        let mut reg = Self {
            by_value: HashMap::default(),
            values: vec![None; FIRST_STRUCTURAL as usize],
            common_by_value: HashMap::default(),
            common_syms: Vec::with_capacity(COMMON_SYMBOLS.len()),
        };

        let wk = rt.well_known();
        let mut well_known: Vec<ValueId> = vec![
            wk.empty_svec,
            wk.empty_string,
            wk.nothing,
            wk.true_val,
            wk.false_val,
            wk.any_type,
            wk.nothing_type,
            wk.bool_type,
            wk.int64_type,
            wk.int32_type,
            wk.uint8_type,
            wk.float64_type,
            wk.string_type,
            wk.bigint_type,
            wk.tuple_wrapper,
            wk.ptr_wrapper,
            wk.array_wrapper,
        ];
        well_known.extend_from_slice(&wk.int64_boxes);
        well_known.extend_from_slice(&wk.int32_boxes);
        for name in FREQUENT_SYMBOLS {
            let sym = rt.intern(name);
            well_known.push(sym);
        }

        let mut slot = 1u8;
        for v in well_known {
            assert!(slot < FIRST_STRUCTURAL, "tag registry overflow");
            reg.values[slot as usize] = Some(v);
            reg.by_value.entry(v).or_insert(slot);
            slot += 1;
        }

        for (i, name) in COMMON_SYMBOLS.iter().enumerate() {
            let sym = rt.intern(name);
            reg.common_syms.push(sym);
            reg.common_by_value.entry(sym).or_insert(i as u8);
        }

        reg
    }

    /// Single-byte slot for a well-known value, if it has one.
    #[inline(always)]
    pub fn lookup_tag(&self, v: ValueId) -> Option<u8> {
        self.by_value.get(&v).copied()
    }

    /// The value in a registry slot.
    #[inline(always)]
    pub fn resolve_tag(&self, tag: u8) -> Option<ValueId> {
        self.values.get(tag as usize).copied().flatten()
    }

    /// Index in the second symbol table.
    #[inline(always)]
    pub fn lookup_common_symbol(&self, v: ValueId) -> Option<u8> {
        self.common_by_value.get(&v).copied()
    }

    #[inline(always)]
    pub fn resolve_common_symbol(&self, idx: u8) -> Option<ValueId> {
        self.common_syms.get(idx as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_tags_fill_the_top_of_the_byte() {
        assert_eq!(Tag::from_u8(0xDC), None);
        assert_eq!(Tag::from_u8(FIRST_STRUCTURAL), Some(Tag::Datatype));
        assert_eq!(Tag::from_u8(0xFF), Some(Tag::Ptr));
    }

    #[test]
    fn registry_round_trips_well_known_values() {
        let mut rt = runtime::bootstrap();
        let reg = TagRegistry::new(&mut rt);
        let wk = rt.well_known();
        for v in [wk.nothing, wk.true_val, wk.any_type, wk.int64_boxes[7]] {
            let tag = reg.lookup_tag(v).expect("well-known value untagged");
            assert!(tag < FIRST_STRUCTURAL && tag != TAG_NULL);
            assert_eq!(reg.resolve_tag(tag), Some(v));
        }
    }

    #[test]
    fn two_registries_agree() {
        let mut rt = runtime::bootstrap();
        let a = TagRegistry::new(&mut rt);
        let b = TagRegistry::new(&mut rt);
        for slot in 0..FIRST_STRUCTURAL {
            assert_eq!(a.resolve_tag(slot), b.resolve_tag(slot));
        }
        let sym = rt.intern("map");
        assert_eq!(a.lookup_common_symbol(sym), b.lookup_common_symbol(sym));
    }

    #[test]
    fn common_symbols_use_the_second_table() {
        let mut rt = runtime::bootstrap();
        let reg = TagRegistry::new(&mut rt);
        let sym = rt.intern("filter");
        assert_eq!(reg.lookup_tag(sym), None);
        let idx = reg.lookup_common_symbol(sym).unwrap();
        assert_eq!(reg.resolve_common_symbol(idx), Some(sym));
    }
}
