use bitflags::bitflags;

use crate::ValueId;

/// Memory-semantics flags of a [`DataType`].
///
/// The pack must match the on-disk bitfield bit for bit, so this is a
/// transparent wrapper rather than a generated flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TypeFlags(pub u8);

impl TypeFlags {
    pub const NONE: Self = Self(0);
    /// At least one parameter is a free type variable.
    pub const HAS_FREE_TYPEVARS: Self = Self(1 << 0);
    /// Fully instantiated: values of exactly this type can exist.
    pub const CONCRETE: Self = Self(1 << 1);
    /// A tuple usable directly as a dispatch key.
    pub const DISPATCH_TUPLE: Self = Self(1 << 2);
    /// Plain bits: no reference fields anywhere.
    pub const BITS: Self = Self(1 << 3);
    /// All-zero bytes are a valid instance.
    pub const ZERO_INIT: Self = Self(1 << 4);
    pub const HAS_CONCRETE_SUBTYPE: Self = Self(1 << 5);
    /// Cached by structural hash rather than by identity.
    pub const CACHED_BY_HASH: Self = Self(1 << 6);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }
}

/// Field shape within a [`Layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `n` inline bytes.
    Bits(u32),
    /// One reference slot.
    Ref,
}

/// Field layout of a concrete type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Total instance size in bytes (reference slots count 8).
    pub size: u32,
    /// Number of reference slots.
    pub npointers: u32,
    /// Field index of the first reference slot, or -1 when none.
    pub first_ptr: i32,
    pub fields: Vec<FieldKind>,
}

impl Layout {
    /// Build a layout from field kinds, computing the derived counters.
    pub fn new(fields: Vec<FieldKind>) -> Self {
        let mut size = 0u32;
        let mut npointers = 0u32;
        let mut first_ptr = -1i32;
        for (i, fk) in fields.iter().enumerate() {
            match fk {
                FieldKind::Bits(n) => size += n,
                FieldKind::Ref => {
                    size += 8;
                    npointers += 1;
                    if first_ptr < 0 {
                        first_ptr = i as i32;
                    }
                }
            }
        }
        Self { size, npointers, first_ptr, fields }
    }

    #[inline(always)]
    pub fn nfields(&self) -> u32 {
        self.fields.len() as u32
    }
}

/// Layout reference stored on a type: either a private layout or one of
/// three well-known shared layouts that encode as a single byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutDesc {
    Custom(Layout),
    /// The layout every array type shares.
    ArrayLike,
    /// The empty layout of singleton types.
    NothingLike,
    /// The one-word bits layout of native pointer types.
    PointerLike,
}

/// A primary type instance.
///
/// Two instances with the same name and parameters are the same type;
/// the runtime's type cache enforces that after reconciliation.
pub struct DataType {
    /// The identity record, shared by all instantiations. `None` only
    /// while a cell is under construction.
    pub name: Option<ValueId>,
    /// SVec of types / type vars / bits values.
    pub parameters: ValueId,
    pub supertype: Option<ValueId>,
    /// SVec of field types, `None` for opaque/bits types.
    pub field_types: Option<ValueId>,
    /// The singleton instance, for zero-field immutable concrete types.
    pub instance: Option<ValueId>,
    pub layout: Option<LayoutDesc>,
    pub size: u32,
    /// Structural hash, stable across sessions.
    pub hash: u32,
    pub flags: TypeFlags,
}

impl DataType {
    #[inline(always)]
    pub fn is_concrete(&self) -> bool {
        self.flags.contains(TypeFlags::CONCRETE)
    }

    #[inline(always)]
    pub fn has_free_typevars(&self) -> bool {
        self.flags.contains(TypeFlags::HAS_FREE_TYPEVARS)
    }
}

bitflags! {
    /// Flags on a [`TypeName`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeNameFlags: u8 {
        const ABSTRACT = 1 << 0;
        const MUTABLE = 1 << 1;
        const MAY_INLINE_ALLOC = 1 << 2;
        /// Registered by an embedder; instances cannot be serialized.
        const FOREIGN = 1 << 3;
    }
}

/// The identity record of a primary type.
pub struct TypeName {
    pub module: ValueId,
    /// Symbol.
    pub name: ValueId,
    /// SVec of field-name symbols.
    pub field_names: ValueId,
    /// The primary definition: the full union-all wrapper for parametric
    /// types, the sole instantiation otherwise.
    pub wrapper: ValueId,
    pub method_table: Option<ValueId>,
    /// Content hash, stable across sessions.
    pub hash: u64,
    pub flags: TypeNameFlags,
    pub max_methods: u8,
    pub n_uninitialized: u16,
    /// Per-field atomic bitmap, one u32 per 32 fields; empty when none.
    pub atomic_fields: Vec<u32>,
    /// Per-field const bitmap, same shape.
    pub const_fields: Vec<u32>,
}

impl TypeName {
    #[inline(always)]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(TypeNameFlags::ABSTRACT)
    }

    #[inline(always)]
    pub fn is_mutable(&self) -> bool {
        self.flags.contains(TypeNameFlags::MUTABLE)
    }

    #[inline(always)]
    pub fn is_foreign(&self) -> bool {
        self.flags.contains(TypeNameFlags::FOREIGN)
    }
}

/// A type variable with its bounds.
pub struct TypeVar {
    /// Symbol.
    pub name: ValueId,
    pub lb: Option<ValueId>,
    pub ub: Option<ValueId>,
}

/// `UnionAll var. body` — the wrapper form of a parametric primary type.
pub struct UnionAll {
    pub var: ValueId,
    pub body: ValueId,
}
