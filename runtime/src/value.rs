use crate::method::{CodeInstance, Method, MethodInstance, MethodTable};
use crate::module::Module;
use crate::types::{DataType, TypeName, TypeVar, UnionAll};

/// Index of a value in the runtime arena.
///
/// All heap entities are arena-allocated and referred to by this 32-bit id.
/// Identity comparisons, backreference bookkeeping, and the post-load
/// uniquing rewrite all operate on ids, never on addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ValueId(u32);

impl ValueId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u32)
    }
}

impl core::fmt::Debug for ValueId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One cell of the runtime arena.
///
/// The set of kinds is closed: the cache format enumerates exactly these
/// variants, so adding one is a file-format change.
pub enum Value {
    /// Interned identifier. One arena cell per distinct name.
    Symbol(Box<str>),
    /// Immutable value tuple ("simple vector").
    SVec(Vec<Option<ValueId>>),
    /// Heap string.
    Str(String),
    /// Boxed signed 64-bit integer.
    Int64(i64),
    /// Boxed signed 32-bit integer.
    Int32(i32),
    /// Boxed unsigned byte.
    UInt8(u8),
    /// Arbitrary-precision integer: GMP-style sign+size word and raw limbs.
    BigNum(BigNum),
    /// Typed native pointer. `addr == 0` is the C_NULL of its type.
    Ptr { ty: ValueId, addr: u64 },
    /// N-dimensional array.
    Array(ArrayVal),
    /// Module with its binding table.
    Module(Module),
    /// Primary type instance.
    DataType(DataType),
    /// Identity record shared by all instantiations of a primary type.
    TypeName(TypeName),
    /// Type variable with bounds.
    TypeVar(TypeVar),
    /// Iterated union over a type variable.
    UnionAll(UnionAll),
    /// A polymorphic function definition.
    Method(Method),
    /// A method specialized on concrete argument types.
    MethodInstance(MethodInstance),
    /// A compiled result with world-age validity.
    CodeInstance(CodeInstance),
    /// Dispatch table owned by a type name or module binding.
    MethodTable(MethodTable),
    /// Identity-keyed dictionary. Needs rehashing after a load because key
    /// identities change during uniquing.
    IdDict(IdDict),
    /// Generic struct instance laid out per its type's layout descriptor.
    Struct(StructVal),
    /// Live task. Exists only at runtime; the codec refuses it.
    Task,
    /// Live opaque closure. Exists only at runtime; the codec refuses it.
    OpaqueClosure,
    /// A placeholder that was replaced by a canonical entity during
    /// reconciliation. Reaching one afterwards is a bug; the code carries
    /// which pass poisoned it.
    Poisoned(u32),
}

/// Arbitrary-precision integer payload.
///
/// `size` follows the GMP convention: magnitude limb count, negative for
/// negative numbers, zero for zero. Limbs are stored little-endian in
/// 8-byte groups.
pub struct BigNum {
    pub size: i32,
    pub limbs: Vec<u8>,
}

/// One field of a generic struct: either an inline bit pattern or a
/// reference slot.
#[derive(Clone)]
pub enum FieldVal {
    Ref(Option<ValueId>),
    Bits(Vec<u8>),
}

/// A generic struct instance.
///
/// The field shapes must agree with the layout descriptor of `ty`. A
/// zero-field instance of a non-mutable type is that type's singleton.
pub struct StructVal {
    pub ty: ValueId,
    pub fields: Vec<FieldVal>,
}

/// Array payload, split by element representation.
#[derive(Clone)]
pub enum ArrayData {
    /// Every element is a reference slot.
    Values(Vec<Option<ValueId>>),
    /// Elements are inline structs that contain reference fields.
    Inline(Vec<Vec<FieldVal>>),
    /// Plain bits, `elsize` bytes per element.
    Bytes { elsize: u16, bytes: Vec<u8> },
    /// Bits-union elements: payload bytes plus one discriminator byte per
    /// element.
    BitsUnion { elsize: u16, bytes: Vec<u8>, tags: Vec<u8> },
}

/// An N-dimensional array cell.
pub struct ArrayVal {
    /// The concrete array type (carries the element type as its parameter).
    pub ty: ValueId,
    pub elem_ty: ValueId,
    pub dims: Vec<u64>,
    pub data: ArrayData,
}

impl ArrayVal {
    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.dims.iter().product()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identity-keyed dictionary payload. Lookup is by id equality; after
/// uniquing rewrites ids the pair list must be rehashed (kind-1 reinit).
pub struct IdDict {
    pub pairs: Vec<(ValueId, ValueId)>,
}

/// Visit every reference slot of `v` exactly once.
///
/// This is the single traversal the uniquing rewrite relies on: any field
/// that can hold a [`ValueId`] must be visited here, or stale placeholder
/// ids survive reconciliation.
pub fn for_each_ref(v: &mut Value, f: &mut dyn FnMut(&mut ValueId)) {
    #[inline]
    fn opt(slot: &mut Option<ValueId>, f: &mut dyn FnMut(&mut ValueId)) {
        if let Some(id) = slot.as_mut() {
            f(id);
        }
    }

    match v {
        Value::Symbol(_)
        | Value::Str(_)
        | Value::Int64(_)
        | Value::Int32(_)
        | Value::UInt8(_)
        | Value::BigNum(_)
        | Value::Task
        | Value::OpaqueClosure
        | Value::Poisoned(_) => {}

        Value::SVec(elems) => {
            for e in elems {
                opt(e, f);
            }
        }

        Value::Ptr { ty, .. } => f(ty),

        Value::Array(ar) => {
            f(&mut ar.ty);
            f(&mut ar.elem_ty);
            match &mut ar.data {
                ArrayData::Values(elems) => {
                    for e in elems {
                        opt(e, f);
                    }
                }
                ArrayData::Inline(elems) => {
                    for fields in elems {
                        for fv in fields {
                            if let FieldVal::Ref(slot) = fv {
                                opt(slot, f);
                            }
                        }
                    }
                }
                ArrayData::Bytes { .. } | ArrayData::BitsUnion { .. } => {}
            }
        }

        Value::Module(m) => {
            f(&mut m.name);
            opt(&mut m.parent, f);
            for (sym, b) in &mut m.bindings {
                f(sym);
                f(&mut b.name);
                opt(&mut b.value, f);
                opt(&mut b.globalref, f);
                opt(&mut b.owner, f);
                opt(&mut b.ty, f);
            }
            for u in &mut m.usings {
                f(u);
            }
        }

        Value::DataType(dt) => {
            opt(&mut dt.name, f);
            f(&mut dt.parameters);
            opt(&mut dt.supertype, f);
            opt(&mut dt.field_types, f);
            opt(&mut dt.instance, f);
        }

        Value::TypeName(tn) => {
            f(&mut tn.module);
            f(&mut tn.name);
            f(&mut tn.field_names);
            f(&mut tn.wrapper);
            opt(&mut tn.method_table, f);
        }

        Value::TypeVar(tv) => {
            f(&mut tv.name);
            opt(&mut tv.lb, f);
            opt(&mut tv.ub, f);
        }

        Value::UnionAll(ua) => {
            f(&mut ua.var);
            f(&mut ua.body);
        }

        Value::Method(m) => {
            f(&mut m.sig);
            f(&mut m.module);
            opt(&mut m.external_mt, f);
            for s in &mut m.specializations {
                f(s);
            }
            f(&mut m.name);
            f(&mut m.file);
            opt(&mut m.slot_syms, f);
            for r in &mut m.roots {
                f(r);
            }
            opt(&mut m.source, f);
            opt(&mut m.unspecialized, f);
            opt(&mut m.generator, f);
            opt(&mut m.invokes, f);
            opt(&mut m.recursion_relation, f);
        }

        Value::MethodInstance(mi) => {
            f(&mut mi.def);
            f(&mut mi.spec_types);
            opt(&mut mi.sparam_vals, f);
            opt(&mut mi.uninferred, f);
            for b in &mut mi.backedges {
                f(b);
            }
            opt(&mut mi.callbacks, f);
            opt(&mut mi.cache, f);
        }

        Value::CodeInstance(ci) => {
            f(&mut ci.def);
            opt(&mut ci.inferred, f);
            f(&mut ci.rettype);
            opt(&mut ci.rettype_const, f);
            opt(&mut ci.argescapes, f);
            opt(&mut ci.next, f);
        }

        Value::MethodTable(mt) => {
            f(&mut mt.name);
            f(&mut mt.module);
            for e in &mut mt.entries {
                f(&mut e.method);
                opt(&mut e.simple_sig, f);
            }
            for (sig, caller) in &mut mt.backedges {
                f(sig);
                f(caller);
            }
        }

        Value::IdDict(d) => {
            for (k, val) in &mut d.pairs {
                f(k);
                f(val);
            }
        }

        Value::Struct(sv) => {
            f(&mut sv.ty);
            for fv in &mut sv.fields {
                if let FieldVal::Ref(slot) = fv {
                    opt(slot, f);
                }
            }
        }
    }
}

impl Value {
    /// Short kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Symbol(_) => "symbol",
            Value::SVec(_) => "svec",
            Value::Str(_) => "string",
            Value::Int64(_) => "int64",
            Value::Int32(_) => "int32",
            Value::UInt8(_) => "uint8",
            Value::BigNum(_) => "bignum",
            Value::Ptr { .. } => "ptr",
            Value::Array(_) => "array",
            Value::Module(_) => "module",
            Value::DataType(_) => "datatype",
            Value::TypeName(_) => "typename",
            Value::TypeVar(_) => "typevar",
            Value::UnionAll(_) => "unionall",
            Value::Method(_) => "method",
            Value::MethodInstance(_) => "method_instance",
            Value::CodeInstance(_) => "code_instance",
            Value::MethodTable(_) => "method_table",
            Value::IdDict(_) => "iddict",
            Value::Struct(_) => "struct",
            Value::Task => "task",
            Value::OpaqueClosure => "opaque_closure",
            Value::Poisoned(_) => "poisoned",
        }
    }
}
