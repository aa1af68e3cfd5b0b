//! Read side of the value codec.
//!
//! Every composite reader reserves its backref slot before touching its
//! subvalues, so cyclic references resolve to the enclosing parent. The
//! reservation points mirror the write side's registration points exactly.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use runtime::{
    ArrayData, ArrayVal, BigNum, Binding, BindingFlags, CodeInstance, DataType, FieldKind,
    FieldVal, IdDict, Layout, LayoutDesc, Method, MethodInstance, MethodTable,
    MethodTableEntry, Module, Runtime, StructVal, TypeFlags, TypeName, TypeNameFlags, TypeVar,
    UnionAll, Value, ValueId, MAX_WORLD,
};

use crate::backref::{FlagRef, ReadBackrefs};
use crate::error::RestoreError;
use crate::ser::{METHOD_EXTERNAL_MT, METHOD_HAS_NEW_ROOTS, METHOD_INTERNAL};
use crate::stream::{
    read_bytes, read_i32, read_i64, read_u16, read_u32, read_u64, read_u8,
};
use crate::tags::{Tag, TagRegistry, FIRST_STRUCTURAL, TAG_NULL};

/// Where the caller will store the value being read. Flagged references
/// record their owner here so reconciliation can rewrite them.
#[derive(Clone, Copy)]
pub(crate) enum Dest {
    /// No storage location (a transient read).
    None,
    /// Suppressed: the referenced entity's own rewrite covers this read.
    Skip,
    /// The value lands in a reference slot of this cell.
    Owner(ValueId),
}

impl Dest {
    fn owner(self) -> Option<ValueId> {
        match self {
            Dest::Owner(o) => Some(o),
            _ => None,
        }
    }
}

/// Transient state of one restore call.
pub(crate) struct LoadSession<'rt> {
    pub rt: &'rt mut Runtime,
    pub registry: TagRegistry,
    pub backrefs: ReadBackrefs,
    pub flagrefs: Vec<FlagRef>,
    /// Uniquing candidates and their resolved canonical entities.
    pub uniquing: HashMap<ValueId, Option<ValueId>, ahash::RandomState>,
    /// method → (worklist key, new roots) awaiting the copy-roots pass.
    pub queued_method_roots: HashMap<ValueId, (u64, Vec<ValueId>), ahash::RandomState>,
    /// Code instances whose world range may be opened after verification.
    pub new_ci_validate: HashSet<ValueId, ahash::RandomState>,
    /// The world reserved for this load.
    pub world: u64,
    pub loaded_modules: Vec<ValueId>,
}

fn corrupt(what: &'static str) -> RestoreError {
    RestoreError::Corrupt(what)
}

fn read_len(r: &mut dyn Read) -> Result<usize, RestoreError> {
    let n = read_i32(r)?;
    usize::try_from(n).map_err(|_| corrupt("negative length"))
}

impl<'rt> LoadSession<'rt> {
    pub fn new(rt: &'rt mut Runtime, loaded_modules: Vec<ValueId>, world: u64) -> Self {
        let registry = TagRegistry::new(rt);
        let mut backrefs = ReadBackrefs::new();
        // position 0 is always the main module
        backrefs.push(rt.well_known().main_module);
        Self {
            rt,
            registry,
            backrefs,
            flagrefs: Vec::new(),
            uniquing: HashMap::default(),
            queued_method_roots: HashMap::default(),
            new_ci_validate: HashSet::default(),
            world,
            loaded_modules,
        }
    }

    pub fn deserialize_value(
        &mut self,
        r: &mut dyn Read,
        dest: Dest,
    ) -> Result<Option<ValueId>, RestoreError> {
        let tag = read_u8(r)?;
        self.deserialize_tagged(r, tag, dest)
    }

    pub(crate) fn require(
        &mut self,
        r: &mut dyn Read,
        dest: Dest,
    ) -> Result<ValueId, RestoreError> {
        self.deserialize_value(r, dest)?
            .ok_or_else(|| corrupt("unexpected null value"))
    }

    fn deserialize_tagged(
        &mut self,
        r: &mut dyn Read,
        tag: u8,
        dest: Dest,
    ) -> Result<Option<ValueId>, RestoreError> {
        if tag == TAG_NULL {
            return Ok(None);
        }
        if tag < FIRST_STRUCTURAL {
            return self
                .registry
                .resolve_tag(tag)
                .map(Some)
                .ok_or_else(|| corrupt("unassigned registry tag"));
        }
        let t = Tag::from_u8(tag).expect("tag in structural range");
        match t {
            Tag::Backref | Tag::ShortBackref => {
                let encoded = if t == Tag::Backref {
                    read_i32(r)? as u32
                } else {
                    read_u16(r)? as u32
                };
                let flagged = encoded & 1 == 1;
                let pos = (encoded >> 1) as usize;
                let bp = self
                    .backrefs
                    .get(pos)
                    .ok_or_else(|| corrupt("backref to an unfilled slot"))?;
                if flagged {
                    if let Dest::Owner(owner) = dest {
                        self.flagrefs.push(FlagRef {
                            owner: Some(owner),
                            index: -1,
                        });
                    }
                }
                Ok(Some(bp))
            }

            Tag::CommonSym => {
                let idx = read_u8(r)?;
                self.registry
                    .resolve_common_symbol(idx)
                    .map(Some)
                    .ok_or_else(|| corrupt("unassigned common-symbol index"))
            }

            Tag::SVec | Tag::LongSVec => {
                let len = if t == Tag::SVec {
                    read_u8(r)? as usize
                } else {
                    read_len(r)?
                };
                let sv = self.rt.alloc(Value::SVec(vec![None; len]));
                self.backrefs.push(sv);
                for i in 0..len {
                    let elem = self.deserialize_value(r, Dest::Owner(sv))?;
                    match self.rt.get_mut(sv) {
                        Value::SVec(elems) => elems[i] = elem,
                        _ => unreachable!(),
                    }
                }
                Ok(Some(sv))
            }

            Tag::Symbol | Tag::LongSymbol => {
                let len = if t == Tag::Symbol {
                    read_u8(r)? as usize
                } else {
                    read_len(r)?
                };
                let bytes = read_bytes(r, len)?;
                let name = String::from_utf8(bytes)
                    .map_err(|_| corrupt("non-utf8 symbol"))?;
                let sym = self.rt.intern(&name);
                self.backrefs.push(sym);
                Ok(Some(sym))
            }

            Tag::String => {
                let len = read_len(r)?;
                let bytes = read_bytes(r, len)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| corrupt("non-utf8 string"))?;
                let id = self.rt.alloc(Value::Str(s));
                self.backrefs.push(id);
                Ok(Some(id))
            }

            Tag::ShorterInt64 => {
                let v = read_u16(r)? as i16 as i64;
                let id = self.rt.box_int64(v);
                self.backrefs.push(id);
                Ok(Some(id))
            }
            Tag::ShortInt64 => {
                let v = read_i32(r)? as i64;
                let id = self.rt.box_int64(v);
                self.backrefs.push(id);
                Ok(Some(id))
            }
            Tag::Int64 => {
                let v = read_i64(r)?;
                let id = self.rt.box_int64(v);
                self.backrefs.push(id);
                Ok(Some(id))
            }
            Tag::ShortInt32 => {
                let v = read_u16(r)? as i16 as i32;
                let id = self.rt.box_int32(v);
                self.backrefs.push(id);
                Ok(Some(id))
            }
            Tag::Int32 => {
                let v = read_i32(r)?;
                let id = self.rt.box_int32(v);
                self.backrefs.push(id);
                Ok(Some(id))
            }
            Tag::UInt8 => {
                // never backreferenced; the payload is smaller than an index
                let v = read_u8(r)?;
                Ok(Some(self.rt.box_uint8(v)))
            }

            Tag::BigNum => {
                let size = read_i32(r)?;
                let nb = (if size == 0 { 1 } else { size.unsigned_abs() as usize }) * 8;
                let limbs = read_bytes(r, nb)?;
                let id = self.rt.alloc(Value::BigNum(BigNum { size, limbs }));
                self.backrefs.push(id);
                Ok(Some(id))
            }

            Tag::Core => Ok(Some(self.rt.well_known().core_module)),
            Tag::Base => Ok(Some(self.rt.well_known().base_module)),

            Tag::CNull => {
                let placeholder = self.rt.well_known().nothing_type;
                let id = self.rt.alloc(Value::Ptr {
                    ty: placeholder,
                    addr: 0,
                });
                self.backrefs.push(id);
                let ty = self.require(r, Dest::Owner(id))?;
                match self.rt.get_mut(id) {
                    Value::Ptr { ty: slot, .. } => *slot = ty,
                    _ => unreachable!(),
                }
                Ok(Some(id))
            }

            Tag::Ptr => {
                let placeholder = self.rt.well_known().nothing_type;
                let id = self.rt.alloc(Value::Ptr {
                    ty: placeholder,
                    addr: 0,
                });
                self.backrefs.push(id);
                let ty = self.require(r, Dest::Owner(id))?;
                let addr = read_u64(r)?;
                match self.rt.get_mut(id) {
                    Value::Ptr { ty: tslot, addr: aslot } => {
                        *tslot = ty;
                        *aslot = addr;
                    }
                    _ => unreachable!(),
                }
                Ok(Some(id))
            }

            Tag::BitsTypename => {
                let slot = read_u8(r)?;
                let wrapper = self
                    .registry
                    .resolve_tag(slot)
                    .ok_or_else(|| corrupt("bits-typename of unassigned slot"))?;
                let primary = runtime::dispatch::unwrap_unionall(self.rt, wrapper);
                let tn = self
                    .rt
                    .datatype(primary)
                    .name
                    .ok_or_else(|| corrupt("bits-typename of unnamed type"))?;
                Ok(Some(tn))
            }

            Tag::Tvar => {
                let placeholder = self.rt.intern("");
                let id = self.rt.alloc(Value::TypeVar(TypeVar {
                    name: placeholder,
                    lb: None,
                    ub: None,
                }));
                self.backrefs.push(id);
                let name = self.require(r, Dest::None)?;
                let lb = self.deserialize_value(r, Dest::Owner(id))?;
                let ub = self.deserialize_value(r, Dest::Owner(id))?;
                match self.rt.get_mut(id) {
                    Value::TypeVar(tv) => {
                        tv.name = name;
                        tv.lb = lb;
                        tv.ub = ub;
                    }
                    _ => unreachable!(),
                }
                Ok(Some(id))
            }

            Tag::UnionAll => {
                let pos = self.backrefs.reserve();
                if read_u8(r)? != 0 {
                    let module = self.require(r, Dest::None)?;
                    let name = self.require(r, Dest::None)?;
                    let v = self
                        .rt
                        .get_global(module, name)
                        .ok_or_else(|| corrupt("unresolved wrapper reference"))?;
                    self.backrefs.set(pos, v);
                    return Ok(Some(v));
                }
                let placeholder = self.rt.well_known().nothing;
                let id = self.rt.alloc(Value::UnionAll(UnionAll {
                    var: placeholder,
                    body: placeholder,
                }));
                self.backrefs.set(pos, id);
                let var = self.require(r, Dest::Owner(id))?;
                let body = self.require(r, Dest::Owner(id))?;
                match self.rt.get_mut(id) {
                    Value::UnionAll(ua) => {
                        ua.var = var;
                        ua.body = body;
                    }
                    _ => unreachable!(),
                }
                Ok(Some(id))
            }

            Tag::Datatype => {
                let pos = self.backrefs.reserve();
                self.deserialize_datatype(r, pos, dest).map(Some)
            }
            Tag::Singleton => self.deserialize_singleton(r, dest).map(Some),
            Tag::Array | Tag::Array1d => self.deserialize_array(r, t).map(Some),
            Tag::Module => self.deserialize_module(r).map(Some),
            Tag::Typename => self.deserialize_typename(r).map(Some),
            Tag::Method => self.deserialize_method(r, dest).map(Some),
            Tag::MethodInstance => self.deserialize_method_instance(r, dest).map(Some),
            Tag::CodeInstance => self.deserialize_code_instance_chain(r).map(Some),
            Tag::MethodTable => self.deserialize_method_table(r).map(Some),
            Tag::IdDict => self.deserialize_iddict(r).map(Some),
            Tag::ShortGeneral | Tag::General => self.deserialize_any(r, t).map(Some),
        }
    }

    // ── composite kinds ────────────────────────────────────────────

    fn deserialize_datatype(
        &mut self,
        r: &mut dyn Read,
        pos: usize,
        dest: Dest,
    ) -> Result<ValueId, RestoreError> {
        debug_assert_eq!(
            pos + 1,
            self.backrefs.len(),
            "nothing may deserialize between reserving and filling a type"
        );
        let sub_tag = read_u8(r)?;
        if sub_tag == 6 || sub_tag == 7 {
            let tn = self.require(r, Dest::None)?;
            let parameters = self.require(r, Dest::None)?;
            let wrapper = self.rt.typename(tn).wrapper;
            let params: Vec<ValueId> = self
                .rt
                .svec(parameters)
                .iter()
                .map(|p| p.ok_or_else(|| corrupt("null type parameter")))
                .collect::<Result<_, _>>()?;
            let dtv = self.rt.apply_type(wrapper, &params);
            self.backrefs.set(pos, dtv);
            return Ok(dtv);
        }
        if !(sub_tag == 0 || sub_tag == 5 || sub_tag == 10 || sub_tag == 11 || sub_tag == 12) {
            return Err(corrupt("unknown datatype sub-tag"));
        }
        let empty = self.rt.well_known().empty_svec;
        let dt = self.rt.alloc(Value::DataType(DataType {
            name: None,
            parameters: empty,
            supertype: None,
            field_types: None,
            instance: None,
            layout: None,
            size: 0,
            hash: 0,
            flags: TypeFlags::NONE,
        }));
        self.backrefs.set(pos, dt);

        let size = read_i32(r)? as u32;
        let presence = read_u8(r)?;
        let has_layout = presence & 1 != 0;
        let has_instance = presence & 2 != 0;
        let memflags = read_u8(r)?;
        let hash = read_i32(r)? as u32;
        {
            let d = self.rt.datatype_mut(dt);
            d.size = size;
            d.flags = TypeFlags(memflags);
            d.hash = hash;
        }

        if has_layout {
            let layout = match read_u8(r)? {
                1 => LayoutDesc::ArrayLike,
                2 => LayoutDesc::NothingLike,
                3 => LayoutDesc::PointerLike,
                0 => {
                    let nfields = read_u32(r)?;
                    let npointers = read_u32(r)?;
                    let first_ptr = read_i32(r)?;
                    let lsize = read_u32(r)?;
                    let mut fields = Vec::with_capacity(nfields as usize);
                    for _ in 0..nfields {
                        match read_u8(r)? {
                            0 => fields.push(FieldKind::Bits(read_u32(r)?)),
                            1 => fields.push(FieldKind::Ref),
                            _ => return Err(corrupt("unknown field kind")),
                        }
                    }
                    LayoutDesc::Custom(Layout {
                        size: lsize,
                        npointers,
                        first_ptr,
                        fields,
                    })
                }
                _ => return Err(corrupt("unknown layout discriminant")),
            };
            self.rt.datatype_mut(dt).layout = Some(layout);
        }

        if sub_tag == 10 || sub_tag == 11 || sub_tag == 12 {
            debug_assert!(pos > 0);
            self.flagrefs.push(FlagRef {
                owner: dest.owner(),
                index: pos as i64,
            });
            self.uniquing.insert(dt, None);
        }

        if has_instance {
            let instance = self.deserialize_value(r, Dest::Owner(dt))?;
            self.rt.datatype_mut(dt).instance = instance;
        }
        let name = self.deserialize_value(r, Dest::Owner(dt))?;
        let parameters = self.require(r, Dest::Owner(dt))?;
        let supertype = self.deserialize_value(r, Dest::Owner(dt))?;
        let field_types = self.deserialize_value(r, Dest::Owner(dt))?;
        {
            let d = self.rt.datatype_mut(dt);
            d.name = name;
            d.parameters = parameters;
            d.supertype = supertype;
            d.field_types = field_types;
        }
        Ok(dt)
    }

    fn deserialize_singleton(
        &mut self,
        r: &mut dyn Read,
        dest: Dest,
    ) -> Result<ValueId, RestoreError> {
        debug_assert!(
            !matches!(dest, Dest::Skip),
            "singleton reads always carry a destination"
        );
        let placeholder = self.rt.well_known().nothing_type;
        let v = self.rt.alloc(Value::Struct(StructVal {
            ty: placeholder,
            fields: Vec::new(),
        }));
        let pos = self.backrefs.push(v);
        if let Some(owner) = dest.owner() {
            self.flagrefs.push(FlagRef {
                owner: Some(owner),
                index: pos as i64,
            });
        }
        // No destination for the type itself: when the type is replaced,
        // its instance is replaced with it.
        let dt = self.require(r, Dest::Skip)?;
        match self.rt.get_mut(v) {
            Value::Struct(sv) => sv.ty = dt,
            _ => unreachable!(),
        }
        match self.rt.datatype(dt).instance {
            Some(instance) if instance != v => {
                // the type resolved to a live one; share its instance now
                // rather than waiting for the uniquing pass
                self.backrefs.set(pos, instance);
                self.uniquing.insert(v, Some(instance));
                Ok(instance)
            }
            _ => Ok(v),
        }
    }

    fn deserialize_array(&mut self, r: &mut dyn Read, t: Tag) -> Result<ValueId, RestoreError> {
        let (ndims, is_values, is_inline, is_union, elsize) = if t == Tag::Array1d {
            let packed = read_u8(r)?;
            (
                1usize,
                packed & 0x80 != 0,
                packed & 0x40 != 0,
                packed & 0x20 != 0,
                (packed & 0x1f) as u16,
            )
        } else {
            let ndims = read_u16(r)? as usize;
            let packed = read_u16(r)?;
            (
                ndims,
                packed & 0x8000 != 0,
                packed & 0x4000 != 0,
                packed & 0x2000 != 0,
                packed & 0x1fff,
            )
        };
        let pos = self.backrefs.reserve();
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            let boxed = self.require(r, Dest::None)?;
            dims.push(self.rt.unbox_i64(boxed) as u64);
        }
        let len: u64 = dims.iter().product();
        let placeholder = self.rt.well_known().nothing_type;
        let id = self.rt.alloc(Value::Array(ArrayVal {
            ty: placeholder,
            elem_ty: placeholder,
            dims,
            data: ArrayData::Bytes { elsize: 0, bytes: Vec::new() },
        }));
        self.backrefs.set(pos, id);
        let aty = self.require(r, Dest::Owner(id))?;
        let elem_ty = self
            .rt
            .svec(self.rt.datatype(aty).parameters)
            .first()
            .copied()
            .flatten()
            .ok_or_else(|| corrupt("array type without element parameter"))?;
        {
            let Value::Array(ar) = self.rt.get_mut(id) else { unreachable!() };
            ar.ty = aty;
            ar.elem_ty = elem_ty;
        }

        let data = if is_values {
            let mut elems = Vec::with_capacity(len as usize);
            for _ in 0..len {
                elems.push(self.deserialize_value(r, Dest::Owner(id))?);
            }
            ArrayData::Values(elems)
        } else if is_inline {
            let fields = match self.rt.datatype(elem_ty).layout.clone() {
                Some(LayoutDesc::Custom(l)) => l.fields,
                _ => return Err(corrupt("inline array of layoutless element type")),
            };
            let mut elems = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let mut fvs = Vec::with_capacity(fields.len());
                for fk in &fields {
                    match fk {
                        FieldKind::Bits(n) => {
                            fvs.push(FieldVal::Bits(read_bytes(r, *n as usize)?))
                        }
                        FieldKind::Ref => {
                            let v = self.deserialize_value(r, Dest::Owner(id))?;
                            fvs.push(FieldVal::Ref(v));
                        }
                    }
                }
                elems.push(fvs);
            }
            ArrayData::Inline(elems)
        } else {
            let bytes = read_bytes(r, len as usize * elsize as usize)?;
            if is_union {
                let tags = read_bytes(r, len as usize)?;
                ArrayData::BitsUnion { elsize, bytes, tags }
            } else {
                ArrayData::Bytes { elsize, bytes }
            }
        };
        {
            let Value::Array(ar) = self.rt.get_mut(id) else { unreachable!() };
            ar.data = data;
        }
        Ok(id)
    }

    fn deserialize_module(&mut self, r: &mut dyn Read) -> Result<ValueId, RestoreError> {
        let pos = self.backrefs.reserve();
        let name = self.require(r, Dest::None)?;
        let ref_only = read_u8(r)?;
        if ref_only == 1 {
            let parent = self.require(r, Dest::None)?;
            let m = self
                .rt
                .get_global(parent, name)
                .ok_or_else(|| corrupt("unresolved module reference"))?;
            self.backrefs.set(pos, m);
            return Ok(m);
        }
        if ref_only == 2 {
            let idx = read_i32(r)?;
            let m = self
                .loaded_modules
                .get(usize::try_from(idx).map_err(|_| corrupt("negative module index"))?)
                .copied()
                .ok_or_else(|| corrupt("module index out of range"))?;
            self.backrefs.set(pos, m);
            return Ok(m);
        }
        if ref_only != 0 {
            return Err(corrupt("unknown module reference mode"));
        }

        let id = self.rt.alloc(Value::Module(Module::new(name, 0)));
        self.backrefs.set(pos, id);
        let parent = self.deserialize_value(r, Dest::Owner(id))?;
        self.rt.module_mut(id).parent = parent.or(Some(id));

        loop {
            let Some(asname) = self.deserialize_value(r, Dest::None)? else {
                break;
            };
            let bname = self.require(r, Dest::None)?;
            let value = self.deserialize_value(r, Dest::Owner(id))?;
            let globalref = self.deserialize_value(r, Dest::Owner(id))?;
            let owner = self.deserialize_value(r, Dest::Owner(id))?;
            let ty = self.deserialize_value(r, Dest::Owner(id))?;
            let flags = BindingFlags::from_bits_truncate(read_u8(r)?);
            self.rt.module_mut(id).bindings.push((
                asname,
                Binding {
                    name: bname,
                    value,
                    globalref,
                    owner,
                    ty,
                    flags,
                },
            ));
        }

        let nusings = read_len(r)?;
        for _ in 0..nusings {
            let u = self.require(r, Dest::Owner(id))?;
            self.rt.module_mut(id).usings.push(u);
        }
        let is_top_mod = read_u8(r)? != 0;
        let uuid_hi = read_u64(r)?;
        let uuid_lo = read_u64(r)?;
        let build_id = read_u64(r)?;
        let counter = read_i32(r)?;
        let nospecialize = read_i32(r)?;
        let optlevel = read_u8(r)?;
        let compile = read_u8(r)?;
        let infer = read_u8(r)?;
        let max_methods = read_u8(r)?;
        let world = self.world;
        {
            let m = self.rt.module_mut(id);
            m.is_top_mod = is_top_mod;
            m.uuid.hi = uuid_hi;
            m.uuid.lo = uuid_lo;
            m.build_id = build_id;
            m.counter = counter;
            m.nospecialize = nospecialize;
            m.optlevel = optlevel;
            m.compile = compile;
            m.infer = infer;
            m.max_methods = max_methods;
            m.primary_world = world;
        }
        Ok(id)
    }

    fn deserialize_typename(&mut self, r: &mut dyn Read) -> Result<ValueId, RestoreError> {
        let pos = self.backrefs.reserve();
        let internal = read_u8(r)? != 0;
        let module = self.require(r, Dest::None)?;
        let name = self.require(r, Dest::None)?;
        if !internal {
            let wrapper = self
                .rt
                .get_global(module, name)
                .ok_or_else(|| corrupt("unresolved type-name reference"))?;
            let primary = runtime::dispatch::unwrap_unionall(self.rt, wrapper);
            let tn = self
                .rt
                .datatype(primary)
                .name
                .ok_or_else(|| corrupt("external type has no name record"))?;
            self.backrefs.set(pos, tn);
            return Ok(tn);
        }
        let placeholder_names = self.rt.well_known().empty_svec;
        let placeholder = self.rt.well_known().nothing;
        let tn = self.rt.alloc(Value::TypeName(TypeName {
            module,
            name,
            field_names: placeholder_names,
            wrapper: placeholder,
            method_table: None,
            hash: 0,
            flags: TypeNameFlags::empty(),
            max_methods: 0,
            n_uninitialized: 0,
            atomic_fields: Vec::new(),
            const_fields: Vec::new(),
        }));
        self.backrefs.set(pos, tn);
        let field_names = self.require(r, Dest::Owner(tn))?;
        let wrapper = self.require(r, Dest::Owner(tn))?;
        let method_table = self.deserialize_value(r, Dest::Owner(tn))?;
        let hash = read_u64(r)?;
        let flags = TypeNameFlags::from_bits_truncate(read_u8(r)?);
        let max_methods = read_u8(r)?;
        let n_uninitialized = if flags.contains(TypeNameFlags::ABSTRACT) {
            0
        } else {
            read_u16(r)?
        };
        let natomic = read_len(r)? / 4;
        let mut atomic_fields = Vec::with_capacity(natomic);
        for _ in 0..natomic {
            atomic_fields.push(read_u32(r)?);
        }
        let nconst = read_len(r)? / 4;
        let mut const_fields = Vec::with_capacity(nconst);
        for _ in 0..nconst {
            const_fields.push(read_u32(r)?);
        }
        {
            let Value::TypeName(t) = self.rt.get_mut(tn) else { unreachable!() };
            t.field_names = field_names;
            t.wrapper = wrapper;
            t.method_table = method_table;
            t.hash = hash;
            t.flags = flags;
            t.max_methods = max_methods;
            t.n_uninitialized = n_uninitialized;
            t.atomic_fields = atomic_fields;
            t.const_fields = const_fields;
        }
        Ok(tn)
    }

    fn deserialize_method(
        &mut self,
        r: &mut dyn Read,
        dest: Dest,
    ) -> Result<ValueId, RestoreError> {
        let placeholder = self.rt.well_known().nothing;
        let placeholder_sym = self.rt.intern("");
        let main = self.rt.well_known().main_module;
        let id = self.rt.alloc(Value::Method(Method {
            sig: placeholder,
            module: main,
            external_mt: None,
            specializations: Vec::new(),
            name: placeholder_sym,
            file: placeholder_sym,
            line: 0,
            called: 0,
            nargs: 0,
            nospecialize: 0,
            nkw: 0,
            isva: false,
            pure: false,
            is_for_opaque_closure: false,
            constprop: 0,
            purity: 0,
            slot_syms: None,
            roots: Vec::new(),
            root_blocks: Vec::new(),
            nroots_sysimg: 0,
            source: None,
            unspecialized: None,
            generator: None,
            invokes: None,
            recursion_relation: None,
            primary_world: 0,
            deleted_world: 0,
        }));
        let pos = self.backrefs.push(id);
        let sig = self.require(r, Dest::Owner(id))?;
        let module = self.require(r, Dest::Owner(id))?;
        {
            let m = self.rt.method_mut(id);
            m.sig = sig;
            m.module = module;
        }
        let mode = read_u8(r)?;
        if mode & METHOD_EXTERNAL_MT != 0 {
            let mt_module = self.require(r, Dest::None)?;
            let mt_name = self.require(r, Dest::None)?;
            let emt = self
                .rt
                .get_global(mt_module, mt_name)
                .ok_or_else(|| corrupt("unresolved external method table"))?;
            if !matches!(self.rt.get(emt), Value::MethodTable(_)) {
                return Err(corrupt("external method-table binding is not a table"));
            }
            self.rt.method_mut(id).external_mt = Some(emt);
        } else {
            let emt = self.deserialize_value(r, Dest::Owner(id))?;
            self.rt.method_mut(id).external_mt = emt;
        }
        if mode & METHOD_INTERNAL == 0 {
            self.flagrefs.push(FlagRef {
                owner: dest.owner(),
                index: pos as i64,
            });
            if mode & METHOD_HAS_NEW_ROOTS != 0 {
                let key = read_u64(r)?;
                let nnew = read_len(r)?;
                let mut roots = Vec::with_capacity(nnew);
                for _ in 0..nnew {
                    roots.push(self.require(r, Dest::None)?);
                }
                // Stored off to the side: stashing them in the placeholder
                // method would lose them when recaching swaps it out.
                let prev = self.queued_method_roots.insert(id, (key, roots));
                debug_assert!(prev.is_none());
            }
            return Ok(id);
        }

        let nspec = read_len(r)?;
        for _ in 0..nspec {
            let s = self.require(r, Dest::Owner(id))?;
            self.rt.method_mut(id).specializations.push(s);
        }
        let name = self.require(r, Dest::None)?;
        let file = self.require(r, Dest::None)?;
        let line = read_i32(r)?;
        let called = read_i32(r)?;
        let nargs = read_i32(r)?;
        let nospecialize = read_i32(r)?;
        let nkw = read_i32(r)?;
        let isva = read_u8(r)? != 0;
        let pure = read_u8(r)? != 0;
        let is_ocl = read_u8(r)? != 0;
        let constprop = read_u8(r)?;
        let purity = read_u8(r)?;
        {
            let m = self.rt.method_mut(id);
            m.name = name;
            m.file = file;
            m.line = line;
            m.called = called;
            m.nargs = nargs;
            m.nospecialize = nospecialize;
            m.nkw = nkw;
            m.isva = isva;
            m.pure = pure;
            m.is_for_opaque_closure = is_ocl;
            m.constprop = constprop;
            m.purity = purity;
            m.primary_world = self.world;
            m.deleted_world = MAX_WORLD;
        }
        let slot_syms = self.deserialize_value(r, Dest::Owner(id))?;
        self.rt.method_mut(id).slot_syms = slot_syms;
        let nroots = read_len(r)?;
        for _ in 0..nroots {
            let root = self.require(r, Dest::Owner(id))?;
            self.rt.method_mut(id).roots.push(root);
        }
        let nblocks = read_len(r)?;
        for _ in 0..nblocks {
            let b = read_u64(r)?;
            self.rt.method_mut(id).root_blocks.push(b);
        }
        let nroots_sysimg = read_i32(r)?;
        let source = self.deserialize_value(r, Dest::Owner(id))?;
        let unspecialized = self.deserialize_value(r, Dest::Owner(id))?;
        let generator = self.deserialize_value(r, Dest::Owner(id))?;
        let invokes = self.deserialize_value(r, Dest::Owner(id))?;
        let recursion_relation = self.deserialize_value(r, Dest::Owner(id))?;
        {
            let m = self.rt.method_mut(id);
            m.nroots_sysimg = nroots_sysimg;
            m.source = source;
            m.unspecialized = unspecialized;
            m.generator = generator;
            m.invokes = invokes;
            m.recursion_relation = recursion_relation;
        }
        Ok(id)
    }

    fn deserialize_method_instance(
        &mut self,
        r: &mut dyn Read,
        dest: Dest,
    ) -> Result<ValueId, RestoreError> {
        let placeholder = self.rt.well_known().nothing;
        let id = self.rt.alloc(Value::MethodInstance(MethodInstance {
            def: placeholder,
            spec_types: placeholder,
            sparam_vals: None,
            uninferred: None,
            backedges: Vec::new(),
            callbacks: None,
            cache: None,
            precompiled: false,
        }));
        let pos = self.backrefs.push(id);
        let internal = read_u8(r)?;
        if internal == 1 {
            let uninferred = self.deserialize_value(r, Dest::Owner(id))?;
            self.rt.method_instance_mut(id).uninferred = uninferred;
        }
        let spec_types = self.require(r, Dest::Owner(id))?;
        let def = self.require(r, Dest::Owner(id))?;
        {
            let mi = self.rt.method_instance_mut(id);
            mi.spec_types = spec_types;
            mi.def = def;
        }
        if internal == 0 {
            self.flagrefs.push(FlagRef {
                owner: dest.owner(),
                index: pos as i64,
            });
            return Ok(id);
        }
        let sparam_vals = self.deserialize_value(r, Dest::Owner(id))?;
        self.rt.method_instance_mut(id).sparam_vals = sparam_vals;
        let nbackedges = read_len(r)?;
        for _ in 0..nbackedges {
            let be = self.require(r, Dest::Owner(id))?;
            self.rt.method_instance_mut(id).backedges.push(be);
        }
        let callbacks = self.deserialize_value(r, Dest::Owner(id))?;
        let cache = self.deserialize_value(r, Dest::Owner(id))?;
        {
            let mi = self.rt.method_instance_mut(id);
            mi.callbacks = callbacks;
            mi.cache = cache;
        }
        Ok(id)
    }

    /// Read a code-instance chain iteratively; each payload's trailing
    /// field is its successor.
    fn deserialize_code_instance_chain(
        &mut self,
        r: &mut dyn Read,
    ) -> Result<ValueId, RestoreError> {
        let placeholder = self.rt.well_known().nothing;
        let any = self.rt.well_known().any_type;
        let mut first: Option<ValueId> = None;
        let mut prev: Option<ValueId> = None;
        loop {
            let id = self.rt.alloc(Value::CodeInstance(CodeInstance {
                def: placeholder,
                inferred: None,
                rettype: any,
                rettype_const: None,
                argescapes: None,
                min_world: 0,
                max_world: 0,
                ipo_purity_bits: 0,
                purity_bits: 0,
                const_return: false,
                precompile: false,
                relocatability: 0,
                next: None,
            }));
            self.backrefs.push(id);
            let flags = read_u8(r)?;
            let validate = flags & 3;
            let const_return = flags & (1 << 2) != 0;
            let precompile = flags & (1 << 3) != 0;
            let ipo_purity_bits = read_u32(r)?;
            let purity_bits = read_u32(r)?;
            let def = self.require(r, Dest::Owner(id))?;
            let inferred = self.deserialize_value(r, Dest::Owner(id))?;
            let rettype_const = self.deserialize_value(r, Dest::Owner(id))?;
            let rettype = self.require(r, Dest::Owner(id))?;
            let argescapes = self.deserialize_value(r, Dest::Owner(id))?;
            let relocatability = read_u8(r)?;
            if relocatability > 1 {
                return Err(corrupt("relocatability out of range"));
            }
            let world = self.world;
            {
                let ci = self.rt.code_instance_mut(id);
                ci.def = def;
                ci.inferred = inferred;
                ci.rettype_const = rettype_const;
                ci.rettype = rettype;
                ci.argescapes = argescapes;
                ci.const_return = const_return;
                ci.precompile = precompile;
                ci.relocatability = relocatability;
                if validate != 0 {
                    ci.min_world = world;
                }
            }
            if validate != 0 {
                self.new_ci_validate.insert(id);
            }
            if let Some(p) = prev {
                self.rt.code_instance_mut(p).next = Some(id);
            } else {
                first = Some(id);
            }
            prev = Some(id);

            // the trailing `next` field: either another chain link or any
            // other encoding (null, backref)
            let tag = read_u8(r)?;
            if tag == Tag::CodeInstance as u8 {
                continue;
            }
            let next = self.deserialize_tagged(r, tag, Dest::Owner(id))?;
            self.rt.code_instance_mut(id).next = next;
            break;
        }
        Ok(first.expect("chain has at least one link"))
    }

    fn deserialize_method_table(&mut self, r: &mut dyn Read) -> Result<ValueId, RestoreError> {
        let pos = self.backrefs.reserve();
        let placeholder_sym = self.rt.intern("");
        let main = self.rt.well_known().main_module;
        let id = self.rt.alloc(Value::MethodTable(MethodTable {
            name: placeholder_sym,
            module: main,
            entries: Vec::new(),
            backedges: Vec::new(),
        }));
        self.backrefs.set(pos, id);
        let name = self.require(r, Dest::Owner(id))?;
        let module = self.require(r, Dest::Owner(id))?;
        {
            let mt = self.rt.method_table_mut(id);
            mt.name = name;
            mt.module = module;
        }
        let nentries = read_len(r)?;
        for _ in 0..nentries {
            let method = self.require(r, Dest::Owner(id))?;
            let simple_sig = self.deserialize_value(r, Dest::Owner(id))?;
            let mut min_world = read_u64(r)?;
            let mut max_world = read_u64(r)?;
            if max_world == MAX_WORLD {
                if min_world > 1 {
                    // still-open entry: it becomes visible in this world
                    min_world = self.world;
                }
            } else {
                // closed range did not survive the session; empty sentinel
                min_world = 1;
                max_world = 0;
            }
            self.rt.method_table_mut(id).entries.push(MethodTableEntry {
                method,
                simple_sig,
                min_world,
                max_world,
            });
        }
        let nbackedges = read_len(r)?;
        for _ in 0..nbackedges {
            let sig = self.require(r, Dest::Owner(id))?;
            let caller = self.require(r, Dest::Owner(id))?;
            self.rt.method_table_mut(id).backedges.push((sig, caller));
        }
        Ok(id)
    }

    fn deserialize_iddict(&mut self, r: &mut dyn Read) -> Result<ValueId, RestoreError> {
        let id = self.rt.alloc(Value::IdDict(IdDict { pairs: Vec::new() }));
        self.backrefs.push(id);
        let npairs = read_len(r)?;
        for _ in 0..npairs {
            let k = self.require(r, Dest::Owner(id))?;
            let v = self.require(r, Dest::Owner(id))?;
            match self.rt.get_mut(id) {
                Value::IdDict(d) => d.pairs.push((k, v)),
                _ => unreachable!(),
            }
        }
        Ok(id)
    }

    /// Generic structs: type first, then fields laid out per the type's
    /// layout descriptor.
    fn deserialize_any(&mut self, r: &mut dyn Read, t: Tag) -> Result<ValueId, RestoreError> {
        let size = if t == Tag::ShortGeneral {
            read_u8(r)? as u32
        } else {
            read_i32(r)? as u32
        };
        let placeholder = self.rt.well_known().nothing_type;
        let id = self.rt.alloc(Value::Struct(StructVal {
            ty: placeholder,
            fields: Vec::new(),
        }));
        self.backrefs.push(id);
        let ty = self.require(r, Dest::Owner(id))?;
        match self.rt.get_mut(id) {
            Value::Struct(sv) => sv.ty = ty,
            _ => unreachable!(),
        }
        let fields = match self.rt.datatype(ty).layout.clone() {
            Some(LayoutDesc::Custom(l)) => l.fields,
            _ => Vec::new(),
        };
        if fields.is_empty() {
            // a sized type without field descriptors (primitive bits)
            // carries one opaque blob
            if size > 0 {
                let blob = FieldVal::Bits(read_bytes(r, size as usize)?);
                match self.rt.get_mut(id) {
                    Value::Struct(sv) => sv.fields.push(blob),
                    _ => unreachable!(),
                }
            }
            return Ok(id);
        }
        for fk in fields {
            let fv = match fk {
                FieldKind::Bits(n) => FieldVal::Bits(read_bytes(r, n as usize)?),
                FieldKind::Ref => {
                    FieldVal::Ref(self.deserialize_value(r, Dest::Owner(id))?)
                }
            };
            match self.rt.get_mut(id) {
                Value::Struct(sv) => sv.fields.push(fv),
                _ => unreachable!(),
            }
        }
        Ok(id)
    }
}
