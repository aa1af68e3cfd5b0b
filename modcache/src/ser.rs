//! Write side of the value codec.
//!
//! Traversal order is the contract: the read side reserves backref entries
//! at exactly the points this module registers them, so any change to the
//! sequence of registrations or subvalue visits is a file-format change.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use runtime::{ArrayData, FieldVal, LayoutDesc, Runtime, Value, ValueId, MAX_WORLD};
use tracing::debug;

use crate::backref::WriteBackrefs;
use crate::error::SaveError;
use crate::stream::{
    write_i32, write_i64, write_u16, write_u32, write_u64, write_u8,
};
use crate::tags::{Tag, TagRegistry, TAG_NULL};

/// Native-pointer payloads are nulled on write, except the all-ones
/// pattern shared by the OS invalid-handle and mmap MAP_FAILED markers,
/// which round-trips untouched.
pub const SENTINEL_PTR: u64 = u64::MAX;

/// Caller-controlled save knobs.
pub struct SaveOptions {
    /// Elide code instances whose return constant is a partial opaque
    /// closure; when false, meeting one is a fatal save error.
    pub skip_partial_opaque: bool,
    /// Embed the source text of every recorded dependency.
    pub include_source_text: bool,
    /// Compile-time preference keys and their combined hash.
    pub preferences: Vec<String>,
    pub preferences_hash: u64,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            skip_partial_opaque: true,
            include_source_text: true,
            preferences: Vec::new(),
            preferences_hash: 0,
        }
    }
}

/// Method serialization mode bits.
pub const METHOD_INTERNAL: u8 = 1;
pub const METHOD_EXTERNAL_MT: u8 = 2;
pub const METHOD_HAS_NEW_ROOTS: u8 = 4;

/// Transient state of one save call.
///
/// Allocated at entry, dropped at exit; concurrent saves are not
/// supported, which `&mut Runtime` already enforces.
pub(crate) struct SaveSession<'rt> {
    pub rt: &'rt mut Runtime,
    pub worklist: Vec<ValueId>,
    pub registry: TagRegistry,
    pub backrefs: WriteBackrefs,
    /// `(backref position, reinit kind)` pairs, replayed after load.
    pub reinit: Vec<(u32, i32)>,
    /// Queued external method instances, in queue order.
    pub external_mis: Vec<ValueId>,
    external_set: HashSet<ValueId, ahash::RandomState>,
    /// caller → callees scratch map, inverted from the backedge graph.
    pub edges_map: HashMap<ValueId, Vec<ValueId>, ahash::RandomState>,
    pub skip_partial_opaque: bool,
}

impl<'rt> SaveSession<'rt> {
    pub fn new(rt: &'rt mut Runtime, worklist: &[ValueId], options: &SaveOptions) -> Self {
        let registry = TagRegistry::new(rt);
        let mut backrefs = WriteBackrefs::new();
        // position 0 is always the main module
        backrefs.insert(rt.well_known().main_module);
        let mut session = Self {
            rt,
            worklist: worklist.to_vec(),
            registry,
            backrefs,
            reinit: Vec::new(),
            external_mis: Vec::new(),
            external_set: HashSet::default(),
            edges_map: HashMap::default(),
            skip_partial_opaque: options.skip_partial_opaque,
        };
        session.queue_external_mis();
        session
    }

    // ── worklist classification ────────────────────────────────────

    pub fn module_in_worklist(&self, module: ValueId) -> bool {
        self.worklist
            .iter()
            .any(|&work| self.rt.is_submodule(module, work))
    }

    pub fn method_instance_in_queue(&self, mi: ValueId) -> bool {
        self.external_set.contains(&mi)
    }

    /// The build-id of the primary (last) worklist module.
    pub fn worklist_key(&self) -> u64 {
        self.worklist
            .last()
            .map(|&m| self.rt.module(m).build_id)
            .unwrap_or(0)
    }

    /// Whether a type references anything defined by the worklist, and so
    /// cannot predate this cache.
    pub fn type_in_worklist(&self, dt: ValueId) -> bool {
        let mut seen = HashSet::new();
        self.type_in_worklist_inner(dt, &mut seen)
    }

    fn type_in_worklist_inner(&self, dt: ValueId, seen: &mut HashSet<ValueId>) -> bool {
        if !seen.insert(dt) {
            return false;
        }
        let Value::DataType(d) = self.rt.get(dt) else { return false };
        if let Some(tn) = d.name {
            if self.module_in_worklist(self.rt.typename(tn).module) {
                return true;
            }
        }
        for p in self.rt.svec(d.parameters).iter().flatten() {
            let p = runtime::dispatch::unwrap_unionall(self.rt, *p);
            let pdt = match self.rt.get(p) {
                Value::DataType(_) => Some(p),
                Value::TypeVar(_) => None,
                _ => self.rt.value_type_of(p),
            };
            if let Some(pdt) = pdt {
                if self.type_in_worklist_inner(pdt, seen) {
                    return true;
                }
            }
        }
        false
    }

    /// True when the whole type is recoverable from external parts alone.
    fn type_recursively_external(&self, dt: ValueId) -> bool {
        let Value::DataType(d) = self.rt.get(dt) else { return false };
        if !d.is_concrete() {
            return false;
        }
        let params = self.rt.svec(d.parameters);
        params.iter().flatten().all(|&p| self.type_param_external(p))
    }

    fn type_param_external(&self, p: ValueId) -> bool {
        let Value::DataType(d) = self.rt.get(p) else { return false };
        if !d.is_concrete() {
            return false;
        }
        let Some(tn) = d.name else { return false };
        let tn_ref = self.rt.typename(tn);
        if self.module_in_worklist(tn_ref.module) {
            return false;
        }
        let primary = runtime::dispatch::unwrap_unionall(self.rt, tn_ref.wrapper);
        if primary != p && !self.type_recursively_external(p) {
            return false;
        }
        true
    }

    // ── newly-inferred queue ───────────────────────────────────────

    /// Select externally-owned instances from the newly-inferred list that
    /// have a relocatable compilation and link back into the worklist.
    fn queue_external_mis(&mut self) {
        let list = self.rt.newly_inferred.clone();
        let mut visited: HashMap<ValueId, i8, ahash::RandomState> = HashMap::default();
        for mi in list {
            let Value::MethodInstance(m) = self.rt.get(mi) else { continue };
            let Value::Method(method) = self.rt.get(m.def) else { continue };
            if self.module_in_worklist(method.module) {
                continue;
            }
            let mut relocatable = false;
            let mut ci = m.cache;
            while let Some(c) = ci {
                let inst = self.rt.code_instance(c);
                relocatable |= inst.relocatability != 0;
                ci = inst.next;
            }
            if relocatable
                && !self.external_set.contains(&mi)
                && self.has_backedge_to_worklist(mi, &mut visited)
            {
                self.external_set.insert(mi);
                self.external_mis.push(mi);
            }
        }
        if !self.external_mis.is_empty() {
            debug!(count = self.external_mis.len(), "queued external method instances");
        }
    }

    /// Memoized reverse search: does some backedge chain from `mi` land in
    /// a worklist module?
    fn has_backedge_to_worklist(
        &self,
        mi: ValueId,
        visited: &mut HashMap<ValueId, i8, ahash::RandomState>,
    ) -> bool {
        match visited.get(&mi) {
            Some(1) => return true,
            // 0 marks "under analysis"; cycles resolve to false
            Some(_) => return false,
            None => {}
        }
        visited.insert(mi, 0);
        let m = self.rt.method_instance(mi);
        let module = match self.rt.get(m.def) {
            Value::Method(method) => method.module,
            Value::Module(_) => m.def,
            _ => return false,
        };
        if m.precompiled || self.module_in_worklist(module) {
            visited.insert(mi, 1);
            return true;
        }
        let backedges = m.backedges.clone();
        for be in backedges {
            if self.has_backedge_to_worklist(be, visited) {
                visited.insert(mi, 1);
                return true;
            }
        }
        visited.insert(mi, -1);
        false
    }

    // ── generic prologue ───────────────────────────────────────────

    /// Handle the encodings shared by every value kind: null, registry
    /// hits, common symbols, the two module shorthands, canonical empties,
    /// and backreferences. Returns `true` when fully written.
    fn serialize_generic(
        &mut self,
        w: &mut dyn Write,
        v: Option<ValueId>,
    ) -> Result<bool, SaveError> {
        let Some(id) = v else {
            write_u8(w, TAG_NULL)?;
            return Ok(true);
        };
        if let Some(tag) = self.registry.lookup_tag(id) {
            write_u8(w, tag)?;
            return Ok(true);
        }
        match self.rt.get(id) {
            Value::Symbol(_) => {
                if let Some(idx) = self.registry.lookup_common_symbol(id) {
                    write_u8(w, Tag::CommonSym as u8)?;
                    write_u8(w, idx)?;
                    return Ok(true);
                }
            }
            // A typename whose wrapper is itself a registry value encodes
            // as a two-byte shorthand and is never backref-registered.
            Value::TypeName(tn) => {
                if let Some(tag) = self.registry.lookup_tag(tn.wrapper) {
                    write_u8(w, Tag::BitsTypename as u8)?;
                    write_u8(w, tag)?;
                    return Ok(true);
                }
            }
            _ => {}
        }
        let wk = self.rt.well_known();
        if id == wk.core_module {
            write_u8(w, Tag::Core as u8)?;
            return Ok(true);
        }
        if id == wk.base_module {
            write_u8(w, Tag::Base as u8)?;
            return Ok(true);
        }
        // canonicalize stray empties onto the shared registry values
        match self.rt.get(id) {
            Value::Str(s) if s.is_empty() => {
                let canonical = wk.empty_string;
                return self.serialize_generic(w, Some(canonical));
            }
            Value::SVec(elems) if elems.is_empty() => {
                let canonical = wk.empty_svec;
                return self.serialize_generic(w, Some(canonical));
            }
            _ => {}
        }
        if matches!(self.rt.get(id), Value::UInt8(_)) {
            return Ok(false);
        }
        if let Some(encoded) = self.backrefs.lookup(id) {
            if encoded < 65536 {
                write_u8(w, Tag::ShortBackref as u8)?;
                write_u16(w, encoded as u16)?;
            } else {
                write_u8(w, Tag::Backref as u8)?;
                write_i32(w, encoded as i32)?;
            }
            return Ok(true);
        }
        let pos = self.backrefs.insert(id);
        match self.rt.get(id) {
            // identity dictionaries rehash after load
            Value::IdDict(_) => self.reinit.push((pos, 1)),
            // a worklist module under an external parent is re-declared
            // in that parent after load
            Value::Module(m) => {
                let parent = m.parent.unwrap_or(id);
                if self.module_in_worklist(id) && !self.module_in_worklist(parent) {
                    self.reinit.push((pos, 2));
                }
            }
            Value::MethodTable(_) => self.reinit.push((pos, 3)),
            _ => {}
        }
        Ok(false)
    }

    /// A nulled-out pointer standing in for a live one. The reader still
    /// allocates a backref entry for it, so the writer burns a position.
    fn serialize_cnull(&mut self, w: &mut dyn Write, ty: ValueId) -> Result<(), SaveError> {
        self.backrefs.skip_position();
        write_u8(w, Tag::CNull as u8)?;
        self.serialize_value(w, Some(ty))
    }

    /// Whether a binding/array/field value is a pointer that must be
    /// nulled on write (a live address, not NULL, not the sentinel).
    fn is_resettable_ptr(&self, v: Option<ValueId>) -> Option<ValueId> {
        let id = v?;
        match self.rt.get(id) {
            Value::Ptr { ty, addr } if *addr != 0 && *addr != SENTINEL_PTR => Some(*ty),
            _ => None,
        }
    }

    // ── main dispatch ──────────────────────────────────────────────

    pub fn serialize_value(
        &mut self,
        w: &mut dyn Write,
        v: Option<ValueId>,
    ) -> Result<(), SaveError> {
        if self.serialize_generic(w, v)? {
            return Ok(());
        }
        let id = v.expect("generic handles null");
        match self.rt.get(id) {
            Value::SVec(elems) => {
                let elems = elems.clone();
                if elems.len() <= 255 {
                    write_u8(w, Tag::SVec as u8)?;
                    write_u8(w, elems.len() as u8)?;
                } else {
                    write_u8(w, Tag::LongSVec as u8)?;
                    write_i32(w, elems.len() as i32)?;
                }
                for e in elems {
                    self.serialize_value(w, e)?;
                }
                Ok(())
            }

            Value::Symbol(name) => {
                let bytes = name.as_bytes().to_vec();
                if bytes.len() <= 255 {
                    write_u8(w, Tag::Symbol as u8)?;
                    write_u8(w, bytes.len() as u8)?;
                } else {
                    write_u8(w, Tag::LongSymbol as u8)?;
                    write_i32(w, bytes.len() as i32)?;
                }
                w.write_all(&bytes)?;
                Ok(())
            }

            Value::Str(s) => {
                let bytes = s.as_bytes().to_vec();
                write_u8(w, Tag::String as u8)?;
                write_i32(w, bytes.len() as i32)?;
                w.write_all(&bytes)?;
                Ok(())
            }

            Value::Int64(n) => {
                let n = *n;
                if (i16::MIN as i64..=i16::MAX as i64).contains(&n) {
                    write_u8(w, Tag::ShorterInt64 as u8)?;
                    write_u16(w, n as i16 as u16)?;
                } else if (i32::MIN as i64..=i32::MAX as i64).contains(&n) {
                    write_u8(w, Tag::ShortInt64 as u8)?;
                    write_i32(w, n as i32)?;
                } else {
                    write_u8(w, Tag::Int64 as u8)?;
                    write_i64(w, n)?;
                }
                Ok(())
            }

            Value::Int32(n) => {
                let n = *n;
                if (i16::MIN as i32..=i16::MAX as i32).contains(&n) {
                    write_u8(w, Tag::ShortInt32 as u8)?;
                    write_u16(w, n as i16 as u16)?;
                } else {
                    write_u8(w, Tag::Int32 as u8)?;
                    write_i32(w, n)?;
                }
                Ok(())
            }

            Value::UInt8(n) => {
                let n = *n;
                write_u8(w, Tag::UInt8 as u8)?;
                write_u8(w, n)?;
                Ok(())
            }

            Value::BigNum(b) => {
                let size = b.size;
                let mut limbs = b.limbs.clone();
                let nb = (if size == 0 { 1 } else { size.unsigned_abs() as usize }) * 8;
                limbs.resize(nb, 0);
                write_u8(w, Tag::BigNum as u8)?;
                write_i32(w, size)?;
                w.write_all(&limbs)?;
                Ok(())
            }

            Value::Ptr { ty, addr } => {
                let (ty, addr) = (*ty, *addr);
                if addr == 0 {
                    write_u8(w, Tag::CNull as u8)?;
                    return self.serialize_value(w, Some(ty));
                }
                // live addresses do not survive a session boundary
                let kept = if addr == SENTINEL_PTR { addr } else { 0 };
                write_u8(w, Tag::Ptr as u8)?;
                self.serialize_value(w, Some(ty))?;
                write_u64(w, kept)?;
                Ok(())
            }

            Value::TypeVar(tv) => {
                let (name, lb, ub) = (tv.name, tv.lb, tv.ub);
                write_u8(w, Tag::Tvar as u8)?;
                self.serialize_value(w, Some(name))?;
                self.serialize_value(w, lb)?;
                self.serialize_value(w, ub)?;
                Ok(())
            }

            Value::UnionAll(ua) => {
                let (var, body) = (ua.var, ua.body);
                write_u8(w, Tag::UnionAll as u8)?;
                let primary = runtime::dispatch::unwrap_unionall(self.rt, body);
                let by_name = match self.rt.get(primary) {
                    Value::DataType(d) => d.name.and_then(|tn| {
                        let tn = self.rt.typename(tn);
                        (tn.wrapper == id && !self.module_in_worklist(tn.module))
                            .then_some((tn.module, tn.name))
                    }),
                    _ => None,
                };
                if let Some((module, name)) = by_name {
                    write_u8(w, 1)?;
                    self.serialize_value(w, Some(module))?;
                    self.serialize_value(w, Some(name))?;
                } else {
                    write_u8(w, 0)?;
                    self.serialize_value(w, Some(var))?;
                    self.serialize_value(w, Some(body))?;
                }
                Ok(())
            }

            Value::Array(_) => self.serialize_array(w, id),
            Value::DataType(_) => self.serialize_datatype(w, id),
            Value::Module(_) => self.serialize_module(w, id),
            Value::TypeName(_) => self.serialize_typename(w, id),
            Value::Method(_) => self.serialize_method(w, id),
            Value::MethodInstance(_) => self.serialize_method_instance(w, id),
            Value::CodeInstance(_) => {
                // already registered by the generic prologue; emit the body
                // here and hand the successor chain to the loop
                let next = self.serialize_code_instance_body(w, id)?;
                self.serialize_code_instance_chain(w, next, 2, self.skip_partial_opaque)
            }
            Value::MethodTable(_) => self.serialize_method_table(w, id),
            Value::IdDict(_) => self.serialize_iddict(w, id),
            Value::Struct(_) => self.serialize_struct(w, id),

            Value::Task => Err(SaveError::Unserializable("a live task")),
            Value::OpaqueClosure => {
                Err(SaveError::Unserializable("a live opaque closure"))
            }
            Value::Poisoned(_) => {
                Err(SaveError::Unserializable("a poisoned placeholder"))
            }
        }
    }

    // ── composite kinds ────────────────────────────────────────────

    fn serialize_array(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let (ty, elem_ty, dims, is_values, is_inline, is_union, elsize) = {
            let Value::Array(ar) = self.rt.get(id) else { unreachable!() };
            let (v, i, u, elsize) = match &ar.data {
                ArrayData::Values(_) => (true, false, false, 8u16),
                ArrayData::Inline(_) => {
                    let sz = match self.rt.datatype(ar.elem_ty).layout {
                        Some(LayoutDesc::Custom(ref l)) => l.size as u16,
                        _ => 8,
                    };
                    (false, true, false, sz)
                }
                ArrayData::Bytes { elsize, .. } => (false, false, false, *elsize),
                ArrayData::BitsUnion { elsize, .. } => (false, false, true, *elsize),
            };
            (ar.ty, ar.elem_ty, ar.dims.clone(), v, i, u, elsize)
        };

        if dims.len() == 1 && elsize <= 0x1f {
            write_u8(w, Tag::Array1d as u8)?;
            let packed = ((is_values as u8) << 7)
                | ((is_inline as u8) << 6)
                | ((is_union as u8) << 5)
                | (elsize as u8 & 0x1f);
            write_u8(w, packed)?;
        } else {
            write_u8(w, Tag::Array as u8)?;
            write_u16(w, dims.len() as u16)?;
            let packed = ((is_values as u16) << 15)
                | ((is_inline as u16) << 14)
                | ((is_union as u16) << 13)
                | (elsize & 0x1fff);
            write_u16(w, packed)?;
        }
        for d in &dims {
            let boxed = self.rt.box_int64(*d as i64);
            self.serialize_value(w, Some(boxed))?;
        }
        self.serialize_value(w, Some(ty))?;

        let data = {
            let Value::Array(ar) = self.rt.get(id) else { unreachable!() };
            ar.data.clone()
        };
        match data {
            ArrayData::Values(elems) => {
                for e in elems {
                    if let Some(pty) = self.is_resettable_ptr(e) {
                        self.serialize_cnull(w, pty)?;
                    } else {
                        self.serialize_value(w, e)?;
                    }
                }
            }
            ArrayData::Inline(elems) => {
                // inline structs: bits chunks interleaved with their
                // reference fields, element by element
                for fields in elems {
                    for f in fields {
                        match f {
                            FieldVal::Bits(b) => w.write_all(&b)?,
                            FieldVal::Ref(r) => self.serialize_value(w, r)?,
                        }
                    }
                }
            }
            ArrayData::Bytes { bytes, .. } => {
                if self.rt.type_is_pointer(elem_ty) {
                    // pointer payloads reset to null, sentinel kept
                    for chunk in bytes.chunks(8) {
                        let mut word = [0u8; 8];
                        word[..chunk.len()].copy_from_slice(chunk);
                        let addr = u64::from_le_bytes(word);
                        let kept = if addr == SENTINEL_PTR { addr } else { 0 };
                        w.write_all(&kept.to_le_bytes()[..chunk.len()])?;
                    }
                } else {
                    w.write_all(&bytes)?;
                }
            }
            ArrayData::BitsUnion { bytes, tags, .. } => {
                w.write_all(&bytes)?;
                w.write_all(&tags)?;
            }
        }
        Ok(())
    }

    fn serialize_datatype(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let (name, parameters, supertype, field_types, instance, layout, size, hash, flags) = {
            let dt = self.rt.datatype(id);
            (
                dt.name,
                dt.parameters,
                dt.supertype,
                dt.field_types,
                dt.instance,
                dt.layout.clone(),
                dt.size,
                dt.hash,
                dt.flags,
            )
        };
        let internal = name
            .map(|tn| self.module_in_worklist(self.rt.typename(tn).module))
            .unwrap_or(false);
        let primary = name.map(|tn| {
            runtime::dispatch::unwrap_unionall(self.rt, self.rt.typename(tn).wrapper)
        });
        let is_tuple = name == Some(self.rt.well_known().tuple_typename);
        let free_or_loose_tuple = if is_tuple {
            !flags.contains(runtime::TypeFlags::CONCRETE)
        } else {
            flags.contains(runtime::TypeFlags::HAS_FREE_TYPEVARS)
        };

        let sub_tag: u8 = if !internal && primary == Some(id) {
            6 // external primary type
        } else if free_or_loose_tuple {
            0 // generic struct type with free variables
        } else if internal {
            if primary == Some(id) {
                5 // internal primary
            } else {
                10 // internal instantiation, recache on load
            }
        } else if self.type_recursively_external(id) {
            7 // external, reconstructible via apply_type
        } else if self.type_in_worklist(id) {
            11 // external shape over worklist parts; cache but no uniquing
        } else {
            self.backrefs.mark_flagged(id);
            12 // external, must unique against the live cache
        };

        write_u8(w, Tag::Datatype as u8)?;
        write_u8(w, sub_tag)?;
        if sub_tag == 6 || sub_tag == 7 {
            self.serialize_value(w, name)?;
            self.serialize_value(w, Some(parameters))?;
            return Ok(());
        }

        write_i32(w, size as i32)?;
        let has_layout = layout.is_some();
        let has_instance = instance.is_some();
        write_u8(w, (has_layout as u8) | ((has_instance as u8) << 1))?;
        write_u8(w, flags.0)?;
        write_i32(w, hash as i32)?;

        if let Some(layout) = layout {
            match layout {
                LayoutDesc::ArrayLike => write_u8(w, 1)?,
                LayoutDesc::NothingLike => write_u8(w, 2)?,
                LayoutDesc::PointerLike => write_u8(w, 3)?,
                LayoutDesc::Custom(l) => {
                    write_u8(w, 0)?;
                    write_u32(w, l.nfields())?;
                    write_u32(w, l.npointers)?;
                    write_i32(w, l.first_ptr)?;
                    write_u32(w, l.size)?;
                    for fk in &l.fields {
                        match fk {
                            runtime::FieldKind::Bits(n) => {
                                write_u8(w, 0)?;
                                write_u32(w, *n)?;
                            }
                            runtime::FieldKind::Ref => write_u8(w, 1)?,
                        }
                    }
                }
            }
        }

        if let Some(instance) = instance {
            self.serialize_value(w, Some(instance))?;
        }
        self.serialize_value(w, name)?;
        self.serialize_value(w, Some(parameters))?;
        self.serialize_value(w, supertype)?;
        self.serialize_value(w, field_types)?;
        Ok(())
    }

    fn serialize_module(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let name = self.rt.module(id).name;
        write_u8(w, Tag::Module as u8)?;
        self.serialize_value(w, Some(name))?;
        if !self.module_in_worklist(id) {
            let parent = self.rt.module(id).parent.unwrap_or(id);
            if parent == id {
                // top-level external module: index into the loaded list
                write_u8(w, 2)?;
                let mut j = 0i32;
                for &m in &self.rt.loaded_modules.clone() {
                    if self.module_in_worklist(m) {
                        continue;
                    }
                    if m == id {
                        write_i32(w, j)?;
                        return Ok(());
                    }
                    j += 1;
                }
                panic!("top-level module not found in loaded-modules list");
            }
            write_u8(w, 1)?;
            self.serialize_value(w, Some(parent))?;
            return Ok(());
        }
        write_u8(w, 0)?;
        let (parent, bindings, usings, meta) = {
            let m = self.rt.module(id);
            let bindings: Vec<_> = m
                .bindings
                .iter()
                .map(|(sym, b)| {
                    (*sym, b.name, b.value, b.globalref, b.owner, b.ty, b.flags)
                })
                .collect();
            (
                m.parent,
                bindings,
                m.usings.clone(),
                (
                    m.is_top_mod,
                    m.uuid,
                    m.build_id,
                    m.counter,
                    m.nospecialize,
                    m.optlevel,
                    m.compile,
                    m.infer,
                    m.max_methods,
                ),
            )
        };
        self.serialize_value(w, parent)?;
        for (sym, bname, value, globalref, owner, ty, flags) in bindings {
            self.serialize_value(w, Some(sym))?;
            self.serialize_value(w, Some(bname))?;
            let constp = flags.contains(runtime::BindingFlags::CONST);
            match (!constp).then(|| self.is_resettable_ptr(value)).flatten() {
                Some(pty) => self.serialize_cnull(w, pty)?,
                None => self.serialize_value(w, value)?,
            }
            self.serialize_value(w, globalref)?;
            self.serialize_value(w, owner)?;
            self.serialize_value(w, ty)?;
            write_u8(w, flags.bits())?;
        }
        self.serialize_value(w, None)?;
        write_i32(w, usings.len() as i32)?;
        for u in usings {
            self.serialize_value(w, Some(u))?;
        }
        let (is_top, uuid, build_id, counter, nospecialize, optlevel, compile, infer, max_methods) =
            meta;
        write_u8(w, is_top as u8)?;
        write_u64(w, uuid.hi)?;
        write_u64(w, uuid.lo)?;
        write_u64(w, build_id)?;
        write_i32(w, counter)?;
        write_i32(w, nospecialize)?;
        write_u8(w, optlevel)?;
        write_u8(w, compile)?;
        write_u8(w, infer)?;
        write_u8(w, max_methods)?;
        Ok(())
    }

    fn serialize_typename(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let (module, name, field_names, wrapper, method_table, hash, flags, max_methods, n_uninit, atomics, consts) = {
            let tn = self.rt.typename(id);
            (
                tn.module,
                tn.name,
                tn.field_names,
                tn.wrapper,
                tn.method_table,
                tn.hash,
                tn.flags,
                tn.max_methods,
                tn.n_uninitialized,
                tn.atomic_fields.clone(),
                tn.const_fields.clone(),
            )
        };
        write_u8(w, Tag::Typename as u8)?;
        let internal = self.module_in_worklist(module);
        write_u8(w, internal as u8)?;
        self.serialize_value(w, Some(module))?;
        self.serialize_value(w, Some(name))?;
        if !internal {
            return Ok(());
        }
        self.serialize_value(w, Some(field_names))?;
        self.serialize_value(w, Some(wrapper))?;
        self.serialize_value(w, method_table)?;
        write_u64(w, hash)?;
        write_u8(w, flags.bits())?;
        write_u8(w, max_methods)?;
        if !flags.contains(runtime::TypeNameFlags::ABSTRACT) {
            write_u16(w, n_uninit)?;
        }
        write_i32(w, (atomics.len() * 4) as i32)?;
        for word in &atomics {
            write_u32(w, *word)?;
        }
        write_i32(w, (consts.len() * 4) as i32)?;
        for word in &consts {
            write_u32(w, *word)?;
        }
        Ok(())
    }

    fn serialize_method(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        write_u8(w, Tag::Method as u8)?;
        let (sig, module, external_mt, is_ocl) = {
            let m = self.rt.method(id);
            (m.sig, m.module, m.external_mt, m.is_for_opaque_closure)
        };
        let mut mode = 0u8;
        let mut key = 0u64;
        let mut nwithkey = 0usize;
        if is_ocl || self.module_in_worklist(module) {
            mode |= METHOD_INTERNAL;
        }
        if mode & METHOD_INTERNAL == 0 {
            key = self.worklist_key();
            nwithkey = self.rt.method(id).nroots_with_key(key);
            if nwithkey > 0 {
                mode |= METHOD_HAS_NEW_ROOTS;
            }
            self.backrefs.mark_flagged(id);
        }
        self.serialize_value(w, Some(sig))?;
        self.serialize_value(w, Some(module))?;
        if let Some(emt) = external_mt {
            if !self.module_in_worklist(self.rt.method_table(emt).module) {
                mode |= METHOD_EXTERNAL_MT;
            }
        }
        write_u8(w, mode)?;
        if mode & METHOD_EXTERNAL_MT != 0 {
            // rebindable by (module, name) at load time
            let emt = external_mt.expect("mode requires a table");
            let (mt_module, mt_name) = {
                let mt = self.rt.method_table(emt);
                (mt.module, mt.name)
            };
            self.serialize_value(w, Some(mt_module))?;
            self.serialize_value(w, Some(mt_name))?;
        } else {
            self.serialize_value(w, external_mt)?;
        }
        if mode & METHOD_INTERNAL == 0 {
            if mode & METHOD_HAS_NEW_ROOTS != 0 {
                write_u64(w, key)?;
                write_i32(w, nwithkey as i32)?;
                let roots: Vec<ValueId> = {
                    let m = self.rt.method(id);
                    m.iter_roots_with_key(key).map(|i| m.roots[i]).collect()
                };
                for r in roots {
                    self.serialize_value(w, Some(r))?;
                }
            }
            return Ok(());
        }
        let (specializations, name, file, ints, bools, constprop, purity, slot_syms, roots, root_blocks, nroots_sysimg, tail) = {
            let m = self.rt.method(id);
            (
                m.specializations.clone(),
                m.name,
                m.file,
                (m.line, m.called, m.nargs, m.nospecialize, m.nkw),
                (m.isva, m.pure, m.is_for_opaque_closure),
                m.constprop,
                m.purity,
                m.slot_syms,
                m.roots.clone(),
                m.root_blocks.clone(),
                m.nroots_sysimg,
                (m.source, m.unspecialized, m.generator, m.invokes, m.recursion_relation),
            )
        };
        write_i32(w, specializations.len() as i32)?;
        for s in specializations {
            self.serialize_value(w, Some(s))?;
        }
        self.serialize_value(w, Some(name))?;
        self.serialize_value(w, Some(file))?;
        let (line, called, nargs, nospecialize, nkw) = ints;
        write_i32(w, line)?;
        write_i32(w, called)?;
        write_i32(w, nargs)?;
        write_i32(w, nospecialize)?;
        write_i32(w, nkw)?;
        let (isva, pure, ocl) = bools;
        write_u8(w, isva as u8)?;
        write_u8(w, pure as u8)?;
        write_u8(w, ocl as u8)?;
        write_u8(w, constprop)?;
        write_u8(w, purity)?;
        self.serialize_value(w, slot_syms)?;
        write_i32(w, roots.len() as i32)?;
        for r in roots {
            self.serialize_value(w, Some(r))?;
        }
        write_i32(w, root_blocks.len() as i32)?;
        for b in root_blocks {
            write_u64(w, b)?;
        }
        write_i32(w, nroots_sysimg)?;
        let (source, unspecialized, generator, invokes, recursion_relation) = tail;
        self.serialize_value(w, source)?;
        self.serialize_value(w, unspecialized)?;
        self.serialize_value(w, generator)?;
        self.serialize_value(w, invokes)?;
        self.serialize_value(w, recursion_relation)?;
        Ok(())
    }

    fn serialize_method_instance(
        &mut self,
        w: &mut dyn Write,
        id: ValueId,
    ) -> Result<(), SaveError> {
        let (def, spec_types, uninferred, sparam_vals, cache) = {
            let mi = self.rt.method_instance(id);
            (mi.def, mi.spec_types, mi.uninferred, mi.sparam_vals, mi.cache)
        };
        if let Value::Method(m) = self.rt.get(def) {
            if m.is_for_opaque_closure {
                return Err(SaveError::Unserializable(
                    "a method instance of an opaque closure",
                ));
            }
        }
        write_u8(w, Tag::MethodInstance as u8)?;
        let internal: u8 = match self.rt.get(def) {
            Value::Method(m) => {
                if self.module_in_worklist(m.module) {
                    2
                } else if self.method_instance_in_queue(id) {
                    3
                } else {
                    0
                }
            }
            _ => 1, // top-level thunk
        };
        write_u8(w, internal)?;
        if internal == 0 {
            self.backrefs.mark_flagged(id);
        }
        if internal == 1 {
            self.serialize_value(w, uninferred)?;
        }
        self.serialize_value(w, Some(spec_types))?;
        self.serialize_value(w, Some(def))?;
        if internal == 0 {
            return Ok(());
        }
        self.serialize_value(w, sparam_vals)?;
        // keep only backedges whose target will be materialized
        let backedges: Vec<ValueId> = {
            let list = self.rt.method_instance(id).backedges.clone();
            list.into_iter()
                .filter(|&be| {
                    let mi = self.rt.method_instance(be);
                    match self.rt.get(mi.def) {
                        Value::Method(m) => {
                            self.module_in_worklist(m.module)
                                || self.method_instance_in_queue(be)
                        }
                        _ => false,
                    }
                })
                .collect()
        };
        write_i32(w, backedges.len() as i32)?;
        for be in backedges {
            self.serialize_value(w, Some(be))?;
        }
        // callbacks are runtime-session state
        self.serialize_value(w, None)?;
        self.serialize_code_instance_chain(w, cache, internal, self.skip_partial_opaque)
    }

    /// Serialize a code-instance chain. Each payload's last field is its
    /// successor, so the chain flattens into one loop instead of
    /// recursing.
    fn serialize_code_instance_chain(
        &mut self,
        w: &mut dyn Write,
        head: Option<ValueId>,
        internal: u8,
        skip_partial_opaque: bool,
    ) -> Result<(), SaveError> {
        let mut cur = head;
        loop {
            if internal > 2 {
                // queued-external chains keep only relocatable entries
                while let Some(c) = cur {
                    let ci = self.rt.code_instance(c);
                    if ci.relocatability == 0 {
                        cur = ci.next;
                    } else {
                        break;
                    }
                }
            }
            // Partial-opaque elision must happen before registration, or
            // the write/read backref counters would drift apart.
            if let Some(c) = cur {
                let ci = self.rt.code_instance(c);
                let validate = ci.max_world == MAX_WORLD;
                let write_ret = validate || ci.min_world == 0;
                if write_ret {
                    if let Some(rc) = ci.rettype_const {
                        if matches!(self.rt.get(rc), Value::OpaqueClosure) {
                            if skip_partial_opaque {
                                cur = ci.next;
                                continue;
                            }
                            return Err(SaveError::PartialOpaqueReturn);
                        }
                    }
                }
            }
            if self.serialize_generic(w, cur)? {
                return Ok(());
            }
            let c = cur.expect("generic handles null");
            cur = self.serialize_code_instance_body(w, c)?;
        }
    }

    /// Emit one code-instance payload (minus the shared prologue) and
    /// return its successor.
    fn serialize_code_instance_body(
        &mut self,
        w: &mut dyn Write,
        c: ValueId,
    ) -> Result<Option<ValueId>, SaveError> {
        let (def, inferred, rettype, rettype_const, argescapes, min_world, max_world, ipo, purity, const_return, precompile, relocatability, next) = {
            let ci = self.rt.code_instance(c);
            (
                ci.def,
                ci.inferred,
                ci.rettype,
                ci.rettype_const,
                ci.argescapes,
                ci.min_world,
                ci.max_world,
                ci.ipo_purity_bits,
                ci.purity_bits,
                ci.const_return,
                ci.precompile,
                ci.relocatability,
                ci.next,
            )
        };
        let validate = (max_world == MAX_WORLD) as u8;
        let write_ret = validate != 0 || min_world == 0;
        if write_ret {
            if let Some(rc) = rettype_const {
                if matches!(self.rt.get(rc), Value::OpaqueClosure) {
                    return Err(SaveError::PartialOpaqueReturn);
                }
            }
        }
        let flags = validate | ((const_return as u8) << 2) | ((precompile as u8) << 3);
        write_u8(w, Tag::CodeInstance as u8)?;
        write_u8(w, flags)?;
        write_u32(w, ipo)?;
        write_u32(w, purity)?;
        self.serialize_value(w, Some(def))?;
        if write_ret {
            self.serialize_value(w, inferred)?;
            self.serialize_value(w, rettype_const)?;
            self.serialize_value(w, Some(rettype))?;
            self.serialize_value(w, argescapes)?;
        } else {
            // closed-world instance: drop the useless payload
            let wk = self.rt.well_known();
            let (any, nothing) = (wk.any_type, wk.nothing);
            self.serialize_value(w, None)?;
            self.serialize_value(w, None)?;
            self.serialize_value(w, Some(any))?;
            self.serialize_value(w, Some(nothing))?;
        }
        write_u8(w, relocatability)?;
        Ok(next)
    }

    fn serialize_method_table(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let (name, module, entries, backedges) = {
            let mt = self.rt.method_table(id);
            let entries: Vec<_> = mt
                .entries
                .iter()
                .map(|e| (e.method, e.simple_sig, e.min_world, e.max_world))
                .collect();
            (mt.name, mt.module, entries, mt.backedges.clone())
        };
        write_u8(w, Tag::MethodTable as u8)?;
        self.serialize_value(w, Some(name))?;
        self.serialize_value(w, Some(module))?;
        write_i32(w, entries.len() as i32)?;
        for (method, simple_sig, min_world, max_world) in entries {
            self.serialize_value(w, Some(method))?;
            self.serialize_value(w, simple_sig)?;
            write_u64(w, min_world)?;
            write_u64(w, max_world)?;
        }
        write_i32(w, backedges.len() as i32)?;
        for (sig, caller) in backedges {
            self.serialize_value(w, Some(sig))?;
            self.serialize_value(w, Some(caller))?;
        }
        Ok(())
    }

    fn serialize_iddict(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let pairs = {
            let Value::IdDict(d) = self.rt.get(id) else { unreachable!() };
            d.pairs.clone()
        };
        write_u8(w, Tag::IdDict as u8)?;
        write_i32(w, pairs.len() as i32)?;
        for (k, v) in pairs {
            self.serialize_value(w, Some(k))?;
            self.serialize_value(w, Some(v))?;
        }
        Ok(())
    }

    fn serialize_struct(&mut self, w: &mut dyn Write, id: ValueId) -> Result<(), SaveError> {
        let (ty, fields) = {
            let Value::Struct(sv) = self.rt.get(id) else { unreachable!() };
            (sv.ty, sv.fields.clone())
        };
        if self.rt.datatype(ty).instance == Some(id) {
            // a singleton: emit the type; the reader takes its instance
            if !self.type_in_worklist(ty) {
                self.backrefs.mark_flagged(id);
            }
            write_u8(w, Tag::Singleton as u8)?;
            return self.serialize_value(w, Some(ty));
        }
        debug_assert!(
            self.rt.datatype(ty).instance.is_none(),
            "struct of a singleton type is not the singleton"
        );
        if self.rt.type_is_foreign(ty) {
            return Err(SaveError::Unserializable(
                "an instance of a foreign datatype",
            ));
        }
        let size = self.rt.datatype(ty).size;
        if size <= 255 {
            write_u8(w, Tag::ShortGeneral as u8)?;
            write_u8(w, size as u8)?;
        } else {
            write_u8(w, Tag::General as u8)?;
            write_i32(w, size as i32)?;
        }
        self.serialize_value(w, Some(ty))?;
        let mutable = self.rt.type_is_mutable(ty);
        for f in fields {
            match f {
                FieldVal::Bits(b) => w.write_all(&b)?,
                FieldVal::Ref(r) => {
                    match mutable.then(|| self.is_resettable_ptr(r)).flatten() {
                        Some(pty) => self.serialize_cnull(w, pty)?,
                        None => self.serialize_value(w, r)?,
                    }
                }
            }
        }
        Ok(())
    }
}
