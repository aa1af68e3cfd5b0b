pub mod dispatch;
pub mod method;
pub mod module;
pub mod special;
pub mod symbol;
pub mod types;
pub mod value;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub use method::{CodeInstance, Method, MethodInstance, MethodTable, MethodTableEntry, MAX_WORLD};
pub use module::{Binding, BindingFlags, Module, Uuid};
pub use special::{bootstrap, WellKnown};
pub use symbol::SymbolTable;
pub use types::{
    DataType, FieldKind, Layout, LayoutDesc, TypeFlags, TypeName, TypeNameFlags, TypeVar, UnionAll,
};
pub use value::{for_each_ref, ArrayData, ArrayVal, BigNum, FieldVal, IdDict, StructVal, Value, ValueId};

/// A file the current compilation depends on, as registered by `include`.
pub struct DepRecord {
    /// The module that evaluated the file.
    pub module: ValueId,
    pub path: String,
    pub mtime: f64,
}

/// The runtime: an arena of values plus the global tables the cache
/// serializer reads and reconciles against.
///
/// The arena owns every entity; [`ValueId`]s are stable for the lifetime of
/// the runtime. Only the symbol table and the world counter are shared
/// across threads; everything else is reached through `&mut Runtime`.
pub struct Runtime {
    arena: Vec<Value>,
    pub symbols: SymbolTable,
    well_known: Option<WellKnown>,
    /// (type name, parameter hash) → candidate canonical types.
    type_cache: HashMap<(ValueId, u64), Vec<ValueId>, ahash::RandomState>,
    world: AtomicU64,
    gc_enabled: Cell<bool>,
    finalizers_disabled: Cell<bool>,
    /// Top-level modules loaded in this session, in load order.
    pub loaded_modules: Vec<ValueId>,
    /// Method instances inferred during the current precompilation,
    /// registered via [`set_newly_inferred`](Self::set_newly_inferred).
    pub newly_inferred: Vec<ValueId>,
    /// Modules whose initializers must run after a load, in order.
    pub module_init_order: Vec<ValueId>,
    /// Include-dependencies recorded during compilation.
    pub require_dependencies: Vec<DepRecord>,
    /// Entities invalidated during reconciliation, with the pass that did
    /// it. Drives the invalidation debug log.
    pub invalidation_log: Vec<(ValueId, &'static str)>,
}

impl Runtime {
    pub(crate) fn empty() -> Self {
        Self {
            arena: Vec::with_capacity(1024),
            symbols: SymbolTable::new(),
            well_known: None,
            type_cache: HashMap::default(),
            world: AtomicU64::new(1),
            gc_enabled: Cell::new(true),
            finalizers_disabled: Cell::new(false),
            loaded_modules: Vec::new(),
            newly_inferred: Vec::new(),
            module_init_order: Vec::new(),
            require_dependencies: Vec::new(),
            invalidation_log: Vec::new(),
        }
    }

    // ── arena ──────────────────────────────────────────────────────

    pub fn alloc(&mut self, v: Value) -> ValueId {
        let id = ValueId::new(self.arena.len());
        self.arena.push(v);
        id
    }

    #[inline(always)]
    pub fn get(&self, id: ValueId) -> &Value {
        &self.arena[id.index()]
    }

    #[inline(always)]
    pub fn get_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.arena[id.index()]
    }

    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    pub fn well_known(&self) -> &WellKnown {
        self.well_known
            .as_ref()
            .expect("runtime not bootstrapped")
    }

    pub(crate) fn set_well_known(&mut self, wk: WellKnown) {
        debug_assert!(self.well_known.is_none());
        self.well_known = Some(wk);
    }

    // ── typed accessors ────────────────────────────────────────────
    //
    // Reaching a cell of the wrong kind is a corrupted-graph bug, not a
    // recoverable condition; these panic the way the original aborts.

    pub fn module(&self, id: ValueId) -> &Module {
        match self.get(id) {
            Value::Module(m) => m,
            v => panic!("expected module, found {}", v.kind_name()),
        }
    }

    pub fn module_mut(&mut self, id: ValueId) -> &mut Module {
        match self.get_mut(id) {
            Value::Module(m) => m,
            v => panic!("expected module, found {}", v.kind_name()),
        }
    }

    pub fn datatype(&self, id: ValueId) -> &DataType {
        match self.get(id) {
            Value::DataType(dt) => dt,
            v => panic!("expected datatype, found {}", v.kind_name()),
        }
    }

    pub fn datatype_mut(&mut self, id: ValueId) -> &mut DataType {
        match self.get_mut(id) {
            Value::DataType(dt) => dt,
            v => panic!("expected datatype, found {}", v.kind_name()),
        }
    }

    pub fn typename(&self, id: ValueId) -> &TypeName {
        match self.get(id) {
            Value::TypeName(tn) => tn,
            v => panic!("expected typename, found {}", v.kind_name()),
        }
    }

    pub fn typename_mut(&mut self, id: ValueId) -> &mut TypeName {
        match self.get_mut(id) {
            Value::TypeName(tn) => tn,
            v => panic!("expected typename, found {}", v.kind_name()),
        }
    }

    pub fn method(&self, id: ValueId) -> &Method {
        match self.get(id) {
            Value::Method(m) => m,
            v => panic!("expected method, found {}", v.kind_name()),
        }
    }

    pub fn method_mut(&mut self, id: ValueId) -> &mut Method {
        match self.get_mut(id) {
            Value::Method(m) => m,
            v => panic!("expected method, found {}", v.kind_name()),
        }
    }

    pub fn method_instance(&self, id: ValueId) -> &MethodInstance {
        match self.get(id) {
            Value::MethodInstance(mi) => mi,
            v => panic!("expected method instance, found {}", v.kind_name()),
        }
    }

    pub fn method_instance_mut(&mut self, id: ValueId) -> &mut MethodInstance {
        match self.get_mut(id) {
            Value::MethodInstance(mi) => mi,
            v => panic!("expected method instance, found {}", v.kind_name()),
        }
    }

    pub fn code_instance(&self, id: ValueId) -> &CodeInstance {
        match self.get(id) {
            Value::CodeInstance(ci) => ci,
            v => panic!("expected code instance, found {}", v.kind_name()),
        }
    }

    pub fn code_instance_mut(&mut self, id: ValueId) -> &mut CodeInstance {
        match self.get_mut(id) {
            Value::CodeInstance(ci) => ci,
            v => panic!("expected code instance, found {}", v.kind_name()),
        }
    }

    pub fn method_table(&self, id: ValueId) -> &MethodTable {
        match self.get(id) {
            Value::MethodTable(mt) => mt,
            v => panic!("expected method table, found {}", v.kind_name()),
        }
    }

    pub fn method_table_mut(&mut self, id: ValueId) -> &mut MethodTable {
        match self.get_mut(id) {
            Value::MethodTable(mt) => mt,
            v => panic!("expected method table, found {}", v.kind_name()),
        }
    }

    pub fn svec(&self, id: ValueId) -> &[Option<ValueId>] {
        match self.get(id) {
            Value::SVec(elems) => elems,
            v => panic!("expected svec, found {}", v.kind_name()),
        }
    }

    // ── symbols ────────────────────────────────────────────────────

    pub fn intern(&mut self, name: &str) -> ValueId {
        if let Some(id) = self.symbols.lookup(name) {
            return id;
        }
        let id = self.alloc(Value::Symbol(name.into()));
        self.symbols.insert(name, id);
        id
    }

    pub fn symbol_name(&self, id: ValueId) -> &str {
        match self.get(id) {
            Value::Symbol(name) => name,
            v => panic!("expected symbol, found {}", v.kind_name()),
        }
    }

    // ── small allocation helpers ───────────────────────────────────

    pub fn alloc_svec(&mut self, elems: Vec<Option<ValueId>>) -> ValueId {
        if elems.is_empty() {
            if let Some(wk) = &self.well_known {
                return wk.empty_svec;
            }
        }
        self.alloc(Value::SVec(elems))
    }

    pub fn alloc_svec_ids(&mut self, ids: &[ValueId]) -> ValueId {
        self.alloc_svec(ids.iter().map(|id| Some(*id)).collect())
    }

    /// Boxed integer, sharing the permanent small-value boxes.
    pub fn box_int64(&mut self, v: i64) -> ValueId {
        if let Some(wk) = &self.well_known {
            if (0..=special::SMALL_BOX_MAX as i64).contains(&v) {
                return wk.int64_boxes[v as usize];
            }
        }
        self.alloc(Value::Int64(v))
    }

    pub fn box_int32(&mut self, v: i32) -> ValueId {
        if let Some(wk) = &self.well_known {
            if (0..=special::SMALL_BOX_MAX as i32).contains(&v) {
                return wk.int32_boxes[v as usize];
            }
        }
        self.alloc(Value::Int32(v))
    }

    pub fn box_uint8(&mut self, v: u8) -> ValueId {
        self.alloc(Value::UInt8(v))
    }

    pub fn unbox_i64(&self, id: ValueId) -> i64 {
        match self.get(id) {
            Value::Int64(v) => *v,
            Value::Int32(v) => *v as i64,
            Value::UInt8(v) => *v as i64,
            v => panic!("expected integer box, found {}", v.kind_name()),
        }
    }

    // ── modules and bindings ───────────────────────────────────────

    pub fn new_module(&mut self, name: &str, parent: Option<ValueId>) -> ValueId {
        let name = self.intern(name);
        let mut module = Module::new(name, 0);
        module.primary_world = self.current_world();
        let id = self.alloc(Value::Module(module));
        let parent = parent.unwrap_or(id);
        self.module_mut(id).parent = Some(parent);
        id
    }

    pub fn get_global(&self, module: ValueId, name: ValueId) -> Option<ValueId> {
        self.module(module).binding(name).and_then(|b| b.value)
    }

    pub fn set_global_const(&mut self, module: ValueId, name: ValueId, value: ValueId) {
        let b = self.module_mut(module).binding_wr(name, module);
        b.value = Some(value);
        b.flags |= BindingFlags::CONST;
    }

    /// Whether `child` is `ancestor` or nested somewhere under it.
    pub fn is_submodule(&self, mut child: ValueId, ancestor: ValueId) -> bool {
        for _ in 0..64 {
            if child == ancestor {
                return true;
            }
            let parent = match self.module(child).parent {
                Some(p) => p,
                None => return false,
            };
            if parent == child {
                return false;
            }
            child = parent;
        }
        false
    }

    /// Module name chain from the top-level module down to `module`,
    /// excluding the top-level name itself.
    pub fn module_path(&self, module: ValueId) -> Vec<String> {
        let mut rev = Vec::new();
        let mut cur = module;
        for _ in 0..64 {
            let m = self.module(cur);
            let parent = m.parent.unwrap_or(cur);
            if parent == cur || parent == self.well_known().main_module {
                break;
            }
            rev.push(self.symbol_name(m.name).to_owned());
            cur = parent;
        }
        rev.reverse();
        rev
    }

    pub fn record_dependency(&mut self, module: ValueId, path: &str, mtime: f64) {
        self.require_dependencies.push(DepRecord {
            module,
            path: path.to_owned(),
            mtime,
        });
    }

    pub fn set_newly_inferred(&mut self, list: Vec<ValueId>) {
        self.newly_inferred = list;
    }

    // ── world counter ──────────────────────────────────────────────

    pub fn current_world(&self) -> u64 {
        self.world.load(Ordering::Acquire)
    }

    /// Advance the world and return the new value.
    pub fn bump_world(&self) -> u64 {
        self.world.fetch_add(1, Ordering::AcqRel) + 1
    }

    // ── GC / finalizer discipline ──────────────────────────────────

    /// Enable or disable collection; returns the previous state so callers
    /// can restore it on every exit path.
    pub fn gc_enable(&self, on: bool) -> bool {
        self.gc_enabled.replace(on)
    }

    pub fn gc_is_enabled(&self) -> bool {
        self.gc_enabled.get()
    }

    pub fn set_finalizers_disabled(&self, disabled: bool) {
        self.finalizers_disabled.set(disabled);
    }

    pub fn finalizers_disabled(&self) -> bool {
        self.finalizers_disabled.get()
    }

    // ── type identity ──────────────────────────────────────────────

    pub fn egal(&self, a: Option<ValueId>, b: Option<ValueId>) -> bool {
        dispatch::egal(self, a, b)
    }

    pub fn type_is_mutable(&self, ty: ValueId) -> bool {
        match self.get(ty) {
            Value::DataType(dt) => match dt.name {
                Some(tn) => self.typename(tn).is_mutable(),
                None => false,
            },
            _ => false,
        }
    }

    pub fn type_is_foreign(&self, ty: ValueId) -> bool {
        match self.get(ty) {
            Value::DataType(dt) => match dt.name {
                Some(tn) => self.typename(tn).is_foreign(),
                None => false,
            },
            _ => false,
        }
    }

    /// Whether `ty` is a native-pointer type.
    pub fn type_is_pointer(&self, ty: ValueId) -> bool {
        matches!(
            self.get(ty),
            Value::DataType(dt) if dt.layout == Some(LayoutDesc::PointerLike)
        )
    }

    fn cache_key(&self, dt: ValueId) -> Option<(ValueId, u64)> {
        let d = self.datatype(dt);
        let name = d.name?;
        Some((name, dispatch::egal_hash(self, Some(d.parameters))))
    }

    /// Find the canonical type structurally equal to `dt`, if one is cached.
    pub fn lookup_cache_type(&self, dt: ValueId) -> Option<ValueId> {
        let key = self.cache_key(dt)?;
        let params = self.datatype(dt).parameters;
        self.type_cache.get(&key)?.iter().copied().find(|&cand| {
            cand == dt
                || dispatch::egal(
                    self,
                    Some(self.datatype(cand).parameters),
                    Some(params),
                )
        })
    }

    /// Insert `dt` as the canonical instantiation for its shape.
    pub fn cache_type(&mut self, dt: ValueId) {
        if let Some(key) = self.cache_key(dt) {
            self.type_cache.entry(key).or_default().push(dt);
        }
    }

    /// Instantiate (or fetch the cached) `wrapper{params...}`.
    pub fn apply_type(&mut self, wrapper: ValueId, params: &[ValueId]) -> ValueId {
        let primary = dispatch::unwrap_unionall(self, wrapper);
        let (name, supertype, field_types, layout, size, base_flags) = {
            let dt = self.datatype(primary);
            (
                dt.name,
                dt.supertype,
                dt.field_types,
                dt.layout.clone(),
                dt.size,
                dt.flags,
            )
        };
        let parameters = self.alloc_svec_ids(params);

        let mut flags = base_flags.without(TypeFlags::HAS_FREE_TYPEVARS);
        let has_free = params
            .iter()
            .any(|p| matches!(self.get(*p), Value::TypeVar(_)));
        let all_concrete = params.iter().all(|p| match self.get(*p) {
            Value::DataType(d) => d.is_concrete(),
            Value::TypeVar(_) | Value::UnionAll(_) => false,
            // value parameters (ints, symbols) are always "concrete"
            _ => true,
        });
        let is_tuple = self
            .well_known
            .as_ref()
            .is_some_and(|wk| name == Some(wk.tuple_typename));
        if has_free {
            flags = flags.with(TypeFlags::HAS_FREE_TYPEVARS);
        } else if all_concrete {
            let abstract_ = name
                .map(|tn| self.typename(tn).is_abstract())
                .unwrap_or(false);
            if !abstract_ {
                flags = flags
                    .with(TypeFlags::CONCRETE)
                    .with(TypeFlags::CACHED_BY_HASH);
                if is_tuple {
                    flags = flags.with(TypeFlags::DISPATCH_TUPLE);
                }
            }
        }

        let hash = dispatch::egal_hash(self, Some(parameters)) as u32;
        let dt = self.alloc(Value::DataType(DataType {
            name,
            parameters,
            supertype,
            field_types,
            instance: None,
            layout,
            size,
            hash,
            flags,
        }));
        if let Some(existing) = self.lookup_cache_type(dt) {
            if existing != dt {
                return existing;
            }
        }
        self.maybe_alloc_singleton(dt);
        self.cache_type(dt);
        dt
    }

    /// Allocate the singleton instance for a zero-field immutable concrete
    /// type that lacks one.
    pub fn maybe_alloc_singleton(&mut self, dt: ValueId) {
        let needs = {
            let d = self.datatype(dt);
            let no_fields = match d.field_types {
                None => d.size == 0,
                Some(ft) => self.svec(ft).is_empty(),
            };
            let meta_ok = match d.name {
                Some(tn) => {
                    let tn = self.typename(tn);
                    !tn.is_abstract() && !tn.is_mutable()
                }
                None => false,
            };
            d.instance.is_none() && d.is_concrete() && no_fields && meta_ok
        };
        if needs {
            let inst = self.alloc(Value::Struct(StructVal {
                ty: dt,
                fields: Vec::new(),
            }));
            self.datatype_mut(dt).instance = Some(inst);
        }
    }

    /// The concrete tuple type of `params`.
    pub fn tuple_type(&mut self, params: &[ValueId]) -> ValueId {
        let wrapper = self.well_known().tuple_wrapper;
        self.apply_type(wrapper, params)
    }

    // ── methods and dispatch ───────────────────────────────────────

    pub fn method_table_for(&self, sig: ValueId) -> Option<ValueId> {
        dispatch::method_table_for(self, sig)
    }

    /// The table a method belongs to: its explicit external table when it
    /// has one, otherwise the table implied by its signature.
    pub fn method_get_table(&self, method: ValueId) -> Option<ValueId> {
        let m = self.method(method);
        m.external_mt.or_else(|| self.method_table_for(m.sig))
    }

    pub fn matching_methods(&self, sig: ValueId, world: u64) -> Option<Vec<ValueId>> {
        dispatch::matching_methods(self, sig, world)
    }

    /// Insert a method into a table at a fresh world age.
    pub fn method_table_insert(
        &mut self,
        mt: ValueId,
        method: ValueId,
        simple_sig: Option<ValueId>,
    ) -> u64 {
        let world = self.bump_world();
        self.method_table_mut(mt).entries.push(MethodTableEntry {
            method,
            simple_sig,
            min_world: world,
            max_world: MAX_WORLD,
        });
        world
    }

    pub fn method_instance_add_backedge(&mut self, callee: ValueId, caller: ValueId) {
        let mi = self.method_instance_mut(callee);
        if !mi.backedges.contains(&caller) {
            mi.backedges.push(caller);
        }
    }

    pub fn method_table_add_backedge(&mut self, mt: ValueId, sig: ValueId, caller: ValueId) {
        self.method_table_mut(mt).backedges.push((sig, caller));
    }

    /// Return the canonical specialization for `mi`'s spec types, inserting
    /// `mi` itself when its method has none yet.
    pub fn specializations_get_or_insert(&mut self, mi: ValueId) -> ValueId {
        let (def, spec_types) = {
            let m = self.method_instance(mi);
            (m.def, m.spec_types)
        };
        let existing = {
            let method = self.method(def);
            method
                .specializations
                .iter()
                .copied()
                .find(|&s| {
                    s == mi
                        || self.egal(
                            Some(self.method_instance(s).spec_types),
                            Some(spec_types),
                        )
                })
        };
        if let Some(found) = existing {
            return found;
        }
        self.method_mut(def).specializations.push(mi);
        mi
    }

    /// Close the world range of every code instance reachable backwards
    /// from `mi` and log the invalidation.
    pub fn invalidate_backedges(
        &mut self,
        mi: ValueId,
        world: u64,
        reason: &'static str,
        mut on_code_instance: impl FnMut(ValueId),
    ) {
        let mut stack = vec![mi];
        let mut seen = std::collections::HashSet::new();
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            let (cache, backedges) = {
                let m = self.method_instance(cur);
                (m.cache, m.backedges.clone())
            };
            let mut ci = cache;
            while let Some(c) = ci {
                {
                    let inst = self.code_instance_mut(c);
                    if inst.max_world == MAX_WORLD {
                        inst.max_world = world.saturating_sub(1);
                    }
                }
                on_code_instance(c);
                ci = self.code_instance(c).next;
            }
            self.invalidation_log.push((cur, reason));
            stack.extend(backedges);
        }
    }

    // ── definition helpers ─────────────────────────────────────────

    /// Define a primary type: its name record, wrapper, method table, and
    /// the const binding in `module`.
    ///
    /// `params` name the type variables of a parametric type; `fields` are
    /// `(name, type)` pairs used for both field names and the layout.
    pub fn new_primary_type(
        &mut self,
        module: ValueId,
        name: &str,
        supertype: Option<ValueId>,
        tn_flags: TypeNameFlags,
        params: &[&str],
        fields: &[(&str, ValueId)],
    ) -> ValueId {
        let name_sym = self.intern(name);
        let field_name_ids: Vec<_> = fields
            .iter()
            .map(|(fname, _)| Some(self.intern(fname)))
            .collect();
        let field_names = self.alloc_svec(field_name_ids);
        let field_ty_ids: Vec<_> = fields.iter().map(|(_, ty)| Some(*ty)).collect();
        let field_types = self.alloc_svec(field_ty_ids);

        let tvars: Vec<ValueId> = params
            .iter()
            .map(|p| {
                let pname = self.intern(p);
                self.alloc(Value::TypeVar(types::TypeVar {
                    name: pname,
                    lb: None,
                    ub: None,
                }))
            })
            .collect();
        let parameters = self.alloc_svec_ids(&tvars);

        let abstract_ = tn_flags.contains(TypeNameFlags::ABSTRACT);
        let layout_fields: Vec<FieldKind> = fields
            .iter()
            .map(|(_, ty)| match self.get(*ty) {
                Value::DataType(d) if d.flags.contains(TypeFlags::BITS) => {
                    FieldKind::Bits(d.size)
                }
                _ => FieldKind::Ref,
            })
            .collect();
        let layout = Layout::new(layout_fields);
        let size = layout.size;
        let mut flags = TypeFlags::NONE;
        if !tvars.is_empty() {
            flags = flags.with(TypeFlags::HAS_FREE_TYPEVARS);
        } else if !abstract_ {
            flags = flags.with(TypeFlags::CONCRETE);
        }
        let layout = if abstract_ {
            None
        } else if fields.is_empty() {
            Some(LayoutDesc::NothingLike)
        } else {
            Some(LayoutDesc::Custom(layout))
        };

        let dt = self.alloc(Value::DataType(DataType {
            name: None,
            parameters,
            supertype,
            field_types: if abstract_ { None } else { Some(field_types) },
            instance: None,
            layout,
            size,
            hash: stable_name_hash(name) as u32,
            flags,
        }));

        let mt = self.alloc(Value::MethodTable(MethodTable {
            name: name_sym,
            module,
            entries: Vec::new(),
            backedges: Vec::new(),
        }));

        let tn = self.alloc(Value::TypeName(TypeName {
            module,
            name: name_sym,
            field_names,
            wrapper: dt,
            method_table: Some(mt),
            hash: stable_name_hash(name),
            flags: tn_flags,
            max_methods: 0,
            n_uninitialized: 0,
            atomic_fields: Vec::new(),
            const_fields: Vec::new(),
        }));
        self.datatype_mut(dt).name = Some(tn);

        let mut wrapper = dt;
        for var in tvars.iter().rev() {
            wrapper = self.alloc(Value::UnionAll(types::UnionAll {
                var: *var,
                body: wrapper,
            }));
        }
        self.typename_mut(tn).wrapper = wrapper;

        self.maybe_alloc_singleton(dt);
        self.cache_type(dt);
        self.set_global_const(module, name_sym, wrapper);
        dt
    }

    /// Define a generic function: a zero-field singleton type whose name
    /// record carries the method table.
    pub fn new_generic_function(&mut self, module: ValueId, name: &str) -> ValueId {
        let any = self.well_known().any_type;
        self.new_primary_type(
            module,
            name,
            Some(any),
            TypeNameFlags::empty(),
            &[],
            &[],
        )
    }

    /// The singleton instance of a function type.
    pub fn function_instance(&self, ftype: ValueId) -> ValueId {
        self.datatype(ftype)
            .instance
            .expect("function type has no instance")
    }

    /// Define a method `name(args...)` on `ftype`'s table and return it.
    pub fn add_method(
        &mut self,
        module: ValueId,
        ftype: ValueId,
        arg_types: &[ValueId],
        file: &str,
        line: i32,
    ) -> ValueId {
        let mut sig_params = vec![ftype];
        sig_params.extend_from_slice(arg_types);
        let sig = self.tuple_type(&sig_params);
        let (name_sym, mt) = {
            let tn = self.datatype(ftype).name.expect("function type unnamed");
            let tn = self.typename(tn);
            (tn.name, tn.method_table.expect("function has no table"))
        };
        let file_sym = self.intern(file);
        let method = self.alloc(Value::Method(Method {
            sig,
            module,
            external_mt: None,
            specializations: Vec::new(),
            name: name_sym,
            file: file_sym,
            line,
            called: 0,
            nargs: arg_types.len() as i32 + 1,
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
            deleted_world: MAX_WORLD,
        }));
        let world = self.method_table_insert(mt, method, None);
        self.method_mut(method).primary_world = world;
        method
    }

    /// Create a specialization of `method` for concrete `arg_types`.
    pub fn new_method_instance(
        &mut self,
        method: ValueId,
        arg_types: &[ValueId],
    ) -> ValueId {
        let ftype = {
            let sig = self.method(method).sig;
            let sig = dispatch::unwrap_unionall(self, sig);
            self.svec(self.datatype(sig).parameters)[0].expect("empty signature")
        };
        let mut spec_params = vec![ftype];
        spec_params.extend_from_slice(arg_types);
        let spec_types = self.tuple_type(&spec_params);
        let empty = self.well_known().empty_svec;
        let mi = self.alloc(Value::MethodInstance(MethodInstance {
            def: method,
            spec_types,
            sparam_vals: Some(empty),
            uninferred: None,
            backedges: Vec::new(),
            callbacks: None,
            cache: None,
            precompiled: false,
        }));
        self.method_mut(method).specializations.push(mi);
        mi
    }

    /// Attach a fresh code instance (open world range) to `mi`.
    pub fn new_code_instance(&mut self, mi: ValueId, rettype: ValueId) -> ValueId {
        let world = self.current_world();
        let prev = self.method_instance(mi).cache;
        let ci = self.alloc(Value::CodeInstance(CodeInstance {
            def: mi,
            inferred: None,
            rettype,
            rettype_const: None,
            argescapes: None,
            min_world: world,
            max_world: MAX_WORLD,
            ipo_purity_bits: 0,
            purity_bits: 0,
            const_return: false,
            precompile: false,
            relocatability: 1,
            next: prev,
        }));
        self.method_instance_mut(mi).cache = Some(ci);
        ci
    }

    /// Allocate a one-dimensional array of reference slots.
    pub fn alloc_value_array(
        &mut self,
        elem_ty: ValueId,
        values: Vec<Option<ValueId>>,
    ) -> ValueId {
        let wrapper = self.well_known().array_wrapper;
        let ty = self.apply_type(wrapper, &[elem_ty]);
        let dims = vec![values.len() as u64];
        self.alloc(Value::Array(ArrayVal {
            ty,
            elem_ty,
            dims,
            data: ArrayData::Values(values),
        }))
    }

    /// Allocate a one-dimensional bits array of 32-bit integers.
    pub fn alloc_i32_array(&mut self, values: &[i32]) -> ValueId {
        let elem_ty = self.well_known().int32_type;
        let wrapper = self.well_known().array_wrapper;
        let ty = self.apply_type(wrapper, &[elem_ty]);
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.alloc(Value::Array(ArrayVal {
            ty,
            elem_ty,
            dims: vec![values.len() as u64],
            data: ArrayData::Bytes { elsize: 4, bytes },
        }))
    }

    /// Read a bits array of 32-bit integers back out.
    pub fn i32_array_values(&self, id: ValueId) -> Vec<i32> {
        match self.get(id) {
            Value::Array(ar) => match &ar.data {
                ArrayData::Bytes { elsize: 4, bytes } => bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
                _ => panic!("expected i32 bits array"),
            },
            v => panic!("expected array, found {}", v.kind_name()),
        }
    }

    /// The dynamic type of a boxed value, where one exists.
    pub fn value_type_of(&self, id: ValueId) -> Option<ValueId> {
        let wk = self.well_known();
        match self.get(id) {
            Value::Int64(_) => Some(wk.int64_type),
            Value::Int32(_) => Some(wk.int32_type),
            Value::UInt8(_) => Some(wk.uint8_type),
            Value::Str(_) => Some(wk.string_type),
            Value::BigNum(_) => Some(wk.bigint_type),
            Value::Ptr { ty, .. } => Some(*ty),
            Value::Array(ar) => Some(ar.ty),
            Value::Struct(sv) => Some(sv.ty),
            _ => None,
        }
    }
}

/// Session-stable hash of a definition name.
fn stable_name_hash(name: &str) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for b in name.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_identity() {
        let mut rt = bootstrap();
        let a = rt.intern("foo");
        let b = rt.intern("foo");
        let c = rt.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(rt.symbol_name(a), "foo");
    }

    #[test]
    fn small_boxes_are_shared() {
        let mut rt = bootstrap();
        assert_eq!(rt.box_int64(7), rt.box_int64(7));
        assert_ne!(rt.box_int64(1234), rt.box_int64(1234));
        let big = rt.box_int64(1234);
        assert_eq!(rt.unbox_i64(big), 1234);
    }

    #[test]
    fn apply_type_unifies_instantiations() {
        let mut rt = bootstrap();
        let wk = rt.well_known();
        let (ptr, int64) = (wk.ptr_wrapper, wk.int64_type);
        let a = rt.apply_type(ptr, &[int64]);
        let b = rt.apply_type(ptr, &[int64]);
        assert_eq!(a, b);
        let uint8 = rt.well_known().uint8_type;
        let c = rt.apply_type(ptr, &[uint8]);
        assert_ne!(a, c);
    }

    #[test]
    fn tuple_subtyping_is_covariant() {
        let mut rt = bootstrap();
        let wk = rt.well_known();
        let (any, int64) = (wk.any_type, wk.int64_type);
        let concrete = rt.tuple_type(&[int64]);
        let loose = rt.tuple_type(&[any]);
        assert!(dispatch::subtype(&rt, concrete, loose));
        assert!(!dispatch::subtype(&rt, loose, concrete));
        assert!(dispatch::morespecific(&rt, concrete, loose));
    }

    #[test]
    fn dispatch_prefers_more_specific_method() {
        let mut rt = bootstrap();
        let base = rt.well_known().base_module;
        let f = rt.new_generic_function(base, "f");
        let any = rt.well_known().any_type;
        let int64 = rt.well_known().int64_type;
        let m_any = rt.add_method(base, f, &[any], "base.jl", 1);
        let world1 = rt.current_world();
        let call = rt.tuple_type(&[f, int64]);
        assert_eq!(rt.matching_methods(call, world1), Some(vec![m_any]));

        let m_int = rt.add_method(base, f, &[int64], "base.jl", 2);
        let world2 = rt.current_world();
        let matches = rt.matching_methods(call, world2).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(dispatch::dispatch_method(&rt, call, world2), Some(m_int));
        // the old world still sees only the old method
        assert_eq!(rt.matching_methods(call, world1), Some(vec![m_any]));
    }

    #[test]
    fn gc_enable_reports_previous_state() {
        let rt = bootstrap();
        assert!(rt.gc_is_enabled());
        let en = rt.gc_enable(false);
        assert!(en);
        assert!(!rt.gc_is_enabled());
        // nested disable restores correctly
        let en2 = rt.gc_enable(false);
        assert!(!en2);
        rt.gc_enable(en2);
        rt.gc_enable(en);
        assert!(rt.gc_is_enabled());
    }

    #[test]
    fn method_roots_by_key() {
        let mut rt = bootstrap();
        let base = rt.well_known().base_module;
        let f = rt.new_generic_function(base, "g");
        let any = rt.well_known().any_type;
        let m = rt.add_method(base, f, &[any], "base.jl", 3);
        let r1 = rt.box_int64(100_000);
        let r2 = rt.box_int64(200_000);
        let r3 = rt.box_int64(300_000);
        {
            let method = rt.method_mut(m);
            method.roots.push(r1);
            method.append_roots_key(0xABCD, [r2, r3]);
        }
        let method = rt.method(m);
        assert_eq!(method.nroots_with_key(0), 1);
        assert_eq!(method.nroots_with_key(0xABCD), 2);
        let idxs: Vec<_> = method.iter_roots_with_key(0xABCD).collect();
        assert_eq!(idxs, vec![1, 2]);
    }
}
