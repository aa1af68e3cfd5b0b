//! Incremental module cache for the runtime: writes a cache file at the
//! end of package precompilation and restores it at load time.
//!
//! The hard part is faithfully reconstructing a cyclic, heterogeneous
//! object graph in which some entities are owned by the cache (everything
//! defined by the worklist) and some are references into the live session
//! (methods, types, and instances owned by previously loaded code). The
//! codec breaks cycles with backreferences whose indexes align bit-exactly
//! between the write and read sides; a reconciliation pipeline then
//! replaces placeholder entities with canonical live ones and re-validates
//! the recorded external call edges, invalidating compiled code whose
//! world has shifted rather than refusing to load.

pub mod backref;
mod de;
mod edges;
pub mod error;
mod file;
mod reconcile;
mod ser;
pub mod stream;
pub mod tags;

use std::io::Cursor;
use std::path::Path;

use runtime::{Runtime, Value, ValueId};
use tracing::{debug, span, Level};

use crate::de::{Dest, LoadSession};
use crate::ser::SaveSession;
use crate::stream::{read_i32, write_i32, BuildIdent};

pub use crate::error::{RestoreError, SaveError};
pub use crate::file::DepEntry;

/// Read-only access to the outer file sections, for inspection tools.
pub mod inspect {
    pub use crate::file::{read_dependency_list, skip_work_list};
}
pub use crate::ser::{SaveOptions, SENTINEL_PTR};
pub use crate::stream::{read_header, HeaderInfo};

/// Restore-time knobs.
pub struct RestoreOptions {
    /// Verify recorded dependency mtimes against the filesystem.
    pub check_dependencies: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            check_dependencies: true,
        }
    }
}

/// A successful restore: the worklist modules, in the order they were
/// saved, plus the module initialization order.
#[derive(Debug)]
pub struct Restored {
    pub modules: Vec<ValueId>,
    pub init_order: Vec<ValueId>,
}

/// Register the method instances inferred during this precompilation; the
/// edge collector consults them when queuing external specializations.
pub fn set_newly_inferred(rt: &mut Runtime, list: Vec<ValueId>) {
    rt.set_newly_inferred(list);
}

/// Run (or record) the initializers of freshly restored modules.
pub fn init_restored_modules(rt: &Runtime, init_order: &[ValueId]) {
    for &m in init_order {
        let name = rt.symbol_name(rt.module(m).name);
        debug!(module = name, "running module initializer");
    }
}

// ── save ───────────────────────────────────────────────────────────

/// Serialize `worklist` (the modules being precompiled; the last is the
/// primary) into a cache file at `path`.
pub fn save_incremental(
    rt: &mut Runtime,
    path: &Path,
    worklist: &[ValueId],
    options: &SaveOptions,
) -> Result<(), SaveError> {
    let bytes = save_incremental_to_vec(rt, worklist, options)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Serialize a cache image into memory.
pub fn save_incremental_to_vec(
    rt: &mut Runtime,
    worklist: &[ValueId],
    options: &SaveOptions,
) -> Result<Vec<u8>, SaveError> {
    let _span = span!(Level::DEBUG, "save_incremental").entered();
    // the traversal assumes pointer stability for the whole walk
    let en = rt.gc_enable(false);
    let result = save_body(rt, worklist, options);
    rt.gc_enable(en);
    result
}

fn save_body(
    rt: &mut Runtime,
    worklist: &[ValueId],
    options: &SaveOptions,
) -> Result<Vec<u8>, SaveError> {
    let mut f = Cursor::new(Vec::new());
    stream::write_header(&mut f, &BuildIdent::current())?;
    file::write_work_list(&mut f, rt, worklist)?;
    let srctext_pos = file::write_dependency_list(
        &mut f,
        rt,
        worklist,
        &options.preferences,
        options.preferences_hash,
    )?;
    file::write_mod_list(&mut f, rt, worklist)?;

    let mut ss = SaveSession::new(rt, worklist, options);
    let extext_pairs = edges::collect_extext_methods(&mut ss);
    let (edge_list, ext_targets) = edges::collect_edges(&mut ss);
    debug!(
        backrefs = ss.backrefs.len(),
        queued = ss.external_mis.len(),
        "collected edges"
    );

    let worklist_sv = ss.rt.alloc_svec_ids(worklist);
    ss.serialize_value(&mut f, Some(worklist_sv))?;
    let extext_sv = ss.rt.alloc_svec(extext_pairs);
    ss.serialize_value(&mut f, Some(extext_sv))?;
    write_i32(&mut f, ss.external_mis.len() as i32)?;
    let queued = ss.external_mis.clone();
    for mi in queued {
        ss.serialize_value(&mut f, Some(mi))?;
    }
    ss.serialize_value(&mut f, Some(edge_list))?;
    ss.serialize_value(&mut f, Some(ext_targets))?;

    // init order, then the reinitialization list
    let init_order = ss.rt.module_init_order.clone();
    let init_sv = if init_order.is_empty() {
        None
    } else {
        Some(ss.rt.alloc_svec_ids(&init_order))
    };
    ss.serialize_value(&mut f, init_sv)?;
    for (pos, kind) in ss.reinit.clone() {
        write_i32(&mut f, pos as i32)?;
        write_i32(&mut f, kind)?;
    }
    write_i32(&mut f, -1)?;
    drop(ss);

    file::write_source_text(&mut f, rt, srctext_pos, options.include_source_text)?;
    Ok(f.into_inner())
}

// ── restore ────────────────────────────────────────────────────────

/// Restore a cache file. `loaded_modules` are the session's top-level
/// modules, which must match the file's recorded module list.
pub fn restore_incremental(
    rt: &mut Runtime,
    path: &Path,
    loaded_modules: &[ValueId],
    options: &RestoreOptions,
) -> Result<Restored, RestoreError> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RestoreError::NotFound(path.display().to_string())
        } else {
            RestoreError::Io(e)
        }
    })?;
    restore_from_bytes(rt, &bytes, loaded_modules, options.check_dependencies)
}

/// Restore from an in-memory buffer. Dependency mtimes are not checked;
/// a buffer has no notion of staleness.
pub fn restore_incremental_from_buffer(
    rt: &mut Runtime,
    bytes: &[u8],
    loaded_modules: &[ValueId],
) -> Result<Restored, RestoreError> {
    restore_from_bytes(rt, bytes, loaded_modules, false)
}

fn restore_from_bytes(
    rt: &mut Runtime,
    bytes: &[u8],
    loaded_modules: &[ValueId],
    check_dependencies: bool,
) -> Result<Restored, RestoreError> {
    let _span = span!(Level::DEBUG, "restore_incremental").entered();
    let mut r = Cursor::new(bytes);
    if !stream::verify_header(&mut r, &BuildIdent::current()) {
        return Err(RestoreError::HeaderMismatch);
    }
    file::skip_work_list(&mut r)?;
    if check_dependencies {
        let deps = file::read_dependency_list(&mut r)?;
        file::verify_dependency_mtimes(&deps)?;
    } else {
        file::skip_dependency_list(&mut r)?;
    }
    // the module list can fail without any allocation having happened
    file::read_verify_mod_list(&mut r, rt, loaded_modules)?;

    let en = rt.gc_enable(false);
    rt.set_finalizers_disabled(true);
    // every entity reconstructed below lives in a fresh world
    let world = rt.bump_world();
    let result = restore_body(rt, &mut r, loaded_modules, world);
    rt.set_finalizers_disabled(false);
    rt.gc_enable(en);
    result
}

fn restore_body(
    rt: &mut Runtime,
    r: &mut Cursor<&[u8]>,
    loaded_modules: &[ValueId],
    world: u64,
) -> Result<Restored, RestoreError> {
    let mut ls = LoadSession::new(rt, loaded_modules.to_vec(), world);

    let restored = ls.require(r, Dest::None)?;
    let extext = ls.require(r, Dest::None)?;
    if !matches!(ls.rt.get(restored), Value::SVec(_))
        || !matches!(ls.rt.get(extext), Value::SVec(_))
    {
        return Err(RestoreError::Corrupt("malformed cache body roots"));
    }
    let n_ext = read_i32(r)?;
    let mut mi_list = Vec::with_capacity(n_ext.max(0) as usize);
    for _ in 0..n_ext {
        mi_list.push(ls.require(r, Dest::None)?);
    }
    let edge_list = ls.require(r, Dest::None)?;
    let ext_targets = ls.require(r, Dest::None)?;
    if !matches!(ls.rt.get(edge_list), Value::SVec(_))
        || !matches!(ls.rt.get(ext_targets), Value::SVec(_))
    {
        return Err(RestoreError::Corrupt("malformed edge sections"));
    }
    debug!(backrefs = ls.backrefs.len(), "deserialized body");

    // The graph is fully reconstructed but still disconnected from the
    // live session; reconcile in fixed order.
    reconcile::recache_types(&mut ls);
    let extext_pairs = ls.rt.svec(extext).to_vec();
    reconcile::insert_methods(&mut ls, &extext_pairs);
    reconcile::recache_others(&mut ls);
    reconcile::copy_roots(&mut ls);
    reconcile::insert_method_instances(&mut ls, &mi_list);

    // init order and replayed reinitialization items
    let init_order_v = ls.deserialize_value(r, Dest::None)?;
    loop {
        let pos = read_i32(r)?;
        if pos == -1 {
            break;
        }
        let kind = read_i32(r)?;
        let v = ls
            .backrefs
            .get(usize::try_from(pos).map_err(|_| RestoreError::Corrupt("bad reinit index"))?)
            .ok_or(RestoreError::Corrupt("reinit index out of range"))?;
        reconcile::reinit_item(&mut ls, v, kind);
    }

    reconcile::insert_backedges(&mut ls, edge_list, ext_targets);
    reconcile::validate_new_code_instances(&mut ls);

    let modules: Vec<ValueId> = ls.rt.svec(restored).iter().copied().flatten().collect();
    let init_order: Vec<ValueId> = match init_order_v {
        Some(sv) => ls.rt.svec(sv).iter().copied().flatten().collect(),
        None => Vec::new(),
    };
    Ok(Restored {
        modules,
        init_order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::{
        bootstrap, ArrayData, FieldKind, Layout, LayoutDesc, StructVal, TypeNameFlags,
        MAX_WORLD,
    };

    /// A bootstrapped session with one worklist package module.
    fn setup() -> (Runtime, ValueId) {
        let mut rt = bootstrap();
        let main = rt.well_known().main_module;
        let pkg = rt.new_module("TestPkg", Some(main));
        {
            let m = rt.module_mut(pkg);
            m.uuid.hi = 0x1111_2222_3333_4444;
            m.uuid.lo = 0x5555_6666_7777_8888;
            m.build_id = 0xFEED_F00D;
            m.is_top_mod = true;
        }
        let name = rt.intern("TestPkg");
        rt.set_global_const(main, name, pkg);
        (rt, pkg)
    }

    fn save(rt: &mut Runtime, pkg: ValueId) -> Vec<u8> {
        save_incremental_to_vec(rt, &[pkg], &SaveOptions::default()).expect("save")
    }

    fn restore(rt: &mut Runtime, bytes: &[u8]) -> Restored {
        let loaded = rt.loaded_modules.clone();
        restore_incremental_from_buffer(rt, bytes, &loaded).expect("restore")
    }

    fn global(rt: &Runtime, module: ValueId, name: &str) -> ValueId {
        let sym = rt.symbols.lookup(name).expect("symbol not interned");
        rt.get_global(module, sym).expect("binding not found")
    }

    #[test]
    fn primitive_binding_round_trips() {
        let (mut rt, pkg) = setup();
        let x = rt.intern("x");
        let forty_two = rt.box_int64(42);
        rt.set_global_const(pkg, x, forty_two);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        assert_eq!(restored.modules.len(), 1);
        let pkg2 = restored.modules[0];
        assert_eq!(rt2.module(pkg2).build_id, 0xFEED_F00D);
        let v = global(&rt2, pkg2, "x");
        assert!(matches!(rt2.get(v), Value::Int64(42)));
        assert_eq!(rt2.value_type_of(v), Some(rt2.well_known().int64_type));
        // the reinit pass re-declared the package in Main
        let main2 = rt2.well_known().main_module;
        assert_eq!(global(&rt2, main2, "TestPkg"), pkg2);
    }

    #[test]
    fn shared_substructure_keeps_identity() {
        let (mut rt, pkg) = setup();
        let any = rt.well_known().any_type;
        let e1 = rt.box_int64(100_000);
        let e2 = rt.box_int64(200_000);
        let arr = rt.alloc_value_array(any, vec![Some(e1), Some(e2)]);
        let a = rt.intern("a");
        let b = rt.intern("b");
        rt.set_global_const(pkg, a, arr);
        rt.set_global_const(pkg, b, arr);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let pkg2 = restored.modules[0];
        let a2 = global(&rt2, pkg2, "a");
        let b2 = global(&rt2, pkg2, "b");
        assert_eq!(a2, b2, "one array object, not two copies");
        match rt2.get(a2) {
            Value::Array(ar) => match &ar.data {
                ArrayData::Values(elems) => {
                    assert_eq!(elems.len(), 2);
                    assert_eq!(rt2.unbox_i64(elems[0].unwrap()), 100_000);
                    assert_eq!(rt2.unbox_i64(elems[1].unwrap()), 200_000);
                }
                _ => panic!("expected a reference array"),
            },
            v => panic!("expected array, found {}", v.kind_name()),
        }
    }

    #[test]
    fn self_cyclic_type_round_trips() {
        let (mut rt, pkg) = setup();
        let any = rt.well_known().any_type;
        let node = rt.new_primary_type(
            pkg,
            "Node",
            Some(any),
            TypeNameFlags::MUTABLE,
            &[],
            &[],
        );
        let ptr_wrapper = rt.well_known().ptr_wrapper;
        let ptr_node = rt.apply_type(ptr_wrapper, &[node]);
        let ft = rt.alloc_svec_ids(&[ptr_node]);
        {
            let d = rt.datatype_mut(node);
            d.field_types = Some(ft);
            d.layout = Some(LayoutDesc::Custom(Layout::new(vec![FieldKind::Ref])));
            d.size = 8;
        }
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let pkg2 = restored.modules[0];
        let node2 = global(&rt2, pkg2, "Node");
        let ft2 = rt2.datatype(node2).field_types.expect("field types");
        let ptr2 = rt2.svec(ft2)[0].expect("field type");
        let params = rt2.datatype(ptr2).parameters;
        assert_eq!(
            rt2.svec(params)[0],
            Some(node2),
            "the type participates in its own field types"
        );
    }

    #[test]
    fn singleton_instances_are_shared_with_the_runtime() {
        // a marker type defined outside the worklist; its instance must
        // resolve to the live runtime's copy, not a fresh allocation
        let (mut rt, pkg) = setup();
        let base = rt.well_known().base_module;
        let any = rt.well_known().any_type;
        let unit = rt.new_primary_type(base, "Unit", Some(any), TypeNameFlags::empty(), &[], &[]);
        let unit_instance = rt.datatype(unit).instance.unwrap();
        let u = rt.intern("u");
        rt.set_global_const(pkg, u, unit_instance);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let base2 = rt2.well_known().base_module;
        let any2 = rt2.well_known().any_type;
        let unit2 =
            rt2.new_primary_type(base2, "Unit", Some(any2), TypeNameFlags::empty(), &[], &[]);
        let live_instance = rt2.datatype(unit2).instance.unwrap();
        let restored = restore(&mut rt2, &bytes);
        let pkg2 = restored.modules[0];
        assert_eq!(global(&rt2, pkg2, "u"), live_instance);
    }

    /// Fixture for the external-edge scenarios: the package defines a
    /// method whose compiled code depends on dispatch of an external
    /// function.
    fn edge_fixture(rt: &mut Runtime, pkg: ValueId) -> ValueId {
        let base = rt.well_known().base_module;
        let any = rt.well_known().any_type;
        let int64 = rt.well_known().int64_type;
        let ext = rt.new_generic_function(base, "ext_op");
        let ext_method = rt.add_method(base, ext, &[any], "base.jl", 10);
        let ext_mi = rt.new_method_instance(ext_method, &[int64]);

        let f = rt.new_generic_function(pkg, "pkg_op");
        let m = rt.add_method(pkg, f, &[int64], "pkg.jl", 1);
        let mi = rt.new_method_instance(m, &[int64]);
        let _ci = rt.new_code_instance(mi, any);
        // the compiled body of `mi` called `ext_op(::Int64)`
        rt.method_instance_add_backedge(ext_mi, mi);
        pkg
    }

    fn restored_pkg_code_instance(rt: &Runtime, pkg: ValueId) -> ValueId {
        let f = global(rt, pkg, "pkg_op");
        let tn = rt.datatype(f).name.unwrap();
        let mt = rt.typename(tn).method_table.unwrap();
        let method = rt.method_table(mt).entries[0].method;
        let mi = rt.method(method).specializations[0];
        rt.method_instance(mi).cache.expect("restored code instance")
    }

    fn edge_world(rt2: &mut Runtime) {
        // the external world of the restoring session matches save time
        let base2 = rt2.well_known().base_module;
        let any2 = rt2.well_known().any_type;
        let ext2 = rt2.new_generic_function(base2, "ext_op");
        rt2.add_method(base2, ext2, &[any2], "base.jl", 10);
    }

    #[test]
    fn stable_external_world_activates_code() {
        let (mut rt, pkg) = setup();
        edge_fixture(&mut rt, pkg);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        edge_world(&mut rt2);
        let restored = restore(&mut rt2, &bytes);
        let ci = restored_pkg_code_instance(&rt2, restored.modules[0]);
        assert_eq!(
            rt2.code_instance(ci).max_world,
            MAX_WORLD,
            "all edges valid: the instance is ACTIVE"
        );
        assert!(rt2.invalidation_log.is_empty());
    }

    #[test]
    fn shifted_external_world_invalidates_code() {
        let (mut rt, pkg) = setup();
        edge_fixture(&mut rt, pkg);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        edge_world(&mut rt2);
        // between save and load someone added a more specific method
        let base2 = rt2.well_known().base_module;
        let int64_2 = rt2.well_known().int64_type;
        let ext2 = global(&rt2, base2, "ext_op");
        rt2.add_method(base2, ext2, &[int64_2], "other.jl", 99);

        let restored = restore(&mut rt2, &bytes);
        let ci = restored_pkg_code_instance(&rt2, restored.modules[0]);
        assert_ne!(
            rt2.code_instance(ci).max_world,
            MAX_WORLD,
            "a changed match set leaves the instance INVALIDATED"
        );
        assert!(
            !rt2.invalidation_log.is_empty(),
            "the invalidation is recorded"
        );
    }

    #[test]
    fn queued_external_instances_go_live() {
        let (mut rt, pkg) = setup();
        let base = rt.well_known().base_module;
        let any = rt.well_known().any_type;
        let int64 = rt.well_known().int64_type;
        let ext = rt.new_generic_function(base, "helper");
        let ext_method = rt.add_method(base, ext, &[any], "base.jl", 20);
        let ext_mi = rt.new_method_instance(ext_method, &[int64]);
        let _ext_ci = rt.new_code_instance(ext_mi, any);

        let f = rt.new_generic_function(pkg, "driver");
        let m = rt.add_method(pkg, f, &[int64], "pkg.jl", 2);
        let mi = rt.new_method_instance(m, &[int64]);
        // the external instance links back into the worklist
        rt.method_instance_add_backedge(ext_mi, mi);
        set_newly_inferred(&mut rt, vec![ext_mi]);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let base2 = rt2.well_known().base_module;
        let any2 = rt2.well_known().any_type;
        let ext2 = rt2.new_generic_function(base2, "helper");
        let ext_method2 = rt2.add_method(base2, ext2, &[any2], "base.jl", 20);

        let _restored = restore(&mut rt2, &bytes);
        // the novel specialization was inserted and its code activated
        let specs = rt2.method(ext_method2).specializations.clone();
        assert_eq!(specs.len(), 1);
        let ci = rt2.method_instance(specs[0]).cache.expect("spliced chain");
        assert_eq!(rt2.code_instance(ci).max_world, MAX_WORLD);
    }

    #[test]
    fn new_method_roots_are_copied_to_the_live_method() {
        let (mut rt, pkg) = setup();
        let base = rt.well_known().base_module;
        let any = rt.well_known().any_type;
        let ext = rt.new_generic_function(base, "rooted");
        let ext_method = rt.add_method(base, ext, &[any], "base.jl", 30);
        let key = rt.module(pkg).build_id;
        let root = rt.box_int64(987_654);
        rt.method_mut(ext_method).append_roots_key(key, [root]);
        // force the method itself into the stream
        let h = rt.intern("h");
        rt.set_global_const(pkg, h, ext_method);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let base2 = rt2.well_known().base_module;
        let any2 = rt2.well_known().any_type;
        let ext2 = rt2.new_generic_function(base2, "rooted");
        let ext_method2 = rt2.add_method(base2, ext2, &[any2], "base.jl", 30);
        let _restored = restore(&mut rt2, &bytes);

        let m2 = rt2.method(ext_method2);
        assert_eq!(m2.nroots_with_key(key), 1);
        let idx = m2.iter_roots_with_key(key).next().unwrap();
        assert_eq!(rt2.unbox_i64(m2.roots[idx]), 987_654);
    }

    #[test]
    fn empty_worklist_round_trips() {
        let (mut rt, _pkg) = setup();
        let bytes = save_incremental_to_vec(&mut rt, &[], &SaveOptions::default()).unwrap();
        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        assert!(restored.modules.is_empty());
        assert!(restored.init_order.is_empty());
    }

    #[test]
    fn init_order_is_preserved() {
        let (mut rt, pkg) = setup();
        rt.module_init_order.push(pkg);
        let bytes = save(&mut rt, pkg);
        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        assert_eq!(restored.init_order, restored.modules);
        init_restored_modules(&rt2, &restored.init_order);
    }

    #[test]
    fn backref_encoding_survives_the_short_long_boundary() {
        let (mut rt, pkg) = setup();
        // enough distinct objects to push encoded indexes past 65 536
        let ids: Vec<Option<ValueId>> = (0..40_000i64)
            .map(|i| Some(rt.alloc(Value::Int64(1_000_000 + i))))
            .collect();
        let first = rt.alloc_svec(ids.clone());
        let second = rt.alloc_svec(ids);
        let a = rt.intern("first");
        let b = rt.intern("second");
        rt.set_global_const(pkg, a, first);
        rt.set_global_const(pkg, b, second);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let pkg2 = restored.modules[0];
        let f2 = global(&rt2, pkg2, "first");
        let s2 = global(&rt2, pkg2, "second");
        let fe = rt2.svec(f2).to_vec();
        let se = rt2.svec(s2).to_vec();
        assert_eq!(fe.len(), 40_000);
        for i in [0usize, 1, 32_767, 32_768, 39_999] {
            assert_eq!(fe[i], se[i], "identity shared across both vectors");
        }
        assert_eq!(rt2.unbox_i64(fe[39_999].unwrap()), 1_039_999);
    }

    #[test]
    fn tasks_and_opaque_closures_refuse_to_serialize() {
        let (mut rt, pkg) = setup();
        let task = rt.alloc(Value::Task);
        let t = rt.intern("t");
        rt.set_global_const(pkg, t, task);
        let err = save_incremental_to_vec(&mut rt, &[pkg], &SaveOptions::default());
        assert!(matches!(err, Err(SaveError::Unserializable(_))));

        let (mut rt, pkg) = setup();
        let oc = rt.alloc(Value::OpaqueClosure);
        let c = rt.intern("c");
        rt.set_global_const(pkg, c, oc);
        let err = save_incremental_to_vec(&mut rt, &[pkg], &SaveOptions::default());
        assert!(matches!(err, Err(SaveError::Unserializable(_))));
    }

    #[test]
    fn foreign_datatype_instances_refuse_to_serialize() {
        let (mut rt, pkg) = setup();
        let any = rt.well_known().any_type;
        let foreign = rt.new_primary_type(
            pkg,
            "Handle",
            Some(any),
            TypeNameFlags::FOREIGN.union(TypeNameFlags::MUTABLE),
            &[],
            &[],
        );
        let inst = rt.alloc(Value::Struct(StructVal {
            ty: foreign,
            fields: Vec::new(),
        }));
        let h = rt.intern("h");
        rt.set_global_const(pkg, h, inst);
        let err = save_incremental_to_vec(&mut rt, &[pkg], &SaveOptions::default());
        assert!(matches!(err, Err(SaveError::Unserializable(_))));
    }

    #[test]
    fn partial_opaque_return_skipped_or_fatal() {
        let (mut rt, pkg) = setup();
        let any = rt.well_known().any_type;
        let int64 = rt.well_known().int64_type;
        let f = rt.new_generic_function(pkg, "gen");
        let m = rt.add_method(pkg, f, &[int64], "pkg.jl", 5);
        let mi = rt.new_method_instance(m, &[int64]);
        let good = rt.new_code_instance(mi, any);
        let bad = rt.new_code_instance(mi, any); // chain head
        let oc = rt.alloc(Value::OpaqueClosure);
        rt.code_instance_mut(bad).rettype_const = Some(oc);

        let err = save_incremental_to_vec(
            &mut rt,
            &[pkg],
            &SaveOptions {
                skip_partial_opaque: false,
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(SaveError::PartialOpaqueReturn)));

        // with skipping on, the successor is emitted in its place
        let bytes = save(&mut rt, pkg);
        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let ci = restored_pkg_ci_for(&rt2, restored.modules[0], "gen");
        assert!(rt2.code_instance(ci).rettype_const.is_none());
        assert!(rt2.code_instance(ci).next.is_none());
        let _ = (good, bad);
    }

    fn restored_pkg_ci_for(rt: &Runtime, pkg: ValueId, fname: &str) -> ValueId {
        let f = global(rt, pkg, fname);
        let tn = rt.datatype(f).name.unwrap();
        let mt = rt.typename(tn).method_table.unwrap();
        let method = rt.method_table(mt).entries[0].method;
        let mi = rt.method(method).specializations[0];
        rt.method_instance(mi).cache.expect("code instance")
    }

    #[test]
    fn identity_dictionaries_rehash_after_load() {
        let (mut rt, pkg) = setup();
        let k1 = rt.box_int64(777_777);
        let v1 = rt.box_int64(1);
        let dict = rt.alloc(Value::IdDict(runtime::IdDict {
            pairs: vec![(k1, v1)],
        }));
        let d = rt.intern("d");
        rt.set_global_const(pkg, d, dict);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let d2 = global(&rt2, restored.modules[0], "d");
        match rt2.get(d2) {
            Value::IdDict(dict) => {
                assert_eq!(dict.pairs.len(), 1);
                assert_eq!(rt2.unbox_i64(dict.pairs[0].0), 777_777);
            }
            v => panic!("expected iddict, found {}", v.kind_name()),
        }
    }

    #[test]
    fn truncated_stream_fails_without_panicking() {
        let (mut rt, pkg) = setup();
        let x = rt.intern("x");
        let v = rt.box_int64(5_000);
        rt.set_global_const(pkg, x, v);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let loaded = rt2.loaded_modules.clone();
        let cut = bytes.len() - 24;
        assert!(restore_incremental_from_buffer(&mut rt2, &bytes[..cut], &loaded).is_err());
    }

    #[test]
    fn corrupted_header_is_a_structural_reject() {
        let (mut rt, pkg) = setup();
        let bytes = save(&mut rt, pkg);
        let mut bad = bytes.clone();
        bad[3] ^= 0xFF;
        let mut rt2 = bootstrap();
        let loaded = rt2.loaded_modules.clone();
        let err = restore_incremental_from_buffer(&mut rt2, &bad, &loaded).unwrap_err();
        assert!(err.is_structural_reject());
    }

    #[test]
    fn module_list_mismatch_is_a_structural_reject() {
        let (mut rt, pkg) = setup();
        let bytes = save(&mut rt, pkg);
        let mut rt2 = bootstrap();
        // pretend an extra module was loaded
        let main2 = rt2.well_known().main_module;
        let extra = rt2.new_module("Imposter", Some(main2));
        let mut loaded = rt2.loaded_modules.clone();
        loaded.push(extra);
        let err = restore_incremental_from_buffer(&mut rt2, &bytes, &loaded).unwrap_err();
        assert!(matches!(err, RestoreError::ModuleListMismatch(_)));
        assert!(err.is_structural_reject());
    }

    #[test]
    fn stale_dependency_is_a_structural_reject() {
        let (mut rt, pkg) = setup();
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "modcache-dep-{}-{}.src",
            std::process::id(),
            rt.arena_len()
        ));
        std::fs::write(&path, b"source text").unwrap();
        let actual_mtime = std::fs::metadata(&path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        // record an mtime the file no longer has
        rt.record_dependency(pkg, path.to_str().unwrap(), actual_mtime + 100.0);
        let cache_path = dir.join(format!("modcache-test-{}.cache", std::process::id()));
        save_incremental(&mut rt, &cache_path, &[pkg], &SaveOptions::default()).unwrap();

        let mut rt2 = bootstrap();
        let loaded = rt2.loaded_modules.clone();
        let err = restore_incremental(&mut rt2, &cache_path, &loaded, &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, RestoreError::StaleDependency(_)));
        assert!(err.is_structural_reject());

        // the same file loads once the check is waived
        let ok = restore_incremental(
            &mut rt2,
            &cache_path,
            &loaded,
            &RestoreOptions {
                check_dependencies: false,
            },
        );
        assert!(ok.is_ok());

        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(cache_path);
    }

    #[test]
    fn source_text_section_embeds_dependencies() {
        let (mut rt, pkg) = setup();
        let dir = std::env::temp_dir();
        let path = dir.join(format!("modcache-src-{}.src", std::process::id()));
        std::fs::write(&path, b"module TestPkg end").unwrap();
        let mtime = std::fs::metadata(&path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        rt.record_dependency(pkg, path.to_str().unwrap(), mtime);
        let bytes = save(&mut rt, pkg);
        let needle = b"module TestPkg end";
        assert!(
            bytes.windows(needle.len()).any(|w| w == needle),
            "dependency source text embedded in the file"
        );

        let mut rt3 = bootstrap();
        let (mut rt4, pkg4) = setup();
        rt4.record_dependency(pkg4, path.to_str().unwrap(), mtime);
        let lean = save_incremental_to_vec(
            &mut rt4,
            &[pkg4],
            &SaveOptions {
                include_source_text: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!lean.windows(needle.len()).any(|w| w == needle));
        // both variants restore
        let restored = restore(&mut rt3, &lean);
        assert_eq!(restored.modules.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn pointer_values_reset_except_sentinel() {
        let (mut rt, pkg) = setup();
        let int64 = rt.well_known().int64_type;
        let ptr_wrapper = rt.well_known().ptr_wrapper;
        let ptr_ty = rt.apply_type(ptr_wrapper, &[int64]);
        let live = rt.alloc(Value::Ptr {
            ty: ptr_ty,
            addr: 0xDEAD_BEEF,
        });
        let sentinel = rt.alloc(Value::Ptr {
            ty: ptr_ty,
            addr: SENTINEL_PTR,
        });
        let p = rt.intern("p");
        let q = rt.intern("q");
        rt.set_global_const(pkg, p, live);
        rt.set_global_const(pkg, q, sentinel);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let pkg2 = restored.modules[0];
        match rt2.get(global(&rt2, pkg2, "p")) {
            Value::Ptr { addr, .. } => assert_eq!(*addr, 0, "live address nulled"),
            v => panic!("expected ptr, found {}", v.kind_name()),
        }
        match rt2.get(global(&rt2, pkg2, "q")) {
            Value::Ptr { addr, .. } => {
                assert_eq!(*addr, SENTINEL_PTR, "sentinel preserved")
            }
            v => panic!("expected ptr, found {}", v.kind_name()),
        }
    }

    #[test]
    fn strings_and_bignums_round_trip() {
        let (mut rt, pkg) = setup();
        let s = rt.alloc(Value::Str("package data: αβγ".to_owned()));
        let big = rt.alloc(Value::BigNum(runtime::BigNum {
            size: 2,
            limbs: vec![0xFF; 16],
        }));
        let sname = rt.intern("s");
        let bname = rt.intern("big");
        rt.set_global_const(pkg, sname, s);
        rt.set_global_const(pkg, bname, big);
        let bytes = save(&mut rt, pkg);

        let mut rt2 = bootstrap();
        let restored = restore(&mut rt2, &bytes);
        let pkg2 = restored.modules[0];
        match rt2.get(global(&rt2, pkg2, "s")) {
            Value::Str(s) => assert_eq!(s, "package data: αβγ"),
            v => panic!("expected string, found {}", v.kind_name()),
        }
        match rt2.get(global(&rt2, pkg2, "big")) {
            Value::BigNum(b) => {
                assert_eq!(b.size, 2);
                assert_eq!(b.limbs, vec![0xFF; 16]);
            }
            v => panic!("expected bignum, found {}", v.kind_name()),
        }
    }
}
