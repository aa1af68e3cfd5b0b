use crate::types::{DataType, Layout, LayoutDesc, TypeFlags, TypeName, TypeNameFlags};
use crate::value::{StructVal, Value};
use crate::{FieldVal, MethodTable, Runtime, ValueId};

/// Largest integer kept in the permanent small-box caches.
pub const SMALL_BOX_MAX: u8 = 20;

/// Well-known values every session shares.
///
/// **Entities are not allocated here.** [`bootstrap`] allocates them in the
/// runtime arena and stores their ids; the cache codec's tag registry is
/// built from this set, so the ids must never change after bootstrap.
pub struct WellKnown {
    // ── modules ────────────────────────────────────────────────────
    pub core_module: ValueId,
    pub base_module: ValueId,
    pub main_module: ValueId,

    // ── types ──────────────────────────────────────────────────────
    pub any_type: ValueId,
    pub nothing_type: ValueId,
    pub bool_type: ValueId,
    pub int64_type: ValueId,
    pub int32_type: ValueId,
    pub uint8_type: ValueId,
    pub float64_type: ValueId,
    pub string_type: ValueId,
    pub bigint_type: ValueId,

    /// The `Tuple` identity record; tuple instantiations dispatch on it.
    pub tuple_typename: ValueId,
    pub tuple_wrapper: ValueId,
    pub ptr_typename: ValueId,
    pub ptr_wrapper: ValueId,
    pub array_typename: ValueId,
    pub array_wrapper: ValueId,

    // ── singletons and empties ─────────────────────────────────────
    /// The sole instance of `Nothing`.
    pub nothing: ValueId,
    pub true_val: ValueId,
    pub false_val: ValueId,
    pub empty_svec: ValueId,
    pub empty_string: ValueId,

    /// Permanent boxes for 0..=SMALL_BOX_MAX.
    pub int64_boxes: Vec<ValueId>,
    pub int32_boxes: Vec<ValueId>,
}

/// A primitive (bits) type: sized, no fields, no reference slots.
fn new_bits_type(rt: &mut Runtime, module: ValueId, name: &str, size: u32, any: ValueId) -> ValueId {
    new_sized_type(
        rt,
        module,
        name,
        size,
        any,
        TypeFlags::CONCRETE
            .with(TypeFlags::BITS)
            .with(TypeFlags::ZERO_INIT),
    )
}

/// An opaque concrete type with runtime-managed storage (strings, bignums).
fn new_opaque_type(rt: &mut Runtime, module: ValueId, name: &str, size: u32, any: ValueId) -> ValueId {
    new_sized_type(rt, module, name, size, any, TypeFlags::CONCRETE)
}

fn new_sized_type(
    rt: &mut Runtime,
    module: ValueId,
    name: &str,
    size: u32,
    any: ValueId,
    flags: TypeFlags,
) -> ValueId {
    let name_sym = rt.intern(name);
    let parameters = rt.alloc_svec(Vec::new());
    let field_names = rt.alloc_svec(Vec::new());
    let dt = rt.alloc(Value::DataType(DataType {
        name: None,
        parameters,
        supertype: Some(any),
        field_types: None,
        instance: None,
        layout: Some(LayoutDesc::Custom(Layout {
            size,
            npointers: 0,
            first_ptr: -1,
            fields: Vec::new(),
        })),
        size,
        hash: stable_hash(name) as u32,
        flags,
    }));
    let mt = rt.alloc(Value::MethodTable(MethodTable {
        name: name_sym,
        module,
        entries: Vec::new(),
        backedges: Vec::new(),
    }));
    let tn = rt.alloc(Value::TypeName(TypeName {
        module,
        name: name_sym,
        field_names,
        wrapper: dt,
        method_table: Some(mt),
        hash: stable_hash(name),
        flags: TypeNameFlags::empty(),
        max_methods: 0,
        n_uninitialized: 0,
        atomic_fields: Vec::new(),
        const_fields: Vec::new(),
    }));
    rt.datatype_mut(dt).name = Some(tn);
    rt.cache_type(dt);
    rt.set_global_const(module, name_sym, dt);
    dt
}

fn stable_hash(name: &str) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for b in name.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

fn module_identity(rt: &mut Runtime, module: ValueId, name: &str) {
    let h = stable_hash(name);
    let m = rt.module_mut(module);
    m.uuid.hi = h;
    m.uuid.lo = h.rotate_left(31);
    m.build_id = h ^ 0x5bd1_e995;
    m.is_top_mod = true;
}

/// Bootstrap a runtime: allocate the core/base/main modules, the primitive
/// and container types, the shared singletons, and the permanent integer
/// boxes, then seal them as the well-known set.
pub fn bootstrap() -> Runtime {
    let mut rt = Runtime::empty();

    let core_module = rt.new_module("Core", None);
    let base_module = rt.new_module("Base", None);
    let main_module = rt.new_module("Main", None);
    module_identity(&mut rt, core_module, "Core");
    module_identity(&mut rt, base_module, "Base");
    module_identity(&mut rt, main_module, "Main");

    // Any is its own supertype; everything else chains up to it.
    let any_type = rt.new_primary_type(
        core_module,
        "Any",
        None,
        TypeNameFlags::ABSTRACT,
        &[],
        &[],
    );
    rt.datatype_mut(any_type).supertype = Some(any_type);

    let nothing_type = rt.new_primary_type(
        core_module,
        "Nothing",
        Some(any_type),
        TypeNameFlags::empty(),
        &[],
        &[],
    );
    let nothing = rt
        .datatype(nothing_type)
        .instance
        .expect("Nothing must have a singleton");

    let bool_type = new_bits_type(&mut rt, core_module, "Bool", 1, any_type);
    let int64_type = new_bits_type(&mut rt, core_module, "Int64", 8, any_type);
    let int32_type = new_bits_type(&mut rt, core_module, "Int32", 4, any_type);
    let uint8_type = new_bits_type(&mut rt, core_module, "UInt8", 1, any_type);
    let float64_type = new_bits_type(&mut rt, core_module, "Float64", 8, any_type);
    let string_type = new_opaque_type(&mut rt, core_module, "String", 8, any_type);
    let bigint_type = new_opaque_type(&mut rt, base_module, "BigInt", 16, any_type);

    let true_val = rt.alloc(Value::Struct(StructVal {
        ty: bool_type,
        fields: vec![FieldVal::Bits(vec![1])],
    }));
    let false_val = rt.alloc(Value::Struct(StructVal {
        ty: bool_type,
        fields: vec![FieldVal::Bits(vec![0])],
    }));

    // Tuple: the primary has no parameters and is not itself concrete;
    // instantiations become concrete dispatch tuples in `apply_type`.
    let tuple_dt = rt.new_primary_type(
        core_module,
        "Tuple",
        Some(any_type),
        TypeNameFlags::empty(),
        &[],
        &[],
    );
    {
        let dt = rt.datatype_mut(tuple_dt);
        dt.flags = TypeFlags::NONE;
        dt.layout = None;
        dt.instance = None;
        dt.field_types = None;
    }
    let tuple_typename = rt.datatype(tuple_dt).name.expect("Tuple unnamed");
    let tuple_wrapper = rt.typename(tuple_typename).wrapper;

    let ptr_dt = rt.new_primary_type(
        core_module,
        "Ptr",
        Some(any_type),
        TypeNameFlags::empty(),
        &["T"],
        &[],
    );
    {
        let dt = rt.datatype_mut(ptr_dt);
        dt.layout = Some(LayoutDesc::PointerLike);
        dt.size = 8;
        dt.field_types = None;
    }
    let ptr_typename = rt.datatype(ptr_dt).name.expect("Ptr unnamed");
    let ptr_wrapper = rt.typename(ptr_typename).wrapper;

    let array_dt = rt.new_primary_type(
        core_module,
        "Array",
        Some(any_type),
        TypeNameFlags::MUTABLE,
        &["T"],
        &[],
    );
    {
        let dt = rt.datatype_mut(array_dt);
        dt.layout = Some(LayoutDesc::ArrayLike);
        dt.size = 16;
        dt.field_types = None;
    }
    let array_typename = rt.datatype(array_dt).name.expect("Array unnamed");
    let array_wrapper = rt.typename(array_typename).wrapper;

    let empty_svec = rt.alloc(Value::SVec(Vec::new()));
    let empty_string = rt.alloc(Value::Str(String::new()));

    let int64_boxes = (0..=SMALL_BOX_MAX as i64)
        .map(|v| rt.alloc(Value::Int64(v)))
        .collect();
    let int32_boxes = (0..=SMALL_BOX_MAX as i32)
        .map(|v| rt.alloc(Value::Int32(v)))
        .collect();

    // Core and Base are reachable from Main by name.
    let core_sym = rt.intern("Core");
    let base_sym = rt.intern("Base");
    rt.set_global_const(main_module, core_sym, core_module);
    rt.set_global_const(main_module, base_sym, base_module);

    rt.loaded_modules = vec![core_module, base_module];

    rt.set_well_known(WellKnown {
        core_module,
        base_module,
        main_module,
        any_type,
        nothing_type,
        bool_type,
        int64_type,
        int32_type,
        uint8_type,
        float64_type,
        string_type,
        bigint_type,
        tuple_typename,
        tuple_wrapper,
        ptr_typename,
        ptr_wrapper,
        array_typename,
        array_wrapper,
        nothing,
        true_val,
        false_val,
        empty_svec,
        empty_string,
        int64_boxes,
        int32_boxes,
    });
    rt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_builds_a_coherent_world() {
        let rt = bootstrap();
        let wk = rt.well_known();
        assert_eq!(rt.symbol_name(rt.module(wk.core_module).name), "Core");
        assert_eq!(
            rt.module(wk.core_module).parent,
            Some(wk.core_module),
            "Core is top-level"
        );
        // Any is its own supertype and Nothing's singleton is typed.
        assert_eq!(rt.datatype(wk.any_type).supertype, Some(wk.any_type));
        match rt.get(wk.nothing) {
            Value::Struct(sv) => assert_eq!(sv.ty, wk.nothing_type),
            v => panic!("nothing is a {}", v.kind_name()),
        }
    }

    #[test]
    fn core_types_resolve_by_name() {
        let mut rt = bootstrap();
        let wk_core = rt.well_known().core_module;
        let int64 = rt.well_known().int64_type;
        let sym = rt.intern("Int64");
        assert_eq!(rt.get_global(wk_core, sym), Some(int64));
    }

    #[test]
    fn small_box_tables_are_dense() {
        let rt = bootstrap();
        let wk = rt.well_known();
        assert_eq!(wk.int64_boxes.len(), SMALL_BOX_MAX as usize + 1);
        for (i, id) in wk.int64_boxes.iter().enumerate() {
            assert_eq!(rt.unbox_i64(*id), i as i64);
        }
    }
}
