use criterion::{black_box, criterion_group, criterion_main, Criterion};

use modcache::{restore_incremental_from_buffer, save_incremental_to_vec, SaveOptions};
use runtime::{bootstrap, Runtime, ValueId};

/// A package module carrying a spread of value kinds: integer bindings,
/// a shared array, a self-referential type, and a method with compiled
/// code calling an external function.
fn build_package(rt: &mut Runtime) -> ValueId {
    let main = rt.well_known().main_module;
    let pkg = rt.new_module("BenchPkg", Some(main));
    {
        let m = rt.module_mut(pkg);
        m.uuid.hi = 0xBEBE;
        m.uuid.lo = 0xCACA;
        m.build_id = 0xB0B0;
        m.is_top_mod = true;
    }
    let name = rt.intern("BenchPkg");
    rt.set_global_const(main, name, pkg);

    let any = rt.well_known().any_type;
    let int64 = rt.well_known().int64_type;
    for i in 0..200i64 {
        let sym = rt.intern(&format!("const_{i}"));
        let v = rt.box_int64(10_000 + i);
        rt.set_global_const(pkg, sym, v);
    }
    let elems: Vec<_> = (0..64i64)
        .map(|i| Some(rt.box_int64(1_000_000 + i)))
        .collect();
    let arr = rt.alloc_value_array(any, elems);
    let arr_sym = rt.intern("table");
    rt.set_global_const(pkg, arr_sym, arr);

    let base = rt.well_known().base_module;
    let ext = rt.new_generic_function(base, "bench_ext");
    let ext_method = rt.add_method(base, ext, &[any], "base.jl", 1);
    let ext_mi = rt.new_method_instance(ext_method, &[int64]);

    let f = rt.new_generic_function(pkg, "bench_op");
    let m = rt.add_method(pkg, f, &[int64], "pkg.jl", 1);
    let mi = rt.new_method_instance(m, &[int64]);
    let _ci = rt.new_code_instance(mi, any);
    rt.method_instance_add_backedge(ext_mi, mi);
    pkg
}

fn bench_save(c: &mut Criterion) {
    let mut rt = bootstrap();
    let pkg = build_package(&mut rt);
    c.bench_function("save_incremental", |b| {
        b.iter(|| {
            let bytes =
                save_incremental_to_vec(&mut rt, &[pkg], &SaveOptions::default()).expect("save");
            black_box(bytes);
        })
    });
}

fn bench_restore(c: &mut Criterion) {
    let mut rt = bootstrap();
    let pkg = build_package(&mut rt);
    let bytes = save_incremental_to_vec(&mut rt, &[pkg], &SaveOptions::default()).expect("save");

    c.bench_function("restore_incremental", |b| {
        b.iter(|| {
            let mut rt2 = bootstrap();
            let base2 = rt2.well_known().base_module;
            let any2 = rt2.well_known().any_type;
            let ext2 = rt2.new_generic_function(base2, "bench_ext");
            rt2.add_method(base2, ext2, &[any2], "base.jl", 1);
            let loaded = rt2.loaded_modules.clone();
            let restored = restore_incremental_from_buffer(&mut rt2, &bytes, &loaded)
                .expect("restore");
            black_box(restored.modules.len());
        })
    });
}

criterion_group!(benches, bench_save, bench_restore);
criterion_main!(benches);
