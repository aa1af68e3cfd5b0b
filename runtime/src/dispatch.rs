use std::collections::HashSet;

use crate::method::MAX_WORLD;
use crate::value::Value;
use crate::{Runtime, ValueId};

/// Structural identity over the arena.
///
/// Mutable entities (modules, methods, instances, arrays, type vars)
/// compare by id; immutable ones compare by content. Cyclic type graphs
/// terminate coinductively: a pair already under comparison is assumed
/// equal.
pub fn egal(rt: &Runtime, a: Option<ValueId>, b: Option<ValueId>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            let mut seen = HashSet::new();
            egal_id(rt, a, b, &mut seen)
        }
        _ => false,
    }
}

fn egal_id(
    rt: &Runtime,
    a: ValueId,
    b: ValueId,
    seen: &mut HashSet<(ValueId, ValueId)>,
) -> bool {
    if a == b {
        return true;
    }
    if !seen.insert((a, b)) {
        return true;
    }
    match (rt.get(a), rt.get(b)) {
        (Value::Int64(x), Value::Int64(y)) => x == y,
        (Value::Int32(x), Value::Int32(y)) => x == y,
        (Value::UInt8(x), Value::UInt8(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::BigNum(x), Value::BigNum(y)) => {
            x.size == y.size && x.limbs == y.limbs
        }
        (Value::SVec(x), Value::SVec(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|(p, q)| match (p, q) {
                    (None, None) => true,
                    (Some(p), Some(q)) => egal_id(rt, *p, *q, seen),
                    _ => false,
                })
        }
        (Value::DataType(x), Value::DataType(y)) => {
            x.name == y.name && egal_id(rt, x.parameters, y.parameters, seen)
        }
        (Value::Ptr { ty: xt, addr: xa }, Value::Ptr { ty: yt, addr: ya }) => {
            xa == ya && egal_id(rt, *xt, *yt, seen)
        }
        (Value::Struct(x), Value::Struct(y)) => {
            if rt.type_is_mutable(x.ty) || rt.type_is_mutable(y.ty) {
                return false;
            }
            if !egal_id(rt, x.ty, y.ty, seen) || x.fields.len() != y.fields.len() {
                return false;
            }
            x.fields.iter().zip(y.fields.iter()).all(|(p, q)| {
                use crate::value::FieldVal;
                match (p, q) {
                    (FieldVal::Bits(p), FieldVal::Bits(q)) => p == q,
                    (FieldVal::Ref(None), FieldVal::Ref(None)) => true,
                    (FieldVal::Ref(Some(p)), FieldVal::Ref(Some(q))) => {
                        egal_id(rt, *p, *q, seen)
                    }
                    _ => false,
                }
            })
        }
        // Symbols are interned, type vars and the remaining kinds are
        // identity-compared; `a != b` already decided those.
        _ => false,
    }
}

const HASH_DEPTH: u32 = 4;

/// Structural hash consistent with [`egal`], stable across sessions:
/// names hash by their string, never by arena position. Depth-bounded so
/// cyclic types terminate; collisions are resolved by the caller with a
/// full [`egal`].
pub fn egal_hash(rt: &Runtime, id: Option<ValueId>) -> u64 {
    hash_id(rt, id, HASH_DEPTH)
}

#[inline]
fn mix(h: u64, x: u64) -> u64 {
    (h ^ x).wrapping_mul(0x100_0000_01b3).rotate_left(17)
}

fn hash_str(seed: u64, s: &str) -> u64 {
    let mut h = seed;
    for b in s.bytes() {
        h = mix(h, b as u64);
    }
    h
}

fn hash_id(rt: &Runtime, id: Option<ValueId>, depth: u32) -> u64 {
    let Some(id) = id else { return 0x9e37_79b9 };
    if depth == 0 {
        return mix(1, rt.get(id).kind_name().len() as u64);
    }
    match rt.get(id) {
        Value::Symbol(name) => hash_str(2, name),
        Value::TypeVar(tv) => hash_str(14, rt.symbol_name(tv.name)),
        Value::Int64(v) => mix(3, *v as u64),
        Value::Int32(v) => mix(4, *v as u64),
        Value::UInt8(v) => mix(5, *v as u64),
        Value::Str(s) => hash_str(6, s),
        Value::BigNum(b) => {
            let mut h = mix(7, b.size as u64);
            for x in &b.limbs {
                h = mix(h, *x as u64);
            }
            h
        }
        Value::SVec(elems) => {
            let mut h = mix(8, elems.len() as u64);
            for e in elems {
                h = mix(h, hash_id(rt, *e, depth - 1));
            }
            h
        }
        Value::DataType(dt) => {
            let name = dt
                .name
                .map(|tn| hash_str(9, rt.symbol_name(rt.typename(tn).name)))
                .unwrap_or(0);
            mix(name, hash_id(rt, Some(dt.parameters), depth - 1))
        }
        Value::Ptr { ty, addr } => {
            mix(mix(10, *addr), hash_id(rt, Some(*ty), depth - 1))
        }
        Value::Struct(sv) => {
            // Mutable structs have identity semantics; their hash cannot
            // be structural, and they never participate in type keys.
            if rt.type_is_mutable(sv.ty) {
                return mix(11, id.raw() as u64);
            }
            let mut h = mix(12, hash_id(rt, Some(sv.ty), depth - 1));
            for f in &sv.fields {
                use crate::value::FieldVal;
                match f {
                    FieldVal::Bits(b) => {
                        for x in b {
                            h = mix(h, *x as u64);
                        }
                    }
                    FieldVal::Ref(r) => h = mix(h, hash_id(rt, *r, depth - 1)),
                }
            }
            h
        }
        _ => mix(13, id.raw() as u64),
    }
}

/// Strip union-all wrappers down to the primary datatype.
pub fn unwrap_unionall(rt: &Runtime, mut id: ValueId) -> ValueId {
    // Chains are shallow in practice, but keep an explicit bound instead of
    // trusting the graph to be acyclic.
    for _ in 0..64 {
        match rt.get(id) {
            Value::UnionAll(ua) => id = ua.body,
            _ => return id,
        }
    }
    id
}

/// Declarative subtyping, sufficient for cache-validation dispatch:
/// invariant parameters, covariant tuples, nominal supertype chains, and
/// type-var upper bounds.
pub fn subtype(rt: &Runtime, a: ValueId, b: ValueId) -> bool {
    let wk = rt.well_known();
    let b = unwrap_unionall(rt, b);
    if let Value::TypeVar(tv) = rt.get(b) {
        return subtype(rt, a, tv.ub.unwrap_or(wk.any_type));
    }
    if b == wk.any_type {
        return true;
    }
    let a = unwrap_unionall(rt, a);
    if a == b {
        return true;
    }
    let (Value::DataType(da), Value::DataType(db)) = (rt.get(a), rt.get(b)) else {
        return false;
    };
    if da.name == db.name {
        if da.name == Some(wk.tuple_typename) {
            let pa = rt.svec(da.parameters);
            let pb = rt.svec(db.parameters);
            return pa.len() == pb.len()
                && pa.iter().zip(pb.iter()).all(|(x, y)| match (x, y) {
                    (Some(x), Some(y)) => subtype(rt, *x, *y),
                    _ => false,
                });
        }
        return egal(rt, Some(da.parameters), Some(db.parameters));
    }
    // Walk the nominal supertype chain of `a`.
    let mut cur = a;
    for _ in 0..64 {
        let Value::DataType(dc) = rt.get(cur) else { return false };
        let Some(sup) = dc.supertype else { return false };
        let sup = unwrap_unionall(rt, sup);
        if sup == cur {
            return false;
        }
        if subtype_nominal(rt, sup, b) {
            return true;
        }
        cur = sup;
    }
    false
}

fn subtype_nominal(rt: &Runtime, a: ValueId, b: ValueId) -> bool {
    if a == b {
        return true;
    }
    match (rt.get(a), rt.get(b)) {
        (Value::DataType(da), Value::DataType(db)) if da.name == db.name => {
            egal(rt, Some(da.parameters), Some(db.parameters))
        }
        _ => subtype(rt, a, b),
    }
}

/// Whether signature `a` is strictly more specific than `b`.
pub fn morespecific(rt: &Runtime, a: ValueId, b: ValueId) -> bool {
    subtype(rt, a, b) && !egal(rt, Some(a), Some(b))
}

/// The method table responsible for a call signature: the table of the
/// signature's primary (first-parameter) type.
pub fn method_table_for(rt: &Runtime, sig: ValueId) -> Option<ValueId> {
    let sig = unwrap_unionall(rt, sig);
    let Value::DataType(dt) = rt.get(sig) else { return None };
    let first = *rt.svec(dt.parameters).first()?;
    let first = unwrap_unionall(rt, first?);
    let Value::DataType(fdt) = rt.get(first) else { return None };
    let tn = fdt.name?;
    let Value::TypeName(tn) = rt.get(tn) else { return None };
    tn.method_table
}

/// All methods that could be selected for `sig` in `world`.
///
/// Returns `None` when no method table can answer for the signature; an
/// empty vector when the table exists but nothing applies.
pub fn matching_methods(
    rt: &Runtime,
    sig: ValueId,
    world: u64,
) -> Option<Vec<ValueId>> {
    let mt = method_table_for(rt, sig)?;
    let Value::MethodTable(mt) = rt.get(mt) else { return None };
    let mut out = Vec::new();
    for entry in &mt.entries {
        if world < entry.min_world || world > entry.max_world {
            continue;
        }
        let Value::Method(m) = rt.get(entry.method) else { continue };
        // A method applies when its signature could intersect the call
        // signature in either direction.
        if subtype(rt, sig, m.sig) || subtype(rt, m.sig, sig) {
            out.push(entry.method);
        }
    }
    Some(out)
}

/// Most specific method currently answering `sig`, if any.
pub fn dispatch_method(rt: &Runtime, sig: ValueId, world: u64) -> Option<ValueId> {
    let matches = matching_methods(rt, sig, world)?;
    let mut best: Option<ValueId> = None;
    for m in matches {
        let Value::Method(md) = rt.get(m) else { continue };
        if !subtype(rt, sig, md.sig) {
            continue;
        }
        match best {
            None => best = Some(m),
            Some(cur) => {
                let Value::Method(cd) = rt.get(cur) else { continue };
                if morespecific(rt, md.sig, cd.sig) {
                    best = Some(m);
                }
            }
        }
    }
    best
}

/// Whether `world` falls in an entry window that is still open.
pub fn entry_is_live(min_world: u64, max_world: u64, world: u64) -> bool {
    min_world <= world && (max_world == MAX_WORLD || world <= max_world)
}
