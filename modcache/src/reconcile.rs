//! The post-deserialization reconciliation pipeline.
//!
//! Runs in a fixed order: recache types, install extension methods,
//! recache methods and method instances, copy queued roots, insert novel
//! specializations, verify external edges, activate surviving code. Each
//! pass feeds the uniquing map; owner cells recorded in the flag-ref list
//! are rewritten by mapping their reference slots through it.

use runtime::{for_each_ref, Value, ValueId, MAX_WORLD};
use tracing::{debug, warn};

use crate::de::LoadSession;

/// Poison codes, for diagnosing accidental reads of dead placeholders.
const POISON_TYPE: u32 = 0x10;
const POISON_INSTANCE: u32 = 0x20;
const POISON_METHOD: u32 = 0x30;
const POISON_METHOD_INSTANCE: u32 = 0x40;

/// Follow the uniquing map to a fixed point.
fn resolve(ls: &LoadSession, mut id: ValueId) -> ValueId {
    for _ in 0..32 {
        match ls.uniquing.get(&id) {
            Some(Some(next)) if *next != id => id = *next,
            _ => return id,
        }
    }
    id
}

/// Map every reference slot of `owner` through the uniquing map.
fn rewrite_owner(ls: &mut LoadSession, owner: ValueId) {
    let uniquing = &ls.uniquing;
    for_each_ref(ls.rt.get_mut(owner), &mut |slot| {
        let mut cur = *slot;
        for _ in 0..32 {
            match uniquing.get(&cur) {
                Some(Some(next)) if *next != cur => cur = *next,
                _ => break,
            }
        }
        *slot = cur;
    });
}

/// Rewrite all recorded owners and refresh the backref slots of primary
/// flag-ref entries. Idempotent; runs once per recache pass.
fn rewrite_flagged_locations(ls: &mut LoadSession) {
    let owners: Vec<ValueId> = ls.flagrefs.iter().filter_map(|fr| fr.owner).collect();
    for owner in owners {
        rewrite_owner(ls, owner);
    }
    let slots: Vec<i64> = ls.flagrefs.iter().map(|fr| fr.index).collect();
    for index in slots {
        if index > 0 {
            let pos = index as usize;
            if let Some(old) = ls.backrefs.get(pos) {
                let new = resolve(ls, old);
                if new != old {
                    ls.backrefs.set(pos, new);
                }
            }
        }
    }
}

// ── step 1: types ──────────────────────────────────────────────────

/// Unique every flagged non-method entity against the runtime's caches,
/// then poison the replaced placeholders.
pub(crate) fn recache_types(ls: &mut LoadSession) {
    let entries: Vec<i64> = ls.flagrefs.iter().map(|fr| fr.index).collect();
    for index in entries {
        if index < 0 {
            continue;
        }
        let Some(o) = ls.backrefs.get(index as usize) else { continue };
        if matches!(
            ls.rt.get(o),
            Value::Method(_) | Value::MethodInstance(_)
        ) {
            continue; // handled after extension methods are installed
        }
        let (dt, is_instance) = match ls.rt.get(o) {
            Value::DataType(_) => (o, false),
            _ => match ls.rt.value_type_of(o) {
                Some(ty) => (ty, true),
                None => continue,
            },
        };
        let t = recache_datatype(ls, dt);
        if is_instance {
            let inst = ls.rt.datatype(t).instance;
            match inst {
                Some(inst) if inst != o => {
                    ls.uniquing.insert(o, Some(inst));
                    ls.backrefs.set(index as usize, inst);
                }
                _ => {}
            }
        } else if t != dt {
            ls.backrefs.set(index as usize, t);
        }
    }

    rewrite_flagged_locations(ls);

    // invalidate replaced placeholders so stray reads fail loudly
    let replaced: Vec<(ValueId, ValueId)> = ls
        .uniquing
        .iter()
        .filter_map(|(o, t)| {
            let t = (*t)?;
            (t != *o).then_some((*o, t))
        })
        .collect();
    for (o, t) in replaced {
        match ls.rt.get(o) {
            Value::DataType(_) => {
                let old_inst = ls.rt.datatype(o).instance;
                let new_inst = match ls.rt.get(t) {
                    Value::DataType(d) => d.instance,
                    _ => None,
                };
                if let Some(old_inst) = old_inst {
                    if Some(old_inst) != new_inst {
                        *ls.rt.get_mut(old_inst) = Value::Poisoned(POISON_INSTANCE);
                    }
                }
                *ls.rt.get_mut(o) = Value::Poisoned(POISON_TYPE);
            }
            Value::Struct(_) => {
                *ls.rt.get_mut(o) = Value::Poisoned(POISON_INSTANCE);
            }
            _ => {}
        }
    }
}

/// Get or create the canonical type for a uniquing candidate, recaching
/// its parameters first.
fn recache_datatype(ls: &mut LoadSession, dt: ValueId) -> ValueId {
    match ls.uniquing.get(&dt) {
        None => return dt, // never flagged: already canonical
        Some(Some(t)) => return *t,
        Some(None) => {}
    }
    recache_parameters(ls, dt);
    let nparams = {
        let d = ls.rt.datatype(dt);
        ls.rt.svec(d.parameters).len()
    };
    // zero-parameter types have nothing to unique on
    let t = if nparams == 0 {
        dt
    } else {
        match ls.rt.lookup_cache_type(dt) {
            Some(t) => t,
            None => {
                ls.rt.cache_type(dt);
                dt
            }
        }
    };
    debug_assert_eq!(ls.rt.datatype(t).hash, ls.rt.datatype(dt).hash);
    ls.uniquing.insert(dt, Some(t));
    t
}

fn recache_parameters(ls: &mut LoadSession, dt: ValueId) {
    let parameters = ls.rt.datatype(dt).parameters;
    let params = ls.rt.svec(parameters).to_vec();
    for (i, p) in params.into_iter().enumerate() {
        let Some(p) = p else { continue };
        let np = recache_type(ls, p);
        if np != p {
            match ls.rt.get_mut(parameters) {
                Value::SVec(elems) => elems[i] = Some(np),
                _ => unreachable!(),
            }
        }
    }
}

/// Recache one type parameter in place: a datatype, a bound of a type
/// variable, a union-all body, or a singleton value.
fn recache_type(ls: &mut LoadSession, p: ValueId) -> ValueId {
    match ls.rt.get(p) {
        Value::DataType(_) => {
            if ls.uniquing.contains_key(&p) {
                recache_datatype(ls, p)
            } else {
                recache_parameters(ls, p);
                // memoize so repeated shapes don't re-walk
                ls.uniquing.insert(p, Some(p));
                p
            }
        }
        Value::TypeVar(tv) => {
            let (lb, ub) = (tv.lb, tv.ub);
            let nlb = lb.map(|b| recache_type(ls, b));
            let nub = ub.map(|b| recache_type(ls, b));
            if let Value::TypeVar(tv) = ls.rt.get_mut(p) {
                tv.lb = nlb;
                tv.ub = nub;
            }
            p
        }
        Value::UnionAll(ua) => {
            let (var, body) = (ua.var, ua.body);
            let nvar = recache_type(ls, var);
            let nbody = recache_type(ls, body);
            if let Value::UnionAll(ua) = ls.rt.get_mut(p) {
                ua.var = nvar;
                ua.body = nbody;
            }
            p
        }
        _ => {
            // a value parameter: recache its type, then share the
            // canonical singleton when one exists
            let Some(ty) = ls.rt.value_type_of(p) else { return p };
            let cachep = recache_datatype(ls, ty);
            if let Some(inst) = ls.rt.datatype(cachep).instance {
                if inst != p {
                    ls.uniquing.insert(p, Some(inst));
                    return inst;
                }
            }
            if ty != cachep {
                if let Value::Struct(sv) = ls.rt.get_mut(p) {
                    sv.ty = cachep;
                }
            }
            p
        }
    }
}

// ── step 2: extension methods ──────────────────────────────────────

/// Install worklist-owned methods into the external tables they extend.
/// Must precede method recaching: lookups there depend on table state.
pub(crate) fn insert_methods(ls: &mut LoadSession, extext: &[Option<ValueId>]) {
    for pair in extext.chunks_exact(2) {
        let Some(method) = pair[0] else { continue };
        let simple_sig = pair[1];
        debug_assert!(!ls.rt.method(method).is_for_opaque_closure);
        let mt = ls
            .rt
            .method_get_table(method)
            .expect("extension method has no method table");
        ls.rt.method_table_insert(mt, method, simple_sig);
    }
}

// ── step 3: methods and method instances ───────────────────────────

/// Replace every flagged method / method-instance placeholder with the
/// live entity found through its table, then rewrite all recorded
/// locations once more.
pub(crate) fn recache_others(ls: &mut LoadSession) {
    let entries: Vec<i64> = ls.flagrefs.iter().map(|fr| fr.index).collect();
    for index in entries {
        if index < 0 {
            continue;
        }
        let Some(o) = ls.backrefs.get(index as usize) else { continue };
        if !matches!(ls.rt.get(o), Value::Method(_) | Value::MethodInstance(_)) {
            continue;
        }
        let newo = recache_other(ls, o);
        ls.backrefs.set(index as usize, newo);
    }
    rewrite_flagged_locations(ls);
    ls.flagrefs.clear();
}

fn recache_other(ls: &mut LoadSession, o: ValueId) -> ValueId {
    if let Some(Some(n)) = ls.uniquing.get(&o) {
        return *n;
    }
    let newo = match ls.rt.get(o) {
        Value::Method(_) => {
            let n = recache_method(ls, o);
            ls.uniquing.insert(n, Some(n));
            n
        }
        Value::MethodInstance(_) => recache_method_instance(ls, o),
        v => panic!("recaching a {}", v.kind_name()),
    };
    ls.uniquing.insert(o, Some(newo));
    newo
}

/// Look up the live method carrying the placeholder's signature.
fn recache_method(ls: &mut LoadSession, m: ValueId) -> ValueId {
    debug_assert!(!ls.rt.method(m).is_for_opaque_closure);
    let sig = ls.rt.method(m).sig;
    let mt = ls
        .rt
        .method_get_table(m)
        .expect("external method without a method table");
    *ls.rt.get_mut(m) = Value::Poisoned(POISON_METHOD);
    // current world, not the reserved one: freshly installed extension
    // methods must be visible to the lookup
    let world = ls.rt.current_world();
    let entries = &ls.rt.method_table(mt).entries;
    let found = entries
        .iter()
        .filter(|e| e.min_world <= world && world <= e.max_world)
        .map(|e| e.method)
        .find(|&cand| {
            let cand_sig = ls.rt.method(cand).sig;
            ls.rt.egal(Some(cand_sig), Some(sig))
        });
    found.expect("external method signature not found in its table")
}

/// Find or insert the live specialization matching the placeholder.
fn recache_method_instance(ls: &mut LoadSession, mi: ValueId) -> ValueId {
    let (def, spec_types, sparam_vals) = {
        let m = ls.rt.method_instance(mi);
        (m.def, m.spec_types, m.sparam_vals)
    };
    let method = recache_other(ls, def);
    debug_assert!(matches!(ls.rt.get(method), Value::Method(_)));
    *ls.rt.get_mut(mi) = Value::Poisoned(POISON_METHOD_INSTANCE);

    let existing = {
        let specs = ls.rt.method(method).specializations.clone();
        specs.into_iter().find(|&s| {
            ls.rt
                .egal(Some(ls.rt.method_instance(s).spec_types), Some(spec_types))
        })
    };
    if let Some(found) = existing {
        return found;
    }
    let empty = ls.rt.well_known().empty_svec;
    let fresh = ls.rt.alloc(Value::MethodInstance(runtime::MethodInstance {
        def: method,
        spec_types,
        sparam_vals: sparam_vals.or(Some(empty)),
        uninferred: None,
        backedges: Vec::new(),
        callbacks: None,
        cache: None,
        precompiled: false,
    }));
    ls.rt.method_mut(method).specializations.push(fresh);
    fresh
}

// ── step 4: queued roots ───────────────────────────────────────────

/// Append roots recorded under the worklist key to their (now canonical)
/// methods. Must wait until recaching settles every pointer.
pub(crate) fn copy_roots(ls: &mut LoadSession) {
    let mut queued: Vec<(ValueId, (u64, Vec<ValueId>))> =
        std::mem::take(&mut ls.queued_method_roots).into_iter().collect();
    queued.sort_by_key(|(m, _)| *m);
    for (placeholder, (key, roots)) in queued {
        let method = resolve(ls, placeholder);
        debug_assert!(matches!(ls.rt.get(method), Value::Method(_)));
        let mapped: Vec<ValueId> = roots.into_iter().map(|r| resolve(ls, r)).collect();
        ls.rt.method_mut(method).append_roots_key(key, mapped);
    }
}

// ── step 5: novel specializations ──────────────────────────────────

/// Merge queued external instances into their canonical counterparts:
/// invalid ones (their method is no longer what dispatch would pick) lose
/// their compiled code; valid ones contribute backedges and splice their
/// code chain into the live cache.
pub(crate) fn insert_method_instances(ls: &mut LoadSession, list: &[ValueId]) {
    let world = ls.rt.current_world();
    let mut valids = vec![true; list.len()];
    for (i, &mi) in list.iter().enumerate() {
        let (def, spec_types) = {
            let m = ls.rt.method_instance(mi);
            (m.def, m.spec_types)
        };
        if !matches!(ls.rt.get(def), Value::Method(_)) {
            continue;
        }
        // is this still the method we would be calling?
        let dispatched = runtime::dispatch::dispatch_method(ls.rt, spec_types, world);
        if let Some(now) = dispatched {
            let now_sig = ls.rt.method(now).sig;
            let def_sig = ls.rt.method(def).sig;
            if now != def && runtime::dispatch::morespecific(ls.rt, now_sig, def_sig) {
                valids[i] = false;
                let validate = &mut ls.new_ci_validate;
                ls.rt.invalidate_backedges(mi, world, "insert_method_instance", |ci| {
                    validate.remove(&ci);
                });
                debug!(?mi, "queued external instance superseded");
            }
        }
    }

    // associate placeholders with canonical instances
    for &mi in list {
        let milive = ls.rt.specializations_get_or_insert(mi);
        ls.uniquing.insert(mi, Some(milive));
    }

    // fix up the ones that did not go live themselves
    for (i, &mi) in list.iter().enumerate() {
        let milive = resolve(ls, mi);
        if milive == mi {
            continue;
        }
        let backedges = ls.rt.method_instance(mi).backedges.clone();
        let mapped: Vec<ValueId> = backedges.iter().map(|&b| resolve(ls, b)).collect();
        {
            let live = ls.rt.method_instance(milive);
            if live.backedges.is_empty() {
                ls.rt.method_instance_mut(milive).backedges = mapped;
            } else {
                for be in mapped {
                    let live = ls.rt.method_instance_mut(milive);
                    if !live.backedges.contains(&be) {
                        live.backedges.push(be);
                    }
                }
            }
        }
        // transfer the compiled chain when the live instance has nothing
        // world-open of its own
        let cache = ls.rt.method_instance(mi).cache;
        if let (Some(head), true) = (cache, valids[i]) {
            let live_head = ls.rt.method_instance(milive).cache;
            let live_is_open = live_head
                .map(|c| ls.rt.code_instance(c).max_world == MAX_WORLD)
                .unwrap_or(false);
            if !live_is_open {
                let mut c = head;
                loop {
                    ls.rt.code_instance_mut(c).def = milive;
                    match ls.rt.code_instance(c).next {
                        Some(n) => c = n,
                        None => break,
                    }
                }
                ls.rt.code_instance_mut(c).next = live_head;
                ls.rt.method_instance_mut(milive).cache = Some(head);
            }
        }
    }
}

// ── steps 6 and 7: edge verification and activation ────────────────

/// Recompute each recorded external callee's match set in the current
/// world; an entry whose set changed in count or membership is invalid.
pub(crate) fn verify_edges(ls: &mut LoadSession, ext_targets: ValueId) -> Vec<bool> {
    let targets = ls.rt.svec(ext_targets).to_vec();
    let n = targets.len() / 2;
    let mut valids = vec![true; n];
    for i in 0..n {
        let Some(callee) = targets[i * 2] else { continue };
        let Some(expected) = targets[i * 2 + 1] else { continue };
        let sig = match ls.rt.get(callee) {
            Value::MethodInstance(mi) => mi.spec_types,
            _ => callee,
        };
        let expected: Vec<ValueId> =
            ls.rt.svec(expected).iter().copied().flatten().collect();
        let valid = match ls.rt.matching_methods(sig, ls.rt.current_world()) {
            None => false,
            Some(matches) => {
                matches.len() == expected.len()
                    && matches.iter().all(|m| expected.contains(m))
            }
        };
        valids[i] = valid;
        if !valid {
            ls.rt
                .invalidation_log
                .push((callee, "insert_backedges_callee"));
            debug!(?callee, "external callee match set changed");
        }
    }
    valids
}

/// Re-link surviving backedges into the live graph and open the world
/// range of every code instance whose full edge set verified.
pub(crate) fn insert_backedges(ls: &mut LoadSession, edges: ValueId, ext_targets: ValueId) {
    let valids = verify_edges(ls, ext_targets);
    let edge_list = ls.rt.svec(edges).to_vec();
    let targets = ls.rt.svec(ext_targets).to_vec();
    for pair in edge_list.chunks_exact(2) {
        let (Some(caller), Some(idx_array)) = (pair[0], pair[1]) else { continue };
        let caller = resolve(ls, caller);
        let idxs = ls.rt.i32_array_values(idx_array);
        let valid = idxs
            .iter()
            .all(|&idx| valids.get(idx as usize).copied().unwrap_or(false));
        if valid {
            for &idx in &idxs {
                let Some(callee) = targets[idx as usize * 2] else { continue };
                if matches!(ls.rt.get(callee), Value::MethodInstance(_)) {
                    ls.rt.method_instance_add_backedge(callee, caller);
                } else if let Some(mt) = ls.rt.method_table_for(callee) {
                    ls.rt.method_table_add_backedge(mt, callee, caller);
                }
            }
            let mut ci = ls.rt.method_instance(caller).cache;
            while let Some(c) = ci {
                if ls.new_ci_validate.remove(&c)
                    && ls.rt.code_instance(c).min_world > 0
                {
                    ls.rt.code_instance_mut(c).max_world = MAX_WORLD;
                }
                ci = ls.rt.code_instance(c).next;
            }
        } else {
            // leave the chain at its restricted world range
            let mut ci = ls.rt.method_instance(caller).cache;
            while let Some(c) = ci {
                ls.new_ci_validate.remove(&c);
                ci = ls.rt.code_instance(c).next;
            }
            ls.rt.invalidation_log.push((caller, "insert_backedges"));
            debug!(?caller, "caller invalidated by edge verification");
        }
    }
}

/// Instances never touched by edge processing have no cross-cache
/// dependencies; open them.
pub(crate) fn validate_new_code_instances(ls: &mut LoadSession) {
    let remaining: Vec<ValueId> = ls.new_ci_validate.drain().collect();
    for ci in remaining {
        ls.rt.code_instance_mut(ci).max_world = MAX_WORLD;
    }
}

// ── post-pipeline reinitialization ─────────────────────────────────

/// Replay one `(value, kind)` reinitialization item. Failures are
/// reported and swallowed; a broken reinit must not abort the load.
pub(crate) fn reinit_item(ls: &mut LoadSession, v: ValueId, how: i32) {
    match how {
        // identity dictionary: key identities changed under uniquing
        1 => {
            if let Value::IdDict(d) = ls.rt.get_mut(v) {
                let pairs = std::mem::take(&mut d.pairs);
                let mut rehashed: Vec<(ValueId, ValueId)> = Vec::with_capacity(pairs.len());
                for (k, val) in pairs {
                    if let Some(slot) = rehashed.iter_mut().find(|(rk, _)| *rk == k) {
                        slot.1 = val;
                    } else {
                        rehashed.push((k, val));
                    }
                }
                if let Value::IdDict(d) = ls.rt.get_mut(v) {
                    d.pairs = rehashed;
                }
            } else {
                warn!(?v, "reinit: expected an identity dictionary");
            }
        }
        // re-declare a restored module as a constant in its parent
        2 => {
            let Value::Module(m) = ls.rt.get(v) else {
                warn!(?v, "reinit: expected a module");
                return;
            };
            let (name, parent) = (m.name, m.parent.unwrap_or(v));
            if parent == v {
                return; // top-level modules are handled by the loader
            }
            let existing = ls.rt.get_global(parent, name);
            if let Some(existing) = existing {
                if !matches!(ls.rt.get(existing), Value::Module(_)) {
                    warn!(
                        module = ls.rt.symbol_name(name),
                        "reinit: invalid redefinition of constant"
                    );
                    return;
                }
                if existing != v {
                    warn!(module = ls.rt.symbol_name(name), "replacing module");
                }
            }
            ls.rt.set_global_const(parent, name, v);
        }
        // method table: entries may alias after uniquing
        3 => {
            if let Value::MethodTable(mt) = ls.rt.get_mut(v) {
                let mut seen = std::collections::HashSet::new();
                mt.entries.retain(|e| seen.insert(e.method));
            } else {
                warn!(?v, "reinit: expected a method table");
            }
        }
        _ => warn!(how, "reinit: unknown kind"),
    }
}
