//! Edge collection at save time.
//!
//! The runtime's backedge graph points callee → caller. For invalidation
//! checking at load time we need the other direction, restricted to edges
//! that cross the internal/external boundary, together with the set of
//! methods each external callee's signature resolves to right now.

use std::collections::{HashMap, HashSet};

use runtime::{Value, ValueId};
use tracing::debug;

use crate::ser::SaveSession;

/// Worklist-owned methods extending functions that live outside the
/// worklist, flattened as `[method, simple_sig, ...]` pairs. External
/// methods' specializations contribute their backedges to the session's
/// edge map as a side effect.
pub(crate) fn collect_extext_methods(ss: &mut SaveSession) -> Vec<Option<ValueId>> {
    let mut extext: Vec<Option<ValueId>> = Vec::new();
    let roots: Vec<ValueId> = ss
        .rt
        .loaded_modules
        .iter()
        .copied()
        .filter(|&m| {
            let module = ss.rt.module(m);
            module.parent == Some(m)
        })
        .collect();
    for m in roots {
        collect_from_module(ss, &mut extext, m);
    }
    extext
}

fn collect_from_module(ss: &mut SaveSession, extext: &mut Vec<Option<ValueId>>, m: ValueId) {
    if ss.module_in_worklist(m) {
        return;
    }
    let bindings: Vec<(ValueId, Option<ValueId>, Option<ValueId>, bool)> = ss
        .rt
        .module(m)
        .bindings
        .iter()
        .map(|(sym, b)| (*sym, b.value, b.owner, b.is_const()))
        .collect();
    for (bname, value, owner, constp) in bindings {
        if owner != Some(m) || !constp {
            continue;
        }
        let Some(value) = value else { continue };
        let unwrapped = runtime::dispatch::unwrap_unionall(ss.rt, value);
        match ss.rt.get(unwrapped) {
            Value::DataType(dt) => {
                let Some(tn) = dt.name else { continue };
                let tn_ref = ss.rt.typename(tn);
                if tn_ref.module == m && tn_ref.name == bname && tn_ref.wrapper == value {
                    if let Some(mt) = tn_ref.method_table {
                        collect_from_method_table(ss, extext, mt);
                        collect_missing_backedges(ss, mt);
                    }
                }
            }
            Value::Module(child) => {
                let child_name = child.name;
                let child_parent = child.parent;
                if unwrapped != m && child_parent == Some(m) && child_name == bname {
                    collect_from_module(ss, extext, unwrapped);
                }
            }
            Value::MethodTable(mt) => {
                if mt.module == m && mt.name == bname {
                    // an explicitly bound external extension table
                    collect_from_method_table(ss, extext, unwrapped);
                    collect_missing_backedges(ss, unwrapped);
                }
            }
            _ => {}
        }
    }
}

/// Worklist-owned methods in this table are recorded for installation at
/// load time; external methods donate their specializations' backedges.
fn collect_from_method_table(
    ss: &mut SaveSession,
    extext: &mut Vec<Option<ValueId>>,
    mt: ValueId,
) {
    let entries: Vec<(ValueId, Option<ValueId>)> = ss
        .rt
        .method_table(mt)
        .entries
        .iter()
        .map(|e| (e.method, e.simple_sig))
        .collect();
    for (method, simple_sig) in entries {
        let module = ss.rt.method(method).module;
        if ss.module_in_worklist(module) {
            extext.push(Some(method));
            extext.push(simple_sig);
        } else {
            let specs = ss.rt.method(method).specializations.clone();
            for callee in specs {
                if !ss.method_instance_in_queue(callee) {
                    collect_backedges(ss, callee);
                }
            }
        }
    }
}

/// Invert one callee's backedges into the caller → callee scratch map.
fn collect_backedges(ss: &mut SaveSession, callee: ValueId) {
    let backedges = ss.rt.method_instance(callee).backedges.clone();
    for caller in backedges {
        ss.edges_map.entry(caller).or_default().push(callee);
    }
}

/// Dispatch misses recorded on the table tie a callee *signature* back to
/// callers; those cross the boundary the same way.
fn collect_missing_backedges(ss: &mut SaveSession, mt: ValueId) {
    let backedges = ss.rt.method_table(mt).backedges.clone();
    for (missing_callee, caller) in backedges {
        ss.edges_map.entry(caller).or_default().push(missing_callee);
    }
}

/// Flatten everything reachable from `caller` in the edge map into the
/// callee set, consuming map entries as they are visited. Explicitly
/// stack-driven so a pathological backedge graph cannot exhaust the call
/// stack.
fn collect_callees_to(
    ss: &mut SaveSession,
    caller: ValueId,
    out: &mut Vec<ValueId>,
    seen: &mut HashSet<ValueId>,
) {
    let mut stack = vec![caller];
    while let Some(cur) = stack.pop() {
        let Some(callees) = ss.edges_map.remove(&cur) else { continue };
        for c in callees {
            if seen.insert(c) {
                out.push(c);
            }
            if matches!(ss.rt.get(c), Value::MethodInstance(_)) {
                stack.push(c);
            }
        }
    }
}

/// Extract the two flattened output arrays from the scratch edge map:
/// `edges = [caller, callee-index-array, ...]` and
/// `ext_targets = [callee, matching-methods, ...]`.
///
/// A caller group whose any signature currently matches no methods is
/// dropped whole: a negative intersection cannot be re-verified soundly.
pub(crate) fn collect_edges(ss: &mut SaveSession) -> (ValueId, ValueId) {
    let world = ss.rt.current_world();
    let mut callers: Vec<ValueId> = ss.edges_map.keys().copied().collect();
    callers.sort();

    let mut edges_out: Vec<Option<ValueId>> = Vec::new();
    let mut targets_out: Vec<Option<ValueId>> = Vec::new();
    // callee → index into targets_out pairs
    let mut target_index: HashMap<ValueId, i32, ahash::RandomState> = HashMap::default();

    for caller in callers {
        if !ss.edges_map.contains_key(&caller) {
            continue; // consumed by an earlier transitive closure
        }
        let caller_is_tracked = match ss.rt.get(caller) {
            Value::MethodInstance(mi) => match ss.rt.get(mi.def) {
                Value::Method(m) => {
                    ss.module_in_worklist(m.module) || ss.method_instance_in_queue(caller)
                }
                _ => false,
            },
            _ => false,
        };
        if !caller_is_tracked {
            continue;
        }

        let mut all_callees = Vec::new();
        let mut seen = HashSet::new();
        collect_callees_to(ss, caller, &mut all_callees, &mut seen);

        let mut idxs: Vec<i32> = Vec::with_capacity(all_callees.len());
        let mut valid = true;
        for callee in all_callees {
            if let Some(&idx) = target_index.get(&callee) {
                idxs.push(idx);
                continue;
            }
            let sig = match ss.rt.get(callee) {
                Value::MethodInstance(mi) => mi.spec_types,
                _ => callee,
            };
            let matches = ss.rt.matching_methods(sig, world);
            let methods = match matches {
                Some(methods) if !methods.is_empty() => methods,
                // nothing matches now; recording that would pin a negative
                _ => {
                    valid = false;
                    break;
                }
            };
            let matches_sv = ss.rt.alloc_svec_ids(&methods);
            let idx = (targets_out.len() / 2) as i32;
            targets_out.push(Some(callee));
            targets_out.push(Some(matches_sv));
            target_index.insert(callee, idx);
            idxs.push(idx);
        }
        if valid {
            let idx_array = ss.rt.alloc_i32_array(&idxs);
            edges_out.push(Some(caller));
            edges_out.push(Some(idx_array));
        } else {
            debug!(?caller, "dropping edge group with unmatchable callee");
        }
    }

    let edges = ss.rt.alloc_svec(edges_out);
    let ext_targets = ss.rt.alloc_svec(targets_out);
    (edges, ext_targets)
}
