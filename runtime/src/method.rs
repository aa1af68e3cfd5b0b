use crate::ValueId;

/// World age that never expires.
pub const MAX_WORLD: u64 = u64::MAX;

/// A polymorphic function definition: one signature, one body, attached to
/// a method table.
pub struct Method {
    /// Tuple type of (function type, argument types...).
    pub sig: ValueId,
    /// Defining module. A method is *internal* to a cache when its module
    /// is in the worklist, or when it belongs to an opaque closure.
    pub module: ValueId,
    /// Method table this method extends when it is not the one implied by
    /// the signature's primary type.
    pub external_mt: Option<ValueId>,
    /// Known specializations (method instances), in creation order.
    pub specializations: Vec<ValueId>,
    /// Symbol.
    pub name: ValueId,
    /// Source file symbol.
    pub file: ValueId,
    pub line: i32,
    pub called: i32,
    pub nargs: i32,
    pub nospecialize: i32,
    pub nkw: i32,
    pub isva: bool,
    pub pure: bool,
    pub is_for_opaque_closure: bool,
    pub constprop: u8,
    pub purity: u8,
    /// Compressed slot-name string.
    pub slot_syms: Option<ValueId>,
    /// Values the compressed body references, segmented by
    /// [`root_blocks`](Self::root_blocks).
    pub roots: Vec<ValueId>,
    /// Run-length table of root ownership: `[key, start_index, ...]` pairs.
    /// Roots before the first pair belong to key 0.
    pub root_blocks: Vec<u64>,
    /// Number of roots owned by the system image.
    pub nroots_sysimg: i32,
    /// Compressed source IR (opaque to the cache).
    pub source: Option<ValueId>,
    pub unspecialized: Option<ValueId>,
    pub generator: Option<ValueId>,
    pub invokes: Option<ValueId>,
    pub recursion_relation: Option<ValueId>,
    pub primary_world: u64,
    pub deleted_world: u64,
}

impl Method {
    /// Count roots owned by `key`.
    pub fn nroots_with_key(&self, key: u64) -> usize {
        self.iter_roots_with_key(key).count()
    }

    /// Indexes into [`roots`](Self::roots) owned by `key`.
    pub fn iter_roots_with_key(&self, key: u64) -> impl Iterator<Item = usize> + '_ {
        let nroots = self.roots.len();
        let blocks = &self.root_blocks;
        (0..nroots).filter(move |&i| root_key_at(blocks, i) == key)
    }

    /// Append `n` roots owned by `key`, recording the block boundary.
    pub fn append_roots_key(&mut self, key: u64, roots: impl IntoIterator<Item = ValueId>) {
        let start = self.roots.len() as u64;
        if key != root_key_at(&self.root_blocks, self.roots.len()) {
            self.root_blocks.push(key);
            self.root_blocks.push(start);
        }
        self.roots.extend(roots);
    }
}

fn root_key_at(blocks: &[u64], index: usize) -> u64 {
    let mut key = 0;
    for pair in blocks.chunks_exact(2) {
        if pair[1] as usize > index {
            break;
        }
        key = pair[0];
    }
    key
}

/// A method paired with concrete argument types: the unit of compilation.
pub struct MethodInstance {
    /// The defining [`Method`], or a module for top-level thunks.
    pub def: ValueId,
    /// Tuple type of the specialized argument types.
    pub spec_types: ValueId,
    /// Static-parameter values bound by the specialization.
    pub sparam_vals: Option<ValueId>,
    /// Unspecialized source for top-level thunks.
    pub uninferred: Option<ValueId>,
    /// Reverse dependency edges: instances that must be invalidated when
    /// this instance's method set changes.
    pub backedges: Vec<ValueId>,
    pub callbacks: Option<ValueId>,
    /// Head of the code-instance chain.
    pub cache: Option<ValueId>,
    pub precompiled: bool,
}

/// A compiled artifact for a method instance.
///
/// Valid for dispatch only in worlds within `[min_world, max_world]`.
/// Activation after a successful load raises `max_world` to [`MAX_WORLD`];
/// the transition is monotonic.
pub struct CodeInstance {
    /// Owning method instance.
    pub def: ValueId,
    /// Inferred IR blob, absent when the instance is closed-world.
    pub inferred: Option<ValueId>,
    pub rettype: ValueId,
    pub rettype_const: Option<ValueId>,
    pub argescapes: Option<ValueId>,
    pub min_world: u64,
    pub max_world: u64,
    pub ipo_purity_bits: u32,
    pub purity_bits: u32,
    pub const_return: bool,
    pub precompile: bool,
    /// Whether this instance may be moved between sessions at all.
    pub relocatability: u8,
    /// Alternative compilation, if any.
    pub next: Option<ValueId>,
}

/// One definition slot in a method table, with its validity window.
pub struct MethodTableEntry {
    pub method: ValueId,
    /// Pre-simplified signature used to seed dispatch, if any.
    pub simple_sig: Option<ValueId>,
    pub min_world: u64,
    pub max_world: u64,
}

impl MethodTableEntry {
    #[inline(always)]
    pub fn is_open(&self) -> bool {
        self.max_world == MAX_WORLD
    }
}

/// Dispatch table for one generic function (or one external extension
/// point).
pub struct MethodTable {
    /// Symbol.
    pub name: ValueId,
    pub module: ValueId,
    pub entries: Vec<MethodTableEntry>,
    /// Edges from unresolved callee signatures to caller instances,
    /// recorded when dispatch found no method.
    pub backedges: Vec<(ValueId, ValueId)>,
}
