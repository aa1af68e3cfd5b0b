use std::collections::HashMap;

use parking_lot::RwLock;

use crate::ValueId;

/// Name → symbol-cell mapping.
///
/// Symbols are interned: one arena cell per distinct name, so symbol
/// identity is id equality. The table itself only maps names to ids; the
/// cells live in the runtime arena.
pub struct SymbolTable {
    mappings: RwLock<HashMap<String, ValueId, ahash::RandomState>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            mappings: RwLock::new(HashMap::default()),
        }
    }

    /// Look up an already-interned name.
    pub fn lookup(&self, name: &str) -> Option<ValueId> {
        self.mappings.read().get(name).copied()
    }

    /// Record a freshly allocated symbol cell. The caller guarantees no
    /// cell exists for `name` yet.
    pub(crate) fn insert(&self, name: &str, id: ValueId) {
        let prev = self.mappings.write().insert(name.to_owned(), id);
        debug_assert!(prev.is_none(), "symbol {name:?} interned twice");
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
