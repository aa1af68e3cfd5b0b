//! Backreference tables for both directions of the codec.
//!
//! The i-th non-inline value written at save time must be the i-th entry
//! of the read-side list; both sides reserve entries at the same points of
//! the traversal, so the integer indexes mean the same thing in both
//! streams.

use std::collections::HashMap;

use runtime::ValueId;

/// Write side: object identity → encoded index.
///
/// The stored encoding is `(position << 1) | needs_uniquing`, which is also
/// exactly what goes on the wire for a backref hit, so the short/long
/// threshold applies to the shifted value.
pub struct WriteBackrefs {
    table: HashMap<ValueId, u32, ahash::RandomState>,
    count: u32,
}

impl WriteBackrefs {
    pub fn new() -> Self {
        Self {
            table: HashMap::default(),
            count: 0,
        }
    }

    /// Number of registered entries.
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded index of an already-registered value.
    pub fn lookup(&self, v: ValueId) -> Option<u32> {
        self.table.get(&v).copied()
    }

    /// Register a value at the next position; returns the position.
    /// The value must not be registered yet.
    pub fn insert(&mut self, v: ValueId) -> u32 {
        let pos = self.count;
        self.count += 1;
        let prev = self.table.insert(v, pos << 1);
        debug_assert!(prev.is_none(), "value registered twice");
        pos
    }

    /// Burn one position without a table entry. Used when the writer
    /// substitutes a synthesized value (a nulled pointer) whose payload the
    /// reader will still give a backref slot.
    pub fn skip_position(&mut self) {
        self.count += 1;
    }

    /// Set the needs-uniquing bit on an already-registered value.
    pub fn mark_flagged(&mut self, v: ValueId) {
        let slot = self
            .table
            .get_mut(&v)
            .expect("flagging an unregistered value");
        *slot |= 1;
    }
}

impl Default for WriteBackrefs {
    fn default() -> Self {
        Self::new()
    }
}

/// One recorded location that may need rewriting after uniquing.
///
/// `owner` is the cell whose reference slots held the flagged value (absent
/// when the reader had nowhere to store it). `index` is the backref-list
/// position of the flagged entry itself, or -1 for a later sighting that
/// simply follows the primary entry's rewrite.
#[derive(Debug, Clone, Copy)]
pub struct FlagRef {
    pub owner: Option<ValueId>,
    pub index: i64,
}

/// Read side: position-addressed list of reconstructed values.
///
/// Slot k is reserved before the object's subvalues are deserialized, so a
/// cycle back to position k resolves to the enclosing parent.
pub struct ReadBackrefs {
    list: Vec<Option<ValueId>>,
}

impl ReadBackrefs {
    pub fn new() -> Self {
        Self {
            list: Vec::with_capacity(256),
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Reserve the next slot and return its position.
    pub fn reserve(&mut self) -> usize {
        self.list.push(None);
        self.list.len() - 1
    }

    /// Append a finished value.
    pub fn push(&mut self, id: ValueId) -> usize {
        self.list.push(Some(id));
        self.list.len() - 1
    }

    pub fn set(&mut self, pos: usize, id: ValueId) {
        self.list[pos] = Some(id);
    }

    pub fn get(&self, pos: usize) -> Option<ValueId> {
        self.list.get(pos).copied().flatten()
    }
}

impl Default for ReadBackrefs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_ids() -> (ValueId, ValueId) {
        let mut rt = runtime::bootstrap();
        (rt.intern("first"), rt.intern("second"))
    }

    #[test]
    fn positions_are_monotonic_and_shifted() {
        let (a, b) = two_ids();
        let mut t = WriteBackrefs::new();
        assert_eq!(t.insert(a), 0);
        assert_eq!(t.insert(b), 1);
        assert_eq!(t.lookup(a), Some(0));
        assert_eq!(t.lookup(b), Some(2));
        t.mark_flagged(a);
        assert_eq!(t.lookup(a), Some(1));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn read_list_reserves_before_filling() {
        let (a, b) = two_ids();
        let mut l = ReadBackrefs::new();
        let pos = l.reserve();
        assert_eq!(l.get(pos), None);
        l.set(pos, a);
        assert_eq!(l.get(pos), Some(a));
        assert_eq!(l.push(b), 1);
    }
}
